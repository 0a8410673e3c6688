//! Process-wide operation memoization.
//!
//! Keeps at most one live result per distinct (operation name, hashable
//! input arguments) key, trimmed against entry-count, memory and
//! open-file bounds. Complements the per-thread buffer cache in
//! `raster-buffer`: that crate memoizes pixel data within a region's
//! own thread, this one memoizes whole operation results across the
//! process.

pub mod cache;
pub mod operation;

pub use cache::{
    build_or_reuse, build_or_reuse_keeping_ref, cache_get_size, cache_invalidate, cache_print,
    cache_set_dump, cache_set_max, cache_set_max_files, cache_set_max_mem, cache_set_trace,
    cache_snapshot, drop_all, CacheSnapshot,
};
pub use operation::{ArgValue, Argument, HandlerId, InvalidateSignal, Operation, OperationFlags};
