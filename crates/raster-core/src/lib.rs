//! # Demand-Driven Raster Runtime Core
//!
//! This crate is the single entry point for the lazy, demand-driven
//! pixel pipeline: images describe how to compute their pixels, and
//! nothing actually runs until a consumer asks a [`Region`] to
//! `prepare` a rectangle.
//!
//! ## Key Capabilities
//!
//! - **Lazy evaluation**: an [`Image`] is a recipe, not a buffer; pixels
//!   only materialise when a region demands them.
//! - **Three-way pixel caching**: a per-thread reserve of recently used
//!   buffers ([`raster_buffer`]), a process-wide mapped-window pool for
//!   file-backed images ([`raster_window`]), and a process-wide
//!   memoizing cache over whole operation results ([`raster_opcache`]).
//! - **Thread-confined regions**: a [`Region`] may only be touched by
//!   the thread that owns it, enforced with a debug-only check; use
//!   [`Region::take_ownership`]/[`Region::no_ownership`] to hand one to
//!   a worker thread.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Consumers                               │
//! │        (tile renderers, operation graphs, format writers)        │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       raster-region                              │
//! │   Region::prepare/fetch/fill — the demand-driven entry point      │
//! └───────────┬───────────────────┬───────────────────┬─────────────┘
//!             ▼                   ▼                   ▼
//! ┌──────────────────┐ ┌────────────────────┐ ┌──────────────────────┐
//! │  raster-buffer     │ │  raster-window      │ │  raster-opcache       │
//! │  per-thread reuse  │ │  per-image mmap     │ │  process-wide memo    │
//! │  of pixel storage  │ │  pool for files     │ │  of operation results │
//! └──────────────────┘ └────────────────────┘ └──────────────────────┘
//!             │                   │                   │
//!             └───────────────────┴───────────────────┘
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       raster-common                              │
//! │        Rect algebra, Image/PixelSink traits, RasterError          │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use raster_core::{Image, Rect, Region};
//! use std::sync::Arc;
//!
//! let image: Arc<dyn Image> = my_image();
//! let region = Region::new(image);
//! region.prepare(Rect::new(0, 0, 256, 256))?;
//! let pixels = region.fetch(0, 0, 256, 256)?;
//! ```

pub use raster_buffer::{
    buffer_done, buffer_new, buffer_ref_existing, buffer_undone, buffer_unref,
    buffer_unref_then_ref, cache_stats as buffer_cache_stats, cache_thread_matches, Buffer,
    CacheStats as BufferCacheStats, RESERVE_MAX,
};
pub use raster_common::{
    clip_to_bounds, CacheBounds, FileSource, Image, ImageBacking, ImageId, PixelSink,
    RasterError, RasterResult, Rect, RequestStyle, Sequence,
};
pub use raster_opcache::{
    build_or_reuse, build_or_reuse_keeping_ref, cache_get_size, cache_invalidate, cache_print,
    cache_set_dump, cache_set_max, cache_set_max_files, cache_set_max_mem, cache_set_trace,
    cache_snapshot, drop_all, ArgValue, Argument, CacheSnapshot, HandlerId, InvalidateSignal,
    Operation, OperationFlags,
};
pub use raster_region::{prepare_many, Region};
pub use raster_window::{registry as window_registry, Window, WindowPool};

#[cfg(test)]
mod tests {
    use super::*;
    use raster_common::testutil::CountingImage;
    use std::sync::Arc;

    #[test]
    fn prepare_then_fetch_round_trip() {
        let image = Arc::new(CountingImage::new(32, 32, 11));
        let region = Region::new(Arc::clone(&image) as Arc<dyn Image>);
        region.prepare(Rect::new(0, 0, 16, 16)).unwrap();
        let pixels = region.fetch(0, 0, 16, 16).unwrap();
        assert!(pixels.iter().all(|&b| b == 11));
        assert_eq!(image.generate_count(), 1);
    }
}
