//! Process-wide operation memoization cache.
//!
//! One global table, keyed by operation name plus its hashable input
//! arguments. Mirrors the hit/miss/eviction counter style used by the
//! storage-layer grid cache elsewhere in the workspace, but keyed on
//! argument equality instead of a string path, and trimmed against
//! three independent bounds (entry count, memory, open files) rather
//! than a single LRU capacity.

use crate::operation::{ArgValue, HandlerId, Operation, OperationFlags};
use raster_common::{CacheBounds, Image, ImageId, RasterError, RasterResult};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, OnceLock};

#[derive(Clone, PartialEq, Eq, Hash)]
struct OpKey {
    name: &'static str,
    args: Vec<(&'static str, ArgValue)>,
}

fn key_for(op: &dyn Operation) -> OpKey {
    let mut args: Vec<_> = op
        .arguments()
        .iter()
        .filter(|a| a.input && a.hashable)
        .map(|a| (a.name, a.value.clone()))
        .collect();
    args.sort_by_key(|(name, _)| *name);
    OpKey {
        name: op.name(),
        args,
    }
}

fn upstream_images(op: &dyn Operation) -> Vec<ImageId> {
    op.arguments()
        .iter()
        .filter(|a| a.input)
        .filter_map(|a| match a.value {
            ArgValue::Image(id) => Some(id),
            _ => None,
        })
        .collect()
}

/// One memoized build. Holds a strong ref on both the operation that
/// produced it (so its `disconnect` can still be called at eviction)
/// and its result image. `ref_count` is not tracked separately: a
/// caller "holds a ref" for exactly as long as it holds the `Arc<dyn
/// Image>` we handed back, so eviction eligibility is read straight off
/// `Arc::strong_count` — the cache's own clone is always the +1 floor.
struct Entry {
    key: OpKey,
    operation: Arc<dyn Operation>,
    result: Arc<dyn Image>,
    cache_time: u64,
    size_bytes: u64,
    depends_on: Vec<ImageId>,
    handler_id: HandlerId,
    invalid: bool,
}

impl Entry {
    /// True once nobody outside the cache still holds this entry's
    /// result image — the only state `trim` is allowed to evict.
    fn is_unreferenced(&self) -> bool {
        Arc::strong_count(&self.result) <= 1
    }
}

struct CacheState {
    entries: HashMap<OpKey, Entry>,
    by_result_id: HashMap<ImageId, OpKey>,
    bounds: CacheBounds,
    clock: u64,
    trace: bool,
    dump: bool,
}

impl CacheState {
    fn new() -> Self {
        let bounds = CacheBounds::from_env();
        let trace = bounds.trace;
        Self {
            entries: HashMap::new(),
            by_result_id: HashMap::new(),
            bounds,
            clock: 0,
            trace,
            dump: false,
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Bumps `key`'s recency, then transitively bumps the entries that
    /// produced its upstream input images — "any ref of an output image
    /// transitively touches the entries that produced that image's
    /// upstream images", so a pipeline stays hot even when only its
    /// terminal node is referenced directly. Invalid entries are never
    /// re-touched: they keep drifting towards eviction regardless of
    /// who reads through them.
    fn touch_chain(&mut self, key: &OpKey) {
        let mut worklist = vec![key.clone()];
        let mut seen = HashSet::new();
        while let Some(k) = worklist.pop() {
            if !seen.insert(k.clone()) {
                continue;
            }
            let Some(entry) = self.entries.get(&k) else { continue };
            if entry.invalid {
                continue;
            }
            let time = self.tick();
            let deps = {
                let entry = self.entries.get_mut(&k).expect("checked above");
                entry.cache_time = time;
                entry.depends_on.clone()
            };
            for dep in deps {
                if let Some(dep_key) = self.by_result_id.get(&dep).cloned() {
                    worklist.push(dep_key);
                }
            }
        }
    }

    fn evict(&mut self, key: &OpKey) -> Option<Entry> {
        let entry = self.entries.remove(key)?;
        self.by_result_id.remove(&entry.result.id());
        entry.operation.disconnect(entry.handler_id);
        if self.dump {
            tracing::info!(operation = entry.key.name, "evicted from operation cache");
        }
        Some(entry)
    }
}

static CACHE: OnceLock<Mutex<CacheState>> = OnceLock::new();

fn cache() -> &'static Mutex<CacheState> {
    CACHE.get_or_init(|| Mutex::new(CacheState::new()))
}

fn estimate_size(image: &dyn Image) -> u64 {
    image.width() as u64 * image.height() as u64 * image.bands() as u64 * image.element_size() as u64
}

/// Snapshot of process-wide cache occupancy, for tests and diagnostics.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheSnapshot {
    pub entries: usize,
    pub total_mem_bytes: u64,
    pub total_files: usize,
}

pub fn cache_snapshot() -> CacheSnapshot {
    let state = cache().lock().expect("operation cache poisoned");
    CacheSnapshot {
        entries: state.entries.len(),
        total_mem_bytes: state.entries.values().map(|e| e.size_bytes).sum(),
        total_files: state.entries.values().filter(|e| e.result.is_file_backed()).count(),
    }
}

/// Builds (or reuses a cached build of) `op`'s result.
///
/// Four-step contract: consult the cache under lock; on a plain hit,
/// bump recency and return the shared result, dropping `op` (the
/// caller's own operation is discarded in favour of the cached one);
/// on a miss — which includes a hit whose entry is `invalid`, or one
/// carrying `REVALIDATE`/`BLOCKED` — build outside the lock; then
/// re-acquire the lock to either insert the fresh result or, if another
/// thread finished building the same key first, discard ours and adopt
/// theirs (first completed build wins the race).
pub fn build_or_reuse(op: Arc<dyn Operation>) -> RasterResult<Arc<dyn Image>> {
    if op.flags().contains(OperationFlags::NOCACHE) {
        return op.build();
    }

    let key = key_for(op.as_ref());

    if let Some(result) = try_reuse(&key, op.as_ref())? {
        return Ok(result);
    }

    let built = op.build()?;

    // Hash contract: the key is frozen the moment an operation is
    // declared fully constructed, so the key we looked up under must
    // still match after `build` runs. A mismatch means some input
    // argument changed mid-build — a bug in the `Operation` impl, not
    // in the cache. Debug-only per spec.md §7; release builds trust the
    // pre-build key and surface the same condition as a `BuildError` if
    // it ever occurs (see `RasterError::hash_contract_violation`).
    if cfg!(debug_assertions) {
        let post_build_key = key_for(op.as_ref());
        if post_build_key != key {
            return Err(RasterError::hash_contract_violation(format!(
                "operation '{}' changed its hashable arguments between lookup and build",
                op.name()
            )));
        }
    }

    Ok(insert_or_reuse(key, op, built))
}

/// Like `build_or_reuse`, but first releases `old_result` — a
/// previously returned build of the same or a related operation — by
/// dropping the caller's clone before doing the lookup, so there is
/// never a moment where the caller appears to hold a ref on both the
/// stale and the fresh result at once. This mirrors the
/// ref-count-preserving wrapper the original binding layer exposes
/// alongside its primary entry point.
pub fn build_or_reuse_keeping_ref(old_result: Arc<dyn Image>, op: Arc<dyn Operation>) -> RasterResult<Arc<dyn Image>> {
    drop(old_result);
    build_or_reuse(op)
}

fn try_reuse(key: &OpKey, op: &dyn Operation) -> RasterResult<Option<Arc<dyn Image>>> {
    let mut state = cache().lock().expect("operation cache poisoned");

    // BLOCKED is categorical, not hit-only: never build, whether or not
    // a prior entry exists. Evict one if present, but the error fires
    // either way.
    if op.flags().contains(OperationFlags::BLOCKED) {
        state.evict(key);
        return Err(RasterError::BuildError(format!(
            "operation '{}' is blocked and must not be built",
            op.name()
        )));
    }

    if !state.entries.contains_key(key) {
        return Ok(None);
    }

    if op.flags().contains(OperationFlags::REVALIDATE) {
        state.evict(key);
        return Ok(None);
    }

    if state.entries.get(key).expect("checked contains_key above").invalid {
        // Stale: bypass without touching recency, so it keeps drifting
        // towards eviction. The rebuild that follows will overwrite it.
        return Ok(None);
    }

    state.touch_chain(key);
    let trace = state.trace;
    let result = Arc::clone(&state.entries.get(key).expect("checked contains_key above").result);
    if trace {
        tracing::debug!(operation = op.name(), "operation cache hit");
    }
    Ok(Some(result))
}

fn insert_or_reuse(key: OpKey, op: Arc<dyn Operation>, built: Arc<dyn Image>) -> Arc<dyn Image> {
    let mut state = cache().lock().expect("operation cache poisoned");

    if let Some(existing) = state.entries.get(&key) {
        if !existing.invalid {
            // Genuine race: another thread's build of an equal operation
            // landed first. Let theirs win; ours (and `built`) are
            // simply dropped when this function returns.
            state.touch_chain(&key);
            return Arc::clone(&state.entries.get(&key).expect("checked above").result);
        }
        // Our own stale entry for this key: disconnect its handler and
        // overwrite it below with the fresh build.
        state.evict(&key);
    }

    let depends_on = upstream_images(op.as_ref());
    let time = state.tick();
    let size_bytes = estimate_size(built.as_ref());
    state.by_result_id.insert(built.id(), key.clone());

    let key_for_handler = key.clone();
    let handler_id = op.on_invalidate(Box::new(move || {
        let mut state = cache().lock().expect("operation cache poisoned");
        if let Some(entry) = state.entries.get_mut(&key_for_handler) {
            entry.invalid = true;
        }
    }));

    let trace = state.trace;
    state.entries.insert(
        key.clone(),
        Entry {
            key,
            operation: op,
            result: Arc::clone(&built),
            cache_time: time,
            size_bytes,
            depends_on,
            handler_id,
            invalid: false,
        },
    );
    if trace {
        tracing::debug!("operation cache miss: built and stored");
    }
    trim_locked(&mut state);
    built
}

fn trim_locked(state: &mut CacheState) {
    loop {
        let over_entries = state.entries.len() > state.bounds.max_entries;
        let total_mem: u64 = state.entries.values().map(|e| e.size_bytes).sum();
        let over_mem = total_mem > state.bounds.max_mem_bytes;
        let total_files = state.entries.values().filter(|e| e.result.is_file_backed()).count();
        let over_files = total_files > state.bounds.max_files;
        if !(over_entries || over_mem || over_files) {
            return;
        }

        // Invalid entries are never re-touched, so among unreferenced
        // entries they already sit at the bottom of the recency order;
        // a plain min-by-time search finds them first without needing
        // a separate invalid-first pass.
        let victim = state
            .entries
            .values()
            .filter(|e| e.is_unreferenced())
            .min_by_key(|e| e.cache_time)
            .map(|e| e.key.clone());

        let Some(victim) = victim else {
            // Every remaining entry is still referenced; nothing more
            // can be trimmed right now.
            return;
        };

        state.evict(&victim);
    }
}

/// Marks stale every cache entry whose result is `image_id`, and every
/// entry that transitively depends on it as an input — the function
/// the owning pipeline calls when it mutates an image in place (the
/// Rust rendering of the original's `vips__cache_invalidate`, wired
/// here as an explicit call rather than a GSignal handler since this
/// crate has no signal bus of its own; `Operation::on_invalidate`
/// remains the seam for operations with a real upstream signal to
/// watch). Invalidated entries stay in the table — lazily bypassed on
/// lookup, then overwritten or evicted — rather than being removed
/// immediately.
pub fn cache_invalidate(image_id: ImageId) {
    let mut state = cache().lock().expect("operation cache poisoned");
    let mut worklist = vec![image_id];
    let mut seen = HashSet::new();

    while let Some(id) = worklist.pop() {
        if !seen.insert(id) {
            continue;
        }
        if let Some(key) = state.by_result_id.get(&id).cloned() {
            if let Some(entry) = state.entries.get_mut(&key) {
                entry.invalid = true;
            }
        }
        let dependents: Vec<ImageId> = state
            .entries
            .values()
            .filter(|e| e.depends_on.contains(&id))
            .map(|e| e.result.id())
            .collect();
        worklist.extend(dependents);
    }
}

pub fn cache_set_max(max_entries: usize) {
    let mut state = cache().lock().expect("operation cache poisoned");
    state.bounds.max_entries = max_entries;
    trim_locked(&mut state);
}

/// Sets the memory bound and trims synchronously before returning —
/// resolves the open question of whether lowering the bound should
/// trim immediately or lazily in favour of an immediate, predictable
/// trim.
pub fn cache_set_max_mem(max_mem_bytes: u64) {
    let mut state = cache().lock().expect("operation cache poisoned");
    state.bounds.max_mem_bytes = max_mem_bytes;
    trim_locked(&mut state);
}

pub fn cache_set_max_files(max_files: usize) {
    let mut state = cache().lock().expect("operation cache poisoned");
    state.bounds.max_files = max_files;
    trim_locked(&mut state);
}

pub fn cache_set_trace(trace: bool) {
    cache().lock().expect("operation cache poisoned").trace = trace;
}

/// When set, every eviction logs the evicted operation's name at info
/// level (in addition to the debug-level trace logging `cache_set_trace`
/// controls).
pub fn cache_set_dump(dump: bool) {
    cache().lock().expect("operation cache poisoned").dump = dump;
}

pub fn cache_get_size() -> usize {
    cache().lock().expect("operation cache poisoned").entries.len()
}

pub fn cache_print() {
    let state = cache().lock().expect("operation cache poisoned");
    for entry in state.entries.values() {
        tracing::info!(
            operation = entry.key.name,
            cache_time = entry.cache_time,
            invalid = entry.invalid,
            size_bytes = entry.size_bytes,
            "cached operation"
        );
    }
}

/// Drops every cached entry unconditionally, ignoring outstanding refs
/// on their result images.
pub fn drop_all() {
    let mut state = cache().lock().expect("operation cache poisoned");
    for entry in state.entries.values() {
        entry.operation.disconnect(entry.handler_id);
    }
    state.entries.clear();
    state.by_result_id.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{ArgValue, Argument, InvalidateSignal};
    use raster_common::testutil::CountingImage;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Barrier;

    struct StubOp {
        seed: i64,
        flags: OperationFlags,
        builds: Arc<AtomicU64>,
        signal: InvalidateSignal,
    }

    impl StubOp {
        fn new(seed: i64, flags: OperationFlags, builds: &Arc<AtomicU64>) -> Self {
            Self {
                seed,
                flags,
                builds: Arc::clone(builds),
                signal: InvalidateSignal::new(),
            }
        }
    }

    impl Operation for StubOp {
        fn name(&self) -> &'static str {
            "stub"
        }

        fn arguments(&self) -> &[Argument] {
            // Argument lifetime sidestep: store and leak once per test
            // call via Box::leak, acceptable for this stub's lifetime.
            Box::leak(vec![Argument::required_input("seed", ArgValue::Int(self.seed))].into_boxed_slice())
        }

        fn flags(&self) -> OperationFlags {
            self.flags
        }

        fn build(&self) -> RasterResult<Arc<dyn Image>> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(CountingImage::new(4, 4, self.seed as u8)))
        }

        fn on_invalidate(&self, handler: Box<dyn Fn() + Send + Sync>) -> HandlerId {
            self.signal.connect(handler)
        }

        fn disconnect(&self, id: HandlerId) {
            self.signal.disconnect(id)
        }
    }

    #[test]
    fn identical_arguments_hit_the_cache() {
        drop_all();
        let builds = Arc::new(AtomicU64::new(0));
        let op: Arc<dyn Operation> = Arc::new(StubOp::new(101, OperationFlags::empty(), &builds));

        let first = build_or_reuse(Arc::clone(&op)).unwrap();
        let second = build_or_reuse(Arc::clone(&op)).unwrap();

        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(first.id(), second.id());
        drop_all();
    }

    #[test]
    fn different_arguments_miss() {
        drop_all();
        let builds = Arc::new(AtomicU64::new(0));
        let op_a: Arc<dyn Operation> = Arc::new(StubOp::new(201, OperationFlags::empty(), &builds));
        let op_b: Arc<dyn Operation> = Arc::new(StubOp::new(202, OperationFlags::empty(), &builds));

        build_or_reuse(op_a).unwrap();
        build_or_reuse(op_b).unwrap();

        assert_eq!(builds.load(Ordering::SeqCst), 2);
        drop_all();
    }

    #[test]
    fn nocache_always_rebuilds() {
        drop_all();
        let builds = Arc::new(AtomicU64::new(0));
        let op: Arc<dyn Operation> = Arc::new(StubOp::new(301, OperationFlags::NOCACHE, &builds));

        build_or_reuse(Arc::clone(&op)).unwrap();
        build_or_reuse(op).unwrap();

        assert_eq!(builds.load(Ordering::SeqCst), 2);
        assert_eq!(cache_get_size(), 0);
        drop_all();
    }

    #[test]
    fn blocked_hit_evicts_and_errors() {
        drop_all();
        let builds = Arc::new(AtomicU64::new(0));
        let warm: Arc<dyn Operation> = Arc::new(StubOp::new(401, OperationFlags::empty(), &builds));
        build_or_reuse(warm).unwrap();
        assert_eq!(cache_get_size(), 1);

        let blocked: Arc<dyn Operation> = Arc::new(StubOp::new(401, OperationFlags::BLOCKED, &builds));
        let result = build_or_reuse(blocked);
        assert!(result.is_err());
        assert_eq!(cache_get_size(), 0);
        drop_all();
    }

    #[test]
    fn blocked_with_no_prior_entry_still_errors_without_building() {
        drop_all();
        let builds = Arc::new(AtomicU64::new(0));
        let blocked: Arc<dyn Operation> = Arc::new(StubOp::new(402, OperationFlags::BLOCKED, &builds));

        let result = build_or_reuse(blocked);

        assert!(result.is_err(), "a BLOCKED operation must never build, even with nothing cached yet");
        assert_eq!(builds.load(Ordering::SeqCst), 0);
        assert_eq!(cache_get_size(), 0);
        drop_all();
    }

    #[test]
    fn revalidate_forces_rebuild() {
        drop_all();
        let builds = Arc::new(AtomicU64::new(0));
        let warm: Arc<dyn Operation> = Arc::new(StubOp::new(501, OperationFlags::empty(), &builds));
        build_or_reuse(warm).unwrap();

        let revalidate: Arc<dyn Operation> = Arc::new(StubOp::new(501, OperationFlags::REVALIDATE, &builds));
        build_or_reuse(revalidate).unwrap();

        assert_eq!(builds.load(Ordering::SeqCst), 2);
        assert_eq!(cache_get_size(), 1);
        drop_all();
    }

    #[test]
    fn zero_max_entries_rebuilds_every_call_and_never_grows() {
        drop_all();
        cache_set_max(0);
        let builds = Arc::new(AtomicU64::new(0));

        for _ in 0..3 {
            let op: Arc<dyn Operation> = Arc::new(StubOp::new(550, OperationFlags::empty(), &builds));
            let result = build_or_reuse(op).unwrap();
            drop(result);
            // Re-asserting the bound forces a trim pass now that the
            // just-built entry is unreferenced, so the next iteration's
            // lookup finds nothing to hit.
            cache_set_max(0);
            assert_eq!(cache_get_size(), 0, "max_entries=0 never leaves a reusable entry behind");
        }

        assert_eq!(builds.load(Ordering::SeqCst), 3, "every call must rebuild with no room to cache a hit");
        cache_set_max(100);
        drop_all();
    }

    #[test]
    fn trim_evicts_least_recently_used_once_callers_drop_their_refs() {
        drop_all();
        cache_set_max(3);
        let builds = Arc::new(AtomicU64::new(0));

        let mut results = Vec::new();
        for seed in 600..604 {
            let op: Arc<dyn Operation> = Arc::new(StubOp::new(seed, OperationFlags::empty(), &builds));
            results.push(build_or_reuse(op).unwrap());
        }
        // While callers hold every result, strong_count > 1 on each
        // entry protects all four from eviction even over the bound.
        assert_eq!(cache_get_size(), 4);

        // Once the callers drop their refs, a bound-triggered trim (the
        // next insert, here) can actually reclaim the least-recently
        // touched entry.
        drop(results);
        let op_d: Arc<dyn Operation> = Arc::new(StubOp::new(699, OperationFlags::empty(), &builds));
        build_or_reuse(op_d).unwrap();

        assert_eq!(cache_get_size(), 3);
        cache_set_max(100);
        drop_all();
    }

    #[test]
    fn invalidate_marks_stale_without_removing_until_overwritten() {
        drop_all();
        let builds = Arc::new(AtomicU64::new(0));
        let op: Arc<dyn Operation> = Arc::new(StubOp::new(701, OperationFlags::empty(), &builds));
        let first = build_or_reuse(Arc::clone(&op)).unwrap();
        let first_id = first.id();
        drop(first);

        cache_invalidate(first_id);
        assert_eq!(cache_get_size(), 1, "invalidation alone does not remove the entry");

        let rebuilt = build_or_reuse(op).unwrap();
        assert_eq!(builds.load(Ordering::SeqCst), 2, "an invalid hit must rebuild");
        assert_eq!(cache_get_size(), 1, "the stale entry is overwritten in place, not duplicated");
        assert_ne!(rebuilt.id(), first_id);
        drop_all();
    }

    #[test]
    fn invalidate_propagates_to_dependents() {
        drop_all();
        let builds = Arc::new(AtomicU64::new(0));
        let base: Arc<dyn Operation> = Arc::new(StubOp::new(801, OperationFlags::empty(), &builds));
        let base_result = build_or_reuse(base).unwrap();
        let base_id = base_result.id();
        drop(base_result);

        struct DerivedOp {
            upstream: ImageId,
            builds: Arc<AtomicU64>,
        }
        impl Operation for DerivedOp {
            fn name(&self) -> &'static str {
                "derived"
            }
            fn arguments(&self) -> &[Argument] {
                Box::leak(vec![Argument::required_input("src", ArgValue::Image(self.upstream))].into_boxed_slice())
            }
            fn build(&self) -> RasterResult<Arc<dyn Image>> {
                self.builds.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(CountingImage::new(2, 2, 1)))
            }
        }

        let derived: Arc<dyn Operation> = Arc::new(DerivedOp {
            upstream: base_id,
            builds: Arc::clone(&builds),
        });
        let derived_result = build_or_reuse(derived).unwrap();
        drop(derived_result);
        assert_eq!(cache_get_size(), 2);

        cache_invalidate(base_id);
        assert_eq!(cache_get_size(), 2, "marked invalid, not yet removed");

        cache_set_max(0);
        assert_eq!(cache_get_size(), 0, "trimming to zero reclaims both stale, unreferenced entries");
        cache_set_max(100);
        drop_all();
    }

    #[test]
    fn concurrent_identical_builds_let_the_first_completion_win() {
        drop_all();
        let builds = Arc::new(AtomicU64::new(0));
        let barrier = Arc::new(Barrier::new(2));

        struct SlowOp {
            seed: i64,
            builds: Arc<AtomicU64>,
            barrier: Arc<Barrier>,
        }
        impl Operation for SlowOp {
            fn name(&self) -> &'static str {
                "slow"
            }
            fn arguments(&self) -> &[Argument] {
                Box::leak(vec![Argument::required_input("seed", ArgValue::Int(self.seed))].into_boxed_slice())
            }
            fn build(&self) -> RasterResult<Arc<dyn Image>> {
                self.barrier.wait();
                self.builds.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(CountingImage::new(4, 4, self.seed as u8)))
            }
        }

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let op: Arc<dyn Operation> = Arc::new(SlowOp {
                    seed: 901,
                    builds: Arc::clone(&builds),
                    barrier: Arc::clone(&barrier),
                });
                std::thread::spawn(move || build_or_reuse(op).unwrap())
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(builds.load(Ordering::SeqCst), 2, "both builds run outside the lock");
        assert_eq!(cache_get_size(), 1, "only one entry survives the race");
        assert_eq!(results[0].id(), results[1].id(), "both callers observe the same winning result");
        drop_all();
    }

    #[test]
    fn hash_changing_mid_build_is_rejected_in_debug() {
        drop_all();

        // An operation whose `arguments()` reports a different seed
        // after `build` has run once, simulating a buggy `Operation`
        // impl that mutates a hashable input during construction.
        struct ShiftingOp {
            seed: std::sync::atomic::AtomicI64,
        }
        impl Operation for ShiftingOp {
            fn name(&self) -> &'static str {
                "shifting"
            }
            fn arguments(&self) -> &[Argument] {
                let seed = self.seed.load(Ordering::SeqCst);
                Box::leak(vec![Argument::required_input("seed", ArgValue::Int(seed))].into_boxed_slice())
            }
            fn build(&self) -> RasterResult<Arc<dyn Image>> {
                self.seed.store(999, Ordering::SeqCst);
                Ok(Arc::new(CountingImage::new(2, 2, 1)))
            }
        }

        let op: Arc<dyn Operation> = Arc::new(ShiftingOp {
            seed: std::sync::atomic::AtomicI64::new(1001),
        });
        let result = build_or_reuse(op);

        if cfg!(debug_assertions) {
            assert!(matches!(result, Err(RasterError::HashContract(_))));
            assert_eq!(cache_get_size(), 0, "a hash-contract violation must not be inserted");
        }
        drop_all();
    }
}
