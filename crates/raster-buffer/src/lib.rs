//! Per-thread pixel buffer pool.
//!
//! One `BufferCache` exists per (thread, image) pair, held inside a
//! thread-local `BufferThread` map. Buffers are never shared across
//! threads: everything here is `Rc`/`RefCell`, not `Arc`/`Mutex`, because
//! a `BufferCache` is only ever touched by the thread that owns it.

use raster_common::{Image, ImageId, Rect};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::thread::ThreadId;

/// Upper bound on the reserve freelist per cache (Open Question in the
/// component design resolves this to 4; see DESIGN.md).
pub const RESERVE_MAX: usize = 4;

struct BufferInner {
    image: ImageId,
    area: Rect,
    done: bool,
    ref_count: usize,
    pixels: Vec<u8>,
    bpl: usize,
}

/// A handle to one pixel buffer. Cloning a `Buffer` does not bump the
/// domain ref count described in the component design — use
/// `buffer_ref_existing`/`buffer_unref` for that. Cloning only shares
/// the underlying allocation handle (needed so a region can hold a
/// `Buffer` independently of the cache's own bookkeeping list).
#[derive(Clone)]
pub struct Buffer {
    inner: Rc<RefCell<BufferInner>>,
}

impl Buffer {
    pub fn image(&self) -> ImageId {
        self.inner.borrow().image
    }

    pub fn area(&self) -> Rect {
        self.inner.borrow().area
    }

    pub fn done(&self) -> bool {
        self.inner.borrow().done
    }

    pub fn ref_count(&self) -> usize {
        self.inner.borrow().ref_count
    }

    pub fn bpl(&self) -> usize {
        self.inner.borrow().bpl
    }

    /// Raw pointer to the buffer's backing storage. The caller is
    /// responsible for staying within `area.height * bpl()` bytes.
    pub fn data_ptr(&self) -> *mut u8 {
        self.inner.borrow_mut().pixels.as_mut_ptr()
    }

    fn identity(&self) -> usize {
        Rc::as_ptr(&self.inner) as usize
    }
}

fn bytes_needed(image: &dyn Image, rect: Rect) -> (usize, usize) {
    let bpl = rect.width.max(0) as usize * image.bands() as usize * image.element_size();
    let total = bpl * rect.height.max(0) as usize;
    (bpl, total)
}

/// Statistics for one (thread, image) buffer cache, mirroring the
/// hit/miss/eviction counters used by the storage-layer caches
/// elsewhere in the workspace.
#[derive(Debug, Default, Clone, Copy)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub reserve_evictions: u64,
    pub entries: usize,
    pub reserve_entries: usize,
}

struct BufferCache {
    thread_id: ThreadId,
    buffers: Vec<Buffer>,
    reserve: VecDeque<Buffer>,
    hits: u64,
    misses: u64,
    reserve_evictions: u64,
}

impl BufferCache {
    fn new(thread_id: ThreadId) -> Self {
        Self {
            thread_id,
            buffers: Vec::new(),
            reserve: VecDeque::new(),
            hits: 0,
            misses: 0,
            reserve_evictions: 0,
        }
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            reserve_evictions: self.reserve_evictions,
            entries: self.buffers.len(),
            reserve_entries: self.reserve.len(),
        }
    }
}

thread_local! {
    static BUFFER_THREAD: RefCell<HashMap<ImageId, BufferCache>> = RefCell::new(HashMap::new());
}

fn current_thread_id() -> ThreadId {
    std::thread::current().id()
}

fn with_cache<R>(image_id: ImageId, f: impl FnOnce(&mut BufferCache) -> R) -> R {
    BUFFER_THREAD.with(|caches| {
        let mut caches = caches.borrow_mut();
        let cache = caches
            .entry(image_id)
            .or_insert_with(|| BufferCache::new(current_thread_id()));
        f(cache)
    })
}

/// Allocate a fresh, undone buffer for `rect` on `image`. Reuses a
/// reserve entry whose existing allocation is large enough, per the
/// tiered-reuse idea used by the renderer's thread-local pixel buffers.
pub fn buffer_new(image: &dyn Image, rect: Rect) -> Buffer {
    let (bpl, total) = bytes_needed(image, rect);
    with_cache(image.id(), |cache| {
        if let Some(pos) = cache
            .reserve
            .iter()
            .position(|b| b.inner.borrow().pixels.capacity() >= total)
        {
            let buf = cache.reserve.remove(pos).unwrap();
            {
                let mut inner = buf.inner.borrow_mut();
                inner.area = rect;
                inner.done = false;
                inner.ref_count = 1;
                inner.bpl = bpl;
                inner.pixels.resize(total, 0);
            }
            buf
        } else {
            let inner = BufferInner {
                image: image.id(),
                area: rect,
                done: false,
                ref_count: 1,
                pixels: vec![0u8; total],
                bpl,
            };
            Buffer {
                inner: Rc::new(RefCell::new(inner)),
            }
        }
    })
}

/// Search the current thread's cache for a done buffer whose `area`
/// exactly equals `rect`. On a match, bumps its ref count.
pub fn buffer_ref_existing(image: &dyn Image, rect: Rect) -> Option<Buffer> {
    with_cache(image.id(), |cache| {
        let found = cache.buffers.iter().find(|b| b.area() == rect).cloned();
        match &found {
            Some(buf) => {
                buf.inner.borrow_mut().ref_count += 1;
                cache.hits += 1;
            }
            None => cache.misses += 1,
        }
        found
    })
}

/// Mark `buffer` done and link it into the current thread's cache for
/// its image. Requires `ref_count >= 1`.
pub fn buffer_done(buffer: &Buffer) {
    debug_assert!(buffer.ref_count() >= 1, "buffer_done on a buffer with no refs");
    let image_id = buffer.image();
    with_cache(image_id, |cache| {
        buffer.inner.borrow_mut().done = true;
        if !cache.buffers.iter().any(|b| b.identity() == buffer.identity()) {
            cache.buffers.push(buffer.clone());
        }
    });
}

/// Reverse of `buffer_done`: unlinks from the cache if present and
/// marks the buffer undone. Used when a generator fails mid-fill.
pub fn buffer_undone(buffer: &Buffer) {
    let image_id = buffer.image();
    with_cache(image_id, |cache| {
        cache.buffers.retain(|b| b.identity() != buffer.identity());
        buffer.inner.borrow_mut().done = false;
    });
}

/// Decrement `buffer`'s ref count. At zero: a done buffer moves to the
/// reserve freelist (evicting the oldest reserve entry if full); an
/// undone buffer is dropped immediately.
pub fn buffer_unref(buffer: Buffer) {
    let image_id = buffer.image();
    with_cache(image_id, |cache| {
        let remaining = {
            let mut inner = buffer.inner.borrow_mut();
            inner.ref_count = inner.ref_count.saturating_sub(1);
            inner.ref_count
        };
        if remaining > 0 {
            return;
        }
        cache.buffers.retain(|b| b.identity() != buffer.identity());
        if buffer.done() {
            if cache.reserve.len() >= RESERVE_MAX {
                cache.reserve.pop_front();
                cache.reserve_evictions += 1;
            }
            cache.reserve.push_back(buffer);
        }
        // undone buffers simply fall out of scope here and are freed
        // once this closure's local `buffer` binding drops.
    });
}

/// Fuses an unref of `old` with an acquire (ref-existing-or-new) of
/// `rect` on `image` in one thread-local critical section.
pub fn buffer_unref_then_ref(old: Buffer, image: &dyn Image, rect: Rect) -> Buffer {
    buffer_unref(old);
    buffer_ref_existing(image, rect).unwrap_or_else(|| buffer_new(image, rect))
}

/// Current cache statistics for `image` on this thread, or `None` if no
/// cache has been created for it yet.
pub fn cache_stats(image_id: ImageId) -> Option<CacheStats> {
    BUFFER_THREAD.with(|caches| caches.borrow().get(&image_id).map(BufferCache::stats))
}

/// True iff a `BufferCache` for `image_id` exists on this thread and its
/// recorded `thread_id` matches the current thread — used by invariant
/// tests asserting buffers never migrate threads.
pub fn cache_thread_matches(image_id: ImageId) -> bool {
    BUFFER_THREAD.with(|caches| {
        caches
            .borrow()
            .get(&image_id)
            .map(|c| c.thread_id == current_thread_id())
            .unwrap_or(true)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use raster_common::testutil::CountingImage;

    #[test]
    fn new_buffer_is_undone_with_one_ref() {
        let image = CountingImage::new(32, 32, 1);
        let rect = Rect::new(0, 0, 8, 8);
        let buf = buffer_new(&image, rect);
        assert!(!buf.done());
        assert_eq!(buf.ref_count(), 1);
        assert_eq!(buf.area(), rect);
    }

    #[test]
    fn done_buffer_is_findable_by_exact_rect() {
        let image = CountingImage::new(32, 32, 1);
        let rect = Rect::new(0, 0, 8, 8);
        let buf = buffer_new(&image, rect);
        buffer_done(&buf);

        let found = buffer_ref_existing(&image, rect);
        assert!(found.is_some());
        assert_eq!(buf.ref_count(), 2);
    }

    #[test]
    fn non_matching_rect_is_a_miss() {
        let image = CountingImage::new(32, 32, 1);
        let buf = buffer_new(&image, Rect::new(0, 0, 8, 8));
        buffer_done(&buf);

        assert!(buffer_ref_existing(&image, Rect::new(0, 0, 4, 4)).is_none());
        let stats = cache_stats(image.id()).unwrap();
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn unref_to_zero_on_done_buffer_moves_to_reserve() {
        let image = CountingImage::new(32, 32, 1);
        let rect = Rect::new(0, 0, 8, 8);
        let buf = buffer_new(&image, rect);
        buffer_done(&buf);
        buffer_unref(buf);

        assert!(buffer_ref_existing(&image, rect).is_none());
        let stats = cache_stats(image.id()).unwrap();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.reserve_entries, 1);
    }

    #[test]
    fn reserve_is_bounded() {
        let image = CountingImage::new(256, 256, 1);
        for i in 0..(RESERVE_MAX + 2) {
            let rect = Rect::new(0, i as i32 * 8, 8, 8);
            let buf = buffer_new(&image, rect);
            buffer_done(&buf);
            buffer_unref(buf);
        }
        let stats = cache_stats(image.id()).unwrap();
        assert_eq!(stats.reserve_entries, RESERVE_MAX);
        assert_eq!(stats.reserve_evictions, 2);
    }

    #[test]
    fn undone_buffer_unref_does_not_enter_reserve() {
        let image = CountingImage::new(32, 32, 1);
        let buf = buffer_new(&image, Rect::new(0, 0, 8, 8));
        buffer_undone(&buf);
        buffer_unref(buf);
        let stats = cache_stats(image.id()).unwrap();
        assert_eq!(stats.reserve_entries, 0);
        assert_eq!(stats.entries, 0);
    }
}
