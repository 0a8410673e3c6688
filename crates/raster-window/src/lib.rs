//! Reference-counted memory-mapped window pool.
//!
//! One `WindowPool` exists per file-backed image. Each `Window` is a
//! page-aligned `mmap` over a vertical line-range of the file; overlapping
//! requests reuse an existing mapping rather than mapping the same bytes
//! twice. Windows are read-only: nothing here writes through the mapping.

use memmap2::Mmap;
use raster_common::{FileSource, RasterError, RasterResult};
use std::fs::File;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub mod registry;

/// A single page-aligned mapped span covering image lines
/// `[top, top + height)`.
///
/// `top`/`height` describe the *mapping's* coverage, which may be wider
/// than any one caller's request — `WindowPool::acquire` hands back an
/// existing window whenever one already covers the requested range.
#[derive(Clone)]
pub struct Window {
    slot_id: u64,
    mmap: Arc<Mmap>,
    top: i32,
    height: i32,
    line_bytes: usize,
}

impl Window {
    pub fn top(&self) -> i32 {
        self.top
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    pub fn line_bytes(&self) -> usize {
        self.line_bytes
    }

    /// Pointer to the first byte of line `top`. Valid for
    /// `height * line_bytes` bytes.
    pub fn data(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    /// Pointer to the first byte of image line `line`. Panics if `line`
    /// is outside this window's covered range — callers are expected to
    /// check `top`/`height` first.
    pub fn line_ptr(&self, line: i32) -> *const u8 {
        assert!(line >= self.top && line < self.top + self.height);
        let offset = (line - self.top) as usize * self.line_bytes;
        unsafe { self.data().add(offset) }
    }
}

struct Slot {
    id: u64,
    mmap: Arc<Mmap>,
    top: i32,
    height: i32,
    ref_count: usize,
}

struct PoolState {
    slots: Vec<Slot>,
}

/// One pool per image. Mapping and unmapping go through a per-image
/// lock, as required by the concurrency model (concurrent `acquire`s on
/// the same image must not race).
pub struct WindowPool {
    state: Mutex<PoolState>,
    page_size: usize,
    next_slot_id: AtomicU64,
}

impl Default for WindowPool {
    fn default() -> Self {
        Self::new()
    }
}

impl WindowPool {
    pub fn new() -> Self {
        Self::with_page_size(default_page_size())
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            state: Mutex::new(PoolState { slots: Vec::new() }),
            page_size: page_size.max(1),
            next_slot_id: AtomicU64::new(1),
        }
    }

    /// Acquire a window covering `[top, top + height)` of `source`,
    /// whose total image height is `image_height`. Reuses an existing
    /// mapping that already covers the range; otherwise maps a fresh,
    /// page-aligned span and links it into the pool.
    pub fn acquire(
        &self,
        source: &dyn FileSource,
        image_height: i32,
        top: i32,
        height: i32,
    ) -> RasterResult<Window> {
        let mut state = self.state.lock().expect("window pool mutex poisoned");

        if let Some(slot) = state
            .slots
            .iter_mut()
            .find(|slot| slot.top <= top && top + height <= slot.top + slot.height)
        {
            slot.ref_count += 1;
            return Ok(Window {
                slot_id: slot.id,
                mmap: Arc::clone(&slot.mmap),
                top: slot.top,
                height: slot.height,
                line_bytes: source.line_bytes(),
            });
        }

        let line_bytes = source.line_bytes();
        let (map_top, map_height) =
            page_align(top, height, image_height, line_bytes, self.page_size);

        let file = File::open(source.path())
            .map_err(|e| RasterError::AllocFailure(format!("opening {:?}: {e}", source.path())))?;

        let map_len = map_height as usize * line_bytes;
        let mmap = if map_len == 0 {
            // zero-length mappings aren't valid; synthesize an empty-but-safe map
            unsafe { memmap2::MmapOptions::new().len(1).map(&file) }
        } else {
            unsafe {
                memmap2::MmapOptions::new()
                    .offset(map_top as u64 * line_bytes as u64)
                    .len(map_len)
                    .map(&file)
            }
        }
        .map_err(|e| RasterError::AllocFailure(format!("mmap {:?}: {e}", source.path())))?;

        let slot_id = self.next_slot_id.fetch_add(1, Ordering::Relaxed);
        let mmap = Arc::new(mmap);
        state.slots.push(Slot {
            id: slot_id,
            mmap: Arc::clone(&mmap),
            top: map_top,
            height: map_height,
            ref_count: 1,
        });

        tracing::debug!(slot_id, map_top, map_height, "mapped new window");

        Ok(Window {
            slot_id,
            mmap,
            top: map_top,
            height: map_height,
            line_bytes,
        })
    }

    /// Release a window previously returned by `acquire` on this pool.
    /// At zero remaining refs the mapping is unlinked (and unmapped once
    /// every clone of the `Window` value itself is dropped).
    pub fn release(&self, window: Window) {
        let mut state = self.state.lock().expect("window pool mutex poisoned");
        let Some(idx) = state.slots.iter().position(|slot| slot.id == window.slot_id) else {
            // Programming error per the component design: releasing a
            // window that didn't come from this pool. We don't panic in
            // release builds (no pixel-correctness consequence), but it's
            // worth knowing about.
            tracing::warn!(slot_id = window.slot_id, "release of window not owned by this pool");
            return;
        };
        state.slots[idx].ref_count -= 1;
        if state.slots[idx].ref_count == 0 {
            let slot = state.slots.remove(idx);
            tracing::debug!(slot_id = slot.id, "unmapped window");
        }
    }

    /// Current ref count of the window covering `top`, if any — exposed
    /// for tests asserting invariant 1 (window ref_count equals region
    /// attachment count).
    #[doc(hidden)]
    pub fn ref_count_covering(&self, top: i32) -> Option<usize> {
        let state = self.state.lock().expect("window pool mutex poisoned");
        state
            .slots
            .iter()
            .find(|slot| slot.top <= top && top < slot.top + slot.height)
            .map(|slot| slot.ref_count)
    }

    pub fn live_window_count(&self) -> usize {
        self.state.lock().expect("window pool mutex poisoned").slots.len()
    }
}

fn default_page_size() -> usize {
    4096
}

/// Round a requested `[top, top+height)` line range outward to whole
/// pages, clamped to the image's total height.
fn page_align(top: i32, height: i32, image_height: i32, line_bytes: usize, page_size: usize) -> (i32, i32) {
    if line_bytes == 0 {
        return (top, height);
    }
    let lines_per_page = (page_size / line_bytes).max(1) as i32;
    let aligned_top = (top / lines_per_page) * lines_per_page;
    let end = top + height;
    let aligned_end_unclamped = ((end + lines_per_page - 1) / lines_per_page) * lines_per_page;
    let aligned_end = aligned_end_unclamped.min(image_height).max(aligned_top);
    (aligned_top, aligned_end - aligned_top)
}
