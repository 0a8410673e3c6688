//! Region: the polymorphic per-thread pixel view used to move data
//! between producers and consumers during lazy evaluation.
//!
//! A `Region` is a cheap handle (`Rc`-backed, like the buffers and
//! windows it can wrap) onto one of five backing states. `data`/`bpl`
//! are never stored on the region itself — they're derived from
//! whichever backing is currently attached, per the tagged-union design
//! in the component design this crate implements.

use raster_buffer::Buffer;
use raster_common::{
    clip_to_bounds, Image, ImageBacking, PixelSink, RasterError, RasterResult, Rect, Sequence,
};
use raster_window::Window;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::thread::ThreadId;

/// The five ways a region's pixels can be backed.
enum Backing {
    /// Newly created; no pixels yet.
    None,
    /// Owns one ref on a per-thread buffer.
    Buffer(Buffer),
    /// Borrows pixels from another region. `offset_x`/`offset_y` locate
    /// where (x, y) of `source` aligns with this region's top-left.
    OtherRegion {
        source: Region,
        offset_x: i32,
        offset_y: i32,
    },
    /// Views a fully materialised image's own pixel array directly.
    OtherImage,
    /// Owns one ref on a mapped window.
    Window(Window),
}

struct RegionInner {
    image: Arc<dyn Image>,
    valid: Rect,
    backing: Backing,
    owning_thread: Option<ThreadId>,
    invalid_snapshot: bool,
    sequence: Option<Sequence>,
}

/// Tears down the generator sequence once the last `Region` handle
/// sharing this inner state goes away. `Region` itself is a cheap,
/// cloneable handle onto this `Rc`, so the teardown lives here rather
/// than on `Region` — it must run exactly once, when the state is
/// actually reclaimed, not on every clone's drop.
impl Drop for RegionInner {
    fn drop(&mut self) {
        if let Some(sequence) = self.sequence.take() {
            self.image.stop(sequence);
        }
    }
}

/// A pixel view over a rectangle of an image, confined to one thread.
///
/// Cloning a `Region` shares the same backing (useful for
/// `attach_region`'s "borrow from another region" case); it does not
/// create an independent view the way a fresh `Region::new` does.
#[derive(Clone)]
pub struct Region {
    inner: Rc<RefCell<RegionInner>>,
}

fn pixel_stride(image: &dyn Image) -> usize {
    image.bands() as usize * image.element_size()
}

impl Region {
    /// Create a new region in the `None` state on `image`, owned by the
    /// calling thread.
    pub fn new(image: Arc<dyn Image>) -> Region {
        let invalid_snapshot = image.invalid();
        Region {
            inner: Rc::new(RefCell::new(RegionInner {
                image,
                valid: Rect::empty(),
                backing: Backing::None,
                owning_thread: Some(std::thread::current().id()),
                invalid_snapshot,
                sequence: None,
            })),
        }
    }

    pub fn valid(&self) -> Rect {
        self.inner.borrow().valid
    }

    pub fn image(&self) -> Arc<dyn Image> {
        Arc::clone(&self.inner.borrow().image)
    }

    /// Hand off ownership of this region to the calling thread. The
    /// only sanctioned way to move a region between workers.
    pub fn take_ownership(&self) {
        self.inner.borrow_mut().owning_thread = Some(std::thread::current().id());
    }

    /// Relinquish ownership; the region may not be used by any thread
    /// until `take_ownership` is called again.
    pub fn no_ownership(&self) {
        self.inner.borrow_mut().owning_thread = None;
    }

    fn assert_owner(&self) -> RasterResult<()> {
        if cfg!(debug_assertions) {
            let owner = self.inner.borrow().owning_thread;
            if owner != Some(std::thread::current().id()) {
                return Err(RasterError::ThreadMisuse(
                    "region accessed from a thread other than its owner".into(),
                ));
            }
        }
        Ok(())
    }

    /// Drop the current backing, releasing whatever buffer/window it
    /// held. Used both explicitly and internally when invalidation
    /// requires dropping stale caches before a `prepare`.
    fn drop_backing(&self) {
        let mut inner = self.inner.borrow_mut();
        let image_id = inner.image.id();
        match std::mem::replace(&mut inner.backing, Backing::None) {
            Backing::Buffer(buf) => raster_buffer::buffer_unref(buf),
            Backing::Window(win) => raster_window::registry::pool_for(image_id).release(win),
            _ => {}
        }
    }

    /// Attaches a fresh buffer of `rect` on this region's image.
    /// Allocation only; no pixel computation.
    pub fn attach_buffer(&self, rect: Rect) -> RasterResult<()> {
        self.assert_owner()?;
        self.drop_backing();
        let image = self.image();
        let buf = raster_buffer::buffer_new(image.as_ref(), rect);
        let mut inner = self.inner.borrow_mut();
        inner.valid = rect;
        inner.backing = Backing::Buffer(buf);
        Ok(())
    }

    /// If the image is fully materialised, attaches directly to its
    /// pixel array; otherwise falls back to `attach_buffer`.
    pub fn attach_image(&self, rect: Rect) -> RasterResult<()> {
        self.assert_owner()?;
        let is_materialised = self.image().is_materialised();
        if is_materialised {
            self.drop_backing();
            let mut inner = self.inner.borrow_mut();
            inner.valid = rect;
            inner.backing = Backing::OtherImage;
            Ok(())
        } else {
            self.attach_buffer(rect)
        }
    }

    /// Borrows pixels from `source` such that pixel `(x, y)` of
    /// `source` aligns with the top-left of `rect`. The source must
    /// already be in a backed state covering the implied area.
    pub fn attach_region(&self, source: &Region, rect: Rect, x: i32, y: i32) -> RasterResult<()> {
        self.assert_owner()?;
        source.assert_owner()?;
        debug_assert!(
            source.valid().includes_rect(&Rect::new(x, y, rect.width, rect.height)),
            "attach_region source does not cover the implied area"
        );
        self.drop_backing();
        let mut inner = self.inner.borrow_mut();
        inner.valid = rect;
        inner.backing = Backing::OtherRegion {
            source: source.clone(),
            offset_x: x,
            offset_y: y,
        };
        Ok(())
    }

    /// Attaches a window covering image lines `[top, top+height)`.
    /// Only meaningful for file-backed images.
    pub fn attach_window(&self, top: i32, height: i32) -> RasterResult<()> {
        self.assert_owner()?;
        let image = self.image();
        let ImageBacking::File(source) = image.backing() else {
            return Err(RasterError::InvalidRequest(
                "attach_window on an image that is not file-backed".into(),
            ));
        };
        let pool = raster_window::registry::pool_for(image.id());
        let window = pool.acquire(source, image.height(), top, height)?;
        self.drop_backing();
        let mut inner = self.inner.borrow_mut();
        inner.valid = Rect::new(0, top, image.width(), height);
        inner.backing = Backing::Window(window);
        Ok(())
    }

    /// Moves `valid`'s origin while keeping the current backing —
    /// used to scan a buffer tile by tile.
    pub fn set_position(&self, x: i32, y: i32) -> RasterResult<()> {
        self.assert_owner()?;
        let mut inner = self.inner.borrow_mut();
        inner.valid.left = x;
        inner.valid.top = y;
        Ok(())
    }

    /// Pointer to the first pixel of this region's `valid` rectangle,
    /// and the bytes-per-line of its backing, derived from whichever
    /// variant is attached.
    fn data_and_bpl(&self) -> (*mut u8, usize) {
        let inner = self.inner.borrow();
        match &inner.backing {
            Backing::None => (std::ptr::null_mut(), 0),
            Backing::Buffer(buf) => (buf.data_ptr(), buf.bpl()),
            Backing::Window(win) => (win.line_ptr(inner.valid.top) as *mut u8, win.line_bytes()),
            Backing::OtherImage => match inner.image.backing() {
                ImageBacking::Memory { data, bpl } => {
                    let stride = pixel_stride(inner.image.as_ref());
                    let offset = inner.valid.top as usize * bpl + inner.valid.left as usize * stride;
                    (unsafe { data.as_ptr().add(offset) as *mut u8 }, bpl)
                }
                _ => (std::ptr::null_mut(), 0),
            },
            Backing::OtherRegion {
                source,
                offset_x,
                offset_y,
            } => {
                let (src_data, src_bpl) = source.data_and_bpl();
                let stride = pixel_stride(inner.image.as_ref());
                let offset = *offset_y as usize * src_bpl + *offset_x as usize * stride;
                (unsafe { src_data.add(offset) }, src_bpl)
            }
        }
    }

    /// Fill `rect` (clipped to `valid`) with a single byte value.
    pub fn paint(&self, rect: Rect, byte_value: u8) -> RasterResult<()> {
        self.assert_owner()?;
        let clip = self.valid().intersect(&rect);
        if clip.is_empty() {
            return Ok(());
        }
        let (ptr, bpl) = self.data_and_bpl();
        if ptr.is_null() {
            return Err(RasterError::InvalidRequest("paint on an unbacked region".into()));
        }
        let stride = pixel_stride(self.image().as_ref());
        let valid = self.valid();
        let row_bytes = clip.width as usize * stride;
        for row in 0..clip.height as usize {
            let y = clip.top as usize - valid.top as usize + row;
            let x_off = (clip.left - valid.left) as usize * stride;
            unsafe {
                let line = ptr.add(y * bpl + x_off);
                std::ptr::write_bytes(line, byte_value, row_bytes);
            }
        }
        Ok(())
    }

    /// Fill `rect` with a repeating pixel value (`pel`, one pixel's
    /// worth of bytes).
    pub fn paint_pel(&self, rect: Rect, pel: &[u8]) -> RasterResult<()> {
        self.assert_owner()?;
        let clip = self.valid().intersect(&rect);
        if clip.is_empty() {
            return Ok(());
        }
        let (ptr, bpl) = self.data_and_bpl();
        if ptr.is_null() {
            return Err(RasterError::InvalidRequest("paint_pel on an unbacked region".into()));
        }
        let stride = pixel_stride(self.image().as_ref());
        debug_assert_eq!(pel.len(), stride, "pel length must match the image's pixel stride");
        let valid = self.valid();
        for row in 0..clip.height as usize {
            let y = clip.top as usize - valid.top as usize + row;
            let x_off = (clip.left - valid.left) as usize * stride;
            for col in 0..clip.width as usize {
                unsafe {
                    let dst = ptr.add(y * bpl + x_off + col * stride);
                    std::ptr::copy_nonoverlapping(pel.as_ptr(), dst, stride);
                }
            }
        }
        Ok(())
    }

    /// Paint the entire `valid` rectangle with zero.
    pub fn black(&self) -> RasterResult<()> {
        let valid = self.valid();
        self.paint(valid, 0)
    }

    /// Copies a rectangle from `src` (at its own coordinates) into
    /// `self` such that `src`'s pixel `(x, y)` lands at `rect`'s
    /// top-left within `self`.
    pub fn copy(&self, src: &Region, rect: Rect, x: i32, y: i32) -> RasterResult<()> {
        self.assert_owner()?;
        src.assert_owner()?;
        let clip = self.valid().intersect(&rect);
        if clip.is_empty() {
            return Ok(());
        }
        let (dst_ptr, dst_bpl) = self.data_and_bpl();
        let (src_ptr, src_bpl) = src.data_and_bpl();
        if dst_ptr.is_null() || src_ptr.is_null() {
            return Err(RasterError::InvalidRequest("copy with an unbacked region".into()));
        }
        let stride = pixel_stride(self.image().as_ref());
        let dst_valid = self.valid();
        let src_valid = src.valid();
        let row_bytes = clip.width as usize * stride;
        for row in 0..clip.height as usize {
            let dst_y = (clip.top - dst_valid.top) as usize + row;
            let dst_x_off = (clip.left - dst_valid.left) as usize * stride;
            let src_y = (y - src_valid.top) as usize + row;
            let src_x_off = (x - src_valid.left) as usize * stride;
            unsafe {
                let d = dst_ptr.add(dst_y * dst_bpl + dst_x_off);
                let s = src_ptr.add(src_y * src_bpl + src_x_off);
                std::ptr::copy_nonoverlapping(s, d, row_bytes);
            }
        }
        Ok(())
    }

    fn check_invalidation(&self) {
        let (now, prior, had_backing) = {
            let inner = self.inner.borrow();
            let had_backing = !matches!(inner.backing, Backing::None);
            (inner.image.invalid(), inner.invalid_snapshot, had_backing)
        };
        if now != prior {
            if had_backing {
                self.drop_backing();
            }
            self.inner.borrow_mut().invalid_snapshot = now;
        }
    }

    /// The central demand-fill primitive. Ensures `rect`'s pixels are
    /// materialised through this region's backing.
    pub fn prepare(&self, rect: Rect) -> RasterResult<()> {
        self.assert_owner()?;
        self.check_invalidation();

        let image = self.image();
        let need = clip_to_bounds(image.as_ref(), rect);
        if need.is_empty() {
            self.inner.borrow_mut().valid = Rect::empty();
            return Ok(());
        }

        if image.is_file_backed() {
            return self.attach_window(need.top, need.height);
        }

        if let Some(existing) = raster_buffer::buffer_ref_existing(image.as_ref(), need) {
            self.drop_backing();
            let mut inner = self.inner.borrow_mut();
            inner.valid = need;
            inner.backing = Backing::Buffer(existing);
            return Ok(());
        }

        let buf = raster_buffer::buffer_new(image.as_ref(), need);

        let mut sink = BufferSink { buffer: buf.clone() };

        let mut sequence = {
            let mut inner = self.inner.borrow_mut();
            match inner.sequence.take() {
                Some(seq) => seq,
                None => image.start()?,
            }
        };

        let result = image.generate(&mut sink, need, &mut sequence);
        self.inner.borrow_mut().sequence = Some(sequence);

        match result {
            Ok(()) => {
                raster_buffer::buffer_done(&buf);
                self.drop_backing();
                let mut inner = self.inner.borrow_mut();
                inner.valid = need;
                inner.backing = Backing::Buffer(buf);
                Ok(())
            }
            Err(e) => {
                raster_buffer::buffer_undone(&buf);
                raster_buffer::buffer_unref(buf);
                Err(e)
            }
        }
    }

    /// Prepares `rect` on this region and writes the resulting pixels
    /// into `dest` at offset `(x, y)`. Falls back to `prepare` then
    /// `copy` since this crate's generators cannot write directly into
    /// a foreign region.
    pub fn prepare_to(&self, dest: &Region, rect: Rect, x: i32, y: i32) -> RasterResult<()> {
        self.prepare(rect)?;
        let dest_rect = Rect::new(x, y, rect.width, rect.height);
        dest.copy(self, dest_rect, rect.left, rect.top)
    }

    /// Prepares pixels and returns a freshly allocated, packed copy —
    /// for callers that need to detach from the region's lifetime.
    pub fn fetch(&self, left: i32, top: i32, width: i32, height: i32) -> RasterResult<Vec<u8>> {
        let rect = Rect::new(left, top, width, height);
        self.prepare(rect)?;
        let valid = self.valid();
        let (ptr, bpl) = self.data_and_bpl();
        let stride = pixel_stride(self.image().as_ref());
        let row_bytes = valid.width.max(0) as usize * stride;
        let mut out = vec![0u8; row_bytes * valid.height.max(0) as usize];
        if !ptr.is_null() {
            for row in 0..valid.height as usize {
                unsafe {
                    let src = ptr.add(row * bpl);
                    std::ptr::copy_nonoverlapping(src, out.as_mut_ptr().add(row * row_bytes), row_bytes);
                }
            }
        }
        Ok(out)
    }

    /// Tile-subdivides `rect` per the image's request style, calling
    /// `f` for each tile after preparing it.
    pub fn fill(&self, rect: Rect, mut f: impl FnMut(&Region, Rect) -> RasterResult<()>) -> RasterResult<()> {
        for tile in tile_rects(rect, self.image().request_style()) {
            self.prepare(tile)?;
            f(self, tile)?;
        }
        Ok(())
    }
}

/// Prepares the same rectangle on each region in order; the first
/// error aborts the remaining regions.
pub fn prepare_many(regions: &[Region], rect: Rect) -> RasterResult<()> {
    for region in regions {
        region.prepare(rect)?;
    }
    Ok(())
}

fn tile_rects(rect: Rect, style: raster_common::RequestStyle) -> Vec<Rect> {
    use raster_common::RequestStyle::*;
    if rect.is_empty() {
        return Vec::new();
    }
    let tile_height = match style {
        ThinStrip => 1,
        FatStrip => 16,
        SmallTile => 128,
        Any => rect.height,
    };
    let tile_width = match style {
        SmallTile => 128,
        _ => rect.width,
    };
    let mut tiles = Vec::new();
    let mut y = rect.top;
    while y < rect.bottom() {
        let h = tile_height.min(rect.bottom() - y);
        let mut x = rect.left;
        while x < rect.right() {
            let w = tile_width.min(rect.right() - x);
            tiles.push(Rect::new(x, y, w, h));
            x += w;
        }
        y += h;
    }
    tiles
}

struct BufferSink {
    buffer: Buffer,
}

impl PixelSink for BufferSink {
    fn valid(&self) -> Rect {
        self.buffer.area()
    }

    fn data_ptr(&mut self) -> *mut u8 {
        self.buffer.data_ptr()
    }

    fn bpl(&self) -> usize {
        self.buffer.bpl()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raster_common::testutil::CountingImage;

    fn image(w: i32, h: i32, fill: u8) -> Arc<dyn Image> {
        Arc::new(CountingImage::new(w, h, fill))
    }

    #[test]
    fn prepare_fills_via_generator_once_on_repeat() {
        let counting = Arc::new(CountingImage::new(64, 64, 9));
        let region = Region::new(Arc::clone(&counting) as Arc<dyn Image>);
        let rect = Rect::new(0, 0, 32, 32);

        region.prepare(rect).unwrap();
        region.prepare(rect).unwrap();

        assert_eq!(counting.generate_count(), 1);
    }

    #[test]
    fn prepare_with_empty_rect_succeeds_with_empty_valid() {
        let image = image(10, 10, 1);
        let region = Region::new(image);
        region.prepare(Rect::empty()).unwrap();
        assert!(region.valid().is_empty());
    }

    #[test]
    fn prepare_clips_partially_outside_rect() {
        let image = image(10, 10, 1);
        let region = Region::new(image);
        region.prepare(Rect::new(5, 5, 20, 20)).unwrap();
        assert_eq!(region.valid(), Rect::new(5, 5, 5, 5));
    }

    #[test]
    fn fetch_matches_attach_then_prepare_pixels() {
        let image = image(16, 16, 42);
        let region = Region::new(image);
        let rect = Rect::new(0, 0, 8, 8);
        region.prepare(rect).unwrap();
        let fetched = region.fetch(0, 0, 8, 8).unwrap();
        assert!(fetched.iter().all(|&b| b == 42));
    }

    #[test]
    fn black_zeroes_valid_rect() {
        let image = image(16, 16, 5);
        let region = Region::new(image);
        region.prepare(Rect::new(0, 0, 4, 4)).unwrap();
        region.black().unwrap();
        let fetched = region.fetch(0, 0, 4, 4).unwrap();
        assert!(fetched.iter().all(|&b| b == 0));
    }

    #[test]
    fn thread_misuse_detected_in_debug() {
        let image = image(16, 16, 1);
        let region = Region::new(image);
        region.no_ownership();
        let err = region.prepare(Rect::new(0, 0, 4, 4));
        if cfg!(debug_assertions) {
            assert!(err.is_err());
        }
    }

    #[test]
    fn dropping_the_region_tears_down_its_sequence() {
        let counting = Arc::new(CountingImage::new(32, 32, 1));
        let region = Region::new(Arc::clone(&counting) as Arc<dyn Image>);
        region.prepare(Rect::new(0, 0, 8, 8)).unwrap();

        assert_eq!(counting.start_count(), 1);
        assert_eq!(counting.stop_count(), 0, "the sequence is held open across repeated prepares");

        drop(region);
        assert_eq!(counting.stop_count(), 1, "dropping the last handle must tear down the sequence");
    }

    #[test]
    fn cloned_region_only_tears_down_once_the_last_handle_drops() {
        let counting = Arc::new(CountingImage::new(32, 32, 1));
        let region = Region::new(Arc::clone(&counting) as Arc<dyn Image>);
        region.prepare(Rect::new(0, 0, 8, 8)).unwrap();

        let clone = region.clone();
        drop(region);
        assert_eq!(counting.stop_count(), 0, "a live clone still shares the sequence");

        drop(clone);
        assert_eq!(counting.stop_count(), 1);
    }
}
