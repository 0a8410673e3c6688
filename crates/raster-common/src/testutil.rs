//! A counting-stub `Image` used by invariant and scenario tests across
//! the workspace.
//!
//! Mirrors the "predictable, verifiable" philosophy of synthetic test
//! data generators elsewhere in the workspace: rather than decoding or
//! computing anything real, `CountingImage` fills every requested
//! rectangle with a single constant byte value and counts how many
//! times its generator actually ran, so tests can assert cache-hit
//! behaviour (e.g. "counter == 1" after two overlapping prepares).

use crate::image::{Image, ImageBacking, ImageId, PixelSink, RequestStyle, Sequence};
use crate::rect::Rect;
use crate::RasterResult;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// An in-memory, computed (not file-backed) image that fills any
/// requested rectangle with `fill_value` and counts generator
/// invocations.
pub struct CountingImage {
    id: ImageId,
    width: i32,
    height: i32,
    bands: i32,
    element_size: usize,
    fill_value: u8,
    request_style: RequestStyle,
    generate_count: AtomicU64,
    start_count: AtomicU64,
    stop_count: AtomicU64,
    invalid: AtomicBool,
}

impl CountingImage {
    pub fn new(width: i32, height: i32, fill_value: u8) -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            width,
            height,
            bands: 1,
            element_size: 1,
            fill_value,
            request_style: RequestStyle::Any,
            generate_count: AtomicU64::new(0),
            start_count: AtomicU64::new(0),
            stop_count: AtomicU64::new(0),
            invalid: AtomicBool::new(false),
        }
    }

    pub fn with_request_style(mut self, style: RequestStyle) -> Self {
        self.request_style = style;
        self
    }

    /// Number of times `generate` has actually run.
    pub fn generate_count(&self) -> u64 {
        self.generate_count.load(Ordering::SeqCst)
    }

    /// Number of times `start` has handed out a sequence.
    pub fn start_count(&self) -> u64 {
        self.start_count.load(Ordering::SeqCst)
    }

    /// Number of times `stop` has torn one down. Used by region tests
    /// to verify the teardown callback actually fires.
    pub fn stop_count(&self) -> u64 {
        self.stop_count.load(Ordering::SeqCst)
    }

    /// Raise the invalidate flag; observed by regions at their next
    /// `prepare`.
    pub fn invalidate(&self) {
        self.invalid.store(true, Ordering::SeqCst);
    }

    /// Lower the invalidate flag, as a region does once it has
    /// reacted to it.
    pub fn clear_invalid(&self) {
        self.invalid.store(false, Ordering::SeqCst);
    }
}

impl Image for CountingImage {
    fn id(&self) -> ImageId {
        self.id
    }

    fn width(&self) -> i32 {
        self.width
    }

    fn height(&self) -> i32 {
        self.height
    }

    fn bands(&self) -> i32 {
        self.bands
    }

    fn element_size(&self) -> usize {
        self.element_size
    }

    fn request_style(&self) -> RequestStyle {
        self.request_style
    }

    fn backing(&self) -> ImageBacking<'_> {
        ImageBacking::Computed
    }

    fn invalid(&self) -> bool {
        self.invalid.load(Ordering::SeqCst)
    }

    fn start(&self) -> RasterResult<Sequence> {
        self.start_count.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(()))
    }

    fn generate(&self, sink: &mut dyn PixelSink, _rect: Rect, _sequence: &mut Sequence) -> RasterResult<()> {
        self.generate_count.fetch_add(1, Ordering::SeqCst);
        let valid = sink.valid();
        let bpl = sink.bpl();
        let row_bytes = valid.width as usize * self.bands as usize * self.element_size;
        let ptr = sink.data_ptr();
        for row in 0..valid.height as usize {
            unsafe {
                let line = ptr.add(row * bpl);
                std::ptr::write_bytes(line, self.fill_value, row_bytes);
            }
        }
        Ok(())
    }

    fn stop(&self, _sequence: Sequence) {
        self.stop_count.fetch_add(1, Ordering::SeqCst);
    }
}

/// A file-backed stub image, for window-pool tests. Wraps a temp file
/// whose contents are a simple row-index pattern (byte value == row %
/// 256), with one byte per pixel.
pub struct FileStubImage {
    id: ImageId,
    width: i32,
    height: i32,
    path: std::path::PathBuf,
    _tempfile: tempfile::NamedTempFile,
}

impl FileStubImage {
    pub fn create(width: i32, height: i32) -> std::io::Result<Self> {
        use std::io::Write;
        let mut tempfile = tempfile::NamedTempFile::new()?;
        let mut buf = vec![0u8; width as usize * height as usize];
        for row in 0..height as usize {
            let value = (row % 256) as u8;
            let start = row * width as usize;
            buf[start..start + width as usize].fill(value);
        }
        tempfile.write_all(&buf)?;
        tempfile.flush()?;
        let path = tempfile.path().to_path_buf();
        Ok(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            width,
            height,
            path,
            _tempfile: tempfile,
        })
    }
}

impl crate::image::FileSource for FileStubImage {
    fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn line_bytes(&self) -> usize {
        self.width as usize
    }
}

impl Image for FileStubImage {
    fn id(&self) -> ImageId {
        self.id
    }

    fn width(&self) -> i32 {
        self.width
    }

    fn height(&self) -> i32 {
        self.height
    }

    fn bands(&self) -> i32 {
        1
    }

    fn element_size(&self) -> usize {
        1
    }

    fn request_style(&self) -> RequestStyle {
        RequestStyle::Any
    }

    fn backing(&self) -> ImageBacking<'_> {
        ImageBacking::File(self)
    }

    fn invalid(&self) -> bool {
        false
    }

    fn start(&self) -> RasterResult<Sequence> {
        Ok(Box::new(()))
    }

    fn generate(&self, _sink: &mut dyn PixelSink, _rect: Rect, _sequence: &mut Sequence) -> RasterResult<()> {
        unreachable!("file-backed images are never generated, only windowed")
    }

    fn stop(&self, _sequence: Sequence) {}
}
