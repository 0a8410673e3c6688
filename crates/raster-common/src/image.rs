//! The `Image` capability consumed by the region, window and buffer
//! subsystems.
//!
//! This crate does not know how to decode or generate pixels; it only
//! defines the seam through which the runtime core asks an image to do
//! so. Concrete images (in-memory arrays, file-backed mmaps, or
//! computed nodes with a generator) live outside this crate and
//! implement `Image`.

use crate::rect::Rect;
use crate::RasterResult;
use std::any::Any;

/// An image's preferred tiling shape, used by callers deciding how to
/// subdivide large prepare requests (the core itself does not enforce
/// tiling).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStyle {
    /// Generator accepts arbitrary rectangles.
    Any,
    /// Prefers height-1 strips.
    ThinStrip,
    /// Prefers height-16 strips.
    FatStrip,
    /// Prefers 128x128 tiles.
    SmallTile,
}

/// Stable per-image identity, used to key per-thread buffer caches and
/// per-image window pools. Implementations should hand out a value that
/// stays constant for the image's lifetime and is unique among
/// concurrently live images (e.g. an atomic counter assigned at
/// construction).
pub type ImageId = u64;

/// How an image presents its pixels to a region that wants to view them
/// without a generator call.
pub enum ImageBacking<'a> {
    /// No direct pixel access; regions on this image must go through
    /// `prepare`/generate.
    Computed,
    /// Fully materialised in memory; a region may attach directly.
    Memory { data: &'a [u8], bpl: usize },
    /// Backed by a file; regions attach windows from the window pool.
    File(&'a dyn FileSource),
}

/// The capability a file-backed image exposes to the window pool.
pub trait FileSource: Send + Sync {
    /// Path to the backing file.
    fn path(&self) -> &std::path::Path;
    /// Bytes per image line, for addressing into the mapped span.
    fn line_bytes(&self) -> usize;
}

/// The sink a generator writes pixels into. Implemented by `Region` in
/// `raster-region`; kept as a trait here so this crate does not need to
/// depend on the region crate (the two are tightly coupled by design,
/// but a trait at the seam avoids a dependency cycle).
pub trait PixelSink {
    /// The rectangle this sink is prepared to receive pixels for.
    fn valid(&self) -> Rect;
    /// Raw pointer to the first pixel of the sink's `valid` rectangle.
    /// The generator may write up to `valid.height` lines of `bpl()`
    /// bytes each.
    fn data_ptr(&mut self) -> *mut u8;
    /// Bytes per line of the sink's backing storage.
    fn bpl(&self) -> usize;
}

/// Per-region opaque generator state, created by `Image::start` and
/// consumed by `Image::stop`.
pub type Sequence = Box<dyn Any + Send>;

/// The capability required from the image layer.
pub trait Image: Send + Sync {
    fn id(&self) -> ImageId;
    fn width(&self) -> i32;
    fn height(&self) -> i32;
    fn bands(&self) -> i32;
    fn element_size(&self) -> usize;
    fn request_style(&self) -> RequestStyle;

    /// How this image presents pixels outside of generation.
    fn backing(&self) -> ImageBacking<'_>;

    fn is_file_backed(&self) -> bool {
        matches!(self.backing(), ImageBacking::File(_))
    }

    fn is_materialised(&self) -> bool {
        matches!(self.backing(), ImageBacking::Memory { .. })
    }

    /// The image's full extent as a rectangle at (0, 0).
    fn bounds(&self) -> Rect {
        Rect::new(0, 0, self.width(), self.height())
    }

    fn bytes_per_line(&self) -> usize {
        self.bands() as usize * self.element_size() * self.width() as usize
    }

    /// Snapshot of the invalidate flag; regions compare this against
    /// their own snapshot at the top of every `prepare`.
    fn invalid(&self) -> bool;

    /// Per-region generator setup.
    fn start(&self) -> RasterResult<Sequence>;

    /// Fill `sink`'s `valid` rectangle with pixels for `rect`.
    fn generate(&self, sink: &mut dyn PixelSink, rect: Rect, sequence: &mut Sequence) -> RasterResult<()>;

    /// Per-region generator teardown.
    fn stop(&self, sequence: Sequence);
}

/// Clip a requested rectangle to the image's bounds. Per the prepare
/// algorithm, a rect disjoint from the image (or empty to start with)
/// simply clips to empty; it is not an error condition (see
/// `prepare`'s handling of an empty `need`).
pub fn clip_to_bounds(image: &dyn Image, rect: Rect) -> Rect {
    image.bounds().intersect(&rect)
}
