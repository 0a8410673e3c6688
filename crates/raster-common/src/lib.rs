//! Shared primitives for the raster-lazy runtime core.
//!
//! This crate has no knowledge of pixel formats, codecs or operation
//! graphs. It provides the three things every other crate in the
//! workspace needs: integer rectangle algebra, a common error type, and
//! environment-driven configuration for cache bounds.

pub mod config;
pub mod error;
pub mod image;
pub mod rect;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use config::CacheBounds;
pub use error::{RasterError, RasterResult};
pub use image::{clip_to_bounds, FileSource, Image, ImageBacking, ImageId, PixelSink, RequestStyle, Sequence};
pub use rect::Rect;
