//! Source image reading module
//!
//! This module defines the format handle boundary and the readers shipped
//! with the server.

mod handle;
mod rawloader_reader;
mod region;
mod registry;
mod tiff_reader;
pub mod types;

pub use handle::{FormatHandle, FormatOpener};
pub use rawloader_reader::RawCameraReader;
pub use region::crop_plane;
pub use registry::FormatRegistry;
pub use tiff_reader::TiffFormatReader;
pub use types::{ColorLookupTable, ImageGeometry, SeriesGeometry};
