use std::path::Path;

use tracing::debug;

use crate::image_pipeline::common::error::{ConversionError, Result};
use crate::image_pipeline::format::handle::{FormatHandle, FormatOpener};
use crate::image_pipeline::format::rawloader_reader::RawCameraReader;
use crate::image_pipeline::format::tiff_reader::TiffFormatReader;

const TIFF_EXTENSIONS: &[&str] = &["tif", "tiff", "btf", "tf8"];
const RAW_EXTENSIONS: &[&str] = &["arw", "cr2", "nef", "dng", "raf", "orf", "rw2", "pef", "srw"];

/// Picks a reader by file extension.
///
/// The registry is built once at start-up and handed to the conversion
/// engine; nothing looks it up globally.
#[derive(Debug, Default, Clone, Copy)]
pub struct FormatRegistry;

impl FormatRegistry {
    pub fn new() -> Self {
        Self
    }
}

fn extension(locator: &str) -> Option<String> {
    Path::new(locator)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

impl FormatOpener for FormatRegistry {
    fn open(&self, locator: &str, group_files: bool) -> Result<Box<dyn FormatHandle>> {
        let ext = extension(locator).unwrap_or_default();
        debug!(locator, group_files, extension = %ext, "Selecting source reader");

        if TIFF_EXTENSIONS.contains(&ext.as_str()) {
            Ok(Box::new(TiffFormatReader::open(locator)?))
        } else if RAW_EXTENSIONS.contains(&ext.as_str()) {
            Ok(Box::new(RawCameraReader::open(locator)?))
        } else {
            Err(ConversionError::open(locator, format!("no reader for extension '{ext}'")))
        }
    }
}
