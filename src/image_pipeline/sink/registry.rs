use std::path::Path;

use crate::image_pipeline::common::error::{ConversionError, Result};
use crate::image_pipeline::format::types::ImageGeometry;
use crate::image_pipeline::sink::raw_sink::RawPlanarSink;
use crate::image_pipeline::sink::tiff_sink::TiffSink;
use crate::image_pipeline::sink::types::{SinkCapabilities, SinkConfig};
use crate::image_pipeline::sink::writer::{OutputSink, SinkFactory};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SinkKind {
    Tiff,
    RawPlanar,
}

/// Picks a sink by destination extension: `.tif`/`.tiff`/`.btf` produce
/// multi-page TIFF, `.raw` produces planar samples with a JSON sidecar.
#[derive(Debug, Clone, Default)]
pub struct SinkRegistry {
    config: SinkConfig,
}

impl SinkRegistry {
    pub fn new(config: SinkConfig) -> Self {
        Self { config }
    }

    fn kind(locator: &str) -> Result<SinkKind> {
        let ext = Path::new(locator)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "tif" | "tiff" | "btf" | "tf8" => Ok(SinkKind::Tiff),
            "raw" => Ok(SinkKind::RawPlanar),
            _ => Err(ConversionError::create(locator, format!("no writer for extension '{ext}'"))),
        }
    }
}

impl SinkFactory for SinkRegistry {
    fn create(
        &self,
        locator: &str,
        _geometry: &ImageGeometry,
        big_format_hint: bool,
    ) -> Result<Box<dyn OutputSink>> {
        match Self::kind(locator)? {
            SinkKind::Tiff => Ok(Box::new(TiffSink::create(locator, big_format_hint, &self.config)?)),
            SinkKind::RawPlanar => Ok(Box::new(RawPlanarSink::create(locator, big_format_hint)?)),
        }
    }

    fn capabilities(&self, locator: &str) -> Result<SinkCapabilities> {
        Ok(match Self::kind(locator)? {
            SinkKind::Tiff => TiffSink::capabilities_for(&self.config),
            SinkKind::RawPlanar => SinkCapabilities {
                tiled_write: true,
                big_format: false,
                stacks: true,
            },
        })
    }
}
