use crate::image_pipeline::common::error::Result;
use crate::image_pipeline::conversions::tiling::Tile;
use crate::image_pipeline::format::types::{ColorLookupTable, ImageGeometry, SeriesGeometry};
use crate::image_pipeline::sink::types::SinkCapabilities;

/// Destination of a conversion.
///
/// Planes of a series must arrive in ascending order. After `finalize` or
/// `abort` the sink must not be used again.
pub trait OutputSink: Send {
    fn capabilities(&self) -> SinkCapabilities;

    /// Prepares the sink for the planes of `series`.
    fn begin_series(&mut self, series: usize, geometry: &SeriesGeometry) -> Result<()>;

    /// Installs the palette for the next plane, or clears it with `None`.
    fn set_color_table(&mut self, table: Option<&ColorLookupTable>) -> Result<()>;

    fn write_plane(&mut self, plane: usize, data: &[u8]) -> Result<()>;

    /// Writes one tile of `plane`. Only called when `tiled_write` is advertised.
    fn write_tile(&mut self, plane: usize, tile: Tile, data: &[u8]) -> Result<()>;

    /// Completes the output. Called once, after the last plane.
    fn finalize(&mut self) -> Result<()>;

    /// Discards partially written output after a failure.
    fn abort(&mut self) -> Result<()>;
}

/// Creates sinks for destination locators.
pub trait SinkFactory: Send + Sync {
    fn create(
        &self,
        locator: &str,
        geometry: &ImageGeometry,
        big_format_hint: bool,
    ) -> Result<Box<dyn OutputSink>>;

    /// Capabilities the sink for `locator` would have, used to plan a job
    /// before anything is created on disk.
    fn capabilities(&self, locator: &str) -> Result<SinkCapabilities>;
}
