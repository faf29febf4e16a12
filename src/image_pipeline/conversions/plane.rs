use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::image_pipeline::common::error::{ConversionError, Result};
use crate::image_pipeline::conversions::timing::{PlaneTiming, Timer};
use crate::image_pipeline::conversions::tiling::{Tile, is_big_plane, plan_tiles};
use crate::image_pipeline::conversions::types::ConversionConfig;
use crate::image_pipeline::format::{FormatHandle, SeriesGeometry};
use crate::image_pipeline::sink::OutputSink;

/// Moves the pixels of single planes from a source handle to a sink.
pub struct PlaneConverter<'a> {
    source: &'a mut dyn FormatHandle,
    sink: &'a mut dyn OutputSink,
    config: &'a ConversionConfig,
    cancel: &'a CancellationToken,
}

impl<'a> PlaneConverter<'a> {
    pub fn new(
        source: &'a mut dyn FormatHandle,
        sink: &'a mut dyn OutputSink,
        config: &'a ConversionConfig,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            source,
            sink,
            config,
            cancel,
        }
    }

    /// Tile size for a series: the source's own layout if it has one,
    /// otherwise the configured default.
    pub fn tile_size(&self, geometry: &SeriesGeometry) -> (u32, u32) {
        match geometry.tile_size {
            Some((w, h)) if w > 0 && h > 0 => (w, h),
            _ => (self.config.tile_width, self.config.tile_height),
        }
    }

    /// Big planes are tiled, but only when the sink accepts tiles.
    pub fn should_tile(&self, geometry: &SeriesGeometry) -> bool {
        is_big_plane(geometry.width, geometry.height, self.config.big_image_threshold)
            && self.sink.capabilities().tiled_write
    }

    /// Tells the sink which series the following planes belong to.
    pub fn begin_series(&mut self, series: usize, geometry: &SeriesGeometry) -> Result<()> {
        self.sink.begin_series(series, geometry)
    }

    pub fn check_cancelled(&self, series: usize, plane: usize) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ConversionError::Cancelled { series, plane });
        }
        Ok(())
    }

    /// Converts `plane` of `series`, writing it as `destination_plane`.
    ///
    /// The plane's palette (or the absence of one) is installed on the sink
    /// before any of its pixels are written.
    pub fn convert_plane(
        &mut self,
        series: usize,
        geometry: &SeriesGeometry,
        plane: usize,
        destination_plane: usize,
    ) -> Result<PlaneTiming> {
        let mut timing = PlaneTiming::default();

        let timer = Timer::start();
        let table = self.source.color_table(series, plane)?;
        timing.read += timer.stop();

        let timer = Timer::start();
        self.sink.set_color_table(table.as_ref())?;
        timing.write += timer.stop();

        if !self.should_tile(geometry) {
            let region = Tile::full(geometry.width, geometry.height);

            let timer = Timer::start();
            let data = self.source.read_region(series, plane, region)?;
            timing.read += timer.stop();

            let timer = Timer::start();
            self.sink.write_plane(destination_plane, &data)?;
            timing.write += timer.stop();

            trace!(series, plane, bytes = data.len(), "Converted whole plane");
            return Ok(timing);
        }

        let (tile_width, tile_height) = self.tile_size(geometry);
        let tiles = plan_tiles(geometry.width, geometry.height, tile_width, tile_height)?;
        debug!(
            series,
            plane,
            tiles = tiles.len(),
            "Converting {}x{} plane in {}x{} tiles",
            geometry.width,
            geometry.height,
            tile_width,
            tile_height
        );

        for tile in tiles {
            self.check_cancelled(series, plane)?;

            let timer = Timer::start();
            let data = self.source.read_region(series, plane, tile)?;
            timing.read += timer.stop();

            let timer = Timer::start();
            self.sink.write_tile(destination_plane, tile, &data)?;
            timing.write += timer.stop();
        }

        Ok(timing)
    }
}
