use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;

use serde::Serialize;
use tracing::debug;

use crate::image_pipeline::common::error::{ConversionError, Result};
use crate::image_pipeline::conversions::tiling::Tile;
use crate::image_pipeline::format::types::{ColorLookupTable, SeriesGeometry};
use crate::image_pipeline::sink::types::SinkCapabilities;
use crate::image_pipeline::sink::writer::OutputSink;

#[derive(Debug, Serialize)]
struct SeriesEntry {
    index: usize,
    /// Byte offset of the first plane in the data file
    offset: u64,
    geometry: SeriesGeometry,
    /// Palettes by plane, for planes that carried one
    color_tables: BTreeMap<usize, ColorLookupTable>,
}

#[derive(Debug, Serialize)]
struct Manifest {
    big_format: bool,
    series: Vec<SeriesEntry>,
}

/// Headerless planar output with a JSON sidecar.
///
/// Samples are stored exactly as read, plane after plane and series after
/// series. Tiles are placed by seeking to each of their rows, so a big plane
/// never has to be held in memory.
pub struct RawPlanarSink {
    path: PathBuf,
    manifest_path: PathBuf,
    file: Option<File>,
    manifest: Manifest,
    next_offset: u64,
    next_plane: usize,
    pending_table: Option<ColorLookupTable>,
}

impl RawPlanarSink {
    pub fn create(locator: &str, big_format: bool) -> Result<Self> {
        let path = PathBuf::from(locator);
        let manifest_path = PathBuf::from(format!("{locator}.json"));
        let file = File::create(&path).map_err(|e| ConversionError::create(locator, e))?;

        debug!("Created raw planar sink {}", locator);

        Ok(Self {
            path,
            manifest_path,
            file: Some(file),
            manifest: Manifest {
                big_format,
                series: Vec::new(),
            },
            next_offset: 0,
            next_plane: 0,
            pending_table: None,
        })
    }

    fn current_series(&self) -> Result<&SeriesEntry> {
        self.manifest
            .series
            .last()
            .ok_or_else(|| ConversionError::EncodeError("plane written before series".to_string()))
    }

    /// Checks ordering and records the pending palette when a plane starts.
    fn start_plane(&mut self, plane: usize, continuing: bool) -> Result<()> {
        let in_progress = continuing && self.next_plane > 0 && plane == self.next_plane - 1;
        if in_progress {
            return Ok(());
        }
        if plane != self.next_plane {
            return Err(ConversionError::EncodeError(format!(
                "planes must be written in order: expected {}, got {}",
                self.next_plane, plane
            )));
        }
        if let Some(table) = self.pending_table.take() {
            if let Some(series) = self.manifest.series.last_mut() {
                series.color_tables.insert(plane, table);
            }
        }
        self.next_plane += 1;
        Ok(())
    }

    fn write_rows(&mut self, plane: usize, tile: Tile, data: &[u8]) -> Result<()> {
        let series = self.current_series()?;
        let geometry = &series.geometry;
        if !tile.fits_within(geometry.width, geometry.height) {
            return Err(ConversionError::EncodeError(format!(
                "tile {}x{}+{}+{} outside {}x{} plane",
                tile.width, tile.height, tile.x, tile.y, geometry.width, geometry.height
            )));
        }
        if data.len() as u64 != geometry.region_bytes(tile.width, tile.height) {
            return Err(ConversionError::EncodeError(format!(
                "tile has {} bytes, expected {}",
                data.len(),
                geometry.region_bytes(tile.width, tile.height)
            )));
        }

        let (sample_planes, pixel_stride) = if geometry.interleaved || geometry.samples_per_pixel == 1 {
            (1u64, geometry.bytes_per_pixel())
        } else {
            (u64::from(geometry.samples_per_pixel), u64::from(geometry.bytes_per_sample))
        };
        let width = u64::from(geometry.width);
        let sample_plane_bytes = geometry.pixel_count() * pixel_stride;
        let plane_base = series.offset + plane as u64 * geometry.plane_bytes();
        let row_bytes = (u64::from(tile.width) * pixel_stride) as usize;

        let file = self
            .file
            .as_mut()
            .ok_or_else(|| ConversionError::EncodeError("raw sink is already closed".to_string()))?;

        let mut rows = data.chunks_exact(row_bytes);
        for sample in 0..sample_planes {
            for row in u64::from(tile.y)..tile.bottom() {
                let offset = plane_base
                    + sample * sample_plane_bytes
                    + (row * width + u64::from(tile.x)) * pixel_stride;
                let bytes = rows
                    .next()
                    .ok_or_else(|| ConversionError::EncodeError("tile data ended early".to_string()))?;
                file.seek(SeekFrom::Start(offset))?;
                file.write_all(bytes)?;
            }
        }
        Ok(())
    }
}

impl OutputSink for RawPlanarSink {
    fn capabilities(&self) -> SinkCapabilities {
        SinkCapabilities {
            tiled_write: true,
            big_format: false,
            stacks: true,
        }
    }

    fn begin_series(&mut self, series: usize, geometry: &SeriesGeometry) -> Result<()> {
        let offset = self.next_offset;
        self.next_offset += geometry.plane_bytes() * geometry.plane_count as u64;
        self.next_plane = 0;
        self.pending_table = None;
        self.manifest.series.push(SeriesEntry {
            index: series,
            offset,
            geometry: geometry.clone(),
            color_tables: BTreeMap::new(),
        });
        Ok(())
    }

    fn set_color_table(&mut self, table: Option<&ColorLookupTable>) -> Result<()> {
        self.pending_table = table.cloned();
        Ok(())
    }

    fn write_plane(&mut self, plane: usize, data: &[u8]) -> Result<()> {
        self.start_plane(plane, false)?;
        let geometry = &self.current_series()?.geometry;
        let full = Tile::full(geometry.width, geometry.height);
        self.write_rows(plane, full, data)
    }

    fn write_tile(&mut self, plane: usize, tile: Tile, data: &[u8]) -> Result<()> {
        self.start_plane(plane, true)?;
        self.write_rows(plane, tile, data)
    }

    fn finalize(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        let manifest = File::create(&self.manifest_path)?;
        serde_json::to_writer_pretty(manifest, &self.manifest)
            .map_err(|e| ConversionError::EncodeError(e.to_string()))?;
        debug!("Raw planar sink {} finalized", self.path.display());
        Ok(())
    }

    fn abort(&mut self) -> Result<()> {
        self.file = None;
        for path in [&self.path, &self.manifest_path] {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tiles_land_at_their_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.raw");
        let mut sink = RawPlanarSink::create(path.to_str().unwrap(), false).unwrap();

        sink.begin_series(0, &SeriesGeometry::gray(3, 2, 1, 1)).unwrap();
        sink.write_tile(0, Tile::new(2, 0, 1, 2), &[3, 6]).unwrap();
        sink.write_tile(0, Tile::new(0, 0, 2, 2), &[1, 2, 4, 5]).unwrap();
        sink.finalize().unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), vec![1, 2, 3, 4, 5, 6]);

        let manifest: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.path().join("out.raw.json")).unwrap()).unwrap();
        assert_eq!(manifest["series"][0]["geometry"]["width"], 3);
    }

    #[test]
    fn test_second_series_follows_first() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.raw");
        let mut sink = RawPlanarSink::create(path.to_str().unwrap(), false).unwrap();

        sink.begin_series(0, &SeriesGeometry::gray(2, 1, 2, 1)).unwrap();
        sink.write_plane(0, &[1, 1]).unwrap();
        sink.write_plane(1, &[2, 2]).unwrap();
        sink.begin_series(1, &SeriesGeometry::gray(1, 1, 1, 1)).unwrap();
        sink.write_plane(0, &[9]).unwrap();
        sink.finalize().unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), vec![1, 1, 2, 2, 9]);
    }

    #[test]
    fn test_color_table_recorded_for_its_plane_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.raw");
        let mut sink = RawPlanarSink::create(path.to_str().unwrap(), false).unwrap();
        let table = ColorLookupTable::Bits8 {
            red: vec![1],
            green: vec![2],
            blue: vec![3],
        };

        sink.begin_series(0, &SeriesGeometry::gray(1, 1, 2, 1)).unwrap();
        sink.set_color_table(Some(&table)).unwrap();
        sink.write_plane(0, &[0]).unwrap();
        sink.set_color_table(None).unwrap();
        sink.write_plane(1, &[0]).unwrap();

        let tables = &sink.manifest.series[0].color_tables;
        assert_eq!(tables.len(), 1);
        assert!(tables.contains_key(&0));
    }

    #[test]
    fn test_abort_removes_data_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.raw");
        let mut sink = RawPlanarSink::create(path.to_str().unwrap(), false).unwrap();
        sink.begin_series(0, &SeriesGeometry::gray(1, 1, 1, 1)).unwrap();
        sink.write_plane(0, &[1]).unwrap();

        sink.abort().unwrap();
        assert!(!path.exists());
    }
}
