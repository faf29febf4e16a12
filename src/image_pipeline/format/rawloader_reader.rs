//! Camera RAW source handle backed by the rawloader library.
//!
//! Any format rawloader can decode (ARW, CR2, NEF, DNG, RAF, ...) is exposed
//! as a single series holding a single 16-bit plane of sensor data.

use std::io::Cursor;

use rawloader::RawImageData as RawloaderImageData;
use tracing::debug;

use crate::image_pipeline::common::error::{ConversionError, Result};
use crate::image_pipeline::conversions::tiling::Tile;
use crate::image_pipeline::format::handle::FormatHandle;
use crate::image_pipeline::format::region::crop_plane;
use crate::image_pipeline::format::types::{ColorLookupTable, ImageGeometry, SeriesGeometry};

/// Default bit depth when no white level information is available from the RAW file.
const DEFAULT_BITS_PER_SAMPLE: u32 = 16;

/// The bit width of the u16 data type, used for calculating actual bits per sample.
const U16_BITS: u32 = 16;

pub struct RawCameraReader {
    geometry: SeriesGeometry,
    /// Little-endian sample bytes of the only plane.
    plane: Vec<u8>,
}

impl RawCameraReader {
    pub fn open(locator: &str) -> Result<Self> {
        let data = std::fs::read(locator).map_err(|e| ConversionError::open(locator, e))?;
        Self::from_bytes(&data).map_err(|e| ConversionError::open(locator, e))
    }

    /// Decodes a RAW file held in memory.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        debug!("Decoding RAW image, {} bytes", data.len());

        let decoded = rawloader::decode(&mut Cursor::new(data))
            .map_err(|e| ConversionError::DecodeError(e.to_string()))?;

        let width = u32::try_from(decoded.width)
            .map_err(|_| ConversionError::DecodeError(format!("width {} too large", decoded.width)))?;
        let height = u32::try_from(decoded.height)
            .map_err(|_| ConversionError::DecodeError(format!("height {} too large", decoded.height)))?;
        let samples_per_pixel = decoded.cpp as u32;

        // Float data is normalised to 0.0-1.0 and scaled to the u16 range
        let samples: Vec<u16> = match decoded.data {
            RawloaderImageData::Integer(values) => values,
            RawloaderImageData::Float(values) => {
                values.iter().map(|&v| (v * u16::MAX as f32) as u16).collect()
            }
        };

        // The white level is the largest value the sensor produces, which
        // gives its real bit depth (4095 -> 12 bits, 16383 -> 14 bits).
        let max_white_level = decoded.whitelevels.iter().max().copied().unwrap_or(u16::MAX);
        let bits_per_pixel = if max_white_level == 0 {
            DEFAULT_BITS_PER_SAMPLE
        } else {
            U16_BITS - max_white_level.leading_zeros()
        };

        debug!(
            "Decoded RAW image: {}x{}, {} samples per pixel, {} valid bits",
            width, height, samples_per_pixel, bits_per_pixel
        );

        let geometry = SeriesGeometry {
            bits_per_pixel,
            samples_per_pixel,
            interleaved: samples_per_pixel > 1,
            ..SeriesGeometry::gray(width, height, 1, 2)
        };

        let plane: Vec<u8> = samples.iter().flat_map(|v| v.to_le_bytes()).collect();
        if plane.len() as u64 != geometry.plane_bytes() {
            return Err(ConversionError::DecodeError(format!(
                "RAW data has {} samples for a {}x{}x{} image",
                samples.len(),
                width,
                height,
                samples_per_pixel
            )));
        }

        Ok(Self { geometry, plane })
    }
}

impl FormatHandle for RawCameraReader {
    fn format_name(&self) -> &str {
        "Camera RAW"
    }

    fn geometry(&self) -> Result<ImageGeometry> {
        Ok(ImageGeometry::new(vec![self.geometry.clone()]))
    }

    fn read_region(&mut self, series: usize, plane: usize, region: Tile) -> Result<Vec<u8>> {
        if series != 0 || plane != 0 {
            return Err(ConversionError::DecodeError(format!(
                "RAW source has a single plane, got series {series} plane {plane}"
            )));
        }
        crop_plane(&self.plane, &self.geometry, region)
    }

    fn color_table(&mut self, _series: usize, _plane: usize) -> Result<Option<ColorLookupTable>> {
        Ok(None)
    }

    fn close(&mut self) -> Result<()> {
        self.plane = Vec::new();
        Ok(())
    }
}
