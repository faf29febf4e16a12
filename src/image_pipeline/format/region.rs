//! Cropping helpers for readers that decode whole planes.

use crate::image_pipeline::common::error::{ConversionError, Result};
use crate::image_pipeline::conversions::tiling::Tile;
use crate::image_pipeline::format::types::SeriesGeometry;

/// Copies `region` out of a fully decoded plane.
///
/// Interleaved (or single-sample) planes are cropped row by row; planar
/// multi-sample planes are cropped one sample plane at a time, so the result
/// keeps the source layout.
pub fn crop_plane(plane: &[u8], geometry: &SeriesGeometry, region: Tile) -> Result<Vec<u8>> {
    if !region.fits_within(geometry.width, geometry.height) {
        return Err(ConversionError::DecodeError(format!(
            "region {}x{}+{}+{} outside {}x{} plane",
            region.width, region.height, region.x, region.y, geometry.width, geometry.height
        )));
    }
    if plane.len() as u64 != geometry.plane_bytes() {
        return Err(ConversionError::DecodeError(format!(
            "decoded plane has {} bytes, expected {}",
            plane.len(),
            geometry.plane_bytes()
        )));
    }

    let width = geometry.width as usize;
    let height = geometry.height as usize;
    let bps = geometry.bytes_per_sample as usize;
    let (sample_planes, pixel_stride) = if geometry.interleaved || geometry.samples_per_pixel == 1 {
        (1, geometry.bytes_per_pixel() as usize)
    } else {
        (geometry.samples_per_pixel as usize, bps)
    };

    let row_bytes = region.width as usize * pixel_stride;
    let mut out = Vec::with_capacity(row_bytes * region.height as usize * sample_planes);
    for sample in 0..sample_planes {
        let base = sample * width * height * pixel_stride;
        for row in region.y as usize..region.bottom() as usize {
            let start = base + (row * width + region.x as usize) * pixel_stride;
            out.extend_from_slice(&plane[start..start + row_bytes]);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crop_gray_region() {
        let geometry = SeriesGeometry::gray(4, 3, 1, 1);
        let plane: Vec<u8> = (0..12).collect();
        let out = crop_plane(&plane, &geometry, Tile::new(1, 1, 2, 2)).unwrap();
        assert_eq!(out, vec![5, 6, 9, 10]);
    }

    #[test]
    fn test_crop_planar_rgb_keeps_sample_planes() {
        let geometry = SeriesGeometry {
            samples_per_pixel: 3,
            ..SeriesGeometry::gray(2, 2, 1, 1)
        };
        let plane: Vec<u8> = (0..12).collect();
        let out = crop_plane(&plane, &geometry, Tile::new(1, 0, 1, 2)).unwrap();
        assert_eq!(out, vec![1, 3, 5, 7, 9, 11]);
    }

    #[test]
    fn test_crop_rejects_out_of_bounds() {
        let geometry = SeriesGeometry::gray(4, 4, 1, 2);
        let plane = vec![0u8; 32];
        let err = crop_plane(&plane, &geometry, Tile::new(3, 0, 2, 1)).unwrap_err();
        assert!(matches!(err, ConversionError::DecodeError(_)));
    }
}
