//! TIFF source handle backed by the `tiff` crate decoder.
//!
//! Every IFD is one plane. Consecutive IFDs sharing width, height, colour
//! type and tile size are grouped into one series, which is how multi-page
//! microscopy TIFFs lay out their stacks.
//!
//! Regions are assembled from the strips or tiles they intersect, so a tile
//! of a huge plane never decodes the rest of it.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;

use tiff::ColorType;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::tags::Tag;
use tracing::{debug, trace};

use crate::image_pipeline::common::error::{ConversionError, Result};
use crate::image_pipeline::conversions::tiling::Tile;
use crate::image_pipeline::format::handle::FormatHandle;
use crate::image_pipeline::format::region::crop_plane;
use crate::image_pipeline::format::types::{ColorLookupTable, ImageGeometry, SeriesGeometry};

const PALETTE_PHOTOMETRIC: u32 = 3;
const PLANAR_SEPARATE: u32 = 2;

/// Decoded chunks kept across `read_region` calls on one IFD
const CHUNK_CACHE_BYTES: usize = 64 * 1024 * 1024;

struct SeriesLayout {
    geometry: SeriesGeometry,
    color: ColorType,
    /// Samples stored one plane after another, which `read_chunk` cannot split
    separate_planes: bool,
    first_ifd: usize,
}

/// Strips or tiles of the IFD read last. Neighbouring tiles often share a
/// strip, so the strip is decoded once per row of tiles.
#[derive(Default)]
struct ChunkCache {
    ifd: usize,
    chunks: HashMap<u32, Vec<u8>>,
    bytes: usize,
}

impl ChunkCache {
    fn get(&self, ifd: usize, index: u32) -> Option<&Vec<u8>> {
        if self.ifd != ifd {
            return None;
        }
        self.chunks.get(&index)
    }

    fn insert(&mut self, ifd: usize, index: u32, data: Vec<u8>) {
        if self.ifd != ifd || self.bytes + data.len() > CHUNK_CACHE_BYTES {
            self.clear();
            self.ifd = ifd;
        }
        self.bytes += data.len();
        self.chunks.insert(index, data);
    }

    fn clear(&mut self) {
        self.chunks.clear();
        self.bytes = 0;
    }
}

pub struct TiffFormatReader {
    decoder: Option<Decoder<BufReader<File>>>,
    series: Vec<SeriesLayout>,
    chunks: ChunkCache,
}

fn to_tiff_error(e: tiff::TiffError) -> ConversionError {
    ConversionError::DecodeError(e.to_string())
}

fn closed() -> ConversionError {
    ConversionError::DecodeError("TIFF source already closed".to_string())
}

fn sample_layout(color: ColorType) -> Option<(u32, u32)> {
    match color {
        ColorType::Gray(bits) | ColorType::Palette(bits) if bits == 8 || bits == 16 => {
            Some((u32::from(bits) / 8, 1))
        }
        ColorType::RGB(bits) if bits == 8 || bits == 16 => Some((u32::from(bits) / 8, 3)),
        _ => None,
    }
}

/// Decoded samples as little-endian bytes.
fn sample_bytes(result: DecodingResult, ifd: usize) -> Result<Vec<u8>> {
    match result {
        DecodingResult::U8(data) => Ok(data),
        DecodingResult::U16(data) => Ok(data.iter().flat_map(|v| v.to_le_bytes()).collect()),
        _ => Err(ConversionError::DecodeError(format!(
            "unsupported sample format in IFD {ifd}"
        ))),
    }
}

impl TiffFormatReader {
    pub fn open(locator: &str) -> Result<Self> {
        let file = File::open(locator).map_err(|e| ConversionError::open(locator, e))?;
        let mut decoder =
            Decoder::new(BufReader::new(file)).map_err(|e| ConversionError::open(locator, e))?;

        let mut series: Vec<SeriesLayout> = Vec::new();
        let mut ifd = 0usize;
        loop {
            let (width, height) = decoder.dimensions().map_err(|e| ConversionError::open(locator, e))?;
            let color = decoder.colortype().map_err(|e| ConversionError::open(locator, e))?;
            let (bytes_per_sample, samples_per_pixel) = sample_layout(color).ok_or_else(|| {
                ConversionError::open(locator, format!("unsupported colour type {color:?} in IFD {ifd}"))
            })?;
            let tile_size = Self::tile_size(&mut decoder);
            let separate_planes =
                samples_per_pixel > 1 && Self::planar_configuration(&mut decoder) == Some(PLANAR_SEPARATE);

            let layout = SeriesLayout {
                geometry: SeriesGeometry {
                    samples_per_pixel,
                    interleaved: samples_per_pixel > 1,
                    tile_size,
                    ..SeriesGeometry::gray(width, height, 1, bytes_per_sample)
                },
                color,
                separate_planes,
                first_ifd: ifd,
            };

            match series.last_mut() {
                Some(last) if Self::same_layout(last, &layout) => {
                    last.geometry.plane_count += 1;
                    last.geometry.size_z += 1;
                }
                _ => series.push(layout),
            }

            if !decoder.more_images() {
                break;
            }
            decoder.next_image().map_err(|e| ConversionError::open(locator, e))?;
            ifd += 1;
        }

        debug!("Opened TIFF {}: {} IFDs in {} series", locator, ifd + 1, series.len());

        Ok(Self {
            decoder: Some(decoder),
            series,
            chunks: ChunkCache::default(),
        })
    }

    fn same_layout(a: &SeriesLayout, b: &SeriesLayout) -> bool {
        a.color == b.color
            && a.separate_planes == b.separate_planes
            && a.geometry.width == b.geometry.width
            && a.geometry.height == b.geometry.height
            && a.geometry.tile_size == b.geometry.tile_size
    }

    fn tile_size(decoder: &mut Decoder<BufReader<File>>) -> Option<(u32, u32)> {
        let width = decoder.find_tag(Tag::TileWidth).ok()??.into_u32().ok()?;
        let length = decoder.find_tag(Tag::TileLength).ok()??.into_u32().ok()?;
        Some((width, length))
    }

    fn planar_configuration(decoder: &mut Decoder<BufReader<File>>) -> Option<u32> {
        decoder.find_tag(Tag::PlanarConfiguration).ok()??.into_u32().ok()
    }

    fn layout(&self, series: usize, plane: usize) -> Result<(usize, &SeriesLayout)> {
        let layout = self.series.get(series).ok_or_else(|| {
            ConversionError::DecodeError(format!("series {series} does not exist"))
        })?;
        if plane >= layout.geometry.plane_count {
            return Err(ConversionError::DecodeError(format!(
                "plane {plane} does not exist in series {series}"
            )));
        }
        Ok((layout.first_ifd + plane, layout))
    }

    /// Copies `region` out of the chunks of the current IFD that it touches.
    fn read_chunks(&mut self, ifd: usize, geometry: &SeriesGeometry, region: Tile) -> Result<Vec<u8>> {
        let decoder = self.decoder.as_mut().ok_or_else(closed)?;
        let cache = &mut self.chunks;

        let (chunk_width, chunk_height) = decoder.chunk_dimensions();
        if chunk_width == 0 || chunk_height == 0 {
            return Err(ConversionError::DecodeError(format!("IFD {ifd} has empty chunks")));
        }
        let (chunk_width, chunk_height) = (u64::from(chunk_width), u64::from(chunk_height));
        let across = u64::from(geometry.width).div_ceil(chunk_width);

        let pixel = geometry.bytes_per_pixel() as usize;
        let row_bytes = region.width as usize * pixel;
        let mut out = vec![0u8; row_bytes * region.height as usize];

        let (left, top) = (u64::from(region.x), u64::from(region.y));
        for row in top / chunk_height..=(region.bottom() - 1) / chunk_height {
            for column in left / chunk_width..=(region.right() - 1) / chunk_width {
                let index = u32::try_from(row * across + column)
                    .map_err(|_| ConversionError::DecodeError(format!("chunk index overflow in IFD {ifd}")))?;
                let (data_width, data_height) = decoder.chunk_data_dimensions(index);
                let (data_width, data_height) = (u64::from(data_width), u64::from(data_height));

                if cache.get(ifd, index).is_none() {
                    trace!(ifd, chunk = index, "Decoding chunk");
                    let data = sample_bytes(decoder.read_chunk(index).map_err(to_tiff_error)?, ifd)?;
                    cache.insert(ifd, index, data);
                }
                let chunk = cache
                    .get(ifd, index)
                    .ok_or_else(|| ConversionError::DecodeError(format!("chunk {index} of IFD {ifd} missing")))?;

                let stride = data_width as usize * pixel;
                if chunk.len() < stride * data_height as usize {
                    return Err(ConversionError::DecodeError(format!(
                        "chunk {index} of IFD {ifd} has {} bytes, expected {}",
                        chunk.len(),
                        stride * data_height as usize
                    )));
                }

                let (chunk_x, chunk_y) = (column * chunk_width, row * chunk_height);
                let x0 = left.max(chunk_x);
                let x1 = region.right().min(chunk_x + data_width);
                let y0 = top.max(chunk_y);
                let y1 = region.bottom().min(chunk_y + data_height);
                if x0 >= x1 || y0 >= y1 {
                    continue;
                }

                let span = (x1 - x0) as usize * pixel;
                for y in y0..y1 {
                    let src = (y - chunk_y) as usize * stride + (x0 - chunk_x) as usize * pixel;
                    let dst = (y - top) as usize * row_bytes + (x0 - left) as usize * pixel;
                    out[dst..dst + span].copy_from_slice(&chunk[src..src + span]);
                }
            }
        }
        Ok(out)
    }
}

impl FormatHandle for TiffFormatReader {
    fn format_name(&self) -> &str {
        "TIFF"
    }

    fn geometry(&self) -> Result<ImageGeometry> {
        Ok(ImageGeometry::new(
            self.series.iter().map(|s| s.geometry.clone()).collect(),
        ))
    }

    fn read_region(&mut self, series: usize, plane: usize, region: Tile) -> Result<Vec<u8>> {
        let (ifd, layout) = self.layout(series, plane)?;
        let geometry = layout.geometry.clone();
        let separate_planes = layout.separate_planes;
        if !region.fits_within(geometry.width, geometry.height) {
            return Err(ConversionError::DecodeError(format!(
                "region {}x{}+{}+{} outside {}x{} plane",
                region.width, region.height, region.x, region.y, geometry.width, geometry.height
            )));
        }

        let decoder = self.decoder.as_mut().ok_or_else(closed)?;
        decoder.seek_to_image(ifd).map_err(to_tiff_error)?;

        if region == Tile::full(geometry.width, geometry.height) || separate_planes {
            let plane_bytes = sample_bytes(decoder.read_image().map_err(to_tiff_error)?, ifd)?;
            return crop_plane(&plane_bytes, &geometry, region);
        }
        self.read_chunks(ifd, &geometry, region)
    }

    fn color_table(&mut self, series: usize, plane: usize) -> Result<Option<ColorLookupTable>> {
        let (ifd, layout) = self.layout(series, plane)?;
        let sample_bits = layout.geometry.bytes_per_sample * 8;

        let decoder = self.decoder.as_mut().ok_or_else(closed)?;
        decoder.seek_to_image(ifd).map_err(to_tiff_error)?;
        let photometric = decoder
            .find_tag(Tag::PhotometricInterpretation)
            .map_err(to_tiff_error)?
            .map(|v| v.into_u32())
            .transpose()
            .map_err(to_tiff_error)?;
        if photometric != Some(PALETTE_PHOTOMETRIC) {
            return Ok(None);
        }

        let map = decoder.get_tag_u16_vec(Tag::ColorMap).map_err(to_tiff_error)?;
        Ok(ColorLookupTable::from_color_map(&map, sample_bits))
    }

    fn close(&mut self) -> Result<()> {
        self.decoder = None;
        self.chunks.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiff::encoder::{TiffEncoder, colortype};

    fn gray8(width: u32, height: u32) -> Vec<u8> {
        (0..width * height).map(|i| (i * 7 % 251) as u8).collect()
    }

    fn write_gray8(path: &std::path::Path, width: u32, height: u32, rows_per_strip: u32, pages: usize) {
        let mut encoder = TiffEncoder::new(File::create(path).unwrap()).unwrap();
        for _ in 0..pages {
            let mut image = encoder.new_image::<colortype::Gray8>(width, height).unwrap();
            image.rows_per_strip(rows_per_strip).unwrap();
            image.write_data(&gray8(width, height)).unwrap();
        }
    }

    #[test]
    fn test_region_across_strip_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strips.tif");
        let (width, height) = (37u32, 23u32);
        write_gray8(&path, width, height, 4, 1);

        let mut reader = TiffFormatReader::open(path.to_str().unwrap()).unwrap();
        let geometry = reader.geometry().unwrap().series[0].clone();
        let region = Tile::new(5, 3, 20, 11);
        let expected = crop_plane(&gray8(width, height), &geometry, region).unwrap();

        assert_eq!(reader.read_region(0, 0, region).unwrap(), expected);
        // Rows 3..14 touch strips 0..=3 only
        assert_eq!(reader.chunks.chunks.len(), 4);
        assert!(reader.chunks.chunks.keys().all(|&index| index <= 3));
    }

    #[test]
    fn test_neighbouring_regions_share_decoded_strips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strips.tif");
        let (width, height) = (16u32, 16u32);
        write_gray8(&path, width, height, 8, 1);

        let mut reader = TiffFormatReader::open(path.to_str().unwrap()).unwrap();
        let geometry = reader.geometry().unwrap().series[0].clone();
        let plane = gray8(width, height);
        for region in [Tile::new(0, 0, 8, 8), Tile::new(8, 0, 8, 8), Tile::new(8, 8, 8, 8)] {
            let expected = crop_plane(&plane, &geometry, region).unwrap();
            assert_eq!(reader.read_region(0, 0, region).unwrap(), expected);
        }
        assert_eq!(reader.chunks.chunks.len(), 2);
    }

    #[test]
    fn test_full_plane_and_second_page() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pages.tif");
        write_gray8(&path, 9, 5, 2, 3);

        let mut reader = TiffFormatReader::open(path.to_str().unwrap()).unwrap();
        let geometry = reader.geometry().unwrap();
        assert_eq!(geometry.series.len(), 1);
        assert_eq!(geometry.series[0].plane_count, 3);

        assert_eq!(reader.read_region(0, 2, Tile::full(9, 5)).unwrap(), gray8(9, 5));
        assert!(reader.read_region(0, 3, Tile::full(9, 5)).is_err());
        assert!(reader.read_region(0, 0, Tile::new(5, 0, 5, 5)).is_err());
    }

    fn layout(color: ColorType, tile_size: Option<(u32, u32)>) -> SeriesLayout {
        SeriesLayout {
            geometry: SeriesGeometry {
                tile_size,
                ..SeriesGeometry::gray(64, 64, 1, 1)
            },
            color,
            separate_planes: false,
            first_ifd: 0,
        }
    }

    #[test]
    fn test_series_break_on_colour_type_or_tile_size() {
        let gray = layout(ColorType::Gray(8), None);
        assert!(TiffFormatReader::same_layout(&gray, &layout(ColorType::Gray(8), None)));
        assert!(!TiffFormatReader::same_layout(&gray, &layout(ColorType::Palette(8), None)));
        assert!(!TiffFormatReader::same_layout(&gray, &layout(ColorType::Gray(8), Some((16, 16)))));
        assert!(!TiffFormatReader::same_layout(
            &layout(ColorType::Gray(8), Some((16, 16))),
            &layout(ColorType::Gray(8), Some((32, 16)))
        ));
    }

    #[test]
    fn test_pages_of_new_size_start_a_new_series() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mixed.tif");
        {
            let mut encoder = TiffEncoder::new(File::create(&path).unwrap()).unwrap();
            encoder.write_image::<colortype::Gray8>(4, 4, &gray8(4, 4)).unwrap();
            encoder.write_image::<colortype::Gray8>(4, 4, &gray8(4, 4)).unwrap();
            encoder.write_image::<colortype::Gray8>(6, 2, &gray8(6, 2)).unwrap();
        }

        let mut reader = TiffFormatReader::open(path.to_str().unwrap()).unwrap();
        let geometry = reader.geometry().unwrap();
        assert_eq!(geometry.series.len(), 2);
        assert_eq!(geometry.series[0].plane_count, 2);
        assert_eq!((geometry.series[1].width, geometry.series[1].height), (6, 2));
        assert_eq!(reader.read_region(1, 0, Tile::full(6, 2)).unwrap(), gray8(6, 2));
        assert!(reader.color_table(0, 1).unwrap().is_none());
    }

    #[test]
    fn test_closed_reader_refuses_reads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("closed.tif");
        write_gray8(&path, 4, 4, 4, 1);

        let mut reader = TiffFormatReader::open(path.to_str().unwrap()).unwrap();
        reader.close().unwrap();
        assert!(matches!(
            reader.read_region(0, 0, Tile::full(4, 4)),
            Err(ConversionError::DecodeError(_))
        ));
    }
}
