use std::fs::File;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread::JoinHandle;

use tiff::encoder::colortype::{self, ColorType as EncoderColor};
use tiff::encoder::compression::DeflateLevel;
use tiff::encoder::{Compression, TiffEncoder, TiffKind, TiffValue};
use tiff::tags::{PhotometricInterpretation, Predictor, Tag};
use tracing::{debug, warn};

use crate::image_pipeline::common::error::{ConversionError, Result};
use crate::image_pipeline::conversions::tiling::Tile;
use crate::image_pipeline::format::types::{ColorLookupTable, SeriesGeometry};
use crate::image_pipeline::sink::types::{SinkCapabilities, SinkConfig, TiffCompression};
use crate::image_pipeline::sink::writer::OutputSink;

/// Pixel layouts the encoder can store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    Gray8,
    Gray16,
    Rgb8,
    Rgb16,
}

impl Layout {
    fn of(geometry: &SeriesGeometry) -> Result<Self> {
        match (geometry.bytes_per_sample, geometry.samples_per_pixel) {
            (1, 1) => Ok(Self::Gray8),
            (2, 1) => Ok(Self::Gray16),
            (1, 3) => Ok(Self::Rgb8),
            (2, 3) => Ok(Self::Rgb16),
            (bytes, samples) => Err(ConversionError::EncodeError(format!(
                "TIFF sink cannot store {} samples of {} bits",
                samples,
                bytes * 8
            ))),
        }
    }
}

enum Samples {
    U8(Vec<u8>),
    U16(Vec<u16>),
}

/// Sample types the encoder thread accepts from `Samples`.
trait SampleVec: Sized {
    fn take(samples: Samples) -> Option<Vec<Self>>;
}

impl SampleVec for u8 {
    fn take(samples: Samples) -> Option<Vec<Self>> {
        match samples {
            Samples::U8(data) => Some(data),
            Samples::U16(_) => None,
        }
    }
}

impl SampleVec for u16 {
    fn take(samples: Samples) -> Option<Vec<Self>> {
        match samples {
            Samples::U16(data) => Some(data),
            Samples::U8(_) => None,
        }
    }
}

struct PlaneHeader {
    width: u32,
    height: u32,
    layout: Layout,
    color_map: Option<Vec<u16>>,
}

enum Command {
    /// A complete plane, encoded with the configured compression
    Whole(PlaneHeader, Samples),
    /// Opens a plane whose strips follow as `Band` commands
    Begin { header: PlaneHeader, rows_per_strip: u32 },
    Band(Samples),
}

/// A tiled plane being assembled one tile row at a time.
struct BandAssembly {
    plane: usize,
    band_y: u32,
    band_height: u32,
    /// Columns of the current band already filled, from the left
    filled: u32,
    data: Vec<u8>,
}

/// Multi-page TIFF output: one IFD per plane, written sequentially.
///
/// The encoder lives on its own thread, fed through a channel holding at
/// most one pending band. Tiles are collected into a band of one tile row
/// and each complete band is written as one strip. Strips are stored
/// uncompressed, so tiles are only accepted when compression is off.
pub struct TiffSink {
    path: PathBuf,
    file: File,
    commands: Option<SyncSender<Command>>,
    worker: Option<JoinHandle<Result<()>>>,
    capabilities: SinkCapabilities,
    series: Option<SeriesGeometry>,
    next_plane: usize,
    color_map: Option<Vec<u16>>,
    band: Option<BandAssembly>,
    planes_written: usize,
}

fn encode_error(e: tiff::TiffError) -> ConversionError {
    ConversionError::EncodeError(e.to_string())
}

fn compression(config: &SinkConfig) -> Compression {
    match config.compression {
        TiffCompression::None => Compression::Uncompressed,
        TiffCompression::Lzw => Compression::Lzw,
        TiffCompression::DeflateFast => Compression::Deflate(DeflateLevel::Fast),
        TiffCompression::DeflateBalanced => Compression::Deflate(DeflateLevel::Balanced),
        TiffCompression::DeflateBest => Compression::Deflate(DeflateLevel::Best),
    }
}

fn predictor(config: &SinkConfig) -> Predictor {
    match config.predictor {
        Some(2) => Predictor::Horizontal,
        _ => Predictor::None,
    }
}

fn write_palette<K: TiffKind>(
    image: &mut tiff::encoder::DirectoryEncoder<'_, File, K>,
    color_map: Option<&[u16]>,
) -> tiff::TiffResult<()> {
    if let Some(map) = color_map {
        image.write_tag(
            Tag::PhotometricInterpretation,
            PhotometricInterpretation::RGBPalette.to_u16(),
        )?;
        image.write_tag(Tag::ColorMap, map)?;
    }
    Ok(())
}

fn encode_plane<K: TiffKind, C: EncoderColor>(
    encoder: &mut TiffEncoder<File, K>,
    header: &PlaneHeader,
    samples: Samples,
) -> Result<()>
where
    C::Inner: SampleVec,
    [C::Inner]: TiffValue,
{
    let data = C::Inner::take(samples)
        .ok_or_else(|| ConversionError::EncodeError("sample width does not match the plane".to_string()))?;
    let mut image = encoder.new_image::<C>(header.width, header.height).map_err(encode_error)?;
    write_palette(image.encoder(), header.color_map.as_deref()).map_err(encode_error)?;
    image.write_data(&data).map_err(encode_error)
}

fn stream_plane<K: TiffKind, C: EncoderColor>(
    encoder: &mut TiffEncoder<File, K>,
    header: &PlaneHeader,
    rows_per_strip: u32,
    commands: &Receiver<Command>,
) -> Result<()>
where
    C::Inner: SampleVec,
    [C::Inner]: TiffValue,
{
    let mut image = encoder.new_image::<C>(header.width, header.height).map_err(encode_error)?;
    write_palette(image.encoder(), header.color_map.as_deref()).map_err(encode_error)?;
    image.rows_per_strip(rows_per_strip).map_err(encode_error)?;

    while image.next_strip_sample_count() > 0 {
        let samples = match commands.recv() {
            Ok(Command::Band(samples)) => C::Inner::take(samples)
                .ok_or_else(|| ConversionError::EncodeError("sample width does not match the plane".to_string()))?,
            Ok(_) => return Err(ConversionError::EncodeError("plane ended before its last band".to_string())),
            Err(_) => return Err(ConversionError::EncodeError("sink closed in the middle of a plane".to_string())),
        };
        image.write_strip(&samples).map_err(encode_error)?;
    }
    image.finish().map_err(encode_error)
}

fn run_encoder<K: TiffKind>(mut encoder: TiffEncoder<File, K>, commands: Receiver<Command>) -> Result<()> {
    while let Ok(command) = commands.recv() {
        match command {
            Command::Whole(header, samples) => match header.layout {
                Layout::Gray8 => encode_plane::<_, colortype::Gray8>(&mut encoder, &header, samples)?,
                Layout::Gray16 => encode_plane::<_, colortype::Gray16>(&mut encoder, &header, samples)?,
                Layout::Rgb8 => encode_plane::<_, colortype::RGB8>(&mut encoder, &header, samples)?,
                Layout::Rgb16 => encode_plane::<_, colortype::RGB16>(&mut encoder, &header, samples)?,
            },
            Command::Begin { header, rows_per_strip } => match header.layout {
                Layout::Gray8 => stream_plane::<_, colortype::Gray8>(&mut encoder, &header, rows_per_strip, &commands)?,
                Layout::Gray16 => stream_plane::<_, colortype::Gray16>(&mut encoder, &header, rows_per_strip, &commands)?,
                Layout::Rgb8 => stream_plane::<_, colortype::RGB8>(&mut encoder, &header, rows_per_strip, &commands)?,
                Layout::Rgb16 => stream_plane::<_, colortype::RGB16>(&mut encoder, &header, rows_per_strip, &commands)?,
            },
            Command::Band(_) => {
                return Err(ConversionError::EncodeError("band received outside a tiled plane".to_string()));
            }
        }
    }
    Ok(())
}

/// Reassembles samples from `bytes` honouring the source byte order.
fn to_u16_samples(bytes: &[u8], little_endian: bool) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|pair| {
            let pair = [pair[0], pair[1]];
            if little_endian {
                u16::from_le_bytes(pair)
            } else {
                u16::from_be_bytes(pair)
            }
        })
        .collect()
}

/// Turns channel-planar samples (RRR..GGG..BBB..) into interleaved RGBRGB.
fn interleave<T: Copy>(planar: &[T], samples_per_pixel: usize) -> Vec<T> {
    let pixels = planar.len() / samples_per_pixel;
    (0..pixels)
        .flat_map(|p| (0..samples_per_pixel).map(move |s| planar[s * pixels + p]))
        .collect()
}

/// Converts source bytes of a region into interleaved encoder samples.
fn to_samples(data: &[u8], geometry: &SeriesGeometry) -> Samples {
    let spp = geometry.samples_per_pixel as usize;
    let planar = spp > 1 && !geometry.interleaved;
    if geometry.bytes_per_sample == 2 {
        let samples = to_u16_samples(data, geometry.little_endian);
        Samples::U16(if planar { interleave(&samples, spp) } else { samples })
    } else if planar {
        Samples::U8(interleave(data, spp))
    } else {
        Samples::U8(data.to_vec())
    }
}

impl TiffSink {
    pub fn create(locator: &str, big_format: bool, config: &SinkConfig) -> Result<Self> {
        let path = PathBuf::from(locator);
        let file = File::create(&path).map_err(|e| ConversionError::create(locator, e))?;
        let writer = file.try_clone().map_err(|e| ConversionError::create(locator, e))?;

        let (commands, receiver) = mpsc::sync_channel(1);
        let thread = std::thread::Builder::new().name("tiff-encoder".to_string());
        let worker = if big_format {
            let encoder = TiffEncoder::new_big(writer)
                .map_err(|e| ConversionError::create(locator, e))?
                .with_compression(compression(config))
                .with_predictor(predictor(config));
            thread.spawn(move || run_encoder(encoder, receiver))
        } else {
            let encoder = TiffEncoder::new(writer)
                .map_err(|e| ConversionError::create(locator, e))?
                .with_compression(compression(config))
                .with_predictor(predictor(config));
            thread.spawn(move || run_encoder(encoder, receiver))
        }
        .map_err(|e| ConversionError::create(locator, e))?;

        debug!("Created TIFF sink {} (BigTIFF: {})", locator, big_format);

        Ok(Self {
            path,
            file,
            commands: Some(commands),
            worker: Some(worker),
            capabilities: Self::capabilities_for(config),
            series: None,
            next_plane: 0,
            color_map: None,
            band: None,
            planes_written: 0,
        })
    }

    /// Capabilities of a TIFF sink built with `config`.
    pub fn capabilities_for(config: &SinkConfig) -> SinkCapabilities {
        SinkCapabilities {
            tiled_write: config.compression == TiffCompression::None,
            big_format: true,
            stacks: true,
        }
    }

    pub fn planes_written(&self) -> usize {
        self.planes_written
    }

    fn series(&self) -> Result<SeriesGeometry> {
        self.series
            .clone()
            .ok_or_else(|| ConversionError::EncodeError("plane written before series".to_string()))
    }

    fn header(&self, geometry: &SeriesGeometry) -> Result<PlaneHeader> {
        Ok(PlaneHeader {
            width: geometry.width,
            height: geometry.height,
            layout: Layout::of(geometry)?,
            color_map: self.color_map.clone(),
        })
    }

    fn check_order(&self, plane: usize) -> Result<()> {
        if plane != self.next_plane {
            return Err(ConversionError::EncodeError(format!(
                "planes must be written in order: expected {}, got {}",
                self.next_plane, plane
            )));
        }
        Ok(())
    }

    /// Hands a command to the encoder thread, surfacing its error if it stopped.
    fn send(&mut self, command: Command) -> Result<()> {
        let sent = match &self.commands {
            Some(commands) => commands.send(command).is_ok(),
            None => {
                return Err(ConversionError::EncodeError(format!(
                    "TIFF sink {} is already closed",
                    self.path.display()
                )));
            }
        };
        if sent {
            return Ok(());
        }
        self.join_encoder()?;
        Err(ConversionError::EncodeError("TIFF encoder stopped unexpectedly".to_string()))
    }

    fn join_encoder(&mut self) -> Result<()> {
        self.commands = None;
        match self.worker.take() {
            Some(worker) => worker
                .join()
                .map_err(|_| ConversionError::EncodeError("TIFF encoder thread panicked".to_string()))?,
            None => Ok(()),
        }
    }

    fn plane_done(&mut self) {
        self.next_plane += 1;
        self.planes_written += 1;
    }
}

impl OutputSink for TiffSink {
    fn capabilities(&self) -> SinkCapabilities {
        self.capabilities
    }

    fn begin_series(&mut self, series: usize, geometry: &SeriesGeometry) -> Result<()> {
        if self.band.is_some() {
            return Err(ConversionError::EncodeError("series started before the tiled plane was complete".to_string()));
        }
        Layout::of(geometry)?;
        debug!(
            "TIFF sink series {}: {}x{}, {} valid bits",
            series, geometry.width, geometry.height, geometry.bits_per_pixel
        );
        self.series = Some(geometry.clone());
        self.next_plane = 0;
        Ok(())
    }

    fn set_color_table(&mut self, table: Option<&ColorLookupTable>) -> Result<()> {
        let geometry = self
            .series
            .as_ref()
            .ok_or_else(|| ConversionError::EncodeError("colour table set before series".to_string()))?;

        self.color_map = match table {
            Some(table) if geometry.samples_per_pixel == 1 => {
                Some(table.to_color_map(geometry.bytes_per_sample * 8))
            }
            Some(_) => {
                warn!("Ignoring colour table on a {}-sample series", geometry.samples_per_pixel);
                None
            }
            None => None,
        };
        Ok(())
    }

    fn write_plane(&mut self, plane: usize, data: &[u8]) -> Result<()> {
        let geometry = self.series()?;
        self.check_order(plane)?;
        if self.band.is_some() {
            return Err(ConversionError::EncodeError("previous tiled plane is incomplete".to_string()));
        }
        if data.len() as u64 != geometry.plane_bytes() {
            return Err(ConversionError::EncodeError(format!(
                "plane {} has {} bytes, expected {}",
                plane,
                data.len(),
                geometry.plane_bytes()
            )));
        }

        let header = self.header(&geometry)?;
        self.send(Command::Whole(header, to_samples(data, &geometry)))?;
        self.plane_done();
        Ok(())
    }

    fn write_tile(&mut self, plane: usize, tile: Tile, data: &[u8]) -> Result<()> {
        if !self.capabilities.tiled_write {
            return Err(ConversionError::EncodeError(format!(
                "compressed TIFF output takes whole planes only (plane {}, tile at {},{})",
                plane, tile.x, tile.y
            )));
        }
        let geometry = self.series()?;
        self.check_order(plane)?;
        if !tile.fits_within(geometry.width, geometry.height) {
            return Err(ConversionError::EncodeError(format!("tile {tile:?} lies outside the plane")));
        }
        let bytes_per_pixel = geometry.bytes_per_pixel() as usize;
        if data.len() as u64 != geometry.region_bytes(tile.width, tile.height) {
            return Err(ConversionError::EncodeError(format!(
                "tile at {},{} has {} bytes, expected {}",
                tile.x,
                tile.y,
                data.len(),
                geometry.region_bytes(tile.width, tile.height)
            )));
        }

        if self.band.is_none() {
            if tile.x != 0 || tile.y != 0 {
                return Err(ConversionError::EncodeError(format!(
                    "plane {plane} must start with the top-left tile"
                )));
            }
            let header = self.header(&geometry)?;
            self.send(Command::Begin {
                header,
                rows_per_strip: tile.height,
            })?;
            self.band = Some(BandAssembly {
                plane,
                band_y: 0,
                band_height: tile.height,
                filled: 0,
                data: vec![0; geometry.region_bytes(geometry.width, tile.height) as usize],
            });
        }

        let band = match self.band.as_mut() {
            Some(band) => band,
            None => return Err(ConversionError::EncodeError("no tiled plane in progress".to_string())),
        };
        if band.plane != plane || tile.y != band.band_y || tile.x != band.filled || tile.height != band.band_height {
            return Err(ConversionError::EncodeError(format!(
                "tiles must arrive row by row: expected {},{} ({} rows), got {},{} ({} rows)",
                band.filled, band.band_y, band.band_height, tile.x, tile.y, tile.height
            )));
        }

        // Planar sources arrive channel by channel; the band is kept interleaved.
        let spp = geometry.samples_per_pixel as usize;
        let interleaved;
        let rows: &[u8] = if spp > 1 && !geometry.interleaved {
            let sample_bytes = geometry.bytes_per_sample as usize;
            let units: Vec<&[u8]> = data.chunks_exact(sample_bytes).collect();
            interleaved = interleave(&units, spp).concat();
            &interleaved
        } else {
            data
        };

        let band_stride = geometry.width as usize * bytes_per_pixel;
        let tile_stride = tile.width as usize * bytes_per_pixel;
        let x_offset = tile.x as usize * bytes_per_pixel;
        for (row, source) in rows.chunks_exact(tile_stride).enumerate() {
            let start = row * band_stride + x_offset;
            band.data[start..start + tile_stride].copy_from_slice(source);
        }
        band.filled += tile.width;

        if band.filled < geometry.width {
            return Ok(());
        }

        let band_bytes = std::mem::take(&mut band.data);
        let next_y = band.band_y + band.band_height;
        if next_y >= geometry.height {
            self.band = None;
        } else {
            let next_height = band.band_height.min(geometry.height - next_y);
            band.band_y = next_y;
            band.band_height = next_height;
            band.filled = 0;
            band.data = vec![0; geometry.region_bytes(geometry.width, next_height) as usize];
        }

        let interleaved_geometry = SeriesGeometry {
            interleaved: true,
            ..geometry
        };
        self.send(Command::Band(to_samples(&band_bytes, &interleaved_geometry)))?;
        if self.band.is_none() {
            self.plane_done();
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        if let Some(band) = &self.band {
            return Err(ConversionError::EncodeError(format!(
                "plane {} ended at row {} of a tiled write",
                band.plane, band.band_y
            )));
        }
        self.join_encoder()?;
        self.file.sync_all()?;
        debug!("TIFF sink {} finalized with {} planes", self.path.display(), self.planes_written);
        Ok(())
    }

    fn abort(&mut self) -> Result<()> {
        self.band = None;
        if let Err(e) = self.join_encoder() {
            debug!("TIFF encoder stopped with: {}", e);
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for TiffSink {
    fn drop(&mut self) {
        if self.worker.is_some() {
            let _ = self.join_encoder();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_pipeline::conversions::tiling::plan_tiles;
    use tiff::decoder::{Decoder, DecodingResult};

    fn sink(dir: &tempfile::TempDir, config: &SinkConfig) -> (TiffSink, PathBuf) {
        let path = dir.path().join("out.tif");
        let sink = TiffSink::create(path.to_str().unwrap(), false, config).unwrap();
        (sink, path)
    }

    #[test]
    fn test_interleave_planar_rgb() {
        let planar = [1u8, 2, 10, 20, 100, 200];
        assert_eq!(interleave(&planar, 3), vec![1, 10, 100, 2, 20, 200]);
    }

    #[test]
    fn test_u16_samples_respect_byte_order() {
        assert_eq!(to_u16_samples(&[0x01, 0x02], true), vec![0x0201]);
        assert_eq!(to_u16_samples(&[0x01, 0x02], false), vec![0x0102]);
    }

    #[test]
    fn test_writes_pages_readable_by_decoder() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sink, path) = sink(&dir, &SinkConfig::default());

        let geometry = SeriesGeometry::gray(4, 2, 2, 2);
        sink.begin_series(0, &geometry).unwrap();
        sink.set_color_table(None).unwrap();
        sink.write_plane(0, &[0u8; 16]).unwrap();
        sink.set_color_table(None).unwrap();
        sink.write_plane(1, &[1u8; 16]).unwrap();
        sink.finalize().unwrap();

        let mut decoder = Decoder::new(File::open(&path).unwrap()).unwrap();
        assert_eq!(decoder.dimensions().unwrap(), (4, 2));
        assert!(decoder.more_images());
        decoder.next_image().unwrap();
        match decoder.read_image().unwrap() {
            DecodingResult::U16(data) => assert!(data.iter().all(|&v| v == 0x0101)),
            _ => panic!("expected 16-bit samples"),
        }
    }

    #[test]
    fn test_tiled_plane_matches_source_pixels() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sink, path) = sink(&dir, &SinkConfig::default());
        assert!(sink.capabilities().tiled_write);

        let (width, height) = (10u32, 7u32);
        let pixel = |x: u32, y: u32| (y * width + x) as u8;
        let geometry = SeriesGeometry::gray(width, height, 1, 1);
        sink.begin_series(0, &geometry).unwrap();
        sink.set_color_table(None).unwrap();

        for tile in plan_tiles(width, height, 4, 3).unwrap() {
            let data: Vec<u8> = (tile.y..tile.y + tile.height)
                .flat_map(|y| (tile.x..tile.x + tile.width).map(move |x| pixel(x, y)))
                .collect();
            sink.write_tile(0, tile, &data).unwrap();
        }
        assert_eq!(sink.planes_written(), 1);
        sink.finalize().unwrap();

        let mut decoder = Decoder::new(File::open(&path).unwrap()).unwrap();
        assert_eq!(decoder.dimensions().unwrap(), (width, height));
        assert_eq!(decoder.chunk_dimensions(), (width, 3));
        match decoder.read_image().unwrap() {
            DecodingResult::U8(data) => {
                let expected: Vec<u8> = (0..height).flat_map(|y| (0..width).map(move |x| pixel(x, y))).collect();
                assert_eq!(data, expected);
            }
            _ => panic!("expected 8-bit samples"),
        }
    }

    #[test]
    fn test_tiled_then_whole_plane_in_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sink, path) = sink(&dir, &SinkConfig::default());

        let geometry = SeriesGeometry::gray(4, 4, 2, 2);
        sink.begin_series(0, &geometry).unwrap();
        sink.set_color_table(None).unwrap();
        for tile in plan_tiles(4, 4, 2, 2).unwrap() {
            sink.write_tile(0, tile, &[3u8; 8]).unwrap();
        }
        sink.set_color_table(None).unwrap();
        sink.write_plane(1, &[5u8; 32]).unwrap();
        sink.finalize().unwrap();

        let mut decoder = Decoder::new(File::open(&path).unwrap()).unwrap();
        match decoder.read_image().unwrap() {
            DecodingResult::U16(data) => assert!(data.iter().all(|&v| v == 0x0303)),
            _ => panic!("expected 16-bit samples"),
        }
        decoder.next_image().unwrap();
        match decoder.read_image().unwrap() {
            DecodingResult::U16(data) => assert!(data.iter().all(|&v| v == 0x0505)),
            _ => panic!("expected 16-bit samples"),
        }
    }

    #[test]
    fn test_tiles_out_of_row_order_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sink, _path) = sink(&dir, &SinkConfig::default());
        sink.begin_series(0, &SeriesGeometry::gray(4, 4, 1, 1)).unwrap();
        sink.set_color_table(None).unwrap();

        sink.write_tile(0, Tile::new(0, 0, 2, 2), &[0u8; 4]).unwrap();
        let err = sink.write_tile(0, Tile::new(0, 2, 2, 2), &[0u8; 4]).unwrap_err();
        assert!(matches!(err, ConversionError::EncodeError(_)));
        sink.abort().unwrap();
    }

    #[test]
    fn test_compressed_output_takes_whole_planes_only() {
        let dir = tempfile::tempdir().unwrap();
        let config = SinkConfig {
            compression: TiffCompression::Lzw,
            predictor: None,
        };
        let (mut sink, _path) = sink(&dir, &config);
        assert!(!sink.capabilities().tiled_write);

        sink.begin_series(0, &SeriesGeometry::gray(2, 2, 1, 1)).unwrap();
        let err = sink.write_tile(0, Tile::new(0, 0, 2, 2), &[0u8; 4]).unwrap_err();
        assert!(matches!(err, ConversionError::EncodeError(_)));
        sink.abort().unwrap();
    }

    #[test]
    fn test_out_of_order_plane_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sink, _path) = sink(&dir, &SinkConfig::default());
        sink.begin_series(0, &SeriesGeometry::gray(2, 2, 2, 1)).unwrap();

        let err = sink.write_plane(1, &[0u8; 4]).unwrap_err();
        assert!(matches!(err, ConversionError::EncodeError(_)));
    }

    #[test]
    fn test_abort_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.tif");
        let mut sink = TiffSink::create(path.to_str().unwrap(), true, &SinkConfig::default()).unwrap();
        sink.begin_series(0, &SeriesGeometry::gray(2, 2, 1, 1)).unwrap();
        sink.write_plane(0, &[7u8; 4]).unwrap();

        sink.abort().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_abort_in_the_middle_of_a_tiled_plane() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sink, path) = sink(&dir, &SinkConfig::default());
        sink.begin_series(0, &SeriesGeometry::gray(4, 4, 1, 1)).unwrap();
        sink.set_color_table(None).unwrap();
        sink.write_tile(0, Tile::new(0, 0, 2, 2), &[1u8; 4]).unwrap();

        sink.abort().unwrap();
        assert!(!path.exists());
    }
}
