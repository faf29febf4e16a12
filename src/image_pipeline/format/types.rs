//! Source geometry and colour table types

use serde::Serialize;

/// Geometry of one series, as reported by the source format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeriesGeometry {
    /// Width of every plane in pixels
    pub width: u32,
    /// Height of every plane in pixels
    pub height: u32,
    /// Number of planes (Z x C x T combinations) in the series
    pub plane_count: usize,
    pub size_z: usize,
    pub size_c: usize,
    pub size_t: usize,
    /// Bytes used to store one sample (1 or 2)
    pub bytes_per_sample: u32,
    /// Bits of each sample actually carrying data (e.g. 12 for a 12-bit sensor)
    pub bits_per_pixel: u32,
    /// Samples stored per pixel in a single plane (1 for grey, 3 for RGB)
    pub samples_per_pixel: u32,
    pub little_endian: bool,
    /// Whether multi-sample pixels are stored interleaved (RGBRGB) or planar
    pub interleaved: bool,
    /// Tile size imposed by the source layout, if any
    pub tile_size: Option<(u32, u32)>,
}

impl SeriesGeometry {
    /// A single-plane, single-sample series; the other fields can be adjusted
    /// with struct update syntax.
    pub fn gray(width: u32, height: u32, plane_count: usize, bytes_per_sample: u32) -> Self {
        Self {
            width,
            height,
            plane_count,
            size_z: plane_count,
            size_c: 1,
            size_t: 1,
            bytes_per_sample,
            bits_per_pixel: bytes_per_sample * 8,
            samples_per_pixel: 1,
            little_endian: true,
            interleaved: false,
            tile_size: None,
        }
    }

    pub fn pixel_count(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    pub fn bytes_per_pixel(&self) -> u64 {
        u64::from(self.bytes_per_sample) * u64::from(self.samples_per_pixel)
    }

    /// Size in bytes of a `width` x `height` region of one plane.
    pub fn region_bytes(&self, width: u32, height: u32) -> u64 {
        u64::from(width) * u64::from(height) * self.bytes_per_pixel()
    }

    pub fn plane_bytes(&self) -> u64 {
        self.region_bytes(self.width, self.height)
    }
}

/// Geometry of a whole source, derived once when a job starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageGeometry {
    pub series: Vec<SeriesGeometry>,
}

impl ImageGeometry {
    pub fn new(series: Vec<SeriesGeometry>) -> Self {
        Self { series }
    }

    pub fn series_count(&self) -> usize {
        self.series.len()
    }

    pub fn planes_per_series(&self) -> Vec<usize> {
        self.series.iter().map(|s| s.plane_count).collect()
    }

    pub fn series(&self, index: usize) -> Option<&SeriesGeometry> {
        self.series.get(index)
    }

    /// Index of the series with the most pixels per plane; ties go to the
    /// lowest index.
    pub fn largest_series(&self) -> Option<usize> {
        self.series
            .iter()
            .enumerate()
            .max_by(|(ia, a), (ib, b)| a.pixel_count().cmp(&b.pixel_count()).then(ib.cmp(ia)))
            .map(|(index, _)| index)
    }
}

/// Palette attached to a plane of an indexed-colour image.
///
/// The three channels always have the same length, one entry per sample value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ColorLookupTable {
    Bits8 {
        red: Vec<u8>,
        green: Vec<u8>,
        blue: Vec<u8>,
    },
    Bits16 {
        red: Vec<u16>,
        green: Vec<u16>,
        blue: Vec<u16>,
        little_endian: bool,
    },
}

impl ColorLookupTable {
    pub fn len(&self) -> usize {
        match self {
            Self::Bits8 { red, .. } => red.len(),
            Self::Bits16 { red, .. } => red.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// RGB triple for a sample value, widened to 16 bits per channel.
    pub fn rgb16(&self, index: usize) -> Option<[u16; 3]> {
        match self {
            Self::Bits8 { red, green, blue } => Some([
                u16::from(*red.get(index)?) * 257,
                u16::from(*green.get(index)?) * 257,
                u16::from(*blue.get(index)?) * 257,
            ]),
            Self::Bits16 { red, green, blue, .. } => {
                Some([*red.get(index)?, *green.get(index)?, *blue.get(index)?])
            }
        }
    }

    /// Channel-planar 16-bit palette (all reds, then greens, then blues)
    /// padded to `1 << sample_bits` entries, as stored in a TIFF `ColorMap`.
    pub fn to_color_map(&self, sample_bits: u32) -> Vec<u16> {
        let entries = 1usize << sample_bits.min(16);
        let mut map = vec![0u16; entries * 3];
        for index in 0..entries.min(self.len()) {
            if let Some([r, g, b]) = self.rgb16(index) {
                map[index] = r;
                map[entries + index] = g;
                map[2 * entries + index] = b;
            }
        }
        map
    }

    /// Builds a table back from a channel-planar `ColorMap`.
    pub fn from_color_map(map: &[u16], sample_bits: u32) -> Option<Self> {
        if map.is_empty() || map.len() % 3 != 0 {
            return None;
        }
        let entries = map.len() / 3;
        let (red, rest) = map.split_at(entries);
        let (green, blue) = rest.split_at(entries);
        if sample_bits <= 8 {
            let narrow = |c: &[u16]| c.iter().map(|&v| (v >> 8) as u8).collect();
            Some(Self::Bits8 {
                red: narrow(red),
                green: narrow(green),
                blue: narrow(blue),
            })
        } else {
            Some(Self::Bits16 {
                red: red.to_vec(),
                green: green.to_vec(),
                blue: blue.to_vec(),
                little_endian: true,
            })
        }
    }
}
