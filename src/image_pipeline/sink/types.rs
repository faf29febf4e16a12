//! Output sink configuration types

use clap::ValueEnum;

/// TIFF compression methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TiffCompression {
    /// No compression (fastest, largest file)
    None,
    /// LZW compression (slow, good compression)
    Lzw,
    /// Deflate compression - fast level (good speed/size balance)
    DeflateFast,
    /// Deflate compression - balanced
    DeflateBalanced,
    /// Deflate compression - best compression (slower)
    DeflateBest,
}

/// What a sink can do. Chosen by the sink implementation and its
/// configuration, never inferred from the concrete type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkCapabilities {
    /// Accepts sub-rectangles of a plane through `write_tile`
    pub tiled_write: bool,
    /// Can switch to a 64-bit offset container for huge outputs
    pub big_format: bool,
    /// Can hold more than one plane per series
    pub stacks: bool,
}

/// Configuration shared by the sinks built by the registry
#[derive(Debug, Clone)]
pub struct SinkConfig {
    /// Compression method for TIFF output
    pub compression: TiffCompression,
    /// Predictor value for compression (2 for horizontal differencing)
    pub predictor: Option<u16>,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            compression: TiffCompression::None,
            predictor: None,
        }
    }
}
