//! Image conversion pipeline module
//!
//! This module provides the conversion engine for multi-series raster images,
//! with separate modules for source reading, output writing, and conversion
//! orchestration.

pub mod common;
pub mod conversions;
pub mod format;
pub mod sink;

pub use common::{
    ConversionError,
    Result,
};

pub use format::{
    ColorLookupTable,
    FormatHandle,
    FormatOpener,
    FormatRegistry,
    ImageGeometry,
    SeriesGeometry,
};

pub use sink::{
    OutputSink,
    SinkCapabilities,
    SinkConfig,
    SinkFactory,
    SinkRegistry,
    TiffCompression,
};

pub use conversions::{
    ConversionConfig,
    ConversionConfigBuilder,
    ConversionEngine,
    ConversionJob,
    ConversionStats,
    JobStatus,
    SeriesDimensionPolicy,
    SeriesSelection,
    Tile,
};
