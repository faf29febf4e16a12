//! Conversion configuration types

use std::time::Duration;

use serde::Deserialize;

/// Planes at least this many pixels are converted tile by tile.
pub const DEFAULT_BIG_IMAGE_THRESHOLD: u64 = 4096 * 4096;

/// Tile edge used when the source format imposes no tile size.
pub const DEFAULT_TILE_SIZE: u32 = 1024;

/// Outputs estimated at this size or more get the big-format hint.
pub const DEFAULT_BIG_FORMAT_THRESHOLD: u64 = u32::MAX as u64 - (1 << 20);

/// How width and height are taken when a source has several series
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesDimensionPolicy {
    /// Every series is converted with its own width and height
    PerSeries,
    /// Every converted series must match the first one
    Uniform,
}

/// Which series of the source a request wants converted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeriesSelection {
    /// All series, in ascending order
    #[default]
    All,
    /// Only the series with this index
    Index(usize),
    /// Only the series with the most pixels per plane
    Largest,
}

/// Configuration for the conversion engine
#[derive(Debug, Clone)]
pub struct ConversionConfig {
    /// Planes with width x height at or above this are tiled when the sink allows it
    pub big_image_threshold: u64,
    /// Tile width when the source reports no preferred tile size
    pub tile_width: u32,
    /// Tile height when the source reports no preferred tile size
    pub tile_height: u32,
    pub dimension_policy: SeriesDimensionPolicy,
    /// Minimum time between two progress lines within a series
    pub progress_interval: Duration,
    /// Estimated output size from which sinks are asked for a big container
    pub big_format_threshold: u64,
    /// Always ask for a big container
    pub force_big_format: bool,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            big_image_threshold: DEFAULT_BIG_IMAGE_THRESHOLD,
            tile_width: DEFAULT_TILE_SIZE,
            tile_height: DEFAULT_TILE_SIZE,
            dimension_policy: SeriesDimensionPolicy::PerSeries,
            progress_interval: Duration::from_secs(1),
            big_format_threshold: DEFAULT_BIG_FORMAT_THRESHOLD,
            force_big_format: false,
        }
    }
}

impl ConversionConfig {
    pub fn builder() -> ConversionConfigBuilder {
        ConversionConfigBuilder::default()
    }
}

/// Builder for ConversionConfig
#[derive(Default)]
pub struct ConversionConfigBuilder {
    big_image_threshold: Option<u64>,
    tile_width: Option<u32>,
    tile_height: Option<u32>,
    dimension_policy: Option<SeriesDimensionPolicy>,
    progress_interval: Option<Duration>,
    big_format_threshold: Option<u64>,
    force_big_format: Option<bool>,
}

impl ConversionConfigBuilder {
    pub fn big_image_threshold(mut self, pixels: u64) -> Self {
        self.big_image_threshold = Some(pixels);
        self
    }

    pub fn tile_size(mut self, width: u32, height: u32) -> Self {
        self.tile_width = Some(width);
        self.tile_height = Some(height);
        self
    }

    pub fn dimension_policy(mut self, policy: SeriesDimensionPolicy) -> Self {
        self.dimension_policy = Some(policy);
        self
    }

    pub fn progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = Some(interval);
        self
    }

    pub fn big_format_threshold(mut self, bytes: u64) -> Self {
        self.big_format_threshold = Some(bytes);
        self
    }

    pub fn force_big_format(mut self, force: bool) -> Self {
        self.force_big_format = Some(force);
        self
    }

    pub fn build(self) -> ConversionConfig {
        let default = ConversionConfig::default();
        ConversionConfig {
            big_image_threshold: self.big_image_threshold.unwrap_or(default.big_image_threshold),
            tile_width: self.tile_width.unwrap_or(default.tile_width),
            tile_height: self.tile_height.unwrap_or(default.tile_height),
            dimension_policy: self.dimension_policy.unwrap_or(default.dimension_policy),
            progress_interval: self.progress_interval.unwrap_or(default.progress_interval),
            big_format_threshold: self.big_format_threshold.unwrap_or(default.big_format_threshold),
            force_big_format: self.force_big_format.unwrap_or(default.force_big_format),
        }
    }
}
