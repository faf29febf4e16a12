//! Command line configuration of the conversion server

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::image_pipeline::conversions::types::{DEFAULT_BIG_IMAGE_THRESHOLD, DEFAULT_TILE_SIZE};
use crate::image_pipeline::{ConversionConfig, SeriesDimensionPolicy, SinkConfig, TiffCompression};
use crate::server::{PoolConfig, QueueFullPolicy};

#[derive(Parser, Debug, Clone)]
#[command(name = "raster-convert", about = "Tile-by-tile conversion server for multi-series rasters")]
pub struct ServerConfig {
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: String,
    #[arg(long, default_value_t = 4321)]
    pub port: u16,
    /// Concurrent conversions; defaults to the number of available cores
    #[arg(long)]
    pub workers: Option<usize>,
    #[arg(long, default_value_t = 32)]
    pub queue_capacity: usize,
    #[arg(long, value_enum, default_value_t = QueueFullPolicy::Block)]
    pub queue_full: QueueFullPolicy,
    /// Connections held open at once; defaults to workers + queue capacity
    #[arg(long)]
    pub max_connections: Option<usize>,
    /// Seconds a client may take to send its request line
    #[arg(long, default_value_t = 30)]
    pub request_timeout_secs: u64,
    /// Planes with at least this many pixels are converted tile by tile
    #[arg(long, default_value_t = DEFAULT_BIG_IMAGE_THRESHOLD)]
    pub big_image_threshold: u64,
    #[arg(long, default_value_t = DEFAULT_TILE_SIZE)]
    pub tile_width: u32,
    #[arg(long, default_value_t = DEFAULT_TILE_SIZE)]
    pub tile_height: u32,
    /// Require every converted series to share the first one's dimensions
    #[arg(long, default_value_t = false)]
    pub uniform_dimensions: bool,
    #[arg(long, default_value_t = false)]
    pub force_big_format: bool,
    #[arg(long, value_enum, default_value_t = TiffCompression::None)]
    pub compression: TiffCompression,
    /// Created at startup if missing
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::parse_from(["raster-convert"])
    }
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn worker_count(&self) -> usize {
        self.workers
            .unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4))
            .max(1)
    }

    pub fn connection_limit(&self) -> usize {
        self.max_connections
            .unwrap_or_else(|| self.worker_count() + self.queue_capacity)
            .max(1)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            workers: self.worker_count(),
            queue_capacity: self.queue_capacity,
            queue_full: self.queue_full,
        }
    }

    pub fn conversion_config(&self) -> ConversionConfig {
        let policy = if self.uniform_dimensions {
            SeriesDimensionPolicy::Uniform
        } else {
            SeriesDimensionPolicy::PerSeries
        };
        ConversionConfig::builder()
            .big_image_threshold(self.big_image_threshold)
            .tile_size(self.tile_width, self.tile_height)
            .dimension_policy(policy)
            .force_big_format(self.force_big_format)
            .build()
    }

    pub fn sink_config(&self) -> SinkConfig {
        let predictor = match self.compression {
            TiffCompression::None => None,
            _ => Some(2),
        };
        SinkConfig {
            compression: self.compression,
            predictor,
        }
    }
}
