//! Conversion engine module
//!
//! Tiling, per-plane conversion, series iteration and job orchestration.

mod job;
mod plane;
mod series;
mod timing;
pub mod tiling;
pub mod types;


pub use job::{ConversionEngine, ConversionJob, JobStatus};
pub use plane::PlaneConverter;
pub use series::{SeriesPlan, convert_series, plan_series, planned_bytes};
pub use timing::{ConversionStats, PlaneTiming, ProgressThrottle, Timer};
pub use tiling::{Tile, is_big_plane, plan_tiles};
pub use types::{ConversionConfig, ConversionConfigBuilder, SeriesDimensionPolicy, SeriesSelection};
