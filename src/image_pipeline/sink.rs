//! Output writing module
//!
//! This module defines the output sink boundary and the sinks shipped with
//! the server, with their compression options.

mod raw_sink;
mod registry;
mod tiff_sink;
pub mod types;
mod writer;

pub use raw_sink::RawPlanarSink;
pub use registry::SinkRegistry;
pub use tiff_sink::TiffSink;
pub use types::{SinkCapabilities, SinkConfig, TiffCompression};
pub use writer::{OutputSink, SinkFactory};
