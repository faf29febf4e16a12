//! Conversion server module
//!
//! Accepts conversion requests over TCP and runs them on a bounded pool of
//! workers.

pub mod dispatcher;
pub mod error;
pub mod pool;
pub mod request;

pub use dispatcher::{ConnectionState, DEFAULT_REQUEST_TIMEOUT, Dispatcher};
pub use error::ServerError;
pub use pool::{PoolConfig, PoolSnapshot, QueueFullPolicy, WorkerPool};
pub use request::{ConversionRequest, ConversionResponse, MAX_REQUEST_BYTES};
