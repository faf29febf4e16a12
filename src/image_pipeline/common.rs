//! Common utilities module
//!
//! This module contains the error taxonomy shared by readers, sinks and the
//! conversion engine.

pub mod error;

pub use error::{ConversionError, Result};
