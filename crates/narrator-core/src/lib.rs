//! narrator-core — Pure types, errors and audio encoding.
//!
//! No async runtime, no I/O, no platform dependencies.

pub mod error;
pub mod text;
pub mod types;
pub mod wav;

pub use error::{Error, Result};
