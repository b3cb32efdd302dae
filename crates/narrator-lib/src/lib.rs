//! narrator-lib — Speech synthesis server engine.
//!
//! Device selection, model lifecycle, the two-tier synthesis executor, batch
//! orchestration with progress events, the Kokoro backend, and the HTTP API.
//! Depends on narrator-core for wire types, WAV codec and the error taxonomy.

pub mod device;
pub mod download;
pub mod executor;
pub mod kokoro;
pub mod lifecycle;
pub mod model;
pub mod server;
pub mod service;
pub mod shutdown;

#[cfg(test)]
mod testing;

// Re-export narrator-core for convenience
pub use narrator_core;
