//! Seams between the server and whatever actually runs inference.
//!
//! The server treats a model as an opaque `text -> waveform` capability.
//! Optional capabilities are discovered through accessor methods rather than
//! checked at each call: [`SpeechModel::fast_path`] for the optimized inference
//! tier and [`SpeechModel::optimizations`] for one-time load-time tuning.

use async_trait::async_trait;

use narrator_core::Result;
use narrator_core::types::{Device, Waveform};

/// A loaded, resident speech model.
#[async_trait]
pub trait SpeechModel: Send + Sync {
    /// Output sample rate of every waveform this model produces.
    fn sample_rate(&self) -> u32;

    /// Standard inference path. The correctness reference.
    async fn synthesize(&self, text: &str) -> Result<Waveform>;

    /// Optimized inference tier, if the model has one.
    fn fast_path(&self) -> Option<&dyn FastPath> {
        None
    }

    /// Load-time tuning hooks, if the model has any.
    fn optimizations(&self) -> Option<&dyn Optimizable> {
        None
    }

    /// Release backend resources (processes, accelerator memory).
    ///
    /// Called synchronously from shutdown hooks, at most once.
    fn release(&self) {}
}

/// Optimized inference. Failures are recoverable: the caller retries on
/// [`SpeechModel::synthesize`].
#[async_trait]
pub trait FastPath: Send + Sync {
    async fn try_optimized(&self, text: &str) -> Result<Waveform>;
}

/// Best-effort tuning applied once, right after load.
#[async_trait]
pub trait Optimizable: Send + Sync {
    async fn enable(&self, device: Device) -> Result<()>;
}

/// Performs the expensive model load.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(&self, device: Device) -> Result<Box<dyn SpeechModel>>;
}
