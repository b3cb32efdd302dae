//! Test doubles for the model seams.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use narrator_core::types::{Device, Waveform};
use narrator_core::{Error, Result};

use crate::model::{FastPath, ModelLoader, Optimizable, SpeechModel};

pub const TONE_SAMPLE_RATE: u32 = 24_000;

/// Emits a short sine per character. Text containing `fail_on` errors.
#[derive(Clone, Default)]
pub struct ToneModel {
    pub standard_calls: Arc<AtomicUsize>,
    pub fast_calls: Arc<AtomicUsize>,
    pub released: Arc<AtomicUsize>,
    /// Highest number of inference calls seen running at once.
    pub peak_in_flight: Arc<AtomicUsize>,
    /// Texts in the order inference started on them.
    pub spoken: Arc<Mutex<Vec<String>>>,
    in_flight: Arc<AtomicUsize>,
    latency: Duration,
    fast: Option<FastMode>,
    optimization: Option<OptimizationMode>,
    fail_on: Option<String>,
}

#[derive(Clone, Copy)]
enum FastMode {
    Works,
    Fails,
}

#[derive(Clone)]
enum OptimizationMode {
    Fails,
    Counts(Arc<AtomicUsize>),
}

impl ToneModel {
    pub fn with_fast_path(mut self) -> Self {
        self.fast = Some(FastMode::Works);
        self
    }

    pub fn with_failing_fast_path(mut self) -> Self {
        self.fast = Some(FastMode::Fails);
        self
    }

    pub fn with_failing_optimization(mut self) -> Self {
        self.optimization = Some(OptimizationMode::Fails);
        self
    }

    pub fn with_optimization_counter(mut self, counter: Arc<AtomicUsize>) -> Self {
        self.optimization = Some(OptimizationMode::Counts(counter));
        self
    }

    /// Make every inference call take `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn failing_on(mut self, needle: &str) -> Self {
        self.fail_on = Some(needle.to_string());
        self
    }

    async fn infer(&self, text: &str) -> Result<Waveform> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);
        self.spoken
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(text.to_string());
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.render(text)
    }

    fn render(&self, text: &str) -> Result<Waveform> {
        if let Some(needle) = &self.fail_on {
            if text.contains(needle.as_str()) {
                return Err(Error::synthesis(format!("cannot voice '{needle}'")));
            }
        }
        let len = text.chars().count() * 240;
        let samples = (0..len)
            .map(|i| (i as f32 * 440.0 * std::f32::consts::TAU / TONE_SAMPLE_RATE as f32).sin() * 0.5)
            .collect();
        Ok(Waveform::new(samples, TONE_SAMPLE_RATE))
    }
}

#[async_trait]
impl SpeechModel for ToneModel {
    fn sample_rate(&self) -> u32 {
        TONE_SAMPLE_RATE
    }

    async fn synthesize(&self, text: &str) -> Result<Waveform> {
        self.standard_calls.fetch_add(1, Ordering::SeqCst);
        self.infer(text).await
    }

    fn fast_path(&self) -> Option<&dyn FastPath> {
        self.fast.map(|_| self as &dyn FastPath)
    }

    fn optimizations(&self) -> Option<&dyn Optimizable> {
        self.optimization.as_ref().map(|_| self as &dyn Optimizable)
    }

    fn release(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl FastPath for ToneModel {
    async fn try_optimized(&self, text: &str) -> Result<Waveform> {
        self.fast_calls.fetch_add(1, Ordering::SeqCst);
        match self.fast {
            Some(FastMode::Works) => self.infer(text).await,
            _ => Err(Error::synthesis("half precision not supported")),
        }
    }
}

#[async_trait]
impl Optimizable for ToneModel {
    async fn enable(&self, _device: Device) -> Result<()> {
        match &self.optimization {
            Some(OptimizationMode::Counts(counter)) => {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            _ => Err(Error::synthesis("memory-efficient attention unavailable")),
        }
    }
}

type Factory = Box<dyn Fn() -> ToneModel + Send + Sync>;

/// Counts how many times the expensive load runs.
pub struct CountingLoader {
    pub loads: Arc<AtomicUsize>,
    factory: Option<Factory>,
    failure: Option<String>,
    delay: Duration,
}

impl CountingLoader {
    pub fn new(factory: impl Fn() -> ToneModel + Send + Sync + 'static) -> Self {
        Self {
            loads: Arc::new(AtomicUsize::new(0)),
            factory: Some(Box::new(factory)),
            failure: None,
            delay: Duration::ZERO,
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            loads: Arc::new(AtomicUsize::new(0)),
            factory: None,
            failure: Some(message.to_string()),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl ModelLoader for CountingLoader {
    async fn load(&self, _device: Device) -> Result<Box<dyn SpeechModel>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match (&self.factory, &self.failure) {
            (_, Some(msg)) => Err(Error::model_load(msg.clone())),
            (Some(factory), None) => Ok(Box::new(factory())),
            (None, None) => Err(Error::model_load("no model configured")),
        }
    }
}
