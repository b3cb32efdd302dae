//! Shared types for the narrator speech server.
//!
//! These types are used across narrator-lib, narrator-cli, and downstream
//! consumers (the rendering pipeline reads [`SynthesisResult`] back as JSON).
//! Keeping them in narrator-core means consumers can depend on the wire
//! format without pulling in tokio, axum, or reqwest.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ─── Devices ───────────────────────────────────────────────────────────────

/// Compute backend the model is resident on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    /// NVIDIA GPU.
    Cuda,
    /// Apple unified-memory GPU (Metal Performance Shaders).
    Mps,
    Cpu,
}

impl Device {
    /// True for GPU-class backends. Reported as `gpu_accelerated`.
    pub fn is_accelerator(self) -> bool {
        matches!(self, Device::Cuda | Device::Mps)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Device::Cuda => "cuda",
            Device::Mps => "mps",
            Device::Cpu => "cpu",
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requested device, from CLI or config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevicePreference {
    /// Pick the best available backend.
    #[default]
    Auto,
    Cuda,
    Mps,
    Cpu,
}

impl std::str::FromStr for DevicePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" | "" => Ok(Self::Auto),
            "cuda" | "gpu" | "nvidia" => Ok(Self::Cuda),
            "mps" | "metal" | "apple" => Ok(Self::Mps),
            "cpu" => Ok(Self::Cpu),
            other => Err(format!(
                "unknown device '{other}'; expected one of: auto, cuda, mps, cpu"
            )),
        }
    }
}

// ─── Audio ─────────────────────────────────────────────────────────────────

/// Raw output of one inference call: mono samples in `-1.0..=1.0`.
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl Waveform {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }
}

// ─── Requests ──────────────────────────────────────────────────────────────

fn default_kind() -> String {
    "segment".to_string()
}

/// One unit of work: a text to synthesize and where to put the audio.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisItem {
    #[serde(default)]
    pub text: String,
    /// Generated under the server's output directory when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
    /// Free-form tag for logs and progress events ("hook", "segment", ...).
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
}

impl SynthesisItem {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            output_path: None,
            kind: default_kind(),
        }
    }

    pub fn with_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_path = Some(path.into());
        self
    }
}

/// Body of `POST /generate`.
pub type GenerateRequest = SynthesisItem;

/// Body of `POST /batch` and `POST /batch-stream`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchRequest {
    #[serde(default)]
    pub items: Vec<SynthesisItem>,
}

// ─── Results ───────────────────────────────────────────────────────────────

/// Outcome of one [`SynthesisItem`]. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
    pub device: Device,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 1-based position within the request.
    pub index: usize,
    pub total: usize,
    /// Fraction of the request completed once this item finished, `0.0..=1.0`.
    pub progress: f32,
}

impl SynthesisResult {
    pub fn ok(output: PathBuf, sample_rate: u32, device: Device, index: usize, total: usize) -> Self {
        Self {
            success: true,
            output: Some(output),
            sample_rate: Some(sample_rate),
            device,
            error: None,
            index,
            total,
            progress: fraction(index, total),
        }
    }

    pub fn failed(message: impl Into<String>, device: Device, index: usize, total: usize) -> Self {
        Self {
            success: false,
            output: None,
            sample_rate: None,
            device,
            error: Some(message.into()),
            index,
            total,
            progress: fraction(index, total),
        }
    }
}

fn fraction(done: usize, total: usize) -> f32 {
    if total == 0 {
        return 1.0;
    }
    done as f32 / total as f32
}

/// Completed-items percentage, `0.0..=100.0`.
pub fn percent(done: usize, total: usize) -> f32 {
    fraction(done, total) * 100.0
}

/// Response of `POST /generate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub success: bool,
    pub output: PathBuf,
    pub sample_rate: u32,
    pub device: Device,
    pub gpu_accelerated: bool,
}

/// Response of `POST /batch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResponse {
    pub success: bool,
    pub results: Vec<SynthesisResult>,
    pub device: Device,
    pub gpu_accelerated: bool,
    pub total_processed: usize,
}

/// Body of every non-2xx JSON response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Response of `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub model_loaded: bool,
    pub device: Device,
    /// Set once the one-time model load has failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_error: Option<String>,
}

// ─── Streaming ─────────────────────────────────────────────────────────────

/// One frame of the `/batch-stream` protocol.
///
/// Order for a batch of K items: one `Start`, then per item one `Progress`
/// followed by one `ItemComplete` or `Error`, then exactly one `Complete`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Start {
        total: usize,
        device: Device,
    },
    Progress {
        index: usize,
        total: usize,
        segment: String,
        text: String,
        /// Percent of items finished before this one started.
        progress: f32,
    },
    ItemComplete {
        index: usize,
        total: usize,
        output: PathBuf,
        progress: f32,
    },
    Error {
        index: usize,
        total: usize,
        message: String,
    },
    Complete {
        results: Vec<SynthesisResult>,
        total: usize,
    },
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressEvent::Complete { .. })
    }
}

// ─── Model files ───────────────────────────────────────────────────────────

/// Model file definition.
pub struct ModelInfo {
    pub name: &'static str,
    pub filename: &'static str,
    pub url: &'static str,
    pub expected_size: u64,
}

pub const KOKORO_MODEL: ModelInfo = ModelInfo {
    name: "kokoro",
    filename: "kokoro-v1.0.onnx",
    url: "https://github.com/thewh1teagle/kokoro-onnx/releases/download/model-files-v1.0/kokoro-v1.0.onnx",
    expected_size: 326_000_000,
};

pub const KOKORO_VOICES: ModelInfo = ModelInfo {
    name: "kokoro-voices",
    filename: "voices-v1.0.bin",
    url: "https://github.com/thewh1teagle/kokoro-onnx/releases/download/model-files-v1.0/voices-v1.0.bin",
    expected_size: 5_200_000,
};
