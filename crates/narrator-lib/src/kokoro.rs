//! Kokoro backend — an OpenAI-compatible `koko` speech server.
//!
//! The loader either attaches to a server that is already listening or
//! downloads the model files and spawns `koko` as a sidecar process. The
//! resulting [`KokoroModel`] talks to `POST /v1/audio/speech`:
//!
//! - standard path: one buffered WAV response, header sizes repaired before decode;
//! - fast path: streamed 24 kHz mono s16le PCM, assembled as it arrives;
//! - optimization: a warmup request so the first real request skips ONNX graph setup.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::process::Child;
use tracing::{debug, info, warn};

use narrator_core::types::{Device, KOKORO_MODEL, KOKORO_VOICES, Waveform};
use narrator_core::wav::{bytes_to_i16, decode_wav, fix_wav_sizes, i16_to_f32};
use narrator_core::{Error, Result};

use crate::download::{self, DownloadProgress};
use crate::model::{FastPath, ModelLoader, Optimizable, SpeechModel};

/// Kokoro output format: 24 kHz mono 16-bit signed LE.
pub const KOKORO_SAMPLE_RATE: u32 = 24_000;

pub const DEFAULT_KOKORO_PORT: u16 = 3001;
pub const DEFAULT_VOICE: &str = "af_heart";

const KOKORO_SIDECAR: &str = "koko";
const WARMUP_TEXT: &str = "Warming up.";
const HEALTH_POLL: Duration = Duration::from_millis(500);
const REACHABLE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct KokoroConfig {
    /// Attach to this server instead of spawning one.
    pub url: Option<String>,
    /// Port for a spawned sidecar.
    pub port: u16,
    pub models_dir: PathBuf,
    pub voice: String,
    pub speed: f32,
    /// How long a spawned sidecar may take to answer its first request.
    pub startup_timeout: Duration,
}

impl Default for KokoroConfig {
    fn default() -> Self {
        Self {
            url: None,
            port: DEFAULT_KOKORO_PORT,
            models_dir: PathBuf::from("models"),
            voice: DEFAULT_VOICE.to_string(),
            speed: 1.0,
            startup_timeout: Duration::from_secs(60),
        }
    }
}

// ─── Loader ────────────────────────────────────────────────────────────────

pub struct KokoroLoader {
    config: KokoroConfig,
    client: reqwest::Client,
}

impl KokoroLoader {
    pub fn new(config: KokoroConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    async fn spawn_sidecar(&self, device: Device) -> Result<KokoroModel> {
        let models_dir = &self.config.models_dir;
        let model_path = download::download_model(models_dir, &KOKORO_MODEL, log_progress())
            .await
            .map_err(|e| Error::model_load(e.to_string()))?;
        let voices_path = download::download_model(models_dir, &KOKORO_VOICES, log_progress())
            .await
            .map_err(|e| Error::model_load(e.to_string()))?;

        let binary = resolve_sidecar(KOKORO_SIDECAR)?;
        let port = self.config.port;

        let mut command = tokio::process::Command::new(&binary);
        command
            .args(sidecar_args(&model_path, &voices_path, port))
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if device == Device::Cpu {
            command.env("CUDA_VISIBLE_DEVICES", "");
        }

        let mut child = command.spawn().map_err(|e| {
            Error::model_load(format!("failed to spawn {}: {e}", binary.display()))
        })?;
        info!(binary = %binary.display(), port, %device, "kokoro sidecar spawned");

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                use tokio::io::{AsyncBufReadExt, BufReader};
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[koko] {line}");
                }
            });
        }

        let sidecar = Sidecar::new(child);
        let base_url = format!("http://127.0.0.1:{port}");
        wait_for_health(
            &self.client,
            &base_url,
            self.config.startup_timeout,
            &sidecar,
        )
        .await?;

        Ok(KokoroModel::new(
            self.client.clone(),
            &base_url,
            &self.config,
            Some(sidecar),
        ))
    }
}

#[async_trait]
impl ModelLoader for KokoroLoader {
    async fn load(&self, device: Device) -> Result<Box<dyn SpeechModel>> {
        if let Some(url) = &self.config.url {
            if !is_reachable(&self.client, url).await {
                return Err(Error::model_load(format!(
                    "kokoro server at {url} is not reachable"
                )));
            }
            info!(url = %url, "attached to kokoro server");
            return Ok(Box::new(KokoroModel::new(
                self.client.clone(),
                url,
                &self.config,
                None,
            )));
        }

        let local = format!("http://127.0.0.1:{}", self.config.port);
        if is_reachable(&self.client, &local).await {
            info!(url = %local, "kokoro already running, attaching");
            return Ok(Box::new(KokoroModel::new(
                self.client.clone(),
                &local,
                &self.config,
                None,
            )));
        }

        Ok(Box::new(self.spawn_sidecar(device).await?))
    }
}

/// Logs download progress every 10%.
fn log_progress() -> impl Fn(DownloadProgress) + Send {
    let last_decile = AtomicU32::new(u32::MAX);
    move |p: DownloadProgress| {
        let decile = (p.percent / 10.0) as u32;
        if p.complete {
            info!(model = p.model, bytes = p.bytes_total, "model ready");
        } else if last_decile.swap(decile, Ordering::Relaxed) != decile {
            info!(
                model = p.model,
                percent = decile * 10,
                bytes = p.bytes_done,
                "downloading"
            );
        }
    }
}

async fn is_reachable(client: &reqwest::Client, base_url: &str) -> bool {
    client
        .get(format!("{}/", base_url.trim_end_matches('/')))
        .timeout(REACHABLE_TIMEOUT)
        .send()
        .await
        .is_ok()
}

async fn wait_for_health(
    client: &reqwest::Client,
    base_url: &str,
    timeout: Duration,
    sidecar: &Sidecar,
) -> Result<()> {
    let started = Instant::now();
    loop {
        if let Some(status) = sidecar.exit_status() {
            return Err(Error::model_load(format!(
                "koko exited during startup ({status})"
            )));
        }
        if is_reachable(client, base_url).await {
            info!(elapsed = ?started.elapsed(), "kokoro ready");
            return Ok(());
        }
        if started.elapsed() > timeout {
            sidecar.kill();
            return Err(Error::model_load(format!(
                "kokoro did not become ready within {}s",
                timeout.as_secs()
            )));
        }
        tokio::time::sleep(HEALTH_POLL).await;
    }
}

/// `koko --model <onnx> --data <voices> openai --ip 127.0.0.1 --port <port>`
fn sidecar_args(model_path: &Path, voices_path: &Path, port: u16) -> Vec<String> {
    vec![
        "--model".into(),
        model_path.to_string_lossy().into_owned(),
        "--data".into(),
        voices_path.to_string_lossy().into_owned(),
        "openai".into(),
        "--ip".into(),
        "127.0.0.1".into(),
        "--port".into(),
        port.to_string(),
    ]
}

/// Find the sidecar binary: bundled next to the executable (with or without
/// a target-triple suffix), else rely on `PATH`.
fn resolve_sidecar(name: &str) -> Result<PathBuf> {
    let exe = std::env::current_exe()
        .map_err(|e| Error::model_load(format!("cannot determine executable path: {e}")))?;
    let Some(exe_dir) = exe.parent() else {
        return Ok(PathBuf::from(name));
    };

    let triple = target_triple();
    let candidates = [
        exe_dir.join(format!("{name}-{triple}")),
        exe_dir.join(format!("{name}-{triple}.exe")),
        exe_dir.join(name),
        exe_dir.join(format!("{name}.exe")),
    ];

    Ok(candidates
        .into_iter()
        .find(|path| path.is_file())
        .unwrap_or_else(|| PathBuf::from(name)))
}

fn target_triple() -> &'static str {
    TARGET_TRIPLE
}

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
const TARGET_TRIPLE: &str = "x86_64-unknown-linux-gnu";
#[cfg(all(target_arch = "aarch64", target_os = "linux"))]
const TARGET_TRIPLE: &str = "aarch64-unknown-linux-gnu";
#[cfg(all(target_arch = "x86_64", target_os = "macos"))]
const TARGET_TRIPLE: &str = "x86_64-apple-darwin";
#[cfg(all(target_arch = "aarch64", target_os = "macos"))]
const TARGET_TRIPLE: &str = "aarch64-apple-darwin";
#[cfg(all(target_arch = "x86_64", target_os = "windows"))]
const TARGET_TRIPLE: &str = "x86_64-pc-windows-msvc";
#[cfg(not(any(
    all(target_arch = "x86_64", target_os = "linux"),
    all(target_arch = "aarch64", target_os = "linux"),
    all(target_arch = "x86_64", target_os = "macos"),
    all(target_arch = "aarch64", target_os = "macos"),
    all(target_arch = "x86_64", target_os = "windows"),
)))]
const TARGET_TRIPLE: &str = "unknown";

// ─── Sidecar process ───────────────────────────────────────────────────────

struct Sidecar {
    child: Mutex<Option<Child>>,
}

impl Sidecar {
    fn new(child: Child) -> Self {
        Self {
            child: Mutex::new(Some(child)),
        }
    }

    /// `Some(status)` once the process has exited.
    fn exit_status(&self) -> Option<String> {
        let mut guard = self.child.lock().unwrap_or_else(|e| e.into_inner());
        let child = guard.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            Ok(None) => None,
            Err(e) => Some(e.to_string()),
        }
    }

    fn kill(&self) -> bool {
        let mut guard = self.child.lock().unwrap_or_else(|e| e.into_inner());
        match guard.take() {
            Some(mut child) => {
                if let Err(e) = child.start_kill() {
                    warn!("failed to kill koko: {e}");
                }
                true
            }
            None => false,
        }
    }
}

// ─── Model ─────────────────────────────────────────────────────────────────

/// A resident Kokoro server. Owns the sidecar process when it spawned one;
/// attached servers are left running on release.
pub struct KokoroModel {
    client: reqwest::Client,
    speech_url: String,
    voice: String,
    speed: f32,
    sidecar: Option<Sidecar>,
    released: AtomicBool,
}

impl KokoroModel {
    fn new(
        client: reqwest::Client,
        base_url: &str,
        config: &KokoroConfig,
        sidecar: Option<Sidecar>,
    ) -> Self {
        Self {
            client,
            speech_url: speech_url(base_url),
            voice: config.voice.clone(),
            speed: config.speed,
            sidecar,
            released: AtomicBool::new(false),
        }
    }

    fn request_body(&self, text: &str, response_format: &str, stream: bool) -> serde_json::Value {
        serde_json::json!({
            "input": text,
            "voice": self.voice,
            "model": "kokoro",
            "response_format": response_format,
            "stream": stream,
            "speed": self.speed,
        })
    }

    async fn post(&self, body: &serde_json::Value) -> Result<reqwest::Response> {
        if self.released.load(Ordering::SeqCst) {
            return Err(Error::synthesis("kokoro model has been released"));
        }

        let resp = self
            .client
            .post(&self.speech_url)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::synthesis(format!("kokoro request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::synthesis(format!("kokoro error {status}: {text}")));
        }
        Ok(resp)
    }
}

#[async_trait]
impl SpeechModel for KokoroModel {
    fn sample_rate(&self) -> u32 {
        KOKORO_SAMPLE_RATE
    }

    async fn synthesize(&self, text: &str) -> Result<Waveform> {
        let body = self.request_body(text, "wav", false);
        let resp = self.post(&body).await?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| Error::synthesis(format!("kokoro response failed: {e}")))?;

        // Streamed WAV responses carry placeholder sizes.
        let wav = fix_wav_sizes(bytes.to_vec());
        decode_wav(&wav).map_err(|e| Error::synthesis(format!("invalid WAV from kokoro: {e}")))
    }

    fn fast_path(&self) -> Option<&dyn FastPath> {
        Some(self)
    }

    fn optimizations(&self) -> Option<&dyn Optimizable> {
        Some(self)
    }

    fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
        match &self.sidecar {
            Some(sidecar) => {
                if sidecar.kill() {
                    info!("kokoro sidecar stopped");
                }
            }
            None => debug!("attached kokoro server left running"),
        }
    }
}

#[async_trait]
impl FastPath for KokoroModel {
    async fn try_optimized(&self, text: &str) -> Result<Waveform> {
        let body = self.request_body(text, "pcm", true);
        let resp = self.post(&body).await?;

        let mut stream = resp.bytes_stream();
        let mut leftover: Option<u8> = None;
        let mut samples = Vec::new();

        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| Error::synthesis(format!("kokoro stream error: {e}")))?;
            let (pcm, lo) = bytes_to_i16(&chunk, leftover.take());
            leftover = lo;
            samples.extend(pcm.into_iter().map(i16_to_f32));
        }

        Ok(Waveform::new(samples, KOKORO_SAMPLE_RATE))
    }
}

#[async_trait]
impl Optimizable for KokoroModel {
    async fn enable(&self, device: Device) -> Result<()> {
        let started = Instant::now();
        self.synthesize(WARMUP_TEXT).await?;
        if device.is_accelerator() {
            self.try_optimized(WARMUP_TEXT).await?;
        }
        info!(%device, elapsed = ?started.elapsed(), "kokoro warmed up");
        Ok(())
    }
}

fn speech_url(base_url: &str) -> String {
    format!("{}/v1/audio/speech", base_url.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
    use axum::{Json, Router};
    use narrator_core::wav::write_wav;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    const FAKE_PCM: [i16; 4] = [0, 1000, -1000, 32767];

    /// Minimal stand-in for `koko openai`: WAV or raw PCM by `response_format`.
    async fn fake_kokoro() -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/v1/audio/speech",
            post(move |Json(body): Json<serde_json::Value>| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if body["response_format"] == "pcm" {
                        FAKE_PCM.iter().flat_map(|s| s.to_le_bytes()).collect::<Vec<u8>>()
                    } else {
                        write_wav(&FAKE_PCM, KOKORO_SAMPLE_RATE)
                    }
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), hits)
    }

    fn attach_config(url: &str) -> KokoroConfig {
        KokoroConfig {
            url: Some(url.to_string()),
            ..KokoroConfig::default()
        }
    }

    #[test]
    fn speech_url_trims_trailing_slash() {
        assert_eq!(
            speech_url("http://127.0.0.1:3001/"),
            "http://127.0.0.1:3001/v1/audio/speech"
        );
    }

    #[test]
    fn sidecar_args_use_openai_mode() {
        let args = sidecar_args(Path::new("/m/k.onnx"), Path::new("/m/v.bin"), 3001);
        assert_eq!(
            args,
            [
                "--model", "/m/k.onnx", "--data", "/m/v.bin", "openai", "--ip", "127.0.0.1",
                "--port", "3001"
            ]
        );
    }

    #[test]
    fn target_triple_is_known() {
        assert!(!target_triple().is_empty());
    }

    #[test]
    fn request_body_carries_voice_and_format() {
        let model = KokoroModel::new(
            reqwest::Client::new(),
            "http://localhost:3001",
            &KokoroConfig::default(),
            None,
        );
        let body = model.request_body("hi", "pcm", true);
        assert_eq!(body["input"], "hi");
        assert_eq!(body["voice"], DEFAULT_VOICE);
        assert_eq!(body["response_format"], "pcm");
        assert_eq!(body["stream"], true);
    }

    #[tokio::test]
    async fn attach_to_unreachable_server_fails() {
        let loader = KokoroLoader::new(attach_config("http://127.0.0.1:1"));
        let err = loader.load(Device::Cpu).await.err().unwrap();
        assert!(matches!(err, Error::ModelLoad(_)));
    }

    #[tokio::test]
    async fn standard_and_fast_paths_agree() {
        let (url, hits) = fake_kokoro().await;
        let model = KokoroLoader::new(attach_config(&url))
            .load(Device::Cpu)
            .await
            .unwrap();

        let standard = model.synthesize("hello").await.unwrap();
        let fast = model
            .fast_path()
            .unwrap()
            .try_optimized("hello")
            .await
            .unwrap();

        assert_eq!(standard.sample_rate, KOKORO_SAMPLE_RATE);
        assert_eq!(standard.samples.len(), FAKE_PCM.len());
        assert_eq!(standard, fast);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn release_stops_requests_but_not_attached_server() {
        let (url, hits) = fake_kokoro().await;
        let model = KokoroLoader::new(attach_config(&url))
            .load(Device::Cpu)
            .await
            .unwrap();

        model.release();
        assert!(model.synthesize("hello").await.is_err());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(is_reachable(&reqwest::Client::new(), &url).await);
    }

    #[tokio::test]
    async fn warmup_hits_both_paths_on_accelerator() {
        let (url, hits) = fake_kokoro().await;
        let model = KokoroLoader::new(attach_config(&url))
            .load(Device::Cuda)
            .await
            .unwrap();

        model.optimizations().unwrap().enable(Device::Cuda).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
