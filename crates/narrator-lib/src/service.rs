//! Request handlers — health, single, buffered batch, streamed batch.
//!
//! Each operation is `ensure_loaded` + one executor call per item + a file
//! write. The HTTP layer in [`crate::server`] only translates to and from JSON.
//!
//! At most one synthesis runs at any instant: every operation that touches
//! the model holds the inference lock for its whole duration. Concurrent
//! requests queue on it in arrival order, and the items of two batches never
//! interleave.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info};
use uuid::Uuid;

use narrator_core::text::{PREVIEW_CHARS, is_blank, preview};
use narrator_core::types::{
    BatchResponse, Device, GenerateResponse, HealthStatus, ProgressEvent, SynthesisItem,
    SynthesisResult, Waveform, percent,
};
use narrator_core::wav::encode_waveform;
use narrator_core::{Error, Result};

use crate::executor;
use crate::lifecycle::ModelManager;
use crate::model::SpeechModel;

/// Buffer between the batch producer and the SSE writer.
const EVENT_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Where audio goes when a request gives no `output_path`.
    pub output_dir: PathBuf,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            output_dir: std::env::temp_dir(),
        }
    }
}

/// Cloneable handle shared by every HTTP handler.
#[derive(Clone)]
pub struct TtsService {
    inner: Arc<Inner>,
}

struct Inner {
    manager: Arc<ModelManager>,
    config: ServiceConfig,
    inference: Mutex<()>,
}

impl TtsService {
    pub fn new(manager: Arc<ModelManager>, config: ServiceConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                manager,
                config,
                inference: Mutex::new(()),
            }),
        }
    }

    pub fn manager(&self) -> &Arc<ModelManager> {
        &self.inner.manager
    }

    pub fn device(&self) -> Device {
        self.inner.manager.device()
    }

    /// Never loads the model and never fails.
    pub fn health(&self) -> HealthStatus {
        let manager = &self.inner.manager;
        HealthStatus {
            status: "healthy".to_string(),
            model_loaded: manager.is_loaded(),
            device: manager.device(),
            load_error: manager.load_error(),
        }
    }

    /// Synthesize one item and write it to disk.
    pub async fn generate(&self, item: SynthesisItem) -> Result<GenerateResponse> {
        if is_blank(&item.text) {
            return Err(Error::validation("No text provided"));
        }

        let model = self.inner.manager.ensure_loaded().await?;
        let _turn = self.inner.inference.lock().await;

        let device = self.device();
        info!(kind = %item.kind, "generating audio: {}", preview(&item.text, PREVIEW_CHARS));
        let (output, sample_rate) = self.render(model.as_ref(), &item).await.inspect_err(|e| {
            error!(kind = %item.kind, "error generating audio: {e}");
        })?;

        Ok(GenerateResponse {
            success: true,
            output,
            sample_rate,
            device,
            gpu_accelerated: device.is_accelerator(),
        })
    }

    /// Synthesize every item in order and return all results at once.
    ///
    /// Per-item failures are recorded in that item's result; siblings still run.
    pub async fn batch(&self, items: Vec<SynthesisItem>) -> Result<BatchResponse> {
        if items.is_empty() {
            return Err(Error::validation("No items provided"));
        }

        let model = self.inner.manager.ensure_loaded().await?;
        let _turn = self.inner.inference.lock().await;

        let total = items.len();
        let mut results = Vec::with_capacity(total);
        for (i, item) in items.iter().enumerate() {
            results.push(self.run_item(model.as_ref(), item, i + 1, total).await);
        }

        let device = self.device();
        Ok(BatchResponse {
            success: true,
            total_processed: results.len(),
            results,
            device,
            gpu_accelerated: device.is_accelerator(),
        })
    }

    /// Start a streamed batch.
    ///
    /// Validation and the model load happen here, before any event exists,
    /// so they can still be reported as a plain HTTP error. After that every
    /// failure is an `error` event inside the stream.
    pub async fn batch_stream(
        &self,
        items: Vec<SynthesisItem>,
    ) -> Result<mpsc::Receiver<ProgressEvent>> {
        if items.is_empty() {
            return Err(Error::validation("No items provided"));
        }

        let model = self.inner.manager.ensure_loaded().await?;
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let service = self.clone();
        tokio::spawn(async move {
            service.stream_items(model, items, tx).await;
        });
        Ok(rx)
    }

    async fn stream_items(
        &self,
        model: Arc<dyn SpeechModel>,
        items: Vec<SynthesisItem>,
        tx: mpsc::Sender<ProgressEvent>,
    ) {
        let _turn = self.inner.inference.lock().await;

        let total = items.len();
        let mut sink = EventSink::new(tx);
        sink.send(ProgressEvent::Start {
            total,
            device: self.device(),
        })
        .await;

        let mut results = Vec::with_capacity(total);
        for (i, item) in items.iter().enumerate() {
            let index = i + 1;
            sink.send(ProgressEvent::Progress {
                index,
                total,
                segment: item.kind.clone(),
                text: preview(&item.text, PREVIEW_CHARS),
                progress: percent(i, total),
            })
            .await;

            let result = self.run_item(model.as_ref(), item, index, total).await;
            let event = match (&result.output, &result.error) {
                (Some(output), None) => ProgressEvent::ItemComplete {
                    index,
                    total,
                    output: output.clone(),
                    progress: percent(index, total),
                },
                (_, error) => ProgressEvent::Error {
                    index,
                    total,
                    message: error.clone().unwrap_or_else(|| "unknown error".to_string()),
                },
            };
            sink.send(event).await;
            results.push(result);
        }

        sink.send(ProgressEvent::Complete {
            total: results.len(),
            results,
        })
        .await;
    }

    /// One item of a batch. Never fails: errors become a failed result.
    async fn run_item(
        &self,
        model: &dyn SpeechModel,
        item: &SynthesisItem,
        index: usize,
        total: usize,
    ) -> SynthesisResult {
        let device = self.device();
        if is_blank(&item.text) {
            debug!(index, total, "skipping item without text");
            return SynthesisResult::failed("No text provided", device, index, total);
        }

        info!(
            index,
            total,
            kind = %item.kind,
            "generating audio {index}/{total}: {}",
            preview(&item.text, PREVIEW_CHARS)
        );
        match self.render(model, item).await {
            Ok((output, sample_rate)) => {
                SynthesisResult::ok(output, sample_rate, device, index, total)
            }
            Err(e) => {
                error!(index, total, kind = %item.kind, "error generating audio: {e}");
                SynthesisResult::failed(e.to_string(), device, index, total)
            }
        }
    }

    async fn render(&self, model: &dyn SpeechModel, item: &SynthesisItem) -> Result<(PathBuf, u32)> {
        let waveform = executor::synthesize(model, self.device(), &item.text).await?;
        let path = match &item.output_path {
            Some(path) => path.clone(),
            None => self.generated_path(),
        };
        write_waveform(&path, &waveform).await?;
        debug!(
            path = %path.display(),
            duration = ?waveform.duration(),
            "audio written"
        );
        Ok((path, waveform.sample_rate))
    }

    fn generated_path(&self) -> PathBuf {
        self.inner
            .config
            .output_dir
            .join(format!("narrator-{}.wav", Uuid::new_v4()))
    }
}

/// Encode fully, write beside the target, then rename into place, so a
/// failed write never leaves a truncated file at `path`.
pub async fn write_waveform(path: &Path, waveform: &Waveform) -> Result<()> {
    let bytes = encode_waveform(waveform);

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::io(parent, e))?;
    }

    let mut partial = path.as_os_str().to_owned();
    partial.push(".partial");
    let partial = PathBuf::from(partial);

    tokio::fs::write(&partial, &bytes)
        .await
        .map_err(|e| Error::io(path, e))?;
    if let Err(e) = tokio::fs::rename(&partial, path).await {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(Error::io(path, e));
    }
    Ok(())
}

/// Event sender that keeps producing after the client goes away: the audio
/// files are the real product, the events are only progress.
struct EventSink {
    tx: mpsc::Sender<ProgressEvent>,
    connected: bool,
}

impl EventSink {
    fn new(tx: mpsc::Sender<ProgressEvent>) -> Self {
        Self {
            tx,
            connected: true,
        }
    }

    async fn send(&mut self, event: ProgressEvent) {
        if !self.connected {
            return;
        }
        if self.tx.send(event).await.is_err() {
            debug!("stream client disconnected, finishing batch without events");
            self.connected = false;
        }
    }
}
