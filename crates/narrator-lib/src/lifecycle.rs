//! Model lifecycle — lazy, exactly-once load and synchronous teardown.
//!
//! ```text
//! Empty ──ensure_loaded()──▶ Ready(model) ──release()──▶ Released
//!   │                                                     ▲
//!   └──load error──▶ Failed(msg) ─────────release()───────┘
//! ```
//!
//! The fast path reads the slot without touching the load lock. The first
//! caller to see `Empty` takes the async load lock, re-checks, and performs the
//! load; everyone queued behind it observes the published result. A failed
//! load is sticky: the server keeps reporting it instead of retrying.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use narrator_core::types::Device;
use narrator_core::{Error, Result};

use crate::model::{ModelLoader, SpeechModel};

enum Slot {
    Empty,
    Ready(Arc<dyn SpeechModel>),
    Failed(String),
    Released,
}

/// Owner of the resident model. Shared by reference between handlers.
pub struct ModelManager {
    device: Device,
    loader: Box<dyn ModelLoader>,
    slot: RwLock<Slot>,
    load_lock: Mutex<()>,
    loaded: AtomicBool,
}

impl ModelManager {
    pub fn new(device: Device, loader: impl ModelLoader + 'static) -> Self {
        Self {
            device,
            loader: Box::new(loader),
            slot: RwLock::new(Slot::Empty),
            load_lock: Mutex::new(()),
            loaded: AtomicBool::new(false),
        }
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Lock-free; safe to call from health checks.
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    /// Message of the failed one-time load, if any.
    pub fn load_error(&self) -> Option<String> {
        match &*self.slot.read().unwrap_or_else(|e| e.into_inner()) {
            Slot::Failed(msg) => Some(msg.clone()),
            _ => None,
        }
    }

    /// Return the resident model, loading it on first use.
    pub async fn ensure_loaded(&self) -> Result<Arc<dyn SpeechModel>> {
        if let Some(ready) = self.published() {
            return ready;
        }

        let _guard = self.load_lock.lock().await;
        if let Some(ready) = self.published() {
            return ready;
        }

        info!(device = %self.device, "loading speech model");
        let t0 = Instant::now();

        let model: Arc<dyn SpeechModel> = match self.loader.load(self.device).await {
            Ok(model) => Arc::from(model),
            Err(e) => {
                let msg = match e {
                    Error::ModelLoad(msg) => msg,
                    other => other.to_string(),
                };
                error!(device = %self.device, "model load failed: {msg}");
                let mut slot = self.slot.write().unwrap_or_else(|e| e.into_inner());
                if matches!(*slot, Slot::Released) {
                    return Err(Error::ShuttingDown);
                }
                *slot = Slot::Failed(msg.clone());
                return Err(Error::ModelLoad(msg));
            }
        };

        if let Some(opt) = model.optimizations() {
            if let Err(e) = opt.enable(self.device).await {
                warn!(device = %self.device, "model optimization skipped: {e}");
            }
        }

        {
            let mut slot = self.slot.write().unwrap_or_else(|e| e.into_inner());
            if matches!(*slot, Slot::Released) {
                drop(slot);
                debug!("shutdown raced the load, releasing new model");
                model.release();
                return Err(Error::ShuttingDown);
            }
            *slot = Slot::Ready(model.clone());
        }
        self.loaded.store(true, Ordering::SeqCst);

        info!(
            device = %self.device,
            sample_rate = model.sample_rate(),
            "model loaded in {:?}",
            t0.elapsed()
        );
        Ok(model)
    }

    /// Drop the model and free its backend resources. Idempotent.
    ///
    /// Returns true if a loaded model was actually released. Once called,
    /// the manager never loads again.
    pub fn release(&self) -> bool {
        let previous = {
            let mut slot = self.slot.write().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *slot, Slot::Released)
        };
        self.loaded.store(false, Ordering::SeqCst);

        match previous {
            Slot::Ready(model) => {
                info!(device = %self.device, "releasing speech model");
                model.release();
                true
            }
            _ => false,
        }
    }

    /// Outcome already decided without loading: `None` means still empty.
    fn published(&self) -> Option<Result<Arc<dyn SpeechModel>>> {
        match &*self.slot.read().unwrap_or_else(|e| e.into_inner()) {
            Slot::Empty => None,
            Slot::Ready(model) => Some(Ok(model.clone())),
            Slot::Failed(msg) => Some(Err(Error::ModelLoad(msg.clone()))),
            Slot::Released => Some(Err(Error::ShuttingDown)),
        }
    }
}
