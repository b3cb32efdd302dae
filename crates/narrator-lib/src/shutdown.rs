//! Shutdown hooks — release the model on SIGINT, SIGTERM and normal exit.
//!
//! Signals are armed once, before the model preload, with
//! [`ShutdownSignal::os`]. The same handle then drives the HTTP server, so a
//! signal at any point after startup reaches the [`ShutdownHook`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::lifecycle::ModelManager;

/// Single entry point for teardown. Runs at most once; safe when the model
/// was never loaded. Also fires on drop, which covers normal exit.
pub struct ShutdownHook {
    manager: Arc<ModelManager>,
    fired: AtomicBool,
}

impl ShutdownHook {
    pub fn new(manager: Arc<ModelManager>) -> Self {
        Self {
            manager,
            fired: AtomicBool::new(false),
        }
    }

    /// Release the model. Returns false if the hook already ran.
    pub fn shutdown(&self) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        info!("shutdown: releasing model");
        let released = self.manager.release();
        info!(released, "shutdown: cleanup complete");
        true
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    pub fn manager(&self) -> &Arc<ModelManager> {
        &self.manager
    }
}

impl Drop for ShutdownHook {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Cloneable, already-armed shutdown notification.
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

/// Fires a [`ShutdownSignal`] by hand.
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn fire(&self) {
        let _ = self.tx.send(true);
    }
}

impl ShutdownSignal {
    /// Install the SIGINT/SIGTERM handlers now and fire on the first one.
    pub fn os() -> Self {
        let (trigger, signal) = Self::manual();
        tokio::spawn(async move {
            let name = shutdown_signal().await;
            info!(signal = name, "shutdown signal received");
            trigger.fire();
        });
        signal
    }

    pub fn manual() -> (ShutdownTrigger, Self) {
        let (tx, rx) = watch::channel(false);
        (ShutdownTrigger { tx }, Self { rx })
    }

    pub fn has_fired(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once fired. A trigger dropped without firing never resolves.
    pub async fn fired(mut self) {
        if self.rx.wait_for(|fired| *fired).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Load the model ahead of the first request.
///
/// A shutdown signal during the load drops the in-flight load (a spawned
/// sidecar is killed with it) and fires the hook. Returns false in that case.
/// A load failure is only logged: requests keep reporting it.
pub async fn preload(hook: &ShutdownHook, signal: ShutdownSignal) -> bool {
    tokio::select! {
        biased;
        _ = signal.fired() => {
            info!("shutdown during model preload");
            hook.shutdown();
            false
        }
        res = hook.manager().ensure_loaded() => {
            if let Err(e) = res {
                warn!("model preload failed, requests will report it: {e}");
            }
            true
        }
    }
}

/// Resolves on SIGINT (Ctrl+C) or SIGTERM. Returns the signal name.
pub async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT",
        _ = terminate => "SIGTERM",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelLoader, SpeechModel};
    use crate::testing::{CountingLoader, ToneModel};
    use async_trait::async_trait;
    use narrator_core::types::Device;
    use narrator_core::{Error, Result};
    use std::time::Duration;

    struct SetOnDrop(Arc<AtomicBool>);

    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    /// Load that never finishes, like a sidecar stuck in startup.
    struct StuckLoader {
        abandoned: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ModelLoader for StuckLoader {
        async fn load(&self, _device: Device) -> Result<Box<dyn SpeechModel>> {
            let _sidecar = SetOnDrop(self.abandoned.clone());
            std::future::pending::<Result<Box<dyn SpeechModel>>>().await
        }
    }

    #[tokio::test]
    async fn shutdown_runs_once_and_releases() {
        let model = ToneModel::default();
        let released = model.released.clone();
        let manager = Arc::new(ModelManager::new(
            Device::Cpu,
            CountingLoader::new(move || model.clone()),
        ));
        manager.ensure_loaded().await.unwrap();

        let hook = ShutdownHook::new(manager.clone());
        assert!(hook.shutdown());
        assert!(!hook.shutdown());
        assert!(hook.has_fired());
        assert!(!manager.is_loaded());
        drop(hook);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_releases_unloaded_manager_safely() {
        let manager = Arc::new(ModelManager::new(
            Device::Cpu,
            CountingLoader::new(ToneModel::default),
        ));
        drop(ShutdownHook::new(manager.clone()));
        assert!(!manager.is_loaded());
        assert!(!manager.release());
    }

    #[tokio::test]
    async fn signal_during_preload_cancels_load_and_fires_hook() {
        let abandoned = Arc::new(AtomicBool::new(false));
        let manager = Arc::new(ModelManager::new(
            Device::Cpu,
            StuckLoader {
                abandoned: abandoned.clone(),
            },
        ));
        let hook = ShutdownHook::new(manager.clone());
        let (trigger, signal) = ShutdownSignal::manual();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.fire();
        });

        let loaded = tokio::time::timeout(Duration::from_secs(5), preload(&hook, signal))
            .await
            .unwrap();

        assert!(!loaded);
        assert!(hook.has_fired());
        assert!(abandoned.load(Ordering::SeqCst));
        assert!(matches!(manager.ensure_loaded().await, Err(Error::ShuttingDown)));
    }

    #[tokio::test]
    async fn signal_before_preload_skips_the_load() {
        let loader = CountingLoader::new(ToneModel::default);
        let loads = loader.loads.clone();
        let manager = Arc::new(ModelManager::new(Device::Cpu, loader));
        let hook = ShutdownHook::new(manager.clone());
        let (trigger, signal) = ShutdownSignal::manual();
        trigger.fire();

        assert!(signal.has_fired());
        assert!(!preload(&hook, signal).await);
        assert_eq!(loads.load(Ordering::SeqCst), 0);
        assert!(hook.has_fired());
    }

    #[tokio::test]
    async fn preload_without_signal_loads_model() {
        let manager = Arc::new(ModelManager::new(
            Device::Cpu,
            CountingLoader::new(ToneModel::default),
        ));
        let hook = ShutdownHook::new(manager.clone());
        let (_trigger, signal) = ShutdownSignal::manual();

        assert!(preload(&hook, signal.clone()).await);
        assert!(manager.is_loaded());
        assert!(!signal.has_fired());
        assert!(!hook.has_fired());
    }

    #[tokio::test]
    async fn failed_preload_keeps_running() {
        let manager = Arc::new(ModelManager::new(
            Device::Cpu,
            CountingLoader::failing("weights not found"),
        ));
        let hook = ShutdownHook::new(manager.clone());
        let (_trigger, signal) = ShutdownSignal::manual();

        assert!(preload(&hook, signal).await);
        assert!(!hook.has_fired());
        assert_eq!(manager.load_error().as_deref(), Some("weights not found"));
    }
}
