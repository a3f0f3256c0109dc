//! Shared application state.

use crate::broadcast::Broadcaster;
use crate::config::Config;
use crate::metrics::AppMetrics;
use crate::registry::ConnectionRegistry;
use crate::store::KvStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};

/// Everything a handler or background task needs, cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn KvStore>,
    pub registry: ConnectionRegistry,
    pub metrics: Arc<AppMetrics>,
    pub broadcaster: Arc<Broadcaster>,
    ready: Arc<AtomicBool>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
    // Drain tracking: every connection task holds a clone of the sender; the
    // orchestrator drops the master copy and waits for `recv` to return None.
    drain_tx: Arc<std::sync::Mutex<Option<mpsc::Sender<()>>>>,
    drain_rx: Arc<Mutex<Option<mpsc::Receiver<()>>>>,
}

impl AppState {
    pub fn new(config: Config, store: Arc<dyn KvStore>) -> Self {
        let metrics = Arc::new(AppMetrics::new());
        let registry = ConnectionRegistry::new();
        let broadcaster = Arc::new(Broadcaster::new(
            Arc::clone(&store),
            registry.clone(),
            Arc::clone(&metrics),
            config.session_ttl,
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (drain_tx, drain_rx) = mpsc::channel(1);
        AppState {
            config: Arc::new(config),
            store,
            registry,
            metrics,
            broadcaster,
            ready: Arc::new(AtomicBool::new(false)),
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
            drain_tx: Arc::new(std::sync::Mutex::new(Some(drain_tx))),
            drain_rx: Arc::new(Mutex::new(Some(drain_rx))),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// A receiver that flips to `true` at the first shutdown signal.
    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    pub fn signal_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Guard held by a connection task for its lifetime; `None` once shutdown
    /// has started (the task is about to be drained anyway).
    pub fn drain_guard(&self) -> Option<mpsc::Sender<()>> {
        self.drain_tx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Take the drain receiver and drop the master sender, so that `recv`
    /// resolves to `None` once every connection task has finished.  Yields
    /// `None` on a second call.
    pub async fn take_drain_rx(&self) -> Option<mpsc::Receiver<()>> {
        self.drain_tx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        self.drain_rx.lock().await.take()
    }
}
