//! Graceful shutdown orchestration.
//!
//! On SIGTERM (or Ctrl-C) the orchestrator runs a phased drain under the
//! configured hard deadline: stop advertising readiness and halt the
//! periodic publishers, tell every connection to say goodbye, wait for the
//! connection tasks to finish, then release the store.  A second signal
//! while draining does not reset the deadline; the process exits 0 either
//! way, since the deadline bounds cleanup rather than marking failure.

use crate::registry::ConnEvent;
use crate::state::AppState;
use crate::store::KvStore;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Bound on waiting for connection tasks to finish their drain.
const CONNECTION_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
pub async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}

/// Signal handler plus drain; the returned future resolves once the drain is
/// complete, which releases the HTTP server's graceful-shutdown gate.
pub async fn run(state: AppState) {
    shutdown_signal().await;
    graceful(state).await;
}

/// Run the phased drain.  Also callable directly (tests, lifespan events).
pub async fn graceful(state: AppState) {
    let started = Instant::now();
    let deadline = started + state.config.shutdown_timeout;

    // Stop advertising readiness and halt the heartbeat publisher and the
    // broadcast subscriber.
    state.set_ready(false);
    state.signal_shutdown();

    // Tell every registered connection to drain.
    let snapshot = state.registry.snapshot().await;
    info!(connections = snapshot.len(), "notifying connections of shutdown");
    for (_, handle) in snapshot {
        handle.send(ConnEvent::Shutdown);
    }

    // Wait for the connection tasks, bounded by the drain budget and the
    // overall deadline.
    if let Some(mut drain_rx) = state.take_drain_rx().await {
        let budget = CONNECTION_DRAIN_TIMEOUT.min(deadline.saturating_duration_since(Instant::now()));
        match tokio::time::timeout(budget, drain_rx.recv()).await {
            Ok(None) => info!("all connections drained"),
            Ok(Some(())) => {}
            Err(_) => {
                state.metrics.errors_total.inc();
                let remaining = state.registry.len().await;
                warn!(remaining, "connection drain deadline exceeded, proceeding");
            }
        }
    }

    // The store adapter goes down with the process; nothing to flush.
    info!(backend = state.store.backend_kind(), "releasing store adapter");

    // Record and report.
    let elapsed = started.elapsed();
    state.metrics.shutdown_duration.observe(elapsed.as_secs_f64());
    if Instant::now() > deadline {
        warn!(elapsed_ms = elapsed.as_millis() as u64, "shutdown exceeded hard deadline");
    } else {
        info!(elapsed_ms = elapsed.as_millis() as u64, "graceful shutdown complete");
    }
}
