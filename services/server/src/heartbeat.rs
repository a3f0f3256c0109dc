//! Process-wide heartbeat publisher.
//!
//! A single task ticks at the configured interval (fixed, not jittered) and
//! fans a timestamp event out to every registered connection.  Heartbeats
//! are not persisted and not deduped; delivery is best-effort through the
//! per-connection queues.

use crate::registry::ConnEvent;
use crate::state::AppState;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub fn spawn(state: AppState, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(state.config.heartbeat_interval);
        // The first tick fires immediately; connections should wait a full
        // interval for their first heartbeat.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let ts = chrono::Local::now().to_rfc3339();
                    let snapshot = state.registry.snapshot().await;
                    debug!(connections = snapshot.len(), ts = %ts, "heartbeat tick");
                    for (_, handle) in snapshot {
                        handle.send(ConnEvent::Heartbeat { ts: ts.clone() });
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("heartbeat publisher stopped");
    })
}
