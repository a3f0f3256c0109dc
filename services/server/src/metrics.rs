//! Prometheus metrics for the connection runtime.
//!
//! All metrics live on a dedicated registry (not the global default) so that
//! tests can build isolated instances.  Exposition is the standard text
//! format on `GET /metrics`.

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder};

pub struct AppMetrics {
    registry: Registry,
    /// Currently open WebSocket connections.
    pub active_connections: IntGauge,
    /// Lifetime accepted WebSocket upgrades.
    pub connections_opened: IntCounter,
    /// Lifetime closed WebSocket connections.
    pub connections_closed: IntCounter,
    /// Size of the session registry.
    pub sessions_tracked: IntGauge,
    /// Frames received from clients.
    pub messages_total: IntCounter,
    /// Frames delivered to clients (echoes, heartbeats, broadcasts, byes).
    pub messages_sent: IntCounter,
    /// Internal handled errors.
    pub errors_total: IntCounter,
    /// Wall-clock time of graceful shutdown, observed once on completion.
    pub shutdown_duration: Histogram,
}

impl AppMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let active_connections = IntGauge::with_opts(Opts::new(
            "app_active_connections",
            "Currently open WebSocket connections",
        ))
        .expect("gauge opts");
        let connections_opened = IntCounter::with_opts(Opts::new(
            "app_connections_opened_total",
            "Accepted WebSocket upgrades",
        ))
        .expect("counter opts");
        let connections_closed = IntCounter::with_opts(Opts::new(
            "app_connections_closed_total",
            "Closed WebSocket connections",
        ))
        .expect("counter opts");
        let sessions_tracked = IntGauge::with_opts(Opts::new(
            "app_sessions_tracked",
            "Size of the session registry",
        ))
        .expect("gauge opts");
        let messages_total = IntCounter::with_opts(Opts::new(
            "app_messages_total",
            "Frames received from clients",
        ))
        .expect("counter opts");
        let messages_sent = IntCounter::with_opts(Opts::new(
            "app_messages_sent",
            "Frames delivered to clients",
        ))
        .expect("counter opts");
        let errors_total = IntCounter::with_opts(Opts::new(
            "app_errors_total",
            "Internal handled errors",
        ))
        .expect("counter opts");
        let shutdown_duration = Histogram::with_opts(HistogramOpts::new(
            "app_shutdown_duration_seconds",
            "Graceful shutdown wall-clock time",
        ))
        .expect("histogram opts");

        registry
            .register(Box::new(active_connections.clone()))
            .expect("register app_active_connections");
        registry
            .register(Box::new(connections_opened.clone()))
            .expect("register app_connections_opened_total");
        registry
            .register(Box::new(connections_closed.clone()))
            .expect("register app_connections_closed_total");
        registry
            .register(Box::new(sessions_tracked.clone()))
            .expect("register app_sessions_tracked");
        registry
            .register(Box::new(messages_total.clone()))
            .expect("register app_messages_total");
        registry
            .register(Box::new(messages_sent.clone()))
            .expect("register app_messages_sent");
        registry
            .register(Box::new(errors_total.clone()))
            .expect("register app_errors_total");
        registry
            .register(Box::new(shutdown_duration.clone()))
            .expect("register app_shutdown_duration_seconds");

        AppMetrics {
            registry,
            active_connections,
            connections_opened,
            connections_closed,
            sessions_tracked,
            messages_total,
            messages_sent,
            errors_total,
            shutdown_duration,
        }
    }

    /// Render the text exposition format.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if encoder
            .encode(&self.registry.gather(), &mut buffer)
            .is_err()
        {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for AppMetrics {
    fn default() -> Self {
        Self::new()
    }
}
