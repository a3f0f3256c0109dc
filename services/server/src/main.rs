use server::store::KvStore;
use server::{shutdown, store, AppState, Config};
use std::env;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration error");
            std::process::exit(2);
        }
    };

    let store = store::connect(&config).await;
    let bind_addr = config.bind_addr.clone();
    let state = AppState::new(config, store);

    server::spawn_background_tasks(&state);

    let router = server::build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("failed to bind");
    state.set_ready(true);
    info!(
        addr = %bind_addr,
        backend = state.store.backend_kind(),
        "server listening"
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown::run(state.clone()))
        .await
        .expect("server error");
    info!("server shut down gracefully");
}
