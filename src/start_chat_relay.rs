//! Startup helpers for the chat relay server.

use std::process::ExitCode;
use std::sync::Arc;

use crate::chat::SessionSweeper;
use crate::chat::core::AppConfig;
use crate::server::{self, AppState};

/// Run the server (used by the `chat-relay-server` binary).
///
/// Configuration problems are reported before the listener binds.
///
/// # Returns
/// `ExitCode::SUCCESS` on graceful shutdown, `1` on failure.
#[must_use]
pub fn run() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("Starting chat relay v{}", env!("CARGO_PKG_VERSION"));

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Invalid configuration: {e}");
            return ExitCode::from(1);
        }
    };
    tracing::info!(
        provider = %config.provider.kind,
        base_url = %config.provider.base_url(),
        model = %config.model,
        history = ?config.attachments.history,
        "configuration loaded"
    );

    let state = match AppState::new(&config) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Failed to create state: {e}");
            return ExitCode::from(1);
        }
    };

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("Failed to create runtime: {e}");
            return ExitCode::from(1);
        }
    };

    if let Err(e) = rt.block_on(serve(state, &config)) {
        tracing::error!("Server error: {e}");
        return ExitCode::from(1);
    }

    ExitCode::SUCCESS
}

/// Serve until Ctrl-C, with the idle-session sweeper running alongside.
///
/// # Errors
/// Returns an error if the server fails.
pub async fn serve(state: Arc<AppState>, config: &AppConfig) -> Result<(), std::io::Error> {
    let sweeper = SessionSweeper::new(Arc::clone(&state.sessions), &config.sessions);
    let stop_sweeper = sweeper.shutdown_notifier();
    let sweeper_handle = sweeper.spawn();

    let result = server::run_server_with_shutdown(state, config.server.port, shutdown_signal()).await;

    stop_sweeper.notify_one();
    if let Err(e) = sweeper_handle.await {
        tracing::warn!("Session sweeper ended abnormally: {e}");
    }
    result
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Shutdown requested"),
        Err(e) => {
            tracing::warn!("Cannot listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    }
}
