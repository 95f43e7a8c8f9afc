use anyhow::Context;
use meisai_storage::SqliteStore;
use std::sync::Arc;
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod config;
mod error;
mod routes;
mod state;

use config::{LogFormat, LoggingSettings, Settings};
use state::AppState;

fn init_tracing(logging: &LoggingSettings) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let registry = tracing_subscriber::registry().with(filter);
    match logging.format {
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(JsonStorageLayer)
            .with(BunyanFormattingLayer::new(
                env!("CARGO_PKG_NAME").to_string(),
                std::io::stdout,
            ))
            .init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::from_env().context("failed to load configuration")?;
    init_tracing(&settings.logging);

    let store = Arc::new(
        SqliteStore::connect(&settings.database.url)
            .await
            .with_context(|| format!("failed to open database {}", settings.database.url))?,
    );
    let state = AppState::build(&settings, store)
        .await
        .context("failed to initialise services")?;
    tracing::info!(
        indexed = state.admin.stats().total_records,
        detect_changes = settings.import.detect_changes,
        "hash index ready"
    );

    let app = routes::router(state, settings.server.max_upload_bytes);
    let listener = tokio::net::TcpListener::bind(&settings.server.bind)
        .await
        .with_context(|| format!("failed to bind {}", settings.server.bind))?;
    tracing::info!(addr = %settings.server.bind, "meisai server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await
        .context("server error")?;
    Ok(())
}
