use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rollcall_core::OnnxFaceEncoder;
use rollcall_hw::V4lFrameSource;
use rollcall_store::{SqliteStore, UriImageFetcher};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod status;

use config::{BusKind, Config};
use dbus_interface::{RollcallService, StreamSettings, BUS_NAME, OBJECT_PATH};
use engine::Controller;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "rollcalld starting");

    let config = Config::load()?;

    let store = Arc::new(
        SqliteStore::open(&config.db_path)
            .with_context(|| format!("failed to open database {}", config.db_path.display()))?,
    );

    let encoder = OnnxFaceEncoder::load(&config.model_dir)
        .with_context(|| format!("failed to load face models from {}", config.model_dir.display()))?;
    tracing::info!(dir = %config.model_dir.display(), "face models loaded");

    let frames = V4lFrameSource::new(config.camera_indices.clone(), config.capture_settings());
    let fetcher = UriImageFetcher::new(Duration::from_secs(config.fetch_timeout_secs));

    let controller = Arc::new(Controller::new(
        config.loop_settings(),
        store.clone(),
        Arc::new(fetcher),
        store.clone(),
        Box::new(encoder),
        Box::new(frames),
    ));

    let service = RollcallService::new(controller.clone(), store, StreamSettings::from(&config));
    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    let state = tokio::task::spawn_blocking(move || controller.stop()).await?;
    tracing::info!(state = state.as_str(), "recognition loop released");

    Ok(())
}
