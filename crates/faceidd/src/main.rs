use anyhow::{Context, Result};
use faceid_core::{IdentityIndex, IndexHandle};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use config::{BusKind, Config};
use dbus_interface::{FaceIdService, BUS_NAME, OBJECT_PATH};
use engine::EngineSettings;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    tracing::info!(
        model_dir = %config.model_dir.display(),
        index = %config.index_path.display(),
        workers = config.workers,
        bus = ?config.bus,
        "faceidd starting"
    );

    // Missing models or an unusable index are fatal.
    let index = IdentityIndex::load(&config.index_path)
        .with_context(|| format!("loading identity index {}", config.index_path.display()))?;
    let index = Arc::new(IndexHandle::new(index).context("identity index has no entries")?);
    tracing::info!(
        entries = index.current().len(),
        labels = index.current().vocabulary().len(),
        "identity index loaded"
    );

    let paths = config.model_paths();
    let pipelines = (0..config.workers)
        .map(|_| faceid_core::load_models(&paths))
        .collect::<Result<Vec<_>, _>>()
        .context("loading face models")?;

    let engine = engine::spawn_engine(
        pipelines,
        index,
        EngineSettings {
            index_path: config.index_path.clone(),
            corpus_dir: config.corpus_dir.clone(),
            k: config.k,
        },
    )?;

    let service = FaceIdService::new(engine, config.index_path.clone());
    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("registering on D-Bus")?;

    tracing::info!(name = BUS_NAME, path = OBJECT_PATH, "faceidd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("faceidd shutting down");

    Ok(())
}
