use anyhow::Result;
use rollcall_core::EuclideanMatcher;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod daemon;
mod dbus_interface;
mod engine;
mod extractor;
mod gallery;
mod session;

use daemon::Daemon;
use dbus_interface::{AttendanceService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = config::Config::load()?;
    let gallery = gallery::GalleryStore::load(&config.gallery_path, config.signature_dim)?;
    if gallery.is_empty() {
        tracing::warn!(path = %config.gallery_path.display(), "gallery is empty; nobody can be recognized");
    }

    let extractor = extractor::CommandExtractor::new(&config.extractor_command, config.signature_dim)?;
    let matcher = EuclideanMatcher::new(config.recognition_threshold);
    let engine = engine::spawn_engine(Box::new(extractor), matcher)?;

    let daemon = Arc::new(Daemon::new(config, gallery, engine));

    let _conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, AttendanceService::new(Arc::clone(&daemon)))?
        .build()
        .await?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");
    if let Some(summary) = daemon.end_session() {
        tracing::info!(session = %summary.session_id, marked = summary.records.len(), "active session closed");
    }

    Ok(())
}
