//! Resource Mirror Sidecar
//!
//! Mirrors a labeled subset of cluster ConfigMaps and Secrets onto a
//! local filesystem, and optionally notifies other processes (webhook
//! and/or script) when the mirror changes. Runs either as a one-shot
//! LIST pass or as a resident WATCH loop alongside the workload that
//! consumes the files.

mod config;
mod controller;
mod error;
mod reconciler;
mod watcher;

use crate::config::{Mode, Settings};
use crate::controller::{Controller, build_client};
use crate::error::ControllerError;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt::init();

    info!("Starting resource mirror sidecar");

    let settings = Settings::from_env()?;
    let kinds: Vec<&str> = settings.kinds.iter().map(|k| k.as_str()).collect();
    info!("Configuration:");
    info!("  Mode: {:?}", settings.mode);
    info!("  Label selector: {}", settings.label_selector());
    info!("  Resource kinds: {}", kinds.join(", "));
    info!("  Mirror root: {}", settings.folder.display());
    info!("  Namespace scope: {:?}", settings.namespace);
    if settings.unique_filenames {
        info!("  Unique filenames will be enforced");
    }
    if settings.url_refresh_interval > 0 {
        info!(
            "  Remote content refresh enabled, interval {}s",
            settings.url_refresh_interval
        );
    }

    let client = build_client(&settings).await?;

    match settings.mode {
        Mode::List => reconciler::run_list_pass(client, &settings).await?,
        Mode::Watch => {
            let controller = Controller::new(client, &settings)?;
            controller.run().await?;
        }
    }

    Ok(())
}
