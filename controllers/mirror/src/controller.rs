//! Main controller implementation.
//!
//! Builds the kube client, wires the shared mirror state, the change
//! channel, and the notification dispatcher together, and runs one watch
//! task per configured resource kind plus the optional remote-content
//! refresher.

use std::sync::{Arc, Mutex};

use k8s_openapi::NamespaceResourceScope;
use kube::api::Api;
use kube::{Client, Resource};
use mirror_sync::{
    ContentFetcher, MirrorState, Notifier, ResourceKind, SharedMirror, run_dispatcher,
    run_refresher,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{NamespaceScope, Settings};
use crate::error::ControllerError;
use crate::watcher::{WatchContext, Watcher};

/// Buffered change notices between sync tasks and the dispatcher.
const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Builds the cluster API client from inferred configuration.
pub async fn build_client(settings: &Settings) -> Result<Client, ControllerError> {
    let mut config = kube::Config::infer().await?;
    if settings.skip_tls_verify {
        warn!("TLS certificate validation for the cluster API is disabled");
        config.accept_invalid_certs = true;
    }
    info!(cluster = %config.cluster_url, "cluster API config loaded");
    Ok(Client::try_from(config)?)
}

/// Builds an API handle scoped to the configured namespace.
pub(crate) fn api_for<K>(client: &Client, scope: &NamespaceScope) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match scope {
        NamespaceScope::Current => Api::default_namespaced(client.clone()),
        NamespaceScope::All => Api::all(client.clone()),
        NamespaceScope::Named(namespace) => Api::namespaced(client.clone(), namespace),
    }
}

/// Resident WATCH-mode controller.
pub struct Controller {
    watchers: Vec<(ResourceKind, JoinHandle<Result<(), ControllerError>>)>,
    dispatcher: JoinHandle<()>,
    refresher: Option<JoinHandle<()>>,
}

impl Controller {
    /// Creates the controller and spawns its background tasks.
    pub fn new(client: Client, settings: &Settings) -> Result<Self, ControllerError> {
        let state: SharedMirror = Arc::new(Mutex::new(MirrorState::new(&settings.folder)));
        let fetcher = ContentFetcher::new(settings.retry.clone())?;
        let notifier = Notifier::new(
            settings.webhook.clone(),
            settings.script.clone(),
            settings.retry.clone(),
        )?;
        if !notifier.is_configured() {
            info!("no webhook or script configured, changes will only be mirrored");
        }

        let (tx, rx) = mpsc::channel(CHANGE_CHANNEL_CAPACITY);
        let dispatcher = tokio::spawn(run_dispatcher(rx, notifier));
        let refresher = (settings.url_refresh_interval > 0).then(|| {
            tokio::spawn(run_refresher(
                settings.url_refresh_interval,
                Arc::clone(&state),
                fetcher.clone(),
                tx.clone(),
            ))
        });

        let ctx = Arc::new(WatchContext {
            selector: settings.label_selector(),
            opts: settings.resolve_options(),
            state,
            fetcher,
            tx,
        });
        let watcher = Arc::new(Watcher::new(
            api_for(&client, &settings.namespace),
            api_for(&client, &settings.namespace),
            ctx,
        ));

        let mut watchers = Vec::with_capacity(settings.kinds.len());
        for kind in &settings.kinds {
            let watcher = Arc::clone(&watcher);
            let kind = *kind;
            let handle = tokio::spawn(async move {
                match kind {
                    ResourceKind::ConfigMap => watcher.watch_config_maps().await,
                    ResourceKind::Secret => watcher.watch_secrets().await,
                }
            });
            watchers.push((kind, handle));
        }

        Ok(Self {
            watchers,
            dispatcher,
            refresher,
        })
    }

    /// Runs until a watcher exits, which in watch mode only happens on
    /// failure; there is no normal exit path.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("resource mirror running");
        let (kinds, handles): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.watchers).into_iter().unzip();
        let (result, index, _remaining) = futures::future::select_all(handles).await;
        let kind = kinds[index];

        self.dispatcher.abort();
        if let Some(refresher) = self.refresher.take() {
            refresher.abort();
        }

        match result {
            Ok(Ok(())) => Err(ControllerError::Watch(format!(
                "{kind} watcher exited unexpectedly"
            ))),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(ControllerError::Watch(format!("{kind} watcher panicked: {e}"))),
        }
    }
}
