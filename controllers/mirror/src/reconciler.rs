//! One-shot list reconciliation.
//!
//! LIST mode performs exactly one full pass per configured resource kind:
//! list every matching item, converge the mirror, notify once if anything
//! changed, then return. A failed list is fatal to the pass. The watcher
//! reuses [`list_and_sync`] to seed its mirror and capture the initial
//! watch cursor.

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::Client;
use kube::api::{Api, ListParams};
use mirror_sync::{
    ContentFetcher, MirrorState, Notifier, ResolveOptions, ResourceItem, ResourceKind,
    SharedMirror, lock_mirror, resolve_targets,
};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use tracing::info;

use crate::config::Settings;
use crate::controller::api_for;
use crate::error::ControllerError;

/// Lists all matching resources of one kind and converges the mirror.
///
/// Returns the collection resource version (the initial watch cursor) and
/// whether anything on disk changed.
pub(crate) async fn list_and_sync<K>(
    api: &Api<K>,
    kind: ResourceKind,
    selector: &str,
    opts: &ResolveOptions,
    state: &SharedMirror,
    fetcher: &ContentFetcher,
    to_item: fn(K) -> Option<ResourceItem>,
) -> Result<(String, bool), ControllerError>
where
    K: Clone + DeserializeOwned + Debug,
{
    let params = ListParams::default().labels(selector);
    let list = api.list(&params).await?;
    let cursor = list.metadata.resource_version.clone().unwrap_or_default();

    let mut desired = Vec::with_capacity(list.items.len());
    for object in list {
        if let Some(item) = to_item(object) {
            let targets = resolve_targets(&item, opts);
            let writes = fetcher.materialize(targets).await;
            desired.push((item.id, writes));
        }
    }
    let count = desired.len();
    let changed = lock_mirror(state).sync_full(kind, desired)?;
    info!(%kind, items = count, changed, "list pass complete");
    Ok((cursor, changed))
}

/// Runs LIST mode: one reconciliation pass over every configured kind,
/// one notification if the mirror changed.
pub async fn run_list_pass(client: Client, settings: &Settings) -> Result<(), ControllerError> {
    let state: SharedMirror = Arc::new(Mutex::new(MirrorState::new(&settings.folder)));
    let fetcher = ContentFetcher::new(settings.retry.clone())?;
    let notifier = Notifier::new(
        settings.webhook.clone(),
        settings.script.clone(),
        settings.retry.clone(),
    )?;
    let selector = settings.label_selector();
    let opts = settings.resolve_options();

    let mut changed = false;
    for kind in &settings.kinds {
        let (_, kind_changed) = match kind {
            ResourceKind::ConfigMap => {
                let api: Api<ConfigMap> = api_for(&client, &settings.namespace);
                list_and_sync(
                    &api,
                    *kind,
                    &selector,
                    &opts,
                    &state,
                    &fetcher,
                    ResourceItem::from_config_map,
                )
                .await?
            }
            ResourceKind::Secret => {
                let api: Api<Secret> = api_for(&client, &settings.namespace);
                list_and_sync(
                    &api,
                    *kind,
                    &selector,
                    &opts,
                    &state,
                    &fetcher,
                    ResourceItem::from_secret,
                )
                .await?
            }
        };
        changed |= kind_changed;
    }

    if changed && notifier.is_configured() {
        info!("mirror changed, dispatching notification");
        notifier.dispatch().await;
    }
    Ok(())
}
