//! Kubernetes resource watchers.
//!
//! One long-lived task per watched resource kind, each driving the cycle
//! `LISTING -> STREAMING -> (stream error -> LISTING) -> ...`. A full
//! list seeds the mirror and captures the watch cursor; the change stream
//! then applies incremental events. Cursor expiry (410 Gone) or a stream
//! end triggers a full resync rather than incremental repair, which
//! guarantees eventual consistency after any gap. Transport failures
//! re-open the stream from the retained cursor after a bounded backoff.

use std::fmt::Debug;
use std::sync::Arc;

use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::{Api, WatchEvent, WatchParams};
use mirror_sync::{
    ChangeNotice, ContentFetcher, FibonacciBackoff, ResolveOptions, ResourceItem, ResourceKind,
    SharedMirror, lock_mirror, resolve_targets,
};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::ControllerError;
use crate::reconciler::list_and_sync;

/// Server-side watch timeout in seconds; the server closes the stream
/// after this long and the watcher relists.
const WATCH_TIMEOUT_SECS: u32 = 290;

/// Shared dependencies of every watch task.
#[derive(Debug)]
pub struct WatchContext {
    /// Label selector for list and watch calls
    pub selector: String,
    /// Target resolution options
    pub opts: ResolveOptions,
    /// Shared mirror state
    pub state: SharedMirror,
    /// Remote-content fetcher
    pub fetcher: ContentFetcher,
    /// Change channel feeding the notification dispatcher
    pub tx: mpsc::Sender<ChangeNotice>,
}

/// Queues a change notice without blocking event application.
///
/// A full channel drops the notice: the dispatcher is busy delivering an
/// earlier one, and delivery is idempotent per logical change, so the
/// next effective change renotifies.
fn send_notice(tx: &mpsc::Sender<ChangeNotice>, notice: ChangeNotice) {
    match tx.try_send(notice) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(notice)) => {
            warn!(origin = %notice.origin, "change channel full, dropping notice");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("change channel closed");
        }
    }
}

/// What an applied watch event asks of the outer loop.
enum EventOutcome {
    /// Keep streaming
    Continue,
    /// Cursor is stale; perform a full resync
    Resync,
}

/// Watches cluster resources and keeps the mirror converged.
pub struct Watcher {
    config_map_api: Api<ConfigMap>,
    secret_api: Api<Secret>,
    ctx: Arc<WatchContext>,
}

impl Watcher {
    /// Creates a new watcher instance.
    pub fn new(
        config_map_api: Api<ConfigMap>,
        secret_api: Api<Secret>,
        ctx: Arc<WatchContext>,
    ) -> Self {
        Self {
            config_map_api,
            secret_api,
            ctx,
        }
    }

    /// Watches ConfigMap resources until process termination.
    pub async fn watch_config_maps(&self) -> Result<(), ControllerError> {
        watch_resource(
            self.config_map_api.clone(),
            ResourceKind::ConfigMap,
            Arc::clone(&self.ctx),
            ResourceItem::from_config_map,
        )
        .await
    }

    /// Watches Secret resources until process termination.
    pub async fn watch_secrets(&self) -> Result<(), ControllerError> {
        watch_resource(
            self.secret_api.clone(),
            ResourceKind::Secret,
            Arc::clone(&self.ctx),
            ResourceItem::from_secret,
        )
        .await
    }
}

/// The per-kind watch cycle. Never returns during normal operation.
async fn watch_resource<K>(
    api: Api<K>,
    kind: ResourceKind,
    ctx: Arc<WatchContext>,
    to_item: fn(K) -> Option<ResourceItem>,
) -> Result<(), ControllerError>
where
    K: Clone + DeserializeOwned + Debug,
{
    info!(%kind, "starting watcher");
    let mut restart = FibonacciBackoff::new(1, 60);
    'cycle: loop {
        // LISTING: seed the mirror and capture the initial cursor
        let mut cursor = match list_and_sync(
            &api,
            kind,
            &ctx.selector,
            &ctx.opts,
            &ctx.state,
            &ctx.fetcher,
            to_item,
        )
        .await
        {
            Ok((cursor, changed)) => {
                restart.reset();
                if changed {
                    send_notice(&ctx.tx, ChangeNotice::new(format!("{kind} list sync")));
                }
                cursor
            }
            Err(e) => {
                let delay = restart.next_backoff();
                error!(%kind, delay_secs = delay.as_secs(), "list failed: {e}");
                tokio::time::sleep(delay).await;
                continue 'cycle;
            }
        };

        // STREAMING: apply incremental events from the cursor
        'stream: loop {
            let params = WatchParams::default()
                .labels(&ctx.selector)
                .timeout(WATCH_TIMEOUT_SECS);
            let stream = match api.watch(&params, &cursor).await {
                Ok(stream) => stream,
                Err(e) => {
                    // Cursor still valid; retry the stream after backoff
                    let delay = restart.next_backoff();
                    warn!(%kind, delay_secs = delay.as_secs(), "failed to open watch stream: {e}");
                    tokio::time::sleep(delay).await;
                    continue 'stream;
                }
            };
            let mut stream = stream.boxed();
            loop {
                match stream.try_next().await {
                    Ok(Some(event)) => {
                        match apply_event(event, kind, &ctx, to_item, &mut cursor).await {
                            Ok(EventOutcome::Continue) => restart.reset(),
                            Ok(EventOutcome::Resync) => {
                                info!(%kind, "watch cursor expired, resyncing");
                                continue 'cycle;
                            }
                            Err(e) => {
                                // Filesystem errors fail the pass; a fresh
                                // cycle re-converges from a full list
                                let delay = restart.next_backoff();
                                error!(%kind, delay_secs = delay.as_secs(), "sync failed, restarting cycle: {e}");
                                tokio::time::sleep(delay).await;
                                continue 'cycle;
                            }
                        }
                    }
                    Ok(None) => {
                        debug!(%kind, "watch stream ended, relisting");
                        continue 'cycle;
                    }
                    Err(e) => {
                        let delay = restart.next_backoff();
                        warn!(%kind, delay_secs = delay.as_secs(), "watch stream error: {e}");
                        tokio::time::sleep(delay).await;
                        continue 'stream;
                    }
                }
            }
        }
    }
}

/// Applies one delivered event to the mirror and advances the cursor.
async fn apply_event<K>(
    event: WatchEvent<K>,
    kind: ResourceKind,
    ctx: &WatchContext,
    to_item: fn(K) -> Option<ResourceItem>,
    cursor: &mut String,
) -> Result<EventOutcome, ControllerError>
where
    K: Clone + DeserializeOwned + Debug,
{
    match event {
        WatchEvent::Added(object) | WatchEvent::Modified(object) => {
            if let Some(item) = to_item(object) {
                if let Some(version) = &item.resource_version {
                    cursor.clone_from(version);
                }
                let targets = resolve_targets(&item, &ctx.opts);
                let writes = ctx.fetcher.materialize(targets).await;
                let changed = lock_mirror(&ctx.state).apply_item(&item.id, &writes)?;
                if changed {
                    debug!(resource = %item.id, "applied change event");
                    send_notice(&ctx.tx, ChangeNotice::new(format!("watch {}", item.id)));
                }
            }
            Ok(EventOutcome::Continue)
        }
        WatchEvent::Deleted(object) => {
            if let Some(item) = to_item(object) {
                if let Some(version) = &item.resource_version {
                    cursor.clone_from(version);
                }
                let changed = lock_mirror(&ctx.state).remove_item(&item.id)?;
                if changed {
                    debug!(resource = %item.id, "applied delete event");
                    send_notice(&ctx.tx, ChangeNotice::new(format!("delete {}", item.id)));
                }
            }
            Ok(EventOutcome::Continue)
        }
        WatchEvent::Bookmark(bookmark) => {
            *cursor = bookmark.metadata.resource_version;
            Ok(EventOutcome::Continue)
        }
        WatchEvent::Error(err) if err.code == 410 => Ok(EventOutcome::Resync),
        WatchEvent::Error(err) => {
            warn!(%kind, code = err.code, "watch error event, resyncing: {}", err.message);
            Ok(EventOutcome::Resync)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::core::ErrorResponse;
    use mirror_sync::{MirrorState, RetryPolicy};
    use std::path::Path;
    use std::sync::Mutex;

    fn context(root: &Path, capacity: usize) -> (Arc<WatchContext>, mpsc::Receiver<ChangeNotice>) {
        let (tx, rx) = mpsc::channel(capacity);
        let ctx = WatchContext {
            selector: "app".to_string(),
            opts: ResolveOptions {
                root: root.to_path_buf(),
                folder_annotation: mirror_sync::DEFAULT_FOLDER_ANNOTATION.to_string(),
                unique_filenames: false,
            },
            state: Arc::new(Mutex::new(MirrorState::new(root))),
            fetcher: ContentFetcher::new(RetryPolicy::default()).unwrap(),
            tx,
        };
        (Arc::new(ctx), rx)
    }

    fn config_map(name: &str, version: &str, data: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns1".to_string()),
                resource_version: Some(version.to_string()),
                ..Default::default()
            },
            data: Some(
                data.iter()
                    .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    fn gone() -> ErrorResponse {
        ErrorResponse {
            status: "Failure".to_string(),
            message: "too old resource version".to_string(),
            reason: "Expired".to_string(),
            code: 410,
        }
    }

    #[tokio::test]
    async fn test_gone_error_event_requests_resync() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _rx) = context(dir.path(), 8);
        let mut cursor = "5".to_string();
        let outcome = apply_event::<ConfigMap>(
            WatchEvent::Error(gone()),
            ResourceKind::ConfigMap,
            &ctx,
            ResourceItem::from_config_map,
            &mut cursor,
        )
        .await
        .unwrap();
        assert!(matches!(outcome, EventOutcome::Resync));
        assert_eq!(cursor, "5", "relist replaces the cursor, not the event");
    }

    #[tokio::test]
    async fn test_added_event_writes_file_advances_cursor_and_notifies() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, mut rx) = context(dir.path(), 8);
        let mut cursor = "1".to_string();
        let outcome = apply_event(
            WatchEvent::Added(config_map("cm1", "2", &[("a.json", "1")])),
            ResourceKind::ConfigMap,
            &ctx,
            ResourceItem::from_config_map,
            &mut cursor,
        )
        .await
        .unwrap();
        assert!(matches!(outcome, EventOutcome::Continue));
        assert_eq!(cursor, "2");
        assert_eq!(std::fs::read(dir.path().join("a.json")).unwrap(), b"1");
        assert!(rx.try_recv().is_ok(), "an effective change must notify");
    }

    #[tokio::test]
    async fn test_redelivered_identical_event_suppresses_notice() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, mut rx) = context(dir.path(), 8);
        let mut cursor = "1".to_string();
        for version in ["2", "3"] {
            apply_event(
                WatchEvent::Modified(config_map("cm1", version, &[("a.json", "1")])),
                ResourceKind::ConfigMap,
                &ctx,
                ResourceItem::from_config_map,
                &mut cursor,
            )
            .await
            .unwrap();
        }
        assert_eq!(cursor, "3", "cursor advances even without a write");
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err(), "identical content must not renotify");
    }

    #[tokio::test]
    async fn test_deleted_event_removes_file_and_notifies() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, mut rx) = context(dir.path(), 8);
        let mut cursor = "1".to_string();
        apply_event(
            WatchEvent::Added(config_map("cm1", "2", &[("a.json", "1")])),
            ResourceKind::ConfigMap,
            &ctx,
            ResourceItem::from_config_map,
            &mut cursor,
        )
        .await
        .unwrap();
        rx.try_recv().unwrap();

        let outcome = apply_event(
            WatchEvent::Deleted(config_map("cm1", "3", &[("a.json", "1")])),
            ResourceKind::ConfigMap,
            &ctx,
            ResourceItem::from_config_map,
            &mut cursor,
        )
        .await
        .unwrap();
        assert!(matches!(outcome, EventOutcome::Continue));
        assert!(!dir.path().join("a.json").exists());
        assert!(rx.try_recv().is_ok(), "a delete must notify");
    }

    #[tokio::test]
    async fn test_full_change_channel_does_not_stall_event_application() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, mut rx) = context(dir.path(), 1);
        ctx.tx.try_send(ChangeNotice::new("backlog")).unwrap();

        let mut cursor = "1".to_string();
        let outcome = apply_event(
            WatchEvent::Added(config_map("cm1", "2", &[("a.json", "1")])),
            ResourceKind::ConfigMap,
            &ctx,
            ResourceItem::from_config_map,
            &mut cursor,
        )
        .await
        .unwrap();
        // The sync still lands; only the notice is dropped
        assert!(matches!(outcome, EventOutcome::Continue));
        assert_eq!(std::fs::read(dir.path().join("a.json")).unwrap(), b"1");
        assert_eq!(rx.try_recv().unwrap().origin, "backlog");
        assert!(rx.try_recv().is_err());
    }
}
