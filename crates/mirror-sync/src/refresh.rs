//! Remote content fetching and the URL refresher
//!
//! A data key ending in `.url` holds a pointer to externally fetched
//! content. [`ContentFetcher`] resolves those pointers (with the same
//! retry policy the webhook uses), and [`run_refresher`] re-resolves them
//! on a fixed interval, independent of watch or list events.

use std::path::Path;
use std::time::Duration;

use reqwest::Client;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::files::{ResolvedWrite, SharedMirror, lock_mirror, write_if_different};
use crate::notify::{ChangeNotice, RetryPolicy};
use crate::target::{SyncTarget, TargetContent};

/// Fetches remote-content references with retry-on-status semantics.
#[derive(Debug, Clone)]
pub struct ContentFetcher {
    client: Client,
    policy: RetryPolicy,
}

impl ContentFetcher {
    /// Creates a fetcher with the given retry policy.
    pub fn new(policy: RetryPolicy) -> Result<Self, SyncError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client, policy })
    }

    /// Fetches `url`, retrying statuses in the policy's retry set.
    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>, SyncError> {
        let mut backoff = self.policy.backoff();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.client.get(url).send().await {
                Ok(response) if response.status().is_success() => {
                    return Ok(response.bytes().await?.to_vec());
                }
                Ok(response) => {
                    let status = response.status().as_u16();
                    if self.policy.is_retryable(status) && attempt < self.policy.max_attempts {
                        let delay = backoff.next_backoff();
                        warn!(url, status, attempt, delay_secs = delay.as_secs(), "retrying fetch");
                        tokio::time::sleep(delay).await;
                    } else {
                        return Err(SyncError::FetchStatus {
                            url: url.to_string(),
                            status,
                        });
                    }
                }
                Err(e) => {
                    if attempt < self.policy.max_attempts {
                        let delay = backoff.next_backoff();
                        warn!(url, attempt, delay_secs = delay.as_secs(), "fetch failed: {e}");
                        tokio::time::sleep(delay).await;
                    } else {
                        return Err(e.into());
                    }
                }
            }
        }
    }

    /// Materializes resolved targets to writable bytes.
    ///
    /// Remote references whose fetch fails (after retries) are skipped
    /// with a warning; the remaining targets still sync.
    pub async fn materialize(&self, targets: Vec<SyncTarget>) -> Vec<ResolvedWrite> {
        let mut writes = Vec::with_capacity(targets.len());
        for target in targets {
            match target.content {
                TargetContent::Inline(bytes) => writes.push(ResolvedWrite {
                    path: target.path,
                    bytes,
                    source_url: None,
                }),
                TargetContent::Url(url) => match self.fetch(&url).await {
                    Ok(bytes) => writes.push(ResolvedWrite {
                        path: target.path,
                        bytes,
                        source_url: Some(url),
                    }),
                    Err(e) => {
                        warn!(path = %target.path.display(), "skipping remote content: {e}");
                    }
                },
            }
        }
        writes
    }
}

/// One refresh pass: re-fetch every tracked URL and rewrite targets whose
/// content differs. Returns whether anything changed. Purely additive to
/// the mirror; never deletes files.
pub async fn refresh_pass(state: &SharedMirror, fetcher: &ContentFetcher) -> bool {
    // Snapshot under the lock; fetches happen outside it.
    let sources = lock_mirror(state).url_sources();
    let mut changed = false;
    for (path, url) in sources {
        changed |= refresh_target(state, fetcher, &path, &url).await;
    }
    changed
}

/// Re-fetches one target and rewrites it if the content differs.
///
/// The fetch runs without the lock; the write re-checks under the lock
/// that the target is still tracked, so a resource deleted mid-fetch is
/// not resurrected as an untracked file.
async fn refresh_target(
    state: &SharedMirror,
    fetcher: &ContentFetcher,
    path: &Path,
    url: &str,
) -> bool {
    match fetcher.fetch(url).await {
        Ok(bytes) => {
            let mirror = lock_mirror(state);
            if !mirror.tracks_url(path, url) {
                debug!(path = %path.display(), "target removed during refresh, skipping");
                return false;
            }
            match write_if_different(path, &bytes) {
                Ok(true) => {
                    info!(path = %path.display(), url = %url, "refreshed remote content");
                    true
                }
                Ok(false) => false,
                Err(e) => {
                    warn!(path = %path.display(), "refresh write failed: {e}");
                    false
                }
            }
        }
        Err(e) => {
            warn!(url = %url, "refresh fetch failed, will retry next tick: {e}");
            false
        }
    }
}

/// Periodic refresher task. Runs until the process shuts down.
///
/// Callers only spawn this when the interval is non-zero.
pub async fn run_refresher(
    interval_secs: u64,
    state: SharedMirror,
    fetcher: ContentFetcher,
    tx: mpsc::Sender<ChangeNotice>,
) {
    info!(interval_secs, "remote content refresher started");
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; the watch/list path has
    // already fetched current content, so skip it.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        debug!("refresh tick");
        if refresh_pass(&state, &fetcher).await
            && tx.send(ChangeNotice::new("url refresh")).await.is_err()
        {
            debug!("change channel closed, stopping refresher");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::MirrorState;
    use crate::resource::{ResourceId, ResourceKind};
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Serves `first` on the first request and `rest` afterwards.
    async fn two_phase_server(
        first: &'static str,
        rest: &'static str,
        hits: Arc<AtomicUsize>,
    ) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let hit = hits.fetch_add(1, Ordering::SeqCst);
                let body = if hit == 0 { first } else { rest };
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_fetch_returns_body() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = two_phase_server("payload", "payload", hits).await;
        let fetcher = ContentFetcher::new(RetryPolicy::default()).unwrap();
        assert_eq!(fetcher.fetch(&url).await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_fetch_surfaces_non_retryable_status() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                    .await;
            }
        });
        let fetcher = ContentFetcher::new(RetryPolicy::default()).unwrap();
        let err = fetcher.fetch(&format!("http://{addr}")).await.unwrap_err();
        assert!(matches!(err, SyncError::FetchStatus { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_refresh_pass_rewrites_changed_content() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = two_phase_server("old", "new", hits).await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dashboard.json");

        let state: SharedMirror = Arc::new(Mutex::new(MirrorState::new(dir.path())));
        let fetcher = ContentFetcher::new(RetryPolicy::default()).unwrap();
        let id = ResourceId {
            kind: ResourceKind::ConfigMap,
            namespace: "ns1".to_string(),
            name: "cm1".to_string(),
        };
        let targets = fetcher
            .materialize(vec![SyncTarget {
                path: path.clone(),
                content: TargetContent::Url(url),
            }])
            .await;
        lock_mirror(&state).apply_item(&id, &targets).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"old");

        // Upstream now serves different bytes: the pass rewrites the file
        assert!(refresh_pass(&state, &fetcher).await);
        assert_eq!(std::fs::read(&path).unwrap(), b"new");

        // Content stable: no change, no notification would fire
        assert!(!refresh_pass(&state, &fetcher).await);
    }

    #[tokio::test]
    async fn test_refresh_skips_target_removed_mid_fetch() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = two_phase_server("old", "new", hits).await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dashboard.json");

        let state: SharedMirror = Arc::new(Mutex::new(MirrorState::new(dir.path())));
        let fetcher = ContentFetcher::new(RetryPolicy::default()).unwrap();
        let id = ResourceId {
            kind: ResourceKind::ConfigMap,
            namespace: "ns1".to_string(),
            name: "cm1".to_string(),
        };
        let targets = fetcher
            .materialize(vec![SyncTarget {
                path: path.clone(),
                content: TargetContent::Url(url.clone()),
            }])
            .await;
        lock_mirror(&state).apply_item(&id, &targets).unwrap();

        // Resource deleted after the refresher snapshotted (path, url)
        lock_mirror(&state).remove_item(&id).unwrap();
        assert!(!refresh_target(&state, &fetcher, &path, &url).await);
        assert!(!path.exists(), "deleted target must not be resurrected");
    }

    #[tokio::test]
    async fn test_materialize_skips_failed_fetch_but_keeps_inline() {
        let fetcher = ContentFetcher::new(RetryPolicy {
            retry_on: vec![],
            max_attempts: 1,
            backoff_min_secs: 0,
            backoff_max_secs: 0,
        })
        .unwrap();
        let writes = fetcher
            .materialize(vec![
                SyncTarget {
                    path: PathBuf::from("/mirror/a.json"),
                    content: TargetContent::Inline(b"1".to_vec()),
                },
                SyncTarget {
                    path: PathBuf::from("/mirror/b.json"),
                    content: TargetContent::Url("http://127.0.0.1:9/unreachable".to_string()),
                },
            ])
            .await;
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].path, PathBuf::from("/mirror/a.json"));
    }
}
