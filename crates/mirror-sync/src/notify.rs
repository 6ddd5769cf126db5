//! Notification dispatcher
//!
//! Delivers a webhook call and/or runs a script after a confirmed mirror
//! change. Notification is best-effort: the files are the source of
//! truth, so every failure here is logged and absorbed, and nothing ever
//! propagates back into the sync loop.

use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::backoff::FibonacciBackoff;
use crate::error::SyncError;

/// Which HTTP statuses are retried, and how often.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Status codes eligible for retry
    pub retry_on: Vec<u16>,
    /// Total attempts before giving up
    pub max_attempts: u32,
    /// First backoff delay in seconds
    pub backoff_min_secs: u64,
    /// Backoff cap in seconds
    pub backoff_max_secs: u64,
}

impl RetryPolicy {
    /// Whether a response status should be retried.
    #[must_use]
    pub fn is_retryable(&self, status: u16) -> bool {
        self.retry_on.contains(&status)
    }

    /// A fresh backoff sequence for one delivery.
    #[must_use]
    pub fn backoff(&self) -> FibonacciBackoff {
        FibonacciBackoff::new(self.backoff_min_secs, self.backoff_max_secs)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_on: vec![500, 502, 503, 504],
            max_attempts: 5,
            backoff_min_secs: 1,
            backoff_max_secs: 30,
        }
    }
}

/// HTTP form of the notification action.
#[derive(Debug, Clone)]
pub struct Webhook {
    /// Request method, e.g. `GET` or `POST`
    pub method: String,
    /// Request URL
    pub url: String,
    /// Optional request body, sent verbatim
    pub payload: Option<String>,
}

/// A confirmed on-disk change awaiting notification.
#[derive(Debug, Clone)]
pub struct ChangeNotice {
    /// Origin of the change, for logging
    pub origin: String,
}

impl ChangeNotice {
    /// Builds a notice tagged with its origin.
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
        }
    }
}

/// Delivers notification actions. Idempotent per logical change; safe to
/// invoke more than once.
#[derive(Debug, Clone)]
pub struct Notifier {
    client: Client,
    webhook: Option<Webhook>,
    script: Option<PathBuf>,
    policy: RetryPolicy,
}

impl Notifier {
    /// Creates a notifier from the configured actions.
    pub fn new(
        webhook: Option<Webhook>,
        script: Option<PathBuf>,
        policy: RetryPolicy,
    ) -> Result<Self, SyncError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            webhook,
            script,
            policy,
        })
    }

    /// Whether any action is configured.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.webhook.is_some() || self.script.is_some()
    }

    /// Runs both configured actions. Ordering between the webhook and the
    /// script is unspecified; both are always attempted.
    pub async fn dispatch(&self) {
        if let Some(hook) = &self.webhook {
            self.send_webhook(hook).await;
        }
        if let Some(script) = &self.script {
            run_script(script).await;
        }
    }

    async fn send_webhook(&self, hook: &Webhook) {
        let method =
            Method::from_bytes(hook.method.to_uppercase().as_bytes()).unwrap_or(Method::GET);
        let mut backoff = self.policy.backoff();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut request = self.client.request(method.clone(), &hook.url);
            if let Some(payload) = &hook.payload {
                if serde_json::from_str::<serde_json::Value>(payload).is_ok() {
                    request = request.header(CONTENT_TYPE, "application/json");
                }
                request = request.body(payload.clone());
            }
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(url = %hook.url, status = %response.status(), "webhook delivered");
                    return;
                }
                Ok(response) => {
                    let status = response.status().as_u16();
                    if self.policy.is_retryable(status) && attempt < self.policy.max_attempts {
                        let delay = backoff.next_backoff();
                        warn!(
                            url = %hook.url,
                            status,
                            attempt,
                            delay_secs = delay.as_secs(),
                            "webhook returned retryable status"
                        );
                        tokio::time::sleep(delay).await;
                    } else {
                        warn!(
                            url = %hook.url,
                            status,
                            attempts = attempt,
                            "webhook notification failed, giving up"
                        );
                        return;
                    }
                }
                Err(e) => {
                    if attempt < self.policy.max_attempts {
                        let delay = backoff.next_backoff();
                        warn!(
                            url = %hook.url,
                            attempt,
                            delay_secs = delay.as_secs(),
                            "webhook request failed: {e}"
                        );
                        tokio::time::sleep(delay).await;
                    } else {
                        error!(url = %hook.url, attempts = attempt, "webhook abandoned: {e}");
                        return;
                    }
                }
            }
        }
    }
}

/// Executes the notification script; a non-zero exit is logged, non-fatal.
async fn run_script(script: &Path) {
    match tokio::process::Command::new(script).status().await {
        Ok(status) if status.success() => {
            debug!(script = %script.display(), "notification script completed");
        }
        Ok(status) => {
            warn!(
                script = %script.display(),
                code = status.code(),
                "notification script exited non-zero"
            );
        }
        Err(e) => {
            error!(script = %script.display(), "failed to run notification script: {e}");
        }
    }
}

/// Dispatcher loop: one delivery per received change notice.
///
/// Ends when every sender is dropped, which happens on shutdown after the
/// sync tasks stop; in-flight retries are simply abandoned with the task.
pub async fn run_dispatcher(mut rx: mpsc::Receiver<ChangeNotice>, notifier: Notifier) {
    while let Some(notice) = rx.recv().await {
        debug!(origin = %notice.origin, "mirror changed, dispatching notification");
        notifier.dispatch().await;
    }
    debug!("notification dispatcher stopped");
}
