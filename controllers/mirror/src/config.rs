//! Environment-driven configuration.
//!
//! The sidecar is configured entirely through environment variables; this
//! module turns them into a typed [`Settings`] value up front so that
//! every configuration error is fatal before any sync loop starts.

use std::env;
use std::path::PathBuf;

use mirror_sync::{
    DEFAULT_FOLDER_ANNOTATION, ResolveOptions, ResourceKind, RetryPolicy, Webhook,
};

use crate::error::ControllerError;

/// Operating mode selected by `METHOD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// One full reconciliation pass, then exit
    List,
    /// Resident watch, no normal exit path
    Watch,
}

/// Which namespaces to query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamespaceScope {
    /// The namespace the sidecar runs in
    Current,
    /// Every namespace
    All,
    /// A specific namespace
    Named(String),
}

/// Fully parsed sidecar settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// LIST or WATCH
    pub mode: Mode,
    /// Selector label key
    pub label: String,
    /// Selector label value; absent means match on label presence
    pub label_value: Option<String>,
    /// Resource kinds to mirror
    pub kinds: Vec<ResourceKind>,
    /// Mirror root directory
    pub folder: PathBuf,
    /// Annotation carrying the per-item subfolder override
    pub folder_annotation: String,
    /// Namespace scope for queries
    pub namespace: NamespaceScope,
    /// Filename collision policy
    pub unique_filenames: bool,
    /// Webhook notification, when configured
    pub webhook: Option<Webhook>,
    /// Script notification, when configured
    pub script: Option<PathBuf>,
    /// Retry policy for webhook calls and remote-content fetches
    pub retry: RetryPolicy,
    /// Remote-content refresh period in seconds; 0 disables
    pub url_refresh_interval: u64,
    /// Disable certificate validation on the cluster API connection
    pub skip_tls_verify: bool,
}

impl Settings {
    /// Reads settings from the process environment.
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Reads settings through a lookup function (injectable for tests).
    pub(crate) fn from_lookup(
        get: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ControllerError> {
        let label = get("LABEL").ok_or_else(|| {
            ControllerError::InvalidConfig("LABEL environment variable is required".to_string())
        })?;
        let folder = get("FOLDER").map(PathBuf::from).ok_or_else(|| {
            ControllerError::InvalidConfig("FOLDER environment variable is required".to_string())
        })?;

        let resource = get("RESOURCE").unwrap_or_else(|| "configmap".to_string());
        let kinds = ResourceKind::parse_selection(&resource).ok_or_else(|| {
            ControllerError::InvalidConfig(format!(
                "RESOURCE must be configmap, secret, or both, got '{resource}'"
            ))
        })?;

        let mode = match get("METHOD").as_deref() {
            Some("LIST") => Mode::List,
            _ => Mode::Watch,
        };

        let namespace = match get("NAMESPACE") {
            None => NamespaceScope::Current,
            Some(ns) if ns == "ALL" => NamespaceScope::All,
            Some(ns) => NamespaceScope::Named(ns),
        };

        let webhook = get("REQ_URL").map(|url| Webhook {
            method: get("REQ_METHOD").unwrap_or_else(|| "GET".to_string()),
            url,
            payload: get("REQ_PAYLOAD"),
        });

        let retry_raw = get("URL_RETRY_ON").unwrap_or_else(|| "500,502,503,504".to_string());
        let retry_on = parse_retry_on(&retry_raw).ok_or_else(|| {
            ControllerError::InvalidConfig(format!(
                "URL_RETRY_ON must be a comma-separated list of status codes, got '{retry_raw}'"
            ))
        })?;

        let url_refresh_interval = match get("URL_REFRESH_INTERVAL") {
            None => 0,
            Some(raw) => raw.parse().map_err(|_| {
                ControllerError::InvalidConfig(format!(
                    "URL_REFRESH_INTERVAL must be an integer, got '{raw}'"
                ))
            })?,
        };

        Ok(Self {
            mode,
            label,
            label_value: get("LABEL_VALUE"),
            kinds,
            folder,
            folder_annotation: get("FOLDER_ANNOTATION")
                .unwrap_or_else(|| DEFAULT_FOLDER_ANNOTATION.to_string()),
            namespace,
            unique_filenames: get("UNIQUE_FILENAMES")
                .is_some_and(|v| v.eq_ignore_ascii_case("true")),
            webhook,
            script: get("SCRIPT").map(PathBuf::from),
            retry: RetryPolicy {
                retry_on,
                ..RetryPolicy::default()
            },
            url_refresh_interval,
            skip_tls_verify: get("SKIP_TLS_VERIFY").is_some_and(|v| v == "true"),
        })
    }

    /// The label selector string for list and watch calls.
    #[must_use]
    pub fn label_selector(&self) -> String {
        match &self.label_value {
            Some(value) => format!("{}={}", self.label, value),
            None => self.label.clone(),
        }
    }

    /// Target resolution options derived from these settings.
    #[must_use]
    pub fn resolve_options(&self) -> ResolveOptions {
        ResolveOptions {
            root: self.folder.clone(),
            folder_annotation: self.folder_annotation.clone(),
            unique_filenames: self.unique_filenames,
        }
    }
}

/// Parses `URL_RETRY_ON`: every element must be an integer; codes outside
/// the 5xx range are dropped.
fn parse_retry_on(raw: &str) -> Option<Vec<u16>> {
    let mut codes = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let code: u16 = part.parse().ok()?;
        if (500..=599).contains(&code) {
            codes.push(code);
        }
    }
    Some(codes)
}
