//! Resource Mirror Sync Engine
//!
//! Keeps a local directory tree consistent with a labeled subset of
//! cluster ConfigMaps and Secrets, and notifies downstream consumers
//! (webhook and/or script) when the mirror actually changes.
//!
//! The engine is split along the seams of the sync pipeline:
//!
//! - [`resource`]: uniform snapshots over ConfigMap/Secret payloads
//! - [`target`]: maps a snapshot onto destination paths in the mirror
//! - [`files`]: converges the directory tree, write-if-different
//! - [`notify`]: best-effort change notification with retry policy
//! - [`refresh`]: remote-content fetching and the periodic refresher
//! - [`backoff`]: Fibonacci backoff shared by retries and restarts

pub mod backoff;
pub mod error;
pub mod files;
pub mod notify;
pub mod refresh;
pub mod resource;
pub mod target;

pub use backoff::FibonacciBackoff;
pub use error::SyncError;
pub use files::{MirrorState, ResolvedWrite, SharedMirror, lock_mirror, write_if_different};
pub use notify::{ChangeNotice, Notifier, RetryPolicy, Webhook, run_dispatcher};
pub use refresh::{ContentFetcher, run_refresher};
pub use resource::{ResourceId, ResourceItem, ResourceKind};
pub use target::{DEFAULT_FOLDER_ANNOTATION, ResolveOptions, SyncTarget, TargetContent, resolve_targets};
