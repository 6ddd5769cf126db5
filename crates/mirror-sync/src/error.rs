//! Sync engine errors

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while converging the mirror.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Filesystem operation failed under the mirror tree
    #[error("filesystem error at {path}: {source}")]
    Io {
        /// Path the operation was acting on
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// HTTP transport error while fetching remote content
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Remote content fetch returned a non-success status after retries
    #[error("fetch of {url} returned status {status}")]
    FetchStatus {
        /// URL that was fetched
        url: String,
        /// Final HTTP status code
        status: u16,
    },
}

impl SyncError {
    /// Wraps an I/O error with the path it occurred on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
