//! Sync target resolution
//!
//! Maps a [`ResourceItem`] onto destination paths in the mirror tree:
//! the folder annotation picks a per-item subfolder, the unique-filenames
//! policy avoids collisions across identities, and a data key ending in
//! `.url` marks its value as a remote-content reference.

use std::path::{Component, Path, PathBuf};

use tracing::warn;

use crate::resource::ResourceItem;

/// Annotation carrying the per-item subfolder override.
pub const DEFAULT_FOLDER_ANNOTATION: &str = "k8s-sidecar-target-directory";

/// Data-key suffix marking a remote-content reference.
const URL_SUFFIX: &str = ".url";

/// Options governing how items map onto the mirror tree.
#[derive(Debug, Clone)]
pub struct ResolveOptions {
    /// Mirror root directory
    pub root: PathBuf,
    /// Annotation key carrying the subfolder override
    pub folder_annotation: String,
    /// When set, filenames are prefixed `<namespace>-<name>-` to avoid
    /// collisions between identities sharing a data key
    pub unique_filenames: bool,
}

/// Where a target's bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetContent {
    /// Bytes taken directly from the resource payload
    Inline(Vec<u8>),
    /// Remote-content reference: fetch this URL at sync time
    Url(String),
}

/// A resolved destination for one data key of one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTarget {
    /// Full destination path
    pub path: PathBuf,
    /// Content source for the file
    pub content: TargetContent,
}

/// Resolves every data key of `item` to a [`SyncTarget`].
///
/// Keys that would produce an empty filename are skipped with a warning.
#[must_use]
pub fn resolve_targets(item: &ResourceItem, opts: &ResolveOptions) -> Vec<SyncTarget> {
    let dir = target_dir(item, opts);
    let mut targets = Vec::with_capacity(item.data.len());
    for (key, value) in &item.data {
        let (filename, content) = match key.strip_suffix(URL_SUFFIX) {
            Some(stem) => {
                let url = String::from_utf8_lossy(value).trim().to_string();
                (stem, TargetContent::Url(url))
            }
            None => (key.as_str(), TargetContent::Inline(value.clone())),
        };
        if filename.is_empty() {
            warn!(resource = %item.id, key = %key, "data key resolves to an empty filename, skipping");
            continue;
        }
        let filename = if opts.unique_filenames {
            format!("{}-{}-{}", item.id.namespace, item.id.name, filename)
        } else {
            filename.to_string()
        };
        targets.push(SyncTarget {
            path: dir.join(filename),
            content,
        });
    }
    targets
}

/// Picks the destination directory for an item.
///
/// Absolute annotation values are used as-is; relative values are joined
/// under the root. A relative value reaching outside the root (via `..`)
/// is ignored and the root is used instead.
fn target_dir(item: &ResourceItem, opts: &ResolveOptions) -> PathBuf {
    let Some(folder) = item.annotations.get(&opts.folder_annotation) else {
        return opts.root.clone();
    };
    let annotated = Path::new(folder);
    if annotated.is_absolute() {
        return annotated.to_path_buf();
    }
    if annotated
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        warn!(
            resource = %item.id,
            folder = %folder,
            "folder annotation escapes the mirror root, ignoring"
        );
        return opts.root.clone();
    }
    opts.root.join(annotated)
}
