//! File sync engine
//!
//! Owns the mirror state and is the single mutation path for the
//! directory tree. Writes are write-if-different and atomic relative to
//! length (temp file in the target directory, then rename), so a racing
//! reader never observes a partially written file.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::{fs, io};

use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::error::SyncError;
use crate::resource::{ResourceId, ResourceKind};

/// A target whose content has already been materialized to bytes.
///
/// Remote-content references are fetched before reaching the engine;
/// `source_url` is retained so the refresher can re-fetch them later.
#[derive(Debug, Clone)]
pub struct ResolvedWrite {
    /// Destination path
    pub path: PathBuf,
    /// Bytes to place at the destination
    pub bytes: Vec<u8>,
    /// URL the bytes were fetched from, for refreshable targets
    pub source_url: Option<String>,
}

/// The set of files currently materialized on disk.
///
/// Invariant: at any quiescent point the tracked files equal exactly the
/// targets derivable from all currently matching resources. Ownership is
/// per resource identity so a delete event can remove precisely the files
/// that identity produced.
#[derive(Debug)]
pub struct MirrorState {
    root: PathBuf,
    owners: HashMap<ResourceId, BTreeSet<PathBuf>>,
    url_sources: BTreeMap<PathBuf, String>,
}

/// Shared handle to the mirror state.
pub type SharedMirror = Arc<Mutex<MirrorState>>;

/// Locks the mirror, recovering from a poisoned lock.
///
/// The durable state lives on disk; a panic mid-write leaves at worst a
/// stale temp file, so continuing with the in-memory maps is safe.
pub fn lock_mirror(state: &SharedMirror) -> MutexGuard<'_, MirrorState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MirrorState {
    /// Creates an empty mirror rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            owners: HashMap::new(),
            url_sources: BTreeMap::new(),
        }
    }

    /// The configured mirror root. Never deleted by the engine.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Snapshot of the refreshable targets: (path, source URL).
    #[must_use]
    pub fn url_sources(&self) -> Vec<(PathBuf, String)> {
        self.url_sources
            .iter()
            .map(|(path, url)| (path.clone(), url.clone()))
            .collect()
    }

    /// Whether `path` is still a refreshable target for `url`.
    ///
    /// The refresher re-checks this under the lock before rewriting: the
    /// owning resource may have been deleted while the fetch was in
    /// flight, and a rewrite then would leave an untracked orphan.
    #[must_use]
    pub fn tracks_url(&self, path: &Path, url: &str) -> bool {
        self.url_sources
            .get(path)
            .is_some_and(|current| current == url)
    }

    /// Converges the files owned by one identity to `targets`.
    ///
    /// Writes each target if its content differs, then removes paths the
    /// identity previously owned that are no longer derived. Returns
    /// whether anything on disk actually changed.
    pub fn apply_item(
        &mut self,
        id: &ResourceId,
        targets: &[ResolvedWrite],
    ) -> Result<bool, SyncError> {
        let mut changed = false;
        let mut owned = BTreeSet::new();
        for target in targets {
            if write_if_different(&target.path, &target.bytes)? {
                info!(resource = %id, path = %target.path.display(), "wrote file");
                changed = true;
            }
            owned.insert(target.path.clone());
            match &target.source_url {
                Some(url) => {
                    self.url_sources.insert(target.path.clone(), url.clone());
                }
                None => {
                    self.url_sources.remove(&target.path);
                }
            }
        }

        let stale: Vec<PathBuf> = self
            .owners
            .get(id)
            .map(|previous| previous.difference(&owned).cloned().collect())
            .unwrap_or_default();
        for path in stale {
            if remove_file(&path)? {
                info!(resource = %id, path = %path.display(), "removed stale file");
                changed = true;
            }
            self.url_sources.remove(&path);
        }

        if owned.is_empty() {
            self.owners.remove(id);
        } else {
            self.owners.insert(id.clone(), owned);
        }
        Ok(changed)
    }

    /// Removes every file owned by `id`. Returns whether any file existed.
    pub fn remove_item(&mut self, id: &ResourceId) -> Result<bool, SyncError> {
        let Some(owned) = self.owners.remove(id) else {
            return Ok(false);
        };
        let mut changed = false;
        for path in owned {
            if remove_file(&path)? {
                info!(resource = %id, path = %path.display(), "removed file");
                changed = true;
            }
            self.url_sources.remove(&path);
        }
        Ok(changed)
    }

    /// Full reconciliation for one kind: applies every desired item, then
    /// removes files owned by identities of that kind that are gone.
    ///
    /// Identities of other kinds are untouched, so concurrent sub-streams
    /// can each converge their own slice of the mirror.
    pub fn sync_full(
        &mut self,
        kind: ResourceKind,
        desired: Vec<(ResourceId, Vec<ResolvedWrite>)>,
    ) -> Result<bool, SyncError> {
        let mut changed = false;
        let desired_ids: HashSet<ResourceId> =
            desired.iter().map(|(id, _)| id.clone()).collect();
        for (id, targets) in &desired {
            changed |= self.apply_item(id, targets)?;
        }
        let stale: Vec<ResourceId> = self
            .owners
            .keys()
            .filter(|id| id.kind == kind && !desired_ids.contains(id))
            .cloned()
            .collect();
        for id in stale {
            changed |= self.remove_item(&id)?;
        }
        debug!(kind = %kind, changed, "full sync pass complete");
        Ok(changed)
    }
}

/// Writes `bytes` to `path` only if the current content differs.
///
/// Creates parent directories on demand. The write goes to a temp file in
/// the target directory followed by a rename, so the destination is never
/// observed mid-write. Returns whether the file content changed.
pub fn write_if_different(path: &Path, bytes: &[u8]) -> Result<bool, SyncError> {
    match fs::read(path) {
        Ok(existing) if existing == bytes => return Ok(false),
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(SyncError::io(path, e)),
    }

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(|e| SyncError::io(dir, e))?;

    // Unique per write: concurrent writers to the same destination must
    // never share a temp file
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| SyncError::io(dir, e))?;
    tmp.write_all(bytes).map_err(|e| SyncError::io(tmp.path(), e))?;
    tmp.persist(path).map_err(|e| SyncError::io(path, e.error))?;
    Ok(true)
}

/// Removes a file, tolerating it already being gone.
fn remove_file(path: &Path) -> Result<bool, SyncError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(SyncError::io(path, e)),
    }
}
