//! Versioned configuration store.
//!
//! Snapshots are append-only: `save` validates a [`ParameterSet`], assigns the
//! next version number and publishes one JSON file per version. A separate
//! `CURRENT` pointer names the snapshot new experiments bind to. Nothing is ever
//! deleted, so every [`RunRecord`](crate::record::RunRecord) keeps resolving.
//!
//! Version assignment is serialized in-process by a mutex and across processes
//! by the exclusive publish in [`fsio`](super::fsio): if another handle on the
//! same directory claimed the number first, the store reloads and tries the
//! next one.

use super::fsio;
use crate::error::{AppResult, DaqError};
use crate::parameter::{check_compatible, ParameterSet};
use crate::snapshot::{ConfigSnapshot, SnapshotOrigin, SnapshotVersion, VersionSelector};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const SNAPSHOT_DIR: &str = "snapshots";
const CURRENT_FILE: &str = "CURRENT";
const MAX_PUBLISH_ATTEMPTS: u32 = 64;

#[derive(Debug, Serialize, Deserialize)]
struct CurrentPointer {
    version: SnapshotVersion,
}

#[derive(Default)]
struct Inner {
    snapshots: BTreeMap<SnapshotVersion, Arc<ConfigSnapshot>>,
    current: Option<SnapshotVersion>,
}

impl Inner {
    fn latest(&self) -> Option<SnapshotVersion> {
        self.snapshots.keys().next_back().copied()
    }

    /// Every key must keep the type it had in the most recent snapshot that
    /// defined it.
    fn validate(&self, params: &ParameterSet) -> AppResult<()> {
        params.validate()?;
        for (key, value) in params.iter() {
            let prior = self
                .snapshots
                .values()
                .rev()
                .find_map(|snap| snap.get(key));
            if let Some(prior) = prior {
                check_compatible(key, value, prior)?;
            }
        }
        Ok(())
    }
}

/// Durable (or in-memory) store of [`ConfigSnapshot`]s.
pub struct ConfigurationStore {
    dir: Option<PathBuf>,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for ConfigurationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ConfigurationStore")
            .field("dir", &self.dir)
            .field("versions", &inner.snapshots.len())
            .field("current", &inner.current)
            .finish()
    }
}

fn file_name(version: SnapshotVersion) -> String {
    format!("v{version:08}.json")
}

fn version_of(path: &Path) -> Option<SnapshotVersion> {
    path.file_stem()?.to_str()?.strip_prefix('v')?.parse().ok()
}

impl ConfigurationStore {
    /// A store that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Opens (creating if needed) the store under `root/snapshots`.
    pub fn open(root: impl AsRef<Path>) -> AppResult<Self> {
        let dir = root.as_ref().join(SNAPSHOT_DIR);
        std::fs::create_dir_all(&dir)?;
        let store = Self {
            dir: Some(dir),
            inner: Mutex::new(Inner::default()),
        };
        store.refresh()?;
        info!(
            dir = ?store.dir,
            versions = store.inner.lock().snapshots.len(),
            "Configuration store opened"
        );
        Ok(store)
    }

    /// Re-reads the directory to pick up snapshots written by other handles.
    pub fn refresh(&self) -> AppResult<()> {
        let mut inner = self.inner.lock();
        self.refresh_locked(&mut inner)
    }

    fn refresh_locked(&self, inner: &mut Inner) -> AppResult<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        for path in fsio::json_files(dir)? {
            // snapshots are immutable, loaded ones never need re-reading
            if version_of(&path).is_some_and(|v| inner.snapshots.contains_key(&v)) {
                continue;
            }
            let snapshot: ConfigSnapshot = fsio::read_json(&path)?;
            let expected = dir.join(file_name(snapshot.version()));
            if path != expected {
                return Err(DaqError::ReferentialIntegrity(format!(
                    "snapshot file {} holds version {}",
                    path.display(),
                    snapshot.version()
                )));
            }
            inner
                .snapshots
                .entry(snapshot.version())
                .or_insert_with(|| Arc::new(snapshot));
        }
        match fsio::read_json::<CurrentPointer>(&dir.join(CURRENT_FILE)) {
            Ok(pointer) => inner.current = Some(pointer.version),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }

    /// Validates and saves `params` as a new snapshot and makes it current.
    pub fn save(&self, params: ParameterSet) -> AppResult<SnapshotVersion> {
        let mut inner = self.inner.lock();
        let snapshot = self.stage_locked(&mut inner, params, SnapshotOrigin::Manual)?;
        self.promote_locked(&mut inner, snapshot.version())?;
        Ok(snapshot.version())
    }

    /// Validates and durably saves `params` as a new snapshot without moving
    /// the current pointer. Used by recalibration, which promotes only after
    /// its event has been recorded.
    pub fn stage(
        &self,
        params: ParameterSet,
        origin: SnapshotOrigin,
    ) -> AppResult<Arc<ConfigSnapshot>> {
        let mut inner = self.inner.lock();
        self.stage_locked(&mut inner, params, origin)
    }

    fn stage_locked(
        &self,
        inner: &mut Inner,
        params: ParameterSet,
        origin: SnapshotOrigin,
    ) -> AppResult<Arc<ConfigSnapshot>> {
        self.refresh_locked(inner)?;
        inner.validate(&params)?;

        let parent = inner.current;
        for _ in 0..MAX_PUBLISH_ATTEMPTS {
            let version = inner.latest().map_or(1, |v| v + 1);
            let snapshot = ConfigSnapshot::new(version, parent, origin.clone(), params.clone());

            if let Some(dir) = &self.dir {
                match fsio::publish_exclusive(dir, &file_name(version), &snapshot) {
                    Ok(()) => {}
                    Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                        debug!(version, "Snapshot version taken by another writer, retrying");
                        self.refresh_locked(inner)?;
                        inner.validate(&params)?;
                        continue;
                    }
                    Err(err) => return Err(err.into()),
                }
            }

            let snapshot = Arc::new(snapshot);
            inner.snapshots.insert(version, Arc::clone(&snapshot));
            debug!(version, ?parent, "Snapshot staged");
            return Ok(snapshot);
        }
        Err(DaqError::Validation(format!(
            "could not claim a snapshot version after {MAX_PUBLISH_ATTEMPTS} attempts"
        )))
    }

    /// Points "current" at an existing snapshot. Also the rollback path.
    pub fn promote(&self, version: SnapshotVersion) -> AppResult<()> {
        let mut inner = self.inner.lock();
        self.promote_locked(&mut inner, version)
    }

    fn promote_locked(&self, inner: &mut Inner, version: SnapshotVersion) -> AppResult<()> {
        if !inner.snapshots.contains_key(&version) {
            self.refresh_locked(inner)?;
        }
        if !inner.snapshots.contains_key(&version) {
            return Err(DaqError::NotFound(format!("snapshot v{version}")));
        }
        if let Some(dir) = &self.dir {
            fsio::publish_replace(dir, CURRENT_FILE, &CurrentPointer { version })?;
        }
        let previous = inner.current.replace(version);
        info!(version, ?previous, "Current configuration updated");
        Ok(())
    }

    /// Loads a snapshot. Unknown versions fail with `NotFound`.
    pub fn load(&self, selector: VersionSelector) -> AppResult<Arc<ConfigSnapshot>> {
        let mut inner = self.inner.lock();
        let version = match selector {
            VersionSelector::Latest => inner.latest(),
            VersionSelector::Current => inner.current,
            VersionSelector::Exact(v) => Some(v),
        };
        let Some(version) = version else {
            return Err(DaqError::NotFound(format!("{selector} snapshot (store is empty)")));
        };
        if !inner.snapshots.contains_key(&version) {
            // another process may have written it since we last looked
            self.refresh_locked(&mut inner)?;
        }
        inner
            .snapshots
            .get(&version)
            .cloned()
            .ok_or_else(|| DaqError::NotFound(format!("snapshot v{version}")))
    }

    /// Shorthand for `load(VersionSelector::Exact(version))`.
    pub fn get(&self, version: SnapshotVersion) -> AppResult<Arc<ConfigSnapshot>> {
        self.load(VersionSelector::Exact(version))
    }

    /// The snapshot new experiments bind to.
    pub fn current(&self) -> AppResult<Arc<ConfigSnapshot>> {
        self.load(VersionSelector::Current)
    }

    /// Version of the current snapshot, `None` before the first save.
    pub fn current_version(&self) -> Option<SnapshotVersion> {
        self.inner.lock().current
    }

    /// All versions in ascending order.
    pub fn list_versions(&self) -> Vec<SnapshotVersion> {
        self.inner.lock().snapshots.keys().copied().collect()
    }

    /// Whether `version` resolves to a stored snapshot.
    pub fn contains(&self, version: SnapshotVersion) -> bool {
        self.get(version).is_ok()
    }

    /// Directory backing the store, if durable.
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }
}
