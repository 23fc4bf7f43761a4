//! Append-only store of run records and recalibration events.
//!
//! Records are published one file per run (`runs/<run_id>.json`). Persisting
//! checks two things before anything reaches disk: the run id is new, and the
//! referenced snapshot resolves in the [`ConfigurationStore`]. Snapshots are
//! published before they can be referenced and are never deleted, so a crash
//! at any point leaves either no record or a record whose configuration exists.

use super::configs::ConfigurationStore;
use super::fsio;
use crate::error::{AppResult, DaqError};
use crate::record::{RecalibrationEvent, RunRecord, RunStatus};
use crate::snapshot::SnapshotVersion;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

const RUN_DIR: &str = "runs";
const EVENT_DIR: &str = "recalibrations";

/// Filter for [`ResultStore::query`]. Empty filters match everything.
#[derive(Debug, Clone, Default)]
pub struct RunQuery {
    experiment: Option<String>,
    snapshot_version: Option<SnapshotVersion>,
    status: Option<RunStatus>,
    started_from: Option<DateTime<Utc>>,
    started_before: Option<DateTime<Utc>>,
}

impl RunQuery {
    /// Matches every run.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs of the experiment called `name`.
    pub fn experiment(mut self, name: &str) -> Self {
        self.experiment = Some(name.to_string());
        self
    }

    /// Runs executed against `version`.
    pub fn snapshot_version(mut self, version: SnapshotVersion) -> Self {
        self.snapshot_version = Some(version);
        self
    }

    /// Runs that ended with `status`.
    pub fn status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Runs started in `[from, before)`.
    pub fn time_range(mut self, from: DateTime<Utc>, before: DateTime<Utc>) -> Self {
        self.started_from = Some(from);
        self.started_before = Some(before);
        self
    }

    fn matches(&self, record: &RunRecord) -> bool {
        self.experiment.as_deref().map_or(true, |e| record.experiment == e)
            && self
                .snapshot_version
                .map_or(true, |v| record.snapshot_version == v)
            && self.status.map_or(true, |s| record.status == s)
            && self.started_from.map_or(true, |t| record.started_at >= t)
            && self.started_before.map_or(true, |t| record.started_at < t)
    }
}

#[derive(Default)]
struct Inner {
    /// Insertion order
    runs: Vec<Arc<RunRecord>>,
    index: HashMap<Uuid, usize>,
    events: Vec<Arc<RecalibrationEvent>>,
}

/// Durable (or in-memory) store of [`RunRecord`]s.
pub struct ResultStore {
    dirs: Option<(PathBuf, PathBuf)>,
    configs: Arc<ConfigurationStore>,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for ResultStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ResultStore")
            .field("dirs", &self.dirs)
            .field("runs", &inner.runs.len())
            .field("events", &inner.events.len())
            .finish()
    }
}

impl ResultStore {
    /// Store that lives only as long as the process.
    pub fn in_memory(configs: Arc<ConfigurationStore>) -> Self {
        Self {
            dirs: None,
            configs,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Opens (creating if needed) `root/runs` and `root/recalibrations`.
    ///
    /// Fails with `ReferentialIntegrity` if a stored record references a
    /// snapshot the configuration store does not have.
    pub fn open(root: impl AsRef<Path>, configs: Arc<ConfigurationStore>) -> AppResult<Self> {
        let run_dir = root.as_ref().join(RUN_DIR);
        let event_dir = root.as_ref().join(EVENT_DIR);
        std::fs::create_dir_all(&run_dir)?;
        std::fs::create_dir_all(&event_dir)?;

        let mut inner = Inner::default();
        let mut runs = fsio::json_files(&run_dir)?
            .iter()
            .map(|path| fsio::read_json::<RunRecord>(path))
            .collect::<io::Result<Vec<_>>>()?;
        runs.sort_by_key(|r| r.started_at);
        for record in runs {
            if !configs.contains(record.snapshot_version) {
                error!(run_id = %record.run_id, version = record.snapshot_version, "Orphaned run record");
                return Err(DaqError::ReferentialIntegrity(format!(
                    "run {} references missing snapshot v{}",
                    record.run_id, record.snapshot_version
                )));
            }
            inner.index.insert(record.run_id, inner.runs.len());
            inner.runs.push(Arc::new(record));
        }

        let mut events = fsio::json_files(&event_dir)?
            .iter()
            .map(|path| fsio::read_json::<RecalibrationEvent>(path))
            .collect::<io::Result<Vec<_>>>()?;
        events.sort_by_key(|e| e.recorded_at);
        inner.events = events.into_iter().map(Arc::new).collect();

        info!(
            runs = inner.runs.len(),
            events = inner.events.len(),
            "Result store opened"
        );
        Ok(Self {
            dirs: Some((run_dir, event_dir)),
            configs,
            inner: Mutex::new(inner),
        })
    }

    /// The configuration store records are checked against.
    pub fn configs(&self) -> &Arc<ConfigurationStore> {
        &self.configs
    }

    /// Appends a run record. Existing records are never overwritten.
    pub fn persist(&self, record: RunRecord) -> AppResult<Arc<RunRecord>> {
        let mut inner = self.inner.lock();
        if inner.index.contains_key(&record.run_id) {
            return Err(DaqError::DuplicateRun(record.run_id));
        }
        if !self.configs.contains(record.snapshot_version) {
            error!(run_id = %record.run_id, version = record.snapshot_version, "Refusing orphaned run record");
            return Err(DaqError::ReferentialIntegrity(format!(
                "run {} references missing snapshot v{}",
                record.run_id, record.snapshot_version
            )));
        }
        if let Some((run_dir, _)) = &self.dirs {
            match fsio::publish_exclusive(run_dir, &format!("{}.json", record.run_id), &record) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    return Err(DaqError::DuplicateRun(record.run_id));
                }
                Err(err) => return Err(err.into()),
            }
        }
        debug!(run_id = %record.run_id, status = %record.status, "Run record persisted");
        let record = Arc::new(record);
        let position = inner.runs.len();
        inner.index.insert(record.run_id, position);
        inner.runs.push(Arc::clone(&record));
        Ok(record)
    }

    /// Stored run, or `NotFound`.
    pub fn get(&self, run_id: Uuid) -> AppResult<Arc<RunRecord>> {
        let inner = self.inner.lock();
        inner
            .index
            .get(&run_id)
            .map(|&i| Arc::clone(&inner.runs[i]))
            .ok_or_else(|| DaqError::NotFound(format!("run {run_id}")))
    }

    /// Matching records, ordered by start time (ties keep insertion order).
    ///
    /// The iterator works on a point-in-time view: records persisted after the
    /// call are not included.
    pub fn query(&self, query: RunQuery) -> impl Iterator<Item = Arc<RunRecord>> {
        let mut view = self.inner.lock().runs.clone();
        view.sort_by_key(|r| r.started_at);
        view.into_iter().filter(move |r| query.matches(r))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends a recalibration event after checking that the calibration run
    /// and both snapshots it links exist.
    pub fn record_event(&self, event: RecalibrationEvent) -> AppResult<Arc<RecalibrationEvent>> {
        let mut inner = self.inner.lock();
        if !inner.index.contains_key(&event.calibration_run) {
            return Err(DaqError::ReferentialIntegrity(format!(
                "recalibration event references unknown run {}",
                event.calibration_run
            )));
        }
        for version in [event.previous_version, event.new_version] {
            if !self.configs.contains(version) {
                return Err(DaqError::ReferentialIntegrity(format!(
                    "recalibration event references missing snapshot v{version}"
                )));
            }
        }
        if let Some((_, event_dir)) = &self.dirs {
            fsio::publish_exclusive(event_dir, &format!("{}.json", event.id), &event)?;
        }
        let event = Arc::new(event);
        inner.events.push(Arc::clone(&event));
        Ok(event)
    }

    /// All recalibration events, oldest first.
    pub fn events(&self) -> Vec<Arc<RecalibrationEvent>> {
        self.inner.lock().events.clone()
    }

    /// Recalibration events on the ancestry of `version`, oldest first.
    ///
    /// Follows snapshot parent links back from `version` and collects the event
    /// that produced each ancestor, if any. Whether `version` is or ever was
    /// current plays no part; see [`ConfigurationStore::current_version`].
    pub fn lineage(&self, version: SnapshotVersion) -> AppResult<Vec<Arc<RecalibrationEvent>>> {
        let events = self.events();
        let mut chain = Vec::new();
        let mut cursor = Some(self.configs.get(version)?);
        while let Some(snapshot) = cursor {
            if let Some(event) = events.iter().find(|e| e.new_version == snapshot.version()) {
                chain.push(Arc::clone(event));
            }
            cursor = match snapshot.parent() {
                Some(parent) if parent < snapshot.version() => Some(self.configs.get(parent)?),
                _ => None,
            };
        }
        chain.reverse();
        Ok(chain)
    }
}
