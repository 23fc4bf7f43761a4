//! Persisted records: runs and recalibration events.
//!
//! A [`RunRecord`] is the atomic unit of the result store. It always names the
//! snapshot version it ran against, so a result can be re-read together with the
//! exact configuration that produced it. A [`RecalibrationEvent`] links the
//! calibration run to the snapshot it produced, which makes "why did the
//! configuration change at time T" answerable from the store alone.
//!
//! ```text
//! ConfigSnapshot v1 ──< RunRecord r1, r2, r_cal
//!                              │
//!                 RecalibrationEvent(r_cal → v2)
//!                              │
//! ConfigSnapshot v2 ──< RunRecord r3, ...
//! ```

use crate::experiment::ExperimentDefinition;
use crate::parameter::ParameterSet;
use crate::runner::FaultPolicy;
use crate::snapshot::SnapshotVersion;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
    Aborted,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Success => write!(f, "success"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Aborted => write!(f, "aborted"),
        }
    }
}

/// Data collected by one run.
///
/// Readouts are keyed by label (`signal0`, `reference0`, ...) and hold one value
/// per executed measurement, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunPayload {
    /// Swept variable values, one per scan point
    pub sweep: Vec<f64>,
    /// Measurement values by readout label
    pub readouts: BTreeMap<String, Vec<f64>>,
    /// Number of operations the adapter executed
    pub steps_executed: usize,
}

impl RunPayload {
    pub fn readout(&self, label: &str) -> Option<&[f64]> {
        self.readouts.get(label).map(Vec::as_slice)
    }

    /// Mean of a readout, `None` if the label is absent or empty.
    pub fn mean(&self, label: &str) -> Option<f64> {
        let values = self.readout(label)?;
        if values.is_empty() {
            return None;
        }
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }

    pub(crate) fn push_readout(&mut self, label: &str, value: f64) {
        self.readouts.entry(label.to_string()).or_default().push(value);
    }
}

/// Context of a run that is not part of the result itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Fault policy the runner applied to this run
    pub fault_policy: FaultPolicy,
    /// Position inside a loop (0-based), `None` for single runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
    /// Shared by every iteration of one loop
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_id: Option<Uuid>,
    /// Whether this run was a recalibration measurement
    #[serde(default)]
    pub calibration: bool,
    /// Parameters passed to the experiment factory
    #[serde(default)]
    pub params: ParameterSet,
    /// Serialized experiment, used for replay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition: Option<ExperimentDefinition>,
    /// Original run when this one is a replay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay_of: Option<Uuid>,
    /// Machine the run executed on
    pub host: String,
    /// Version of this software
    pub software_version: String,
}

impl RunMetadata {
    /// Metadata of a plain, fresh run.
    pub fn new(fault_policy: FaultPolicy) -> Self {
        Self {
            fault_policy,
            iteration: None,
            loop_id: None,
            calibration: false,
            params: ParameterSet::new(),
            definition: None,
            replay_of: None,
            host: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".to_string()),
            software_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// One execution of one experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Unique run identifier
    pub run_id: Uuid,
    /// Snapshot the experiment was bound to
    pub snapshot_version: SnapshotVersion,
    /// Experiment name
    pub experiment: String,
    pub status: RunStatus,
    /// Collected data; only successful runs carry one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<RunPayload>,
    /// Error message for failed or aborted runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub metadata: RunMetadata,
}

impl RunRecord {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }
}

/// Why the recalibration loop fired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerReason {
    /// A run-count or wall-clock schedule elapsed
    Scheduled { detail: String },
    /// A monitored readout left its allowed band
    ThresholdExceeded { label: String, value: f64 },
    /// Explicit request by an operator or orchestrator
    Manual { note: String },
}

impl fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerReason::Scheduled { detail } => write!(f, "scheduled ({detail})"),
            TriggerReason::ThresholdExceeded { label, value } => {
                write!(f, "threshold exceeded ({label} = {value})")
            }
            TriggerReason::Manual { note } => write!(f, "manual ({note})"),
        }
    }
}

/// Applied recalibration: calibration run → new snapshot.
///
/// The event is written once the new snapshot is staged, just before it is
/// promoted. It records what the calibration produced, not what is current:
/// the CURRENT pointer alone decides that, and a later rollback or a failed
/// promote leaves the event in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecalibrationEvent {
    pub id: Uuid,
    pub reason: TriggerReason,
    /// Calibration run whose result produced `delta`
    pub calibration_run: Uuid,
    /// Snapshot the calibration ran against
    pub previous_version: SnapshotVersion,
    /// Snapshot produced by merging `delta` into `previous_version`
    pub new_version: SnapshotVersion,
    pub delta: ParameterSet,
    pub recorded_at: DateTime<Utc>,
}
