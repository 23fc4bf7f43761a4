//! Immutable, versioned configuration snapshots.

use crate::error::{AppResult, DaqError};
use crate::parameter::{ParamValue, ParameterSet};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Snapshot version number. Strictly increasing, assigned by the store.
pub type SnapshotVersion = u64;

/// Name of the mapping that declares the hardware resources (elements and
/// channels) an experiment may reference.
pub const ELEMENTS_KEY: &str = "elements";

/// Where a snapshot came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SnapshotOrigin {
    /// Saved by an operator or a script.
    Manual,
    /// Produced by the recalibration loop from a calibration run.
    Recalibration {
        /// Run whose result produced the delta
        calibration_run: Uuid,
    },
}

/// A frozen parameter set. There is no way to mutate a snapshot once the
/// store has created it; changes go through [`ParameterSet`] and a new save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    version: SnapshotVersion,
    created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent: Option<SnapshotVersion>,
    origin: SnapshotOrigin,
    parameters: ParameterSet,
}

impl ConfigSnapshot {
    pub(crate) fn new(
        version: SnapshotVersion,
        parent: Option<SnapshotVersion>,
        origin: SnapshotOrigin,
        parameters: ParameterSet,
    ) -> Self {
        Self {
            version,
            created_at: Utc::now(),
            parent,
            origin,
            parameters,
        }
    }

    /// Monotonic version number, unique within a store.
    pub fn version(&self) -> SnapshotVersion {
        self.version
    }

    /// When the snapshot was staged.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Version that was current when this snapshot was saved.
    pub fn parent(&self) -> Option<SnapshotVersion> {
        self.parent
    }

    /// Manual save or the calibration run that produced it.
    pub fn origin(&self) -> &SnapshotOrigin {
        &self.origin
    }

    /// The full parameter set, not a delta.
    pub fn parameters(&self) -> &ParameterSet {
        &self.parameters
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.parameters.get(key)
    }

    /// Numeric parameter, failing with a `Sequence` error when absent. Used
    /// when an experiment derives default lengths from the configuration.
    pub fn require_f64(&self, key: &str) -> AppResult<f64> {
        self.parameters.get_f64(key).ok_or_else(|| {
            DaqError::Sequence(format!(
                "snapshot v{} has no numeric parameter '{key}'",
                self.version
            ))
        })
    }

    /// Whether `name` is declared under the `elements` mapping.
    pub fn has_resource(&self, name: &str) -> bool {
        self.parameters
            .get(ELEMENTS_KEY)
            .and_then(ParamValue::as_map)
            .is_some_and(|elements| elements.contains_key(name))
    }

    /// Copy of the parameters for deriving a successor snapshot.
    pub fn to_parameter_set(&self) -> ParameterSet {
        self.parameters.clone()
    }
}

/// Selects a snapshot for [`ConfigurationStore::load`](crate::store::ConfigurationStore::load).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionSelector {
    /// Highest version ever saved
    Latest,
    /// The version the current-pointer refers to
    Current,
    /// A specific version
    Exact(SnapshotVersion),
}

impl From<SnapshotVersion> for VersionSelector {
    fn from(v: SnapshotVersion) -> Self {
        VersionSelector::Exact(v)
    }
}

impl fmt::Display for VersionSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionSelector::Latest => f.write_str("latest"),
            VersionSelector::Current => f.write_str("current"),
            VersionSelector::Exact(v) => write!(f, "v{v}"),
        }
    }
}
