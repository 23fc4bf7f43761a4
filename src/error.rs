//! Custom error types for the experiment engine.
//!
//! `DaqError` is the single error type shared by every component. The variants
//! follow the failure taxonomy of the engine:
//!
//! - **`Validation`**: a configuration has the wrong shape (e.g. a parameter changed
//!   type between versions). Recoverable: fix the parameters and save again.
//! - **`NotFound`**: an unknown snapshot version or run id.
//! - **`AlreadyBound`** / **`NotBound`** / **`DuplicateRun`**: usage errors. The call
//!   pattern is wrong, nothing was changed.
//! - **`Hardware`**: a device fault reported by a [`HardwareAdapter`]. Never retried
//!   by the engine; retry policy belongs to the caller.
//! - **`Sequence`**: the experiment definition is malformed. Fatal to that run.
//! - **`ReferentialIntegrity`**: a record points at a snapshot that does not exist.
//!   Indicates a bug or a corrupted store, so the runner aborts instead of continuing.
//! - **`Aborted`**: the run was cancelled through an [`AbortHandle`].
//!
//! `RunFailed` and `RecalibrationFailed` wrap one of the above once the runner has
//! written the failure record, so the caller learns which run id holds the audit trail.
//!
//! [`HardwareAdapter`]: crate::hardware::HardwareAdapter
//! [`AbortHandle`]: crate::runner::AbortHandle

use crate::hardware::HardwareError;
use thiserror::Error;
use uuid::Uuid;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Every error the engine reports.
#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Experiment '{experiment}' is already bound to snapshot v{version}")]
    AlreadyBound { experiment: String, version: u64 },

    #[error("Experiment '{0}' has no bound snapshot")]
    NotBound(String),

    #[error("Run {0} has already been persisted")]
    DuplicateRun(Uuid),

    #[error(transparent)]
    Hardware(#[from] HardwareError),

    #[error("Sequence error: {0}")]
    Sequence(String),

    #[error("Referential integrity violation: {0}")]
    ReferentialIntegrity(String),

    #[error("Run aborted: {0}")]
    Aborted(String),

    #[error("Run {run_id} failed: {source}")]
    RunFailed {
        run_id: Uuid,
        #[source]
        source: Box<DaqError>,
    },

    #[error("Recalibration failed: {source}")]
    RecalibrationFailed {
        #[source]
        source: Box<DaqError>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),
}

impl DaqError {
    /// Strips the runner's `RunFailed` / `RecalibrationFailed` wrappers.
    pub fn root_cause(&self) -> &DaqError {
        match self {
            DaqError::RunFailed { source, .. } | DaqError::RecalibrationFailed { source } => {
                source.root_cause()
            }
            other => other,
        }
    }

    /// Errors that must stop every loop regardless of the fault policy.
    pub fn is_fatal(&self) -> bool {
        matches!(self.root_cause(), DaqError::ReferentialIntegrity(_))
    }

    /// Whether the root cause is a cancellation.
    pub fn is_aborted(&self) -> bool {
        matches!(self.root_cause(), DaqError::Aborted(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::Sequence("step 3 references undefined element 'C13'".to_string());
        assert_eq!(
            err.to_string(),
            "Sequence error: step 3 references undefined element 'C13'"
        );
    }

    #[test]
    fn test_root_cause_unwraps_nested_wrappers() {
        let err = DaqError::RecalibrationFailed {
            source: Box::new(DaqError::RunFailed {
                run_id: Uuid::new_v4(),
                source: Box::new(HardwareError::new("SG384_1", "no lock").into()),
            }),
        };
        assert!(matches!(err.root_cause(), DaqError::Hardware(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_referential_integrity_is_fatal() {
        let err = DaqError::RunFailed {
            run_id: Uuid::new_v4(),
            source: Box::new(DaqError::ReferentialIntegrity("v9 missing".into())),
        };
        assert!(err.is_fatal());
        assert!(!err.is_aborted());
    }
}
