//! Core library for NV-center experiment execution.
//!
//! Experiments bind to immutable, versioned configuration snapshots, run
//! against an exclusive hardware adapter, and leave a persisted record that
//! names the exact snapshot they used. A recalibration loop runs calibration
//! experiments between measurements and publishes their results as new
//! snapshot versions, so parameter drift never mutates a configuration a run
//! already depends on.
//!
//! - [`store`]: snapshot versions and run history, in memory or on disk
//! - [`experiment`]: declarative pulse sequences and the experiment trait
//! - [`runner`]: single runs, loops, fault policy and abort
//! - [`recalibration`]: trigger policies and the recalibration state machine
//! - [`session`]: the facade external orchestrators use

pub mod error;
pub mod experiment;
pub mod hardware;
pub mod logging;
pub mod parameter;
pub mod recalibration;
pub mod record;
pub mod runner;
pub mod session;
pub mod settings;
pub mod snapshot;
pub mod store;

pub use error::{AppResult, DaqError};
pub use parameter::{ParamValue, ParameterSet};
pub use record::{RecalibrationEvent, RunRecord, RunStatus};
pub use session::LabSession;
pub use snapshot::{ConfigSnapshot, SnapshotVersion};
