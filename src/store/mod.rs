//! Durable storage for configuration snapshots and run results.
//!
//! Both stores can run purely in memory (tests, dry runs) or against a root
//! directory:
//!
//! ```text
//! <root>/snapshots/v00000001.json     one ConfigSnapshot per version
//! <root>/snapshots/CURRENT            current-version pointer
//! <root>/runs/<run_id>.json           one RunRecord per run
//! <root>/recalibrations/<id>.json     one RecalibrationEvent per firing
//! ```

pub mod configs;
mod fsio;
pub mod results;

pub use configs::ConfigurationStore;
pub use results::{ResultStore, RunQuery};
