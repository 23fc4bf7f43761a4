//! Experiments.
//!
//! An experiment is created unbound, bound exactly once to a
//! [`ConfigSnapshot`], and only then able to produce its operation
//! [`Sequence`]. Binding pins every parameter the sequence reads, so a run can
//! always be reproduced from the snapshot version stored with its record.
//!
//! ```text
//! factory.create(params) ──> unbound ──bind(v)──> bound ──run(adapter)──> RunPayload
//!                                        │
//!                                        └── bind again: AlreadyBound
//! ```
//!
//! Experiments that can retune the configuration also implement
//! [`Calibration`]; the recalibration controller only accepts those.

pub mod definition;
pub mod nv;
pub mod sequence;

use crate::error::{AppResult, DaqError};
use crate::hardware::{HardwareAdapter, HardwareError, StepOutput};
use crate::parameter::ParameterSet;
use crate::record::RunPayload;
use crate::runner::AbortSignal;
use crate::snapshot::ConfigSnapshot;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

pub use definition::{
    CalibrationExperiment, CalibrationRule, ExperimentDefinition, Extremum, SequenceExperiment,
};
pub use sequence::{Command, Sequence, SequenceBuilder, SequenceSpec, Setting};

/// A measurement that runs against one bound configuration snapshot.
#[async_trait]
pub trait Experiment: Send + Sync {
    fn name(&self) -> &str;

    /// Attaches the experiment to `snapshot`.
    ///
    /// # Errors
    ///
    /// `AlreadyBound` if the experiment is already bound, to this or any
    /// other snapshot.
    fn bind(&mut self, snapshot: Arc<ConfigSnapshot>) -> AppResult<()>;

    /// Bound snapshot, if any.
    fn snapshot(&self) -> Option<&Arc<ConfigSnapshot>>;

    /// Resolves the operation sequence against the bound snapshot.
    ///
    /// # Errors
    ///
    /// `NotBound` before [`bind`](Self::bind), `Sequence` if the definition
    /// is malformed for this snapshot.
    fn sequence(&self) -> AppResult<Sequence>;

    /// Serializable form of the experiment, stored with each run for replay.
    fn definition(&self) -> Option<ExperimentDefinition> {
        None
    }

    /// Calibration capability, if the experiment has one.
    fn as_calibration(&self) -> Option<&dyn Calibration> {
        None
    }

    /// Applies the bound snapshot to `adapter` and executes the sequence.
    async fn run(
        &self,
        adapter: &mut dyn HardwareAdapter,
        abort: &AbortSignal,
    ) -> AppResult<RunPayload> {
        let snapshot = self
            .snapshot()
            .cloned()
            .ok_or_else(|| DaqError::NotBound(self.name().to_string()))?;
        let sequence = self.sequence()?;
        execute_sequence(&snapshot, &sequence, adapter, abort).await
    }
}

/// An experiment whose result can be turned into a configuration change.
pub trait Calibration: Send + Sync {
    /// Parameter changes derived from a successful run's payload.
    ///
    /// Keys absent from the delta keep their previous values.
    fn extract_calibration_delta(&self, payload: &RunPayload) -> AppResult<ParameterSet>;
}

/// Creates fresh, unbound experiments.
///
/// The runner asks for a new instance for every run, so one instance is
/// never bound twice.
pub trait ExperimentFactory: Send + Sync {
    fn name(&self) -> &str;

    fn create(&self, params: &ParameterSet) -> AppResult<Box<dyn Experiment>>;
}

/// [`ExperimentFactory`] backed by a closure.
pub struct FnFactory<F> {
    name: String,
    build: F,
}

impl<F> FnFactory<F>
where
    F: Fn(&ParameterSet) -> AppResult<Box<dyn Experiment>> + Send + Sync,
{
    pub fn new(name: &str, build: F) -> Self {
        Self {
            name: name.to_string(),
            build,
        }
    }
}

impl<F> ExperimentFactory for FnFactory<F>
where
    F: Fn(&ParameterSet) -> AppResult<Box<dyn Experiment>> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn create(&self, params: &ParameterSet) -> AppResult<Box<dyn Experiment>> {
        (self.build)(params)
    }
}

/// Drives `sequence` on `adapter`, checking for cancellation between steps
/// and while a step is in flight.
pub async fn execute_sequence(
    snapshot: &ConfigSnapshot,
    sequence: &Sequence,
    adapter: &mut dyn HardwareAdapter,
    abort: &AbortSignal,
) -> AppResult<RunPayload> {
    let mut abort = abort.clone();
    if abort.is_aborted() {
        return Err(DaqError::Aborted("cancelled before start".into()));
    }

    tokio::select! {
        result = adapter.apply_configuration(snapshot) => result?,
        () = abort.cancelled() => {
            return Err(DaqError::Aborted("cancelled while applying configuration".into()));
        }
    }
    debug!(
        adapter = adapter.name(),
        version = snapshot.version(),
        operations = sequence.len(),
        "Configuration applied"
    );

    let mut payload = RunPayload {
        sweep: sequence.points().to_vec(),
        ..RunPayload::default()
    };
    for op in sequence.iter() {
        if abort.is_aborted() {
            return Err(DaqError::Aborted(format!("cancelled before {op}")));
        }
        let output = tokio::select! {
            result = adapter.execute_operation(&op) => result?,
            () = abort.cancelled() => {
                return Err(DaqError::Aborted(format!("cancelled during {op}")));
            }
        };
        payload.steps_executed += 1;
        if let StepOutput::Value(value) = output {
            // JSON has no NaN or infinity; a stored one could never be read back
            if !value.is_finite() {
                return Err(HardwareError::new(
                    adapter.name(),
                    format!("non-finite readout {value} from {op}"),
                )
                .into());
            }
            payload.push_readout(op.pass.label(), value);
        }
    }
    Ok(payload)
}
