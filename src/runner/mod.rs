//! Experiment execution.
//!
//! [`ExperimentRunner`] turns experiment factories into persisted runs:
//!
//! ```text
//! for each iteration:
//!     pending recalibration? ── yes ──> run calibration, apply, (blocks)
//!     current snapshot ──> factory.create(params) ──> bind ──> run(adapter)
//!     persist RunRecord (success | failed | aborted)
//!     failed? ── Stop ──> surface error, halt
//!             └─ Continue ──> record, next iteration
//! ```
//!
//! Iterations are strictly sequential and every iteration gets a fresh
//! experiment instance. The hardware adapter sits behind a mutex in
//! [`RunContext`], so a runner and the recalibration controller it drives can
//! never touch the hardware at the same time.

pub mod abort;

pub use abort::{AbortHandle, AbortSignal};

use crate::error::{AppResult, DaqError};
use crate::experiment::{Experiment, ExperimentFactory};
use crate::hardware::HardwareAdapter;
use crate::parameter::ParameterSet;
use crate::recalibration::{RecalibrationController, RecalibrationState};
use crate::record::{RecalibrationEvent, RunMetadata, RunRecord, RunStatus, TriggerReason};
use crate::snapshot::{ConfigSnapshot, SnapshotVersion};
use crate::store::{ConfigurationStore, ResultStore};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// What a loop does when an iteration fails.
///
/// The policy in force is written into every run's metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultPolicy {
    /// Persist the failure, surface it and halt the loop
    #[default]
    Stop,
    /// Persist the failure and carry on with the next iteration
    Continue,
}

impl fmt::Display for FaultPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultPolicy::Stop => write!(f, "stop"),
            FaultPolicy::Continue => write!(f, "continue"),
        }
    }
}

/// Result of one execution attempt. The record is always persisted; `error`
/// holds the failure for non-successful runs.
pub struct RunOutcome {
    pub record: Arc<RunRecord>,
    /// The executed instance, `None` if it could not be created or bound
    pub experiment: Option<Box<dyn Experiment>>,
    pub error: Option<DaqError>,
}

impl RunOutcome {
    /// Success as the record, failure as `RunFailed` naming the record.
    pub fn into_result(self) -> AppResult<Arc<RunRecord>> {
        match self.error {
            None => Ok(self.record),
            Some(source) => Err(DaqError::RunFailed {
                run_id: self.record.run_id,
                source: Box::new(source),
            }),
        }
    }
}

/// Stores plus the exclusive hardware session.
#[derive(Clone)]
pub struct RunContext {
    configs: Arc<ConfigurationStore>,
    results: Arc<ResultStore>,
    hardware: Arc<Mutex<Box<dyn HardwareAdapter>>>,
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("configs", &self.configs)
            .field("results", &self.results)
            .finish_non_exhaustive()
    }
}

impl RunContext {
    /// Uses the configuration store `results` validates against.
    pub fn new(results: Arc<ResultStore>, adapter: impl HardwareAdapter + 'static) -> Self {
        Self {
            configs: Arc::clone(results.configs()),
            results,
            hardware: Arc::new(Mutex::new(Box::new(adapter))),
        }
    }

    /// Snapshot store runs are bound against.
    pub fn configs(&self) -> &Arc<ConfigurationStore> {
        &self.configs
    }

    pub fn results(&self) -> &Arc<ResultStore> {
        &self.results
    }

    /// Creates a fresh experiment, binds it to `snapshot`, runs it and
    /// persists the record.
    ///
    /// Experiment failures are reported in the outcome. `Err` means the record
    /// itself could not be persisted.
    pub async fn run(
        &self,
        factory: &dyn ExperimentFactory,
        params: &ParameterSet,
        snapshot: Arc<ConfigSnapshot>,
        mut metadata: RunMetadata,
        abort: &AbortSignal,
    ) -> AppResult<RunOutcome> {
        let version = snapshot.version();
        if let Err(error) = params.validate() {
            // keep unserializable values out of the stored record
            return self.record_unstarted(factory.name(), version, metadata, error);
        }
        metadata.params = params.clone();
        match Self::prepare(factory, params, snapshot, metadata.calibration) {
            Ok(experiment) => {
                metadata.definition = experiment.definition();
                self.execute(experiment, metadata, abort).await
            }
            Err(error) => self.record_unstarted(factory.name(), version, metadata, error),
        }
    }

    fn prepare(
        factory: &dyn ExperimentFactory,
        params: &ParameterSet,
        snapshot: Arc<ConfigSnapshot>,
        calibration: bool,
    ) -> AppResult<Box<dyn Experiment>> {
        let mut experiment = factory.create(params)?;
        if calibration && experiment.as_calibration().is_none() {
            return Err(DaqError::Sequence(format!(
                "experiment '{}' cannot produce a calibration delta",
                experiment.name()
            )));
        }
        experiment.bind(snapshot)?;
        Ok(experiment)
    }

    /// Runs an already bound experiment and persists its record.
    pub async fn execute(
        &self,
        experiment: Box<dyn Experiment>,
        metadata: RunMetadata,
        abort: &AbortSignal,
    ) -> AppResult<RunOutcome> {
        let snapshot_version = experiment
            .snapshot()
            .map(|s| s.version())
            .ok_or_else(|| DaqError::NotBound(experiment.name().to_string()))?;
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(
            %run_id,
            experiment = experiment.name(),
            version = snapshot_version,
            calibration = metadata.calibration,
            "Run started"
        );

        let result = {
            let mut hardware = self.hardware.lock().await;
            experiment.run(&mut **hardware, abort).await
        };

        let (status, payload, error) = match result {
            Ok(payload) => (RunStatus::Success, Some(payload), None),
            Err(err) if err.is_aborted() => (RunStatus::Aborted, None, Some(err)),
            Err(err) => (RunStatus::Failed, None, Some(err)),
        };
        let record = self.results.persist(RunRecord {
            run_id,
            snapshot_version,
            experiment: experiment.name().to_string(),
            status,
            payload,
            error: error.as_ref().map(ToString::to_string),
            started_at,
            finished_at: Utc::now(),
            metadata,
        })?;

        match &error {
            None => info!(%run_id, "Run finished"),
            Some(err) => warn!(%run_id, status = %record.status, error = %err, "Run did not complete"),
        }
        Ok(RunOutcome {
            record,
            experiment: Some(experiment),
            error,
        })
    }

    /// Failure record for an experiment that never reached the hardware.
    fn record_unstarted(
        &self,
        experiment: &str,
        snapshot_version: SnapshotVersion,
        metadata: RunMetadata,
        error: DaqError,
    ) -> AppResult<RunOutcome> {
        let now = Utc::now();
        let record = self.results.persist(RunRecord {
            run_id: Uuid::new_v4(),
            snapshot_version,
            experiment: experiment.to_string(),
            status: RunStatus::Failed,
            payload: None,
            error: Some(error.to_string()),
            started_at: now,
            finished_at: now,
            metadata,
        })?;
        warn!(run_id = %record.run_id, experiment, error = %error, "Experiment could not be prepared");
        Ok(RunOutcome {
            record,
            experiment: None,
            error: Some(error),
        })
    }
}

/// How long [`ExperimentRunner::run_loop`] keeps going.
pub enum LoopUntil {
    /// Exactly this many iterations (fewer if the loop halts)
    Iterations(u32),
    /// Until `stop` returns true for a successful run, at most
    /// `max_iterations` times
    Condition {
        max_iterations: u32,
        stop: Box<dyn Fn(&RunRecord) -> bool + Send + Sync>,
    },
}

impl LoopUntil {
    /// [`LoopUntil::Condition`] from a closure.
    pub fn condition(
        max_iterations: u32,
        stop: impl Fn(&RunRecord) -> bool + Send + Sync + 'static,
    ) -> Self {
        LoopUntil::Condition {
            max_iterations,
            stop: Box::new(stop),
        }
    }

    fn max_iterations(&self) -> u32 {
        match self {
            LoopUntil::Iterations(n) => *n,
            LoopUntil::Condition { max_iterations, .. } => *max_iterations,
        }
    }

    fn is_done(&self, record: &RunRecord) -> bool {
        match self {
            LoopUntil::Iterations(_) => false,
            LoopUntil::Condition { stop, .. } => stop(record),
        }
    }
}

impl fmt::Debug for LoopUntil {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopUntil::Iterations(n) => f.debug_tuple("Iterations").field(n).finish(),
            LoopUntil::Condition { max_iterations, .. } => f
                .debug_struct("Condition")
                .field("max_iterations", max_iterations)
                .finish_non_exhaustive(),
        }
    }
}

/// What a completed loop did.
#[derive(Debug, Clone)]
pub struct LoopSummary {
    /// Shared by every run of the loop (`RunMetadata::loop_id`)
    pub loop_id: Uuid,
    /// Every persisted run, in execution order
    pub records: Vec<Arc<RunRecord>>,
    /// Runs that failed under [`FaultPolicy::Continue`]
    pub failed: Vec<Uuid>,
    /// Recalibrations applied between iterations
    pub recalibrations: Vec<Arc<RecalibrationEvent>>,
    /// Recalibrations that failed under [`FaultPolicy::Continue`]
    pub failed_recalibrations: Vec<FailedRecalibration>,
}

impl LoopSummary {
    /// Number of successful runs.
    pub fn succeeded(&self) -> usize {
        self.records.iter().filter(|r| r.is_success()).count()
    }
}

/// A recalibration the loop carried on past.
#[derive(Debug, Clone)]
pub struct FailedRecalibration {
    /// Calibration run, if the attempt got as far as running one
    pub calibration_run: Option<Uuid>,
    pub error: String,
}

/// What the pre-run recalibration check decided.
enum RecalibrationCheck {
    Idle,
    Applied(Arc<RecalibrationEvent>),
    Failed(FailedRecalibration),
    /// The controller is `Failed`; no run may start until it is reset
    Blocked(DaqError),
}

/// Orchestrates runs, loops and interleaved recalibrations.
#[derive(Debug)]
pub struct ExperimentRunner {
    ctx: RunContext,
    fault_policy: FaultPolicy,
    controller: Option<RecalibrationController>,
    abort: AbortHandle,
}

impl ExperimentRunner {
    /// Runner with [`FaultPolicy::Stop`] and no recalibration.
    pub fn new(ctx: RunContext) -> Self {
        Self {
            ctx,
            fault_policy: FaultPolicy::default(),
            controller: None,
            abort: AbortHandle::new(),
        }
    }

    pub fn with_fault_policy(mut self, policy: FaultPolicy) -> Self {
        self.fault_policy = policy;
        self
    }

    /// Checks `controller` before every run.
    pub fn with_recalibration(mut self, controller: RecalibrationController) -> Self {
        self.controller = Some(controller);
        self
    }

    pub fn fault_policy(&self) -> FaultPolicy {
        self.fault_policy
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    /// Handle that cancels whatever this runner is executing.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn controller(&self) -> Option<&RecalibrationController> {
        self.controller.as_ref()
    }

    /// Needed to [`reset`](RecalibrationController::reset) a failed controller.
    pub fn controller_mut(&mut self) -> Option<&mut RecalibrationController> {
        self.controller.as_mut()
    }

    /// Runs one fresh experiment against the current snapshot.
    ///
    /// A pending recalibration runs first. While the controller is `Failed`
    /// the run is refused, leaving a failed record and no hardware activity.
    pub async fn run_once(
        &mut self,
        factory: &dyn ExperimentFactory,
        params: &ParameterSet,
    ) -> AppResult<Arc<RunRecord>> {
        let metadata = RunMetadata::new(self.fault_policy);
        if let RecalibrationCheck::Blocked(error) = self.check_recalibration().await? {
            return self.refuse(factory, params, metadata, error)?.into_result();
        }
        let snapshot = self.ctx.configs.current()?;
        self.execute(factory, params, snapshot, metadata)
            .await?
            .into_result()
    }

    /// Runs `factory` repeatedly, checking for recalibration before every
    /// iteration.
    ///
    /// Under [`FaultPolicy::Stop`] the first failure is returned as
    /// `RunFailed` and later iterations never execute. Aborts and
    /// referential-integrity errors halt the loop under either policy.
    /// Under [`FaultPolicy::Continue`] a failed recalibration is listed in
    /// [`LoopSummary::failed_recalibrations`] and retried only when the
    /// trigger fires again.
    pub async fn run_loop(
        &mut self,
        factory: &dyn ExperimentFactory,
        params: &ParameterSet,
        until: LoopUntil,
    ) -> AppResult<LoopSummary> {
        let loop_id = Uuid::new_v4();
        let mut summary = LoopSummary {
            loop_id,
            records: Vec::new(),
            failed: Vec::new(),
            recalibrations: Vec::new(),
            failed_recalibrations: Vec::new(),
        };
        info!(
            %loop_id,
            experiment = factory.name(),
            max_iterations = until.max_iterations(),
            fault_policy = %self.fault_policy,
            "Loop started"
        );

        for iteration in 0..until.max_iterations() {
            let mut metadata = RunMetadata::new(self.fault_policy);
            metadata.iteration = Some(iteration);
            metadata.loop_id = Some(loop_id);

            match self.check_recalibration().await? {
                RecalibrationCheck::Idle => {}
                RecalibrationCheck::Applied(event) => summary.recalibrations.push(event),
                RecalibrationCheck::Failed(failure) => summary.failed_recalibrations.push(failure),
                RecalibrationCheck::Blocked(error) => {
                    let outcome = self.refuse(factory, params, metadata, error)?;
                    warn!(%loop_id, iteration, run_id = %outcome.record.run_id, "Loop halted");
                    return outcome.into_result().map(|_| summary);
                }
            }

            let snapshot = self.ctx.configs.current()?;
            let outcome = self.execute(factory, params, snapshot, metadata).await?;
            let record = Arc::clone(&outcome.record);
            summary.records.push(Arc::clone(&record));

            if let Some(error) = outcome.error {
                let halt = self.fault_policy == FaultPolicy::Stop || error.is_aborted() || error.is_fatal();
                let error = DaqError::RunFailed {
                    run_id: record.run_id,
                    source: Box::new(error),
                };
                if halt {
                    warn!(%loop_id, iteration, error = %error, "Loop halted");
                    return Err(error);
                }
                warn!(%loop_id, iteration, error = %error, "Iteration failed, continuing");
                summary.failed.push(record.run_id);
                continue;
            }

            if until.is_done(&record) {
                break;
            }
        }

        info!(
            %loop_id,
            runs = summary.records.len(),
            failed = summary.failed.len(),
            recalibrations = summary.recalibrations.len(),
            failed_recalibrations = summary.failed_recalibrations.len(),
            "Loop finished"
        );
        Ok(summary)
    }

    /// Re-executes a stored run against the snapshot version it originally
    /// used, whatever is current now.
    pub async fn replay(&mut self, run_id: Uuid) -> AppResult<Arc<RunRecord>> {
        let original = self.ctx.results.get(run_id)?;
        let definition = original.metadata.definition.clone().ok_or_else(|| {
            DaqError::NotFound(format!("experiment definition for run {run_id}"))
        })?;
        let snapshot = self.ctx.configs.get(original.snapshot_version)?;
        let mut metadata = RunMetadata::new(self.fault_policy);
        metadata.replay_of = Some(run_id);
        info!(%run_id, version = snapshot.version(), "Replaying run");
        self.execute(&definition, &original.metadata.params, snapshot, metadata)
            .await?
            .into_result()
    }

    /// Queues a manual recalibration for the next iteration.
    pub fn request_recalibration(&self, note: &str) -> AppResult<()> {
        let controller = self.controller.as_ref().ok_or_else(no_controller)?;
        controller.request(note);
        Ok(())
    }

    /// Runs a manual recalibration immediately. Failures are always returned,
    /// whatever the fault policy.
    pub async fn recalibrate_now(&mut self, note: &str) -> AppResult<Arc<RecalibrationEvent>> {
        let policy = self.fault_policy;
        let signal = self.abort.signal();
        let controller = self.controller.as_mut().ok_or_else(no_controller)?;
        let reason = TriggerReason::Manual {
            note: note.to_string(),
        };
        let result = controller.recalibrate(reason, &self.ctx, policy, &signal).await;
        if self.abort.is_aborted() {
            self.abort.reset();
        }
        result
    }

    async fn execute(
        &mut self,
        factory: &dyn ExperimentFactory,
        params: &ParameterSet,
        snapshot: Arc<ConfigSnapshot>,
        metadata: RunMetadata,
    ) -> AppResult<RunOutcome> {
        let signal = self.abort.signal();
        let outcome = self.ctx.run(factory, params, snapshot, metadata, &signal).await?;
        if outcome.record.status == RunStatus::Aborted {
            self.abort.reset();
        }
        if let Some(controller) = &mut self.controller {
            controller.observe(&outcome.record);
        }
        Ok(outcome)
    }

    /// Runs a due recalibration, blocking the caller until it is applied or
    /// has failed.
    async fn check_recalibration(&mut self) -> AppResult<RecalibrationCheck> {
        let policy = self.fault_policy;
        let signal = self.abort.signal();
        let Some(controller) = self.controller.as_mut() else {
            return Ok(RecalibrationCheck::Idle);
        };
        if controller.state() == RecalibrationState::Failed {
            return Ok(RecalibrationCheck::Blocked(DaqError::RecalibrationFailed {
                source: Box::new(DaqError::Validation(
                    "recalibration controller is in the failed state; reset it before running".into(),
                )),
            }));
        }
        let Some(reason) = controller.poll() else {
            return Ok(RecalibrationCheck::Idle);
        };

        let result = controller.recalibrate(reason, &self.ctx, policy, &signal).await;
        if self.abort.is_aborted() {
            self.abort.reset();
        }
        match result {
            Ok(event) => Ok(RecalibrationCheck::Applied(event)),
            Err(err) if policy == FaultPolicy::Continue && !err.is_fatal() && !err.is_aborted() => {
                warn!(error = %err, "Recalibration failed, continuing on the current configuration");
                controller.reset();
                Ok(RecalibrationCheck::Failed(FailedRecalibration {
                    calibration_run: controller.last_calibration_run(),
                    error: err.to_string(),
                }))
            }
            Err(err) => Err(err),
        }
    }

    /// Persists a failed record for a run that was not allowed to start.
    fn refuse(
        &self,
        factory: &dyn ExperimentFactory,
        params: &ParameterSet,
        mut metadata: RunMetadata,
        error: DaqError,
    ) -> AppResult<RunOutcome> {
        if params.validate().is_ok() {
            metadata.params = params.clone();
        }
        let version = self.ctx.configs.current()?.version();
        self.ctx.record_unstarted(factory.name(), version, metadata, error)
    }
}

fn no_controller() -> DaqError {
    DaqError::Validation("no recalibration controller is configured".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::{nv, ExperimentDefinition};
    use crate::hardware::MockHardware;

    fn runner(hw: &MockHardware) -> ExperimentRunner {
        let configs = Arc::new(ConfigurationStore::in_memory());
        configs.save(nv::lab_defaults()).unwrap();
        let results = Arc::new(ResultStore::in_memory(configs));
        ExperimentRunner::new(RunContext::new(results, hw.clone()))
    }

    fn rabi() -> ExperimentDefinition {
        ExperimentDefinition::Measurement {
            name: "time_rabi".into(),
            spec: nv::time_rabi(&[16.0, 20.0]).build().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_run_once_persists_success() {
        let hw = MockHardware::new();
        let mut runner = runner(&hw);
        let record = runner.run_once(&rabi(), &ParameterSet::new()).await.unwrap();
        assert_eq!(record.status, RunStatus::Success);
        assert_eq!(record.snapshot_version, 1);
        assert_eq!(record.metadata.fault_policy, FaultPolicy::Stop);
        assert_eq!(record.metadata.definition, Some(rabi()));
        assert!(runner.context().results().get(record.run_id).is_ok());
    }

    #[tokio::test]
    async fn test_continue_policy_records_failures() {
        let hw = MockHardware::new();
        hw.fail_on_run(2, "counter overflow");
        let mut runner = runner(&hw).with_fault_policy(FaultPolicy::Continue);
        let summary = runner
            .run_loop(&rabi(), &ParameterSet::new(), LoopUntil::Iterations(3))
            .await
            .unwrap();
        assert_eq!(summary.records.len(), 3);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.succeeded(), 2);
        assert_eq!(summary.records[1].status, RunStatus::Failed);
        assert_eq!(
            summary.records[1].metadata.fault_policy,
            FaultPolicy::Continue
        );
    }

    #[tokio::test]
    async fn test_condition_stops_loop() {
        let hw = MockHardware::new();
        let mut runner = runner(&hw);
        let summary = runner
            .run_loop(
                &rabi(),
                &ParameterSet::new(),
                LoopUntil::condition(10, |r| r.metadata.iteration == Some(1)),
            )
            .await
            .unwrap();
        assert_eq!(summary.records.len(), 2);
        assert!(summary
            .records
            .iter()
            .all(|r| r.metadata.loop_id == Some(summary.loop_id)));
    }

    #[tokio::test]
    async fn test_factory_error_leaves_failed_record() {
        let hw = MockHardware::new();
        let mut runner = runner(&hw);
        let err = runner
            .run_once(&rabi(), &ParameterSet::new().with("averages", "many"))
            .await
            .unwrap_err();
        let DaqError::RunFailed { run_id, source } = err else {
            panic!("expected RunFailed");
        };
        assert!(matches!(*source, DaqError::Validation(_)));
        let record = runner.context().results().get(run_id).unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert!(hw.call_log().is_empty());
    }

    #[tokio::test]
    async fn test_non_finite_param_is_not_stored() {
        let hw = MockHardware::new();
        let mut runner = runner(&hw);
        let err = runner
            .run_once(&rabi(), &ParameterSet::new().with("gain", f64::NAN))
            .await
            .unwrap_err();
        assert!(matches!(err.root_cause(), DaqError::Validation(_)));
        let DaqError::RunFailed { run_id, .. } = err else {
            panic!("expected RunFailed");
        };
        let record = runner.context().results().get(run_id).unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert!(record.metadata.params.is_empty());
        assert!(hw.call_log().is_empty());
    }

    #[tokio::test]
    async fn test_request_without_controller_fails() {
        let hw = MockHardware::new();
        let runner = runner(&hw);
        assert!(matches!(
            runner.request_recalibration("drift"),
            Err(DaqError::Validation(_))
        ));
    }
}
