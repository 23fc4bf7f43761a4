//! Closed-loop recalibration.
//!
//! [`RecalibrationController`] is an explicit state machine:
//!
//! ```text
//!          trigger fires / manual request
//!   Idle ───────────────────────────────> Triggering
//!    ^                                        │ calibration experiment bound
//!    │                                        v   to the current snapshot
//!    │ new snapshot promoted            AwaitingResult
//!    │                                        │ successful run
//!    │                                        v
//!    └──────────────────────────────────  Applying
//!
//!   any state ── hardware / sequence / store error ──> Failed ── reset() ──> Idle
//! ```
//!
//! Applying is ordered so that a crash at any point leaves the previous
//! snapshot current: the merged snapshot is staged (durable but not current),
//! the event linking the calibration run to it is recorded, and only then is
//! the snapshot promoted.

pub mod trigger;

pub use trigger::{
    AnyOf, EveryNRuns, Interval, ManualOnly, ReadoutThreshold, TriggerContext, TriggerPolicy,
};

use crate::error::{AppResult, DaqError};
use crate::experiment::ExperimentFactory;
use crate::parameter::ParameterSet;
use crate::record::{RecalibrationEvent, RunMetadata, RunRecord, TriggerReason};
use crate::runner::{AbortSignal, FaultPolicy, RunContext, RunOutcome};
use crate::snapshot::SnapshotOrigin;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

const NOTICE_CAPACITY: usize = 64;

/// Controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecalibrationState {
    Idle,
    Triggering,
    AwaitingResult,
    Applying,
    /// Last attempt failed; the previous snapshot is still current
    Failed,
}

impl fmt::Display for RecalibrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecalibrationState::Idle => "idle",
            RecalibrationState::Triggering => "triggering",
            RecalibrationState::AwaitingResult => "awaiting_result",
            RecalibrationState::Applying => "applying",
            RecalibrationState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Broadcast to subscribers as the controller works.
#[derive(Debug, Clone)]
pub enum RecalibrationNotice {
    /// Every state transition, including `Failed -> Idle` on reset
    StateChanged {
        from: RecalibrationState,
        to: RecalibrationState,
    },
    /// A new snapshot became current
    Applied(Arc<RecalibrationEvent>),
    /// The attempt failed and the previous snapshot stayed current
    Failed {
        reason: TriggerReason,
        /// Calibration run, if the attempt got as far as running one
        calibration_run: Option<Uuid>,
        error: String,
    },
}

/// Queues manual recalibration requests from outside the runner.
#[derive(Debug, Clone, Default)]
pub struct RecalibrationRequester {
    pending: Arc<Mutex<Option<String>>>,
}

impl RecalibrationRequester {
    /// Requests a recalibration before the next run. A newer request replaces
    /// an unserved one.
    pub fn request(&self, note: &str) {
        *self.pending.lock() = Some(note.to_string());
    }

    /// Whether a request is waiting to be served.
    pub fn is_pending(&self) -> bool {
        self.pending.lock().is_some()
    }

    fn take(&self) -> Option<String> {
        self.pending.lock().take()
    }
}

/// Decides when to recalibrate and applies calibration results.
pub struct RecalibrationController {
    policy: Box<dyn TriggerPolicy>,
    calibration: Arc<dyn ExperimentFactory>,
    params: ParameterSet,
    state: RecalibrationState,
    requests: RecalibrationRequester,
    runs_since: u64,
    window_start: Instant,
    last_record: Option<Arc<RunRecord>>,
    last_calibration_run: Option<Uuid>,
    notices: broadcast::Sender<RecalibrationNotice>,
}

impl fmt::Debug for RecalibrationController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecalibrationController")
            .field("policy", &self.policy)
            .field("calibration", &self.calibration.name())
            .field("state", &self.state)
            .field("runs_since", &self.runs_since)
            .finish_non_exhaustive()
    }
}

impl RecalibrationController {
    /// `calibration` must create experiments with a calibration capability;
    /// anything else fails the attempt with a `Sequence` error.
    pub fn new(policy: Box<dyn TriggerPolicy>, calibration: Arc<dyn ExperimentFactory>) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            policy,
            calibration,
            params: ParameterSet::new(),
            state: RecalibrationState::Idle,
            requests: RecalibrationRequester::default(),
            runs_since: 0,
            window_start: Instant::now(),
            last_record: None,
            last_calibration_run: None,
            notices,
        }
    }

    /// Parameters passed to the calibration factory.
    pub fn with_params(mut self, params: ParameterSet) -> Self {
        self.params = params;
        self
    }

    /// Current state of the machine.
    pub fn state(&self) -> RecalibrationState {
        self.state
    }

    /// Measurement runs observed since the last recalibration attempt.
    pub fn runs_since(&self) -> u64 {
        self.runs_since
    }

    /// Queues a manual recalibration for the next poll.
    pub fn request(&self, note: &str) {
        self.requests.request(note);
    }

    /// Handle for requesting recalibration without access to the controller.
    pub fn requester(&self) -> RecalibrationRequester {
        self.requests.clone()
    }

    /// State changes and outcomes, as they happen.
    pub fn subscribe(&self) -> broadcast::Receiver<RecalibrationNotice> {
        self.notices.subscribe()
    }

    /// Sender side, for facades that hand out receivers on their own.
    pub fn notifier(&self) -> broadcast::Sender<RecalibrationNotice> {
        self.notices.clone()
    }

    /// Calibration run of the most recent attempt, if it got that far.
    pub fn last_calibration_run(&self) -> Option<Uuid> {
        self.last_calibration_run
    }

    /// Feeds a persisted run to the trigger counters. Calibration runs are
    /// not counted.
    pub fn observe(&mut self, record: &Arc<RunRecord>) {
        if record.metadata.calibration {
            return;
        }
        self.runs_since += 1;
        self.last_record = Some(Arc::clone(record));
    }

    /// Reason to recalibrate now, if any. Manual requests take precedence
    /// over the policy. Only an idle controller fires.
    pub fn poll(&mut self) -> Option<TriggerReason> {
        if self.state != RecalibrationState::Idle {
            return None;
        }
        if let Some(note) = self.requests.take() {
            return Some(TriggerReason::Manual { note });
        }
        let ctx = TriggerContext {
            runs_since: self.runs_since,
            since_last: self.window_start.elapsed(),
            last_record: self.last_record.as_deref(),
        };
        self.policy.evaluate(&ctx)
    }

    /// Leaves `Failed` after the failure has been handled.
    pub fn reset(&mut self) {
        if self.state == RecalibrationState::Failed {
            self.transition(RecalibrationState::Idle);
        }
    }

    fn transition(&mut self, to: RecalibrationState) {
        let from = std::mem::replace(&mut self.state, to);
        info!(%from, %to, "Recalibration state changed");
        // no subscribers is fine
        let _ = self.notices.send(RecalibrationNotice::StateChanged { from, to });
    }

    /// Runs the calibration experiment against the current snapshot and
    /// applies its delta as a new current snapshot.
    ///
    /// On any failure the controller ends in `Failed`, the current snapshot is
    /// unchanged and the error is returned as `RecalibrationFailed`.
    pub async fn recalibrate(
        &mut self,
        reason: TriggerReason,
        ctx: &RunContext,
        fault_policy: FaultPolicy,
        abort: &AbortSignal,
    ) -> AppResult<Arc<RecalibrationEvent>> {
        if self.state != RecalibrationState::Idle {
            return Err(DaqError::RecalibrationFailed {
                source: Box::new(DaqError::Validation(format!(
                    "controller is {}, expected idle",
                    self.state
                ))),
            });
        }
        info!(%reason, calibration = self.calibration.name(), "Recalibration triggered");
        self.transition(RecalibrationState::Triggering);

        self.last_calibration_run = None;
        let result = self.attempt(&reason, ctx, fault_policy, abort).await;
        // every attempt, failed or not, starts a fresh trigger window
        self.runs_since = 0;
        self.window_start = Instant::now();
        self.last_record = None;
        match result {
            Ok(event) => {
                self.transition(RecalibrationState::Idle);
                let _ = self.notices.send(RecalibrationNotice::Applied(Arc::clone(&event)));
                Ok(event)
            }
            Err(err) => {
                warn!(%reason, error = %err, "Recalibration failed, keeping current configuration");
                self.transition(RecalibrationState::Failed);
                let _ = self.notices.send(RecalibrationNotice::Failed {
                    reason,
                    calibration_run: self.last_calibration_run,
                    error: err.to_string(),
                });
                Err(DaqError::RecalibrationFailed {
                    source: Box::new(err),
                })
            }
        }
    }

    async fn attempt(
        &mut self,
        reason: &TriggerReason,
        ctx: &RunContext,
        fault_policy: FaultPolicy,
        abort: &AbortSignal,
    ) -> AppResult<Arc<RecalibrationEvent>> {
        let current = ctx.configs().current()?;
        let mut metadata = RunMetadata::new(fault_policy);
        metadata.calibration = true;

        self.transition(RecalibrationState::AwaitingResult);
        let RunOutcome {
            record,
            experiment,
            error,
        } = ctx
            .run(
                self.calibration.as_ref(),
                &self.params,
                Arc::clone(&current),
                metadata,
                abort,
            )
            .await?;
        self.last_calibration_run = Some(record.run_id);
        if let Some(source) = error {
            return Err(DaqError::RunFailed {
                run_id: record.run_id,
                source: Box::new(source),
            });
        }

        self.transition(RecalibrationState::Applying);
        let calibration = experiment
            .as_deref()
            .and_then(|exp| exp.as_calibration())
            .ok_or_else(|| {
                DaqError::Sequence(format!("run {} has no calibration capability", record.run_id))
            })?;
        let payload = record.payload.as_ref().ok_or_else(|| {
            DaqError::Sequence(format!("calibration run {} produced no data", record.run_id))
        })?;
        let delta = calibration.extract_calibration_delta(payload)?;

        let staged = ctx.configs().stage(
            current.parameters().merged(&delta),
            SnapshotOrigin::Recalibration {
                calibration_run: record.run_id,
            },
        )?;
        let event = ctx.results().record_event(RecalibrationEvent {
            id: Uuid::new_v4(),
            reason: reason.clone(),
            calibration_run: record.run_id,
            previous_version: current.version(),
            new_version: staged.version(),
            delta,
            recorded_at: Utc::now(),
        })?;
        ctx.configs().promote(staged.version())?;

        info!(
            previous = current.version(),
            new = staged.version(),
            calibration_run = %record.run_id,
            "Recalibration applied"
        );
        Ok(event)
    }
}
