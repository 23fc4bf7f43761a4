//! Pluggable trigger conditions.
//!
//! A [`TriggerPolicy`] inspects what happened since the last recalibration and
//! decides whether another one is due. Policies are pure: the controller owns
//! the counters and clock, and resets them after every applied recalibration.
//! Manual requests bypass the policy entirely.

use crate::record::{RunRecord, TriggerReason};
use std::fmt::Debug;
use std::time::Duration;

/// What a policy can see.
#[derive(Debug, Clone, Copy)]
pub struct TriggerContext<'a> {
    /// Measurement runs since the last applied recalibration (or start)
    pub runs_since: u64,
    /// Wall-clock time since the last applied recalibration (or start)
    pub since_last: Duration,
    /// Most recent measurement run, if any
    pub last_record: Option<&'a RunRecord>,
}

/// Decides when the recalibration loop fires.
pub trait TriggerPolicy: Send + Sync + Debug {
    /// `Some(reason)` if a recalibration is due.
    fn evaluate(&self, ctx: &TriggerContext<'_>) -> Option<TriggerReason>;
}

/// Fires once every `n` measurement runs.
#[derive(Debug, Clone, Copy)]
pub struct EveryNRuns(pub u64);

impl TriggerPolicy for EveryNRuns {
    fn evaluate(&self, ctx: &TriggerContext<'_>) -> Option<TriggerReason> {
        (self.0 > 0 && ctx.runs_since >= self.0).then(|| TriggerReason::Scheduled {
            detail: format!("{} runs since last recalibration", ctx.runs_since),
        })
    }
}

/// Fires when `interval` has elapsed.
#[derive(Debug, Clone, Copy)]
pub struct Interval(pub Duration);

impl TriggerPolicy for Interval {
    fn evaluate(&self, ctx: &TriggerContext<'_>) -> Option<TriggerReason> {
        (ctx.since_last >= self.0).then(|| TriggerReason::Scheduled {
            detail: format!("{:.1}s since last recalibration", ctx.since_last.as_secs_f64()),
        })
    }
}

/// Fires when the mean of a readout of the last successful run leaves
/// `[min, max]`. Either bound may be open.
#[derive(Debug, Clone)]
pub struct ReadoutThreshold {
    pub label: String,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl TriggerPolicy for ReadoutThreshold {
    fn evaluate(&self, ctx: &TriggerContext<'_>) -> Option<TriggerReason> {
        let record = ctx.last_record.filter(|r| r.is_success())?;
        let value = record.payload.as_ref()?.mean(&self.label)?;
        let below = self.min.is_some_and(|min| value < min);
        let above = self.max.is_some_and(|max| value > max);
        (below || above).then(|| TriggerReason::ThresholdExceeded {
            label: self.label.clone(),
            value,
        })
    }
}

/// First policy that fires wins.
#[derive(Debug)]
pub struct AnyOf(pub Vec<Box<dyn TriggerPolicy>>);

impl TriggerPolicy for AnyOf {
    fn evaluate(&self, ctx: &TriggerContext<'_>) -> Option<TriggerReason> {
        self.0.iter().find_map(|policy| policy.evaluate(ctx))
    }
}

/// Never fires on its own; only explicit requests recalibrate.
#[derive(Debug, Clone, Copy)]
pub struct ManualOnly;

impl TriggerPolicy for ManualOnly {
    fn evaluate(&self, _ctx: &TriggerContext<'_>) -> Option<TriggerReason> {
        None
    }
}
