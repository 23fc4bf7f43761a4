//! Mock hardware adapter for testing
//!
//! Simulates the control backend without physical hardware. It provides:
//! - Simulated per-operation latency (`tokio::time::sleep`, never blocking)
//! - Controllable failure injection (next operation, a specific run, apply)
//! - Configurable readout models, including an ODMR-style resonance dip
//! - Call logging for test verification
//!
//! Clones share state, so a test can keep a handle while the runner owns the
//! adapter.

use super::{HardwareAdapter, HardwareError, Operation, OperationKind, StepOutput};
use crate::snapshot::{ConfigSnapshot, SnapshotVersion};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// How the mock produces measurement values.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadoutModel {
    /// Every measurement returns the same value
    Constant(f64),
    /// Reads a numeric parameter from the applied snapshot (0.0 if absent)
    Parameter(String),
    /// Lorentzian dip around `center_hz` as a function of the last frequency
    /// set on any element
    Dip {
        center_hz: f64,
        width_hz: f64,
        baseline: f64,
        depth: f64,
    },
}

#[derive(Debug)]
struct MockState {
    latency: Duration,
    readout: ReadoutModel,
    fail_next: Option<HardwareError>,
    fail_run: Option<(u64, HardwareError)>,
    fail_apply: Option<HardwareError>,
    runs: u64,
    last_frequency_hz: f64,
    applied: Option<Arc<ConfigSnapshot>>,
    applied_versions: Vec<SnapshotVersion>,
    call_log: Vec<String>,
}

/// Mock hardware adapter
///
/// # Example
///
/// ```
/// use nv_daq::hardware::MockHardware;
///
/// let hw = MockHardware::new().with_constant_readout(1.05);
/// assert!(hw.call_log().is_empty());
/// ```
#[derive(Debug, Clone)]
pub struct MockHardware {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockHardware {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHardware {
    /// Create a new mock with no latency and a constant readout of 1.0
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                latency: Duration::ZERO,
                readout: ReadoutModel::Constant(1.0),
                fail_next: None,
                fail_run: None,
                fail_apply: None,
                runs: 0,
                last_frequency_hz: 0.0,
                applied: None,
                applied_versions: Vec::new(),
                call_log: Vec::new(),
            })),
        }
    }

    /// Set simulated latency per operation
    pub fn with_latency(self, latency: Duration) -> Self {
        self.state.lock().latency = latency;
        self
    }

    pub fn with_readout(self, model: ReadoutModel) -> Self {
        self.set_readout(model);
        self
    }

    pub fn with_constant_readout(self, value: f64) -> Self {
        self.with_readout(ReadoutModel::Constant(value))
    }

    /// Change the readout model of a running mock
    pub fn set_readout(&self, model: ReadoutModel) {
        self.state.lock().readout = model;
    }

    /// Inject a failure for the next operation
    pub fn inject_next_failure(&self, message: &str) {
        self.state.lock().fail_next = Some(HardwareError::new("mock", message));
    }

    /// Fail the first operation of the `run`-th run (1-based, counted by
    /// configuration applies)
    pub fn fail_on_run(&self, run: u64, message: &str) {
        self.state.lock().fail_run = Some((run, HardwareError::new("mock", message)));
    }

    /// Fail the next configuration apply
    pub fn fail_next_apply(&self, message: &str) {
        self.state.lock().fail_apply = Some(HardwareError::new("mock", message));
    }

    /// Get the call log
    pub fn call_log(&self) -> Vec<String> {
        self.state.lock().call_log.clone()
    }

    /// Clear the call log
    pub fn clear_log(&self) {
        self.state.lock().call_log.clear();
    }

    /// Versions passed to `apply_configuration`, in order
    pub fn applied_versions(&self) -> Vec<SnapshotVersion> {
        self.state.lock().applied_versions.clone()
    }

    /// Number of runs started (configuration applies)
    pub fn runs(&self) -> u64 {
        self.state.lock().runs
    }

    async fn simulate_latency(&self) {
        let latency = self.state.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

impl MockState {
    fn measure(&self) -> f64 {
        match &self.readout {
            ReadoutModel::Constant(v) => *v,
            ReadoutModel::Parameter(key) => self
                .applied
                .as_ref()
                .and_then(|snap| snap.parameters().get_f64(key))
                .unwrap_or(0.0),
            ReadoutModel::Dip {
                center_hz,
                width_hz,
                baseline,
                depth,
            } => {
                let detuning = self.last_frequency_hz - center_hz;
                let half = width_hz / 2.0;
                baseline - depth * half * half / (detuning * detuning + half * half)
            }
        }
    }
}

#[async_trait]
impl HardwareAdapter for MockHardware {
    fn name(&self) -> &str {
        "mock"
    }

    async fn apply_configuration(&mut self, snapshot: &ConfigSnapshot) -> Result<(), HardwareError> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.call_log.push(format!("apply v{}", snapshot.version()));
        if let Some(err) = state.fail_apply.take() {
            return Err(err);
        }
        state.runs += 1;
        state.applied = Some(Arc::new(snapshot.clone()));
        state.applied_versions.push(snapshot.version());
        Ok(())
    }

    async fn execute_operation(&mut self, operation: &Operation) -> Result<StepOutput, HardwareError> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.call_log.push(operation.to_string());

        if let Some(err) = state.fail_next.take() {
            return Err(err);
        }
        let runs = state.runs;
        if matches!(&state.fail_run, Some((run, _)) if *run == runs) {
            if let Some((_, err)) = state.fail_run.take() {
                return Err(err);
            }
        }

        match &operation.kind {
            OperationKind::SetFrequency { frequency_hz, .. } => {
                state.last_frequency_hz = *frequency_hz;
                Ok(StepOutput::Done)
            }
            OperationKind::Measure { .. } => Ok(StepOutput::Value(state.measure())),
            _ => Ok(StepOutput::Done),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::Pass;
    use crate::parameter::ParameterSet;
    use crate::snapshot::SnapshotOrigin;

    fn measure_op(index: usize) -> Operation {
        Operation {
            index,
            point: 0,
            pass: Pass::Signal0,
            kind: OperationKind::Measure {
                channel: "SPCM1".into(),
                mode: "readout".into(),
                length_ns: 600.0,
                averages: 1,
            },
        }
    }

    fn snapshot(power: f64) -> ConfigSnapshot {
        ConfigSnapshot::new(
            1,
            None,
            SnapshotOrigin::Manual,
            ParameterSet::new().with("power", power),
        )
    }

    #[tokio::test]
    async fn test_constant_readout_and_log() {
        let mut hw = MockHardware::new().with_constant_readout(1.05);
        hw.apply_configuration(&snapshot(1.0)).await.unwrap();
        let out = hw.execute_operation(&measure_op(0)).await.unwrap();
        assert_eq!(out, StepOutput::Value(1.05));
        assert_eq!(hw.call_log().len(), 2);
        assert_eq!(hw.applied_versions(), vec![1]);
    }

    #[tokio::test]
    async fn test_parameter_readout_follows_applied_snapshot() {
        let mut hw = MockHardware::new().with_readout(ReadoutModel::Parameter("power".into()));
        hw.apply_configuration(&snapshot(0.8)).await.unwrap();
        let out = hw.execute_operation(&measure_op(0)).await.unwrap();
        assert_eq!(out, StepOutput::Value(0.8));
    }

    #[tokio::test]
    async fn test_injected_failure_fires_once() {
        let mut hw = MockHardware::new();
        hw.inject_next_failure("PLL unlocked");
        let err = hw.execute_operation(&measure_op(0)).await.unwrap_err();
        assert_eq!(err.message, "PLL unlocked");
        assert!(hw.execute_operation(&measure_op(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_fail_on_run_targets_one_run() {
        let mut hw = MockHardware::new();
        hw.fail_on_run(2, "SPCM saturated");
        hw.apply_configuration(&snapshot(1.0)).await.unwrap();
        assert!(hw.execute_operation(&measure_op(0)).await.is_ok());
        hw.apply_configuration(&snapshot(1.0)).await.unwrap();
        assert!(hw.execute_operation(&measure_op(0)).await.is_err());
        assert!(hw.execute_operation(&measure_op(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_dip_is_deepest_at_center() {
        let hw = MockHardware::new().with_readout(ReadoutModel::Dip {
            center_hz: 80e6,
            width_hz: 2e6,
            baseline: 1.0,
            depth: 0.3,
        });
        let read_at = |f: f64| {
            let mut hw = hw.clone();
            async move {
                let op = Operation {
                    index: 0,
                    point: 0,
                    pass: Pass::Signal0,
                    kind: OperationKind::SetFrequency {
                        element: "NV".into(),
                        frequency_hz: f,
                    },
                };
                hw.execute_operation(&op).await.unwrap();
                hw.execute_operation(&measure_op(1)).await.unwrap()
            }
        };
        let on = read_at(80e6).await;
        let off = read_at(90e6).await;
        match (on, off) {
            (StepOutput::Value(on), StepOutput::Value(off)) => assert!(on < off),
            other => panic!("unexpected outputs {other:?}"),
        }
        hw.clear_log();
        assert!(hw.call_log().is_empty());
    }
}
