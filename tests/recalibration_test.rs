//! End-to-end recalibration: drift correction, lineage and failure handling.

mod common;

use common::{lab, power_calibration, rabi, POWER};
use nv_daq::experiment::{nv, CalibrationRule, ExperimentDefinition};
use nv_daq::hardware::mock::ReadoutModel;
use nv_daq::hardware::MockHardware;
use nv_daq::recalibration::{EveryNRuns, ManualOnly, RecalibrationController, RecalibrationState};
use nv_daq::record::TriggerReason;
use nv_daq::runner::{FaultPolicy, LoopUntil};
use nv_daq::snapshot::{SnapshotOrigin, VersionSelector};
use nv_daq::store::RunQuery;
use nv_daq::{DaqError, ParameterSet, RunStatus};
use std::sync::Arc;
use std::time::Duration;

fn controller(policy: impl nv_daq::recalibration::TriggerPolicy + 'static) -> RecalibrationController {
    RecalibrationController::new(Box::new(policy), Arc::new(power_calibration()))
}

fn assert_close(actual: Option<f64>, expected: f64) {
    let actual = actual.expect("readout present");
    assert!((actual - expected).abs() < 1e-9, "{actual} != {expected}");
}

#[tokio::test]
async fn test_drift_correction_publishes_new_version() {
    let hw = MockHardware::new().with_readout(ReadoutModel::Parameter(POWER.into()));
    let mut lab = lab(hw);
    lab.runner = lab.runner.with_recalibration(controller(ManualOnly));
    let params = ParameterSet::new();

    let r1 = lab.runner.run_once(&rabi(3), &params).await.unwrap();
    assert_eq!(r1.snapshot_version, 1);
    assert_close(r1.payload.as_ref().unwrap().mean("signal0"), 1.0);

    lab.hw.set_readout(ReadoutModel::Constant(1.05));
    let event = lab.runner.recalibrate_now("power drift").await.unwrap();
    assert_eq!(event.previous_version, 1);
    assert_eq!(event.new_version, 2);
    assert_eq!(event.delta.get_f64(POWER), Some(1.05));
    assert!(matches!(event.reason, TriggerReason::Manual { .. }));

    lab.hw.set_readout(ReadoutModel::Parameter(POWER.into()));
    let r2 = lab.runner.run_once(&rabi(3), &params).await.unwrap();
    assert_eq!(r2.snapshot_version, 2);
    assert_close(r2.payload.as_ref().unwrap().mean("signal0"), 1.05);

    // history is untouched
    let stored = lab.results.get(r1.run_id).unwrap();
    assert_eq!(stored.snapshot_version, 1);
    let v1 = lab.configs.load(VersionSelector::Exact(1)).unwrap();
    assert_eq!(v1.parameters().get_f64(POWER), Some(1.0));

    let v2 = lab.configs.current().unwrap();
    assert_eq!(v2.parent(), Some(1));
    assert_eq!(
        v2.origin(),
        &SnapshotOrigin::Recalibration {
            calibration_run: event.calibration_run
        }
    );

    let calibration_run = lab.results.get(event.calibration_run).unwrap();
    assert!(calibration_run.metadata.calibration);
    assert_eq!(calibration_run.snapshot_version, 1);

    let lineage = lab.results.lineage(2).unwrap();
    assert_eq!(lineage.len(), 1);
    assert_eq!(lineage[0].id, event.id);
    assert!(lab.results.lineage(1).unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_calibration_keeps_current_version() {
    let mut lab = lab(MockHardware::new());
    lab.runner = lab.runner.with_recalibration(controller(ManualOnly));

    lab.hw.fail_next_apply("AWG not responding");
    let err = lab.runner.recalibrate_now("operator").await.unwrap_err();
    assert!(matches!(err, DaqError::RecalibrationFailed { .. }));
    assert!(matches!(err.root_cause(), DaqError::Hardware(_)));

    assert_eq!(lab.configs.current_version(), Some(1));
    assert_eq!(lab.configs.list_versions(), vec![1]);
    assert!(lab.results.events().is_empty());
    assert_eq!(
        lab.runner.controller().unwrap().state(),
        RecalibrationState::Failed
    );

    // runs refuse until the failure is acknowledged
    let runs = lab.hw.runs();
    let refused = lab
        .runner
        .run_once(&rabi(2), &ParameterSet::new())
        .await
        .unwrap_err();
    let DaqError::RunFailed { run_id, source } = &refused else {
        panic!("expected RunFailed, got {refused:?}");
    };
    assert!(matches!(**source, DaqError::RecalibrationFailed { .. }));
    assert_eq!(lab.hw.runs(), runs);
    let record = lab.results.get(*run_id).unwrap();
    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(record.experiment, "time_rabi");
    assert_eq!(record.snapshot_version, 1);

    lab.runner.controller_mut().unwrap().reset();
    let record = lab.runner.run_once(&rabi(2), &ParameterSet::new()).await.unwrap();
    assert_eq!(record.snapshot_version, 1);
}

#[tokio::test]
async fn test_loop_recalibrates_on_schedule() {
    let hw = MockHardware::new().with_constant_readout(1.05);
    let mut lab = lab(hw);
    lab.runner = lab.runner.with_recalibration(controller(EveryNRuns(2)));

    let summary = lab
        .runner
        .run_loop(&rabi(2), &ParameterSet::new(), LoopUntil::Iterations(5))
        .await
        .unwrap();

    assert_eq!(summary.records.len(), 5);
    assert_eq!(summary.recalibrations.len(), 2);
    let versions: Vec<u64> = summary.records.iter().map(|r| r.snapshot_version).collect();
    assert_eq!(versions, vec![1, 1, 2, 2, 3]);
    assert!(summary
        .records
        .iter()
        .all(|r| r.metadata.loop_id == Some(summary.loop_id)));
    assert_eq!(lab.configs.current_version(), Some(3));
    assert_eq!(lab.results.lineage(3).unwrap().len(), 2);
}

#[tokio::test]
async fn test_replay_uses_original_version() {
    let hw = MockHardware::new().with_readout(ReadoutModel::Parameter(POWER.into()));
    let mut lab = lab(hw);
    lab.runner = lab.runner.with_recalibration(controller(ManualOnly));

    let original = lab.runner.run_once(&rabi(2), &ParameterSet::new()).await.unwrap();
    lab.hw.set_readout(ReadoutModel::Constant(1.2));
    lab.runner.recalibrate_now("drift").await.unwrap();
    assert_eq!(lab.configs.current_version(), Some(2));

    lab.hw.set_readout(ReadoutModel::Parameter(POWER.into()));
    let replay = lab.runner.replay(original.run_id).await.unwrap();
    assert_eq!(replay.snapshot_version, 1);
    assert_eq!(replay.metadata.replay_of, Some(original.run_id));
    assert_close(replay.payload.as_ref().unwrap().mean("signal0"), 1.0);
    assert_eq!(lab.hw.applied_versions().last(), Some(&1));
}

/// Calibration whose rule reads a label the sequence never produces.
fn unusable_calibration() -> ExperimentDefinition {
    ExperimentDefinition::Calibration {
        name: "unusable_calibration".to_string(),
        spec: nv::power_rabi(&[1.0]).build().unwrap(),
        rule: CalibrationRule::ReadoutMean {
            label: "missing".to_string(),
            parameter: POWER.to_string(),
            scale: 1.0,
        },
    }
}

#[tokio::test]
async fn test_failed_calibration_waits_for_next_trigger() {
    let mut lab = lab(MockHardware::new());
    lab.runner = lab
        .runner
        .with_fault_policy(FaultPolicy::Continue)
        .with_recalibration(RecalibrationController::new(
            Box::new(EveryNRuns(2)),
            Arc::new(unusable_calibration()),
        ));

    let summary = lab
        .runner
        .run_loop(&rabi(1), &ParameterSet::new(), LoopUntil::Iterations(6))
        .await
        .unwrap();

    assert_eq!(summary.records.len(), 6);
    assert_eq!(summary.succeeded(), 6);
    assert!(summary.recalibrations.is_empty());
    // fired before iterations 2 and 4, not before every iteration
    assert_eq!(summary.failed_recalibrations.len(), 2);
    for failure in &summary.failed_recalibrations {
        let run_id = failure.calibration_run.expect("calibration ran");
        assert!(lab.results.get(run_id).unwrap().metadata.calibration);
        assert!(failure.error.contains("missing"));
    }
    let calibration_runs = lab
        .results
        .query(RunQuery::new().experiment("unusable_calibration"))
        .count();
    assert_eq!(calibration_runs, 2);
    assert_eq!(lab.configs.list_versions(), vec![1]);
    assert_eq!(
        lab.runner.controller().unwrap().state(),
        RecalibrationState::Idle
    );
}

#[tokio::test]
async fn test_abort_during_calibration_keeps_current_version() {
    let hw = MockHardware::new().with_latency(Duration::from_millis(5));
    let mut lab = lab(hw);
    let points: Vec<f64> = (1..=50).map(|i| i as f64 / 50.0).collect();
    let slow = ExperimentDefinition::Calibration {
        name: "power_calibration".to_string(),
        spec: nv::power_rabi(&points).build().unwrap(),
        rule: CalibrationRule::ReadoutMean {
            label: "signal0".to_string(),
            parameter: POWER.to_string(),
            scale: 1.0,
        },
    };
    lab.runner = lab
        .runner
        .with_recalibration(RecalibrationController::new(Box::new(ManualOnly), Arc::new(slow)));
    let abort = lab.runner.abort_handle();

    let trigger = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        abort.abort();
    });
    let err = lab.runner.recalibrate_now("drift").await.unwrap_err();
    trigger.await.unwrap();

    assert!(err.is_aborted());
    let aborted: Vec<_> = lab
        .results
        .query(RunQuery::new().status(RunStatus::Aborted))
        .collect();
    assert_eq!(aborted.len(), 1);
    assert!(aborted[0].metadata.calibration);
    assert!(aborted[0].payload.is_none());
    assert_eq!(lab.configs.list_versions(), vec![1]);
    assert_eq!(lab.configs.current_version(), Some(1));
    assert!(lab.results.events().is_empty());
    assert_eq!(
        lab.runner.controller().unwrap().state(),
        RecalibrationState::Failed
    );

    lab.runner.controller_mut().unwrap().reset();
    let record = lab.runner.run_once(&rabi(1), &ParameterSet::new()).await.unwrap();
    assert_eq!(record.status, RunStatus::Success);
    assert_eq!(record.snapshot_version, 1);
}

#[tokio::test]
async fn test_rollback_keeps_event_history() {
    let mut lab = lab(MockHardware::new().with_constant_readout(1.05));
    lab.runner = lab.runner.with_recalibration(controller(ManualOnly));
    let event = lab.runner.recalibrate_now("drift").await.unwrap();
    assert_eq!(lab.configs.current_version(), Some(2));

    lab.configs.promote(1).unwrap();

    assert_eq!(lab.configs.current_version(), Some(1));
    let lineage = lab.results.lineage(2).unwrap();
    assert_eq!(lineage.len(), 1);
    assert_eq!(lineage[0].id, event.id);
    let record = lab.runner.run_once(&rabi(1), &ParameterSet::new()).await.unwrap();
    assert_eq!(record.snapshot_version, 1);
}
