//! Durable stores: reopen after restart, duplicate and orphaned records.

mod common;

use common::{base_params, power_calibration, rabi, POWER};
use nv_daq::hardware::mock::ReadoutModel;
use nv_daq::hardware::MockHardware;
use nv_daq::runner::{ExperimentRunner, RunContext};
use nv_daq::settings::{RecalibrationSettings, Settings, StorageSettings, TriggerSettings};
use nv_daq::store::{ConfigurationStore, ResultStore, RunQuery};
use nv_daq::{DaqError, LabSession, ParameterSet};
use std::sync::Arc;
use tempfile::TempDir;

fn settings(dir: &TempDir) -> Settings {
    Settings {
        storage: StorageSettings {
            root: Some(dir.path().to_path_buf()),
        },
        recalibration: Some(RecalibrationSettings {
            trigger: TriggerSettings::Manual,
            params: ParameterSet::new(),
        }),
        ..Settings::default()
    }
}

#[tokio::test]
async fn test_history_survives_restart() {
    let dir = TempDir::new().unwrap();
    let (run_id, event_id) = {
        let hw = MockHardware::new().with_constant_readout(1.1);
        let session =
            LabSession::open(&settings(&dir), hw, Some(Arc::new(power_calibration()))).unwrap();
        session.save_configuration(base_params()).unwrap();
        let record = session.submit(&rabi(2), &ParameterSet::new()).await.unwrap();
        session.request_recalibration("drift").unwrap();
        session.submit(&rabi(2), &ParameterSet::new()).await.unwrap();
        (record.run_id, session.recalibrations()[0].id)
    };

    let configs = Arc::new(ConfigurationStore::open(dir.path()).unwrap());
    let results = ResultStore::open(dir.path(), Arc::clone(&configs)).unwrap();

    assert_eq!(configs.list_versions(), vec![1, 2]);
    assert_eq!(configs.current_version(), Some(2));
    let current = configs.current().unwrap();
    assert_eq!(current.parameters().get_f64(POWER), Some(1.1));
    assert_eq!(configs.get(1).unwrap().parameters().get_f64(POWER), Some(1.0));

    // two measurements plus the calibration run
    assert_eq!(results.len(), 3);
    let first = results.get(run_id).unwrap();
    assert_eq!(first.snapshot_version, 1);
    assert!(first.metadata.definition.is_some());
    assert_eq!(results.query(RunQuery::new().snapshot_version(2)).count(), 1);
    assert_eq!(results.query(RunQuery::new().experiment("time_rabi")).count(), 2);

    let lineage = results.lineage(2).unwrap();
    assert_eq!(lineage.len(), 1);
    assert_eq!(lineage[0].id, event_id);
}

#[tokio::test]
async fn test_reopened_session_replays_old_run() {
    let dir = TempDir::new().unwrap();
    let run_id = {
        let hw = MockHardware::new().with_readout(ReadoutModel::Parameter(POWER.into()));
        let session =
            LabSession::open(&settings(&dir), hw, Some(Arc::new(power_calibration()))).unwrap();
        session.save_configuration(base_params()).unwrap();
        session.submit(&rabi(1), &ParameterSet::new()).await.unwrap().run_id
    };

    let hw = MockHardware::new();
    let session =
        LabSession::open(&settings(&dir), hw.clone(), Some(Arc::new(power_calibration()))).unwrap();
    session
        .save_configuration(base_params().with(POWER, 2.0))
        .unwrap();
    let replay = session.replay(run_id).await.unwrap();
    assert_eq!(replay.snapshot_version, 1);
    assert_eq!(hw.applied_versions(), vec![1]);
}

#[tokio::test]
async fn test_duplicate_run_is_rejected() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let configs = Arc::new(ConfigurationStore::open(dir.path())?);
    configs.save(base_params())?;
    let results = Arc::new(ResultStore::open(dir.path(), Arc::clone(&configs))?);
    let mut runner = ExperimentRunner::new(RunContext::new(Arc::clone(&results), MockHardware::new()));

    let record = runner.run_once(&rabi(1), &ParameterSet::new()).await?;
    let err = results.persist((*record).clone()).unwrap_err();
    assert!(matches!(err, DaqError::DuplicateRun(id) if id == record.run_id));

    // a second handle on the same directory sees the file
    let other = ResultStore::open(dir.path(), Arc::clone(&configs))?;
    let err = other.persist((*record).clone()).unwrap_err();
    assert!(matches!(err, DaqError::DuplicateRun(_)));
    assert_eq!(other.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_record_for_unknown_version_is_refused() {
    let dir = TempDir::new().unwrap();
    let configs = Arc::new(ConfigurationStore::open(dir.path()).unwrap());
    configs.save(base_params()).unwrap();
    let results = Arc::new(ResultStore::open(dir.path(), Arc::clone(&configs)).unwrap());
    let mut runner = ExperimentRunner::new(RunContext::new(Arc::clone(&results), MockHardware::new()));
    let record = runner.run_once(&rabi(1), &ParameterSet::new()).await.unwrap();

    let mut orphan = (*record).clone();
    orphan.run_id = uuid::Uuid::new_v4();
    orphan.snapshot_version = 99;
    let err = results.persist(orphan).unwrap_err();
    assert!(matches!(err, DaqError::ReferentialIntegrity(_)));
    assert_eq!(results.len(), 1);
}


#[tokio::test]
async fn test_nan_readout_does_not_poison_store() {
    let dir = TempDir::new().unwrap();
    {
        let hw = MockHardware::new().with_constant_readout(f64::NAN);
        let session =
            LabSession::open(&settings(&dir), hw, Some(Arc::new(power_calibration()))).unwrap();
        session.save_configuration(base_params()).unwrap();
        let err = session.submit(&rabi(2), &ParameterSet::new()).await.unwrap_err();
        assert!(matches!(err.root_cause(), DaqError::Hardware(_)));
    }

    let configs = Arc::new(ConfigurationStore::open(dir.path()).unwrap());
    let results = ResultStore::open(dir.path(), Arc::clone(&configs)).unwrap();
    let failed: Vec<_> = results
        .query(RunQuery::new().status(nv_daq::RunStatus::Failed))
        .collect();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].error.as_deref().unwrap_or_default().contains("non-finite"));

    // the root stays usable
    let session =
        LabSession::open(&settings(&dir), MockHardware::new(), Some(Arc::new(power_calibration())))
            .unwrap();
    assert_eq!(session.history(RunQuery::new()).len(), 1);
}
