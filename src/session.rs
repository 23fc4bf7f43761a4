//! Integration facade for external lab-control software.
//!
//! [`LabSession`] is the only surface an orchestrator needs: read the current
//! configuration, submit runs, watch recalibrations and request new ones. It
//! never exposes the runner or the stores mutably, so outside code cannot
//! move the current snapshot or rewrite history behind the engine's back.

use crate::error::{AppResult, DaqError};
use crate::experiment::ExperimentFactory;
use crate::hardware::HardwareAdapter;
use crate::parameter::ParameterSet;
use crate::recalibration::{RecalibrationController, RecalibrationNotice, RecalibrationRequester};
use crate::record::{RecalibrationEvent, RunRecord};
use crate::runner::{AbortHandle, ExperimentRunner, LoopSummary, LoopUntil, RunContext};
use crate::settings::Settings;
use crate::snapshot::{ConfigSnapshot, SnapshotVersion};
use crate::store::{ConfigurationStore, ResultStore, RunQuery};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

/// Shared entry point for orchestrators.
#[derive(Debug)]
pub struct LabSession {
    runner: Mutex<ExperimentRunner>,
    configs: Arc<ConfigurationStore>,
    results: Arc<ResultStore>,
    notices: broadcast::Sender<RecalibrationNotice>,
    requester: Option<RecalibrationRequester>,
    abort: AbortHandle,
}

impl LabSession {
    /// Wraps an already configured runner. [`LabSession::open`] builds one
    /// from settings.
    pub fn new(runner: ExperimentRunner) -> Self {
        let ctx = runner.context();
        let configs = Arc::clone(ctx.configs());
        let results = Arc::clone(ctx.results());
        let (notices, requester) = match runner.controller() {
            Some(controller) => (controller.notifier(), Some(controller.requester())),
            None => (broadcast::channel(1).0, None),
        };
        Self {
            abort: runner.abort_handle(),
            runner: Mutex::new(runner),
            configs,
            results,
            notices,
            requester,
        }
    }

    /// Builds stores, runner and recalibration loop from `settings`.
    ///
    /// `calibration` is required when a `[recalibration]` section is present.
    pub fn open(
        settings: &Settings,
        adapter: impl HardwareAdapter + 'static,
        calibration: Option<Arc<dyn ExperimentFactory>>,
    ) -> AppResult<Self> {
        let (configs, results) = match &settings.storage.root {
            Some(root) => {
                let configs = Arc::new(ConfigurationStore::open(root)?);
                let results = ResultStore::open(root, Arc::clone(&configs))?;
                (configs, results)
            }
            None => {
                let configs = Arc::new(ConfigurationStore::in_memory());
                let results = ResultStore::in_memory(Arc::clone(&configs));
                (configs, results)
            }
        };
        info!(
            root = ?settings.storage.root,
            versions = configs.list_versions().len(),
            runs = results.len(),
            "Lab session opened"
        );

        let mut runner = ExperimentRunner::new(RunContext::new(Arc::new(results), adapter))
            .with_fault_policy(settings.runner.fault_policy);
        match (&settings.recalibration, calibration) {
            (Some(recalibration), Some(factory)) => {
                let controller = RecalibrationController::new(recalibration.trigger.build(), factory)
                    .with_params(recalibration.params.clone());
                runner = runner.with_recalibration(controller);
            }
            (Some(_), None) => {
                return Err(DaqError::Validation(
                    "recalibration is configured but no calibration experiment was provided".into(),
                ));
            }
            (None, Some(factory)) => {
                warn!(
                    calibration = factory.name(),
                    "Calibration experiment provided without recalibration settings; recalibration disabled"
                );
            }
            (None, None) => {}
        }
        Ok(Self::new(runner))
    }

    /// Snapshot new runs bind to.
    pub fn current_configuration(&self) -> AppResult<Arc<ConfigSnapshot>> {
        self.configs.current()
    }

    /// Saves a manual configuration and makes it current.
    pub fn save_configuration(&self, params: ParameterSet) -> AppResult<SnapshotVersion> {
        self.configs.save(params)
    }

    /// Runs one experiment and returns its persisted record.
    ///
    /// Waits for any run already in progress; runs are serialized.
    pub async fn submit(
        &self,
        factory: &dyn ExperimentFactory,
        params: &ParameterSet,
    ) -> AppResult<Arc<RunRecord>> {
        self.runner.lock().await.run_once(factory, params).await
    }

    /// Runs a loop; see [`ExperimentRunner::run_loop`].
    pub async fn submit_loop(
        &self,
        factory: &dyn ExperimentFactory,
        params: &ParameterSet,
        until: LoopUntil,
    ) -> AppResult<LoopSummary> {
        self.runner.lock().await.run_loop(factory, params, until).await
    }

    /// Re-executes a stored run against its original snapshot.
    pub async fn replay(&self, run_id: Uuid) -> AppResult<Arc<RunRecord>> {
        self.runner.lock().await.replay(run_id).await
    }

    /// Recalibration notifications. Without a recalibration loop the receiver
    /// never yields.
    pub fn subscribe(&self) -> broadcast::Receiver<RecalibrationNotice> {
        self.notices.subscribe()
    }

    /// Requests a recalibration before the next run. Does not wait for a run
    /// in progress.
    pub fn request_recalibration(&self, note: &str) -> AppResult<()> {
        let requester = self.requester.as_ref().ok_or_else(|| {
            DaqError::Validation("no recalibration controller is configured".into())
        })?;
        requester.request(note);
        Ok(())
    }

    /// Clears a failed recalibration so runs can proceed on the current
    /// configuration.
    pub async fn acknowledge_recalibration_failure(&self) {
        if let Some(controller) = self.runner.lock().await.controller_mut() {
            controller.reset();
        }
    }

    /// Cancels the run in progress.
    pub fn abort(&self) {
        self.abort.abort();
    }

    /// Stored runs matching `query`, oldest first.
    pub fn history(&self, query: RunQuery) -> Vec<Arc<RunRecord>> {
        self.results.query(query).collect()
    }

    /// Every recalibration event, oldest first.
    pub fn recalibrations(&self) -> Vec<Arc<RecalibrationEvent>> {
        self.results.events()
    }

    /// Recalibration events that led to `version`.
    pub fn lineage(&self, version: SnapshotVersion) -> AppResult<Vec<Arc<RecalibrationEvent>>> {
        self.results.lineage(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::{nv, ExperimentDefinition};
    use crate::hardware::MockHardware;
    use crate::settings::{RecalibrationSettings, TriggerSettings};

    fn calibration() -> Arc<dyn ExperimentFactory> {
        Arc::new(nv::pulsed_odmr_calibration(&[70e6, 80e6, 90e6], "IF_freq_NV").unwrap())
    }

    #[test]
    fn test_open_requires_calibration_when_configured() {
        let settings = Settings {
            recalibration: Some(RecalibrationSettings {
                trigger: TriggerSettings::Manual,
                params: ParameterSet::new(),
            }),
            ..Settings::default()
        };
        let err = LabSession::open(&settings, MockHardware::new(), None).unwrap_err();
        assert!(matches!(err, DaqError::Validation(_)));
    }

    #[tokio::test]
    async fn test_request_and_subscribe() {
        let settings = Settings {
            recalibration: Some(RecalibrationSettings {
                trigger: TriggerSettings::Manual,
                params: ParameterSet::new(),
            }),
            ..Settings::default()
        };
        let hw = MockHardware::new().with_readout(crate::hardware::mock::ReadoutModel::Dip {
            center_hz: 90e6,
            width_hz: 2e6,
            baseline: 1.0,
            depth: 0.3,
        });
        let session = LabSession::open(&settings, hw, Some(calibration())).unwrap();
        session.save_configuration(nv::lab_defaults()).unwrap();
        let mut notices = session.subscribe();

        session.request_recalibration("operator").unwrap();
        let rabi = ExperimentDefinition::Measurement {
            name: "time_rabi".into(),
            spec: nv::time_rabi(&[16.0, 20.0]).build().unwrap(),
        };
        let record = session.submit(&rabi, &ParameterSet::new()).await.unwrap();

        assert_eq!(record.snapshot_version, 2);
        let current = session.current_configuration().unwrap();
        assert_eq!(current.parameters().get_f64("IF_freq_NV"), Some(90e6));
        assert_eq!(session.recalibrations().len(), 1);
        assert_eq!(session.lineage(2).unwrap().len(), 1);

        let mut applied = None;
        while let Ok(notice) = notices.try_recv() {
            if let RecalibrationNotice::Applied(event) = notice {
                applied = Some(event);
            }
        }
        assert_eq!(applied.unwrap().new_version, 2);
        assert_eq!(session.history(RunQuery::new()).len(), 2);
    }

    #[test]
    fn test_request_without_controller() {
        let session = LabSession::open(&Settings::default(), MockHardware::new(), None).unwrap();
        assert!(session.request_recalibration("x").is_err());
        assert!(session.current_configuration().is_err());
    }
}
