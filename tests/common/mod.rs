//! Shared fixtures for integration tests.

#![allow(dead_code)]

use nv_daq::experiment::{nv, CalibrationRule, ExperimentDefinition};
use nv_daq::hardware::MockHardware;
use nv_daq::runner::{ExperimentRunner, RunContext};
use nv_daq::store::{ConfigurationStore, ResultStore};
use nv_daq::ParameterSet;
use std::sync::Arc;

pub const POWER: &str = "mw_power";

/// Lab defaults plus a microwave power of 1.0.
pub fn base_params() -> ParameterSet {
    nv::lab_defaults().with(POWER, 1.0)
}

/// Short time Rabi measurement.
pub fn rabi(points: usize) -> ExperimentDefinition {
    let lengths: Vec<f64> = (1..=points).map(|i| 16.0 * i as f64).collect();
    ExperimentDefinition::Measurement {
        name: "time_rabi".to_string(),
        spec: nv::time_rabi(&lengths).build().unwrap(),
    }
}

/// Calibration that writes the mean signal readout to [`POWER`].
pub fn power_calibration() -> ExperimentDefinition {
    ExperimentDefinition::Calibration {
        name: "power_calibration".to_string(),
        spec: nv::power_rabi(&[1.0]).build().unwrap(),
        rule: CalibrationRule::ReadoutMean {
            label: "signal0".to_string(),
            parameter: POWER.to_string(),
            scale: 1.0,
        },
    }
}

pub struct Lab {
    pub configs: Arc<ConfigurationStore>,
    pub results: Arc<ResultStore>,
    pub hw: MockHardware,
    pub runner: ExperimentRunner,
}

/// In-memory lab with version 1 saved from [`base_params`].
pub fn lab(hw: MockHardware) -> Lab {
    let configs = Arc::new(ConfigurationStore::in_memory());
    configs.save(base_params()).unwrap();
    let results = Arc::new(ResultStore::in_memory(Arc::clone(&configs)));
    let runner = ExperimentRunner::new(RunContext::new(Arc::clone(&results), hw.clone()));
    Lab {
        configs,
        results,
        hw,
        runner,
    }
}
