//! Concrete experiments built from a [`SequenceSpec`], and their serializable
//! definitions.

use super::sequence::{Sequence, SequenceSpec};
use super::{Calibration, Experiment, ExperimentFactory};
use crate::error::{AppResult, DaqError};
use crate::parameter::{ParamValue, ParameterSet};
use crate::record::RunPayload;
use crate::snapshot::ConfigSnapshot;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Measurement defined by a command list.
#[derive(Debug, Clone)]
pub struct SequenceExperiment {
    name: String,
    spec: SequenceSpec,
    snapshot: Option<Arc<ConfigSnapshot>>,
}

impl SequenceExperiment {
    pub fn new(name: &str, spec: SequenceSpec) -> Self {
        Self {
            name: name.to_string(),
            spec,
            snapshot: None,
        }
    }

    pub fn spec(&self) -> &SequenceSpec {
        &self.spec
    }
}

#[async_trait]
impl Experiment for SequenceExperiment {
    fn name(&self) -> &str {
        &self.name
    }

    fn bind(&mut self, snapshot: Arc<ConfigSnapshot>) -> AppResult<()> {
        if let Some(bound) = &self.snapshot {
            return Err(DaqError::AlreadyBound {
                experiment: self.name.clone(),
                version: bound.version(),
            });
        }
        self.snapshot = Some(snapshot);
        Ok(())
    }

    fn snapshot(&self) -> Option<&Arc<ConfigSnapshot>> {
        self.snapshot.as_ref()
    }

    fn sequence(&self) -> AppResult<Sequence> {
        let snapshot = self
            .snapshot
            .as_ref()
            .ok_or_else(|| DaqError::NotBound(self.name.clone()))?;
        Sequence::resolve(&self.spec, snapshot)
    }

    fn definition(&self) -> Option<ExperimentDefinition> {
        Some(ExperimentDefinition::Measurement {
            name: self.name.clone(),
            spec: self.spec.clone(),
        })
    }
}

/// Which end of a readout an [`CalibrationRule::Extremum`] looks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Extremum {
    Min,
    Max,
}

fn unit_scale() -> f64 {
    1.0
}

/// How a calibration payload becomes a parameter delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum CalibrationRule {
    /// `parameter = scale × mean(label)`
    ReadoutMean {
        label: String,
        parameter: String,
        #[serde(default = "unit_scale")]
        scale: f64,
    },
    /// `parameter = scan value at the min/max of label`, e.g. the resonance
    /// frequency of a pulsed ODMR scan
    Extremum {
        label: String,
        parameter: String,
        find: Extremum,
    },
}

fn empty_readout(label: &str) -> DaqError {
    DaqError::Sequence(format!("calibration readout '{label}' is empty"))
}

impl CalibrationRule {
    pub fn extract(&self, payload: &RunPayload) -> AppResult<ParameterSet> {
        match self {
            CalibrationRule::ReadoutMean {
                label,
                parameter,
                scale,
            } => {
                let mean = payload.mean(label).ok_or_else(|| empty_readout(label))?;
                Ok(ParameterSet::new().with(parameter, mean * scale))
            }
            CalibrationRule::Extremum {
                label,
                parameter,
                find,
            } => {
                let values = payload
                    .readout(label)
                    .filter(|values| !values.is_empty())
                    .ok_or_else(|| empty_readout(label))?;
                let points = payload.sweep.len();
                if points == 0 || values.len() % points != 0 {
                    return Err(DaqError::Sequence(format!(
                        "readout '{label}' has {} values for {points} scan points",
                        values.len()
                    )));
                }
                let per_point = values.len() / points;
                let mut best = 0;
                for (index, value) in values.iter().enumerate() {
                    let better = match find {
                        Extremum::Min => *value < values[best],
                        Extremum::Max => *value > values[best],
                    };
                    if better {
                        best = index;
                    }
                }
                Ok(ParameterSet::new().with(parameter, payload.sweep[best / per_point]))
            }
        }
    }
}

/// Measurement that also proposes a configuration change.
#[derive(Debug, Clone)]
pub struct CalibrationExperiment {
    inner: SequenceExperiment,
    rule: CalibrationRule,
}

impl CalibrationExperiment {
    pub fn new(name: &str, spec: SequenceSpec, rule: CalibrationRule) -> Self {
        Self {
            inner: SequenceExperiment::new(name, spec),
            rule,
        }
    }

    /// How the calibration delta is read from the payload.
    pub fn rule(&self) -> &CalibrationRule {
        &self.rule
    }
}

#[async_trait]
impl Experiment for CalibrationExperiment {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn bind(&mut self, snapshot: Arc<ConfigSnapshot>) -> AppResult<()> {
        self.inner.bind(snapshot)
    }

    fn snapshot(&self) -> Option<&Arc<ConfigSnapshot>> {
        self.inner.snapshot()
    }

    fn sequence(&self) -> AppResult<Sequence> {
        self.inner.sequence()
    }

    fn definition(&self) -> Option<ExperimentDefinition> {
        Some(ExperimentDefinition::Calibration {
            name: self.inner.name.clone(),
            spec: self.inner.spec.clone(),
            rule: self.rule.clone(),
        })
    }

    fn as_calibration(&self) -> Option<&dyn Calibration> {
        Some(self)
    }
}

impl Calibration for CalibrationExperiment {
    fn extract_calibration_delta(&self, payload: &RunPayload) -> AppResult<ParameterSet> {
        self.rule.extract(payload)
    }
}

/// Serializable experiment, stored with every run and usable as a factory.
///
/// ```
/// use nv_daq::experiment::{nv, ExperimentDefinition};
///
/// let spec = nv::time_rabi(&[16.0, 20.0, 24.0]).build().unwrap();
/// let def = ExperimentDefinition::Measurement { name: "time_rabi".into(), spec };
/// assert_eq!(def.name(), "time_rabi");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExperimentDefinition {
    Measurement {
        name: String,
        spec: SequenceSpec,
    },
    Calibration {
        name: String,
        spec: SequenceSpec,
        rule: CalibrationRule,
    },
}

impl ExperimentDefinition {
    pub fn name(&self) -> &str {
        match self {
            ExperimentDefinition::Measurement { name, .. }
            | ExperimentDefinition::Calibration { name, .. } => name,
        }
    }

    pub fn spec(&self) -> &SequenceSpec {
        match self {
            ExperimentDefinition::Measurement { spec, .. }
            | ExperimentDefinition::Calibration { spec, .. } => spec,
        }
    }

    fn spec_mut(&mut self) -> &mut SequenceSpec {
        match self {
            ExperimentDefinition::Measurement { spec, .. }
            | ExperimentDefinition::Calibration { spec, .. } => spec,
        }
    }

    /// Fresh, unbound experiment.
    pub fn instantiate(&self) -> Box<dyn Experiment> {
        match self {
            ExperimentDefinition::Measurement { name, spec } => {
                Box::new(SequenceExperiment::new(name, spec.clone()))
            }
            ExperimentDefinition::Calibration { name, spec, rule } => {
                Box::new(CalibrationExperiment::new(name, spec.clone(), rule.clone()))
            }
        }
    }

    /// Writes the definition as pretty JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> AppResult<()> {
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> AppResult<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

impl ExperimentFactory for ExperimentDefinition {
    fn name(&self) -> &str {
        ExperimentDefinition::name(self)
    }

    /// Accepts an optional positive integer `averages` override.
    fn create(&self, params: &ParameterSet) -> AppResult<Box<dyn Experiment>> {
        let Some(value) = params.get("averages") else {
            return Ok(self.instantiate());
        };
        let averages = match value {
            ParamValue::Int(n) => u32::try_from(*n).ok().filter(|n| *n > 0),
            _ => None,
        }
        .ok_or_else(|| {
            DaqError::Validation(format!("'averages' must be a positive integer, got {value:?}"))
        })?;
        let mut definition = self.clone();
        definition.spec_mut().averages = averages;
        Ok(definition.instantiate())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::nv;
    use crate::hardware::MockHardware;
    use crate::runner::AbortSignal;
    use crate::snapshot::SnapshotOrigin;

    fn snapshot(version: u64) -> Arc<ConfigSnapshot> {
        Arc::new(ConfigSnapshot::new(
            version,
            None,
            SnapshotOrigin::Manual,
            nv::lab_defaults(),
        ))
    }

    fn rabi() -> SequenceExperiment {
        SequenceExperiment::new("time_rabi", nv::time_rabi(&[16.0, 20.0]).build().unwrap())
    }

    #[test]
    fn test_bind_twice_fails() {
        let mut exp = rabi();
        exp.bind(snapshot(1)).unwrap();
        let err = exp.bind(snapshot(2)).unwrap_err();
        assert!(matches!(err, DaqError::AlreadyBound { version: 1, .. }));
        assert_eq!(exp.snapshot().unwrap().version(), 1);
    }

    #[test]
    fn test_sequence_requires_binding() {
        let exp = rabi();
        assert!(matches!(exp.sequence(), Err(DaqError::NotBound(_))));
    }

    #[tokio::test]
    async fn test_run_collects_readouts_by_pass() {
        let mut exp = rabi();
        exp.bind(snapshot(1)).unwrap();
        let mut hw = MockHardware::new().with_constant_readout(2.0);
        let payload = exp.run(&mut hw, &AbortSignal::never()).await.unwrap();
        assert_eq!(payload.sweep, vec![16.0, 20.0]);
        assert_eq!(payload.readout("signal0").unwrap(), &[2.0, 2.0]);
        assert_eq!(payload.readout("reference0").unwrap().len(), 2);
        assert_eq!(payload.steps_executed, exp.sequence().unwrap().len());
        assert_eq!(hw.applied_versions(), vec![1]);
    }

    #[test]
    fn test_readout_mean_rule() {
        let mut payload = RunPayload::default();
        payload.push_readout("signal0", 1.0);
        payload.push_readout("signal0", 1.1);
        let rule = CalibrationRule::ReadoutMean {
            label: "signal0".into(),
            parameter: "power".into(),
            scale: 2.0,
        };
        let delta = rule.extract(&payload).unwrap();
        assert!((delta.get_f64("power").unwrap() - 2.1).abs() < 1e-12);

        let empty = rule.extract(&RunPayload::default());
        assert!(matches!(empty, Err(DaqError::Sequence(_))));
    }

    #[test]
    fn test_extremum_rule_picks_scan_value() {
        let mut payload = RunPayload {
            sweep: vec![70e6, 80e6, 90e6],
            ..RunPayload::default()
        };
        for v in [1.0, 0.6, 0.9] {
            payload.push_readout("signal0", v);
        }
        let rule = CalibrationRule::Extremum {
            label: "signal0".into(),
            parameter: "IF_freq_NV".into(),
            find: Extremum::Min,
        };
        let delta = rule.extract(&payload).unwrap();
        assert_eq!(delta.get_f64("IF_freq_NV"), Some(80e6));
    }

    #[test]
    fn test_definition_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("odmr.json");
        let def = nv::pulsed_odmr_calibration(&[70e6, 80e6, 90e6], "IF_freq_NV").unwrap();
        def.save(&path).unwrap();
        let loaded = ExperimentDefinition::load(&path).unwrap();
        assert_eq!(loaded, def);
        assert!(loaded.instantiate().as_calibration().is_some());
    }

    #[test]
    fn test_factory_averages_override() {
        let def = rabi().definition().unwrap();
        let exp = def
            .create(&ParameterSet::new().with("averages", 500_i64))
            .unwrap();
        assert_eq!(exp.definition().unwrap().spec().averages, 500);

        let bad = def.create(&ParameterSet::new().with("averages", -1_i64));
        assert!(matches!(bad, Err(DaqError::Validation(_))));
    }
}
