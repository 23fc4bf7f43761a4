//! Standard NV-center measurements.
//!
//! The presets assume the usual confocal setup: a microwave element `NV`, a
//! laser AOM on `AOM1` and a photon counter on `SPCM1`. Each returns a
//! [`SequenceBuilder`] so callers can adjust averages or references before
//! building.

use super::definition::{CalibrationRule, ExperimentDefinition, Extremum};
use super::sequence::{keys, SequenceBuilder, Setting};
use crate::error::AppResult;
use crate::parameter::ParameterSet;
use crate::snapshot::ELEMENTS_KEY;

pub const NV: &str = "NV";
pub const AOM: &str = "AOM1";
pub const SPCM: &str = "SPCM1";

/// Minimal parameter set for the presets: the three resources plus every
/// default length they read.
pub fn lab_defaults() -> ParameterSet {
    let element = |kind: &str| ParameterSet::new().with("kind", kind);
    ParameterSet::new()
        .with(
            ELEMENTS_KEY,
            ParameterSet::new()
                .with(NV, element("microwave").with("IF_freq_NV", 80e6))
                .with(AOM, element("laser"))
                .with(SPCM, element("counter")),
        )
        .with(keys::PI_PULSE_LENGTH, 32_i64)
        .with("x180_amp_NV", 0.1)
        .with(keys::INITIALIZATION_LENGTH, 3000_i64)
        .with(keys::MEASUREMENT_LENGTH, 400_i64)
        .with(keys::LONG_MEASUREMENT_LENGTH, 5000_i64)
        .with(keys::WAIT_BETWEEN_RUNS, 500_i64)
        .with(keys::WAIT_FOR_INITIALIZATION, 1000_i64)
        .with("NV_LO_freq", 2.83e9)
}

/// Continuous-wave ODMR: drive and read out simultaneously while sweeping the
/// microwave frequency.
pub fn cw_odmr(frequencies_hz: &[f64]) -> SequenceBuilder {
    let readout = Setting::param(keys::LONG_MEASUREMENT_LENGTH);
    SequenceBuilder::new()
        .align()
        .frequency_sweep(NV, frequencies_hz)
        .laser_for("laser_ON", AOM, readout.clone())
        .cw(NV, 1.0, readout.clone())
        .wait(1000.0)
        .measure_for("long_readout", SPCM, readout)
        .measure_delay(1000.0)
}

/// Rabi oscillations versus pulse length (ns).
pub fn time_rabi(lengths_ns: &[f64]) -> SequenceBuilder {
    SequenceBuilder::new()
        .initialization(AOM)
        .length_sweep("x180", NV, 1.0, lengths_ns, false)
        .align()
        .laser("laser_ON", AOM)
        .measure("readout", SPCM)
}

/// Rabi oscillations versus pulse amplitude scaling.
pub fn power_rabi(amplitudes: &[f64]) -> SequenceBuilder {
    SequenceBuilder::new()
        .initialization(AOM)
        .amplitude_sweep("x180", NV, amplitudes, Setting::param(keys::PI_PULSE_LENGTH), false)
        .align()
        .laser("laser_ON", AOM)
        .measure("readout", SPCM)
}

/// Pi pulse at each frequency of the scan.
pub fn pulsed_odmr(frequencies_hz: &[f64], amplitude: f64) -> SequenceBuilder {
    SequenceBuilder::new()
        .frequency_sweep(NV, frequencies_hz)
        .initialization(AOM)
        .pulse("x180", NV, amplitude)
        .align()
        .laser("laser_ON", AOM)
        .measure("readout", SPCM)
}

/// Pulsed ODMR that writes the frequency of lowest fluorescence to
/// `parameter`.
pub fn pulsed_odmr_calibration(
    frequencies_hz: &[f64],
    parameter: &str,
) -> AppResult<ExperimentDefinition> {
    Ok(ExperimentDefinition::Calibration {
        name: "pulsed_odmr_calibration".to_string(),
        spec: pulsed_odmr(frequencies_hz, 1.0).build()?,
        rule: CalibrationRule::Extremum {
            label: "signal0".to_string(),
            parameter: parameter.to_string(),
            find: Extremum::Min,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::Sequence;
    use crate::hardware::OperationKind;
    use crate::snapshot::{ConfigSnapshot, SnapshotOrigin};

    fn snapshot() -> ConfigSnapshot {
        ConfigSnapshot::new(1, None, SnapshotOrigin::Manual, lab_defaults())
    }

    #[test]
    fn test_presets_resolve_against_lab_defaults() {
        let snap = snapshot();
        for builder in [
            cw_odmr(&[70e6, 80e6]),
            time_rabi(&[16.0, 20.0, 24.0]),
            power_rabi(&[0.1, 0.2]),
            pulsed_odmr(&[70e6, 80e6], 1.0),
        ] {
            let spec = builder.build().unwrap();
            assert!(Sequence::resolve(&spec, &snap).is_ok());
        }
    }

    #[test]
    fn test_cw_odmr_uses_long_readout() {
        let spec = cw_odmr(&[70e6]).references(false).build().unwrap();
        let seq = Sequence::resolve(&spec, &snapshot()).unwrap();
        let measure = seq
            .iter()
            .find_map(|op| match op.kind {
                OperationKind::Measure { length_ns, .. } => Some(length_ns),
                _ => None,
            })
            .unwrap();
        assert_eq!(measure, 5000.0);
    }
}
