//! Command model and operation sequences.
//!
//! An experiment is written as a list of [`Command`]s swept over one scan
//! vector. Numeric fields are [`Setting`]s: fixed, swept (a constant multiple of
//! the scan vector), or a reference to a snapshot parameter. Nothing is resolved
//! until the experiment is bound; [`Sequence::resolve`] then fills in every
//! snapshot-derived default, checks every named resource against the
//! snapshot's `elements` mapping and produces a lazy, restartable sequence of
//! [`Operation`]s.
//!
//! Each scan point expands to:
//!
//! ```text
//! signal0 commands ─ reference0 block ─ [signal1 commands ─ reference1 block]
//! ```
//!
//! The `signal1` pass (cycle pulses inverted) only runs when both states are
//! measured, and the reference blocks only when references are enabled.

use crate::error::{AppResult, DaqError};
use crate::hardware::{Operation, OperationKind, Pass};
use crate::snapshot::ConfigSnapshot;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Snapshot parameters used as defaults.
pub mod keys {
    /// pi-pulse length (ns)
    pub const PI_PULSE_LENGTH: &str = "x180_len_NV";
    /// Laser initialization pulse length (ns)
    pub const INITIALIZATION_LENGTH: &str = "initialization_len_1";
    /// Readout window (ns)
    pub const MEASUREMENT_LENGTH: &str = "meas_len_1";
    /// Long readout window (ns)
    pub const LONG_MEASUREMENT_LENGTH: &str = "long_meas_len_1";
    /// Idle time between repetitions (ns)
    pub const WAIT_BETWEEN_RUNS: &str = "wait_between_runs";
    /// Relaxation time after initialization (ns)
    pub const WAIT_FOR_INITIALIZATION: &str = "wait_for_initialization";
}

const LASER_ON: &str = "laser_ON";
const PI_PULSE: &str = "x180";

/// A numeric command field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Setting {
    /// Constant value
    Fixed(f64),
    /// `scale × scan value`
    Swept { scale: f64 },
    /// Numeric snapshot parameter, looked up at bind time
    Param(String),
}

impl Setting {
    /// Reference to a snapshot parameter.
    pub fn param(key: &str) -> Self {
        Setting::Param(key.to_string())
    }

    fn resolve(&self, snapshot: &ConfigSnapshot) -> AppResult<Resolved> {
        match self {
            Setting::Fixed(v) => Ok(Resolved::Fixed(*v)),
            Setting::Swept { scale } => Ok(Resolved::Swept(*scale)),
            Setting::Param(key) => snapshot.require_f64(key).map(Resolved::Fixed),
        }
    }

    fn resolve_fixed(&self, snapshot: &ConfigSnapshot, what: &str) -> AppResult<f64> {
        match self.resolve(snapshot)? {
            Resolved::Fixed(v) => Ok(v),
            Resolved::Swept(_) => Err(DaqError::Sequence(format!("{what} cannot be swept"))),
        }
    }
}

impl From<f64> for Setting {
    fn from(v: f64) -> Self {
        Setting::Fixed(v)
    }
}

/// One instruction of an experiment definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Named microwave pulse (`x180`, `-y90`, ...). Cycle pulses are inverted
    /// in the |1⟩ pass.
    Pulse {
        pulse: String,
        element: String,
        amplitude: Setting,
        length_ns: Setting,
        #[serde(default)]
        cycle: bool,
    },
    /// Continuous-wave drive
    Cw {
        element: String,
        amplitude: Setting,
        length_ns: Setting,
    },
    Wait {
        length_ns: Setting,
    },
    Laser {
        mode: String,
        channel: String,
        length_ns: Setting,
    },
    Measure {
        mode: String,
        channel: String,
        length_ns: Setting,
    },
    Align,
    /// Retune an element; normally swept
    UpdateFrequency {
        element: String,
        frequency_hz: Setting,
    },
}

/// Serializable experiment body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceSpec {
    pub commands: Vec<Command>,
    /// Scan vector; one scan point per entry
    pub sweep: Vec<f64>,
    /// Laser channel for the one-time initialization pulse
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initialize: Option<String>,
    /// Delay before the reference readout (ns), 0 for none
    #[serde(default)]
    pub measure_delay_ns: f64,
    /// Append reference blocks after every pass
    pub references: bool,
    /// Element receiving the reference pi pulse
    pub reference_element: String,
    /// Only measure |0⟩ when true; also measure |1⟩ when false
    pub measure_contrast: bool,
    /// Hardware averages per measurement
    pub averages: u32,
}

impl Default for SequenceSpec {
    fn default() -> Self {
        Self {
            commands: Vec::new(),
            sweep: Vec::new(),
            initialize: None,
            measure_delay_ns: 0.0,
            references: true,
            reference_element: "NV".to_string(),
            measure_contrast: true,
            averages: 1,
        }
    }
}

/// Scale `s` such that `values = s × base`, if one exists and is positive.
fn proportional_scale(base: &[f64], values: &[f64]) -> Option<f64> {
    if base.len() != values.len() {
        return None;
    }
    let (b, v) = base.iter().zip(values).find(|(b, _)| **b != 0.0)?;
    let scale = v / b;
    if !(scale.is_finite() && scale > 0.0) {
        return None;
    }
    let consistent = base.iter().zip(values).all(|(b, v)| {
        let expected = scale * b;
        (v - expected).abs() <= 1e-9 * v.abs().max(expected.abs()).max(f64::MIN_POSITIVE)
    });
    consistent.then_some(scale)
}

/// Builds a [`SequenceSpec`] command by command.
///
/// Errors (inconsistent sweeps, all-zero vectors) are collected and reported
/// by [`build`](Self::build).
#[derive(Debug, Clone, Default)]
pub struct SequenceBuilder {
    spec: SequenceSpec,
    error: Option<String>,
}

impl SequenceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn fail(&mut self, message: String) {
        self.error.get_or_insert(message);
    }

    fn push(mut self, command: Command) -> Self {
        self.spec.commands.push(command);
        self
    }

    /// Registers `values` as the scan vector, or as a multiple of the one
    /// already registered.
    fn sweep(&mut self, values: &[f64]) -> Setting {
        if values.is_empty() || values.iter().all(|v| *v == 0.0) {
            self.fail("sweep vector cannot be empty or all zeros".into());
            return Setting::Fixed(0.0);
        }
        if self.spec.sweep.is_empty() {
            self.spec.sweep = values.to_vec();
            return Setting::Swept { scale: 1.0 };
        }
        match proportional_scale(&self.spec.sweep, values) {
            Some(scale) => Setting::Swept { scale },
            None => {
                self.fail("inconsistent loop variables: sweep is not a positive multiple of the scan vector".into());
                Setting::Fixed(0.0)
            }
        }
    }

    /// Pulse with the snapshot's pi-pulse length.
    pub fn pulse(self, pulse: &str, element: &str, amplitude: f64) -> Self {
        self.pulse_with(pulse, element, amplitude, Setting::param(keys::PI_PULSE_LENGTH), false)
    }

    pub fn pulse_with(
        self,
        pulse: &str,
        element: &str,
        amplitude: f64,
        length_ns: impl Into<Setting>,
        cycle: bool,
    ) -> Self {
        self.push(Command::Pulse {
            pulse: pulse.to_string(),
            element: element.to_string(),
            amplitude: Setting::Fixed(amplitude),
            length_ns: length_ns.into(),
            cycle,
        })
    }

    /// Pulse whose amplitude scales with the scan.
    pub fn amplitude_sweep(
        mut self,
        pulse: &str,
        element: &str,
        amplitudes: &[f64],
        length_ns: impl Into<Setting>,
        cycle: bool,
    ) -> Self {
        let amplitude = self.sweep(amplitudes);
        self.push(Command::Pulse {
            pulse: pulse.to_string(),
            element: element.to_string(),
            amplitude,
            length_ns: length_ns.into(),
            cycle,
        })
    }

    /// Pulse whose length scales with the scan.
    pub fn length_sweep(
        mut self,
        pulse: &str,
        element: &str,
        amplitude: f64,
        lengths_ns: &[f64],
        cycle: bool,
    ) -> Self {
        let length_ns = self.sweep(lengths_ns);
        self.push(Command::Pulse {
            pulse: pulse.to_string(),
            element: element.to_string(),
            amplitude: Setting::Fixed(amplitude),
            length_ns,
            cycle,
        })
    }

    pub fn cw(self, element: &str, amplitude: f64, length_ns: impl Into<Setting>) -> Self {
        self.push(Command::Cw {
            element: element.to_string(),
            amplitude: Setting::Fixed(amplitude),
            length_ns: length_ns.into(),
        })
    }

    pub fn wait(self, length_ns: impl Into<Setting>) -> Self {
        self.push(Command::Wait {
            length_ns: length_ns.into(),
        })
    }

    pub fn wait_sweep(mut self, lengths_ns: &[f64]) -> Self {
        let length_ns = self.sweep(lengths_ns);
        self.push(Command::Wait { length_ns })
    }

    /// Laser pulse with the snapshot's initialization length.
    pub fn laser(self, mode: &str, channel: &str) -> Self {
        self.laser_for(mode, channel, Setting::param(keys::INITIALIZATION_LENGTH))
    }

    pub fn laser_for(self, mode: &str, channel: &str, length_ns: impl Into<Setting>) -> Self {
        self.push(Command::Laser {
            mode: mode.to_string(),
            channel: channel.to_string(),
            length_ns: length_ns.into(),
        })
    }

    /// Readout with the snapshot's measurement length.
    pub fn measure(self, mode: &str, channel: &str) -> Self {
        self.measure_for(mode, channel, Setting::param(keys::MEASUREMENT_LENGTH))
    }

    pub fn measure_for(self, mode: &str, channel: &str, length_ns: impl Into<Setting>) -> Self {
        self.push(Command::Measure {
            mode: mode.to_string(),
            channel: channel.to_string(),
            length_ns: length_ns.into(),
        })
    }

    pub fn align(self) -> Self {
        self.push(Command::Align)
    }

    pub fn frequency_sweep(mut self, element: &str, frequencies_hz: &[f64]) -> Self {
        let frequency_hz = self.sweep(frequencies_hz);
        self.push(Command::UpdateFrequency {
            element: element.to_string(),
            frequency_hz,
        })
    }

    /// Polarize with a laser pulse on `channel` before the scan starts.
    pub fn initialization(mut self, channel: &str) -> Self {
        self.spec.initialize = Some(channel.to_string());
        self
    }

    pub fn measure_delay(mut self, length_ns: f64) -> Self {
        self.spec.measure_delay_ns = length_ns;
        self
    }

    pub fn averages(mut self, averages: u32) -> Self {
        self.spec.averages = averages;
        self
    }

    pub fn references(mut self, enabled: bool) -> Self {
        self.spec.references = enabled;
        self
    }

    pub fn reference_element(mut self, element: &str) -> Self {
        self.spec.reference_element = element.to_string();
        self
    }

    /// `false` adds the cycle-inverted |1⟩ pass.
    pub fn measure_contrast(mut self, contrast_only: bool) -> Self {
        self.spec.measure_contrast = contrast_only;
        self
    }

    pub fn build(self) -> AppResult<SequenceSpec> {
        match self.error {
            Some(message) => Err(DaqError::Sequence(message)),
            None => Ok(self.spec),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Resolved {
    Fixed(f64),
    Swept(f64),
}

impl Resolved {
    fn at(self, point: f64) -> f64 {
        match self {
            Resolved::Fixed(v) => v,
            Resolved::Swept(scale) => scale * point,
        }
    }
}

#[derive(Debug, Clone)]
enum Step {
    Pulse {
        pulse: String,
        element: String,
        amplitude: Resolved,
        length_ns: Resolved,
    },
    Cw {
        element: String,
        amplitude: Resolved,
        length_ns: Resolved,
    },
    Wait {
        length_ns: Resolved,
        element: Option<String>,
    },
    Laser {
        mode: String,
        channel: String,
        length_ns: f64,
    },
    Measure {
        mode: String,
        channel: String,
        length_ns: f64,
    },
    Align,
    Frequency {
        element: String,
        frequency_hz: Resolved,
    },
}

impl Step {
    fn instantiate(&self, point: f64, averages: u32) -> OperationKind {
        match self {
            Step::Pulse {
                pulse,
                element,
                amplitude,
                length_ns,
            } => OperationKind::Pulse {
                element: element.clone(),
                pulse: pulse.clone(),
                amplitude: amplitude.at(point),
                length_ns: length_ns.at(point),
            },
            Step::Cw {
                element,
                amplitude,
                length_ns,
            } => OperationKind::Cw {
                element: element.clone(),
                amplitude: amplitude.at(point),
                length_ns: length_ns.at(point),
            },
            Step::Wait { length_ns, element } => OperationKind::Wait {
                length_ns: length_ns.at(point),
                element: element.clone(),
            },
            Step::Laser {
                mode,
                channel,
                length_ns,
            } => OperationKind::Laser {
                channel: channel.clone(),
                mode: mode.clone(),
                length_ns: *length_ns,
            },
            Step::Measure {
                mode,
                channel,
                length_ns,
            } => OperationKind::Measure {
                channel: channel.clone(),
                mode: mode.clone(),
                length_ns: *length_ns,
                averages,
            },
            Step::Align => OperationKind::Align,
            Step::Frequency {
                element,
                frequency_hz,
            } => OperationKind::SetFrequency {
                element: element.clone(),
                frequency_hz: frequency_hz.at(point),
            },
        }
    }
}

fn invert(pulse: &str) -> String {
    match pulse.strip_prefix('-') {
        Some(rest) => rest.to_string(),
        None => format!("-{pulse}"),
    }
}

#[derive(Debug)]
struct Plan {
    setup: Vec<Step>,
    points: Vec<f64>,
    passes: Vec<(Pass, Vec<Step>)>,
    averages: u32,
}

/// Lazy, finite, restartable sequence of resolved operations.
///
/// Every call to [`iter`](Self::iter) starts from the first operation; the
/// sequence holds no cursor of its own.
#[derive(Debug, Clone)]
pub struct Sequence {
    plan: Arc<Plan>,
}

struct Resolver<'a> {
    snapshot: &'a ConfigSnapshot,
    measure_length: Option<f64>,
    first_measure: Option<(String, String)>,
    last_laser: Option<String>,
}

impl Resolver<'_> {
    fn resource(&self, index: usize, name: &str) -> AppResult<()> {
        if self.snapshot.has_resource(name) {
            Ok(())
        } else {
            Err(DaqError::Sequence(format!(
                "command {index} references undefined resource '{name}' (not in snapshot v{} elements)",
                self.snapshot.version()
            )))
        }
    }

    fn command(&mut self, index: usize, command: &Command) -> AppResult<Step> {
        let snap = self.snapshot;
        Ok(match command {
            Command::Pulse {
                pulse,
                element,
                amplitude,
                length_ns,
                ..
            } => {
                self.resource(index, element)?;
                Step::Pulse {
                    pulse: pulse.clone(),
                    element: element.clone(),
                    amplitude: amplitude.resolve(snap)?,
                    length_ns: length_ns.resolve(snap)?,
                }
            }
            Command::Cw {
                element,
                amplitude,
                length_ns,
            } => {
                self.resource(index, element)?;
                Step::Cw {
                    element: element.clone(),
                    amplitude: amplitude.resolve(snap)?,
                    length_ns: length_ns.resolve(snap)?,
                }
            }
            Command::Wait { length_ns } => Step::Wait {
                length_ns: length_ns.resolve(snap)?,
                element: None,
            },
            Command::Laser {
                mode,
                channel,
                length_ns,
            } => {
                self.resource(index, channel)?;
                self.last_laser = Some(channel.clone());
                Step::Laser {
                    mode: mode.clone(),
                    channel: channel.clone(),
                    length_ns: length_ns.resolve_fixed(snap, "laser length")?,
                }
            }
            Command::Measure {
                mode,
                channel,
                length_ns,
            } => {
                self.resource(index, channel)?;
                let length = length_ns.resolve_fixed(snap, "measurement length")?;
                match self.measure_length {
                    None => {
                        self.measure_length = Some(length);
                        self.first_measure = Some((mode.clone(), channel.clone()));
                    }
                    Some(first) if first != length => {
                        return Err(DaqError::Sequence(format!(
                            "inconsistent measurement lengths: command {index} uses {length} ns, earlier readout uses {first} ns"
                        )));
                    }
                    Some(_) => {}
                }
                Step::Measure {
                    mode: mode.clone(),
                    channel: channel.clone(),
                    length_ns: length,
                }
            }
            Command::Align => Step::Align,
            Command::UpdateFrequency {
                element,
                frequency_hz,
            } => {
                self.resource(index, element)?;
                Step::Frequency {
                    element: element.clone(),
                    frequency_hz: frequency_hz.resolve(snap)?,
                }
            }
        })
    }

    /// wait, align, pi pulse (amplitude 0 or 1), align, laser, measure, wait
    fn reference_block(&self, spec: &SequenceSpec, pi_amplitude: f64) -> AppResult<Vec<Step>> {
        let snap = self.snapshot;
        let (Some((mode, channel)), Some(length)) = (&self.first_measure, self.measure_length) else {
            return Err(DaqError::Sequence("reference readout needs a measure command".into()));
        };
        let Some(laser) = self.last_laser.clone().or_else(|| spec.initialize.clone()) else {
            return Err(DaqError::Sequence("reference readout needs a laser channel".into()));
        };
        if !snap.has_resource(&spec.reference_element) {
            return Err(DaqError::Sequence(format!(
                "reference pulse references undefined resource '{}'",
                spec.reference_element
            )));
        }
        let between = Resolved::Fixed(snap.require_f64(keys::WAIT_BETWEEN_RUNS)?);

        let mut steps = vec![
            Step::Wait {
                length_ns: between,
                element: None,
            },
            Step::Align,
            Step::Pulse {
                pulse: PI_PULSE.to_string(),
                element: spec.reference_element.clone(),
                amplitude: Resolved::Fixed(pi_amplitude),
                length_ns: Resolved::Fixed(snap.require_f64(keys::PI_PULSE_LENGTH)?),
            },
            Step::Align,
        ];
        if spec.measure_delay_ns > 0.0 {
            steps.push(Step::Wait {
                length_ns: Resolved::Fixed(spec.measure_delay_ns),
                element: Some(channel.clone()),
            });
            steps.push(Step::Laser {
                mode: LASER_ON.to_string(),
                channel: laser.clone(),
                length_ns: length,
            });
        } else {
            steps.push(Step::Laser {
                mode: LASER_ON.to_string(),
                channel: laser.clone(),
                length_ns: snap.require_f64(keys::INITIALIZATION_LENGTH)?,
            });
        }
        steps.push(Step::Measure {
            mode: mode.clone(),
            channel: channel.clone(),
            length_ns: length,
        });
        steps.push(Step::Wait {
            length_ns: between,
            element: Some(laser),
        });
        Ok(steps)
    }
}

impl Sequence {
    /// Resolves `spec` against `snapshot`.
    ///
    /// Fails with `Sequence` if there are no commands or scan points, if a
    /// command names a resource missing from the snapshot, if a default
    /// parameter is absent, or if readouts disagree on their length.
    pub fn resolve(spec: &SequenceSpec, snapshot: &ConfigSnapshot) -> AppResult<Self> {
        if spec.commands.is_empty() {
            return Err(DaqError::Sequence("no commands have been added to the experiment".into()));
        }
        if spec.sweep.is_empty() {
            return Err(DaqError::Sequence("no scan vector has been defined".into()));
        }
        if spec.averages == 0 {
            return Err(DaqError::Sequence("averages must be at least 1".into()));
        }

        let mut resolver = Resolver {
            snapshot,
            measure_length: None,
            first_measure: None,
            last_laser: None,
        };

        let mut setup = Vec::new();
        if let Some(channel) = &spec.initialize {
            resolver.resource(0, channel)?;
            setup.push(Step::Laser {
                mode: LASER_ON.to_string(),
                channel: channel.clone(),
                length_ns: snapshot.require_f64(keys::INITIALIZATION_LENGTH)?,
            });
            setup.push(Step::Wait {
                length_ns: Resolved::Fixed(snapshot.require_f64(keys::WAIT_FOR_INITIALIZATION)?),
                element: Some(channel.clone()),
            });
        }

        let mut signal0 = Vec::with_capacity(spec.commands.len());
        let mut signal1 = Vec::with_capacity(spec.commands.len());
        for (index, command) in spec.commands.iter().enumerate() {
            signal0.push(resolver.command(index, command)?);
            if !spec.measure_contrast {
                let inverted = match command {
                    Command::Pulse {
                        pulse,
                        cycle: true,
                        ..
                    } => {
                        let mut step = resolver.command(index, command)?;
                        if let Step::Pulse { pulse: name, .. } = &mut step {
                            *name = invert(pulse);
                        }
                        step
                    }
                    _ => resolver.command(index, command)?,
                };
                signal1.push(inverted);
            }
        }

        let mut passes = vec![(Pass::Signal0, signal0)];
        if spec.references {
            passes.push((Pass::Reference0, resolver.reference_block(spec, 0.0)?));
        }
        if !spec.measure_contrast {
            passes.push((Pass::Signal1, signal1));
            if spec.references {
                passes.push((Pass::Reference1, resolver.reference_block(spec, 1.0)?));
            }
        }

        Ok(Self {
            plan: Arc::new(Plan {
                setup,
                points: spec.sweep.clone(),
                passes,
                averages: spec.averages,
            }),
        })
    }

    /// Scan values.
    pub fn points(&self) -> &[f64] {
        &self.plan.points
    }

    /// Total number of operations.
    pub fn len(&self) -> usize {
        let per_point: usize = self.plan.passes.iter().map(|(_, steps)| steps.len()).sum();
        self.plan.setup.len() + per_point * self.plan.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates the operations from the start.
    pub fn iter(&self) -> impl Iterator<Item = Operation> + '_ {
        let plan: &Plan = &self.plan;
        let setup = plan
            .setup
            .iter()
            .map(move |step| (0, Pass::Setup, step.instantiate(0.0, plan.averages)));
        let body = plan.points.iter().enumerate().flat_map(move |(point, &x)| {
            plan.passes.iter().flat_map(move |(pass, steps)| {
                let pass = *pass;
                steps
                    .iter()
                    .map(move |step| (point, pass, step.instantiate(x, plan.averages)))
            })
        });
        setup
            .chain(body)
            .enumerate()
            .map(|(index, (point, pass, kind))| Operation {
                index,
                point,
                pass,
                kind,
            })
    }
}
