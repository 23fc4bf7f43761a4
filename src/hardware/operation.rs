//! Operation descriptors handed to a [`HardwareAdapter`](super::HardwareAdapter).
//!
//! An operation is a fully resolved instruction: every length, amplitude and
//! frequency is a concrete number for the current scan point. Translating it into
//! vendor pulse programs is the adapter's job.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which pass of a scan point an operation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pass {
    /// One-time preparation before the scan
    Setup,
    /// Commands as written, measuring |0⟩
    Signal0,
    /// Reference block after the |0⟩ pass
    Reference0,
    /// Commands with cycle pulses inverted, measuring |1⟩
    Signal1,
    /// Reference block after the |1⟩ pass
    Reference1,
}

impl Pass {
    /// Readout label measurements of this pass are stored under.
    pub fn label(self) -> &'static str {
        match self {
            Pass::Setup => "setup",
            Pass::Signal0 => "signal0",
            Pass::Reference0 => "reference0",
            Pass::Signal1 => "signal1",
            Pass::Reference1 => "reference1",
        }
    }
}

impl fmt::Display for Pass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// What the hardware should do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OperationKind {
    /// Play a named pulse on an element
    Pulse {
        element: String,
        pulse: String,
        amplitude: f64,
        length_ns: f64,
    },
    /// Continuous-wave drive
    Cw {
        element: String,
        amplitude: f64,
        length_ns: f64,
    },
    /// Idle
    Wait {
        length_ns: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        element: Option<String>,
    },
    /// Laser / AOM gate
    Laser {
        channel: String,
        mode: String,
        length_ns: f64,
    },
    /// Acquire counts; the adapter returns one value
    Measure {
        channel: String,
        mode: String,
        length_ns: f64,
        averages: u32,
    },
    /// Synchronize all elements
    Align,
    /// Retune an element's intermediate frequency
    SetFrequency { element: String, frequency_hz: f64 },
}

impl OperationKind {
    /// Named hardware resource the operation touches, if any.
    pub fn resource(&self) -> Option<&str> {
        match self {
            OperationKind::Pulse { element, .. }
            | OperationKind::Cw { element, .. }
            | OperationKind::SetFrequency { element, .. } => Some(element),
            OperationKind::Wait { element, .. } => element.as_deref(),
            OperationKind::Laser { channel, .. } | OperationKind::Measure { channel, .. } => {
                Some(channel)
            }
            OperationKind::Align => None,
        }
    }
}

/// One step of an executed sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Position in the sequence
    pub index: usize,
    /// Scan point this step belongs to
    pub point: usize,
    pub pass: Pass,
    pub kind: OperationKind,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match &self.kind {
            OperationKind::Pulse { .. } => "pulse",
            OperationKind::Cw { .. } => "cw",
            OperationKind::Wait { .. } => "wait",
            OperationKind::Laser { .. } => "laser",
            OperationKind::Measure { .. } => "measure",
            OperationKind::Align => "align",
            OperationKind::SetFrequency { .. } => "set_frequency",
        };
        write!(f, "#{} {} [point {}, {}]", self.index, name, self.point, self.pass)?;
        if let Some(resource) = self.kind.resource() {
            write!(f, " on {resource}")?;
        }
        Ok(())
    }
}
