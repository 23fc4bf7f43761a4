//! Hardware boundary.
//!
//! The engine never talks to the vendor backend directly. Everything goes
//! through [`HardwareAdapter`], a narrow capability interface with two calls:
//! push a configuration snapshot to the devices, and execute one resolved
//! [`Operation`]. Adapters are exclusive resources: the runner holds them behind
//! a mutex so at most one run touches a hardware session at a time.

pub mod mock;
pub mod operation;

use crate::snapshot::ConfigSnapshot;
use async_trait::async_trait;
use thiserror::Error;

pub use mock::MockHardware;
pub use operation::{Operation, OperationKind, Pass};

/// Device-level fault reported by an adapter.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Hardware error on {device}: {message}")]
pub struct HardwareError {
    /// Device or subsystem that failed
    pub device: String,
    pub message: String,
}

impl HardwareError {
    /// Error reported by `device`.
    pub fn new(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            message: message.into(),
        }
    }
}

/// Result of executing one operation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepOutput {
    /// The operation produced no data
    Done,
    /// A measurement value (counts, averaged over the requested averages)
    Value(f64),
}

/// Capability-scoped access to the vendor control backend.
#[async_trait]
pub trait HardwareAdapter: Send {
    /// Human-readable adapter name for logs.
    fn name(&self) -> &str;

    /// Pushes a configuration snapshot to the devices (signal generator
    /// settings, controller configuration, ...).
    async fn apply_configuration(&mut self, snapshot: &ConfigSnapshot) -> Result<(), HardwareError>;

    /// Executes one resolved operation.
    async fn execute_operation(&mut self, operation: &Operation) -> Result<StepOutput, HardwareError>;
}
