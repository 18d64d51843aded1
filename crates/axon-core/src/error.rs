//! Bus error types

use thiserror::Error;

use crate::lock::LockError;
use crate::property::PropertyError;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Device already attached: {0}")]
    DuplicateDevice(String),
    #[error("Unknown device: {0}")]
    UnknownDevice(String),
    #[error("Unknown client: {0}")]
    UnknownClient(String),
    #[error("Property error: {0}")]
    Property(#[from] PropertyError),
    #[error("Resource lock error: {0}")]
    Lock(#[from] LockError),
    #[error("Hardware error on {device}: {reason}")]
    Hardware { device: String, reason: String },
}

impl BusError {
    pub fn hardware(device: &str, reason: impl std::fmt::Display) -> Self {
        Self::Hardware {
            device: device.to_string(),
            reason: reason.to_string(),
        }
    }
}
