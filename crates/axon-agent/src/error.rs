//! Agent error types

use axon_core::{BusError, PropertyError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("No camera selected")]
    NoCameraSelected,
    #[error("Agent is not attached to a bus")]
    NotAttached,
    #[error("Property {name} not found on {device}")]
    UnknownProperty { device: String, name: String },
    #[error("Cannot set {property} to '{value}'")]
    InvalidValue { property: String, value: String },
    #[error("Cannot forward {kind} properties")]
    Unsupported { kind: &'static str },
    #[error("Timed out waiting for {device}.{property}")]
    Timeout { device: String, property: String },
    #[error("{device}.{property} ended in {state}")]
    Failed {
        device: String,
        property: String,
        state: axon_core::PropertyState,
    },
    #[error("Cancelled")]
    Cancelled,
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
    #[error("Property error: {0}")]
    Property(#[from] PropertyError),
}
