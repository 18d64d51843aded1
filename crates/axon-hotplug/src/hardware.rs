//! Traits at the boundary between the hotplug manager and vendor drivers

use anyhow::Result;
use axon_core::Device;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A unit of hardware currently present on a physical bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalDevice {
    /// Stable identifier (serial number or bus path)
    pub id: String,
    /// Model name used to build device names
    pub model: String,
    /// Key of the shared resource in the lock manager
    pub resource: String,
    /// Has an ST4 guide port, so a guider device is created alongside the camera
    #[serde(default)]
    pub has_st4: bool,
}

/// Enumerates hardware currently connected
pub trait HardwareBus: Send + Sync {
    fn scan(&self) -> Result<Vec<PhysicalDevice>>;
}

/// Builds the logical devices fronting a piece of hardware
pub trait DeviceFactory: Send + Sync {
    /// Create the devices for `hardware` occupying `slot`
    fn create(&self, slot: usize, hardware: &PhysicalDevice) -> Vec<Arc<dyn Device>>;

    /// Called after every device of a departed unit has been detached
    fn release(&self, _hardware: &PhysicalDevice) {}
}
