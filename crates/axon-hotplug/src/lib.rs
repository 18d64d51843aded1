//! Axon Hotplug - Map physical hardware presence to device lifecycle
//!
//! This crate provides:
//! - Hardware bus and device factory traits implemented by drivers
//! - A bounded slot arena indexed by slot number
//! - The hotplug manager, which diffs scans against occupied slots and
//!   attaches/detaches logical devices on a deferred task

pub mod hardware;
pub mod scanner;
pub mod slots;

pub use hardware::{DeviceFactory, HardwareBus, PhysicalDevice};
pub use scanner::{HotplugConfig, HotplugEvent, HotplugManager, ScanSummary, SlotInfo};
pub use slots::SlotArena;
