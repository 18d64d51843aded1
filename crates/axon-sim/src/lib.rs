//! Axon Sim - Simulated hardware drivers
//!
//! This crate provides:
//! - A CCD camera with cooler and synthetic star-field frames
//! - A guide port sharing the camera's USB resource
//! - A filter wheel stepping through its slots
//! - A focuser speaking a bracketed serial protocol to a simulated controller
//! - A simulated USB bus feeding the hotplug manager

mod driver;

pub mod camera;
pub mod focuser;
pub mod guider;
pub mod port;
pub mod usb;
pub mod wheel;

pub use camera::{CameraConfig, SimCamera};
pub use focuser::{FocuserConfig, SimFocuser};
pub use guider::SimGuider;
pub use port::{ControllerModel, Firmware, FocuserPort, PortError, PortLocks, SerialPorts, SimulatedFocuserPort};
pub use usb::{CameraFactory, SimulatedUsb, UsbLocks};
pub use wheel::{SimWheel, WheelConfig};
