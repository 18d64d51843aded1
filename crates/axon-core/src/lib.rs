//! Axon Core - Property bus for heterogeneous device control
//!
//! This crate provides the foundational pieces of the Axon system:
//! - Property model (switch/number/text/light/BLOB vectors with items and state)
//! - Device and Client roles as traits
//! - The `Bus` dispatcher routing change requests and fanning out notifications
//! - Device-bound timers for asynchronous operation completion
//! - Reference-counted locks over shared physical resources

pub mod bus;
pub mod device;
pub mod error;
pub mod lock;
pub mod property;
pub mod standard;
pub mod timer;

pub use bus::{Bus, Client, ClientId, Device, DeviceGate};
pub use device::{device_name, instance_count, DeviceProperties, Interface};
pub use error::BusError;
pub use lock::{LockError, ResourceBackend, ResourceLocks};
pub use property::{
    matches, BlobValue, Item, ItemValue, NumberValue, Permission, Property, PropertyError,
    PropertyKind, PropertyState, Selector, SwitchRule,
};
pub use timer::{TimerHandle, TimerId, Timers};
