//! Axon Agent - Composite device/client orchestrating remote cameras
//!
//! The imager agent is attached to the bus twice: as a device publishing its
//! own camera list and batch controls, and as a client observing every other
//! device. It keeps a keyed cache of remote properties, forwards values to
//! the selected camera and runs exposure batches on a background task.

pub mod batch;
pub mod cache;
pub mod error;
pub mod forward;
pub mod imager;

pub use cache::{CacheError, CachedProperty, PropertyCache};
pub use error::AgentError;
pub use forward::ForwardOptions;
pub use imager::{AgentClient, AgentConfig, ImagerAgent};
