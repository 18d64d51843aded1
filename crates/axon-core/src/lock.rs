//! Shared hardware resources with family-scoped exclusive access
//!
//! Several devices may be bound to one physical resource (a camera and its
//! guide port, for example). Devices bound to the same resource form a family:
//! family members share the open handle, anything else is refused while the
//! resource is held. The handle is opened by the first holder and closed when
//! the last holder releases it.

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LockError {
    #[error("Resource {resource} is held by {holder}")]
    Contended { resource: String, holder: String },
    #[error("Failed to open {resource}: {reason}")]
    Open { resource: String, reason: String },
    #[error("Device {device} does not hold {resource}")]
    NotHeld { resource: String, device: String },
}

/// Opens and closes the underlying hardware
pub trait ResourceBackend: Send + Sync {
    type Handle: Send + Sync + 'static;

    fn open(&self, resource: &str) -> Result<Self::Handle, LockError>;

    fn close(&self, resource: &str, handle: Arc<Self::Handle>);
}

impl<T: ResourceBackend + ?Sized> ResourceBackend for Arc<T> {
    type Handle = T::Handle;

    fn open(&self, resource: &str) -> Result<Self::Handle, LockError> {
        (**self).open(resource)
    }

    fn close(&self, resource: &str, handle: Arc<Self::Handle>) {
        (**self).close(resource, handle)
    }
}

struct Entry<H> {
    family: BTreeSet<String>,
    holders: BTreeSet<String>,
    handle: Option<Arc<H>>,
}

impl<H> Entry<H> {
    fn new() -> Self {
        Self {
            family: BTreeSet::new(),
            holders: BTreeSet::new(),
            handle: None,
        }
    }

    fn admits(&self, device: &str) -> bool {
        self.holders.is_empty()
            || (self.family.contains(device) && self.holders.iter().all(|h| self.family.contains(h)))
    }
}

/// Registry of resources keyed by identifier
pub struct ResourceLocks<B: ResourceBackend> {
    backend: B,
    entries: Mutex<HashMap<String, Entry<B::Handle>>>,
}

impl<B: ResourceBackend> ResourceLocks<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Add `device` to the family sharing `resource`
    pub fn bind(&self, resource: &str, device: &str) {
        let mut entries = self.entries.lock();
        entries
            .entry(resource.to_string())
            .or_insert_with(Entry::new)
            .family
            .insert(device.to_string());
    }

    /// Remove `device` from the family, dropping the entry once nothing references it
    pub fn unbind(&self, resource: &str, device: &str) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(resource) {
            entry.family.remove(device);
            if entry.family.is_empty() && entry.holders.is_empty() {
                entries.remove(resource);
            }
        }
    }

    /// Acquire shared access for `device`, opening the handle on first use
    ///
    /// Fails immediately with `Contended` if the resource is held outside the
    /// device's family. Acquiring twice from the same device is a no-op.
    pub fn try_acquire(&self, resource: &str, device: &str) -> Result<Arc<B::Handle>, LockError> {
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(resource.to_string())
            .or_insert_with(Entry::new);

        if !entry.admits(device) {
            let holder = entry.holders.iter().next().cloned().unwrap_or_default();
            debug!(resource, device, holder = %holder, "Resource contended");
            return Err(LockError::Contended {
                resource: resource.to_string(),
                holder,
            });
        }

        let handle = match &entry.handle {
            Some(handle) => handle.clone(),
            None => {
                let handle = Arc::new(self.backend.open(resource)?);
                info!(resource, device, "Resource opened");
                entry.handle = Some(handle.clone());
                handle
            }
        };
        entry.holders.insert(device.to_string());
        Ok(handle)
    }

    /// Release `device`'s hold; returns true if this closed the handle
    pub fn release(&self, resource: &str, device: &str) -> Result<bool, LockError> {
        let closing = {
            let mut entries = self.entries.lock();
            let not_held = || LockError::NotHeld {
                resource: resource.to_string(),
                device: device.to_string(),
            };
            let entry = entries.get_mut(resource).ok_or_else(not_held)?;
            if !entry.holders.remove(device) {
                return Err(not_held());
            }
            if entry.holders.is_empty() {
                let handle = entry.handle.take();
                if entry.family.is_empty() {
                    entries.remove(resource);
                }
                handle
            } else {
                None
            }
        };

        match closing {
            Some(handle) => {
                self.backend.close(resource, handle);
                info!(resource, device, "Resource closed");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Drop every hold and the family, closing the handle if open
    pub fn evict(&self, resource: &str) -> bool {
        let entry = self.entries.lock().remove(resource);
        match entry.and_then(|e| e.handle) {
            Some(handle) => {
                self.backend.close(resource, handle);
                info!(resource, "Resource evicted");
                true
            }
            None => false,
        }
    }

    pub fn is_open(&self, resource: &str) -> bool {
        self.entries
            .lock()
            .get(resource)
            .map(|e| e.handle.is_some())
            .unwrap_or(false)
    }

    pub fn holders(&self, resource: &str) -> Vec<String> {
        self.entries
            .lock()
            .get(resource)
            .map(|e| e.holders.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingBackend {
        opens: AtomicUsize,
        closes: AtomicUsize,
        fail: bool,
    }

    impl ResourceBackend for CountingBackend {
        type Handle = String;

        fn open(&self, resource: &str) -> Result<String, LockError> {
            if self.fail {
                return Err(LockError::Open {
                    resource: resource.to_string(),
                    reason: "no such device".to_string(),
                });
            }
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(format!("handle:{}", resource))
        }

        fn close(&self, _resource: &str, _handle: Arc<String>) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn family(locks: &ResourceLocks<CountingBackend>) {
        locks.bind("usb:1", "Cam #1");
        locks.bind("usb:1", "Cam #1 (guider)");
    }

    #[test]
    fn test_family_shares_single_open() {
        let orders = [
            (["Cam #1", "Cam #1 (guider)"], ["Cam #1", "Cam #1 (guider)"]),
            (["Cam #1", "Cam #1 (guider)"], ["Cam #1 (guider)", "Cam #1"]),
            (["Cam #1 (guider)", "Cam #1"], ["Cam #1", "Cam #1 (guider)"]),
            (["Cam #1 (guider)", "Cam #1"], ["Cam #1 (guider)", "Cam #1"]),
        ];

        for (acquire, release) in orders {
            let locks = ResourceLocks::new(CountingBackend::default());
            family(&locks);

            let a = locks.try_acquire("usb:1", acquire[0]).unwrap();
            let b = locks.try_acquire("usb:1", acquire[1]).unwrap();
            assert!(Arc::ptr_eq(&a, &b));

            assert!(!locks.release("usb:1", release[0]).unwrap());
            assert!(locks.is_open("usb:1"));
            assert!(locks.release("usb:1", release[1]).unwrap());

            assert_eq!(locks.backend().opens.load(Ordering::SeqCst), 1);
            assert_eq!(locks.backend().closes.load(Ordering::SeqCst), 1);
            assert!(!locks.is_open("usb:1"));
        }
    }

    #[test]
    fn test_foreign_device_is_contended() {
        let locks = ResourceLocks::new(CountingBackend::default());
        family(&locks);
        locks.try_acquire("usb:1", "Cam #1").unwrap();

        let err = locks.try_acquire("usb:1", "Other").unwrap_err();
        assert_eq!(
            err,
            LockError::Contended {
                resource: "usb:1".to_string(),
                holder: "Cam #1".to_string()
            }
        );

        locks.release("usb:1", "Cam #1").unwrap();
        assert!(locks.try_acquire("usb:1", "Other").is_ok());
        // family member blocked while a foreign device holds it
        assert!(locks.try_acquire("usb:1", "Cam #1 (guider)").is_err());
    }

    #[test]
    fn test_release_not_held() {
        let locks = ResourceLocks::new(CountingBackend::default());
        assert!(matches!(
            locks.release("usb:1", "Cam #1"),
            Err(LockError::NotHeld { .. })
        ));
    }

    #[test]
    fn test_open_failure_leaves_resource_free() {
        let locks = ResourceLocks::new(CountingBackend {
            fail: true,
            ..Default::default()
        });
        assert!(matches!(
            locks.try_acquire("usb:1", "Cam #1"),
            Err(LockError::Open { .. })
        ));
        assert!(locks.holders("usb:1").is_empty());
    }

    #[test]
    fn test_evict_closes_handle() {
        let locks = ResourceLocks::new(CountingBackend::default());
        family(&locks);
        locks.try_acquire("usb:1", "Cam #1").unwrap();
        locks.try_acquire("usb:1", "Cam #1 (guider)").unwrap();

        assert!(locks.evict("usb:1"));
        assert_eq!(locks.backend().closes.load(Ordering::SeqCst), 1);
        assert!(!locks.evict("usb:1"));
        assert!(matches!(
            locks.release("usb:1", "Cam #1"),
            Err(LockError::NotHeld { .. })
        ));
    }
}
