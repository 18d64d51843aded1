//! Bounded cache of remote property snapshots keyed by `(device, name)`

use axon_core::Property;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CacheError {
    #[error("Property cache full ({capacity} entries), dropping {device}.{name}")]
    Full {
        capacity: usize,
        device: String,
        name: String,
    },
}

/// Cache entry: the latest snapshot and when it was received
#[derive(Debug, Clone)]
pub struct CachedProperty {
    pub property: Property,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct PropertyCache {
    capacity: usize,
    entries: HashMap<(String, String), CachedProperty>,
}

impl PropertyCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
        }
    }

    /// Insert or refresh a snapshot
    ///
    /// Refreshing an existing key always succeeds; a new key is refused once
    /// the cache is at capacity.
    pub fn store(&mut self, property: &Property) -> Result<(), CacheError> {
        let key = (property.device.clone(), property.name.clone());
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            return Err(CacheError::Full {
                capacity: self.capacity,
                device: key.0,
                name: key.1,
            });
        }
        self.entries.insert(
            key,
            CachedProperty {
                property: property.clone(),
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    pub fn get(&self, device: &str, name: &str) -> Option<&Property> {
        self.get_entry(device, name).map(|e| &e.property)
    }

    pub fn get_entry(&self, device: &str, name: &str) -> Option<&CachedProperty> {
        self.entries.get(&(device.to_string(), name.to_string()))
    }

    pub fn remove(&mut self, device: &str, name: &str) -> Option<Property> {
        self.entries
            .remove(&(device.to_string(), name.to_string()))
            .map(|e| e.property)
    }

    /// Drop every entry of `device`; returns how many were removed
    pub fn remove_device(&mut self, device: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(d, _), _| d != device);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axon_core::PropertyState;

    fn prop(device: &str, name: &str) -> Property {
        Property::text(device, name, 1)
    }

    #[test]
    fn test_store_refreshes_existing_entry() {
        let mut cache = PropertyCache::new(4);
        cache.store(&prop("Cam #1", "CONNECTION")).unwrap();
        let first = cache.get_entry("Cam #1", "CONNECTION").unwrap().updated_at;

        cache
            .store(&prop("Cam #1", "CONNECTION").with_state(PropertyState::Busy))
            .unwrap();
        let entry = cache.get_entry("Cam #1", "CONNECTION").unwrap();
        assert_eq!(entry.property.state, PropertyState::Busy);
        assert!(entry.updated_at >= first);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_capacity_refuses_new_keys_only() {
        let mut cache = PropertyCache::new(2);
        cache.store(&prop("A", "X")).unwrap();
        cache.store(&prop("A", "Y")).unwrap();

        let err = cache.store(&prop("B", "X")).unwrap_err();
        assert!(matches!(err, CacheError::Full { capacity: 2, .. }));
        assert!(cache.store(&prop("A", "X")).is_ok());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_remove_named_and_device() {
        let mut cache = PropertyCache::new(8);
        cache.store(&prop("A", "X")).unwrap();
        cache.store(&prop("A", "Y")).unwrap();
        cache.store(&prop("B", "X")).unwrap();

        assert!(cache.remove("A", "X").is_some());
        assert!(cache.remove("A", "X").is_none());
        assert_eq!(cache.remove_device("A"), 1);
        assert!(cache.get("B", "X").is_some());
        assert_eq!(cache.len(), 1);
    }
}
