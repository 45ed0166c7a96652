//! Device Registry
//!
//! Tracks devices and their area assignment. Target resolution uses this to
//! expand an area id into the entities of every device placed in that area.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A registered device entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEntry {
    /// Device identifier
    pub id: String,

    /// Human-readable name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Area the device is placed in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area_id: Option<String>,
}

impl DeviceEntry {
    /// Create a new device entry
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            area_id: None,
        }
    }

    /// Set the device name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Place the device in an area
    pub fn with_area(mut self, area_id: impl Into<String>) -> Self {
        self.area_id = Some(area_id.into());
        self
    }
}

/// Registry of all known devices
pub struct DeviceRegistry {
    entries: DashMap<String, Arc<DeviceEntry>>,
}

impl DeviceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Register (or replace) a device entry
    pub fn register(&self, entry: DeviceEntry) -> Arc<DeviceEntry> {
        debug!(device_id = %entry.id, "Registering device");
        let entry = Arc::new(entry);
        self.entries.insert(entry.id.clone(), entry.clone());
        entry
    }

    /// Get a device by id
    pub fn get(&self, device_id: &str) -> Option<Arc<DeviceEntry>> {
        self.entries.get(device_id).map(|e| e.clone())
    }

    /// All devices placed in an area
    pub fn get_by_area_id(&self, area_id: &str) -> Vec<Arc<DeviceEntry>> {
        self.entries
            .iter()
            .filter(|e| e.area_id.as_deref() == Some(area_id))
            .map(|e| e.value().clone())
            .collect()
    }

    /// Remove a device entry
    pub fn remove(&self, device_id: &str) -> Option<Arc<DeviceEntry>> {
        self.entries.remove(device_id).map(|(_, e)| e)
    }

    /// Number of registered devices
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_area_lookup() {
        let reg = DeviceRegistry::new();
        reg.register(DeviceEntry::new("fridge").with_name("Fridge").with_area("kitchen"));
        reg.register(DeviceEntry::new("oven").with_area("kitchen"));
        reg.register(DeviceEntry::new("tv").with_area("living_room"));

        assert_eq!(reg.get_by_area_id("kitchen").len(), 2);
        assert_eq!(reg.get_by_area_id("living_room").len(), 1);
        assert!(reg.get_by_area_id("garage").is_empty());
        assert_eq!(reg.get("fridge").unwrap().name.as_deref(), Some("Fridge"));
    }
}
