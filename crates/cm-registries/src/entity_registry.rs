//! Entity Registry
//!
//! Tracks registered entities with device linking, area assignment, and
//! label indexes for fast target expansion.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A registered entity entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityEntry {
    /// Full entity ID (domain.object_id)
    pub entity_id: String,

    /// Parent device ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,

    /// Area the entity is directly assigned to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area_id: Option<String>,

    /// Label IDs attached to the entity
    #[serde(default, skip_serializing_if = "HashSet::is_empty")]
    pub labels: HashSet<String>,
}

impl EntityEntry {
    /// Create a new entity entry with no device, area or labels
    pub fn new(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            device_id: None,
            area_id: None,
            labels: HashSet::new(),
        }
    }

    /// Link the entity to a device
    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    /// Assign the entity directly to an area
    pub fn with_area(mut self, area_id: impl Into<String>) -> Self {
        self.area_id = Some(area_id.into());
        self
    }

    /// Attach a label to the entity
    pub fn with_label(mut self, label_id: impl Into<String>) -> Self {
        self.labels.insert(label_id.into());
        self
    }
}

/// Registry of all known entities
pub struct EntityRegistry {
    entries: DashMap<String, Arc<EntityEntry>>,
}

impl EntityRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Register (or replace) an entity entry
    pub fn register(&self, entry: EntityEntry) -> Arc<EntityEntry> {
        debug!(entity_id = %entry.entity_id, "Registering entity");
        let entry = Arc::new(entry);
        self.entries
            .insert(entry.entity_id.clone(), entry.clone());
        entry
    }

    /// Get an entry by entity id
    pub fn get(&self, entity_id: &str) -> Option<Arc<EntityEntry>> {
        self.entries.get(entity_id).map(|e| e.clone())
    }

    /// All entities belonging to a device
    pub fn get_by_device_id(&self, device_id: &str) -> Vec<Arc<EntityEntry>> {
        self.entries
            .iter()
            .filter(|e| e.device_id.as_deref() == Some(device_id))
            .map(|e| e.value().clone())
            .collect()
    }

    /// All entities directly assigned to an area
    ///
    /// Entities that are only in the area through their device are not
    /// included; the target resolver combines both lookups.
    pub fn get_by_area_id(&self, area_id: &str) -> Vec<Arc<EntityEntry>> {
        self.entries
            .iter()
            .filter(|e| e.area_id.as_deref() == Some(area_id))
            .map(|e| e.value().clone())
            .collect()
    }

    /// All entities carrying a label
    pub fn get_by_label(&self, label_id: &str) -> Vec<Arc<EntityEntry>> {
        self.entries
            .iter()
            .filter(|e| e.labels.contains(label_id))
            .map(|e| e.value().clone())
            .collect()
    }

    /// Remove an entity entry
    pub fn remove(&self, entity_id: &str) -> Option<Arc<EntityEntry>> {
        self.entries.remove(entity_id).map(|(_, e)| e)
    }

    /// Number of registered entities
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for EntityRegistry {
    fn default() -> Self {
        Self::new()
    }
}
