//! Target resolution against the entity and device registries

use std::collections::HashSet;
use std::sync::Arc;

use cm_registries::{DeviceRegistry, EntityRegistry};
use tracing::trace;

use crate::rule::Target;

/// Expands rule targets into concrete entity ids
///
/// Resolution is a registry snapshot: entities added to an area or label
/// after a sensor is built are not picked up until the manager reloads.
pub struct TargetResolver {
    entities: Arc<EntityRegistry>,
    devices: Arc<DeviceRegistry>,
}

impl TargetResolver {
    pub fn new(entities: Arc<EntityRegistry>, devices: Arc<DeviceRegistry>) -> Self {
        Self { entities, devices }
    }

    /// Resolve a target to the union of all referenced entity ids
    ///
    /// Entity ids are taken verbatim, whether registered or not, so rules
    /// can watch entities that have not appeared yet. Unknown device,
    /// area and label ids expand to nothing.
    pub fn resolve(&self, target: &Target) -> HashSet<String> {
        let mut resolved: HashSet<String> = target.entity_id.iter().cloned().collect();

        for device_id in &target.device_id {
            for entry in self.entities.get_by_device_id(device_id) {
                resolved.insert(entry.entity_id.clone());
            }
        }

        for area_id in &target.area_id {
            // Directly assigned entities plus every entity of a device in
            // the area.
            for entry in self.entities.get_by_area_id(area_id) {
                resolved.insert(entry.entity_id.clone());
            }
            for device in self.devices.get_by_area_id(area_id) {
                for entry in self.entities.get_by_device_id(&device.id) {
                    resolved.insert(entry.entity_id.clone());
                }
            }
        }

        for label_id in &target.label_id {
            for entry in self.entities.get_by_label(label_id) {
                resolved.insert(entry.entity_id.clone());
            }
        }

        trace!(?target, count = resolved.len(), "Resolved target");
        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cm_registries::{DeviceEntry, EntityEntry};

    fn make_resolver() -> TargetResolver {
        let entities = Arc::new(EntityRegistry::new());
        let devices = Arc::new(DeviceRegistry::new());

        devices.register(DeviceEntry::new("fridge").with_area("kitchen"));
        entities.register(EntityEntry::new("sensor.fridge_door").with_device("fridge"));
        entities.register(EntityEntry::new("sensor.fridge_temp").with_device("fridge"));
        entities.register(EntityEntry::new("light.kitchen").with_area("kitchen"));
        entities.register(EntityEntry::new("lock.front_door").with_label("security"));

        TargetResolver::new(entities, devices)
    }

    #[test]
    fn test_verbatim_entity_ids() {
        let resolver = make_resolver();
        let target = Target {
            entity_id: vec!["sensor.not_registered".to_string()],
            ..Target::default()
        };
        let resolved = resolver.resolve(&target);
        assert!(resolved.contains("sensor.not_registered"));
        assert_eq!(resolved.len(), 1);
    }

    #[test]
    fn test_device_expansion() {
        let resolver = make_resolver();
        let target = Target {
            device_id: vec!["fridge".to_string()],
            ..Target::default()
        };
        let resolved = resolver.resolve(&target);
        assert_eq!(resolved.len(), 2);
        assert!(resolved.contains("sensor.fridge_door"));
    }

    #[test]
    fn test_area_includes_device_entities() {
        let resolver = make_resolver();
        let target = Target {
            area_id: vec!["kitchen".to_string()],
            ..Target::default()
        };
        let resolved = resolver.resolve(&target);
        // light.kitchen directly, fridge entities through the device
        assert_eq!(resolved.len(), 3);
        assert!(resolved.contains("light.kitchen"));
        assert!(resolved.contains("sensor.fridge_temp"));
    }

    #[test]
    fn test_label_and_union() {
        let resolver = make_resolver();
        let target = Target {
            entity_id: vec!["sensor.fridge_door".to_string()],
            label_id: vec!["security".to_string()],
            ..Target::default()
        };
        let resolved = resolver.resolve(&target);
        assert_eq!(resolved.len(), 2);
        assert!(resolved.contains("lock.front_door"));
    }

    #[test]
    fn test_unknown_selectors_empty() {
        let resolver = make_resolver();
        let target = Target {
            device_id: vec!["toaster".to_string()],
            area_id: vec!["attic".to_string()],
            label_id: vec!["garden".to_string()],
            ..Target::default()
        };
        assert!(resolver.resolve(&target).is_empty());
    }
}
