//! Entity and device registries
//!
//! These registries hold the metadata side of the world: which device an
//! entity belongs to, which area a device or entity is assigned to, and
//! which labels an entity carries. The rule engine's target resolver uses
//! them to expand declarative targets into concrete entity ids.

mod device_registry;
mod entity_registry;

pub use device_registry::{DeviceEntry, DeviceRegistry};
pub use entity_registry::{EntityEntry, EntityRegistry};
