//! Core types for the compliance manager
//!
//! This crate provides the fundamental types shared by every other crate:
//! EntityId, State, Event, and Context. It also defines the sentinel state
//! values that the rule engine treats specially.

mod context;
mod entity_id;
mod event;
mod state;

pub use context::Context;
pub use entity_id::{EntityId, EntityIdError};
pub use event::{Event, EventData, EventType};
pub use state::State;

/// Sentinel state for an entity whose integration is not reporting
pub const STATE_UNAVAILABLE: &str = "unavailable";

/// Sentinel state for an entity whose value has never been determined
pub const STATE_UNKNOWN: &str = "unknown";

/// Standard event types fired on the event bus
pub mod events {
    use super::*;

    /// Event type for state changes
    pub const STATE_CHANGED: &str = "state_changed";

    /// Data for STATE_CHANGED events
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    pub struct StateChangedData {
        pub entity_id: EntityId,
        pub old_state: Option<State>,
        pub new_state: Option<State>,
    }

    impl EventData for StateChangedData {
        fn event_type() -> &'static str {
            STATE_CHANGED
        }
    }
}
