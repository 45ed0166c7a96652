//! Template engine bound to the state store

use crate::error::TemplateResult;
use cm_state_store::StateStore;
use minijinja::{Environment, Value};
use std::sync::Arc;
use tracing::debug;

/// Template engine with state-store access
///
/// Templates rendered by this engine can use:
/// - variables passed per render (e.g. `t_state`, `t_entity`, `t_id`)
/// - `states('entity_id')` - another entity's state value
/// - `is_state('entity_id', 'value')` - state equality check
/// - `state_attr('entity_id', 'attr')` - attribute lookup
/// - `has_value('entity_id')` - entity exists and is not unknown/unavailable
pub struct TemplateEngine {
    env: Environment<'static>,
}

impl TemplateEngine {
    /// Create a new template engine with access to the state store
    pub fn new(store: Arc<StateStore>) -> Self {
        let mut env = Environment::new();
        env.set_debug(true);

        let states_store = store.clone();
        env.add_function("states", move |entity_id: &str| -> Value {
            match states_store.get_state(entity_id) {
                Some(state) => Value::from(state),
                None => Value::UNDEFINED,
            }
        });

        let is_state_store = store.clone();
        env.add_function("is_state", move |entity_id: &str, state: &str| -> bool {
            is_state_store.is_state(entity_id, state)
        });

        let attr_store = store.clone();
        env.add_function("state_attr", move |entity_id: &str, attribute: &str| -> Value {
            attr_store
                .get(entity_id)
                .and_then(|s| s.attributes.get(attribute).cloned())
                .map(|v| Value::from_serialize(&v))
                .unwrap_or(Value::UNDEFINED)
        });

        let has_value_store = store;
        env.add_function("has_value", move |entity_id: &str| -> bool {
            has_value_store
                .get(entity_id)
                .map(|s| !s.is_unavailable() && !s.is_unknown())
                .unwrap_or(false)
        });

        Self { env }
    }

    /// Render a template with context variables
    pub fn render_with_context(
        &self,
        template: &str,
        context: impl serde::Serialize,
    ) -> TemplateResult<String> {
        debug!(template, "Rendering template");
        let tmpl = self.env.template_from_str(template)?;
        let result = tmpl.render(context)?;
        Ok(result)
    }

    /// Check that a template compiles, without rendering it
    ///
    /// Rule flattening runs this once per declared template so that bad
    /// syntax is caught at load time instead of on every evaluation.
    pub fn syntax_check(&self, template: &str) -> TemplateResult<()> {
        self.env.template_from_str(template)?;
        Ok(())
    }
}

/// Check if a rendered value is truthy (like Python's bool())
pub fn is_truthy(value: &str) -> bool {
    let trimmed = value.trim().to_lowercase();

    if trimmed.is_empty() {
        return false;
    }

    !matches!(trimmed.as_str(), "false" | "no" | "off" | "0" | "none")
}

#[cfg(test)]
mod tests {
    use super::*;
    use cm_core::{Context, EntityId};
    use cm_event_bus::EventBus;
    use serde_json::json;
    use std::collections::HashMap;

    fn make_test_engine() -> TemplateEngine {
        let event_bus = Arc::new(EventBus::new());
        let store = Arc::new(StateStore::new(event_bus));

        store.set(
            "sensor.temperature".parse::<EntityId>().unwrap(),
            "23.5",
            HashMap::from([("unit".to_string(), json!("C"))]),
            Context::new(),
        );
        store.set(
            "light.kitchen".parse::<EntityId>().unwrap(),
            "on",
            HashMap::new(),
            Context::new(),
        );
        store.set(
            "sensor.broken".parse::<EntityId>().unwrap(),
            "unavailable",
            HashMap::new(),
            Context::new(),
        );

        TemplateEngine::new(store)
    }

    #[test]
    fn test_variable_substitution() {
        let engine = make_test_engine();
        let result = engine
            .render_with_context("{{ t_state }}", json!({"t_state": "open"}))
            .unwrap();
        assert_eq!(result, "open");
    }

    #[test]
    fn test_states_function() {
        let engine = make_test_engine();
        let result = engine
            .render_with_context("{{ states('sensor.temperature') }}", json!({}))
            .unwrap();
        assert_eq!(result, "23.5");
    }

    #[test]
    fn test_is_state_function() {
        let engine = make_test_engine();
        let result = engine
            .render_with_context("{{ is_state('light.kitchen', 'on') }}", json!({}))
            .unwrap();
        assert_eq!(result, "true");
    }

    #[test]
    fn test_state_attr_function() {
        let engine = make_test_engine();
        let result = engine
            .render_with_context("{{ state_attr('sensor.temperature', 'unit') }}", json!({}))
            .unwrap();
        assert_eq!(result, "C");
    }

    #[test]
    fn test_has_value_function() {
        let engine = make_test_engine();
        let result = engine
            .render_with_context(
                "{{ has_value('sensor.temperature') and not has_value('sensor.broken') }}",
                json!({}),
            )
            .unwrap();
        assert_eq!(result, "true");
    }

    #[test]
    fn test_syntax_check() {
        let engine = make_test_engine();
        assert!(engine.syntax_check("{{ t_state | float > 3 }}").is_ok());
        assert!(engine.syntax_check("{{ unbalanced").is_err());
    }

    #[test]
    fn test_render_error_surfaces() {
        let engine = make_test_engine();
        // Calling an unknown function fails at render time
        assert!(engine
            .render_with_context("{{ no_such_fn(1) }}", json!({}))
            .is_err());
    }

    #[test]
    fn test_is_truthy() {
        assert!(is_truthy("true"));
        assert!(is_truthy("True"));
        assert!(is_truthy("yes"));
        assert!(is_truthy("on"));
        assert!(is_truthy("1"));
        assert!(is_truthy("hello"));

        assert!(!is_truthy("false"));
        assert!(!is_truthy("no"));
        assert!(!is_truthy("off"));
        assert!(!is_truthy("0"));
        assert!(!is_truthy("none"));
        assert!(!is_truthy(""));
        assert!(!is_truthy("   "));
    }
}
