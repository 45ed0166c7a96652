//! Violation evaluation
//!
//! Answers one question per flattened rule: does this entity's current
//! state violate the rule right now? Every failure mode counts as a
//! violation (missing entity, unavailable state, missing attribute,
//! template errors, values that cannot be coerced), so broken setups
//! surface instead of passing silently.

use std::sync::Arc;

use cm_core::State;
use cm_template::{is_truthy, TemplateEngine};
use serde_json::{json, Value};
use tracing::{debug, trace};

use crate::condition::{AtomicCondition, Condition, ExpectedState, NumericRange};
use crate::rule::FlattenedRule;

/// State values considered truthy when matching `expected_state: true`
const TRUTHY_STATES: [&str; 7] = ["on", "true", "home", "open", "connected", "1", "yes"];

/// Evaluates condition trees against entity states
pub struct ViolationEvaluator {
    templates: Arc<TemplateEngine>,
}

impl ViolationEvaluator {
    pub fn new(templates: Arc<TemplateEngine>) -> Self {
        Self { templates }
    }

    /// Whether the entity currently violates the rule
    pub fn check_rule_violation(&self, rule: &FlattenedRule, state: Option<&State>) -> bool {
        let Some(state) = state else {
            trace!(entity_id = %rule.entity_id, "Entity has no state, counting as violation");
            return true;
        };
        if state.is_unavailable() {
            return !rule.allow_unavailable;
        }
        if state.is_unknown() {
            return !rule.allow_unknown;
        }
        // A condition list is an implicit `and`: any violated member
        // violates the rule.
        rule.condition.iter().any(|c| self.violates(c, state))
    }

    /// Whether a single condition node is violated
    pub fn violates(&self, condition: &Condition, state: &State) -> bool {
        match condition {
            Condition::And { and } => and.iter().any(|c| self.violates(c, state)),
            Condition::Or { or } => or.iter().all(|c| self.violates(c, state)),
            Condition::Not { not } => !self.violates(not, state),
            Condition::Atomic(atomic) => self.violates_atomic(atomic, state),
        }
    }

    fn violates_atomic(&self, condition: &AtomicCondition, state: &State) -> bool {
        let observed: Value = match &condition.attribute {
            Some(attribute) => match state.attribute(attribute) {
                Some(value) => value.clone(),
                None => {
                    trace!(
                        entity_id = %state.entity_id,
                        attribute,
                        "Attribute missing, counting as violation"
                    );
                    return true;
                }
            },
            None => json!(state.state),
        };

        // Template wins over numeric, numeric over expected_state;
        // validation guarantees exactly one is set.
        if let Some(template) = &condition.value_template {
            return self.violates_template(template, &observed, state);
        }
        if let Some(range) = &condition.expected_numeric {
            return violates_numeric(range, &observed);
        }
        if let Some(expected) = &condition.expected_state {
            return violates_expected(expected, &observed);
        }
        false
    }

    fn violates_template(&self, template: &str, observed: &Value, state: &State) -> bool {
        let vars = json!({
            "t_state": observed,
            "t_entity": state,
            "t_id": state.entity_id.to_string(),
        });
        match self.templates.render_with_context(template, &vars) {
            Ok(rendered) => !is_truthy(&rendered),
            Err(err) => {
                debug!(
                    entity_id = %state.entity_id,
                    template,
                    error = %err,
                    "Template failed to render, counting as violation"
                );
                true
            }
        }
    }
}

fn violates_numeric(range: &NumericRange, observed: &Value) -> bool {
    let Some(value) = coerce_f64(observed) else {
        return true;
    };
    if range.min.is_some_and(|min| value < min) {
        return true;
    }
    range.max.is_some_and(|max| value > max)
}

fn violates_expected(expected: &ExpectedState, observed: &Value) -> bool {
    match expected {
        ExpectedState::Bool(expected) => {
            let truthy = TRUTHY_STATES.contains(&value_as_string(observed).to_lowercase().as_str());
            truthy != *expected
        }
        ExpectedState::Number(expected) => {
            coerce_f64(observed).map_or(true, |value| value != *expected)
        }
        ExpectedState::Any(options) => {
            let observed = value_as_string(observed).to_lowercase();
            !options.iter().any(|option| option.to_lowercase() == observed)
        }
        ExpectedState::Single(expected) => {
            !value_as_string(observed).eq_ignore_ascii_case(expected)
        }
    }
}

fn coerce_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn value_as_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
