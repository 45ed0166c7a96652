//! Condition trees for compliance rules
//!
//! A condition describes what counts as a VIOLATION, not what counts as
//! compliant. Composites therefore combine in violates-space:
//!
//! - `and`: violated when ANY child is violated (all children must hold
//!   for the entity to be compliant)
//! - `or`: violated when ALL children are violated (one holding child is
//!   enough to be compliant)
//! - `not`: violated when the child is NOT violated
//!
//! Leaves test a single observed value against an expected state, a
//! numeric range, or a rendered template.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum nesting depth accepted for composite conditions
pub const MAX_CONDITION_DEPTH: usize = 10;

/// Errors produced by condition validation
#[derive(Debug, Error, PartialEq)]
pub enum ConditionError {
    #[error("condition must declare exactly one of expected_state, expected_numeric, value_template (found {found})")]
    WrongModeCount { found: usize },

    #[error("empty `{0}` block")]
    EmptyComposite(&'static str),

    #[error("conditions nest deeper than {MAX_CONDITION_DEPTH} levels")]
    TooDeep,

    #[error("expected_numeric needs at least one of min, max")]
    EmptyNumericRange,
}

/// A node in a rule's condition tree
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    And { and: Vec<Condition> },
    Or { or: Vec<Condition> },
    Not { not: Box<Condition> },
    Atomic(AtomicCondition),
}

/// A leaf condition testing one observed value
///
/// The observed value is the entity's state, or the named attribute when
/// `attribute` is set. Exactly one of the three test modes must be
/// declared.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AtomicCondition {
    /// Test this attribute instead of the state value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,

    /// Violated when the observed value does not match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_state: Option<ExpectedState>,

    /// Violated when the observed value falls outside the range
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_numeric: Option<NumericRange>,

    /// Violated when the rendered template is falsy or fails to render
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_template: Option<String>,
}

/// Accepted forms for `expected_state`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExpectedState {
    /// Compared against the truthiness of the observed value
    Bool(bool),
    /// Compared numerically after coercion
    Number(f64),
    /// Matches when the observed value equals any entry (case-insensitive)
    Any(Vec<String>),
    /// Case-insensitive string comparison
    Single(String),
}

/// Inclusive numeric bounds for `expected_numeric`
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NumericRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

impl Condition {
    /// Validate the whole tree: mode counts, empty composites, depth
    pub fn validate(&self) -> Result<(), ConditionError> {
        self.validate_at(0)
    }

    fn validate_at(&self, depth: usize) -> Result<(), ConditionError> {
        if depth > MAX_CONDITION_DEPTH {
            return Err(ConditionError::TooDeep);
        }
        match self {
            Condition::And { and } => {
                if and.is_empty() {
                    return Err(ConditionError::EmptyComposite("and"));
                }
                and.iter().try_for_each(|c| c.validate_at(depth + 1))
            }
            Condition::Or { or } => {
                if or.is_empty() {
                    return Err(ConditionError::EmptyComposite("or"));
                }
                or.iter().try_for_each(|c| c.validate_at(depth + 1))
            }
            Condition::Not { not } => not.validate_at(depth + 1),
            Condition::Atomic(atomic) => atomic.validate(),
        }
    }

    /// Visit every declared `value_template` in the tree
    pub fn for_each_template<E>(
        &self,
        f: &mut impl FnMut(&str) -> Result<(), E>,
    ) -> Result<(), E> {
        match self {
            Condition::And { and } => and.iter().try_for_each(|c| c.for_each_template(f)),
            Condition::Or { or } => or.iter().try_for_each(|c| c.for_each_template(f)),
            Condition::Not { not } => not.for_each_template(f),
            Condition::Atomic(atomic) => match &atomic.value_template {
                Some(template) => f(template),
                None => Ok(()),
            },
        }
    }
}

impl AtomicCondition {
    fn validate(&self) -> Result<(), ConditionError> {
        let found = [
            self.expected_state.is_some(),
            self.expected_numeric.is_some(),
            self.value_template.is_some(),
        ]
        .iter()
        .filter(|present| **present)
        .count();
        if found != 1 {
            return Err(ConditionError::WrongModeCount { found });
        }
        if let Some(range) = &self.expected_numeric {
            if range.min.is_none() && range.max.is_none() {
                return Err(ConditionError::EmptyNumericRange);
            }
        }
        Ok(())
    }
}
