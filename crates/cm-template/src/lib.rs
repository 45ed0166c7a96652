//! Template engine for `value_template` conditions
//!
//! Rules can test an observed value with a Jinja-style expression. The
//! engine binds the current state store so templates can look at other
//! entities (`is_state`, `state_attr`, `states`, `has_value`) in addition
//! to the variables injected per evaluation.

mod engine;
mod error;

pub use engine::{is_truthy, TemplateEngine};
pub use error::{TemplateError, TemplateResult};
