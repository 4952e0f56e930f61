//! Format-specific rule compilers
//!
//! Every authoring format compiles to the same uniform rule representation
//! through one interface. The variant is selected by the ruleset's declared
//! language tag; facades, the shared script runtime and the scheduler
//! binding are injected at construction.
//!
//! Compilation is all-or-nothing: a compiler either returns every parsed
//! rule, in source order, or fails with a compilation error carrying the
//! cause.

mod dsl;
mod flow;
mod json;
mod runtime;
mod script;

pub use dsl::DslCompiler;
pub use flow::FlowCompiler;
pub use json::JsonCompiler;
pub use runtime::{ScriptRuntime, SandboxPolicy, SchedulerBinding};
pub use script::ScriptCompiler;

use crate::error::Result;
use crate::facade::Facades;
use crate::types::{AssetStateChangeEvent, RuleFacts, Ruleset, RulesetLang, UniformRule};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One compiler front-end
///
/// `start`, `stop` and `on_asset_states_changed` are lifecycle hooks; only
/// the declarative JSON variant implements them, the defaults are no-ops.
pub trait RuleCompiler: Send {
    /// Compile the ruleset source into uniform rules
    fn compile(&mut self, ruleset: &Ruleset) -> Result<Vec<UniformRule>>;

    /// Called once when the deployment activates
    fn start(&mut self, _facts: &mut RuleFacts) {}

    /// Called once when the deployment deactivates
    fn stop(&mut self, _facts: &mut RuleFacts) {}

    /// Called when the host engine reports a changed asset state
    fn on_asset_states_changed(&mut self, _facts: &mut RuleFacts, _event: &AssetStateChangeEvent) {
    }
}

/// Select the compiler variant for a declared language
pub fn compiler_for(
    lang: RulesetLang,
    runtime: Arc<ScriptRuntime>,
    facades: Facades,
    binding: SchedulerBinding,
) -> Box<dyn RuleCompiler> {
    match lang {
        RulesetLang::Script => Box::new(ScriptCompiler::new(runtime, facades, binding)),
        RulesetLang::Dsl => Box::new(DslCompiler::new(runtime, facades, binding)),
        RulesetLang::Json => Box::new(JsonCompiler::new(facades, binding)),
        RulesetLang::Flow => Box::new(FlowCompiler::new(facades)),
    }
}

/// Comparison operator shared by the declarative and flow formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Gte,
    Lte,
}

/// Compare a fact value against a reference value
///
/// Numbers compare numerically, strings and booleans support equality only.
/// An absent or incomparable pair never matches.
pub(crate) fn compare_values(
    left: Option<&serde_json::Value>,
    op: CompareOp,
    right: &serde_json::Value,
) -> bool {
    let Some(left) = left else {
        return false;
    };

    if let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) {
        return match op {
            CompareOp::Eq => (l - r).abs() < f64::EPSILON,
            CompareOp::Ne => (l - r).abs() >= f64::EPSILON,
            CompareOp::Gt => l > r,
            CompareOp::Lt => l < r,
            CompareOp::Gte => l >= r,
            CompareOp::Lte => l <= r,
        };
    }

    match op {
        CompareOp::Eq => left == right,
        CompareOp::Ne => left != right,
        _ => false,
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_compare_numeric() {
        let left = json!(10.0);
        assert!(compare_values(Some(&left), CompareOp::Gte, &json!(10)));
        assert!(compare_values(Some(&left), CompareOp::Lt, &json!(10.5)));
        assert!(!compare_values(Some(&left), CompareOp::Ne, &json!(10)));
    }

    #[test]
    fn test_compare_strings_equality_only() {
        let left = json!("eco");
        assert!(compare_values(Some(&left), CompareOp::Eq, &json!("eco")));
        assert!(compare_values(Some(&left), CompareOp::Ne, &json!("boost")));
        assert!(!compare_values(Some(&left), CompareOp::Gt, &json!("boost")));
    }

    #[test]
    fn test_compare_missing_never_matches() {
        assert!(!compare_values(None, CompareOp::Eq, &json!(1)));
        assert!(!compare_values(None, CompareOp::Ne, &json!(1)));
    }
}
