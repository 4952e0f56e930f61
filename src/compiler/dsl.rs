//! Sandboxed declaration-shell compiler
//!
//! The second script format runs under the deny-by-default policy: interpreter
//! builtins are disabled and only the prelude, the facade helpers and the
//! collector functions below are callable. The source declares rules by
//! calling `rule(name, when, then)` or
//! `rule_full(name, description, priority, when, then)`; anything outside the
//! allow-list fails the whole compilation. Conditions and actions execute
//! under the same policy at runtime.

use super::runtime::{SandboxPolicy, SchedulerBinding, ScriptRuntime};
use super::script::{expression_rule, ExpressionRuleSpec};
use super::RuleCompiler;
use crate::error::{Result, RuleError};
use crate::facade::Facades;
use crate::types::{RuleFacts, Ruleset, RulesetScope, UniformRule, DEFAULT_RULE_PRIORITY};
use evalexpr::{
    ContextWithMutableFunctions, ContextWithMutableVariables, EvalexprError, Function, Value,
};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

type Collected = Arc<Mutex<Vec<ExpressionRuleSpec>>>;

/// Compiler for the sandboxed declaration-shell format
pub struct DslCompiler {
    runtime: Arc<ScriptRuntime>,
    facades: Facades,
    binding: SchedulerBinding,
}

impl DslCompiler {
    pub fn new(runtime: Arc<ScriptRuntime>, facades: Facades, binding: SchedulerBinding) -> Self {
        Self {
            runtime,
            facades,
            binding,
        }
    }
}

fn string_arg(value: &Value, what: &str) -> std::result::Result<String, EvalexprError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        _ => Err(EvalexprError::CustomMessage(format!(
            "Defined '{}' of rule is not a string",
            what
        ))),
    }
}

fn bind_collectors(
    context: &mut evalexpr::HashMapContext,
    collected: &Collected,
) -> Result<()> {
    let sink = Arc::clone(collected);
    context
        .set_function(
            "rule".to_string(),
            Function::new(move |args| {
                let fields = args.as_fixed_len_tuple(3)?;
                let spec = ExpressionRuleSpec {
                    name: string_arg(&fields[0], "name")?,
                    description: None,
                    priority: DEFAULT_RULE_PRIORITY,
                    when_source: string_arg(&fields[1], "when")?,
                    then_source: string_arg(&fields[2], "then")?,
                };
                sink.lock()
                    .map_err(|_| {
                        EvalexprError::CustomMessage("Rule collector poisoned".to_string())
                    })?
                    .push(spec);
                Ok(Value::Empty)
            }),
        )
        .map_err(|e| RuleError::Compilation(e.to_string()))?;

    let sink = Arc::clone(collected);
    context
        .set_function(
            "rule_full".to_string(),
            Function::new(move |args| {
                let fields = args.as_fixed_len_tuple(5)?;
                let name = string_arg(&fields[0], "name")?;
                let priority = match &fields[2] {
                    Value::Int(priority) => *priority as i32,
                    _ => {
                        return Err(EvalexprError::CustomMessage(format!(
                            "Defined 'priority' is not a number in rule: {}",
                            name
                        )))
                    },
                };
                let spec = ExpressionRuleSpec {
                    description: Some(string_arg(&fields[1], "description")?),
                    priority,
                    when_source: string_arg(&fields[3], "when")?,
                    then_source: string_arg(&fields[4], "then")?,
                    name,
                };
                sink.lock()
                    .map_err(|_| {
                        EvalexprError::CustomMessage("Rule collector poisoned".to_string())
                    })?
                    .push(spec);
                Ok(Value::Empty)
            }),
        )
        .map_err(|e| RuleError::Compilation(e.to_string()))?;

    context
        .set_function(
            "log_info".to_string(),
            Function::new(|args| {
                info!(message = %args.as_string()?, "Ruleset log");
                Ok(Value::Empty)
            }),
        )
        .map_err(|e| RuleError::Compilation(e.to_string()))?;

    context
        .set_function(
            "log_warn".to_string(),
            Function::new(|args| {
                warn!(message = %args.as_string()?, "Ruleset log");
                Ok(Value::Empty)
            }),
        )
        .map_err(|e| RuleError::Compilation(e.to_string()))?;

    Ok(())
}

impl RuleCompiler for DslCompiler {
    fn compile(&mut self, ruleset: &Ruleset) -> Result<Vec<UniformRule>> {
        let mut context = self
            .runtime
            .condition_context(SandboxPolicy::DenyByDefault, &RuleFacts::new(), &self.facades)
            .map_err(|e| RuleError::Compilation(e.to_string()))?;

        let collected: Collected = Arc::new(Mutex::new(Vec::new()));
        bind_collectors(&mut context, &collected)?;

        // Scoped rulesets see their binding target as a plain variable
        match &ruleset.scope {
            RulesetScope::Global => {},
            RulesetScope::Realm(realm) => {
                context
                    .set_value("realm".to_string(), Value::String(realm.clone()))
                    .map_err(|e| RuleError::Compilation(e.to_string()))?;
            },
            RulesetScope::Asset(asset_id) => {
                context
                    .set_value("asset_id".to_string(), Value::String(asset_id.clone()))
                    .map_err(|e| RuleError::Compilation(e.to_string()))?;
            },
        }

        evalexpr::eval_with_context_mut(&ruleset.rules, &mut context)
            .map_err(|e| RuleError::Compilation(e.to_string()))?;

        let specs = {
            let mut guard = collected
                .lock()
                .map_err(|_| RuleError::Compilation("Rule collector poisoned".to_string()))?;
            std::mem::take(&mut *guard)
        };

        specs
            .into_iter()
            .map(|spec| {
                expression_rule(
                    spec,
                    &self.runtime,
                    &self.facades,
                    &self.binding,
                    SandboxPolicy::DenyByDefault,
                )
            })
            .collect()
    }
}
