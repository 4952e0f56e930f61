//! Expression-script compiler
//!
//! The ruleset source is a program for the embedded expression interpreter,
//! executed in an open context preloaded with the prelude helpers. After
//! execution the script must have left a `rules` tuple in the interpreter
//! context: one descriptor per rule, positional
//! `(name, when, then [, priority [, description]])`, with `when` and
//! `then` being expression sources. Descriptors are marshalled into uniform
//! rules at compile time; every field error fails the whole compilation.

use super::runtime::{FactEffects, SandboxPolicy, SchedulerBinding, ScriptRuntime};
use super::RuleCompiler;
use crate::error::{Result, RuleError};
use crate::facade::Facades;
use crate::types::{RuleFacts, Ruleset, UniformRule, DEFAULT_RULE_PRIORITY};
use evalexpr::{Context, Value};
use std::sync::{Arc, Mutex};

/// Marshalled rule descriptor shared by both script formats
pub(super) struct ExpressionRuleSpec {
    pub name: String,
    pub description: Option<String>,
    pub priority: i32,
    pub when_source: String,
    pub then_source: String,
}

/// Build a uniform rule whose condition and action are precompiled
/// expression trees evaluated under `policy`
pub(super) fn expression_rule(
    spec: ExpressionRuleSpec,
    runtime: &Arc<ScriptRuntime>,
    facades: &Facades,
    binding: &SchedulerBinding,
    policy: SandboxPolicy,
) -> Result<UniformRule> {
    let when_node = runtime.compile_expression(&spec.when_source).map_err(|e| {
        RuleError::Compilation(format!("Defined 'when' is invalid in rule: {}: {}", spec.name, e))
    })?;
    let then_node = runtime.compile_expression(&spec.then_source).map_err(|e| {
        RuleError::Compilation(format!("Defined 'then' is invalid in rule: {}: {}", spec.name, e))
    })?;

    let when = {
        let runtime = Arc::clone(runtime);
        let facades = facades.clone();
        let name = spec.name.clone();
        Box::new(move |facts: &RuleFacts| -> Result<bool> {
            let context = runtime.condition_context(policy, facts, &facades)?;
            when_node.eval_boolean_with_context(&context).map_err(|e| {
                RuleError::Execution(format!("Error evaluating condition of rule '{}': {}", name, e))
            })
        })
    };

    let then = {
        let runtime = Arc::clone(runtime);
        let facades = facades.clone();
        let binding = binding.clone();
        let name = spec.name.clone();
        Box::new(move |facts: &mut RuleFacts| -> Result<()> {
            let effects: FactEffects = Arc::new(Mutex::new(Vec::new()));
            let context =
                runtime.action_context(policy, facts, &facades, Arc::clone(&effects), binding.clone())?;
            then_node.eval_with_context(&context).map_err(|e| {
                RuleError::Execution(format!("Error evaluating action of rule '{}': {}", name, e))
            })?;

            let pending = effects
                .lock()
                .map_err(|_| RuleError::Execution("Effect queue poisoned".to_string()))?;
            for (key, value) in pending.iter() {
                facts.put(key.clone(), value.clone());
            }
            Ok(())
        })
    };

    Ok(UniformRule::new(spec.name, when, then)
        .with_description(spec.description)
        .with_priority(spec.priority))
}

/// Compiler for the expression-script format
pub struct ScriptCompiler {
    runtime: Arc<ScriptRuntime>,
    facades: Facades,
    binding: SchedulerBinding,
}

impl ScriptCompiler {
    pub fn new(runtime: Arc<ScriptRuntime>, facades: Facades, binding: SchedulerBinding) -> Self {
        Self {
            runtime,
            facades,
            binding,
        }
    }

    /// Marshal the `rules` context value into descriptors
    fn marshal_rules(&self, rules: &Value) -> Result<Vec<ExpressionRuleSpec>> {
        let descriptors: Vec<Value> = match rules {
            // `rules = ();` - a ruleset defining no rules
            Value::Empty => Vec::new(),
            // A single descriptor collapses to one tuple of strings
            Value::Tuple(items) if matches!(items.first(), Some(Value::String(_))) => {
                vec![rules.clone()]
            },
            Value::Tuple(items) => items.clone(),
            _ => {
                return Err(RuleError::Compilation(
                    "No 'rules' tuple defined in ruleset".to_string(),
                ))
            },
        };

        descriptors.iter().map(|d| self.marshal_rule(d)).collect()
    }

    fn marshal_rule(&self, descriptor: &Value) -> Result<ExpressionRuleSpec> {
        let Value::Tuple(fields) = descriptor else {
            return Err(RuleError::Compilation(
                "Rule definition is not a tuple".to_string(),
            ));
        };

        let name = match fields.first() {
            None => {
                return Err(RuleError::Compilation(
                    "Missing 'name' in rule definition".to_string(),
                ))
            },
            Some(Value::String(name)) => name.clone(),
            Some(_) => {
                return Err(RuleError::Compilation(
                    "Defined 'name' of rule is not a string".to_string(),
                ))
            },
        };

        let when_source = match fields.get(1) {
            None => {
                return Err(RuleError::Compilation(format!(
                    "Missing 'when' in rule: {}",
                    name
                )))
            },
            Some(Value::String(source)) => source.clone(),
            Some(_) => {
                return Err(RuleError::Compilation(format!(
                    "Defined 'when' is not an expression string in rule: {}",
                    name
                )))
            },
        };

        let then_source = match fields.get(2) {
            None => {
                return Err(RuleError::Compilation(format!(
                    "Missing 'then' in rule: {}",
                    name
                )))
            },
            Some(Value::String(source)) => source.clone(),
            Some(_) => {
                return Err(RuleError::Compilation(format!(
                    "Defined 'then' is not an expression string in rule: {}",
                    name
                )))
            },
        };

        let priority = match fields.get(3) {
            None => DEFAULT_RULE_PRIORITY,
            Some(Value::Int(priority)) => *priority as i32,
            Some(_) => {
                return Err(RuleError::Compilation(format!(
                    "Defined 'priority' is not a number in rule: {}",
                    name
                )))
            },
        };

        let description = match fields.get(4) {
            None => None,
            Some(Value::String(description)) => Some(description.clone()),
            Some(_) => {
                return Err(RuleError::Compilation(format!(
                    "Defined 'description' is not a string in rule: {}",
                    name
                )))
            },
        };

        Ok(ExpressionRuleSpec {
            name,
            description,
            priority,
            when_source,
            then_source,
        })
    }
}

impl RuleCompiler for ScriptCompiler {
    fn compile(&mut self, ruleset: &Ruleset) -> Result<Vec<UniformRule>> {
        let mut context = self
            .runtime
            .condition_context(SandboxPolicy::Open, &RuleFacts::new(), &self.facades)
            .map_err(|e| RuleError::Compilation(e.to_string()))?;

        evalexpr::eval_with_context_mut(&ruleset.rules, &mut context)
            .map_err(|e| RuleError::Compilation(e.to_string()))?;

        let rules = context.get_value("rules").cloned().ok_or_else(|| {
            RuleError::Compilation("No 'rules' tuple defined in ruleset".to_string())
        })?;

        self.marshal_rules(&rules)?
            .into_iter()
            .map(|spec| {
                expression_rule(
                    spec,
                    &self.runtime,
                    &self.facades,
                    &self.binding,
                    SandboxPolicy::Open,
                )
            })
            .collect()
    }
}
