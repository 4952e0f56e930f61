//! Shared script runtime for the expression-based formats
//!
//! One explicitly constructed, process-lifetime object that both script
//! compilers receive at construction. It owns no mutable state; it knows how
//! to precompile expression sources and how to build evaluation contexts
//! binding the fact base, the platform facades and the prelude of helper
//! functions under fixed names.
//!
//! Sandboxing is an allow-list: a deny-by-default context disables every
//! interpreter builtin and binds only the enumerated helpers, so any other
//! identifier or function reference fails before an action executes.

use crate::error::{Result, RuleError};
use crate::facade::Facades;
use crate::scheduler::RuleActionScheduler;
use crate::types::RuleFacts;
use evalexpr::{
    Context, ContextWithMutableFunctions, ContextWithMutableVariables, EvalexprError,
    EvalexprResult, Function, HashMapContext, Node, Value,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Interpreter exposure of a script format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxPolicy {
    /// General-purpose interpreter: builtins available alongside the prelude
    Open,
    /// Deny-by-default: builtins disabled, only the allow-list is bound
    DenyByDefault,
}

/// Deployment-scoped scheduler binding for deferred actions from rule bodies
#[derive(Clone)]
pub struct SchedulerBinding {
    pub scheduler: Arc<RuleActionScheduler>,
    pub deployment_key: String,
}

/// Fact mutations collected while an action expression runs
///
/// Context functions cannot borrow the fact base mutably, so `set_fact`
/// records an explicit effect which the action closure applies afterwards.
pub type FactEffects = Arc<Mutex<Vec<(String, serde_json::Value)>>>;

/// Shared runtime for both script formats
pub struct ScriptRuntime {
    _private: (),
}

impl ScriptRuntime {
    pub fn new() -> Self {
        Self { _private: () }
    }

    /// Precompile an expression source into an operator tree
    pub fn compile_expression(&self, source: &str) -> Result<Node> {
        evalexpr::build_operator_tree(source)
            .map_err(|e| RuleError::Expression(format!("Failed to compile '{}': {}", source, e)))
    }

    /// Context for evaluating a rule condition: facts plus read-only helpers
    pub fn condition_context(
        &self,
        policy: SandboxPolicy,
        facts: &RuleFacts,
        facades: &Facades,
    ) -> Result<HashMapContext> {
        let mut context = self.base_context(policy)?;
        let snapshot = snapshot_facts(facts);

        self.bind_facts(&mut context, &snapshot)?;
        self.bind_prelude(&mut context)?;
        self.bind_read_facades(&mut context, &snapshot, facades)?;

        Ok(context)
    }

    /// Context for evaluating a rule action: condition context plus
    /// effectful facade bindings and deferred scheduling
    #[allow(clippy::too_many_arguments)]
    pub fn action_context(
        &self,
        policy: SandboxPolicy,
        facts: &RuleFacts,
        facades: &Facades,
        effects: FactEffects,
        binding: SchedulerBinding,
    ) -> Result<HashMapContext> {
        let mut context = self.condition_context(policy, facts, facades)?;
        self.bind_write_facades(&mut context, facades, effects, binding)?;
        Ok(context)
    }

    fn base_context(&self, policy: SandboxPolicy) -> Result<HashMapContext> {
        let mut context = HashMapContext::new();
        if policy == SandboxPolicy::DenyByDefault {
            context
                .set_builtin_functions_disabled(true)
                .map_err(|e| RuleError::Expression(e.to_string()))?;
        }
        Ok(context)
    }

    /// Bind facts with identifier-safe keys as plain variables
    ///
    /// Namespaced keys (e.g. `"battery_01:soc"`) are reachable through
    /// `value(key)` instead.
    fn bind_facts(
        &self,
        context: &mut HashMapContext,
        snapshot: &Arc<HashMap<String, serde_json::Value>>,
    ) -> Result<()> {
        for (key, value) in snapshot.iter() {
            if !is_identifier(key) {
                continue;
            }
            context
                .set_value(key.clone(), json_to_eval(value))
                .map_err(|e| {
                    RuleError::Expression(format!("Failed to bind fact {}: {}", key, e))
                })?;
        }
        Ok(())
    }

    /// Register the arithmetic prelude helpers
    fn bind_prelude(&self, context: &mut HashMapContext) -> Result<()> {
        set_function(context, "abs", |args| {
            let value = to_f64(args)?;
            Ok(Value::Float(value.abs()))
        })?;

        set_function(context, "min", |args| {
            let tuple = args.as_fixed_len_tuple(2)?;
            Ok(Value::Float(to_f64(&tuple[0])?.min(to_f64(&tuple[1])?)))
        })?;

        set_function(context, "max", |args| {
            let tuple = args.as_fixed_len_tuple(2)?;
            Ok(Value::Float(to_f64(&tuple[0])?.max(to_f64(&tuple[1])?)))
        })?;

        set_function(context, "clamp", |args| {
            let tuple = args.as_fixed_len_tuple(3)?;
            let value = to_f64(&tuple[0])?;
            let min = to_f64(&tuple[1])?;
            let max = to_f64(&tuple[2])?;
            Ok(Value::Float(value.clamp(min, max)))
        })?;

        set_function(context, "scale", |args| {
            let tuple = args.as_fixed_len_tuple(2)?;
            Ok(Value::Float(to_f64(&tuple[0])? * to_f64(&tuple[1])?))
        })?;

        Ok(())
    }

    /// Register the read-only fact and datapoint helpers
    fn bind_read_facades(
        &self,
        context: &mut HashMapContext,
        snapshot: &Arc<HashMap<String, serde_json::Value>>,
        facades: &Facades,
    ) -> Result<()> {
        let facts = Arc::clone(snapshot);
        set_function(context, "value", move |args| {
            let key = args.as_string()?;
            facts
                .get(&key)
                .map(json_to_eval)
                .ok_or_else(|| EvalexprError::CustomMessage(format!("Unknown fact: {}", key)))
        })?;

        let facts = Arc::clone(snapshot);
        set_function(context, "has", move |args| {
            let key = args.as_string()?;
            Ok(Value::Boolean(facts.contains_key(&key)))
        })?;

        let historic = Arc::clone(&facades.historic_datapoints);
        set_function(context, "historic", move |args| {
            let tuple = args.as_fixed_len_tuple(2)?;
            let asset_id = tuple[0].as_string()?;
            let attribute = tuple[1].as_string()?;
            match historic.last_value(&asset_id, &attribute) {
                Some(value) => Ok(Value::Float(value)),
                None => Ok(Value::Empty),
            }
        })?;

        let predicted = Arc::clone(&facades.predicted_datapoints);
        set_function(context, "predicted", move |args| {
            let tuple = args.as_fixed_len_tuple(3)?;
            let asset_id = tuple[0].as_string()?;
            let attribute = tuple[1].as_string()?;
            let horizon = tuple[2].as_int()?;
            match predicted.predicted_value(&asset_id, &attribute, horizon) {
                Some(value) => Ok(Value::Float(value)),
                None => Ok(Value::Empty),
            }
        })?;

        Ok(())
    }

    /// Register the effectful facade helpers available to actions
    fn bind_write_facades(
        &self,
        context: &mut HashMapContext,
        facades: &Facades,
        effects: FactEffects,
        binding: SchedulerBinding,
    ) -> Result<()> {
        set_function(context, "set_fact", move |args| {
            let tuple = args.as_fixed_len_tuple(2)?;
            let key = tuple[0].as_string()?;
            let mut pending = effects
                .lock()
                .map_err(|_| EvalexprError::CustomMessage("Effect queue poisoned".to_string()))?;
            pending.push((key, eval_to_json(&tuple[1])));
            Ok(Value::Empty)
        })?;

        let assets = Arc::clone(&facades.assets);
        set_function(context, "write_attribute", move |args| {
            let tuple = args.as_fixed_len_tuple(3)?;
            let asset_id = tuple[0].as_string()?;
            let attribute = tuple[1].as_string()?;
            assets
                .write_attribute(&asset_id, &attribute, eval_to_json(&tuple[2]))
                .map_err(|e| EvalexprError::CustomMessage(e.to_string()))?;
            Ok(Value::Empty)
        })?;

        let notifications = Arc::clone(&facades.notifications);
        set_function(context, "notify", move |args| {
            let tuple = args.as_fixed_len_tuple(2)?;
            let target = tuple[0].as_string()?;
            let message = tuple[1].as_string()?;
            notifications
                .send(&target, &message)
                .map_err(|e| EvalexprError::CustomMessage(e.to_string()))?;
            Ok(Value::Empty)
        })?;

        let users = Arc::clone(&facades.users);
        let notifications = Arc::clone(&facades.notifications);
        set_function(context, "notify_users", move |args| {
            let tuple = args.as_fixed_len_tuple(2)?;
            let realm = tuple[0].as_string()?;
            let message = tuple[1].as_string()?;
            for user_id in users.user_ids(&realm) {
                notifications
                    .send(&user_id, &message)
                    .map_err(|e| EvalexprError::CustomMessage(e.to_string()))?;
            }
            Ok(Value::Empty)
        })?;

        let assets = Arc::clone(&facades.assets);
        set_function(context, "defer_write", move |args| {
            let tuple = args.as_fixed_len_tuple(4)?;
            let delay = tuple[0].as_int()?;
            if delay < 0 {
                return Err(EvalexprError::CustomMessage(
                    "defer_write delay must not be negative".to_string(),
                ));
            }
            let asset_id = tuple[1].as_string()?;
            let attribute = tuple[2].as_string()?;
            let value = eval_to_json(&tuple[3]);

            let assets = Arc::clone(&assets);
            binding.scheduler.schedule(
                &binding.deployment_key,
                Box::new(move || assets.write_attribute(&asset_id, &attribute, value)),
                delay as u64,
            );
            Ok(Value::Empty)
        })?;

        Ok(())
    }
}

impl Default for ScriptRuntime {
    fn default() -> Self {
        Self::new()
    }
}

fn set_function<F>(context: &mut HashMapContext, name: &str, f: F) -> Result<()>
where
    F: Fn(&Value) -> EvalexprResult<Value> + Clone + Send + Sync + 'static,
{
    context
        .set_function(name.to_string(), Function::new(f))
        .map_err(|e| RuleError::Expression(format!("Failed to register {}: {}", name, e)))
}

fn snapshot_facts(facts: &RuleFacts) -> Arc<HashMap<String, serde_json::Value>> {
    Arc::new(
        facts
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    )
}

fn is_identifier(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {},
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Convert Value to f64 (handles both Int and Float)
fn to_f64(value: &Value) -> EvalexprResult<f64> {
    match value {
        Value::Float(f) => Ok(*f),
        Value::Int(i) => Ok(*i as f64),
        _ => Err(EvalexprError::expected_number(value.clone())),
    }
}

/// Convert a JSON fact value into an interpreter value
pub fn json_to_eval(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Bool(b) => Value::Boolean(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else {
                Value::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        },
        serde_json::Value::String(s) => Value::String(s.clone()),
        serde_json::Value::Null => Value::Empty,
        other => Value::String(other.to_string()),
    }
}

/// Convert an interpreter value back into a JSON value
pub fn eval_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Boolean(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::json!(i),
        Value::Float(f) => serde_json::json!(f),
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::Tuple(items) => {
            serde_json::Value::Array(items.iter().map(eval_to_json).collect())
        },
        Value::Empty => serde_json::Value::Null,
    }
}
