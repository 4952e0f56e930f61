//! Core ruleset and rule type definitions
//!
//! Types shared across the engine:
//! - Ruleset: versioned rule source plus metadata, input to a deployment
//! - UniformRule: the compiled condition + action + priority representation
//! - RuleFacts: the mutable fact base rules evaluate against
//! - RuleRegistry: ordered set of compiled rules handed to the host engine

use crate::error::{Result, RuleError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

/// Default rule priority (lower fires first)
pub const DEFAULT_RULE_PRIORITY: i32 = 1000;

/// Metadata key carrying the optional validity recurrence specification
pub const META_VALIDITY: &str = "validity";

// ============================================================================
// Ruleset
// ============================================================================

/// Declared authoring language of a ruleset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RulesetLang {
    /// Expression script executed in the open embedded interpreter
    Script,
    /// Builder DSL executed in the sandboxed interpreter
    Dsl,
    /// Declarative JSON rules (attribute-filter trees, lifecycle hooks)
    Json,
    /// Flow graph of typed nodes
    Flow,
}

/// Scope a ruleset is deployed under
///
/// Realm- and asset-scoped rulesets get an extra `realm` / `asset_id`
/// binding in the sandboxed DSL format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RulesetScope {
    Global,
    Realm(String),
    Asset(String),
}

/// Ruleset - versioned unit of rule source text plus metadata
///
/// Immutable once handed to a deployment; a new version requires a new
/// deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ruleset {
    /// Unique identifier
    pub id: i64,

    /// Ruleset name
    pub name: String,

    /// Version, bumped on every redeploy
    pub version: i64,

    /// Declared authoring language
    pub lang: RulesetLang,

    /// Rule source text (script, JSON document or node collection)
    pub rules: String,

    /// Metadata map; may carry a `validity` recurrence specification
    #[serde(default)]
    pub meta: HashMap<String, Value>,

    /// Deployment scope
    #[serde(default = "default_scope")]
    pub scope: RulesetScope,

    /// Keep running in a degraded state after execution errors
    #[serde(default)]
    pub continue_on_error: bool,

    /// Also evaluate against predicted datapoint changes
    #[serde(default)]
    pub trigger_on_predicted_data: bool,
}

fn default_scope() -> RulesetScope {
    RulesetScope::Global
}

// ============================================================================
// Deployment status
// ============================================================================

/// Lifecycle status of a ruleset deployment
///
/// Error transitions are one-directional for a given deployment instance;
/// recovery requires a new deployment. `start`/`stop` set `Deployed` and
/// `Paused`; `Expired` is set by the host engine when it acts on an elapsed
/// validity window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RulesetStatus {
    Ready,
    Deployed,
    Paused,
    Expired,
    CompilationError,
    ExecutionError,
    LoopError,
}

// ============================================================================
// Fact base
// ============================================================================

/// Event reported by the host engine when an asset state changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetStateChangeEvent {
    /// Identifier of the asset whose state changed
    pub asset_id: String,
    /// Name of the changed attribute
    pub attribute: String,
}

impl AssetStateChangeEvent {
    /// Fact-base key for the changed attribute (`"{asset_id}:{attribute}"`)
    pub fn fact_key(&self) -> String {
        format!("{}:{}", self.asset_id, self.attribute)
    }
}

/// Rule facts - the mutable working memory rules read and write
///
/// Keys are opaque to this crate; compiled rules reference whatever keys
/// the ruleset author used (by convention `"{asset_id}:{attribute}"`).
#[derive(Debug, Clone, Default)]
pub struct RuleFacts {
    values: HashMap<String, Value>,
}

impl RuleFacts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a fact value
    pub fn put(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    /// Get a fact value
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Get a fact value coerced to f64, if numeric
    pub fn get_number(&self, key: &str) -> Option<f64> {
        self.values.get(key).and_then(Value::as_f64)
    }

    /// Remove a fact value
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    /// Whether a fact is present
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Iterate over all facts
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    /// Number of facts
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

// ============================================================================
// Uniform rule
// ============================================================================

/// Condition predicate over the fact base
pub type RuleCondition = Box<dyn Fn(&RuleFacts) -> Result<bool> + Send + Sync>;

/// Action procedure over the fact base
pub type RuleAction = Box<dyn Fn(&mut RuleFacts) -> Result<()> + Send + Sync>;

/// UniformRule - the executable representation every format compiles to
///
/// Produced by exactly one compiler call; ownership transfers to the rule
/// registry on registration.
pub struct UniformRule {
    /// Rule name, unique within a deployment
    pub name: String,

    /// Optional description
    pub description: Option<String>,

    /// Priority; lower fires first
    pub priority: i32,

    /// Condition predicate
    pub when: RuleCondition,

    /// Action procedure
    pub then: RuleAction,
}

impl UniformRule {
    pub fn new(name: impl Into<String>, when: RuleCondition, then: RuleAction) -> Self {
        Self {
            name: name.into(),
            description: None,
            priority: DEFAULT_RULE_PRIORITY,
            when,
            then,
        }
    }

    pub fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Evaluate the condition against the fact base
    pub fn evaluate(&self, facts: &RuleFacts) -> Result<bool> {
        (self.when)(facts)
    }

    /// Execute the action against the fact base
    pub fn execute(&self, facts: &mut RuleFacts) -> Result<()> {
        (self.then)(facts)
    }
}

impl fmt::Debug for UniformRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UniformRule")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Rule registry
// ============================================================================

/// Ordered set of compiled rules consumed by the host matching engine
///
/// Rules are registered once, in source order. Individual rules are never
/// removed; teardown is whole-deployment only.
#[derive(Debug, Default)]
pub struct RuleRegistry {
    rules: Vec<UniformRule>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a rule; rejects duplicate names within the registry
    pub fn register(&mut self, rule: UniformRule) -> Result<()> {
        if self.rules.iter().any(|r| r.name == rule.name) {
            return Err(RuleError::Compilation(format!(
                "Duplicate rule name: {}",
                rule.name
            )));
        }
        debug!("Registering rule: {}", rule.name);
        self.rules.push(rule);
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &UniformRule> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

// ============================================================================
// Clock
// ============================================================================

/// Time source seam for validity refresh and scheduler bookkeeping
pub trait Clock: Send + Sync {
    /// Current time as epoch milliseconds
    fn now_millis(&self) -> i64;
}

/// Wall-clock time source
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}
