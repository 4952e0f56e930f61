//! Declarative JSON compiler
//!
//! Rules are authored as a JSON document instead of a script: a `when`
//! condition group over fact predicates and a `then` action list. Actions
//! before the first `wait` run inline when the rule fires; every action after
//! a `wait` is deferred through the deployment's scheduler with the
//! accumulated delay. Each rule fires once per match and is re-armed when its
//! condition stops matching or when a referenced asset state changes.
//!
//! This is the only format with lifecycle hooks: `on_start` and `on_stop`
//! action lists run when the deployment activates and deactivates.

use super::runtime::SchedulerBinding;
use super::{compare_values, CompareOp, RuleCompiler};
use crate::error::{Result, RuleError};
use crate::facade::Facades;
use crate::scheduler::ScheduledAction;
use crate::types::{
    AssetStateChangeEvent, RuleFacts, Ruleset, UniformRule, DEFAULT_RULE_PRIORITY,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::error;

// === Document schema ===

#[derive(Debug, Deserialize)]
struct JsonRulesetDoc {
    rules: Vec<JsonRule>,
}

#[derive(Debug, Deserialize)]
struct JsonRule {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default = "default_priority")]
    priority: i32,
    when: ConditionGroup,
    then: Vec<JsonRuleAction>,
    #[serde(default)]
    on_start: Vec<JsonRuleAction>,
    #[serde(default)]
    on_stop: Vec<JsonRuleAction>,
}

fn default_priority() -> i32 {
    DEFAULT_RULE_PRIORITY
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum GroupOperator {
    And,
    Or,
}

impl Default for GroupOperator {
    fn default() -> Self {
        GroupOperator::And
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ConditionGroup {
    #[serde(default)]
    operator: GroupOperator,
    #[serde(default)]
    items: Vec<AttributePredicate>,
    #[serde(default)]
    groups: Vec<ConditionGroup>,
}

#[derive(Debug, Clone, Deserialize)]
struct AttributePredicate {
    fact: String,
    operator: CompareOp,
    value: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum JsonRuleAction {
    WriteAttribute {
        asset_id: String,
        attribute: String,
        value: serde_json::Value,
    },
    Notify {
        target: String,
        message: String,
    },
    SetFact {
        fact: String,
        value: serde_json::Value,
    },
    Wait {
        millis: u64,
    },
}

// === Condition evaluation ===

impl ConditionGroup {
    fn matches(&self, facts: &RuleFacts) -> bool {
        let items = self.items.iter().map(|p| p.matches(facts));
        let groups = self.groups.iter().map(|g| g.matches(facts));
        let mut all = items.chain(groups);
        match self.operator {
            GroupOperator::And => all.all(|m| m),
            GroupOperator::Or => all.any(|m| m),
        }
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty() && self.groups.iter().all(ConditionGroup::is_empty)
    }

    fn referenced_facts(&self, out: &mut HashSet<String>) {
        for predicate in &self.items {
            out.insert(predicate.fact.clone());
        }
        for group in &self.groups {
            group.referenced_facts(out);
        }
    }
}

impl AttributePredicate {
    fn matches(&self, facts: &RuleFacts) -> bool {
        compare_values(facts.get(&self.fact), self.operator, &self.value)
    }
}

// === Compiler ===

/// Per-rule firing state kept by the compiler for re-arming
struct RuleArming {
    referenced_facts: HashSet<String>,
    armed: Arc<AtomicBool>,
}

/// Compiler for the declarative JSON format
pub struct JsonCompiler {
    facades: Facades,
    binding: SchedulerBinding,
    arming: Vec<RuleArming>,
    on_start: Vec<JsonRuleAction>,
    on_stop: Vec<JsonRuleAction>,
}

impl JsonCompiler {
    pub fn new(facades: Facades, binding: SchedulerBinding) -> Self {
        Self {
            facades,
            binding,
            arming: Vec::new(),
            on_start: Vec::new(),
            on_stop: Vec::new(),
        }
    }

    fn compile_rule(&mut self, rule: JsonRule) -> Result<UniformRule> {
        if rule.name.is_empty() {
            return Err(RuleError::Compilation(
                "Missing 'name' in rule definition".to_string(),
            ));
        }
        if rule.when.is_empty() {
            return Err(RuleError::Compilation(format!(
                "Rule has no conditions: {}",
                rule.name
            )));
        }

        let (immediate, deferred) = split_actions(&rule.name, rule.then)?;
        for action in rule.on_start.iter().chain(rule.on_stop.iter()) {
            if matches!(action, JsonRuleAction::Wait { .. }) {
                return Err(RuleError::Compilation(format!(
                    "Deferred actions are not allowed in lifecycle hooks of rule: {}",
                    rule.name
                )));
            }
        }

        let mut referenced_facts = HashSet::new();
        rule.when.referenced_facts(&mut referenced_facts);
        let armed = Arc::new(AtomicBool::new(true));
        self.arming.push(RuleArming {
            referenced_facts,
            armed: Arc::clone(&armed),
        });
        self.on_start.extend(rule.on_start);
        self.on_stop.extend(rule.on_stop);

        let when = {
            let group = rule.when.clone();
            let armed = Arc::clone(&armed);
            Box::new(move |facts: &RuleFacts| -> Result<bool> {
                if !group.matches(facts) {
                    // Condition released, the rule may fire again
                    armed.store(true, Ordering::SeqCst);
                    return Ok(false);
                }
                Ok(armed.load(Ordering::SeqCst))
            })
        };

        let then = {
            let facades = self.facades.clone();
            let binding = self.binding.clone();
            let armed = Arc::clone(&armed);
            Box::new(move |facts: &mut RuleFacts| -> Result<()> {
                armed.store(false, Ordering::SeqCst);
                for action in &immediate {
                    run_action(&facades, action, Some(facts))?;
                }
                for (delay_millis, action) in &deferred {
                    let facades = facades.clone();
                    let action = action.clone();
                    let deferred: ScheduledAction =
                        Box::new(move || run_action(&facades, &action, None));
                    binding
                        .scheduler
                        .schedule(&binding.deployment_key, deferred, *delay_millis);
                }
                Ok(())
            })
        };

        Ok(UniformRule::new(rule.name, when, then)
            .with_description(rule.description)
            .with_priority(rule.priority))
    }
}

/// Split a `then` list at its `wait` markers into inline actions and
/// scheduled actions with accumulated delays
fn split_actions(
    rule_name: &str,
    actions: Vec<JsonRuleAction>,
) -> Result<(Vec<JsonRuleAction>, Vec<(u64, JsonRuleAction)>)> {
    let mut immediate = Vec::new();
    let mut deferred = Vec::new();
    let mut delay_millis: u64 = 0;

    for action in actions {
        match action {
            JsonRuleAction::Wait { millis } => {
                delay_millis += millis;
            },
            JsonRuleAction::SetFact { .. } if delay_millis > 0 => {
                return Err(RuleError::Compilation(format!(
                    "'set_fact' cannot follow 'wait' in rule: {}",
                    rule_name
                )));
            },
            action if delay_millis > 0 => deferred.push((delay_millis, action)),
            action => immediate.push(action),
        }
    }

    Ok((immediate, deferred))
}

fn run_action(
    facades: &Facades,
    action: &JsonRuleAction,
    facts: Option<&mut RuleFacts>,
) -> Result<()> {
    match action {
        JsonRuleAction::WriteAttribute {
            asset_id,
            attribute,
            value,
        } => facades.assets.write_attribute(asset_id, attribute, value.clone()),
        JsonRuleAction::Notify { target, message } => {
            facades.notifications.send(target, message)
        },
        JsonRuleAction::SetFact { fact, value } => {
            if let Some(facts) = facts {
                facts.put(fact.clone(), value.clone());
            }
            Ok(())
        },
        JsonRuleAction::Wait { .. } => Ok(()),
    }
}

impl RuleCompiler for JsonCompiler {
    fn compile(&mut self, ruleset: &Ruleset) -> Result<Vec<UniformRule>> {
        let doc: JsonRulesetDoc = serde_json::from_str(&ruleset.rules)
            .map_err(|e| RuleError::Compilation(format!("Invalid rule document: {}", e)))?;

        self.arming.clear();
        self.on_start.clear();
        self.on_stop.clear();

        doc.rules
            .into_iter()
            .map(|rule| self.compile_rule(rule))
            .collect()
    }

    fn start(&mut self, facts: &mut RuleFacts) {
        for action in &self.on_start {
            if let Err(e) = run_action(&self.facades, action, Some(facts)) {
                error!("Start action failed: {}", e);
            }
        }
    }

    fn stop(&mut self, facts: &mut RuleFacts) {
        for action in &self.on_stop {
            if let Err(e) = run_action(&self.facades, action, Some(facts)) {
                error!("Stop action failed: {}", e);
            }
        }
    }

    fn on_asset_states_changed(&mut self, _facts: &mut RuleFacts, event: &AssetStateChangeEvent) {
        let fact_key = event.fact_key();
        for arming in &self.arming {
            if arming.referenced_facts.contains(&fact_key)
                || arming.referenced_facts.contains(&event.attribute)
            {
                arming.armed.store(true, Ordering::SeqCst);
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::scheduler::RuleActionScheduler;
    use crate::types::{RulesetLang, RulesetScope, SystemClock};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn ruleset(doc: serde_json::Value) -> Ruleset {
        Ruleset {
            id: 3,
            name: "json-test".to_string(),
            version: 1,
            lang: RulesetLang::Json,
            rules: doc.to_string(),
            meta: HashMap::new(),
            scope: RulesetScope::Global,
            continue_on_error: false,
            trigger_on_predicted_data: false,
        }
    }

    fn compiler_with(facades: Facades) -> JsonCompiler {
        let scheduler = Arc::new(RuleActionScheduler::new(Arc::new(SystemClock)));
        JsonCompiler::new(
            facades,
            SchedulerBinding {
                scheduler,
                deployment_key: "test".to_string(),
            },
        )
    }

    fn compiler() -> JsonCompiler {
        compiler_with(Facades::noop())
    }

    #[derive(Default)]
    struct RecordingNotifications {
        sent: Mutex<Vec<(String, String)>>,
    }

    impl crate::facade::NotificationsFacade for RecordingNotifications {
        fn send(&self, target: &str, message: &str) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((target.to_string(), message.to_string()));
            Ok(())
        }
    }

    fn doc_with_one_rule(when: serde_json::Value, then: serde_json::Value) -> serde_json::Value {
        json!({ "rules": [{ "name": "r", "when": when, "then": then }] })
    }

    #[test]
    fn test_compiles_rules_with_defaults() {
        let doc = json!({
            "rules": [
                {
                    "name": "low-soc",
                    "description": "Battery needs charging",
                    "priority": 100,
                    "when": { "items": [{ "fact": "soc", "operator": "lte", "value": 20 }] },
                    "then": [{ "type": "set_fact", "fact": "charging", "value": true }]
                },
                {
                    "name": "high-temp",
                    "when": { "items": [{ "fact": "temp", "operator": "gt", "value": 70 }] },
                    "then": [{ "type": "notify", "target": "ops", "message": "overheat" }]
                }
            ]
        });

        let rules = compiler().compile(&ruleset(doc)).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].name, "low-soc");
        assert_eq!(rules[0].priority, 100);
        assert_eq!(rules[1].name, "high-temp");
        assert_eq!(rules[1].priority, DEFAULT_RULE_PRIORITY);
    }

    #[test]
    fn test_malformed_document_fails_compilation() {
        let err = compiler().compile(&ruleset(json!({ "rules": [{ "name": "x" }] }))).unwrap_err();
        assert!(matches!(err, RuleError::Compilation(_)));
    }

    #[test]
    fn test_rule_without_conditions_fails_compilation() {
        let doc = doc_with_one_rule(json!({}), json!([]));
        let err = compiler().compile(&ruleset(doc)).unwrap_err();
        assert!(err.to_string().contains("Rule has no conditions: r"));
    }

    #[test]
    fn test_set_fact_after_wait_fails_compilation() {
        let doc = doc_with_one_rule(
            json!({ "items": [{ "fact": "soc", "operator": "lt", "value": 20 }] }),
            json!([
                { "type": "wait", "millis": 1000 },
                { "type": "set_fact", "fact": "late", "value": 1 }
            ]),
        );
        let err = compiler().compile(&ruleset(doc)).unwrap_err();
        assert!(err.to_string().contains("'set_fact' cannot follow 'wait' in rule: r"));
    }

    #[test]
    fn test_nested_groups_and_or_logic() {
        let doc = doc_with_one_rule(
            json!({
                "operator": "or",
                "items": [{ "fact": "soc", "operator": "lt", "value": 10 }],
                "groups": [{
                    "items": [
                        { "fact": "soc", "operator": "lt", "value": 30 },
                        { "fact": "grid_price", "operator": "lt", "value": 0.1 }
                    ]
                }]
            }),
            json!([{ "type": "set_fact", "fact": "charging", "value": true }]),
        );
        let rules = compiler().compile(&ruleset(doc)).unwrap();

        let mut facts = RuleFacts::new();
        facts.put("soc", json!(25));
        facts.put("grid_price", json!(0.05));
        assert!(rules[0].evaluate(&facts).unwrap());

        facts.put("grid_price", json!(0.5));
        assert!(!rules[0].evaluate(&facts).unwrap());

        facts.put("soc", json!(5));
        assert!(rules[0].evaluate(&facts).unwrap());
    }

    #[test]
    fn test_rule_fires_once_until_condition_releases() {
        let doc = doc_with_one_rule(
            json!({ "items": [{ "fact": "soc", "operator": "lt", "value": 20 }] }),
            json!([{ "type": "set_fact", "fact": "fired", "value": true }]),
        );
        let rules = compiler().compile(&ruleset(doc)).unwrap();

        let mut facts = RuleFacts::new();
        facts.put("soc", json!(10));
        assert!(rules[0].evaluate(&facts).unwrap());
        rules[0].execute(&mut facts).unwrap();

        // Still matching but already fired
        assert!(!rules[0].evaluate(&facts).unwrap());

        // Condition releases, then matches again
        facts.put("soc", json!(50));
        assert!(!rules[0].evaluate(&facts).unwrap());
        facts.put("soc", json!(10));
        assert!(rules[0].evaluate(&facts).unwrap());
    }

    #[test]
    fn test_asset_state_change_rearms_referencing_rules() {
        let doc = doc_with_one_rule(
            json!({ "items": [{ "fact": "battery_01:soc", "operator": "lt", "value": 20 }] }),
            json!([{ "type": "set_fact", "fact": "fired", "value": true }]),
        );
        let mut compiler = compiler();
        let rules = compiler.compile(&ruleset(doc)).unwrap();

        let mut facts = RuleFacts::new();
        facts.put("battery_01:soc", json!(10));
        assert!(rules[0].evaluate(&facts).unwrap());
        rules[0].execute(&mut facts).unwrap();
        assert!(!rules[0].evaluate(&facts).unwrap());

        let event = AssetStateChangeEvent {
            asset_id: "battery_01".to_string(),
            attribute: "soc".to_string(),
        };
        compiler.on_asset_states_changed(&mut facts, &event);
        assert!(rules[0].evaluate(&facts).unwrap());
    }

    #[test]
    fn test_immediate_actions_run_through_facades() {
        let notifications = Arc::new(RecordingNotifications::default());
        let mut facades = Facades::noop();
        facades.notifications = notifications.clone();

        let doc = doc_with_one_rule(
            json!({ "items": [{ "fact": "temp", "operator": "gt", "value": 70 }] }),
            json!([
                { "type": "notify", "target": "ops", "message": "overheat" },
                { "type": "set_fact", "fact": "alarm", "value": true }
            ]),
        );
        let rules = compiler_with(facades).compile(&ruleset(doc)).unwrap();

        let mut facts = RuleFacts::new();
        facts.put("temp", json!(90));
        rules[0].execute(&mut facts).unwrap();

        assert_eq!(facts.get("alarm"), Some(&json!(true)));
        let sent = notifications.sent.lock().unwrap();
        assert_eq!(sent.as_slice(), [("ops".to_string(), "overheat".to_string())]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_deferred_actions_go_through_the_scheduler() {
        let scheduler = Arc::new(RuleActionScheduler::new(Arc::new(SystemClock)));
        let mut compiler = JsonCompiler::new(
            Facades::noop(),
            SchedulerBinding {
                scheduler: Arc::clone(&scheduler),
                deployment_key: "dep".to_string(),
            },
        );

        let doc = doc_with_one_rule(
            json!({ "items": [{ "fact": "temp", "operator": "gt", "value": 70 }] }),
            json!([
                { "type": "wait", "millis": 60000 },
                { "type": "notify", "target": "ops", "message": "still hot" },
                { "type": "wait", "millis": 60000 },
                { "type": "notify", "target": "ops", "message": "escalate" }
            ]),
        );
        let rules = compiler.compile(&ruleset(doc)).unwrap();

        let mut facts = RuleFacts::new();
        facts.put("temp", json!(90));
        rules[0].execute(&mut facts).unwrap();

        assert_eq!(scheduler.pending_count("dep"), 2);
        scheduler.stop("dep").await;
        assert_eq!(scheduler.pending_count("dep"), 0);
    }

    #[test]
    fn test_lifecycle_hooks_run_their_actions() {
        let doc = json!({
            "rules": [{
                "name": "r",
                "when": { "items": [{ "fact": "soc", "operator": "lt", "value": 20 }] },
                "then": [{ "type": "set_fact", "fact": "fired", "value": true }],
                "on_start": [{ "type": "set_fact", "fact": "started", "value": true }],
                "on_stop": [{ "type": "set_fact", "fact": "stopped", "value": true }]
            }]
        });
        let mut compiler = compiler();
        compiler.compile(&ruleset(doc)).unwrap();

        let mut facts = RuleFacts::new();
        compiler.start(&mut facts);
        assert_eq!(facts.get("started"), Some(&json!(true)));
        compiler.stop(&mut facts);
        assert_eq!(facts.get("stopped"), Some(&json!(true)));
    }
}
