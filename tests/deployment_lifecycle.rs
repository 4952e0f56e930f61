//! Integration tests for the ruleset deployment lifecycle
//!
//! Exercises compilation of all four authoring formats through the public
//! API, the error and continue-on-error matrix, and the interaction between
//! deferred rule actions and deployment teardown.

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use beacon_rules::{
    Clock, Facades, RuleActionScheduler, RuleFacts, Ruleset, RulesetDeployment, RulesetLang,
    RulesetScope, RulesetStatus, ScriptRuntime, SystemClock, DEFAULT_RULE_PRIORITY,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

fn ruleset(id: i64, lang: RulesetLang, rules: String) -> Ruleset {
    Ruleset {
        id,
        name: format!("ruleset-{}", id),
        version: 1,
        lang,
        rules,
        meta: HashMap::new(),
        scope: RulesetScope::Global,
        continue_on_error: false,
        trigger_on_predicted_data: false,
    }
}

fn deploy(ruleset: Ruleset) -> (RulesetDeployment, Arc<RuleActionScheduler>) {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let scheduler = Arc::new(RuleActionScheduler::new(Arc::clone(&clock)));
    let deployment = RulesetDeployment::new(
        ruleset,
        clock,
        Arc::clone(&scheduler),
        Facades::noop(),
        Arc::new(ScriptRuntime::new()),
    );
    (deployment, scheduler)
}

fn script_source() -> String {
    r#"
        rules = (
            ("low_soc", "soc <= 20", "set_fact(\"alarm\", true)", 500, "Low battery"),
            ("high_temp", "temp > 70", "notify(\"ops\", \"overheat\")")
        );
    "#
    .to_string()
}

fn dsl_source() -> String {
    r#"
        rule("low_soc", "soc <= 20", "set_fact(\"alarm\", true)");
        rule_full("high_temp", "Overheat watch", 500, "temp > 70", "notify(\"ops\", \"overheat\")");
    "#
    .to_string()
}

fn json_source() -> String {
    json!({
        "rules": [
            {
                "name": "low_soc",
                "priority": 500,
                "when": { "items": [{ "fact": "soc", "operator": "lte", "value": 20 }] },
                "then": [{ "type": "set_fact", "fact": "alarm", "value": true }]
            },
            {
                "name": "high_temp",
                "when": { "items": [{ "fact": "temp", "operator": "gt", "value": 70 }] },
                "then": [{ "type": "notify", "target": "ops", "message": "overheat" }]
            }
        ]
    })
    .to_string()
}

fn flow_source() -> String {
    json!({
        "nodes": [
            { "type": "trigger-attribute", "id": "t1", "fact": "soc", "operator": "lte", "value": 20 },
            { "type": "action-notify", "id": "a1", "target": "ops", "message": "low battery" }
        ],
        "wires": [{ "from": "t1", "to": "a1" }]
    })
    .to_string()
}

#[test]
fn test_all_formats_compile_to_uniform_rules() {
    for (lang, source) in [
        (RulesetLang::Script, script_source()),
        (RulesetLang::Dsl, dsl_source()),
        (RulesetLang::Json, json_source()),
        (RulesetLang::Flow, flow_source()),
    ] {
        let (mut deployment, _scheduler) = deploy(ruleset(1, lang, source));
        assert!(deployment.compile(), "{:?} should compile", lang);
        assert!(!deployment.rules().is_empty());
        assert_eq!(deployment.status(), RulesetStatus::Ready);
        assert!(!deployment.is_error());
    }
}

#[test]
fn test_script_and_dsl_agree_on_rule_structure() {
    let (mut script, _s1) = deploy(ruleset(1, RulesetLang::Script, script_source()));
    let (mut dsl, _s2) = deploy(ruleset(2, RulesetLang::Dsl, dsl_source()));
    assert!(script.compile());
    assert!(dsl.compile());

    let script_names: Vec<&str> = script.rules().iter().map(|r| r.name.as_str()).collect();
    let dsl_names: Vec<&str> = dsl.rules().iter().map(|r| r.name.as_str()).collect();
    assert_eq!(script_names, ["low_soc", "high_temp"]);
    assert_eq!(dsl_names, ["low_soc", "high_temp"]);
}

#[test]
fn test_recompiling_the_same_source_is_deterministic() {
    let (mut first, _s1) = deploy(ruleset(1, RulesetLang::Json, json_source()));
    let (mut second, _s2) = deploy(ruleset(1, RulesetLang::Json, json_source()));
    assert!(first.compile());
    assert!(second.compile());

    let lhs: Vec<(String, i32)> = first
        .rules()
        .iter()
        .map(|r| (r.name.clone(), r.priority))
        .collect();
    let rhs: Vec<(String, i32)> = second
        .rules()
        .iter()
        .map(|r| (r.name.clone(), r.priority))
        .collect();
    assert_eq!(lhs, rhs);
    assert_eq!(lhs, [("low_soc".to_string(), 500), ("high_temp".to_string(), DEFAULT_RULE_PRIORITY)]);
}

#[test]
fn test_compiled_rules_fire_against_facts() {
    let (mut deployment, _scheduler) = deploy(ruleset(1, RulesetLang::Script, script_source()));
    assert!(deployment.compile());

    let mut facts = RuleFacts::new();
    facts.put("soc", json!(15));
    facts.put("temp", json!(40));

    let fired: Vec<&str> = deployment
        .rules()
        .iter()
        .filter(|r| r.evaluate(&facts).unwrap())
        .map(|r| r.name.as_str())
        .collect();
    assert_eq!(fired, ["low_soc"]);

    let low_soc = deployment.rules().iter().next().unwrap();
    low_soc.execute(&mut facts).unwrap();
    assert_eq!(facts.get("alarm"), Some(&json!(true)));
}

#[test]
fn test_compilation_error_is_sticky() {
    let (mut deployment, _scheduler) = deploy(ruleset(
        1,
        RulesetLang::Script,
        r#"rules = (("broken", "(soc", "1"));"#.to_string(),
    ));
    assert!(!deployment.compile());
    assert_eq!(deployment.status(), RulesetStatus::CompilationError);
    assert!(deployment.is_error());
    assert!(deployment.error_message().is_some());

    // Still refuses after the first failure
    assert!(!deployment.compile());
    assert!(deployment.rules().is_empty());
}

#[test]
fn test_continue_on_error_matrix() {
    let mut rs = ruleset(1, RulesetLang::Dsl, dsl_source());
    rs.continue_on_error = true;
    let (mut deployment, _scheduler) = deploy(rs);
    assert!(deployment.compile());

    deployment.set_status(RulesetStatus::ExecutionError);
    assert!(!deployment.is_error());

    deployment.set_status(RulesetStatus::LoopError);
    assert!(deployment.is_error());
}

#[test]
fn test_sandboxed_format_rejects_interpreter_builtins() {
    // The open script format may use builtins, the sandboxed one may not
    let source = r#"rule("probe", "len(\"abc\") > 0", "1");"#.to_string();
    let (mut deployment, _scheduler) = deploy(ruleset(1, RulesetLang::Dsl, source));
    assert!(deployment.compile());

    let facts = RuleFacts::new();
    let probe = deployment.rules().iter().next().unwrap();
    assert!(probe.evaluate(&facts).is_err());

    let source = r#"rules = (("probe", "len(\"abc\") > 0", "1"));"#.to_string();
    let (mut deployment, _scheduler) = deploy(ruleset(2, RulesetLang::Script, source));
    assert!(deployment.compile());
    let probe = deployment.rules().iter().next().unwrap();
    assert!(probe.evaluate(&facts).unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stopping_a_deployment_cancels_its_deferred_actions() {
    let source = json!({
        "rules": [{
            "name": "escalate",
            "when": { "items": [{ "fact": "temp", "operator": "gt", "value": 70 }] },
            "then": [
                { "type": "notify", "target": "ops", "message": "overheat" },
                { "type": "wait", "millis": 60000 },
                { "type": "notify", "target": "ops", "message": "still overheating" }
            ]
        }]
    })
    .to_string();

    let (mut deployment, scheduler) = deploy(ruleset(1, RulesetLang::Json, source));
    assert!(deployment.compile());
    let key = deployment.deployment_key();

    let mut facts = RuleFacts::new();
    facts.put("temp", json!(90));
    deployment.start(&mut facts);

    let rule = deployment.rules().iter().next().unwrap();
    assert!(rule.evaluate(&facts).unwrap());
    rule.execute(&mut facts).unwrap();
    assert_eq!(scheduler.pending_count(&key), 1);

    deployment.stop(&mut facts).await;
    assert_eq!(scheduler.pending_count(&key), 0);
    assert_eq!(deployment.status(), RulesetStatus::Paused);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_deferred_write_and_stop_are_mutually_exclusive() {
    // Repeatedly race a zero-delay deferred action against stop; the action
    // must either fire before the teardown or not at all
    for _ in 0..20 {
        let source =
            r#"rules = (("defer", "true", "defer_write(0, \"a1\", \"setpoint\", 1)"));"#.to_string();
        let (mut deployment, scheduler) = deploy(ruleset(1, RulesetLang::Script, source));
        assert!(deployment.compile());
        let key = deployment.deployment_key();

        let mut facts = RuleFacts::new();
        let rule = deployment.rules().iter().next().unwrap();
        rule.execute(&mut facts).unwrap();

        deployment.stop(&mut facts).await;
        assert_eq!(scheduler.pending_count(&key), 0);
    }
}
