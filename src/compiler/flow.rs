//! Flow-graph compiler
//!
//! The visual editor stores a ruleset as a node collection: trigger nodes
//! predicated on facts, logic gates combining them, action nodes at the
//! sinks, and directed wires in between. Every action node becomes one
//! uniform rule whose condition is the resolved boolean expression of its
//! inputs; wiring an action node into another chains the downstream action
//! behind the upstream one's inputs.
//!
//! The whole graph is validated up front: duplicate ids, dangling wires,
//! cycles, gate arity violations and unconnected action nodes all fail
//! compilation.

use super::{compare_values, CompareOp, RuleCompiler};
use crate::error::{Result, RuleError};
use crate::facade::Facades;
use crate::types::{RuleFacts, Ruleset, UniformRule};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};

// === Graph schema ===

#[derive(Debug, Deserialize)]
struct NodeCollection {
    nodes: Vec<FlowNode>,
    #[serde(default)]
    wires: Vec<FlowWire>,
}

#[derive(Debug, Deserialize)]
struct FlowWire {
    from: String,
    to: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum FlowNode {
    TriggerAttribute {
        id: String,
        fact: String,
        operator: CompareOp,
        value: serde_json::Value,
    },
    LogicAnd {
        id: String,
    },
    LogicOr {
        id: String,
    },
    LogicNot {
        id: String,
    },
    ActionWriteAttribute {
        id: String,
        asset_id: String,
        attribute: String,
        value: serde_json::Value,
    },
    ActionNotify {
        id: String,
        target: String,
        message: String,
    },
}

impl FlowNode {
    fn id(&self) -> &str {
        match self {
            FlowNode::TriggerAttribute { id, .. }
            | FlowNode::LogicAnd { id }
            | FlowNode::LogicOr { id }
            | FlowNode::LogicNot { id }
            | FlowNode::ActionWriteAttribute { id, .. }
            | FlowNode::ActionNotify { id, .. } => id,
        }
    }

    fn is_action(&self) -> bool {
        matches!(
            self,
            FlowNode::ActionWriteAttribute { .. } | FlowNode::ActionNotify { .. }
        )
    }
}

// === Resolved conditions ===

/// Boolean expression resolved from a node's inputs
enum CondExpr {
    Predicate {
        fact: String,
        operator: CompareOp,
        value: serde_json::Value,
    },
    All(Vec<CondExpr>),
    Any(Vec<CondExpr>),
    Not(Box<CondExpr>),
}

impl CondExpr {
    fn matches(&self, facts: &RuleFacts) -> bool {
        match self {
            CondExpr::Predicate {
                fact,
                operator,
                value,
            } => compare_values(facts.get(fact), *operator, value),
            CondExpr::All(inputs) => inputs.iter().all(|c| c.matches(facts)),
            CondExpr::Any(inputs) => inputs.iter().any(|c| c.matches(facts)),
            CondExpr::Not(input) => !input.matches(facts),
        }
    }
}

// === Compiler ===

/// Compiler for the flow-graph format
pub struct FlowCompiler {
    facades: Facades,
}

impl FlowCompiler {
    pub fn new(facades: Facades) -> Self {
        Self { facades }
    }
}

struct Graph<'a> {
    nodes: HashMap<&'a str, &'a FlowNode>,
    // Input node ids per node, in wire order
    inputs: HashMap<&'a str, Vec<&'a str>>,
}

impl<'a> Graph<'a> {
    fn build(collection: &'a NodeCollection) -> Result<Self> {
        let mut nodes: HashMap<&str, &FlowNode> = HashMap::new();
        for node in &collection.nodes {
            if nodes.insert(node.id(), node).is_some() {
                return Err(RuleError::Compilation(format!(
                    "Duplicate node id: {}",
                    node.id()
                )));
            }
        }

        let mut inputs: HashMap<&str, Vec<&str>> = HashMap::new();
        for wire in &collection.wires {
            let from = nodes
                .get_key_value(wire.from.as_str())
                .map(|(id, _)| *id)
                .ok_or_else(|| {
                    RuleError::Compilation(format!("Wire references unknown node: {}", wire.from))
                })?;
            let to = nodes
                .get_key_value(wire.to.as_str())
                .map(|(id, _)| *id)
                .ok_or_else(|| {
                    RuleError::Compilation(format!("Wire references unknown node: {}", wire.to))
                })?;
            if matches!(nodes[to], FlowNode::TriggerAttribute { .. }) {
                return Err(RuleError::Compilation(format!(
                    "Trigger node cannot have inputs: {}",
                    to
                )));
            }
            inputs.entry(to).or_default().push(from);
        }

        let graph = Self { nodes, inputs };
        graph.check_acyclic()?;
        Ok(graph)
    }

    fn check_acyclic(&self) -> Result<()> {
        // 0 = unvisited, 1 = on stack, 2 = done
        let mut state: HashMap<&str, u8> = HashMap::new();
        for &id in self.nodes.keys() {
            self.visit(id, &mut state)?;
        }
        Ok(())
    }

    fn visit(&self, id: &'a str, state: &mut HashMap<&'a str, u8>) -> Result<()> {
        match state.get(id) {
            Some(2) => return Ok(()),
            Some(1) => {
                return Err(RuleError::Compilation(
                    "Flow graph contains a cycle".to_string(),
                ))
            },
            _ => {},
        }
        state.insert(id, 1);
        if let Some(inputs) = self.inputs.get(id) {
            for &input in inputs {
                self.visit(input, state)?;
            }
        }
        state.insert(id, 2);
        Ok(())
    }

    /// Resolve a node into the condition it contributes to downstream sinks
    fn resolve(&self, id: &str) -> Result<CondExpr> {
        let node = self.nodes[id];
        match node {
            FlowNode::TriggerAttribute {
                fact,
                operator,
                value,
                ..
            } => Ok(CondExpr::Predicate {
                fact: fact.clone(),
                operator: *operator,
                value: value.clone(),
            }),
            FlowNode::LogicAnd { id } => Ok(CondExpr::All(self.resolve_inputs(id, 1)?)),
            FlowNode::LogicOr { id } => Ok(CondExpr::Any(self.resolve_inputs(id, 1)?)),
            FlowNode::LogicNot { id } => {
                let mut inputs = self.resolve_inputs(id, 1)?;
                if inputs.len() != 1 {
                    return Err(RuleError::Compilation(format!(
                        "'logic-not' node takes exactly one input: {}",
                        id
                    )));
                }
                Ok(CondExpr::Not(Box::new(inputs.remove(0))))
            },
            // A chained action contributes its own firing condition
            FlowNode::ActionWriteAttribute { id, .. } | FlowNode::ActionNotify { id, .. } => {
                Ok(CondExpr::All(self.resolve_inputs(id, 1)?))
            },
        }
    }

    fn resolve_inputs(&self, id: &str, min: usize) -> Result<Vec<CondExpr>> {
        let inputs = self.inputs.get(id).map(Vec::as_slice).unwrap_or(&[]);
        if inputs.len() < min {
            return Err(RuleError::Compilation(format!(
                "Node has no inputs: {}",
                id
            )));
        }
        inputs.iter().map(|input| self.resolve(input)).collect()
    }
}

impl RuleCompiler for FlowCompiler {
    fn compile(&mut self, ruleset: &Ruleset) -> Result<Vec<UniformRule>> {
        let collection: NodeCollection = serde_json::from_str(&ruleset.rules)
            .map_err(|e| RuleError::Compilation(format!("Invalid node collection: {}", e)))?;

        let graph = Graph::build(&collection)?;

        let mut referenced: HashSet<&str> = HashSet::new();
        for inputs in graph.inputs.values() {
            referenced.extend(inputs.iter().copied());
        }

        let mut rules = Vec::new();
        for node in &collection.nodes {
            let facades = self.facades.clone();
            let then: Box<dyn Fn(&mut RuleFacts) -> Result<()> + Send + Sync> = match node {
                FlowNode::ActionWriteAttribute {
                    asset_id,
                    attribute,
                    value,
                    ..
                } => {
                    let asset_id = asset_id.clone();
                    let attribute = attribute.clone();
                    let value = value.clone();
                    Box::new(move |_facts| {
                        facades
                            .assets
                            .write_attribute(&asset_id, &attribute, value.clone())
                    })
                },
                FlowNode::ActionNotify {
                    target, message, ..
                } => {
                    let target = target.clone();
                    let message = message.clone();
                    Box::new(move |_facts| facades.notifications.send(&target, &message))
                },
                _ => continue,
            };

            let condition = graph.resolve(node.id())?;
            let name = format!("{} - {}", ruleset.name, node.id());
            let when = Box::new(move |facts: &RuleFacts| -> Result<bool> {
                Ok(condition.matches(facts))
            });

            rules.push(UniformRule::new(name, when, then));
        }

        if rules.is_empty() {
            return Err(RuleError::Compilation(
                "Flow graph defines no action nodes".to_string(),
            ));
        }
        // Triggers and gates wired to nothing indicate a broken export
        for node in &collection.nodes {
            if !node.is_action() && !referenced.contains(node.id()) {
                return Err(RuleError::Compilation(format!(
                    "Node is not connected to any action: {}",
                    node.id()
                )));
            }
        }

        Ok(rules)
    }
}
