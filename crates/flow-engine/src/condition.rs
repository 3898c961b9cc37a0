//! If-node condition evaluation
//!
//! An If node references an [`IfNode`] configuration holding a list of
//! conditions joined by a single logic operator. The evaluated boolean picks
//! the outgoing edge whose source handle is `"true"` or `"false"`.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{FlowEngineError, FormulaError, Result};
use crate::flow::Flow;
use crate::formula::{display, numeric};
use crate::types::{json_kind, FlowEdge, NodeType, HANDLE_FALSE, HANDLE_TRUE};
use crate::variables::VariableLookup;

/// One side of a condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Operand {
    /// Namespaced variable key, e.g. `health` or `narrator.mood`
    Variable { name: String },
    Literal { value: Value },
}

impl Operand {
    pub fn variable(name: impl Into<String>) -> Self {
        Operand::Variable { name: name.into() }
    }

    pub fn literal(value: impl Into<Value>) -> Self {
        Operand::Literal {
            value: value.into(),
        }
    }

    fn resolve<'a>(&'a self, vars: &'a dyn VariableLookup) -> std::result::Result<&'a Value, FormulaError> {
        match self {
            Operand::Variable { name } => vars
                .lookup_value(name)
                .ok_or_else(|| FormulaError::UnresolvedVariable(name.clone())),
            Operand::Literal { value } => Ok(value),
        }
    }
}

/// Comparison applied by a condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    In,
    NotIn,
    IsEmpty,
    IsNotEmpty,
}

impl ConditionOperator {
    /// Whether the operator ignores the right operand
    pub fn is_unary(&self) -> bool {
        matches!(self, ConditionOperator::IsEmpty | ConditionOperator::IsNotEmpty)
    }
}

/// How the conditions of an If node combine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogicOperator {
    #[default]
    And,
    Or,
}

/// A single comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IfCondition {
    pub id: String,
    pub left: Operand,
    pub operator: ConditionOperator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right: Option<Operand>,
}

impl IfCondition {
    pub fn new(id: impl Into<String>, left: Operand, operator: ConditionOperator, right: Operand) -> Self {
        Self {
            id: id.into(),
            left,
            operator,
            right: Some(right),
        }
    }

    /// Condition with no right operand (`isEmpty` / `isNotEmpty`)
    pub fn unary(id: impl Into<String>, left: Operand, operator: ConditionOperator) -> Self {
        Self {
            id: id.into(),
            left,
            operator,
            right: None,
        }
    }
}

/// If-node configuration resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IfNode {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub conditions: Vec<IfCondition>,
    #[serde(default)]
    pub logic_operator: LogicOperator,
}

impl IfNode {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            conditions: Vec::new(),
            logic_operator: LogicOperator::And,
        }
    }

    pub fn with_condition(mut self, condition: IfCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn with_logic(mut self, logic: LogicOperator) -> Self {
        self.logic_operator = logic;
        self
    }
}

/// Evaluate one condition
pub fn evaluate_condition(
    condition: &IfCondition,
    vars: &dyn VariableLookup,
) -> std::result::Result<bool, FormulaError> {
    let left = condition.left.resolve(vars)?;
    let op = condition.operator;

    match op {
        ConditionOperator::IsEmpty => return Ok(is_empty(left)),
        ConditionOperator::IsNotEmpty => return Ok(!is_empty(left)),
        _ => {}
    }

    let right = condition
        .right
        .as_ref()
        .ok_or_else(|| FormulaError::malformed(0, format!("operator {:?} requires a right operand", op)))?
        .resolve(vars)?;

    let result = match op {
        ConditionOperator::Equals => values_equal(left, right),
        ConditionOperator::NotEquals => !values_equal(left, right),
        ConditionOperator::GreaterThan => compare(left, right, op)? == Ordering::Greater,
        ConditionOperator::GreaterThanOrEqual => compare(left, right, op)? != Ordering::Less,
        ConditionOperator::LessThan => compare(left, right, op)? == Ordering::Less,
        ConditionOperator::LessThanOrEqual => compare(left, right, op)? != Ordering::Greater,
        ConditionOperator::Contains => contains(left, right),
        ConditionOperator::NotContains => !contains(left, right),
        ConditionOperator::StartsWith => display(left).starts_with(&display(right)),
        ConditionOperator::EndsWith => display(left).ends_with(&display(right)),
        ConditionOperator::In => contains(right, left),
        ConditionOperator::NotIn => !contains(right, left),
        ConditionOperator::IsEmpty => is_empty(left),
        ConditionOperator::IsNotEmpty => !is_empty(left),
    };
    Ok(result)
}

/// Evaluate all conditions of an If node.
///
/// With no conditions, `AND` holds and `OR` does not.
pub fn evaluate_if_node(
    if_node: &IfNode,
    vars: &dyn VariableLookup,
) -> std::result::Result<bool, FormulaError> {
    let result = match if_node.logic_operator {
        LogicOperator::And => {
            let mut all = true;
            for condition in &if_node.conditions {
                if !evaluate_condition(condition, vars)? {
                    all = false;
                    break;
                }
            }
            all
        }
        LogicOperator::Or => {
            let mut any = false;
            for condition in &if_node.conditions {
                if evaluate_condition(condition, vars)? {
                    any = true;
                    break;
                }
            }
            any
        }
    };
    log::debug!(
        "If node '{}' ({:?}, {} condition(s)) evaluated to {}",
        if_node.id,
        if_node.logic_operator,
        if_node.conditions.len(),
        result
    );
    Ok(result)
}

/// Pick the outgoing edge of an If node for an evaluation result
pub fn select_branch<'a>(flow: &'a Flow, node_id: &str, result: bool) -> Result<&'a FlowEdge> {
    let node = flow.require_node(node_id)?;
    if node.node_type() != NodeType::If {
        return Err(FlowEngineError::type_mismatch(
            node_id,
            NodeType::If.label(),
            node.node_type().label(),
        ));
    }

    let handle = if result { HANDLE_TRUE } else { HANDLE_FALSE };
    flow.outgoing_edges(node_id)
        .find(|e| e.source_handle.as_deref() == Some(handle))
        .ok_or_else(|| {
            FlowEngineError::incomplete(format!(
                "If node '{}' has no '{}' edge",
                node_id, handle
            ))
        })
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

/// Strings compare exactly; numbers (and numeric strings against numbers)
/// compare numerically.
fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Number(_), _) | (_, Value::Number(_)) => match (numeric(left), numeric(right)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
        (Value::Bool(b), Value::String(s)) | (Value::String(s), Value::Bool(b)) => {
            s == if *b { "true" } else { "false" }
        }
        _ => left == right,
    }
}

fn compare(
    left: &Value,
    right: &Value,
    op: ConditionOperator,
) -> std::result::Result<Ordering, FormulaError> {
    if let (Some(a), Some(b)) = (numeric(left), numeric(right)) {
        return a.partial_cmp(&b).ok_or_else(|| type_error(op, left));
    }
    match (left, right) {
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        (Value::Number(_), other) | (other, _) => Err(type_error(op, other)),
    }
}

fn type_error(op: ConditionOperator, found: &Value) -> FormulaError {
    FormulaError::TypeError {
        operation: format!("{:?}", op),
        found: json_kind(found).to_string(),
    }
}

/// Whether `haystack` contains `needle`: element membership for arrays,
/// key membership for objects, substring otherwise.
fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::Array(items) => items.iter().any(|item| values_equal(item, needle)),
        Value::Object(map) => map.contains_key(&display(needle)),
        Value::Null => false,
        other => display(other).contains(&display(needle)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn spec_conditions(logic: LogicOperator) -> IfNode {
        IfNode::new("if-1", "Check")
            .with_logic(logic)
            .with_condition(IfCondition::new(
                "c1",
                Operand::variable("a"),
                ConditionOperator::GreaterThan,
                Operand::literal(5),
            ))
            .with_condition(IfCondition::new(
                "c2",
                Operand::variable("b"),
                ConditionOperator::Equals,
                Operand::literal("x"),
            ))
    }

    #[test]
    fn test_and_or_logic() {
        let and = spec_conditions(LogicOperator::And);
        let or = spec_conditions(LogicOperator::Or);

        let both = vars(&[("a", json!(7)), ("b", json!("x"))]);
        assert!(evaluate_if_node(&and, &both).unwrap());

        let only_a = vars(&[("a", json!(7)), ("b", json!("y"))]);
        assert!(!evaluate_if_node(&and, &only_a).unwrap());
        assert!(evaluate_if_node(&or, &only_a).unwrap());

        let neither = vars(&[("a", json!(3)), ("b", json!("y"))]);
        assert!(!evaluate_if_node(&or, &neither).unwrap());
    }

    #[test]
    fn test_zero_conditions() {
        let empty = HashMap::new();
        assert!(evaluate_if_node(&IfNode::new("i", "n"), &empty).unwrap());
        assert!(!evaluate_if_node(&IfNode::new("i", "n").with_logic(LogicOperator::Or), &empty).unwrap());
    }

    #[test]
    fn test_unresolved_variable() {
        let node = spec_conditions(LogicOperator::And);
        let err = evaluate_if_node(&node, &HashMap::new()).unwrap_err();
        assert_eq!(err.unresolved_variable(), Some("a"));
    }

    #[test]
    fn test_numeric_strings_compare_numerically() {
        let v = vars(&[("hp", json!("12"))]);
        let cond = IfCondition::new(
            "c",
            Operand::variable("hp"),
            ConditionOperator::GreaterThan,
            Operand::literal(9),
        );
        assert!(evaluate_condition(&cond, &v).unwrap());

        let eq = IfCondition::new("c", Operand::variable("hp"), ConditionOperator::Equals, Operand::literal(12.0));
        assert!(evaluate_condition(&eq, &v).unwrap());
    }

    #[test]
    fn test_string_equality_is_case_sensitive() {
        let v = vars(&[("mood", json!("Happy"))]);
        let cond = IfCondition::new("c", Operand::variable("mood"), ConditionOperator::Equals, Operand::literal("happy"));
        assert!(!evaluate_condition(&cond, &v).unwrap());
    }

    #[test]
    fn test_collection_operators() {
        let v = vars(&[("tags", json!(["sword", "shield"])), ("name", json!("Aria Stone"))]);
        let contains = IfCondition::new("c", Operand::variable("tags"), ConditionOperator::Contains, Operand::literal("sword"));
        assert!(evaluate_condition(&contains, &v).unwrap());

        let within = IfCondition::new("c", Operand::literal("bow"), ConditionOperator::NotIn, Operand::variable("tags"));
        assert!(evaluate_condition(&within, &v).unwrap());

        let starts = IfCondition::new("c", Operand::variable("name"), ConditionOperator::StartsWith, Operand::literal("Aria"));
        assert!(evaluate_condition(&starts, &v).unwrap());

        let empty = IfCondition::unary("c", Operand::literal(""), ConditionOperator::IsEmpty);
        assert!(evaluate_condition(&empty, &v).unwrap());
    }

    #[test]
    fn test_ordering_type_error() {
        let cond = IfCondition::new("c", Operand::literal(true), ConditionOperator::LessThan, Operand::literal(1));
        assert!(matches!(
            evaluate_condition(&cond, &HashMap::new()),
            Err(FormulaError::TypeError { .. })
        ));
    }

    #[test]
    fn test_missing_right_operand() {
        let cond = IfCondition::unary("c", Operand::literal(1), ConditionOperator::Equals);
        assert!(matches!(
            evaluate_condition(&cond, &HashMap::new()),
            Err(FormulaError::Malformed { .. })
        ));
    }

    #[test]
    fn test_wire_format() {
        let node: IfNode = serde_json::from_value(json!({
            "id": "if-1",
            "name": "Alive?",
            "logicOperator": "OR",
            "conditions": [{
                "id": "c1",
                "left": {"kind": "variable", "name": "health"},
                "operator": "greaterThanOrEqual",
                "right": {"kind": "literal", "value": 1}
            }]
        }))
        .unwrap();
        assert_eq!(node.logic_operator, LogicOperator::Or);
        assert_eq!(node.conditions[0].operator, ConditionOperator::GreaterThanOrEqual);
    }
}
