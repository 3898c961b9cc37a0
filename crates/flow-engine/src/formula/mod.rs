//! Data-store formula resolver
//!
//! Each data-store field carries a `logic` string in a small template
//! language: `{{name}}` reads a data-store variable, `{{agent.field}}` reads
//! an agent output, and values combine with `+ - * /` and a fixed set of
//! functions (`min`, `max`, `clamp`, `abs`, `round`, `floor`, `ceil`).
//!
//! Two update idioms are plain expressions in this language:
//!
//! - direct override: `{{narrator.mood}}`
//! - delta accumulation: `{{health}}+{{narrator.health_delta}}`
//!
//! Evaluation is sandboxed: formulas are parsed into an [`Expr`] tree and
//! walked, nothing is handed to a general-purpose evaluator.

mod lexer;
mod parser;

pub use parser::{parse, BinaryOp, Expr, Function};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::datastore::{DataStoreNode, DataStoreSchema, DataStoreSchemaField, FieldType};
use crate::error::FormulaError;
use crate::variables::VariableLookup;

/// Evaluate a formula against the given bindings
pub fn evaluate(logic: &str, vars: &dyn VariableLookup) -> Result<Value, FormulaError> {
    let expr = parse(logic)?;
    eval(&expr, vars)
}

/// How `+` treats string operands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Concat {
    /// Numeric strings add as numbers; `"007" + "1"` is `8`
    Numeric,
    /// Any string operand makes `+` concatenate; `"007" + "1"` is `"0071"`
    Text,
}

/// Evaluate a parsed expression.
///
/// Numeric strings take part in arithmetic, so `+` on two of them adds.
/// Use [`eval_with`] and [`Concat::Text`] to concatenate instead.
pub fn eval(expr: &Expr, vars: &dyn VariableLookup) -> Result<Value, FormulaError> {
    eval_with(expr, vars, Concat::Numeric)
}

pub fn eval_with(expr: &Expr, vars: &dyn VariableLookup, concat: Concat) -> Result<Value, FormulaError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Variable(name) => vars
            .lookup_value(name)
            .cloned()
            .ok_or_else(|| FormulaError::UnresolvedVariable(name.clone())),
        Expr::Negate(inner) => {
            let value = eval_with(inner, vars, concat)?;
            number_value(-as_number(&value, "-")?)
        }
        Expr::Binary { op, left, right } => {
            let left = eval_with(left, vars, concat)?;
            let right = eval_with(right, vars, concat)?;
            binary(*op, &left, &right, concat)
        }
        Expr::Call { function, args } => {
            let values = args
                .iter()
                .map(|a| eval_with(a, vars, concat).and_then(|v| as_number(&v, function.name())))
                .collect::<Result<Vec<f64>, _>>()?;
            call(*function, &values)
        }
    }
}

fn binary(op: BinaryOp, left: &Value, right: &Value, concat: Concat) -> Result<Value, FormulaError> {
    if op == BinaryOp::Add && (left.is_string() || right.is_string()) {
        let both_numeric = numeric(left).is_some() && numeric(right).is_some();
        if concat == Concat::Text || !both_numeric {
            return Ok(Value::String(format!("{}{}", display(left), display(right))));
        }
    }

    let l = as_number(left, op.symbol())?;
    let r = as_number(right, op.symbol())?;
    let result = match op {
        BinaryOp::Add => l + r,
        BinaryOp::Subtract => l - r,
        BinaryOp::Multiply => l * r,
        BinaryOp::Divide => {
            if r == 0.0 {
                return Err(FormulaError::DivisionByZero);
            }
            l / r
        }
    };
    number_value(result)
}

fn call(function: Function, args: &[f64]) -> Result<Value, FormulaError> {
    let result = match function {
        Function::Min => args.iter().copied().fold(f64::INFINITY, f64::min),
        Function::Max => args.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        Function::Clamp => {
            let (value, lo, hi) = (args[0], args[1], args[2]);
            if lo > hi {
                return Err(FormulaError::TypeError {
                    operation: "clamp".to_string(),
                    found: format!("lower bound {} above upper bound {}", lo, hi),
                });
            }
            value.clamp(lo, hi)
        }
        Function::Abs => args[0].abs(),
        Function::Round => args[0].round(),
        Function::Floor => args[0].floor(),
        Function::Ceil => args[0].ceil(),
    };
    number_value(result)
}

/// Numeric view of a value: numbers, and strings that parse as numbers
pub(crate) fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        _ => None,
    }
}

fn as_number(value: &Value, operation: &str) -> Result<f64, FormulaError> {
    numeric(value).ok_or_else(|| FormulaError::TypeError {
        operation: operation.to_string(),
        found: crate::types::json_kind(value).to_string(),
    })
}

/// Build a JSON number, preferring an integer representation
pub(crate) fn number_value(n: f64) -> Result<Value, FormulaError> {
    if !n.is_finite() {
        return Err(FormulaError::TypeError {
            operation: "number".to_string(),
            found: n.to_string(),
        });
    }
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        return Ok(Value::from(n as i64));
    }
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .ok_or_else(|| FormulaError::TypeError {
            operation: "number".to_string(),
            found: n.to_string(),
        })
}

/// Render a value the way it appears inside text
pub fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Coerce a value to a declared field type
pub fn coerce(value: &Value, field_type: FieldType) -> Result<Value, FormulaError> {
    let mismatch = || FormulaError::TypeError {
        operation: format!("convert to {:?}", field_type).to_lowercase(),
        found: crate::types::json_kind(value).to_string(),
    };

    match field_type {
        FieldType::String => Ok(Value::String(display(value))),
        FieldType::Number => numeric(value).ok_or_else(mismatch).and_then(number_value),
        FieldType::Integer => numeric(value)
            .ok_or_else(mismatch)
            .map(f64::round)
            .and_then(number_value),
        FieldType::Boolean => match value {
            Value::Bool(b) => Ok(Value::Bool(*b)),
            Value::Number(n) => Ok(Value::Bool(n.as_f64().is_some_and(|n| n != 0.0))),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Ok(Value::Bool(true)),
                "false" | "no" | "0" | "" => Ok(Value::Bool(false)),
                _ => Err(mismatch()),
            },
            _ => Err(mismatch()),
        },
    }
}

/// Clamp a numeric value into `[min, max]`; other values pass through
pub fn clamp(value: Value, min: Option<f64>, max: Option<f64>) -> Value {
    let Some(n) = numeric(&value) else {
        return value;
    };
    let mut clamped = n;
    if let Some(lo) = min {
        clamped = clamped.max(lo);
    }
    if let Some(hi) = max {
        clamped = clamped.min(hi);
    }
    if clamped == n {
        return value;
    }
    number_value(clamped).unwrap_or(value)
}

/// Substitute every `{{variable}}` in free text
pub fn render_template(template: &str, vars: &dyn VariableLookup) -> Result<String, FormulaError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    let mut consumed = 0;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let close = after
            .find("}}")
            .ok_or_else(|| FormulaError::malformed(consumed + open, "unterminated '{{'"))?;
        let name = after[..close].trim();
        let value = vars
            .lookup_value(name)
            .ok_or_else(|| FormulaError::UnresolvedVariable(name.to_string()))?;
        out.push_str(&display(value));

        let advance = open + 2 + close + 2;
        consumed += advance;
        rest = &rest[advance..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Variable names mentioned in a logic string, in order of first use.
///
/// Works on both expressions and free-text templates.
pub fn referenced_variables(logic: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    let mut rest = logic;
    while let Some(open) = rest.find("{{") {
        let after = &rest[open + 2..];
        let Some(close) = after.find("}}") else {
            break;
        };
        let name = after[..close].trim();
        if !name.is_empty() && !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
        rest = &after[close + 2..];
    }
    names
}

/// Compute the next value of one field.
///
/// Empty logic keeps `current`. String fields whose logic is not a valid
/// expression are rendered as templates, and `+` on a string operand always
/// concatenates for them. Numeric results are clamped to the schema field's
/// bounds; Integer fields clamp to the whole numbers inside them.
pub fn resolve_field(
    logic: Option<&str>,
    field: &DataStoreSchemaField,
    current: Option<&Value>,
    vars: &dyn VariableLookup,
) -> Result<Value, FormulaError> {
    let logic = logic.map(str::trim).unwrap_or_default();
    if logic.is_empty() {
        return Ok(current.cloned().unwrap_or_else(|| field.typed_initial_value()));
    }

    let concat = if field.field_type == FieldType::String {
        Concat::Text
    } else {
        Concat::Numeric
    };
    let raw = match parse(logic) {
        Ok(expr) => eval_with(&expr, vars, concat)?,
        Err(FormulaError::Malformed { .. }) if field.field_type == FieldType::String => {
            Value::String(render_template(logic, vars)?)
        }
        Err(e) => return Err(e),
    };

    let typed = coerce(&raw, field.field_type)?;
    if field.field_type.is_numeric() {
        let (min, max) = match field.field_type {
            FieldType::Integer => (field.min.map(f64::ceil), field.max.map(f64::floor)),
            _ => (field.min, field.max),
        };
        coerce(&clamp(typed, min, max), field.field_type)
    } else {
        Ok(typed)
    }
}

/// Why a field could not be recomputed
#[derive(Debug, Clone, PartialEq)]
pub enum FieldFailureReason {
    /// The field points at a schema field that does not exist
    UnknownSchemaField(String),
    /// The formula could not be evaluated
    Formula(FormulaError),
}

/// Failure to recompute one field; the field keeps its current value
#[derive(Debug, Clone, PartialEq)]
pub struct FieldFailure {
    pub field_id: String,
    pub reason: FieldFailureReason,
}

/// Outcome of running one data-store node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataStoreResolution {
    /// Complete next state, keyed by field name
    pub values: BTreeMap<String, Value>,
    /// Names of fields whose value changed
    pub changed: Vec<String>,
    #[serde(skip)]
    pub failures: Vec<FieldFailure>,
}

impl DataStoreResolution {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Recompute every field of a data-store node.
///
/// All fields read the same pre-update snapshot (`vars`), so field order
/// within a node does not matter. Failures are collected per field.
pub fn resolve_data_store_node(
    schema: &DataStoreSchema,
    node: &DataStoreNode,
    current: &BTreeMap<String, Value>,
    vars: &dyn VariableLookup,
) -> DataStoreResolution {
    let mut resolution = DataStoreResolution {
        values: current.clone(),
        ..Default::default()
    };

    for field in &node.data_store_fields {
        let Some(schema_field) = schema.find_field(&field.schema_field_id) else {
            resolution.failures.push(FieldFailure {
                field_id: field.id.clone(),
                reason: FieldFailureReason::UnknownSchemaField(field.schema_field_id.clone()),
            });
            continue;
        };

        let previous = current.get(&schema_field.name);
        match resolve_field(field.logic.as_deref(), schema_field, previous, vars) {
            Ok(next) => {
                if previous != Some(&next) {
                    resolution.changed.push(schema_field.name.clone());
                }
                resolution.values.insert(schema_field.name.clone(), next);
            }
            Err(err) => {
                log::warn!(
                    "Data-store node '{}' field '{}' ({}): {}",
                    node.id,
                    field.id,
                    schema_field.name,
                    err
                );
                resolution.failures.push(FieldFailure {
                    field_id: field.id.clone(),
                    reason: FieldFailureReason::Formula(err),
                });
            }
        }
    }

    resolution
}
