//! Structured-output schema fields

use serde::{Deserialize, Serialize};

use crate::batch::BatchOutcome;
use crate::error::{EntityKind, FlowEngineError, Result};
use crate::variables::snake_case;

use super::Agent;

/// JSON type of an output field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaFieldType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

/// One field of an agent's structured output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaField {
    /// Snake-case field name; also the variable suffix
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: SchemaFieldType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<String>>,
}

impl SchemaField {
    pub fn new(name: impl Into<String>, field_type: SchemaFieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            description: None,
            required: false,
            minimum: None,
            maximum: None,
            enum_values: None,
        }
    }
}

/// One item of a schema-field batch, keyed by field name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchemaFieldOp {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: Option<SchemaFieldType>,
    pub description: Option<String>,
    pub required: Option<bool>,
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
    pub enum_values: Option<Vec<String>>,
    pub delete: bool,
}

/// Apply a batch of schema-field upserts and deletes to an agent.
///
/// Names are snake-cased before matching, so `"Health Delta"` and
/// `"health_delta"` address the same field.
pub fn apply_schema_field_ops(agent: &mut Agent, ops: &[SchemaFieldOp]) -> BatchOutcome {
    let mut outcome = BatchOutcome::new();
    for (index, op) in ops.iter().enumerate() {
        match apply_one(&mut agent.schema_fields, op) {
            Ok(name) => outcome.success(index, name),
            Err(e) => {
                log::warn!("Schema op {} on agent '{}' failed: {}", index, agent.id, e);
                outcome.failure(index, Some(op.name.clone()), &e);
            }
        }
    }
    outcome
}

fn apply_one(fields: &mut Vec<SchemaField>, op: &SchemaFieldOp) -> Result<String> {
    let name = snake_case(&op.name);
    if name.is_empty() {
        return Err(FlowEngineError::incomplete("schema field name is empty"));
    }
    let position = fields.iter().position(|f| f.name == name);

    if op.delete {
        let at = position.ok_or_else(|| FlowEngineError::not_found(EntityKind::SchemaField, &name))?;
        fields.remove(at);
        return Ok(name);
    }

    let field = match position {
        Some(at) => &mut fields[at],
        None => {
            let field_type = op.field_type.ok_or_else(|| {
                FlowEngineError::incomplete(format!("new schema field '{}' requires a type", name))
            })?;
            fields.push(SchemaField::new(name.clone(), field_type));
            let last = fields.len() - 1;
            &mut fields[last]
        }
    };

    if let Some(field_type) = op.field_type {
        field.field_type = field_type;
    }
    if let Some(description) = &op.description {
        field.description = Some(description.clone());
    }
    if let Some(required) = op.required {
        field.required = required;
    }
    if op.minimum.is_some() {
        field.minimum = op.minimum;
    }
    if op.maximum.is_some() {
        field.maximum = op.maximum;
    }
    if let Some(values) = &op.enum_values {
        field.enum_values = Some(values.clone());
    }
    Ok(name)
}
