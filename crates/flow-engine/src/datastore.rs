//! Data-store schema and data-store node configuration
//!
//! The schema is flow-level and author-time: it declares the tracked
//! variables. Data-store nodes own the runtime logic that recomputes those
//! variables on each turn.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{EntityKind, FlowEngineError, Result};
use crate::formula;
use crate::validation::{IssueCode, ValidationIssue};

/// Declared type of a data-store variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Integer,
}

impl FieldType {
    /// Whether min/max clamping applies to this type
    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldType::Number | FieldType::Integer)
    }

    /// Zero value used when a field has no usable initial value
    pub fn zero_value(&self) -> Value {
        match self {
            FieldType::String => Value::String(String::new()),
            FieldType::Number | FieldType::Integer => Value::from(0),
            FieldType::Boolean => Value::Bool(false),
        }
    }
}

/// A tracked variable declared on the flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataStoreSchemaField {
    /// Stable identity, referenced by data-store fields
    pub id: String,
    /// Variable name used in formulas as `{{name}}`
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub initial_value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Lower clamp bound for numeric fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    /// Upper clamp bound for numeric fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

impl DataStoreSchemaField {
    pub fn new(id: impl Into<String>, name: impl Into<String>, field_type: FieldType, initial_value: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            field_type,
            initial_value,
            description: None,
            min: None,
            max: None,
        }
    }

    /// Set clamp bounds
    pub fn with_bounds(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    /// Initial value coerced to the declared type
    pub fn typed_initial_value(&self) -> Value {
        formula::coerce(&self.initial_value, self.field_type)
            .unwrap_or_else(|_| self.field_type.zero_value())
    }
}

/// The flow-level schema of tracked variables
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataStoreSchema {
    #[serde(default)]
    pub fields: Vec<DataStoreSchemaField>,
}

impl DataStoreSchema {
    pub fn new(fields: Vec<DataStoreSchemaField>) -> Self {
        Self { fields }
    }

    pub fn find_field(&self, id: &str) -> Option<&DataStoreSchemaField> {
        self.fields.iter().find(|f| f.id == id)
    }

    pub fn find_field_by_name(&self, name: &str) -> Option<&DataStoreSchemaField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Values every field starts a session with, keyed by field name
    pub fn initial_values(&self) -> BTreeMap<String, Value> {
        self.fields
            .iter()
            .map(|f| (f.name.clone(), f.typed_initial_value()))
            .collect()
    }
}

/// Runtime logic for one schema field, owned by a data-store node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataStoreField {
    pub id: String,
    /// References [`DataStoreSchemaField::id`]
    pub schema_field_id: String,
    /// Formula producing the field's next value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logic: Option<String>,
}

impl DataStoreField {
    pub fn new(id: impl Into<String>, schema_field_id: impl Into<String>, logic: Option<&str>) -> Self {
        Self {
            id: id.into(),
            schema_field_id: schema_field_id.into(),
            logic: logic.map(str::to_string),
        }
    }
}

/// Data-store node configuration, referenced by DataStore flow nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataStoreNode {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub data_store_fields: Vec<DataStoreField>,
}

impl DataStoreNode {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            data_store_fields: Vec::new(),
        }
    }

    /// Add a field (builder style)
    pub fn with_field(mut self, field: DataStoreField) -> Self {
        self.data_store_fields.push(field);
        self
    }

    /// Whether any field of this node points at `schema_field_id`
    pub fn references(&self, schema_field_id: &str) -> bool {
        self.data_store_fields
            .iter()
            .any(|f| f.schema_field_id == schema_field_id)
    }
}

/// Result of removing a schema field
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemaFieldRemoval {
    /// The removed schema field
    pub removed: Option<DataStoreSchemaField>,
    /// Data-store field ids removed by the cascade
    pub removed_fields: Vec<String>,
    /// Formulas that still mention the deleted variable
    pub invalidated: Vec<ValidationIssue>,
}

/// Remove a schema field, enforcing the reference rule.
///
/// Without `cascade`, removal is refused while any data-store field still
/// references the schema field. With `cascade`, referencing fields are
/// removed and every remaining formula that mentions the deleted variable
/// is reported as invalidated.
pub fn remove_schema_field(
    schema: &mut DataStoreSchema,
    nodes: &mut [DataStoreNode],
    schema_field_id: &str,
    cascade: bool,
) -> Result<SchemaFieldRemoval> {
    let position = schema
        .fields
        .iter()
        .position(|f| f.id == schema_field_id)
        .ok_or_else(|| FlowEngineError::not_found(EntityKind::SchemaField, schema_field_id))?;

    let referencing: Vec<&DataStoreNode> = nodes
        .iter()
        .filter(|n| n.references(schema_field_id))
        .collect();

    if !cascade && !referencing.is_empty() {
        let issues = referencing
            .iter()
            .map(|n| {
                ValidationIssue::error(
                    IssueCode::SchemaFieldInUse,
                    format!(
                        "Schema field '{}' is still used by data-store node '{}'",
                        schema.fields[position].name, n.id
                    ),
                )
            })
            .collect();
        return Err(FlowEngineError::ValidationFailure(issues));
    }

    let removed = schema.fields.remove(position);
    let mut outcome = SchemaFieldRemoval::default();

    for node in nodes.iter_mut() {
        node.data_store_fields.retain(|f| {
            if f.schema_field_id == schema_field_id {
                outcome.removed_fields.push(f.id.clone());
                false
            } else {
                true
            }
        });

        for field in &node.data_store_fields {
            let Some(logic) = field.logic.as_deref() else {
                continue;
            };
            if formula::referenced_variables(logic)
                .iter()
                .any(|v| v == &removed.name)
            {
                outcome.invalidated.push(ValidationIssue::error(
                    IssueCode::InvalidatedFormula,
                    format!(
                        "Field '{}' of data-store node '{}' references deleted variable '{}'",
                        field.id, node.id, removed.name
                    ),
                ));
            }
        }
    }

    log::debug!(
        "Removed schema field '{}' ({} dependent fields, {} invalidated formulas)",
        removed.name,
        outcome.removed_fields.len(),
        outcome.invalidated.len()
    );
    outcome.removed = Some(removed);
    Ok(outcome)
}
