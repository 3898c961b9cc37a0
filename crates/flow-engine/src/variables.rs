//! Variable registry
//!
//! A per-turn, read-only catalog of every value formulas and conditions can
//! reference. It has three partitions:
//!
//! - **System**: fixed names supplied by the host (character, user, history count, ...)
//! - **DataStore**: one entry per schema field, keyed by the field name
//! - **AgentOutput**: one entry per `(namespace, schema field)` of agents with
//!   structured output enabled, keyed `namespace.field`, plus the free-text
//!   reply of each agent keyed `namespace.text`
//!
//! Lookup is a flat map. When two entries share a key, one with a bound value
//! beats one without. Otherwise the winner is chosen by
//! [`VariableSource::priority`]: DataStore beats AgentOutput, which beats
//! System. Losing entries are kept in [`VariableRegistry::shadowed`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};

use crate::agent::{Agent, SchemaFieldType};
use crate::datastore::{DataStoreSchema, FieldType};

/// Anything formulas can read variables from
pub trait VariableLookup {
    /// Resolve a variable key to its current value
    fn lookup_value(&self, key: &str) -> Option<&Value>;
}

impl VariableLookup for HashMap<String, Value> {
    fn lookup_value(&self, key: &str) -> Option<&Value> {
        self.get(key)
    }
}

impl VariableLookup for BTreeMap<String, Value> {
    fn lookup_value(&self, key: &str) -> Option<&Value> {
        self.get(key)
    }
}

/// Partition a variable belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VariableSource {
    System,
    DataStore,
    AgentOutput,
}

impl VariableSource {
    /// Higher wins on key collisions
    pub fn priority(&self) -> u8 {
        match self {
            VariableSource::DataStore => 3,
            VariableSource::AgentOutput => 2,
            VariableSource::System => 1,
        }
    }
}

/// Declared type of a variable, as far as the catalog knows it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VariableType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
    Unknown,
}

impl From<FieldType> for VariableType {
    fn from(t: FieldType) -> Self {
        match t {
            FieldType::String => VariableType::String,
            FieldType::Number => VariableType::Number,
            FieldType::Integer => VariableType::Integer,
            FieldType::Boolean => VariableType::Boolean,
        }
    }
}

impl From<SchemaFieldType> for VariableType {
    fn from(t: SchemaFieldType) -> Self {
        match t {
            SchemaFieldType::String => VariableType::String,
            SchemaFieldType::Number => VariableType::Number,
            SchemaFieldType::Integer => VariableType::Integer,
            SchemaFieldType::Boolean => VariableType::Boolean,
            SchemaFieldType::Array => VariableType::Array,
            SchemaFieldType::Object => VariableType::Object,
        }
    }
}

/// One catalog entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableEntry {
    /// Flat lookup key (`name` or `namespace.field`)
    pub key: String,
    pub source: VariableSource,
    pub value_type: VariableType,
    /// Bound value; `None` when the variable exists but has no value this turn
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl VariableEntry {
    fn rank(&self) -> (bool, u8) {
        (self.value.is_some(), self.source.priority())
    }
}

/// Namespaced catalog of system, data-store and agent-output variables
#[derive(Debug, Clone, Default)]
pub struct VariableRegistry {
    entries: BTreeMap<String, VariableEntry>,
    shadowed: Vec<VariableEntry>,
}

impl VariableRegistry {
    /// Start building a registry
    pub fn builder() -> VariableRegistryBuilder {
        VariableRegistryBuilder::default()
    }

    /// Find the winning entry for a key
    pub fn lookup(&self, key: &str) -> Option<&VariableEntry> {
        self.entries.get(key)
    }

    /// Bound value for a key
    pub fn value(&self, key: &str) -> Option<&Value> {
        self.entries.get(key).and_then(|e| e.value.as_ref())
    }

    /// Whether the key is defined in any partition
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// All winning entries, ordered by key
    pub fn entries(&self) -> impl Iterator<Item = &VariableEntry> {
        self.entries.values()
    }

    /// Keys whose winning entry comes from `source`
    pub fn keys_for(&self, source: VariableSource) -> Vec<&str> {
        self.entries
            .values()
            .filter(|e| e.source == source)
            .map(|e| e.key.as_str())
            .collect()
    }

    /// Entries that lost a key collision
    pub fn shadowed(&self) -> &[VariableEntry] {
        &self.shadowed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl VariableLookup for VariableRegistry {
    fn lookup_value(&self, key: &str) -> Option<&Value> {
        self.value(key)
    }
}

/// Field name under which an agent's free-text reply is published
pub const TEXT_FIELD: &str = "text";

/// Builder collecting partitions before collisions are resolved
#[derive(Debug, Default)]
pub struct VariableRegistryBuilder {
    pending: Vec<VariableEntry>,
}

impl VariableRegistryBuilder {
    /// Add the host-supplied system variables
    pub fn system(mut self, values: &BTreeMap<String, Value>) -> Self {
        for (key, value) in values {
            self.pending.push(VariableEntry {
                key: key.clone(),
                source: VariableSource::System,
                value_type: type_of(value),
                value: Some(value.clone()),
                description: None,
            });
        }
        self
    }

    /// Add one entry per schema field; `current` overrides initial values
    pub fn data_store(
        mut self,
        schema: Option<&DataStoreSchema>,
        current: &BTreeMap<String, Value>,
    ) -> Self {
        let Some(schema) = schema else {
            return self;
        };
        for field in &schema.fields {
            let value = current
                .get(&field.name)
                .cloned()
                .unwrap_or_else(|| field.typed_initial_value());
            self.pending.push(VariableEntry {
                key: field.name.clone(),
                source: VariableSource::DataStore,
                value_type: field.field_type.into(),
                value: Some(value),
                description: field.description.clone(),
            });
        }
        self
    }

    /// Add the output fields of one agent.
    ///
    /// Agents without structured output contribute nothing. `output` is this
    /// turn's structured output, when the agent has already run.
    pub fn agent_output(mut self, agent: &Agent, output: Option<&Map<String, Value>>) -> Self {
        if !agent.enable_structured_output {
            return self;
        }
        let namespace = agent.namespace();
        for field in &agent.schema_fields {
            self.pending.push(VariableEntry {
                key: format!("{}.{}", namespace, field.name),
                source: VariableSource::AgentOutput,
                value_type: field.field_type.into(),
                value: output.and_then(|o| o.get(&field.name)).cloned(),
                description: field.description.clone(),
            });
        }
        self
    }

    /// Add the free-text reply of one agent as `namespace.text`.
    ///
    /// Skipped when the agent declares a structured field named `text`,
    /// which then owns the key.
    pub fn agent_text(mut self, agent: &Agent, text: Option<&str>) -> Self {
        let shadowed_by_schema = agent.enable_structured_output
            && agent.schema_fields.iter().any(|f| f.name == TEXT_FIELD);
        if shadowed_by_schema {
            return self;
        }
        self.pending.push(VariableEntry {
            key: format!("{}.{}", agent.namespace(), TEXT_FIELD),
            source: VariableSource::AgentOutput,
            value_type: VariableType::String,
            value: text.map(|t| Value::String(t.to_string())),
            description: None,
        });
        self
    }

    /// Resolve collisions and freeze the registry
    pub fn build(self) -> VariableRegistry {
        let mut registry = VariableRegistry::default();
        for entry in self.pending {
            match registry.entries.get(&entry.key) {
                Some(existing) if existing.rank() >= entry.rank() => {
                    log::debug!(
                        "Variable '{}' from {:?} shadowed by {:?}",
                        entry.key,
                        entry.source,
                        existing.source
                    );
                    registry.shadowed.push(entry);
                }
                _ => {
                    if let Some(previous) = registry.entries.insert(entry.key.clone(), entry) {
                        log::debug!(
                            "Variable '{}' from {:?} shadowed by higher-priority source",
                            previous.key,
                            previous.source
                        );
                        registry.shadowed.push(previous);
                    }
                }
            }
        }
        registry
    }
}

fn type_of(value: &Value) -> VariableType {
    match value {
        Value::String(_) => VariableType::String,
        Value::Number(n) if n.is_i64() || n.is_u64() => VariableType::Integer,
        Value::Number(_) => VariableType::Number,
        Value::Bool(_) => VariableType::Boolean,
        Value::Array(_) => VariableType::Array,
        Value::Object(_) => VariableType::Object,
        Value::Null => VariableType::Unknown,
    }
}

/// Convert a display name to the snake_case form used for namespaces and
/// output field names: `"Story Narrator"` → `story_narrator`.
pub fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut prev_lower_or_digit = false;
    let mut pending_sep = false;

    for ch in name.trim().chars() {
        if ch.is_alphanumeric() {
            if ch.is_uppercase() && prev_lower_or_digit {
                pending_sep = true;
            }
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.extend(ch.to_lowercase());
            prev_lower_or_digit = ch.is_lowercase() || ch.is_numeric();
        } else {
            pending_sep = true;
            prev_lower_or_digit = false;
        }
    }
    out
}
