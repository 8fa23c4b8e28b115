//! Schema definitions bound to a contract version.
//!
//! A [`SchemaDefinition`] names an artifact shape (e.g. `OrderRequest`) at a
//! specific [`ContractVersion`] and maps each field name to a [`FieldSpec`].
//! Definitions are produced by the shared contract package and loaded at
//! startup; this crate never generates them.

use super::version::ContractVersion;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

// ─────────────────────────────────────────────────────────────────────────────
// Field types
// ─────────────────────────────────────────────────────────────────────────────

/// JSON-level type of a contract field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    /// Whole numbers only (`1`, `-4`); `1.5` is rejected.
    Integer,
    /// Any JSON number.
    Number,
    Boolean,
    Object,
    Array,
    /// Accepts every JSON value, including `null`.
    Any,
}

impl FieldType {
    /// Whether `value` conforms to this type.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
            FieldType::Any => true,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Object => "object",
            FieldType::Array => "array",
            FieldType::Any => "any",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Field spec
// ─────────────────────────────────────────────────────────────────────────────

/// Shape of one field: its type, whether it must be present, and the value
/// filled in when it is absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, rename = "default", skip_serializing_if = "Option::is_none")]
    pub default_if_missing: Option<Value>,
}

impl FieldSpec {
    /// A required field with no default.
    pub fn required(field_type: FieldType) -> Self {
        Self {
            field_type,
            required: true,
            default_if_missing: None,
        }
    }

    /// An optional field with no default.
    pub fn optional(field_type: FieldType) -> Self {
        Self {
            field_type,
            required: false,
            default_if_missing: None,
        }
    }

    /// Builder: attach a default used when the field is absent.
    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default_if_missing = Some(value.into());
        self
    }

    /// A field that must come from the payload: required with no default.
    pub fn is_hard_required(&self) -> bool {
        self.required && self.default_if_missing.is_none()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Schema definition
// ─────────────────────────────────────────────────────────────────────────────

/// A named artifact shape at one contract version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    pub name: String,
    pub version: ContractVersion,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldSpec>,
}

impl SchemaDefinition {
    /// Create an empty schema for `name` at `version`.
    pub fn new(name: impl Into<String>, version: ContractVersion) -> Self {
        Self {
            name: name.into(),
            version,
            fields: BTreeMap::new(),
        }
    }

    /// Builder: add or replace a field.
    pub fn with_field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        self.fields.insert(name.into(), spec);
        self
    }

    /// Fields the payload itself must supply (required and without default).
    pub fn hard_required_fields(&self) -> BTreeSet<&str> {
        self.fields
            .iter()
            .filter(|(_, spec)| spec.is_hard_required())
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Every field marked `required`, defaulted or not.
    pub fn required_fields(&self) -> BTreeSet<&str> {
        self.fields
            .iter()
            .filter(|(_, spec)| spec.required)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}
