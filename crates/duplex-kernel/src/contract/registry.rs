//! Process-wide contract registry.
//!
//! The registry is constructed once at startup, loaded with the compiled
//! schema definitions, and then shared by reference (`Arc<ContractRegistry>`)
//! with every component that needs it. Reads take a shared lock and never
//! block one another; registration and reload are serialized behind the
//! single writer side of the same lock.
//!
//! Unknown-field handling is an explicit [`UnknownFields`] mode on the
//! registry rather than whatever the JSON library happens to do.

use super::error::ContractError;
use super::schema::SchemaDefinition;
use super::version::ContractVersion;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

type VersionTable = BTreeMap<ContractVersion, Arc<SchemaDefinition>>;

// ─────────────────────────────────────────────────────────────────────────────
// Parse mode
// ─────────────────────────────────────────────────────────────────────────────

/// What happens to payload fields the schema does not declare.
///
/// Neither mode ever turns an unknown field into an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownFields {
    /// Keep them alongside the parsed artifact (ignored by validation).
    #[default]
    Preserve,
    /// Drop them during parsing.
    Discard,
}

// ─────────────────────────────────────────────────────────────────────────────
// Parsed artifacts
// ─────────────────────────────────────────────────────────────────────────────

/// A payload that passed validation against one schema version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedArtifact {
    /// Contract name the payload was validated against.
    pub contract: String,
    /// Version of the schema actually used.
    pub version: ContractVersion,
    /// Declared fields, defaults filled in.
    pub values: Map<String, Value>,
    /// Undeclared fields, kept verbatim when the registry preserves them.
    pub unknown: Map<String, Value>,
}

impl ParsedArtifact {
    /// Merge declared and preserved unknown fields back into one object.
    pub fn to_json(&self) -> Value {
        let mut merged = self.unknown.clone();
        for (k, v) in &self.values {
            merged.insert(k.clone(), v.clone());
        }
        Value::Object(merged)
    }

    /// Serialize to the wire form accepted by [`ContractRegistry::validate`].
    pub fn to_bytes(&self) -> Vec<u8> {
        // Serializing a `Value` built from a map cannot fail.
        serde_json::to_vec(&self.to_json()).unwrap_or_default()
    }
}

/// A parsed artifact plus the names of fields that were filled from
/// schema defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct Validation {
    pub artifact: ParsedArtifact,
    pub applied_defaults: Vec<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

/// Versioned schema store keyed by `(name, version)`.
#[derive(Debug, Default)]
pub struct ContractRegistry {
    schemas: RwLock<HashMap<String, VersionTable>>,
    unknown_fields: UnknownFields,
}

impl ContractRegistry {
    /// Create an empty registry that preserves unknown fields.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty registry with an explicit unknown-field mode.
    pub fn with_unknown_fields(mode: UnknownFields) -> Self {
        Self {
            schemas: RwLock::new(HashMap::new()),
            unknown_fields: mode,
        }
    }

    pub fn unknown_fields(&self) -> UnknownFields {
        self.unknown_fields
    }

    /// Register a schema.
    ///
    /// Fails with [`ContractError::DuplicateVersion`] when the exact
    /// `(name, version)` pair exists, and with
    /// [`ContractError::IncompatibleEvolution`] when the schema would break
    /// the rules of its major version relative to its registered neighbours.
    pub fn register(&self, schema: SchemaDefinition) -> Result<(), ContractError> {
        let mut schemas = self.schemas.write();
        Self::insert_checked(&mut schemas, schema)
    }

    /// Register a batch under one writer lock. Stops at the first failure;
    /// schemas before it stay registered.
    pub fn register_all(
        &self,
        batch: impl IntoIterator<Item = SchemaDefinition>,
    ) -> Result<usize, ContractError> {
        let mut schemas = self.schemas.write();
        let mut count = 0;
        for schema in batch {
            Self::insert_checked(&mut schemas, schema)?;
            count += 1;
        }
        Ok(count)
    }

    /// Replace the whole registry content (config reload).
    ///
    /// The new table is built and checked off to the side; readers keep
    /// seeing the old table until the swap, and a failing batch leaves the
    /// registry untouched.
    pub fn replace_all(
        &self,
        batch: impl IntoIterator<Item = SchemaDefinition>,
    ) -> Result<usize, ContractError> {
        let mut fresh = HashMap::new();
        let mut count = 0;
        for schema in batch {
            Self::insert_checked(&mut fresh, schema)?;
            count += 1;
        }
        *self.schemas.write() = fresh;
        info!(schemas = count, "contract registry reloaded");
        Ok(count)
    }

    fn insert_checked(
        schemas: &mut HashMap<String, VersionTable>,
        schema: SchemaDefinition,
    ) -> Result<(), ContractError> {
        if schema.name.trim().is_empty() {
            return Err(ContractError::EmptyName);
        }
        let table = schemas.entry(schema.name.clone()).or_default();
        if table.contains_key(&schema.version) {
            return Err(ContractError::DuplicateVersion {
                name: schema.name,
                version: schema.version,
            });
        }

        let major = schema.version.major;
        let older = table
            .range(..schema.version)
            .next_back()
            .filter(|(v, _)| v.major == major)
            .map(|(_, s)| Arc::clone(s));
        let newer = table
            .range(schema.version..)
            .next()
            .filter(|(v, _)| v.major == major)
            .map(|(_, s)| Arc::clone(s));

        if let Some(older) = older {
            check_evolution(&older, &schema)?;
        }
        if let Some(newer) = newer {
            check_evolution(&schema, &newer)?;
        }

        debug!(contract = %schema.name, version = %schema.version, "schema registered");
        table.insert(schema.version, Arc::new(schema));
        Ok(())
    }

    /// Resolve `name` at `version`.
    ///
    /// An exact match wins. Otherwise the compatible match is the highest
    /// registered version with the same major whose `(major, minor)` is not
    /// above the requested one.
    pub fn resolve(
        &self,
        name: &str,
        version: &ContractVersion,
    ) -> Result<Arc<SchemaDefinition>, ContractError> {
        let schemas = self.schemas.read();
        let table = schemas
            .get(name)
            .ok_or_else(|| ContractError::UnknownContract(name.to_string()))?;

        if let Some(exact) = table.get(version) {
            return Ok(Arc::clone(exact));
        }

        table
            .iter()
            .rev()
            .find(|(v, _)| v.major == version.major && v.major_minor() <= version.major_minor())
            .map(|(_, s)| Arc::clone(s))
            .ok_or_else(|| ContractError::UnknownVersion {
                name: name.to_string(),
                version: *version,
            })
    }

    /// All schemas registered for `name` under `major`, ascending by version.
    pub fn schemas_in_major(&self, name: &str, major: u64) -> Vec<Arc<SchemaDefinition>> {
        self.schemas
            .read()
            .get(name)
            .map(|table| {
                table
                    .iter()
                    .filter(|(v, _)| v.major == major)
                    .map(|(_, s)| Arc::clone(s))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Lowest registered version of `name` whose major passes `filter`.
    pub fn oldest_matching(
        &self,
        name: &str,
        mut filter: impl FnMut(u64) -> bool,
    ) -> Option<ContractVersion> {
        self.schemas
            .read()
            .get(name)
            .and_then(|table| table.keys().find(|v| filter(v.major)).copied())
    }

    /// All versions registered for `name`, ascending.
    pub fn versions(&self, name: &str) -> Vec<ContractVersion> {
        self.schemas
            .read()
            .get(name)
            .map(|table| table.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Registered contract names, sorted.
    pub fn contracts(&self) -> Vec<String> {
        let mut names: Vec<String> = self.schemas.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.schemas.read().contains_key(name)
    }

    /// Parse raw bytes against the resolved schema.
    pub fn validate(
        &self,
        name: &str,
        version: &ContractVersion,
        raw: &[u8],
    ) -> Result<ParsedArtifact, ContractError> {
        self.validate_detailed(name, version, raw)
            .map(|validation| validation.artifact)
    }

    /// Like [`validate`](Self::validate), also reporting which fields were
    /// filled from defaults.
    pub fn validate_detailed(
        &self,
        name: &str,
        version: &ContractVersion,
        raw: &[u8],
    ) -> Result<Validation, ContractError> {
        let schema = self.resolve(name, version)?;
        let object = parse_object(raw)?;
        self.validate_object(&schema, object)
    }

    /// Validate an already-parsed JSON object against a specific schema.
    pub fn validate_object(
        &self,
        schema: &SchemaDefinition,
        mut object: Map<String, Value>,
    ) -> Result<Validation, ContractError> {
        let mut values = Map::new();
        let mut applied_defaults = Vec::new();
        let mut missing_fields = Vec::new();

        for (field, spec) in &schema.fields {
            match object.remove(field) {
                Some(value) if !value.is_null() || spec.field_type.accepts(&value) => {
                    if !spec.field_type.accepts(&value) {
                        return Err(ContractError::TypeMismatch {
                            field: field.clone(),
                            expected: spec.field_type,
                            found: json_type_name(&value),
                        });
                    }
                    values.insert(field.clone(), value);
                }
                // Absent, or an explicit null on a typed field.
                _ => {
                    if let Some(default) = &spec.default_if_missing {
                        values.insert(field.clone(), default.clone());
                        applied_defaults.push(field.clone());
                    } else if spec.required {
                        missing_fields.push(field.clone());
                    }
                }
            }
        }

        if !missing_fields.is_empty() {
            return Err(ContractError::Validation { missing_fields });
        }

        let unknown = match self.unknown_fields {
            UnknownFields::Preserve => object,
            UnknownFields::Discard => Map::new(),
        };

        Ok(Validation {
            artifact: ParsedArtifact {
                contract: schema.name.clone(),
                version: schema.version,
                values,
                unknown,
            },
            applied_defaults,
        })
    }
}

/// Decode raw payload bytes into a JSON object.
pub fn parse_object(raw: &[u8]) -> Result<Map<String, Value>, ContractError> {
    match serde_json::from_slice::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(ContractError::Malformed(format!(
            "expected a JSON object, found {}",
            json_type_name(&other)
        ))),
        Err(e) => Err(ContractError::Malformed(e.to_string())),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Evolution rules between two schemas of the same major, `older < newer`:
///
/// - no field of `older` may disappear in `newer`;
/// - a field's type may not change (except widening to `any`);
/// - a field optional in `older` may not become required in `newer`;
/// - a field introduced in `newer` must not be required without a default.
fn check_evolution(older: &SchemaDefinition, newer: &SchemaDefinition) -> Result<(), ContractError> {
    let (subject, neighbour) = (newer, older);
    let fail = |reason: String| {
        Err(ContractError::IncompatibleEvolution {
            name: subject.name.clone(),
            version: subject.version,
            neighbour: neighbour.version,
            reason,
        })
    };

    for (field, old_spec) in &older.fields {
        let Some(new_spec) = newer.fields.get(field) else {
            return fail(format!(
                "field '{field}' removed between {} and {}",
                older.version, newer.version
            ));
        };
        if new_spec.field_type != old_spec.field_type
            && new_spec.field_type != super::schema::FieldType::Any
        {
            return fail(format!(
                "field '{field}' changes type from {} to {}",
                old_spec.field_type.as_str(),
                new_spec.field_type.as_str()
            ));
        }
        if new_spec.required && !old_spec.required {
            return fail(format!(
                "field '{field}' is optional in {} but required in {}",
                older.version, newer.version
            ));
        }
    }

    for (field, new_spec) in &newer.fields {
        if !older.fields.contains_key(field) && new_spec.is_hard_required() {
            return fail(format!(
                "field '{field}' added in {} as required without a default",
                newer.version
            ));
        }
    }

    Ok(())
}
