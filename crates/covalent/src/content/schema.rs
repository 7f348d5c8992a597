//! Typed accessors for map values.
//!
//! A [`SchemaDescriptor`] lists a map's fields and their kinds. Maps created
//! with a schema carry `{"schema": <name>}` in their header meta, and
//! [`TypedMap`] checks every read and write against the descriptor found in
//! the node's [`SchemaRegistry`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::Value;

use covalent_core::{CoValueHeader, CoValueId};

use crate::content::map::{CoMap, Field};
use crate::error::{NodeError, Result};

/// Header meta key naming a map's schema.
pub const SCHEMA_META_KEY: &str = "schema";

/// What a field holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Number,
    Boolean,
    /// Any JSON value.
    Json,
    /// The id of another CoValue.
    Ref,
}

impl FieldKind {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Json => true,
            Self::Ref => value.as_str().is_some_and(|s| s.parse::<CoValueId>().is_ok()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub kind: FieldKind,
    pub optional: bool,
}

/// The fields of one map type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaDescriptor {
    name: String,
    fields: BTreeMap<String, FieldSpec>,
}

impl SchemaDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Add a required field.
    pub fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.insert(name.into(), FieldSpec { kind, optional: false });
        self
    }

    /// Add an optional field.
    pub fn optional(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.insert(name.into(), FieldSpec { kind, optional: true });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self, field: &str) -> Option<&FieldSpec> {
        self.fields.get(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldSpec)> {
        self.fields.iter().map(|(name, spec)| (name.as_str(), spec))
    }

    fn require_spec(&self, field: &str) -> Result<&FieldSpec> {
        self.fields.get(field).ok_or_else(|| NodeError::InvalidField {
            field: field.to_string(),
            reason: format!("not a field of {}", self.name),
        })
    }

    /// Check a value before it is written to `field`.
    pub fn validate(&self, field: &str, value: &Value) -> Result<()> {
        let spec = self.require_spec(field)?;
        if value.is_null() && spec.optional {
            return Ok(());
        }
        if !spec.kind.accepts(value) {
            return Err(NodeError::InvalidField {
                field: field.to_string(),
                reason: format!("expected {:?}, got {value}", spec.kind),
            });
        }
        Ok(())
    }

    /// Check that `fields` fill every required field and match their kinds.
    pub fn validate_all(&self, fields: &BTreeMap<String, Value>) -> Result<()> {
        for (name, value) in fields {
            self.validate(name, value)?;
        }
        for (name, spec) in &self.fields {
            if !spec.optional && !fields.contains_key(name) {
                return Err(NodeError::InvalidField {
                    field: name.clone(),
                    reason: "required field missing".into(),
                });
            }
        }
        Ok(())
    }
}

/// Descriptors keyed by schema name.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, Arc<SchemaDescriptor>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a descriptor.
    pub fn register(&mut self, schema: SchemaDescriptor) {
        self.schemas.insert(schema.name.clone(), Arc::new(schema));
    }

    pub fn get(&self, name: &str) -> Option<Arc<SchemaDescriptor>> {
        self.schemas.get(name).cloned()
    }

    /// The descriptor named in `header`'s meta.
    pub fn for_header(&self, header: &CoValueHeader) -> Option<Arc<SchemaDescriptor>> {
        let name = header.meta.as_ref()?.get(SCHEMA_META_KEY)?.as_str()?;
        self.get(name)
    }
}

/// A map read through its schema.
#[derive(Debug, Clone)]
pub struct TypedMap {
    schema: Arc<SchemaDescriptor>,
    map: CoMap,
}

impl TypedMap {
    pub fn new(schema: Arc<SchemaDescriptor>, map: CoMap) -> Self {
        Self { schema, map }
    }

    pub fn schema(&self) -> &SchemaDescriptor {
        &self.schema
    }

    pub fn raw(&self) -> &CoMap {
        &self.map
    }

    /// The field's state. Values of the wrong kind read as absent.
    pub fn get(&self, field: &str) -> Result<Field> {
        let spec = self.schema.require_spec(field)?;
        Ok(match self.map.get(field) {
            Field::Value(v) if !spec.kind.accepts(&v) => {
                tracing::debug!(field, schema = %self.schema.name, "stored value does not match schema");
                Field::Absent
            }
            other => other,
        })
    }

    pub fn string(&self, field: &str) -> Result<Option<String>> {
        self.expect_kind(field, FieldKind::String)?;
        Ok(self.get(field)?.value().and_then(Value::as_str).map(str::to_string))
    }

    pub fn number(&self, field: &str) -> Result<Option<f64>> {
        self.expect_kind(field, FieldKind::Number)?;
        Ok(self.get(field)?.value().and_then(Value::as_f64))
    }

    pub fn boolean(&self, field: &str) -> Result<Option<bool>> {
        self.expect_kind(field, FieldKind::Boolean)?;
        Ok(self.get(field)?.value().and_then(Value::as_bool))
    }

    pub fn reference(&self, field: &str) -> Result<Option<CoValueId>> {
        self.expect_kind(field, FieldKind::Ref)?;
        Ok(self
            .get(field)?
            .value()
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok()))
    }

    fn expect_kind(&self, field: &str, kind: FieldKind) -> Result<()> {
        let spec = self.schema.require_spec(field)?;
        if spec.kind != kind {
            return Err(NodeError::InvalidField {
                field: field.to_string(),
                reason: format!("is {:?}, not {kind:?}", spec.kind),
            });
        }
        Ok(())
    }
}
