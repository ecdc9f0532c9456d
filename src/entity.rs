//! Typed, attribute-refined entities and the domination partial order.
//!
//! An [`Entity`] addresses a principal or object in the configured type
//! hierarchy. A more general entity *dominates* a more specific one: any
//! constraint satisfied by the general description is also satisfied by
//! the specific one.

use std::collections::BTreeMap;
use std::fmt;

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::Value;

use crate::config::Config;
use crate::error::{Error, Result};

/// An element of the configured entity type hierarchy.
///
/// Lower ranks are more general; the minimal rank is the wildcard type
/// (`/any` in the standard configuration).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityType {
    /// The configured type name, e.g. `/user`.
    pub name: String,
    /// Position in the hierarchy; lower is more general.
    pub rank: u32,
}

/// A typed address of a principal or object.
///
/// Entities are immutable value objects: constructed once from a policy
/// specification, then freely shared read-only. `Clone` is the deep copy.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    entity_type: EntityType,
    attributes: BTreeMap<String, Value>,
}

impl Entity {
    /// Create an entity of the given registered type with no attributes.
    pub fn new(config: &Config, type_name: &str) -> Result<Self> {
        let rank = config.entity_rank(type_name)?;
        Ok(Self {
            entity_type: EntityType {
                name: type_name.to_string(),
                rank,
            },
            attributes: BTreeMap::new(),
        })
    }

    /// Create the maximal (wildcard) entity of the configuration.
    pub fn wildcard(config: &Config) -> Result<Self> {
        let (name, rank) = config.wildcard_type()?;
        Ok(Self {
            entity_type: EntityType { name, rank },
            attributes: BTreeMap::new(),
        })
    }

    /// Build an entity from its serialized `{ "type": ..., ...attrs }` form.
    ///
    /// Fails with [`Error::Validation`] if `type` is missing or not a
    /// registered entity type.
    pub fn from_value(config: &Config, value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::validation("entity specification must be an object"))?;
        let type_name = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::validation("entity does not specify a type"))?;

        let mut entity = Self::new(config, type_name)?;
        for (key, val) in obj {
            if key != "type" {
                entity.attributes.insert(key.clone(), val.clone());
            }
        }
        Ok(entity)
    }

    /// Attach an identifying attribute, consuming and returning the entity.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// The entity's type.
    pub fn entity_type(&self) -> &EntityType {
        &self.entity_type
    }

    /// The attribute refinement beyond the type.
    pub fn attributes(&self) -> &BTreeMap<String, Value> {
        &self.attributes
    }

    /// Whether this entity is at least as general as `other`.
    ///
    /// True iff this type equals `other`'s type or is a strict ancestor of
    /// it, and every attribute constrained here is present with an equal
    /// value on `other`. Reflexive and transitive.
    pub fn dominates(&self, other: &Entity) -> bool {
        let type_ok = self.entity_type.name == other.entity_type.name
            || self.entity_type.rank < other.entity_type.rank;
        if !type_ok {
            return false;
        }

        self.attributes
            .iter()
            .all(|(key, val)| other.attributes.get(key) == Some(val))
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.entity_type.name)?;
        if !self.attributes.is_empty() {
            write!(f, "(")?;
            for (i, (key, val)) in self.attributes.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}={}", key, val)?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

impl Serialize for Entity {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.attributes.len() + 1))?;
        map.serialize_entry("type", &self.entity_type.name)?;
        for (key, val) in &self.attributes {
            map.serialize_entry(key, val)?;
        }
        map.end()
    }
}
