//! Attribute schema: cardinality, uniqueness, value type.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Reserved attribute naming the entity itself in entity maps and pulls.
pub const DB_ID: &str = "db/id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Cardinality {
    #[default]
    One,
    Many,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Unique {
    /// Asserting a held value upserts onto the holder.
    Identity,
    /// Asserting a held value from another entity is a conflict.
    Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ValueType {
    #[default]
    Any,
    Ref,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AttrSpec {
    pub cardinality: Cardinality,
    pub unique: Option<Unique>,
    pub value_type: ValueType,
}

impl AttrSpec {
    pub fn many() -> Self {
        Self {
            cardinality: Cardinality::Many,
            ..Self::default()
        }
    }

    pub fn identity() -> Self {
        Self {
            unique: Some(Unique::Identity),
            ..Self::default()
        }
    }

    pub fn unique_value() -> Self {
        Self {
            unique: Some(Unique::Value),
            ..Self::default()
        }
    }

    pub fn reference() -> Self {
        Self {
            value_type: ValueType::Ref,
            ..Self::default()
        }
    }

    pub fn with_cardinality(mut self, cardinality: Cardinality) -> Self {
        self.cardinality = cardinality;
        self
    }
}

/// Attribute name → spec. Attributes absent from the schema are
/// cardinality-one, non-unique, untyped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    attrs: BTreeMap<String, AttrSpec>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, attr: impl Into<String>, spec: AttrSpec) -> Self {
        self.attrs.insert(attr.into(), spec);
        self
    }

    pub fn insert(&mut self, attr: impl Into<String>, spec: AttrSpec) {
        self.attrs.insert(attr.into(), spec);
    }

    pub fn spec(&self, attr: &str) -> AttrSpec {
        self.attrs.get(attr).copied().unwrap_or_default()
    }

    pub fn is_many(&self, attr: &str) -> bool {
        self.spec(attr).cardinality == Cardinality::Many
    }

    pub fn is_ref(&self, attr: &str) -> bool {
        self.spec(attr).value_type == ValueType::Ref
    }

    pub fn unique(&self, attr: &str) -> Option<Unique> {
        self.spec(attr).unique
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    /// Attributes typed as references.
    pub fn ref_attrs(&self) -> impl Iterator<Item = &str> {
        self.attrs
            .iter()
            .filter(|(_, s)| s.value_type == ValueType::Ref)
            .map(|(a, _)| a.as_str())
    }

    /// Overlay `other` on top of this schema; `other` wins on conflicts.
    pub fn merged(&self, other: &Schema) -> Schema {
        let mut attrs = self.attrs.clone();
        for (a, s) in &other.attrs {
            attrs.insert(a.clone(), *s);
        }
        Schema { attrs }
    }
}
