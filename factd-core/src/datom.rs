//! Datoms and the three sort orders of the current-view indexes.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::value::{EntityId, TxId, Value};

/// An immutable fact: entity, attribute, value, transaction, asserted?.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Datom {
    pub e: EntityId,
    pub a: String,
    pub v: Value,
    pub tx: TxId,
    pub added: bool,
}

impl Datom {
    pub fn new(e: EntityId, a: impl Into<String>, v: Value, tx: TxId, added: bool) -> Self {
        Self {
            e,
            a: a.into(),
            v,
            tx,
            added,
        }
    }

    /// Encode as `[e :a v tx added]` for the wire.
    pub fn to_value(&self) -> Value {
        Value::Vec(vec![
            Value::Long(self.e),
            Value::Keyword(self.a.clone()),
            self.v.clone(),
            Value::Long(self.tx),
            Value::Bool(self.added),
        ])
    }
}

/// Index sort order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexKind {
    Eavt,
    Aevt,
    Avet,
}

impl IndexKind {
    pub const ALL: [IndexKind; 3] = [IndexKind::Eavt, IndexKind::Aevt, IndexKind::Avet];

    pub fn name(self) -> &'static str {
        match self {
            IndexKind::Eavt => "eavt",
            IndexKind::Aevt => "aevt",
            IndexKind::Avet => "avet",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim_start_matches(':') {
            "eavt" => Some(IndexKind::Eavt),
            "aevt" => Some(IndexKind::Aevt),
            "avet" => Some(IndexKind::Avet),
            _ => None,
        }
    }

    /// Compare two datoms by (e, a, v) in this index's order. `tx` and
    /// `added` do not participate: the current view holds at most one datom
    /// per (e, a, v).
    pub fn cmp(self, x: &Datom, y: &Datom) -> Ordering {
        match self {
            IndexKind::Eavt => x
                .e
                .cmp(&y.e)
                .then_with(|| x.a.cmp(&y.a))
                .then_with(|| x.v.cmp(&y.v)),
            IndexKind::Aevt => x
                .a
                .cmp(&y.a)
                .then_with(|| x.e.cmp(&y.e))
                .then_with(|| x.v.cmp(&y.v)),
            IndexKind::Avet => x
                .a
                .cmp(&y.a)
                .then_with(|| x.v.cmp(&y.v))
                .then_with(|| x.e.cmp(&y.e)),
        }
    }
}

/// Partially bound (e, a, v) used to seek an index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Components {
    pub e: Option<EntityId>,
    pub a: Option<String>,
    pub v: Option<Value>,
}

impl Components {
    pub fn entity(e: EntityId) -> Self {
        Self {
            e: Some(e),
            ..Self::default()
        }
    }

    pub fn entity_attr(e: EntityId, a: impl Into<String>) -> Self {
        Self {
            e: Some(e),
            a: Some(a.into()),
            v: None,
        }
    }

    pub fn attr(a: impl Into<String>) -> Self {
        Self {
            a: Some(a.into()),
            ..Self::default()
        }
    }

    pub fn attr_value(a: impl Into<String>, v: Value) -> Self {
        Self {
            e: None,
            a: Some(a.into()),
            v: Some(v),
        }
    }

    /// Build components from positional values in index order, the way
    /// `datoms(index, c1, c2, c3)` addresses an index.
    pub fn positional(kind: IndexKind, values: &[Value]) -> Option<Self> {
        let mut out = Components::default();
        let slots: [char; 3] = match kind {
            IndexKind::Eavt => ['e', 'a', 'v'],
            IndexKind::Aevt => ['a', 'e', 'v'],
            IndexKind::Avet => ['a', 'v', 'e'],
        };
        if values.len() > 3 {
            return None;
        }
        for (slot, value) in slots.iter().zip(values) {
            match slot {
                'e' => out.e = Some(value.as_entity_id()?),
                'a' => out.a = Some(value.as_attr()?.to_string()),
                _ => out.v = Some(value.clone()),
            }
        }
        Some(out)
    }

    /// Compare a datom against the leading bound components of `kind`.
    ///
    /// Only the contiguous bound prefix participates; `Equal` means the
    /// datom lies inside the prefix range.
    pub fn cmp_prefix(&self, kind: IndexKind, d: &Datom) -> Ordering {
        let order: [u8; 3] = match kind {
            IndexKind::Eavt => [0, 1, 2],
            IndexKind::Aevt => [1, 0, 2],
            IndexKind::Avet => [1, 2, 0],
        };
        for slot in order {
            let ord = match slot {
                0 => match self.e {
                    Some(e) => d.e.cmp(&e),
                    None => return Ordering::Equal,
                },
                1 => match &self.a {
                    Some(a) => d.a.as_str().cmp(a.as_str()),
                    None => return Ordering::Equal,
                },
                _ => match &self.v {
                    Some(v) => d.v.cmp(v),
                    None => return Ordering::Equal,
                },
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    /// Whether every bound component matches, regardless of index order.
    pub fn matches(&self, d: &Datom) -> bool {
        self.e.map_or(true, |e| d.e == e)
            && self.a.as_deref().map_or(true, |a| d.a == a)
            && self.v.as_ref().map_or(true, |v| &d.v == v)
    }
}
