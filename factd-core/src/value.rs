//! Scalar and composite values stored in datoms and returned by queries.
//!
//! Values are totally ordered so they can live inside sorted index pages.
//! Doubles compare with `f64::total_cmp`, which puts `NaN` after every
//! other number instead of poisoning the ordering.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use uuid::Uuid;

/// Entity identifier, stable only within one fact store.
pub type EntityId = i64;

/// Transaction identifier, monotonically increasing per fact store.
pub type TxId = i64;

/// An `f64` with a total order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Float(pub f64);

impl PartialEq for Float {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0) == Ordering::Equal
    }
}

impl Eq for Float {}

impl PartialOrd for Float {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Float {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl Hash for Float {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

/// A value in the fact store.
///
/// Variant order is significant: it is the cross-type sort order used by
/// the indexes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Value {
    Nil,
    Bool(bool),
    Long(i64),
    Double(Float),
    Str(String),
    /// Keyword without the leading colon, e.g. `block/name`.
    Keyword(String),
    Uuid(Uuid),
    /// Reference to another entity.
    Ref(EntityId),
    /// Milliseconds since the Unix epoch.
    Instant(i64),
    Vec(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn keyword(name: impl Into<String>) -> Self {
        Value::Keyword(name.into())
    }

    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            Value::Long(n) => Some(*n),
            _ => None,
        }
    }

    /// Interpret the value as an entity id (`Long` or `Ref`).
    pub fn as_entity_id(&self) -> Option<EntityId> {
        match self {
            Value::Long(n) | Value::Ref(n) => Some(*n),
            _ => None,
        }
    }

    /// Attribute name from a keyword or string value.
    pub fn as_attr(&self) -> Option<&str> {
        match self {
            Value::Keyword(k) | Value::Str(k) => Some(k),
            _ => None,
        }
    }

    pub fn as_vec(&self) -> Option<&[Value]> {
        match self {
            Value::Vec(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Approximate in-memory footprint, used for size accounting.
    pub fn approx_size(&self) -> usize {
        match self {
            Value::Str(s) | Value::Keyword(s) => 24 + s.len(),
            Value::Vec(items) => 24 + items.iter().map(Value::approx_size).sum::<usize>(),
            Value::Map(m) => {
                24 + m
                    .iter()
                    .map(|(k, v)| k.len() + v.approx_size())
                    .sum::<usize>()
            }
            _ => 16,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Long(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Double(Float(f))
    }
}

impl From<Uuid> for Value {
    fn from(u: Uuid) -> Self {
        Value::Uuid(u)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Long(n) => write!(f, "{n}"),
            Value::Double(x) => write!(f, "{}", x.0),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Keyword(k) => write!(f, ":{k}"),
            Value::Uuid(u) => write!(f, "#uuid \"{u}\""),
            Value::Ref(e) => write!(f, "#ref {e}"),
            Value::Instant(ms) => write!(f, "#inst {ms}"),
            Value::Vec(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Map(m) => {
                write!(f, "{{")?;
                for (i, (k, v)) in m.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, ":{k} {v}")?;
                }
                write!(f, "}}")
            }
        }
    }
}
