//! Pull: hierarchical entity selection.

use std::collections::BTreeMap;

use crate::db::Db;
use crate::edn::{self, Edn};
use crate::error::{CoreError, CoreResult};
use crate::schema::DB_ID;
use crate::value::{EntityId, Value};

#[derive(Debug, Clone, PartialEq)]
enum Attr {
    Forward(String),
    /// `:ns/_attr`: entities referencing this one through `ns/attr`.
    Reverse { attr: String, key: String },
}

impl Attr {
    fn parse(name: &str) -> Self {
        let (ns, local) = match name.rsplit_once('/') {
            Some((ns, local)) => (Some(ns), local),
            None => (None, name),
        };
        match (ns, local.strip_prefix('_')) {
            (Some(ns), Some(stripped)) => Attr::Reverse {
                attr: format!("{ns}/{stripped}"),
                key: name.to_string(),
            },
            (None, Some(stripped)) => Attr::Reverse {
                attr: stripped.to_string(),
                key: name.to_string(),
            },
            (_, None) => Attr::Forward(name.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Selector {
    Wildcard,
    Id,
    Attr(Attr),
    Nested(Attr, PullPattern),
}

/// Parsed pull selector, e.g. `[:db/id :block/name {:block/page [*]}]`.
#[derive(Debug, Clone, PartialEq)]
pub struct PullPattern {
    selectors: Vec<Selector>,
}

impl PullPattern {
    pub fn parse(text: &str) -> CoreResult<Self> {
        Self::from_edn(&edn::parse(text)?)
    }

    pub fn wildcard() -> Self {
        Self {
            selectors: vec![Selector::Wildcard],
        }
    }

    pub fn from_edn(form: &Edn) -> CoreResult<Self> {
        let items = form
            .as_seq()
            .ok_or_else(|| CoreError::InvalidPull(format!("selector must be a vector: {form:?}")))?;
        let mut selectors = Vec::with_capacity(items.len());
        for item in items {
            match item {
                Edn::Symbol(s) if s == "*" => selectors.push(Selector::Wildcard),
                Edn::Str(s) if s == "*" => selectors.push(Selector::Wildcard),
                Edn::Keyword(k) if k == DB_ID => selectors.push(Selector::Id),
                Edn::Keyword(k) => selectors.push(Selector::Attr(Attr::parse(k))),
                Edn::Map(entries) => {
                    for (k, sub) in entries {
                        let name = k.as_keyword().ok_or_else(|| {
                            CoreError::InvalidPull(format!("nested key must be a keyword: {k:?}"))
                        })?;
                        selectors.push(Selector::Nested(Attr::parse(name), Self::from_edn(sub)?));
                    }
                }
                other => {
                    return Err(CoreError::InvalidPull(format!("unsupported selector {other:?}")))
                }
            }
        }
        Ok(Self { selectors })
    }
}

fn id_map(e: EntityId) -> Value {
    Value::Map(BTreeMap::from([(DB_ID.to_string(), Value::Long(e))]))
}

/// Resolve an entity argument: an id, or a lookup ref `[attr value]`.
pub fn resolve_entity(db: &Db, entity: &Value) -> CoreResult<Option<EntityId>> {
    match entity {
        Value::Long(e) | Value::Ref(e) => Ok(Some(*e)),
        Value::Vec(items) => match items.as_slice() {
            [Value::Keyword(attr), v] => db.lookup_unique(attr, &db.coerce(attr, v.clone())),
            _ => Err(CoreError::InvalidPull(format!("bad entity reference {entity}"))),
        },
        other => Err(CoreError::InvalidPull(format!("bad entity reference {other}"))),
    }
}

/// Pull `pattern` for `entity`. A missing entity pulls to nil.
pub fn pull(db: &Db, pattern: &PullPattern, entity: &Value) -> CoreResult<Value> {
    match resolve_entity(db, entity)? {
        Some(e) => pull_entity(db, pattern, e),
        None => Ok(Value::Nil),
    }
}

pub fn pull_many(db: &Db, pattern: &PullPattern, entities: &[Value]) -> CoreResult<Value> {
    entities
        .iter()
        .map(|e| pull(db, pattern, e))
        .collect::<CoreResult<Vec<_>>>()
        .map(Value::Vec)
}

fn pull_entity(db: &Db, pattern: &PullPattern, e: EntityId) -> CoreResult<Value> {
    let datoms = db.entity_datoms(e)?;
    if datoms.is_empty() {
        return Ok(Value::Nil);
    }
    let mut by_attr: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for d in datoms {
        by_attr.entry(d.a).or_default().push(d.v);
    }

    let schema = db.schema();
    let shape = |attr: &str, values: Vec<Value>| -> Value {
        let mut values: Vec<Value> = values
            .into_iter()
            .map(|v| match v {
                Value::Ref(target) => id_map(target),
                other => other,
            })
            .collect();
        if schema.is_many(attr) {
            Value::Vec(values)
        } else {
            values.pop().unwrap_or(Value::Nil)
        }
    };

    let mut out = BTreeMap::new();
    for selector in &pattern.selectors {
        match selector {
            Selector::Wildcard => {
                out.insert(DB_ID.to_string(), Value::Long(e));
                for (attr, values) in &by_attr {
                    out.insert(attr.clone(), shape(attr, values.clone()));
                }
            }
            Selector::Id => {
                out.insert(DB_ID.to_string(), Value::Long(e));
            }
            Selector::Attr(Attr::Forward(attr)) => {
                if let Some(values) = by_attr.get(attr) {
                    out.insert(attr.clone(), shape(attr, values.clone()));
                }
            }
            Selector::Attr(Attr::Reverse { attr, key }) => {
                let referrers = db.referrers(attr, e)?;
                if !referrers.is_empty() {
                    out.insert(key.clone(), Value::Vec(referrers.into_iter().map(id_map).collect()));
                }
            }
            Selector::Nested(Attr::Forward(attr), sub) => {
                let Some(values) = by_attr.get(attr) else {
                    continue;
                };
                let mut pulled = Vec::with_capacity(values.len());
                for v in values {
                    pulled.push(match v {
                        Value::Ref(target) => pull_entity(db, sub, *target)?,
                        other => other.clone(),
                    });
                }
                let value = if schema.is_many(attr) {
                    Value::Vec(pulled)
                } else {
                    pulled.pop().unwrap_or(Value::Nil)
                };
                out.insert(attr.clone(), value);
            }
            Selector::Nested(Attr::Reverse { attr, key }, sub) => {
                let referrers = db.referrers(attr, e)?;
                if referrers.is_empty() {
                    continue;
                }
                let mut pulled = Vec::with_capacity(referrers.len());
                for r in referrers {
                    pulled.push(pull_entity(db, sub, r)?);
                }
                out.insert(key.clone(), Value::Vec(pulled));
            }
        }
    }
    Ok(Value::Map(out))
}
