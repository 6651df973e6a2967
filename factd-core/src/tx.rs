//! Transaction data, entity resolution and the net-change overlay.
//!
//! A transaction is resolved in three passes:
//! 1. normalize ops into steps and register every tempid in order of first
//!    appearance, binding tempids that assert a held unique-identity value
//!    to the holder (upsert);
//! 2. allocate fresh ids for the remaining tempids;
//! 3. apply steps to an overlay over the snapshot, which tracks the net
//!    assertions and retractions the commit must write.

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::datom::{Components, Datom, IndexKind};
use crate::db::Db;
use crate::error::{CoreError, CoreResult};
use crate::schema::{Cardinality, Unique, DB_ID};
use crate::value::{EntityId, TxId, Value};

/// How a transaction names an entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityRef {
    Id(EntityId),
    /// String tempid, or a negative number rendered as a string.
    Temp(String),
    /// `[attr value]` on a unique attribute.
    Lookup(String, Value),
}

impl EntityRef {
    pub fn from_value(value: &Value) -> CoreResult<Self> {
        match value {
            Value::Long(n) if *n < 0 => Ok(EntityRef::Temp(n.to_string())),
            Value::Long(n) | Value::Ref(n) => Ok(EntityRef::Id(*n)),
            Value::Str(s) => Ok(EntityRef::Temp(s.clone())),
            Value::Vec(items) => match items.as_slice() {
                [attr, v] => match attr.as_attr() {
                    Some(a) => Ok(EntityRef::Lookup(a.to_string(), v.clone())),
                    None => Err(CoreError::InvalidTx(format!("bad lookup ref {value}"))),
                },
                _ => Err(CoreError::InvalidTx(format!("bad lookup ref {value}"))),
            },
            other => Err(CoreError::InvalidTx(format!("bad entity reference {other}"))),
        }
    }
}

/// One transaction operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TxOp {
    /// `{attr value ...}`, optionally with `db/id`.
    Entity(BTreeMap<String, Value>),
    Add { e: EntityRef, a: String, v: Value },
    Retract { e: EntityRef, a: String, v: Value },
    RetractAttribute { e: EntityRef, a: String },
    RetractEntity { e: EntityRef },
}

impl TxOp {
    pub fn add(e: EntityId, a: impl Into<String>, v: impl Into<Value>) -> Self {
        TxOp::Add {
            e: EntityRef::Id(e),
            a: a.into(),
            v: v.into(),
        }
    }

    pub fn retract(e: EntityId, a: impl Into<String>, v: impl Into<Value>) -> Self {
        TxOp::Retract {
            e: EntityRef::Id(e),
            a: a.into(),
            v: v.into(),
        }
    }

    /// Build an entity map op from `(attr, value)` pairs.
    pub fn entity<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        TxOp::Entity(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    /// Decode one op from its value form: a map, or a vector led by
    /// `:db/add`, `:db/retract`, `:db/retractEntity` or
    /// `:db.fn/retractAttribute`.
    pub fn from_value(value: &Value) -> CoreResult<Self> {
        if let Value::Map(map) = value {
            return Ok(TxOp::Entity(map.clone()));
        }
        let items = value
            .as_vec()
            .ok_or_else(|| CoreError::InvalidTx(format!("bad tx op {value}")))?;
        let (op, args) = items
            .split_first()
            .ok_or_else(|| CoreError::InvalidTx("empty tx op".into()))?;
        let attr = |v: &Value| {
            v.as_attr()
                .map(str::to_string)
                .ok_or_else(|| CoreError::InvalidTx(format!("bad attribute {v}")))
        };
        match (op.as_attr(), args) {
            (Some("db/add"), [e, a, v]) => Ok(TxOp::Add {
                e: EntityRef::from_value(e)?,
                a: attr(a)?,
                v: v.clone(),
            }),
            (Some("db/retract"), [e, a, v]) => Ok(TxOp::Retract {
                e: EntityRef::from_value(e)?,
                a: attr(a)?,
                v: v.clone(),
            }),
            (Some("db.fn/retractAttribute" | "db/retractAttribute"), [e, a]) => {
                Ok(TxOp::RetractAttribute {
                    e: EntityRef::from_value(e)?,
                    a: attr(a)?,
                })
            }
            (Some("db.fn/retractEntity" | "db/retractEntity"), [e]) => Ok(TxOp::RetractEntity {
                e: EntityRef::from_value(e)?,
            }),
            _ => Err(CoreError::InvalidTx(format!("unsupported tx op {value}"))),
        }
    }

    /// Decode a vector of ops.
    pub fn parse_tx_data(value: &Value) -> CoreResult<Vec<TxOp>> {
        value
            .as_vec()
            .ok_or_else(|| CoreError::InvalidTx("tx-data must be a vector".into()))?
            .iter()
            .map(TxOp::from_value)
            .collect()
    }
}

/// Outcome of a committed transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct TxReport {
    pub tx: TxId,
    /// Net retractions followed by net assertions.
    pub tx_data: Vec<Datom>,
    pub tempids: BTreeMap<String, EntityId>,
    pub tx_meta: Option<Value>,
}

impl TxReport {
    pub fn to_value(&self) -> Value {
        let mut map = BTreeMap::new();
        map.insert("tx".to_string(), Value::Long(self.tx));
        map.insert(
            "tx-data".to_string(),
            Value::Vec(self.tx_data.iter().map(Datom::to_value).collect()),
        );
        map.insert(
            "tempids".to_string(),
            Value::Map(
                self.tempids
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::Long(*v)))
                    .collect(),
            ),
        );
        map.insert(
            "tx-meta".to_string(),
            self.tx_meta.clone().unwrap_or(Value::Nil),
        );
        Value::Map(map)
    }
}

/// Changes ready to commit.
pub(crate) struct Prepared {
    pub max_eid: EntityId,
    pub inserts: Vec<Datom>,
    pub removes: Vec<Datom>,
    pub report: TxReport,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Temp {
    Named(String),
    /// Entity map without `db/id`, keyed by op position.
    Auto(usize),
}

#[derive(Debug, Clone)]
enum Target {
    Ref(EntityRef),
    Auto(usize),
}

impl Target {
    fn temp(&self) -> Option<Temp> {
        match self {
            Target::Ref(EntityRef::Temp(name)) => Some(Temp::Named(name.clone())),
            Target::Auto(i) => Some(Temp::Auto(*i)),
            _ => None,
        }
    }
}

#[derive(Debug)]
enum Step {
    Add(Target, String, Value),
    Retract(Target, String, Value),
    RetractAttribute(Target, String),
    RetractEntity(Target),
}

fn normalize(db: &Db, ops: Vec<TxOp>) -> CoreResult<Vec<Step>> {
    let schema = db.schema();
    let mut steps = Vec::with_capacity(ops.len());
    for (i, op) in ops.into_iter().enumerate() {
        match op {
            TxOp::Entity(mut map) => {
                let target = match map.remove(DB_ID) {
                    Some(id) => Target::Ref(EntityRef::from_value(&id)?),
                    None => Target::Auto(i),
                };
                if map.is_empty() {
                    continue;
                }
                for (a, v) in map {
                    match v {
                        Value::Vec(items) if schema.is_many(&a) && !is_lookup_shape(&items) => {
                            for item in items {
                                steps.push(Step::Add(target.clone(), a.clone(), item));
                            }
                        }
                        v => steps.push(Step::Add(target.clone(), a, v)),
                    }
                }
            }
            TxOp::Add { e, a, v } => steps.push(Step::Add(Target::Ref(e), a, v)),
            TxOp::Retract { e, a, v } => steps.push(Step::Retract(Target::Ref(e), a, v)),
            TxOp::RetractAttribute { e, a } => steps.push(Step::RetractAttribute(Target::Ref(e), a)),
            TxOp::RetractEntity { e } => steps.push(Step::RetractEntity(Target::Ref(e))),
        }
    }
    Ok(steps)
}

fn is_lookup_shape(items: &[Value]) -> bool {
    matches!(items, [Value::Keyword(_), v] if !matches!(v, Value::Vec(_)))
}

struct Resolver<'a> {
    db: &'a Db,
    order: Vec<Temp>,
    seen: FxHashSet<Temp>,
    bound: FxHashMap<Temp, EntityId>,
    /// Union-find over tempids that claim the same new identity value.
    parent: FxHashMap<Temp, Temp>,
    identity_owner: FxHashMap<(String, Value), Temp>,
    ids: FxHashMap<Temp, EntityId>,
}

impl<'a> Resolver<'a> {
    fn new(db: &'a Db) -> Self {
        Self {
            db,
            order: Vec::new(),
            seen: FxHashSet::default(),
            bound: FxHashMap::default(),
            parent: FxHashMap::default(),
            identity_owner: FxHashMap::default(),
            ids: FxHashMap::default(),
        }
    }

    fn register(&mut self, temp: Temp) {
        if self.seen.insert(temp.clone()) {
            self.order.push(temp);
        }
    }

    fn collect(&mut self, steps: &[Step]) -> CoreResult<()> {
        for step in steps {
            let target = match step {
                Step::Add(t, ..)
                | Step::Retract(t, ..)
                | Step::RetractAttribute(t, _)
                | Step::RetractEntity(t) => t,
            };
            if let Some(temp) = target.temp() {
                self.register(temp);
            }
            if let Step::Add(_, a, v) | Step::Retract(_, a, v) = step {
                if self.db.schema().is_ref(a) {
                    if let Some(temp) = value_temp(v) {
                        self.register(temp);
                    }
                }
            }
            if let Step::Add(target, a, v) = step {
                self.upsert(target, a, v)?;
            }
        }
        Ok(())
    }

    fn upsert(&mut self, target: &Target, a: &str, v: &Value) -> CoreResult<()> {
        let Some(temp) = target.temp() else {
            return Ok(());
        };
        if self.db.schema().unique(a) != Some(Unique::Identity) || self.db.schema().is_ref(a) {
            return Ok(());
        }
        match self.db.lookup_unique(a, v)? {
            Some(holder) => match self.bound.get(&temp) {
                Some(prev) if *prev != holder => Err(CoreError::UniqueConflict {
                    attr: a.to_string(),
                    value: v.to_string(),
                    existing: holder,
                    entity: *prev,
                }),
                _ => {
                    self.bound.insert(temp, holder);
                    Ok(())
                }
            },
            None => {
                let key = (a.to_string(), v.clone());
                match self.identity_owner.get(&key) {
                    Some(owner) if *owner != temp => {
                        let owner = owner.clone();
                        self.union(&temp, &owner);
                    }
                    Some(_) => {}
                    None => {
                        self.identity_owner.insert(key, temp);
                    }
                }
                Ok(())
            }
        }
    }

    fn find(&mut self, temp: &Temp) -> Temp {
        let mut root = temp.clone();
        while let Some(parent) = self.parent.get(&root) {
            root = parent.clone();
        }
        let mut cur = temp.clone();
        while cur != root {
            match self.parent.insert(cur, root.clone()) {
                Some(next) => cur = next,
                None => break,
            }
        }
        root
    }

    fn union(&mut self, a: &Temp, b: &Temp) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent.insert(ra, rb);
        }
    }

    /// Give every tempid class one id: the upserted holder if any member is
    /// bound, otherwise a fresh id after `next_eid`.
    fn allocate(&mut self, mut next_eid: EntityId) -> CoreResult<EntityId> {
        let order = self.order.clone();
        let mut class_bound: FxHashMap<Temp, EntityId> = FxHashMap::default();
        for temp in &order {
            let Some(&id) = self.bound.get(temp) else {
                continue;
            };
            let root = self.find(temp);
            match class_bound.get(&root) {
                Some(&prev) if prev != id => {
                    return Err(CoreError::InvalidTx(format!(
                        "tempid {temp:?} resolves to both {prev} and {id}"
                    )))
                }
                _ => {
                    class_bound.insert(root, id);
                }
            }
        }
        for temp in order {
            let root = self.find(&temp);
            let id = match class_bound.get(&root).or_else(|| self.ids.get(&root)) {
                Some(id) => *id,
                None => {
                    next_eid += 1;
                    next_eid
                }
            };
            self.ids.insert(root, id);
            self.ids.insert(temp, id);
        }
        Ok(next_eid)
    }

    fn entity(&self, target: &Target) -> CoreResult<EntityId> {
        match target {
            Target::Auto(i) => self.temp_id(&Temp::Auto(*i)),
            Target::Ref(EntityRef::Temp(name)) => self.temp_id(&Temp::Named(name.clone())),
            Target::Ref(EntityRef::Id(e)) => {
                if *e <= 0 || *e > self.db.max_eid() {
                    return Err(CoreError::UnknownEntity(*e));
                }
                Ok(*e)
            }
            Target::Ref(EntityRef::Lookup(a, v)) => self.lookup(a, v),
        }
    }

    fn lookup(&self, a: &str, v: &Value) -> CoreResult<EntityId> {
        if self.db.schema().unique(a).is_none() {
            return Err(CoreError::InvalidTx(format!("lookup ref attribute {a} is not unique")));
        }
        self.db
            .lookup_unique(a, v)?
            .ok_or_else(|| CoreError::LookupNotFound {
                attr: a.to_string(),
                value: v.to_string(),
            })
    }

    fn temp_id(&self, temp: &Temp) -> CoreResult<EntityId> {
        self.ids
            .get(temp)
            .copied()
            .ok_or_else(|| CoreError::InvalidTx(format!("unresolved tempid {temp:?}")))
    }

    /// Resolve a value asserted for a ref attribute to `Value::Ref`.
    fn ref_value(&self, v: &Value) -> CoreResult<Value> {
        if let Some(temp) = value_temp(v) {
            return Ok(Value::Ref(self.temp_id(&temp)?));
        }
        match v {
            Value::Long(n) | Value::Ref(n) => Ok(Value::Ref(*n)),
            Value::Vec(items) => match items.as_slice() {
                [Value::Keyword(a), target] if is_lookup_shape(items) => {
                    Ok(Value::Ref(self.lookup(a, target)?))
                }
                _ => Err(CoreError::InvalidTx(format!("bad reference value {v}"))),
            },
            other => Err(CoreError::InvalidTx(format!("bad reference value {other}"))),
        }
    }

    fn value(&self, a: &str, v: &Value) -> CoreResult<Value> {
        if self.db.schema().is_ref(a) {
            self.ref_value(v)
        } else if let Value::Map(_) = v {
            Err(CoreError::InvalidTx(format!("nested map for non-ref attribute {a}")))
        } else {
            Ok(v.clone())
        }
    }

    fn tempids(&self) -> BTreeMap<String, EntityId> {
        self.ids
            .iter()
            .filter_map(|(t, id)| match t {
                Temp::Named(name) => Some((name.clone(), *id)),
                Temp::Auto(_) => None,
            })
            .collect()
    }
}

fn value_temp(v: &Value) -> Option<Temp> {
    match v {
        Value::Str(s) => Some(Temp::Named(s.clone())),
        Value::Long(n) if *n < 0 => Some(Temp::Named(n.to_string())),
        _ => None,
    }
}

type Key = (EntityId, String, Value);

/// Net changes of one transaction over a snapshot.
struct Overlay<'a> {
    db: &'a Db,
    tx: TxId,
    asserted: BTreeMap<Key, Datom>,
    retracted: BTreeMap<Key, Datom>,
    /// Holders of unique values asserted in this transaction.
    unique_holders: FxHashMap<(String, Value), EntityId>,
}

impl<'a> Overlay<'a> {
    fn new(db: &'a Db, tx: TxId) -> Self {
        Self {
            db,
            tx,
            asserted: BTreeMap::new(),
            retracted: BTreeMap::new(),
            unique_holders: FxHashMap::default(),
        }
    }

    fn in_db(&self, e: EntityId, a: &str, v: &Value) -> CoreResult<bool> {
        let comps = Components {
            e: Some(e),
            a: Some(a.to_string()),
            v: Some(v.clone()),
        };
        Ok(!self.db.datoms(IndexKind::Eavt, &comps)?.is_empty())
    }

    fn values(&self, e: EntityId, a: &str) -> CoreResult<Vec<Value>> {
        let mut out: Vec<Value> = self
            .db
            .values(e, a)?
            .into_iter()
            .filter(|v| !self.retracted.contains_key(&(e, a.to_string(), v.clone())))
            .collect();
        out.extend(
            self.asserted
                .range((e, a.to_string(), Value::Nil)..)
                .take_while(|((ee, aa, _), _)| *ee == e && aa == a)
                .map(|((_, _, v), _)| v.clone()),
        );
        Ok(out)
    }

    fn entity_pairs(&self, e: EntityId) -> CoreResult<Vec<(String, Value)>> {
        let mut out: Vec<(String, Value)> = self
            .db
            .entity_datoms(e)?
            .into_iter()
            .filter(|d| !self.retracted.contains_key(&(e, d.a.clone(), d.v.clone())))
            .map(|d| (d.a, d.v))
            .collect();
        out.extend(
            self.asserted
                .range((e, String::new(), Value::Nil)..)
                .take_while(|((ee, _, _), _)| *ee == e)
                .map(|((_, a, v), _)| (a.clone(), v.clone())),
        );
        Ok(out)
    }

    fn holder(&self, a: &str, v: &Value) -> CoreResult<Option<EntityId>> {
        if let Some(e) = self.unique_holders.get(&(a.to_string(), v.clone())) {
            return Ok(Some(*e));
        }
        Ok(self
            .db
            .datoms(IndexKind::Avet, &Components::attr_value(a, v.clone()))?
            .into_iter()
            .find(|d| !self.retracted.contains_key(&(d.e, d.a.clone(), d.v.clone())))
            .map(|d| d.e))
    }

    fn referrers(&self, target: EntityId) -> CoreResult<Vec<(EntityId, String)>> {
        let mut out = Vec::new();
        let refs: Vec<String> = self.db.schema().ref_attrs().map(str::to_string).collect();
        for a in refs {
            for e in self.db.referrers(&a, target)? {
                out.push((e, a.clone()));
            }
        }
        out.extend(
            self.asserted
                .keys()
                .filter(|(_, _, v)| *v == Value::Ref(target))
                .map(|(e, a, _)| (*e, a.clone())),
        );
        Ok(out)
    }

    fn assert(&mut self, e: EntityId, a: &str, v: Value) -> CoreResult<()> {
        let spec = self.db.schema().spec(a);
        if spec.unique.is_some() {
            if let Some(holder) = self.holder(a, &v)? {
                if holder != e {
                    return Err(CoreError::UniqueConflict {
                        attr: a.to_string(),
                        value: v.to_string(),
                        existing: holder,
                        entity: e,
                    });
                }
            }
        }
        if spec.cardinality == Cardinality::One {
            for old in self.values(e, a)? {
                if old != v {
                    self.retract(e, a, old)?;
                }
            }
        }
        let key = (e, a.to_string(), v);
        if self.retracted.remove(&key).is_some() {
            return Ok(());
        }
        if self.asserted.contains_key(&key) || self.in_db(e, a, &key.2)? {
            return Ok(());
        }
        if spec.unique.is_some() {
            self.unique_holders.insert((a.to_string(), key.2.clone()), e);
        }
        let datom = Datom::new(e, a, key.2.clone(), self.tx, true);
        self.asserted.insert(key, datom);
        Ok(())
    }

    fn retract(&mut self, e: EntityId, a: &str, v: Value) -> CoreResult<()> {
        let key = (e, a.to_string(), v);
        if self.asserted.remove(&key).is_some() {
            let held = (key.1, key.2);
            if self.unique_holders.get(&held) == Some(&e) {
                self.unique_holders.remove(&held);
            }
            return Ok(());
        }
        if self.retracted.contains_key(&key) || !self.in_db(e, a, &key.2)? {
            return Ok(());
        }
        let datom = Datom::new(e, a, key.2.clone(), self.tx, false);
        self.retracted.insert(key, datom);
        Ok(())
    }

    fn retract_entity(&mut self, e: EntityId) -> CoreResult<()> {
        for (a, v) in self.entity_pairs(e)? {
            self.retract(e, &a, v)?;
        }
        for (referrer, a) in self.referrers(e)? {
            self.retract(referrer, &a, Value::Ref(e))?;
        }
        Ok(())
    }

    fn finish(self, max_eid: EntityId, tempids: BTreeMap<String, EntityId>, tx_meta: Option<Value>) -> Prepared {
        let removes: Vec<Datom> = self.retracted.into_values().collect();
        let inserts: Vec<Datom> = self.asserted.into_values().collect();
        let tx_data = removes.iter().chain(inserts.iter()).cloned().collect();
        Prepared {
            max_eid,
            inserts,
            removes,
            report: TxReport {
                tx: self.tx,
                tx_data,
                tempids,
                tx_meta,
            },
        }
    }
}

/// Resolve and validate `ops` against `db`.
pub(crate) fn prepare(db: &Db, ops: Vec<TxOp>, tx_meta: Option<Value>) -> CoreResult<Prepared> {
    let steps = normalize(db, ops)?;
    let mut resolver = Resolver::new(db);
    resolver.collect(&steps)?;
    let max_eid = resolver.allocate(db.max_eid())?;

    let mut overlay = Overlay::new(db, db.max_tx() + 1);
    for step in &steps {
        match step {
            Step::Add(target, a, v) => {
                let e = resolve_new(&resolver, target, max_eid)?;
                let v = resolver.value(a, v)?;
                overlay.assert(e, a, v)?;
            }
            Step::Retract(target, a, v) => {
                let e = resolver.entity(target)?;
                let v = resolver.value(a, v)?;
                overlay.retract(e, a, v)?;
            }
            Step::RetractAttribute(target, a) => {
                let e = resolver.entity(target)?;
                for v in overlay.values(e, a)? {
                    overlay.retract(e, a, v)?;
                }
            }
            Step::RetractEntity(target) => {
                let e = resolver.entity(target)?;
                overlay.retract_entity(e)?;
            }
        }
    }

    let tempids = resolver.tempids();
    Ok(overlay.finish(max_eid, tempids, tx_meta))
}

fn resolve_new(resolver: &Resolver<'_>, target: &Target, max_eid: EntityId) -> CoreResult<EntityId> {
    match resolver.entity(target) {
        Err(CoreError::UnknownEntity(e)) if e > 0 && e <= max_eid => Ok(e),
        other => other,
    }
}

/// Apply facts from the authoritative peer.
///
/// Entity ids are taken as given, except that an incoming entity asserting
/// a unique-identity value already held by another entity is redirected to
/// the holder. Incoming tx ids are not kept: the batch commits as one local
/// transaction.
pub(crate) fn prepare_sync(db: &Db, datoms: &[Datom]) -> CoreResult<Prepared> {
    let schema = db.schema();
    let mut remap: FxHashMap<EntityId, EntityId> = FxHashMap::default();
    let mut first_holder: FxHashMap<(&str, &Value), EntityId> = FxHashMap::default();
    for d in datoms.iter().filter(|d| d.added) {
        if schema.unique(&d.a) != Some(Unique::Identity) || remap.contains_key(&d.e) {
            continue;
        }
        let holder = match db.lookup_unique(&d.a, &d.v)? {
            Some(h) => Some(h),
            None => first_holder.get(&(d.a.as_str(), &d.v)).copied(),
        };
        match holder {
            Some(h) if h != d.e => {
                remap.insert(d.e, h);
            }
            Some(_) => {}
            None => {
                first_holder.insert((d.a.as_str(), &d.v), d.e);
            }
        }
    }

    let map_id = |e: EntityId| remap.get(&e).copied().unwrap_or(e);
    let mut max_eid = db.max_eid();
    let mut overlay = Overlay::new(db, db.max_tx() + 1);
    for d in datoms {
        let e = map_id(d.e);
        if e <= 0 {
            return Err(CoreError::UnknownEntity(e));
        }
        let v = if schema.is_ref(&d.a) {
            match d.v.as_entity_id() {
                Some(target) => {
                    let target = map_id(target);
                    max_eid = max_eid.max(target);
                    Value::Ref(target)
                }
                None => {
                    return Err(CoreError::InvalidTx(format!(
                        "bad reference value {} for {}",
                        d.v, d.a
                    )))
                }
            }
        } else {
            d.v.clone()
        };
        max_eid = max_eid.max(e);
        if d.added {
            overlay.assert(e, &d.a, v)?;
        } else {
            overlay.retract(e, &d.a, v)?;
        }
    }
    Ok(overlay.finish(max_eid, BTreeMap::new(), None))
}
