//! Immutable database snapshot.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::datom::{Components, Datom, IndexKind};
use crate::error::{CoreError, CoreResult};
use crate::page::{PagedIndex, RootPage, ROOT_FORMAT};
use crate::schema::Schema;
use crate::storage::{Address, PageStorage, ROOT_ADDRESS};
use crate::value::{EntityId, TxId, Value};

/// A point-in-time view of one fact store.
///
/// Cloning is cheap: index directories are shared and leaves are loaded
/// from storage on demand. A snapshot stays valid while its leaves exist,
/// which holds until the next garbage collection.
#[derive(Clone)]
pub struct Db {
    storage: Arc<dyn PageStorage>,
    schema: Schema,
    eavt: PagedIndex,
    aevt: PagedIndex,
    avet: PagedIndex,
    max_eid: EntityId,
    max_tx: TxId,
    next_address: Address,
}

impl fmt::Debug for Db {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Db")
            .field("datoms", &self.eavt.len())
            .field("max_eid", &self.max_eid)
            .field("max_tx", &self.max_tx)
            .finish()
    }
}

impl Db {
    pub(crate) fn empty(storage: Arc<dyn PageStorage>, schema: Schema) -> Self {
        Self {
            storage,
            schema,
            eavt: PagedIndex::empty(IndexKind::Eavt),
            aevt: PagedIndex::empty(IndexKind::Aevt),
            avet: PagedIndex::empty(IndexKind::Avet),
            max_eid: 0,
            max_tx: 0,
            next_address: ROOT_ADDRESS + 1,
        }
    }

    pub(crate) fn from_root(storage: Arc<dyn PageStorage>, root: RootPage) -> Self {
        Self {
            storage,
            schema: root.schema,
            eavt: PagedIndex::from_refs(IndexKind::Eavt, root.eavt),
            aevt: PagedIndex::from_refs(IndexKind::Aevt, root.aevt),
            avet: PagedIndex::from_refs(IndexKind::Avet, root.avet),
            max_eid: root.max_eid,
            max_tx: root.max_tx,
            next_address: root.next_address,
        }
    }

    pub(crate) fn to_root(&self) -> RootPage {
        RootPage {
            format: ROOT_FORMAT,
            schema: self.schema.clone(),
            eavt: self.eavt.refs().to_vec(),
            aevt: self.aevt.refs().to_vec(),
            avet: self.avet.refs().to_vec(),
            max_eid: self.max_eid,
            max_tx: self.max_tx,
            next_address: self.next_address,
        }
    }

    /// Next snapshot with `inserts` and `removes` applied to every index.
    ///
    /// New leaves are stored before this returns. The caller stores the
    /// root. Returns the snapshot and the leaf addresses it superseded.
    pub(crate) fn with_changes(
        &self,
        schema: Schema,
        inserts: &[Datom],
        removes: &[Datom],
        max_eid: EntityId,
        max_tx: TxId,
    ) -> CoreResult<(Db, Vec<Address>)> {
        let storage = self.storage.as_ref();
        let mut next_address = self.next_address;
        let mut superseded = Vec::new();

        let (eavt, mut s) = self.eavt.apply(storage, &mut next_address, inserts, removes)?;
        superseded.append(&mut s);
        let (aevt, mut s) = self.aevt.apply(storage, &mut next_address, inserts, removes)?;
        superseded.append(&mut s);
        let (avet, mut s) = self.avet.apply(storage, &mut next_address, inserts, removes)?;
        superseded.append(&mut s);

        let db = Db {
            storage: self.storage.clone(),
            schema,
            eavt,
            aevt,
            avet,
            max_eid,
            max_tx,
            next_address,
        };
        Ok((db, superseded))
    }

    pub(crate) fn with_schema(mut self, schema: Schema) -> Self {
        self.schema = schema;
        self
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn max_eid(&self) -> EntityId {
        self.max_eid
    }

    pub fn max_tx(&self) -> TxId {
        self.max_tx
    }

    pub fn index(&self, kind: IndexKind) -> &PagedIndex {
        match kind {
            IndexKind::Eavt => &self.eavt,
            IndexKind::Aevt => &self.aevt,
            IndexKind::Avet => &self.avet,
        }
    }

    /// Number of datoms in the current view.
    pub fn datom_count(&self) -> usize {
        self.eavt.len()
    }

    /// Coerce a value bound for `attr` to the stored representation.
    pub(crate) fn coerce(&self, attr: &str, value: Value) -> Value {
        match value {
            Value::Long(n) if self.schema.is_ref(attr) => Value::Ref(n),
            other => other,
        }
    }

    pub fn datoms(&self, kind: IndexKind, comps: &Components) -> CoreResult<Vec<Datom>> {
        let mut comps = comps.clone();
        if let (Some(a), Some(v)) = (&comps.a, comps.v.take()) {
            comps.v = Some(self.coerce(a, v));
        }
        self.index(kind).scan(self.storage.as_ref(), &comps)
    }

    /// `datoms` addressed by positional components in index order.
    pub fn datoms_by_values(&self, kind: IndexKind, values: &[Value]) -> CoreResult<Vec<Datom>> {
        let comps = Components::positional(kind, values).ok_or_else(|| {
            CoreError::InvalidQuery(format!("bad components for {} index", kind.name()))
        })?;
        self.datoms(kind, &comps)
    }

    pub fn entity_datoms(&self, e: EntityId) -> CoreResult<Vec<Datom>> {
        self.datoms(IndexKind::Eavt, &Components::entity(e))
    }

    pub fn values(&self, e: EntityId, attr: &str) -> CoreResult<Vec<Value>> {
        Ok(self
            .datoms(IndexKind::Eavt, &Components::entity_attr(e, attr))?
            .into_iter()
            .map(|d| d.v)
            .collect())
    }

    pub fn entity_exists(&self, e: EntityId) -> CoreResult<bool> {
        Ok(!self.entity_datoms(e)?.is_empty())
    }

    /// Entity holding `value` for `attr`, if any.
    pub fn lookup_unique(&self, attr: &str, value: &Value) -> CoreResult<Option<EntityId>> {
        let hits = self.datoms(IndexKind::Avet, &Components::attr_value(attr, value.clone()))?;
        Ok(hits.first().map(|d| d.e))
    }

    /// Entities referencing `target` through `attr`.
    pub fn referrers(&self, attr: &str, target: EntityId) -> CoreResult<Vec<EntityId>> {
        Ok(self
            .datoms(IndexKind::Avet, &Components::attr_value(attr, Value::Ref(target)))?
            .into_iter()
            .map(|d| d.e)
            .collect())
    }

    /// Root plus every leaf the indexes reference.
    pub fn reachable_addresses(&self) -> HashSet<Address> {
        let mut out: HashSet<Address> = IndexKind::ALL
            .iter()
            .flat_map(|k| self.index(*k).addresses())
            .collect();
        out.insert(ROOT_ADDRESS);
        out
    }
}
