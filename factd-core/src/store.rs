//! Fact store: the current snapshot plus commit and maintenance.

use log::{debug, info};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::datom::{Datom, IndexKind};
use crate::db::Db;
use crate::error::{CoreError, CoreResult};
use crate::page::{decode_root, encode_root};
use crate::pull::{self, PullPattern};
use crate::query;
use crate::schema::Schema;
use crate::storage::{Address, PageStorage, StorageError, ROOT_ADDRESS};
use crate::tx::{self, Prepared, TxOp, TxReport};
use crate::value::{EntityId, TxId, Value};

/// Counters reported by [`FactStore::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub datoms: usize,
    pub max_eid: EntityId,
    pub max_tx: TxId,
    pub leaves: usize,
}

/// One fact store over a [`PageStorage`].
///
/// Reads run against an immutable snapshot and never block on writers.
/// Writers are expected to be serialized by the caller; an internal lock
/// keeps concurrent writers from losing updates regardless.
///
/// Every published snapshot is tracked weakly so garbage collection keeps
/// the pages of snapshots that readers still hold.
pub struct FactStore {
    storage: Arc<dyn PageStorage>,
    current: RwLock<Arc<Db>>,
    published: Mutex<Vec<Weak<Db>>>,
    writer: Mutex<()>,
}

impl FactStore {
    /// Open the store persisted in `storage`, or create an empty one.
    ///
    /// `schema` is merged over any persisted schema.
    pub fn open(storage: Arc<dyn PageStorage>, schema: Schema) -> CoreResult<Self> {
        let (db, dirty) = match storage.restore(ROOT_ADDRESS) {
            Ok(bytes) => {
                let db = Db::from_root(storage.clone(), decode_root(ROOT_ADDRESS, &bytes)?);
                let merged = db.schema().merged(&schema);
                let dirty = merged != *db.schema();
                info!(
                    "Reopened fact store: {} datoms, max eid {}, max tx {}",
                    db.datom_count(),
                    db.max_eid(),
                    db.max_tx()
                );
                (db.with_schema(merged), dirty)
            }
            Err(StorageError::NotFound(_)) => {
                debug!("No root page, creating empty fact store");
                (Db::empty(storage.clone(), schema), true)
            }
            Err(e) => return Err(e.into()),
        };
        if dirty {
            storage.store(ROOT_ADDRESS, encode_root(&db.to_root())?)?;
        }
        let db = Arc::new(db);
        Ok(Self {
            storage,
            published: Mutex::new(vec![Arc::downgrade(&db)]),
            current: RwLock::new(db),
            writer: Mutex::new(()),
        })
    }

    /// In-memory store, mostly for tests.
    pub fn in_memory(schema: Schema) -> CoreResult<Self> {
        Self::open(Arc::new(crate::storage::MemoryStorage::new()), schema)
    }

    /// Current snapshot.
    pub fn db(&self) -> Arc<Db> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn storage(&self) -> &Arc<dyn PageStorage> {
        &self.storage
    }

    pub fn transact(&self, ops: Vec<TxOp>, tx_meta: Option<Value>) -> CoreResult<TxReport> {
        let _guard = self.writer.lock().unwrap_or_else(|p| p.into_inner());
        let db = self.db();
        let prepared = tx::prepare(&db, ops, tx_meta)?;
        self.commit(&db, prepared)
    }

    /// Apply datoms from the authoritative peer as one transaction.
    pub fn apply_datoms(&self, datoms: &[Datom]) -> CoreResult<TxReport> {
        let _guard = self.writer.lock().unwrap_or_else(|p| p.into_inner());
        let db = self.db();
        let prepared = tx::prepare_sync(&db, datoms)?;
        self.commit(&db, prepared)
    }

    /// Store new leaves, then the root, then publish the snapshot. A
    /// failure at any step leaves the previous root and snapshot current.
    fn commit(&self, db: &Db, prepared: Prepared) -> CoreResult<TxReport> {
        let Prepared {
            max_eid,
            inserts,
            removes,
            report,
        } = prepared;
        let (next, superseded) =
            db.with_changes(db.schema().clone(), &inserts, &removes, max_eid, report.tx)?;
        self.storage.store(ROOT_ADDRESS, encode_root(&next.to_root())?)?;
        let next = Arc::new(next);
        {
            let mut published = self.published.lock().unwrap_or_else(|p| p.into_inner());
            published.retain(|snapshot| snapshot.strong_count() > 0);
            published.push(Arc::downgrade(&next));
        }
        *self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = next;
        debug!(
            "Committed tx {}: +{} -{} datoms, {} leaves superseded",
            report.tx,
            inserts.len(),
            removes.len(),
            superseded.len()
        );
        Ok(report)
    }

    pub fn query(&self, text: &str, inputs: &[Value]) -> CoreResult<Value> {
        query::q(&self.db(), text, inputs)
    }

    pub fn pull(&self, selector: &str, entity: &Value) -> CoreResult<Value> {
        pull::pull(&self.db(), &PullPattern::parse(selector)?, entity)
    }

    pub fn pull_many(&self, selector: &str, entities: &[Value]) -> CoreResult<Value> {
        pull::pull_many(&self.db(), &PullPattern::parse(selector)?, entities)
    }

    /// Datoms of `index` matching positional `components`.
    pub fn datoms(&self, index: &str, components: &[Value]) -> CoreResult<Vec<Datom>> {
        let kind = IndexKind::parse(index)
            .ok_or_else(|| CoreError::InvalidQuery(format!("unknown index {index}")))?;
        self.db().datoms_by_values(kind, components)
    }

    /// Pages reachable from the current root or any snapshot still held.
    fn live_addresses(&self) -> HashSet<Address> {
        let mut published = self.published.lock().unwrap_or_else(|p| p.into_inner());
        published.retain(|snapshot| snapshot.strong_count() > 0);
        let mut live = self.db().reachable_addresses();
        for snapshot in published.iter().filter_map(Weak::upgrade) {
            live.extend(snapshot.reachable_addresses());
        }
        live
    }

    /// Delete every stored page that neither the current root nor a live
    /// snapshot reaches. Returns the number of pages deleted.
    pub fn collect_garbage(&self) -> CoreResult<usize> {
        let _guard = self.writer.lock().unwrap_or_else(|p| p.into_inner());
        let reachable = self.live_addresses();
        let garbage: Vec<_> = self
            .storage
            .list_addresses()?
            .into_iter()
            .filter(|a| !reachable.contains(a))
            .collect();
        self.storage.delete(&garbage)?;
        info!(
            "Collected {} unreachable pages, {} live",
            garbage.len(),
            reachable.len()
        );
        Ok(garbage.len())
    }

    pub fn flush(&self) -> CoreResult<()> {
        Ok(self.storage.flush()?)
    }

    pub fn stats(&self) -> StoreStats {
        let db = self.db();
        StoreStats {
            datoms: db.datom_count(),
            max_eid: db.max_eid(),
            max_tx: db.max_tx(),
            leaves: IndexKind::ALL
                .iter()
                .map(|k| db.index(*k).refs().len())
                .sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::AttrSpec;
    use crate::storage::MemoryStorage;
    use std::collections::BTreeMap;

    fn graph_schema() -> Schema {
        Schema::new()
            .with("uuid", AttrSpec::identity())
            .with("email", AttrSpec::unique_value())
            .with("tags", AttrSpec::many())
            .with("page", AttrSpec::reference())
            .with(
                "refs",
                AttrSpec::reference().with_cardinality(crate::schema::Cardinality::Many),
            )
    }

    fn store() -> FactStore {
        FactStore::in_memory(graph_schema()).unwrap()
    }

    fn names(store: &FactStore) -> Value {
        store
            .query("[:find ?n :where [_ :name ?n]]", &[])
            .unwrap()
    }

    #[test]
    fn test_upsert_on_identity_attribute() {
        let store = store();
        store
            .transact(vec![TxOp::entity([("uuid", "U1"), ("name", "page-1")])], None)
            .unwrap();
        store
            .transact(vec![TxOp::entity([("other", "unrelated")])], None)
            .unwrap();
        store
            .transact(vec![TxOp::entity([("uuid", "U1"), ("name", "page-1")])], None)
            .unwrap();
        let holders = store
            .query("[:find ?e :where [?e :uuid \"U1\"]]", &[])
            .unwrap();
        assert_eq!(holders.as_vec().unwrap().len(), 1);
    }

    #[test]
    fn test_rename_replaces_cardinality_one_value() {
        let store = store();
        store
            .transact(vec![TxOp::entity([("uuid", "U1"), ("name", "page-1")])], None)
            .unwrap();
        let report = store
            .transact(
                vec![TxOp::entity([("uuid", "U1"), ("name", "page-1-renamed")])],
                None,
            )
            .unwrap();
        assert_eq!(
            names(&store),
            Value::Vec(vec![Value::Vec(vec![Value::from("page-1-renamed")])])
        );
        let retracted: Vec<_> = report.tx_data.iter().filter(|d| !d.added).collect();
        assert_eq!(retracted.len(), 1);
        assert_eq!(retracted[0].v, Value::from("page-1"));
    }

    #[test]
    fn test_cardinality_many_set_semantics() {
        let store = store();
        let report = store
            .transact(
                vec![TxOp::Entity(BTreeMap::from([
                    ("db/id".to_string(), Value::from("t")),
                    (
                        "tags".to_string(),
                        Value::Vec(vec![Value::from("a"), Value::from("b")]),
                    ),
                ]))],
                None,
            )
            .unwrap();
        let e = report.tempids["t"];
        store.transact(vec![TxOp::add(e, "tags", "c")], None).unwrap();
        store.transact(vec![TxOp::add(e, "tags", "a")], None).unwrap();
        store.transact(vec![TxOp::retract(e, "tags", "b")], None).unwrap();
        let tags = store
            .query("[:find [?t ...] :in $ ?e :where [?e :tags ?t]]", &[Value::Long(e)])
            .unwrap();
        assert_eq!(tags, Value::Vec(vec![Value::from("a"), Value::from("c")]));
    }

    #[test]
    fn test_unique_value_conflict_leaves_state_untouched() {
        let store = store();
        store
            .transact(vec![TxOp::entity([("email", "a@x")])], None)
            .unwrap();
        let before = store.stats();
        let err = store
            .transact(
                vec![
                    TxOp::entity([("name", "ignored")]),
                    TxOp::entity([("email", "a@x")]),
                ],
                None,
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::UniqueConflict { .. }));
        assert_eq!(store.stats(), before);
    }

    #[test]
    fn test_explicit_unknown_entity_is_rejected() {
        let store = store();
        let err = store.transact(vec![TxOp::add(999, "name", "x")], None).unwrap_err();
        assert!(matches!(err, CoreError::UnknownEntity(999)));
    }

    #[test]
    fn test_lookup_ref_and_reverse_pull() {
        let store = store();
        store
            .transact(
                vec![
                    TxOp::entity([("db/id", "p"), ("uuid", "P"), ("name", "page")]),
                    TxOp::Entity(BTreeMap::from([
                        ("uuid".to_string(), Value::from("B")),
                        ("content".to_string(), Value::from("hello")),
                        ("page".to_string(), Value::from("p")),
                    ])),
                ],
                None,
            )
            .unwrap();
        let block = store
            .pull(
                "[:content {:page [:name]}]",
                &Value::Vec(vec![Value::keyword("uuid"), Value::from("B")]),
            )
            .unwrap();
        let page = &block.as_map().unwrap()["page"];
        assert_eq!(page.as_map().unwrap()["name"], Value::from("page"));

        let page = store
            .pull(
                "[:name :_page]",
                &Value::Vec(vec![Value::keyword("uuid"), Value::from("P")]),
            )
            .unwrap();
        let page = page.as_map().unwrap();
        assert_eq!(page["name"], Value::from("page"));
        assert_eq!(page["_page"].as_vec().unwrap().len(), 1);

        let missing = store
            .pull("[*]", &Value::Vec(vec![Value::keyword("uuid"), Value::from("nope")]))
            .unwrap();
        assert_eq!(missing, Value::Nil);
    }

    #[test]
    fn test_retract_entity_removes_references() {
        let store = store();
        let report = store
            .transact(
                vec![
                    TxOp::entity([("db/id", "p"), ("name", "page")]),
                    TxOp::entity([("db/id", "b"), ("content", "x"), ("page", "p")]),
                ],
                None,
            )
            .unwrap();
        let p = report.tempids["p"];
        let b = report.tempids["b"];
        store
            .transact(vec![TxOp::RetractEntity { e: tx::EntityRef::Id(p) }], None)
            .unwrap();
        assert_eq!(store.pull("[*]", &Value::Long(p)).unwrap(), Value::Nil);
        let block = store.pull("[*]", &Value::Long(b)).unwrap();
        assert!(!block.as_map().unwrap().contains_key("page"));
    }

    #[test]
    fn test_query_join_and_predicate() {
        let store = store();
        store
            .transact(
                vec![
                    TxOp::entity([("db/id", "p"), ("name", "journal")]),
                    TxOp::Entity(BTreeMap::from([
                        ("content".to_string(), Value::from("one")),
                        ("order".to_string(), Value::Long(1)),
                        ("page".to_string(), Value::from("p")),
                    ])),
                    TxOp::Entity(BTreeMap::from([
                        ("content".to_string(), Value::from("two")),
                        ("order".to_string(), Value::Long(2)),
                        ("page".to_string(), Value::from("p")),
                    ])),
                ],
                None,
            )
            .unwrap();
        let result = store
            .query(
                "[:find ?c :in $ ?name :where [?p :name ?name] [?b :page ?p] [?b :order ?o] [(> ?o 1)] [?b :content ?c]]",
                &[Value::from("journal")],
            )
            .unwrap();
        assert_eq!(result, Value::Vec(vec![Value::Vec(vec![Value::from("two")])]));
    }

    #[test]
    fn test_sync_rename_p1_to_p2() {
        let store = store();
        store
            .apply_datoms(&[Datom::new(1, "name", Value::from("p1"), 100, true)])
            .unwrap();
        store
            .apply_datoms(&[Datom::new(1, "name", Value::from("p2"), 101, true)])
            .unwrap();
        let pulled = store.pull("[:name]", &Value::Long(1)).unwrap();
        assert_eq!(pulled.as_map().unwrap()["name"], Value::from("p2"));
        assert_eq!(store.stats().max_eid, 1);
    }

    #[test]
    fn test_sync_assert_batch_is_idempotent() {
        let store = store();
        let batch = vec![
            Datom::new(1, "uuid", Value::from("A"), 5, true),
            Datom::new(1, "tags", Value::from("x"), 5, true),
            Datom::new(2, "name", Value::from("n"), 5, true),
        ];
        store.apply_datoms(&batch).unwrap();
        let first = store.db().entity_datoms(1).unwrap();
        let report = store.apply_datoms(&batch).unwrap();
        assert!(report.tx_data.is_empty());
        assert_eq!(store.db().entity_datoms(1).unwrap(), first);
        assert_eq!(store.stats().datoms, 3);
    }

    #[test]
    fn test_sync_redirects_identity_holder() {
        let store = store();
        store
            .apply_datoms(&[Datom::new(7, "uuid", Value::from("A"), 1, true)])
            .unwrap();
        store
            .apply_datoms(&[
                Datom::new(40, "uuid", Value::from("A"), 2, true),
                Datom::new(40, "name", Value::from("moved"), 2, true),
            ])
            .unwrap();
        let pulled = store.pull("[:name]", &Value::Long(7)).unwrap();
        assert_eq!(pulled.as_map().unwrap()["name"], Value::from("moved"));
        assert_eq!(store.pull("[*]", &Value::Long(40)).unwrap(), Value::Nil);
    }

    #[test]
    fn test_reopen_from_storage() {
        let storage: Arc<dyn PageStorage> = Arc::new(MemoryStorage::new());
        {
            let store = FactStore::open(storage.clone(), graph_schema()).unwrap();
            let ops: Vec<TxOp> = (0..1500)
                .map(|i| TxOp::entity([("uuid", format!("u{i}")), ("name", format!("n{i}"))]))
                .collect();
            store.transact(ops, None).unwrap();
        }
        let store = FactStore::open(storage, Schema::new()).unwrap();
        assert_eq!(store.stats().datoms, 3000);
        assert!(store.db().schema().unique("uuid").is_some());
        let e = store
            .query("[:find ?e . :where [?e :uuid \"u1234\"]]", &[])
            .unwrap();
        let pulled = store.pull("[:name]", &e).unwrap();
        assert_eq!(pulled.as_map().unwrap()["name"], Value::from("n1234"));
    }

    #[test]
    fn test_collect_garbage_keeps_reachable_pages() {
        let store = store();
        for i in 0..5 {
            store
                .transact(vec![TxOp::entity([("uuid", "U"), ("name", format!("v{i}").as_str())])], None)
                .unwrap();
        }
        let deleted = store.collect_garbage().unwrap();
        assert!(deleted > 0);
        let live = store.storage().list_addresses().unwrap();
        let reachable = store.db().reachable_addresses();
        assert_eq!(live.len(), reachable.len());
        assert_eq!(names(&store), Value::Vec(vec![Value::Vec(vec![Value::from("v4")])]));
    }

    #[test]
    fn test_collect_garbage_spares_held_snapshot() {
        let store = store();
        store
            .transact(vec![TxOp::entity([("uuid", "U"), ("name", "before")])], None)
            .unwrap();
        let old = store.db();
        store
            .transact(vec![TxOp::entity([("uuid", "U"), ("name", "after")])], None)
            .unwrap();

        store.collect_garbage().unwrap();
        let e = old.lookup_unique("uuid", &Value::from("U")).unwrap().unwrap();
        assert_eq!(old.values(e, "name").unwrap(), vec![Value::from("before")]);
        assert_eq!(store.db().values(e, "name").unwrap(), vec![Value::from("after")]);

        drop(old);
        assert!(store.collect_garbage().unwrap() > 0);
        assert_eq!(names(&store), Value::Vec(vec![Value::Vec(vec![Value::from("after")])]));
    }

    #[test]
    fn test_identity_claims_merge_tempids() {
        let store = FactStore::in_memory(
            Schema::new()
                .with("id1", AttrSpec::identity())
                .with("id2", AttrSpec::identity()),
        )
        .unwrap();
        let add = |e: &str, a: &str, v: &str| TxOp::Add {
            e: tx::EntityRef::Temp(e.into()),
            a: a.into(),
            v: Value::from(v),
        };
        let report = store
            .transact(
                vec![
                    add("b", "id1", "X"),
                    add("c", "id2", "Y"),
                    add("b", "id2", "Y"),
                    add("c", "id1", "X"),
                    add("a", "id1", "X"),
                ],
                None,
            )
            .unwrap();
        let ids = &report.tempids;
        assert_eq!(ids["a"], ids["b"]);
        assert_eq!(ids["b"], ids["c"]);
        assert_eq!(store.stats().max_eid, ids["a"]);
        assert_eq!(store.stats().datoms, 2);
    }

    #[test]
    fn test_tempid_bound_to_two_holders_is_rejected() {
        let store = FactStore::in_memory(
            Schema::new()
                .with("id1", AttrSpec::identity())
                .with("id2", AttrSpec::identity()),
        )
        .unwrap();
        store
            .transact(
                vec![
                    TxOp::entity([("id1", "X")]),
                    TxOp::entity([("id2", "Y")]),
                ],
                None,
            )
            .unwrap();
        let before = store.stats();
        let add = |e: &str, a: &str, v: &str| TxOp::Add {
            e: tx::EntityRef::Temp(e.into()),
            a: a.into(),
            v: Value::from(v),
        };
        // "a" and "b" share a new identity value but upsert to different holders
        let err = store
            .transact(
                vec![
                    add("a", "id1", "X"),
                    add("b", "id2", "Y"),
                    add("a", "id1", "Z"),
                    add("b", "id1", "Z"),
                ],
                None,
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidTx(_) | CoreError::UniqueConflict { .. }));
        assert_eq!(store.stats(), before);
    }

    #[test]
    fn test_deeply_nested_query_is_an_error() {
        let store = store();
        let err = store.query(&"[".repeat(200_000), &[]).unwrap_err();
        assert!(matches!(err, CoreError::Edn(_)));
        assert!(store.pull(&"[{:page ".repeat(50_000), &Value::Long(1)).is_err());
    }

    #[test]
    fn test_datoms_by_index() {
        let store = store();
        store
            .transact(vec![TxOp::entity([("uuid", "A"), ("name", "x")])], None)
            .unwrap();
        let hits = store
            .datoms("avet", &[Value::keyword("uuid"), Value::from("A")])
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(store.datoms("vaet", &[]).is_err());
    }
}
