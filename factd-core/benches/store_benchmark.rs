use criterion::{black_box, criterion_group, criterion_main, Criterion};
use factd_core::{AttrSpec, Datom, FactStore, Schema, TxOp, Value};

fn schema() -> Schema {
    Schema::new()
        .with("block/uuid", AttrSpec::identity())
        .with("block/page", AttrSpec::reference())
}

fn seeded(blocks: i64) -> FactStore {
    let store = FactStore::in_memory(schema()).unwrap();
    let ops: Vec<TxOp> = (0..blocks)
        .map(|i| {
            TxOp::entity([
                ("block/uuid", Value::from(format!("b{i}"))),
                ("block/content", Value::from(format!("content {i}"))),
            ])
        })
        .collect();
    store.transact(ops, None).unwrap();
    store
}

fn bench_transact_1k(c: &mut Criterion) {
    c.bench_function("transact_1k_entities", |b| {
        b.iter(|| black_box(seeded(1_000)))
    });
}

fn bench_single_update(c: &mut Criterion) {
    let store = seeded(10_000);
    let mut n = 0;
    c.bench_function("rename_one_of_10k", |b| {
        b.iter(|| {
            n += 1;
            store
                .transact(
                    vec![TxOp::entity([
                        ("block/uuid", Value::from("b5000")),
                        ("block/content", Value::from(format!("edit {n}"))),
                    ])],
                    None,
                )
                .unwrap();
        })
    });
}

fn bench_query_lookup(c: &mut Criterion) {
    let store = seeded(10_000);
    c.bench_function("query_by_identity_10k", |b| {
        b.iter(|| {
            black_box(
                store
                    .query(
                        "[:find ?c . :in $ ?u :where [?e :block/uuid ?u] [?e :block/content ?c]]",
                        &[Value::from("b7777")],
                    )
                    .unwrap(),
            )
        })
    });
}

fn bench_sync_batch(c: &mut Criterion) {
    let batch: Vec<Datom> = (1..=2_000)
        .map(|e| Datom::new(e, "block/content", Value::from(format!("c{e}")), 1, true))
        .collect();
    c.bench_function("sync_batch_2000", |b| {
        b.iter(|| {
            let store = FactStore::in_memory(schema()).unwrap();
            black_box(store.apply_datoms(&batch).unwrap())
        })
    });
}

criterion_group!(
    benches,
    bench_transact_1k,
    bench_single_update,
    bench_query_lookup,
    bench_sync_batch,
);
criterion_main!(benches);
