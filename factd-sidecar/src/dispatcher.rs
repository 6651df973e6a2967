//! Request dispatcher: decodes operations and routes them to graphs.
//!
//! Reads (`query`, `pull`, `pull-many`, `datoms`, `graph-stats`) run
//! directly against the graph's current snapshot. Everything that writes
//! goes through the graph's transaction queue. Every failure becomes an
//! error outcome carrying its stable tag.

use futures_util::future::BoxFuture;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use factd_core::Value;

use crate::error::{SidecarError, SidecarResult};
use crate::events::Event;
use crate::protocol::{Op, Outcome, Request, TxItem};
use crate::registry::{GraphRegistry, GraphStats};
use crate::sync;
use crate::transport::RequestHandler;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub requests: u64,
    pub failures: u64,
}

#[derive(Default)]
struct Counters {
    requests: AtomicU64,
    failures: AtomicU64,
}

/// Routes decoded operations. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<GraphRegistry>,
    counters: Arc<Counters>,
}

impl Dispatcher {
    pub fn new(registry: Arc<GraphRegistry>) -> Self {
        Self {
            registry,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn registry(&self) -> &Arc<GraphRegistry> {
        &self.registry
    }

    /// Decode and run one request.
    pub async fn handle_request(&self, request: Request) -> Outcome {
        self.counters.requests.fetch_add(1, Ordering::Relaxed);
        let result = match request.decode_op() {
            Ok(op) => self.dispatch(op).await,
            Err(e) => Err(SidecarError::from(e)),
        };
        match result {
            Ok(value) => Outcome::Ok(value),
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                log::warn!("{} request {} failed: {e}", request.op, request.id);
                e.to_outcome()
            }
        }
    }

    pub async fn dispatch(&self, op: Op) -> SidecarResult<Value> {
        log::debug!("Dispatching {} for {:?}", op.tag(), op.graph());
        let events = self.registry.events();
        match op {
            Op::Ping => Ok(Value::str("pong")),

            Op::CreateOrOpen { name, opts } => {
                let (_, created) = self.registry.get_or_create(&name, opts).await?;
                Ok(Value::Map(BTreeMap::from([
                    ("graph".to_string(), Value::str(name)),
                    ("created".to_string(), Value::Bool(created)),
                ])))
            }

            Op::RemoveGraph { name } => Ok(Value::Bool(self.registry.remove(&name).await?)),

            Op::ListDb => Ok(Value::Vec(
                self.registry
                    .names()
                    .await
                    .into_iter()
                    .map(Value::str)
                    .collect(),
            )),

            Op::Query {
                name,
                query,
                inputs,
            } => {
                let graph = self.registry.get(&name).await?;
                graph
                    .read(move |store| Ok(store.query(&query, &inputs)?))
                    .await
            }

            Op::Pull {
                name,
                selector,
                entity,
            } => {
                let graph = self.registry.get(&name).await?;
                graph
                    .read(move |store| Ok(store.pull(&selector, &entity)?))
                    .await
            }

            Op::PullMany {
                name,
                selector,
                entities,
            } => {
                let graph = self.registry.get(&name).await?;
                graph
                    .read(move |store| Ok(store.pull_many(&selector, &entities)?))
                    .await
            }

            Op::Datoms {
                name,
                index,
                components,
            } => {
                let graph = self.registry.get(&name).await?;
                graph
                    .read(move |store| {
                        let datoms = store.datoms(&index, &components)?;
                        Ok(Value::Vec(datoms.iter().map(|d| d.to_value()).collect()))
                    })
                    .await
            }

            Op::Transact {
                name,
                tx_data,
                tx_meta,
            } => {
                let graph = self.registry.get(&name).await?;
                let report = graph
                    .write(move |store| Ok(store.transact(tx_data, tx_meta)?))
                    .await?;
                events.publish(Event::TxApplied {
                    name,
                    tx: report.tx,
                    datoms: report.tx_data.len(),
                });
                Ok(report.to_value())
            }

            Op::TransactBatch { name, txs } => {
                let graph = self.registry.get(&name).await?;
                // Enqueue all first so the batch stays contiguous in order
                let pending: Vec<_> = txs
                    .into_iter()
                    .map(|TxItem { tx_data, tx_meta }| {
                        graph.write(move |store| Ok(store.transact(tx_data, tx_meta)?))
                    })
                    .collect();
                let mut results = Vec::with_capacity(pending.len());
                for job in pending {
                    results.push(match job.await {
                        Ok(report) => {
                            events.publish(Event::TxApplied {
                                name: name.clone(),
                                tx: report.tx,
                                datoms: report.tx_data.len(),
                            });
                            batch_ok(report.to_value())
                        }
                        Err(e) => batch_err(&e),
                    });
                }
                Ok(Value::Vec(results))
            }

            Op::SyncDatoms { name, datoms, full } => {
                let graph = self.registry.get(&name).await?;
                let receipt = sync::apply_batch(&graph, events, datoms, full).await?;
                Ok(receipt.to_value())
            }

            Op::CollectGarbage { name } => {
                let graph = self.registry.get(&name).await?;
                let deleted = graph
                    .write(|store| Ok(store.collect_garbage()?))
                    .await?;
                Ok(Value::Long(deleted as i64))
            }

            Op::GraphStats { name } => {
                let graph = self.registry.get(&name).await?;
                let stats = tokio::task::spawn_blocking(move || graph.stats()).await??;
                Ok(stats_value(&stats))
            }
        }
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            requests: self.counters.requests.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }
}

impl RequestHandler for Dispatcher {
    fn handle(&self, request: Request) -> BoxFuture<'static, Outcome> {
        let dispatcher = self.clone();
        Box::pin(async move { dispatcher.handle_request(request).await })
    }
}

fn batch_ok(result: Value) -> Value {
    Value::Map(BTreeMap::from([
        ("ok".to_string(), Value::Bool(true)),
        ("result".to_string(), result),
    ]))
}

fn batch_err(e: &SidecarError) -> Value {
    Value::Map(BTreeMap::from([
        ("ok".to_string(), Value::Bool(false)),
        ("message".to_string(), Value::str(e.to_string())),
        ("error-type".to_string(), Value::keyword(e.error_type().as_str())),
    ]))
}

fn long(n: impl TryInto<i64>) -> Value {
    Value::Long(n.try_into().unwrap_or(i64::MAX))
}

fn stats_value(stats: &GraphStats) -> Value {
    let mut map = BTreeMap::new();
    map.insert("graph".to_string(), Value::str(stats.name.as_str()));
    map.insert(
        "path".to_string(),
        stats
            .path
            .as_ref()
            .map(|p| Value::str(p.display().to_string()))
            .unwrap_or(Value::Nil),
    );
    map.insert("datoms".to_string(), long(stats.store.datoms));
    map.insert("max-eid".to_string(), Value::Long(stats.store.max_eid));
    map.insert("max-tx".to_string(), Value::Long(stats.store.max_tx));
    map.insert("leaves".to_string(), long(stats.store.leaves));
    map.insert("stored-pages".to_string(), long(stats.stored_pages));
    map.insert("cache-hits".to_string(), long(stats.cache.hits));
    map.insert("cache-misses".to_string(), long(stats.cache.misses));
    map.insert("cache-evictions".to_string(), long(stats.cache.evictions));
    map.insert("cache-pages".to_string(), long(stats.cache.resident_pages));
    map.insert("cache-bytes".to_string(), long(stats.cache.resident_bytes));
    map.insert("queue-pending".to_string(), long(stats.queue.pending()));
    map.insert("queue-completed".to_string(), long(stats.queue.completed));
    map.insert("sync-batches".to_string(), long(stats.sync.batches));
    map.insert("sync-facts".to_string(), long(stats.sync.facts));
    map.insert("uptime-secs".to_string(), long(stats.uptime_secs));
    Value::Map(map)
}
