//! Batched sync of facts from the authoritative peer.
//!
//! The peer streams its facts in fixed-size batches. The first batch of a
//! resync carries `full`; every batch is one transaction through the
//! graph's queue and the producer waits for each acknowledgement before
//! sending the next, so batches apply in order.
//!
//! `full` marks where a resync starts. It does not clear the graph: facts
//! the peer no longer has stay until it retracts them.

use std::collections::BTreeMap;
use std::sync::Arc;

use factd_core::{Datom, TxId, Value};

use crate::client::SidecarClient;
use crate::error::{SidecarError, SidecarResult};
use crate::events::{Event, EventBus};
use crate::registry::Graph;

/// Facts per batch unless configured otherwise.
pub const DEFAULT_BATCH_SIZE: usize = 2000;

/// Acknowledgement of one applied batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncReceipt {
    pub tx: TxId,
    /// Facts in the batch
    pub received: usize,
    /// Facts that changed the graph
    pub applied: usize,
    pub full: bool,
}

impl SyncReceipt {
    pub fn to_value(&self) -> Value {
        Value::Map(BTreeMap::from([
            ("tx".to_string(), Value::Long(self.tx)),
            ("received".to_string(), Value::Long(self.received as i64)),
            ("applied".to_string(), Value::Long(self.applied as i64)),
            ("full".to_string(), Value::Bool(self.full)),
        ]))
    }

    pub fn from_value(value: &Value) -> SidecarResult<Self> {
        let malformed = || SidecarError::Application(format!("malformed sync receipt {value}"));
        let map = value.as_map().ok_or_else(malformed)?;
        let long = |key: &str| map.get(key).and_then(Value::as_long).ok_or_else(malformed);
        Ok(Self {
            tx: long("tx")?,
            received: long("received")? as usize,
            applied: long("applied")? as usize,
            full: matches!(map.get("full"), Some(Value::Bool(true))),
        })
    }
}

/// Apply one batch through the graph's queue.
pub async fn apply_batch(
    graph: &Arc<Graph>,
    events: &EventBus,
    datoms: Vec<Datom>,
    full: bool,
) -> SidecarResult<SyncReceipt> {
    let received = datoms.len();
    let job_graph = graph.clone();
    let report = graph
        .queue()
        .submit(move || {
            let report = job_graph.store().apply_datoms(&datoms)?;
            job_graph.record_sync(received, full);
            Ok(report)
        })
        .await?;

    let receipt = SyncReceipt {
        tx: report.tx,
        received,
        applied: report.tx_data.len(),
        full,
    };
    log::debug!(
        "Synced {} facts into {} (tx {}, {} changed, full: {full})",
        received,
        graph.name(),
        receipt.tx,
        receipt.applied
    );
    events.publish(Event::SyncApplied {
        name: graph.name().to_string(),
        tx: receipt.tx,
        datoms: receipt.applied,
        full,
    });
    Ok(receipt)
}

/// Totals for a multi-batch sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub batches: usize,
    pub facts: usize,
    pub applied: usize,
    pub last_tx: Option<TxId>,
}

/// Peer-side driver that splits facts into ordered batches.
pub struct SyncProducer<'a> {
    client: &'a SidecarClient,
    graph: String,
    batch_size: usize,
}

impl<'a> SyncProducer<'a> {
    pub fn new(client: &'a SidecarClient, graph: impl Into<String>) -> Self {
        Self {
            client,
            graph: graph.into(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Resync: the first batch carries `full`. An empty set still sends
    /// one empty `full` batch so the sidecar sees the resync start.
    pub async fn full_sync(&self, datoms: &[Datom]) -> SidecarResult<SyncSummary> {
        if datoms.is_empty() {
            let mut summary = SyncSummary::default();
            let receipt = self.client.sync_datoms(&self.graph, Vec::new(), true).await?;
            summary.record(&receipt);
            return Ok(summary);
        }
        self.send(datoms, true).await
    }

    /// Incremental batches, none marked `full`.
    pub async fn incremental(&self, datoms: &[Datom]) -> SidecarResult<SyncSummary> {
        self.send(datoms, false).await
    }

    async fn send(&self, datoms: &[Datom], full: bool) -> SidecarResult<SyncSummary> {
        let mut summary = SyncSummary::default();
        for (i, chunk) in datoms.chunks(self.batch_size).enumerate() {
            let receipt = self
                .client
                .sync_datoms(&self.graph, chunk.to_vec(), full && i == 0)
                .await?;
            summary.record(&receipt);
        }
        log::info!(
            "Synced {} facts to {} in {} batches",
            summary.facts,
            self.graph,
            summary.batches
        );
        Ok(summary)
    }
}

impl SyncSummary {
    fn record(&mut self, receipt: &SyncReceipt) {
        self.batches += 1;
        self.facts += receipt.received;
        self.applied += receipt.applied;
        self.last_tx = Some(receipt.tx);
    }
}
