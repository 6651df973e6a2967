//! Client for the authoritative peer's side of the connection.
//!
//! Provides:
//! - Connection lifecycle (connect, close, reconnect)
//! - Typed helpers for every operation
//! - Push subscription that survives reconnects

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};

use factd_core::{Datom, TxOp, Value};

use crate::error::{SidecarError, SidecarResult};
use crate::protocol::{ErrorType, GraphOptions, Op, Push, TxItem};
use crate::sync::SyncReceipt;
use crate::transport::{Connection, TransportConfig};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub transport: TransportConfig,
    /// Reconnect before a request when the connection is gone
    pub auto_reconnect: bool,
    /// Pushes buffered per subscriber
    pub push_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            auto_reconnect: true,
            push_capacity: 256,
        }
    }
}

/// The sidecar client.
///
/// Requests may be issued concurrently from many tasks; they are pipelined
/// over one connection and matched to responses by id. A request in flight
/// when the connection drops fails with [`SidecarError::ConnectionClosed`]
/// and is not resent.
pub struct SidecarClient {
    addr: String,
    config: ClientConfig,
    conn: RwLock<Option<Arc<Connection>>>,
    state: RwLock<ConnectionState>,
    pushes: broadcast::Sender<Push>,
}

impl SidecarClient {
    pub fn new(addr: impl Into<String>, config: ClientConfig) -> Self {
        let (pushes, _) = broadcast::channel(config.push_capacity);
        Self {
            addr: addr.into(),
            config,
            conn: RwLock::new(None),
            state: RwLock::new(ConnectionState::Disconnected),
            pushes,
        }
    }

    /// Create a client and connect it.
    pub async fn connect(addr: impl Into<String>, config: ClientConfig) -> SidecarResult<Self> {
        let client = Self::new(addr, config);
        client.reconnect().await?;
        Ok(client)
    }

    /// Drop the current connection, if any, and open a new one.
    pub async fn reconnect(&self) -> SidecarResult<()> {
        let mut conn = self.conn.write().await;
        if let Some(old) = conn.take() {
            old.close();
        }
        self.open(&mut conn).await.map(|_| ())
    }

    /// Open a connection into `slot`. Callers hold the `conn` write lock.
    async fn open(&self, slot: &mut Option<Arc<Connection>>) -> SidecarResult<Arc<Connection>> {
        *self.state.write().await = ConnectionState::Connecting;
        match Connection::connect(&self.addr, self.config.transport.clone(), self.pushes.clone())
            .await
        {
            Ok(fresh) => {
                let fresh = Arc::new(fresh);
                *slot = Some(fresh.clone());
                *self.state.write().await = ConnectionState::Connected;
                log::info!("Connected to sidecar at {}", self.addr);
                Ok(fresh)
            }
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                log::warn!("Failed to connect to sidecar at {}: {e}", self.addr);
                Err(e)
            }
        }
    }

    pub async fn connection_state(&self) -> ConnectionState {
        let state = *self.state.read().await;
        if state == ConnectionState::Connected {
            let closed = self
                .conn
                .read()
                .await
                .as_ref()
                .map_or(true, |c| c.is_closed());
            if closed {
                return ConnectionState::Disconnected;
            }
        }
        state
    }

    /// Pushes from the sidecar, across reconnects.
    pub fn subscribe(&self) -> broadcast::Receiver<Push> {
        self.pushes.subscribe()
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub async fn close(&self) {
        if let Some(conn) = self.conn.write().await.take() {
            conn.close();
        }
        *self.state.write().await = ConnectionState::Disconnected;
    }

    async fn connection(&self) -> SidecarResult<Arc<Connection>> {
        if let Some(conn) = self.conn.read().await.as_ref() {
            if !conn.is_closed() {
                return Ok(conn.clone());
            }
        }
        if !self.config.auto_reconnect {
            return Err(SidecarError::ConnectionClosed);
        }
        let mut slot = self.conn.write().await;
        // Another task may have reconnected while this one waited
        if let Some(conn) = slot.as_ref() {
            if !conn.is_closed() {
                return Ok(conn.clone());
            }
        }
        log::debug!("Connection to {} lost, reconnecting", self.addr);
        if let Some(old) = slot.take() {
            old.close();
        }
        self.open(&mut slot).await
    }

    pub async fn request(&self, op: &Op) -> SidecarResult<Value> {
        self.request_with_timeout(op, self.config.transport.request_timeout)
            .await
    }

    pub async fn request_with_timeout(&self, op: &Op, timeout: Duration) -> SidecarResult<Value> {
        let conn = self.connection().await?;
        conn.request_with_timeout(op, timeout).await
    }

    // ─── Typed operations ─────────────────────────────────────────────

    pub async fn ping(&self) -> SidecarResult<()> {
        self.request(&Op::Ping).await.map(|_| ())
    }

    /// Returns `true` when the graph was opened by this call.
    pub async fn create_or_open(&self, name: &str, opts: GraphOptions) -> SidecarResult<bool> {
        let value = self
            .request(&Op::CreateOrOpen {
                name: name.to_string(),
                opts,
            })
            .await?;
        Ok(matches!(
            value.as_map().and_then(|m| m.get("created")),
            Some(Value::Bool(true))
        ))
    }

    pub async fn remove_graph(&self, name: &str) -> SidecarResult<bool> {
        let value = self
            .request(&Op::RemoveGraph {
                name: name.to_string(),
            })
            .await?;
        Ok(value == Value::Bool(true))
    }

    pub async fn list_db(&self) -> SidecarResult<Vec<String>> {
        let value = self.request(&Op::ListDb).await?;
        Ok(value
            .as_vec()
            .unwrap_or_default()
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect())
    }

    pub async fn query(&self, name: &str, query: &str, inputs: Vec<Value>) -> SidecarResult<Value> {
        self.request(&Op::Query {
            name: name.to_string(),
            query: query.to_string(),
            inputs,
        })
        .await
    }

    pub async fn pull(&self, name: &str, selector: &str, entity: Value) -> SidecarResult<Value> {
        self.request(&Op::Pull {
            name: name.to_string(),
            selector: selector.to_string(),
            entity,
        })
        .await
    }

    pub async fn pull_many(
        &self,
        name: &str,
        selector: &str,
        entities: Vec<Value>,
    ) -> SidecarResult<Value> {
        self.request(&Op::PullMany {
            name: name.to_string(),
            selector: selector.to_string(),
            entities,
        })
        .await
    }

    pub async fn datoms(
        &self,
        name: &str,
        index: &str,
        components: Vec<Value>,
    ) -> SidecarResult<Vec<Value>> {
        let value = self
            .request(&Op::Datoms {
                name: name.to_string(),
                index: index.to_string(),
                components,
            })
            .await?;
        Ok(value.as_vec().unwrap_or_default().to_vec())
    }

    /// Returns the transaction report map (`tx`, `tx-data`, `tempids`,
    /// `tx-meta`).
    pub async fn transact(
        &self,
        name: &str,
        tx_data: Vec<TxOp>,
        tx_meta: Option<Value>,
    ) -> SidecarResult<Value> {
        self.request(&Op::Transact {
            name: name.to_string(),
            tx_data,
            tx_meta,
        })
        .await
    }

    /// One result per transaction, in order. A failed item does not stop
    /// the ones after it.
    pub async fn transact_batch(
        &self,
        name: &str,
        txs: Vec<TxItem>,
    ) -> SidecarResult<Vec<SidecarResult<Value>>> {
        let value = self
            .request(&Op::TransactBatch {
                name: name.to_string(),
                txs,
            })
            .await?;
        Ok(value
            .as_vec()
            .unwrap_or_default()
            .iter()
            .map(batch_item)
            .collect())
    }

    pub async fn sync_datoms(
        &self,
        name: &str,
        datoms: Vec<Datom>,
        full: bool,
    ) -> SidecarResult<SyncReceipt> {
        let value = self
            .request(&Op::SyncDatoms {
                name: name.to_string(),
                datoms,
                full,
            })
            .await?;
        SyncReceipt::from_value(&value)
    }

    /// Returns the number of pages deleted.
    pub async fn collect_garbage(&self, name: &str) -> SidecarResult<u64> {
        let value = self
            .request(&Op::CollectGarbage {
                name: name.to_string(),
            })
            .await?;
        Ok(value.as_long().unwrap_or(0).max(0) as u64)
    }

    pub async fn graph_stats(&self, name: &str) -> SidecarResult<Value> {
        self.request(&Op::GraphStats {
            name: name.to_string(),
        })
        .await
    }
}

fn batch_item(item: &Value) -> SidecarResult<Value> {
    let map = item
        .as_map()
        .ok_or_else(|| SidecarError::Application(format!("malformed batch item {item}")))?;
    if let Some(Value::Bool(true)) = map.get("ok") {
        return Ok(map.get("result").cloned().unwrap_or(Value::Nil));
    }
    let message = map
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("transaction failed")
        .to_string();
    let error_type = map
        .get("error-type")
        .and_then(Value::as_attr)
        .and_then(ErrorType::parse)
        .unwrap_or(ErrorType::Application);
    Err(SidecarError::Remote {
        error_type,
        message,
    })
}
