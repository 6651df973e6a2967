//! TCP server hosting the dispatcher.
//!
//! Architecture:
//! ```text
//! Peer ── TCP ── Connection ──┬── Dispatcher ── GraphRegistry ── Graph
//!                  ▲          │                                   ├── TxQueue
//!                  │          │                                   ├── FactStore
//!                  │          │                                   └── CachedStorage
//!                  │          │                                          │
//!                  │          │                               RocksDB / memory
//!                  └── push ──┴── EventBus
//! ```
//!
//! Every accepted connection gets its own reader and writer tasks. Requests
//! on one connection are answered concurrently; writes to one graph are
//! serialized by that graph's queue whichever connection they came from.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};

use crate::dispatcher::{DispatchStats, Dispatcher};
use crate::error::SidecarResult;
use crate::events::{EventBus, EventStats};
use crate::registry::{GraphRegistry, RegistryConfig};
use crate::transport::{Connection, RequestHandler, TransportConfig};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Push events buffered per connection
    pub event_capacity: usize,
    pub transport: TransportConfig,
    pub registry: RegistryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            event_capacity: 256,
            transport: TransportConfig::default(),
            registry: RegistryConfig::default(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: usize,
    pub open_graphs: usize,
    pub dispatch: DispatchStats,
    pub events: EventStats,
}

/// The sidecar server. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SidecarServer {
    config: ServerConfig,
    registry: Arc<GraphRegistry>,
    events: Arc<EventBus>,
    dispatcher: Dispatcher,
    connections: Arc<Mutex<HashMap<u64, Arc<Connection>>>>,
    next_connection: Arc<AtomicU64>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl SidecarServer {
    pub fn new(config: ServerConfig) -> Self {
        let events = Arc::new(EventBus::new(config.event_capacity));
        let registry = Arc::new(GraphRegistry::new(config.registry.clone(), events.clone()));
        let dispatcher = Dispatcher::new(registry.clone());
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            registry,
            events,
            dispatcher,
            connections: Arc::new(Mutex::new(HashMap::new())),
            next_connection: Arc::new(AtomicU64::new(0)),
            shutdown: Arc::new(shutdown),
        }
    }

    /// Create with default configuration (in-memory graphs).
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<GraphRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub async fn bind(&self) -> SidecarResult<TcpListener> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sidecar listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Bind and serve until [`shutdown`](Self::shutdown) is called.
    pub async fn run(&self) -> SidecarResult<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> SidecarResult<()> {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return Ok(());
        }
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        log::debug!("New TCP connection from {addr}");
                        let server = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server.handle_connection(stream, addr).await {
                                log::error!("Connection error from {addr}: {e}");
                            }
                        });
                    }
                    Err(e) => log::warn!("Accept failed: {e}"),
                },
                _ = shutdown.changed() => break,
            }
        }
        log::info!("Sidecar stopped accepting connections");
        Ok(())
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> SidecarResult<()> {
        stream.set_nodelay(true)?;
        let handler: Arc<dyn RequestHandler> = Arc::new(self.dispatcher.clone());
        // Pushes from the peer are not used by the sidecar
        let (peer_pushes, _) = broadcast::channel(1);
        let conn = Arc::new(Connection::spawn(
            stream,
            self.config.transport.clone(),
            Some(handler),
            peer_pushes,
        )?);

        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        self.connections().insert(id, conn.clone());
        log::info!("Peer connected from {addr}");

        let mut events = self.events.subscribe();
        loop {
            tokio::select! {
                _ = conn.closed() => break,
                event = events.recv() => match event {
                    Ok(push) => {
                        if conn.push(push.as_ref().clone()).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Peer {addr} lagged, {n} push events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        conn.closed().await;
                        break;
                    }
                },
            }
        }

        self.connections().remove(&id);
        log::info!("Peer {addr} disconnected");
        Ok(())
    }

    fn connections(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Arc<Connection>>> {
        self.connections.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Stop accepting, drain and flush every graph, then close connections.
    pub async fn shutdown(&self) {
        log::info!("Sidecar shutting down");
        self.shutdown.send_replace(true);
        self.registry.close_all().await;
        let open: Vec<Arc<Connection>> = self.connections().drain().map(|(_, c)| c).collect();
        for conn in open {
            conn.close();
        }
    }

    pub async fn stats(&self) -> ServerStats {
        let active_connections = self.connections().len();
        ServerStats {
            total_connections: self.next_connection.load(Ordering::Relaxed),
            active_connections,
            open_graphs: self.registry.len().await,
            dispatch: self.dispatcher.stats(),
            events: self.events.stats(),
        }
    }
}
