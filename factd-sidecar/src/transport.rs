//! Framed, correlated connection over TCP.
//!
//! Each [`Connection`] runs two tasks:
//! ```text
//!            ┌──────────── reader task ────────────┐
//! socket ──► │ FrameDecoder → Message               │
//!            │   Request   → RequestHandler (spawn) │──┐
//!            │   Response  → pending[id] oneshot    │  │ frames
//!            │   Push      → broadcast              │  ▼
//!            └──────────────────────────────────────┘  mpsc ──► writer task ──► socket
//! ```
//!
//! Both ends use the same type: the sidecar installs a handler, the peer
//! issues requests. A request whose timeout expires is removed from the
//! pending table, so a late response finds nothing and is dropped. When
//! the connection closes every pending request fails with
//! [`SidecarError::ConnectionClosed`].

use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use uuid::Uuid;

use factd_core::Value;

use crate::error::{SidecarError, SidecarResult};
use crate::protocol::{
    ErrorType, FrameDecoder, Message, Op, Outcome, Push, Request, Response, PROTOCOL_VERSION,
};

/// Serves requests arriving on a connection.
///
/// `handle` is called on the reader task and must not block; the returned
/// future runs on its own task so requests are answered concurrently.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, request: Request) -> BoxFuture<'static, Outcome>;
}

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Default per-request timeout
    pub request_timeout: Duration,
    /// Connect plus handshake deadline
    pub connect_timeout: Duration,
    /// Frames buffered for the writer task
    pub outgoing_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            outgoing_capacity: 1024,
        }
    }
}

const READ_BUFFER: usize = 64 * 1024;

struct PendingTable {
    closed: bool,
    waiters: HashMap<String, oneshot::Sender<Outcome>>,
}

struct Shared {
    peer: SocketAddr,
    pending: Mutex<PendingTable>,
    handshake: Mutex<Option<oneshot::Sender<u32>>>,
    peer_version: AtomicU32,
    closed: watch::Sender<bool>,
    pushes: broadcast::Sender<Push>,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, PendingTable> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Mark closed and fail every pending request. Idempotent.
    fn shut(&self, reason: &str) {
        let waiters = {
            let mut table = self.pending();
            if table.closed {
                return;
            }
            table.closed = true;
            std::mem::take(&mut table.waiters)
        };
        // Dropping the senders fails each waiter with ConnectionClosed
        let failed = waiters.len();
        drop(waiters);
        self.closed.send_replace(true);
        log::info!(
            "Connection {} closed ({reason}), {failed} pending requests failed",
            self.peer
        );
    }
}

/// Removes a pending entry when the waiting request finishes, times out,
/// or is dropped by its caller.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.pending().waiters.remove(&self.id);
    }
}

/// One framed connection.
pub struct Connection {
    shared: Arc<Shared>,
    outgoing: mpsc::Sender<Vec<u8>>,
    config: TransportConfig,
}

impl Connection {
    /// Connect, start the connection tasks and perform the handshake.
    ///
    /// Pushes from the other end are forwarded to `pushes`.
    pub async fn connect(
        addr: &str,
        config: TransportConfig,
        pushes: broadcast::Sender<Push>,
    ) -> SidecarResult<Self> {
        let deadline = config.connect_timeout;
        let stream = tokio::time::timeout(deadline, TcpStream::connect(addr))
            .await
            .map_err(|_| SidecarError::Timeout(deadline))??;
        stream.set_nodelay(true)?;
        let conn = Self::spawn(stream, config, None, pushes)?;
        let version = conn.handshake().await?;
        if version != PROTOCOL_VERSION {
            log::warn!(
                "Peer {addr} speaks protocol version {version}, expected {PROTOCOL_VERSION}"
            );
        }
        Ok(conn)
    }

    /// Start the reader and writer tasks on an established stream.
    pub fn spawn(
        stream: TcpStream,
        config: TransportConfig,
        handler: Option<Arc<dyn RequestHandler>>,
        pushes: broadcast::Sender<Push>,
    ) -> SidecarResult<Self> {
        let peer = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        let (outgoing, outgoing_rx) = mpsc::channel(config.outgoing_capacity);
        let (closed, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            peer,
            pending: Mutex::new(PendingTable {
                closed: false,
                waiters: HashMap::new(),
            }),
            handshake: Mutex::new(None),
            peer_version: AtomicU32::new(0),
            closed,
            pushes,
        });

        tokio::spawn(write_loop(write_half, outgoing_rx, shared.clone()));
        tokio::spawn(read_loop(read_half, outgoing.clone(), handler, shared.clone()));
        log::debug!("Connection {peer} started");

        Ok(Self {
            shared,
            outgoing,
            config,
        })
    }

    /// Send `handshake` and wait for the response. Returns the peer's
    /// protocol version; a mismatch is reported, not fatal.
    pub async fn handshake(&self) -> SidecarResult<u32> {
        let (tx, rx) = oneshot::channel();
        *self
            .shared
            .handshake
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(tx);
        self.send_message(&Message::Handshake {
            version: PROTOCOL_VERSION,
        })
        .await?;
        let deadline = self.config.connect_timeout;
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(version)) => Ok(version),
            Ok(Err(_)) => Err(SidecarError::ConnectionClosed),
            Err(_) => Err(SidecarError::Timeout(deadline)),
        }
    }

    /// Issue a request with the default timeout.
    pub async fn request(&self, op: &Op) -> SidecarResult<Value> {
        self.request_with_timeout(op, self.config.request_timeout)
            .await
    }

    /// Issue a request and wait for its correlated response.
    ///
    /// Expiry fails only this caller; the other end keeps working and its
    /// eventual response is discarded.
    pub async fn request_with_timeout(&self, op: &Op, timeout: Duration) -> SidecarResult<Value> {
        let id = Uuid::new_v4().to_string();
        let frame = Message::Request(op.to_request(id.clone())?).to_frame()?;

        let (tx, rx) = oneshot::channel();
        {
            let mut table = self.shared.pending();
            if table.closed {
                return Err(SidecarError::ConnectionClosed);
            }
            table.waiters.insert(id.clone(), tx);
        }
        let _guard = PendingGuard {
            shared: &self.shared,
            id,
        };

        // The deadline covers queueing behind a backpressured writer too
        let exchange = async {
            self.outgoing
                .send(frame)
                .await
                .map_err(|_| SidecarError::ConnectionClosed)?;
            log::trace!("Sent {} request to {}", op.tag(), self.shared.peer);
            rx.await.map_err(|_| SidecarError::ConnectionClosed)
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(Outcome::Ok(value))) => Ok(value),
            Ok(Ok(Outcome::Err {
                message,
                error_type,
            })) => Err(SidecarError::Remote {
                error_type,
                message,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                log::debug!("{} request to {} timed out", op.tag(), self.shared.peer);
                Err(SidecarError::Timeout(timeout))
            }
        }
    }

    /// Send a push event.
    pub async fn push(&self, push: Push) -> SidecarResult<()> {
        self.send_message(&Message::Push(push)).await
    }

    async fn send_message(&self, msg: &Message) -> SidecarResult<()> {
        if self.is_closed() {
            return Err(SidecarError::ConnectionClosed);
        }
        let frame = msg.to_frame()?;
        self.outgoing
            .send(frame)
            .await
            .map_err(|_| SidecarError::ConnectionClosed)
    }

    /// Subscribe to pushes received on this connection.
    pub fn subscribe(&self) -> broadcast::Receiver<Push> {
        self.shared.pushes.subscribe()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer
    }

    /// Protocol version announced by the peer, once known.
    pub fn peer_version(&self) -> Option<u32> {
        match self.shared.peer_version.load(Ordering::Relaxed) {
            0 => None,
            v => Some(v),
        }
    }

    pub fn pending_requests(&self) -> usize {
        self.shared.pending().waiters.len()
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.closed.borrow()
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        let mut rx = self.shared.closed.subscribe();
        wait_closed(&mut rx).await;
    }

    /// Fail pending requests, flush queued frames and close the socket.
    pub fn close(&self) {
        self.shared.shut("closed locally");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.shut("dropped");
    }
}

async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closed| *closed).await;
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut frames: mpsc::Receiver<Vec<u8>>,
    shared: Arc<Shared>,
) {
    let mut closed = shared.closed.subscribe();
    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = writer.write_all(&frame).await {
                        log::debug!("Write to {} failed: {e}", shared.peer);
                        break;
                    }
                }
                None => break,
            },
            _ = wait_closed(&mut closed) => {
                // Responses already queued still go out
                while let Ok(frame) = frames.try_recv() {
                    if writer.write_all(&frame).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
    shared.shut("writer stopped");
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    outgoing: mpsc::Sender<Vec<u8>>,
    handler: Option<Arc<dyn RequestHandler>>,
    shared: Arc<Shared>,
) {
    let mut closed = shared.closed.subscribe();
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_BUFFER];

    let reason = 'read: loop {
        let n = tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => break 'read "peer closed",
                Ok(n) => n,
                Err(e) => {
                    log::debug!("Read from {} failed: {e}", shared.peer);
                    break 'read "read error";
                }
            },
            _ = wait_closed(&mut closed) => break 'read "closed locally",
        };
        decoder.extend(&buf[..n]);

        loop {
            let body = match decoder.next_frame() {
                Ok(Some(body)) => body,
                Ok(None) => break,
                Err(e) => {
                    log::error!("Dropping connection {}: {e}", shared.peer);
                    break 'read "malformed frame";
                }
            };
            match Message::decode(&body) {
                Ok(msg) => dispatch(msg, &outgoing, handler.as_ref(), &shared).await,
                Err(e) => log::warn!("Undecodable message from {}: {e}", shared.peer),
            }
        }
    };
    shared.shut(reason);
}

async fn dispatch(
    msg: Message,
    outgoing: &mpsc::Sender<Vec<u8>>,
    handler: Option<&Arc<dyn RequestHandler>>,
    shared: &Shared,
) {
    match msg {
        Message::Handshake { version } => {
            shared.peer_version.store(version, Ordering::Relaxed);
            if version != PROTOCOL_VERSION {
                log::warn!(
                    "Peer {} speaks protocol version {version}, expected {PROTOCOL_VERSION}",
                    shared.peer
                );
            }
            send(
                outgoing,
                &Message::HandshakeResponse {
                    version: PROTOCOL_VERSION,
                },
            )
            .await;
        }
        Message::HandshakeResponse { version } => {
            shared.peer_version.store(version, Ordering::Relaxed);
            let waiter = shared
                .handshake
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .take();
            if let Some(waiter) = waiter {
                let _ = waiter.send(version);
            }
        }
        Message::Request(request) => {
            let request_id = request.id.clone();
            match handler {
                Some(handler) => {
                    let work = handler.handle(request);
                    let outgoing = outgoing.clone();
                    tokio::spawn(async move {
                        let outcome = work.await;
                        send(
                            &outgoing,
                            &Message::Response(Response {
                                request_id,
                                outcome,
                            }),
                        )
                        .await;
                    });
                }
                None => {
                    let outcome = Outcome::Err {
                        message: "this end does not serve requests".into(),
                        error_type: ErrorType::Protocol,
                    };
                    send(
                        outgoing,
                        &Message::Response(Response {
                            request_id,
                            outcome,
                        }),
                    )
                    .await;
                }
            }
        }
        Message::Response(response) => {
            let waiter = shared.pending().waiters.remove(&response.request_id);
            match waiter {
                Some(waiter) => {
                    let _ = waiter.send(response.outcome);
                }
                None => log::debug!(
                    "Dropping response for unknown or expired request {}",
                    response.request_id
                ),
            }
        }
        Message::Push(push) => {
            log::trace!("Push {} from {}", push.event, shared.peer);
            let _ = shared.pushes.send(push);
        }
    }
}

async fn send(outgoing: &mpsc::Sender<Vec<u8>>, msg: &Message) {
    match msg.to_frame() {
        Ok(frame) => {
            let _ = outgoing.send(frame).await;
        }
        Err(e) => log::error!("Failed to encode outgoing message: {e}"),
    }
}
