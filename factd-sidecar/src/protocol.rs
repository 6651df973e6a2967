//! Wire protocol between the authoritative peer and the sidecar.
//!
//! Framing (both directions):
//! ```text
//! ┌──────────────────────┬────┬──────────────────┬────┐
//! │ len(body), ASCII dec │ \n │ body (len bytes) │ \n │
//! └──────────────────────┴────┴──────────────────┴────┘
//! ```
//!
//! A body is one bincode-encoded [`Message`]. Requests carry the operation
//! name and its arguments as a separately encoded payload, so a receiver can
//! answer an operation it does not know with `unknown-op` instead of
//! failing the whole frame.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

use factd_core::{Datom, Schema, TxOp, Value};

use crate::storage::CacheConfig;

/// Protocol version exchanged in the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest body accepted by [`FrameDecoder`] (256MB).
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// Longest length header: `MAX_FRAME_LEN` has 9 digits.
const MAX_HEADER_LEN: usize = 10;

/// Protocol errors.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("malformed frame: {0}")]
    InvalidFrame(String),
    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },
    #[error("unknown operation: {0}")]
    UnknownOp(String),
}

/// Stable error classes reported in failed responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorType {
    Connection,
    Timeout,
    Protocol,
    UnknownOp,
    Storage,
    Application,
    GraphNotFound,
}

impl ErrorType {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorType::Connection => "connection",
            ErrorType::Timeout => "timeout",
            ErrorType::Protocol => "protocol",
            ErrorType::UnknownOp => "unknown-op",
            ErrorType::Storage => "storage",
            ErrorType::Application => "application",
            ErrorType::GraphNotFound => "graph-not-found",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "connection" => ErrorType::Connection,
            "timeout" => ErrorType::Timeout,
            "protocol" => ErrorType::Protocol,
            "unknown-op" => ErrorType::UnknownOp,
            "storage" => ErrorType::Storage,
            "application" => ErrorType::Application,
            "graph-not-found" => ErrorType::GraphNotFound,
            _ => return None,
        })
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Handshake { version: u32 },
    HandshakeResponse { version: u32 },
    Request(Request),
    Response(Response),
    Push(Push),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Unique among this connection's pending requests
    pub id: String,
    pub op: String,
    /// Operation arguments, bincode-encoded
    pub payload: Vec<u8>,
    /// Milliseconds since the Unix epoch at send time
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub request_id: String,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    Ok(Value),
    Err {
        message: String,
        error_type: ErrorType,
    },
}

impl Outcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok(_))
    }
}

/// Fire-and-forget event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Push {
    pub event: String,
    pub payload: Value,
}

impl Message {
    /// Serialize to a frame body.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_body(self)
    }

    /// Deserialize from a frame body.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_body(bytes)
    }

    /// Serialize and wrap in a frame.
    pub fn to_frame(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(encode_frame(&self.encode()?))
    }
}

fn encode_body<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode_body<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, read) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    if read != bytes.len() {
        return Err(ProtocolError::Deserialization(format!(
            "{} trailing bytes",
            bytes.len() - read
        )));
    }
    Ok(value)
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

// ─── Operations ───────────────────────────────────────────────────────

/// Options for `create-or-open`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphOptions {
    /// RocksDB directory; `None` keeps pages in memory
    pub path: Option<PathBuf>,
    /// Merged over any persisted schema
    pub schema: Schema,
    /// Cache budgets; `None` uses the server default
    pub cache: Option<CacheConfig>,
}

/// One element of `transact-batch`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxItem {
    pub tx_data: Vec<TxOp>,
    pub tx_meta: Option<Value>,
}

/// Every operation the sidecar serves.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Ping,
    CreateOrOpen { name: String, opts: GraphOptions },
    RemoveGraph { name: String },
    ListDb,
    Query { name: String, query: String, inputs: Vec<Value> },
    Pull { name: String, selector: String, entity: Value },
    PullMany { name: String, selector: String, entities: Vec<Value> },
    Datoms { name: String, index: String, components: Vec<Value> },
    Transact { name: String, tx_data: Vec<TxOp>, tx_meta: Option<Value> },
    TransactBatch { name: String, txs: Vec<TxItem> },
    SyncDatoms { name: String, datoms: Vec<Datom>, full: bool },
    CollectGarbage { name: String },
    GraphStats { name: String },
}

impl Op {
    /// Wire name.
    pub fn tag(&self) -> &'static str {
        match self {
            Op::Ping => "ping",
            Op::CreateOrOpen { .. } => "create-or-open",
            Op::RemoveGraph { .. } => "remove-graph",
            Op::ListDb => "list-db",
            Op::Query { .. } => "query",
            Op::Pull { .. } => "pull",
            Op::PullMany { .. } => "pull-many",
            Op::Datoms { .. } => "datoms",
            Op::Transact { .. } => "transact",
            Op::TransactBatch { .. } => "transact-batch",
            Op::SyncDatoms { .. } => "sync-datoms",
            Op::CollectGarbage { .. } => "collect-garbage",
            Op::GraphStats { .. } => "graph-stats",
        }
    }

    /// Graph the operation targets, if any.
    pub fn graph(&self) -> Option<&str> {
        match self {
            Op::Ping | Op::ListDb => None,
            Op::CreateOrOpen { name, .. }
            | Op::RemoveGraph { name }
            | Op::Query { name, .. }
            | Op::Pull { name, .. }
            | Op::PullMany { name, .. }
            | Op::Datoms { name, .. }
            | Op::Transact { name, .. }
            | Op::TransactBatch { name, .. }
            | Op::SyncDatoms { name, .. }
            | Op::CollectGarbage { name }
            | Op::GraphStats { name } => Some(name),
        }
    }

    /// Encode the arguments as a request payload.
    pub fn encode_payload(&self) -> Result<Vec<u8>, ProtocolError> {
        match self {
            Op::Ping | Op::ListDb => encode_body(&()),
            Op::CreateOrOpen { name, opts } => encode_body(&(name, opts)),
            Op::RemoveGraph { name }
            | Op::CollectGarbage { name }
            | Op::GraphStats { name } => encode_body(name),
            Op::Query {
                name,
                query,
                inputs,
            } => encode_body(&(name, query, inputs)),
            Op::Pull {
                name,
                selector,
                entity,
            } => encode_body(&(name, selector, entity)),
            Op::PullMany {
                name,
                selector,
                entities,
            } => encode_body(&(name, selector, entities)),
            Op::Datoms {
                name,
                index,
                components,
            } => encode_body(&(name, index, components)),
            Op::Transact {
                name,
                tx_data,
                tx_meta,
            } => encode_body(&(name, tx_data, tx_meta)),
            Op::TransactBatch { name, txs } => encode_body(&(name, txs)),
            Op::SyncDatoms { name, datoms, full } => encode_body(&(name, datoms, full)),
        }
    }

    /// Decode an operation from its wire name and payload.
    pub fn decode(tag: &str, payload: &[u8]) -> Result<Self, ProtocolError> {
        let op = match tag {
            "ping" => {
                decode_body::<()>(payload)?;
                Op::Ping
            }
            "list-db" => {
                decode_body::<()>(payload)?;
                Op::ListDb
            }
            "create-or-open" => {
                let (name, opts) = decode_body(payload)?;
                Op::CreateOrOpen { name, opts }
            }
            "remove-graph" => Op::RemoveGraph {
                name: decode_body(payload)?,
            },
            "collect-garbage" => Op::CollectGarbage {
                name: decode_body(payload)?,
            },
            "graph-stats" => Op::GraphStats {
                name: decode_body(payload)?,
            },
            "query" => {
                let (name, query, inputs) = decode_body(payload)?;
                Op::Query {
                    name,
                    query,
                    inputs,
                }
            }
            "pull" => {
                let (name, selector, entity) = decode_body(payload)?;
                Op::Pull {
                    name,
                    selector,
                    entity,
                }
            }
            "pull-many" => {
                let (name, selector, entities) = decode_body(payload)?;
                Op::PullMany {
                    name,
                    selector,
                    entities,
                }
            }
            "datoms" => {
                let (name, index, components) = decode_body(payload)?;
                Op::Datoms {
                    name,
                    index,
                    components,
                }
            }
            "transact" => {
                let (name, tx_data, tx_meta) = decode_body(payload)?;
                Op::Transact {
                    name,
                    tx_data,
                    tx_meta,
                }
            }
            "transact-batch" => {
                let (name, txs) = decode_body(payload)?;
                Op::TransactBatch { name, txs }
            }
            "sync-datoms" => {
                let (name, datoms, full) = decode_body(payload)?;
                Op::SyncDatoms { name, datoms, full }
            }
            other => return Err(ProtocolError::UnknownOp(other.to_string())),
        };
        Ok(op)
    }

    /// Build a request with the given correlation id.
    pub fn to_request(&self, id: impl Into<String>) -> Result<Request, ProtocolError> {
        Ok(Request {
            id: id.into(),
            op: self.tag().to_string(),
            payload: self.encode_payload()?,
            timestamp: now_millis(),
        })
    }
}

impl Request {
    pub fn decode_op(&self) -> Result<Op, ProtocolError> {
        Op::decode(&self.op, &self.payload)
    }
}

// ─── Framing ──────────────────────────────────────────────────────────

/// Wrap a body in a frame.
pub fn encode_frame(body: &[u8]) -> Vec<u8> {
    let header = body.len().to_string();
    let mut frame = Vec::with_capacity(header.len() + body.len() + 2);
    frame.extend_from_slice(header.as_bytes());
    frame.push(b'\n');
    frame.extend_from_slice(body);
    frame.push(b'\n');
    frame
}

/// Incremental frame extractor.
///
/// Bytes are appended as they arrive; [`FrameDecoder::next_frame`] yields
/// each complete body in order. A partial frame stays buffered until the
/// rest arrives.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    /// Start of the first unreturned byte in `buf`
    pos: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes, first dropping frames already returned.
    pub fn extend(&mut self, bytes: &[u8]) {
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet returned.
    pub fn buffered(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Next complete body, `None` when more input is needed.
    ///
    /// Errors are unrecoverable: the stream has lost frame alignment.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        let pending = &self.buf[self.pos..];
        let Some(newline) = pending
            .iter()
            .take(MAX_HEADER_LEN + 1)
            .position(|b| *b == b'\n')
        else {
            if pending.len() > MAX_HEADER_LEN {
                return Err(ProtocolError::InvalidFrame(
                    "length header not terminated".into(),
                ));
            }
            return Ok(None);
        };

        let header = &pending[..newline];
        if header.is_empty() || header.len() > MAX_HEADER_LEN || !header.iter().all(u8::is_ascii_digit) {
            return Err(ProtocolError::InvalidFrame(format!(
                "bad length header {:?}",
                String::from_utf8_lossy(header)
            )));
        }
        // Digits only, so this is valid UTF-8 and fits in usize
        let len: usize = std::str::from_utf8(header)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ProtocolError::InvalidFrame("unparsable length".into()))?;
        if len > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge {
                len,
                max: MAX_FRAME_LEN,
            });
        }

        let start = newline + 1;
        let end = start + len;
        if pending.len() < end + 1 {
            return Ok(None);
        }
        if pending[end] != b'\n' {
            return Err(ProtocolError::InvalidFrame(
                "body not followed by newline".into(),
            ));
        }
        let body = pending[start..end].to_vec();
        self.pos += end + 1;
        Ok(Some(body))
    }
}
