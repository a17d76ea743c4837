//! Store Transport Boundary
//!
//! This module defines the surface this crate consumes from the underlying
//! store client: connect, submit a request, tear down. Results come back
//! asynchronously through a [`CompletionSink`].
//!
//! ## Correlation
//!
//! ```text
//!  dispatcher                    event loop                    transport
//!  ──────────                    ──────────                    ─────────
//!  Register(token, cookie) ───>  pending[token] = op
//!  submit(request, sink) ──────────────────────────────────>   executes
//!                                pending[token] <── sink.complete(status, body)
//!                                   handler(op.cookie, ...)        (1..N times)
//! ```
//!
//! The sink is the only thing the transport holds for an operation. It is
//! keyed by the operation token, so the transport never sees (or owns) the
//! cookie.
//!
//! ## Modules
//!
//! - `status`: native status codes and their categories
//! - `view`: view query path parsing
//! - `memory`: in-process cluster used for tests, benches and the demo binary

pub mod memory;
pub mod status;
pub mod view;

pub use memory::MemoryCluster;
pub use status::{Category, StatusCode};
pub use view::ViewPath;

use crate::connection::config::{ConnectParams, TransportConfig};
use crate::connection::event_loop::LoopEvent;
use bytes::Bytes;
use std::fmt;
use tokio::sync::mpsc;

/// Identifies one in-flight operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpToken(u64);

impl OpToken {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OpToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// The kind of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Get,
    Store,
    Stat,
    View,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpKind::Get => "get",
            OpKind::Store => "store",
            OpKind::Stat => "stat",
            OpKind::View => "view",
        };
        f.write_str(name)
    }
}

/// How a store request treats an existing document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreMode {
    /// Create or overwrite
    #[default]
    Upsert,
    /// Fail with `KeyExists` if the key is present
    Insert,
    /// Fail with `KeyNotFound` if the key is absent
    Replace,
}

/// A request handed to the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Get {
        key: String,
    },
    Store {
        key: String,
        value: Bytes,
        /// Seconds; 0 = never expires
        expiry: u32,
        mode: StoreMode,
    },
    Stat {
        group: Option<String>,
    },
    View {
        path: String,
        post: Option<String>,
    },
}

impl Request {
    pub fn kind(&self) -> OpKind {
        match self {
            Request::Get { .. } => OpKind::Get,
            Request::Store { .. } => OpKind::Store,
            Request::Stat { .. } => OpKind::Stat,
            Request::View { .. } => OpKind::View,
        }
    }

    /// Document key, for key/value requests.
    pub fn key(&self) -> Option<&str> {
        match self {
            Request::Get { key } | Request::Store { key, .. } => Some(key),
            _ => None,
        }
    }
}

/// One statistic reported by one server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatEntry {
    pub server: String,
    pub key: String,
    pub value: String,
}

/// Payload of a completion.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionBody {
    /// No payload (failures)
    Empty,
    Document {
        value: Bytes,
        cas: u64,
    },
    Stored {
        cas: u64,
    },
    Stats(Vec<StatEntry>),
    /// One chunk of an HTTP view response
    ViewChunk {
        http_status: u16,
        data: Bytes,
        is_final: bool,
    },
}

/// A completion reported by the transport.
#[derive(Debug)]
pub struct Completion {
    pub token: OpToken,
    pub status: StatusCode,
    pub body: CompletionBody,
}

/// Routes completions back to the operation that issued a request.
///
/// Cloning is cheap; a transport streaming a chunked response may keep a
/// clone per chunk producer. Completions reported after the operation has
/// finished (or timed out) are ignored by the event loop.
#[derive(Debug, Clone)]
pub struct CompletionSink {
    token: OpToken,
    tx: mpsc::UnboundedSender<LoopEvent>,
}

impl CompletionSink {
    pub(crate) fn new(token: OpToken, tx: mpsc::UnboundedSender<LoopEvent>) -> Self {
        Self { token, tx }
    }

    pub fn token(&self) -> OpToken {
        self.token
    }

    /// Reports a completion. Returns `false` if the event loop is gone.
    pub fn complete(&self, status: StatusCode, body: CompletionBody) -> bool {
        self.tx
            .send(LoopEvent::Completion(Completion {
                token: self.token,
                status,
                body,
            }))
            .is_ok()
    }

    /// Reports a failure without payload.
    pub fn fail(&self, status: StatusCode) -> bool {
        self.complete(status, CompletionBody::Empty)
    }
}

/// The asynchronous store client this crate drives.
///
/// Implementations must not block in `submit`: they queue the request and
/// report through the sink later (possibly several times for view queries,
/// with `is_final` set on the last chunk). A transport that returns `Err`
/// from `submit` must never use the sink it was given.
pub trait Transport: Send + Sync + 'static {
    /// Establishes the cluster connection.
    fn connect(&self, params: &ConnectParams, config: &TransportConfig) -> Result<(), StatusCode>;

    /// Queues one request.
    fn submit(&self, request: Request, sink: CompletionSink) -> Result<(), StatusCode>;

    /// Releases transport resources. Called exactly once per manager.
    fn destroy(&self);
}
