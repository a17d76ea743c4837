//! # couchlink - Asynchronous Operation Correlation for Document Stores
//!
//! couchlink sits between a caller and a clustered document key-value store
//! reached through an asynchronous, event-driven transport. It issues
//! operations (connect, get, set, stat, view query), routes every
//! completion back to the operation that started it, and assembles JSON
//! view responses that arrive in several chunks.
//!
//! ## Features
//!
//! - **Typed correlation**: operations are tracked by token; the transport never holds caller state
//! - **Streaming JSON**: view responses are validated byte by byte as chunks arrive
//! - **Sync or async**: every operation returns a future that can be awaited or waited on
//! - **Configurable**: ordered `key=value` overrides on top of transport defaults
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              couchlink                                  │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐                  │
//! │  │ Connection  │───>│  Dispatch   │───>│  Transport  │                  │
//! │  │  Manager    │    │ get/set/... │    │ (trait)     │                  │
//! │  └─────────────┘    └─────────────┘    └──────┬──────┘                  │
//! │                                               │ completions             │
//! │                                               ▼                         │
//! │  ┌─────────────┐    ┌──────────────────────────────────────────────┐   │
//! │  │  Operation  │<───│            Event-Loop Thread                 │   │
//! │  │  Future     │    │  pending[token] ──> handler ──> Cookie       │   │
//! │  └─────────────┘    │                        (JsonTokenizer)       │   │
//! │                     └──────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```
//! use couchlink::connection::{ConnectParams, ConnectionManager};
//! use couchlink::transport::MemoryCluster;
//! use std::sync::Arc;
//!
//! let cluster = Arc::new(MemoryCluster::new("radius"));
//! let manager = ConnectionManager::new(cluster);
//! let handle = manager
//!     .connect(ConnectParams::new("couchbase://localhost", "radius"), &[])
//!     .unwrap();
//!
//! handle.set("user:42", r#"{"active":true}"#, 0).unwrap().wait().unwrap();
//! assert!(handle.get("missing-key").unwrap().wait().is_err());
//! ```
//!
//! ## Module Overview
//!
//! - [`cookie`]: per-operation context and the streaming JSON tokenizer
//! - [`transport`]: the consumed store API, status codes, and an in-process cluster
//! - [`storage`]: document storage behind the in-process cluster
//! - [`connection`]: connection parameters, overrides and lifecycle
//! - [`commands`]: operation dispatch, completion handlers and results

pub mod commands;
pub mod connection;
pub mod cookie;
pub mod storage;
pub mod transport;

// Re-export commonly used types for convenience
pub use commands::{DispatchError, Document, OperationError, OperationFuture, Stored, ViewResponse};
pub use connection::{ConfigOverride, ConnectError, ConnectParams, ConnectionHandle, ConnectionManager};
pub use cookie::{Cookie, ParseError, ParseStatus};
pub use transport::{MemoryCluster, StatusCode, Transport};

/// Version of couchlink
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
