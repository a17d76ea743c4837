//! Connection Management
//!
//! This module owns the connection to the cluster: its parameters and
//! configuration overrides, its lifecycle, and the event-loop thread on
//! which completions are handled.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   ConnectionManager                         │
//! │                                                             │
//! │  ConnectParams + [ConfigOverride] ──> TransportConfig       │
//! │                                              │              │
//! │                                   Transport::connect()      │
//! │                                              │              │
//! │                                              ▼              │
//! │  ┌──────────────────┐          ┌────────────────────────┐   │
//! │  │ ConnectionHandle │ ───────> │  event-loop thread     │   │
//! │  │ (clone per user) │ register │  pending ops + cookies │   │
//! │  └──────────────────┘          └────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use couchlink::connection::{ConfigOverride, ConnectParams, ConnectionManager};
//! use couchlink::transport::MemoryCluster;
//! use std::sync::Arc;
//!
//! let manager = ConnectionManager::new(Arc::new(MemoryCluster::new("radius")));
//! let overrides: Vec<ConfigOverride> = vec![
//!     ("op_timeout", "5000000").into(),
//!     ("unknown_opt", "x").into(),
//! ];
//!
//! let handle = manager
//!     .connect(ConnectParams::new("localhost", "radius"), &overrides)
//!     .unwrap();
//! assert!(handle.is_ready());
//! assert_eq!(handle.rejected_overrides().len(), 1);
//! ```

pub mod config;
pub(crate) mod event_loop;
pub mod manager;
pub mod stats;

pub use config::{
    ConfigOverride, ConnectParams, OverrideError, OverridePolicy, TransportConfig, MAX_TIMEOUT,
};
pub use event_loop::THREAD_NAME;
pub use manager::{ConnectError, ConnectionHandle, ConnectionManager, HandleState};
pub use stats::ConnectionStats;
