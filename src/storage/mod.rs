//! Bucket Storage for the In-Process Cluster
//!
//! The [`MemoryCluster`] transport keeps its documents here: a sharded,
//! thread-safe document map with CAS values and expiry, plus a background
//! sweeper for expired documents.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     StorageEngine                           │
//! │  ┌─────────┐ ┌─────────┐ ┌─────────┐ ┌─────────┐           │
//! │  │ Shard 0 │ │ Shard 1 │ │ Shard 2 │ │...64    │           │
//! │  │ RwLock  │ │ RwLock  │ │ RwLock  │ │ shards  │           │
//! │  └─────────┘ └─────────┘ └─────────┘ └─────────┘           │
//! └─────────────────────────────────────────────────────────────┘
//!                            ▲
//!              ┌─────────────┴─────────────┐
//!              │     ExpirySweeper         │
//!              │  (Background Tokio Task)  │
//!              └───────────────────────────┘
//! ```
//!
//! [`MemoryCluster`]: crate::transport::MemoryCluster

pub mod engine;
pub mod expiry;

pub use engine::{Entry, StorageEngine, StorageStats, StoreError};
pub use expiry::{ExpiryConfig, ExpirySweeper};
