//! Operations
//!
//! This module implements the operations callers issue against the
//! cluster and the handlers that complete them.
//!
//! ## Architecture
//!
//! ```text
//! caller
//!   │  handle.get / set / store / stat / view_query
//!   ▼
//! ┌─────────────────┐
//! │   dispatch      │  validate, bind cookie, register, submit
//! └────────┬────────┘
//!          │ Request + CompletionSink
//!          ▼
//! ┌─────────────────┐
//! │   Transport     │
//! └────────┬────────┘
//!          │ completions (1 per key/value op, N chunks per view)
//!          ▼
//! ┌─────────────────┐
//! │   callbacks     │  on the event-loop thread
//! └────────┬────────┘
//!          │ oneshot
//!          ▼
//!   OperationFuture ──> Result<T, OperationError>
//! ```

pub(crate) mod callbacks;
pub mod dispatch;
pub mod result;

pub use dispatch::{DispatchError, MAX_KEY_LENGTH};
pub use result::{
    Document, FromOperationValue, OperationError, OperationFuture, OperationValue, Stored, ViewResponse,
    ViewRow, WithCookie,
};
