//! Operation Dispatchers
//!
//! The operations a caller can issue on a [`ConnectionHandle`]. Each one
//! validates its input, binds a cookie, registers the operation with the
//! event loop and submits the request, then returns at once with an
//! [`OperationFuture`].
//!
//! A dispatch that fails returns a [`DispatchError`] and no completion
//! handler ever runs for it.

use crate::commands::result::{Document, FromOperationValue, OperationFuture, Stored, ViewResponse};
use crate::connection::event_loop::{LoopEvent, PendingOp};
use crate::connection::manager::{ConnectionHandle, HandleState, Session};
use crate::cookie::Cookie;
use crate::transport::{CompletionSink, Request, StatEntry, StatusCode, StoreMode, ViewPath};
use bytes::Bytes;
use serde::de::IgnoredAny;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Longest document key accepted, in bytes.
pub const MAX_KEY_LENGTH: usize = 250;

/// Errors detected before a request reaches the transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("connection is not ready (state: {state})")]
    NotConnected { state: HandleState },

    #[error("document key is empty")]
    EmptyKey,

    #[error("document key is {len} bytes, the maximum is {max}")]
    KeyTooLong { len: usize, max: usize },

    #[error("'{0}' does not address a view")]
    InvalidViewPath(String),

    #[error("view POST body is not a JSON document: {0}")]
    InvalidPostBody(String),

    /// The transport refused the request
    #[error("request rejected: {0}")]
    Rejected(StatusCode),
}

fn validate_key(key: &str) -> Result<(), DispatchError> {
    if key.is_empty() {
        return Err(DispatchError::EmptyKey);
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(DispatchError::KeyTooLong {
            len: key.len(),
            max: MAX_KEY_LENGTH,
        });
    }
    Ok(())
}

impl ConnectionHandle {
    /// Fetches a document.
    pub fn get(&self, key: &str) -> Result<OperationFuture<Document>, DispatchError> {
        self.get_with_cookie(key, Cookie::new())
    }

    /// Fetches a document, carrying a caller-supplied cookie.
    pub fn get_with_cookie(&self, key: &str, cookie: Cookie) -> Result<OperationFuture<Document>, DispatchError> {
        let session = self.ready_session()?;
        validate_key(key)?;

        let request = Request::Get {
            key: key.to_string(),
        };
        self.submit(&session, request, Some(key.to_string()), cookie)
    }

    /// Creates or overwrites a document. `expiry` is in seconds, 0 = never.
    ///
    /// # Example
    ///
    /// ```
    /// use couchlink::connection::{ConnectParams, ConnectionManager};
    /// use couchlink::transport::MemoryCluster;
    /// use std::sync::Arc;
    ///
    /// let manager = ConnectionManager::new(Arc::new(MemoryCluster::new("radius")));
    /// let handle = manager.connect(ConnectParams::new("localhost", "radius"), &[]).unwrap();
    ///
    /// handle.set("user:42", r#"{"active":true}"#, 0).unwrap().wait().unwrap();
    /// let doc = handle.get("user:42").unwrap().wait().unwrap();
    /// assert_eq!(doc.as_str(), Some(r#"{"active":true}"#));
    /// ```
    pub fn set(
        &self,
        key: &str,
        body: impl Into<Bytes>,
        expiry: u32,
    ) -> Result<OperationFuture<Stored>, DispatchError> {
        self.store(key, body, expiry, StoreMode::Upsert)
    }

    /// Stores a document under the given mode.
    pub fn store(
        &self,
        key: &str,
        body: impl Into<Bytes>,
        expiry: u32,
        mode: StoreMode,
    ) -> Result<OperationFuture<Stored>, DispatchError> {
        self.store_with_cookie(key, body, expiry, mode, Cookie::new())
    }

    /// Stores a document, carrying a caller-supplied cookie.
    pub fn store_with_cookie(
        &self,
        key: &str,
        body: impl Into<Bytes>,
        expiry: u32,
        mode: StoreMode,
        cookie: Cookie,
    ) -> Result<OperationFuture<Stored>, DispatchError> {
        let session = self.ready_session()?;
        validate_key(key)?;

        let request = Request::Store {
            key: key.to_string(),
            value: body.into(),
            expiry,
            mode,
        };
        self.submit(&session, request, Some(key.to_string()), cookie)
    }

    /// Collects server statistics, optionally for one group.
    pub fn stat(&self, group: Option<&str>) -> Result<OperationFuture<Vec<StatEntry>>, DispatchError> {
        self.stat_with_cookie(group, Cookie::new())
    }

    pub fn stat_with_cookie(
        &self,
        group: Option<&str>,
        cookie: Cookie,
    ) -> Result<OperationFuture<Vec<StatEntry>>, DispatchError> {
        let session = self.ready_session()?;
        let request = Request::Stat {
            group: group.map(str::to_string),
        };
        self.submit(&session, request, None, cookie)
    }

    /// Queries a view. With `post`, the body is sent as a JSON POST.
    pub fn view_query(&self, path: &str, post: Option<&str>) -> Result<OperationFuture<ViewResponse>, DispatchError> {
        let session = self.ready_session()?;
        let cookie = Cookie::with_max_size(session.config.max_view_response_size);
        self.submit_view(&session, path, post, cookie)
    }

    /// Queries a view, assembling the response in a caller-supplied cookie.
    ///
    /// The cookie is reset first. It keeps its own size limit.
    pub fn view_query_with_cookie(
        &self,
        path: &str,
        post: Option<&str>,
        mut cookie: Cookie,
    ) -> Result<OperationFuture<ViewResponse>, DispatchError> {
        let session = self.ready_session()?;
        cookie.reset();
        self.submit_view(&session, path, post, cookie)
    }

    fn submit_view(
        &self,
        session: &Session,
        path: &str,
        post: Option<&str>,
        cookie: Cookie,
    ) -> Result<OperationFuture<ViewResponse>, DispatchError> {
        if ViewPath::parse(path).is_none() {
            return Err(DispatchError::InvalidViewPath(path.to_string()));
        }
        if let Some(body) = post {
            serde_json::from_str::<IgnoredAny>(body)
                .map_err(|e| DispatchError::InvalidPostBody(e.to_string()))?;
        }

        let request = Request::View {
            path: path.to_string(),
            post: post.map(str::to_string),
        };
        self.submit(session, request, None, cookie)
    }

    /// Registers the operation with the event loop, then submits it.
    fn submit<T: FromOperationValue>(
        &self,
        session: &Session,
        request: Request,
        key: Option<String>,
        cookie: Cookie,
    ) -> Result<OperationFuture<T>, DispatchError> {
        let token = self.next_token();
        let kind = request.kind();
        let (reply, rx) = oneshot::channel();
        // A deadline past the end of the clock never expires
        let deadline = Instant::now().checked_add(session.config.timeout_for(kind));

        let op = PendingOp::new(kind, key, cookie, deadline, reply);
        session
            .tx
            .send(LoopEvent::Register { token, op })
            .map_err(|_| DispatchError::NotConnected {
                state: HandleState::Closed,
            })?;

        let sink = CompletionSink::new(token, session.tx.clone());
        if let Err(status) = session.transport.submit(request, sink) {
            let _ = session.tx.send(LoopEvent::Abandon(token));
            warn!(%token, %kind, %status, "transport rejected request");
            return Err(DispatchError::Rejected(status));
        }

        self.stats().op_dispatched();
        debug!(%token, %kind, "operation dispatched");
        Ok(OperationFuture::new(rx))
    }
}
