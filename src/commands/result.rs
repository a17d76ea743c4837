//! Operation Results
//!
//! Each dispatched operation resolves exactly once, to an
//! `Result<T, OperationError>` where `T` depends on the operation:
//!
//! | operation      | `T`               |
//! |----------------|-------------------|
//! | `get`          | [`Document`]      |
//! | `set`/`store`  | [`Stored`]        |
//! | `stat`         | `Vec<StatEntry>`  |
//! | `view_query`   | [`ViewResponse`]  |
//!
//! The result arrives through an [`OperationFuture`], which can be awaited
//! from async code or waited on from a plain thread.

use crate::cookie::{Cookie, ParseError};
use crate::transport::{Category, StatEntry, StatusCode};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::oneshot;

/// A fetched document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub key: String,
    pub value: Bytes,
    pub cas: u64,
}

impl Document {
    /// Decodes the document body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.value)
    }

    /// The body as UTF-8 text, if it is.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }
}

/// Acknowledgement of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stored {
    pub cas: u64,
}

/// A fully assembled view response.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewResponse {
    pub http_status: u16,
    pub value: Value,
    /// Transport chunks the response arrived in
    pub chunks: u64,
}

/// One row of a view response.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ViewRow {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub key: Value,
    #[serde(default)]
    pub value: Value,
}

impl ViewResponse {
    pub fn total_rows(&self) -> Option<u64> {
        self.value.get("total_rows").and_then(Value::as_u64)
    }

    /// Decodes the `rows` member. A response without rows has none.
    pub fn rows(&self) -> Result<Vec<ViewRow>, serde_json::Error> {
        match self.value.get("rows") {
            Some(rows) => Vec::<ViewRow>::deserialize(rows),
            None => Ok(Vec::new()),
        }
    }
}

/// Successful payload of any operation.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationValue {
    Document(Document),
    Stored(Stored),
    Stats(Vec<StatEntry>),
    View(ViewResponse),
}

/// Why an operation failed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OperationError {
    /// `get` of a key that does not exist
    #[error("document '{key}' not found")]
    NotFound { key: String },

    #[error("transport error: {status}")]
    Transport { status: StatusCode },

    /// View request answered with a non-2xx HTTP status
    #[error("view request failed with HTTP {status}{}", reason_suffix(.reason))]
    Http { status: u16, reason: Option<String> },

    /// The view response was not a valid JSON document
    #[error("malformed view response: {0}")]
    Parse(#[from] ParseError),

    /// The connection went away before the operation was answered
    #[error("operation abandoned before completion")]
    Abandoned,
}

fn reason_suffix(reason: &Option<String>) -> String {
    reason.as_ref().map(|r| format!(": {}", r)).unwrap_or_default()
}

impl OperationError {
    /// Error category. A not-found status outside `get` is terminal.
    pub fn category(&self) -> Category {
        match self {
            OperationError::NotFound { .. } => Category::NotFound,
            OperationError::Transport { status } => match status.category() {
                Category::Transient => Category::Transient,
                _ => Category::Terminal,
            },
            OperationError::Http { status, .. } if (500..600).contains(status) => Category::Transient,
            _ => Category::Terminal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.category() == Category::Transient
    }

    /// Native status code behind this error, if any.
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            OperationError::NotFound { .. } => Some(StatusCode::KeyNotFound),
            OperationError::Transport { status } => Some(*status),
            OperationError::Http { .. } => Some(StatusCode::HttpError),
            OperationError::Parse(_) | OperationError::Abandoned => None,
        }
    }
}

/// What the event loop sends back when an operation ends.
#[derive(Debug)]
pub(crate) struct Completed {
    pub result: Result<OperationValue, OperationError>,
    pub cookie: Cookie,
}

mod sealed {
    pub trait Sealed {}

    impl Sealed for super::Document {}
    impl Sealed for super::Stored {}
    impl Sealed for Vec<crate::transport::StatEntry> {}
    impl Sealed for super::ViewResponse {}
    impl Sealed for super::OperationValue {}
}

/// Result types an [`OperationFuture`] can resolve to.
pub trait FromOperationValue: sealed::Sealed + Sized {
    fn from_value(value: OperationValue) -> Result<Self, OperationError>;
}

fn mismatch() -> OperationError {
    OperationError::Transport {
        status: StatusCode::ProtocolError,
    }
}

impl FromOperationValue for Document {
    fn from_value(value: OperationValue) -> Result<Self, OperationError> {
        match value {
            OperationValue::Document(doc) => Ok(doc),
            _ => Err(mismatch()),
        }
    }
}

impl FromOperationValue for Stored {
    fn from_value(value: OperationValue) -> Result<Self, OperationError> {
        match value {
            OperationValue::Stored(stored) => Ok(stored),
            _ => Err(mismatch()),
        }
    }
}

impl FromOperationValue for Vec<StatEntry> {
    fn from_value(value: OperationValue) -> Result<Self, OperationError> {
        match value {
            OperationValue::Stats(stats) => Ok(stats),
            _ => Err(mismatch()),
        }
    }
}

impl FromOperationValue for ViewResponse {
    fn from_value(value: OperationValue) -> Result<Self, OperationError> {
        match value {
            OperationValue::View(view) => Ok(view),
            _ => Err(mismatch()),
        }
    }
}

impl FromOperationValue for OperationValue {
    fn from_value(value: OperationValue) -> Result<Self, OperationError> {
        Ok(value)
    }
}

fn convert<T: FromOperationValue>(
    received: Result<Completed, oneshot::error::RecvError>,
) -> (Result<T, OperationError>, Option<Cookie>) {
    match received {
        Ok(Completed { result, cookie }) => (result.and_then(T::from_value), Some(cookie)),
        Err(_) => (Err(OperationError::Abandoned), None),
    }
}

/// The pending result of one dispatched operation.
///
/// Resolves once. Await it from async code, or call [`wait`](Self::wait)
/// from a thread that is not driving a Tokio runtime.
///
/// Dropping the future does not cancel the operation; its result is
/// discarded when it arrives.
#[must_use = "an operation's result is lost unless the future is awaited or waited on"]
#[derive(Debug)]
pub struct OperationFuture<T> {
    rx: oneshot::Receiver<Completed>,
    _result: PhantomData<fn() -> T>,
}

impl<T: FromOperationValue> OperationFuture<T> {
    pub(crate) fn new(rx: oneshot::Receiver<Completed>) -> Self {
        Self {
            rx,
            _result: PhantomData,
        }
    }

    /// Blocks the current thread until the operation ends.
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context.
    pub fn wait(self) -> Result<T, OperationError> {
        self.wait_with_cookie().0
    }

    /// Like [`wait`](Self::wait), also returning the cookie for reuse.
    ///
    /// The cookie is `None` only when the operation was abandoned.
    pub fn wait_with_cookie(self) -> (Result<T, OperationError>, Option<Cookie>) {
        convert(self.rx.blocking_recv())
    }

    /// Turns this into a future that also yields the cookie.
    pub fn with_cookie(self) -> WithCookie<T> {
        WithCookie { inner: self }
    }
}

impl<T: FromOperationValue> Future for OperationFuture<T> {
    type Output = Result<T, OperationError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| convert(received).0)
    }
}

/// Future returned by [`OperationFuture::with_cookie`].
#[must_use = "futures do nothing unless polled"]
#[derive(Debug)]
pub struct WithCookie<T> {
    inner: OperationFuture<T>,
}

impl<T: FromOperationValue> Future for WithCookie<T> {
    type Output = (Result<T, OperationError>, Option<Cookie>);

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner.rx).poll(cx).map(convert)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_test::{assert_pending, assert_ready, task};

    fn completed(result: Result<OperationValue, OperationError>) -> Completed {
        Completed {
            result,
            cookie: Cookie::new(),
        }
    }

    #[test]
    fn test_future_pending_until_sent() {
        let (tx, rx) = oneshot::channel();
        let mut fut = task::spawn(OperationFuture::<Stored>::new(rx));

        assert_pending!(fut.poll());
        tx.send(completed(Ok(OperationValue::Stored(Stored { cas: 3 }))))
            .unwrap();
        assert!(fut.is_woken());
        assert_eq!(assert_ready!(fut.poll()), Ok(Stored { cas: 3 }));
    }

    #[test]
    fn test_dropped_sender_is_abandoned() {
        let (tx, rx) = oneshot::channel::<Completed>();
        let mut fut = task::spawn(OperationFuture::<Document>::new(rx).with_cookie());
        drop(tx);

        let (result, cookie) = assert_ready!(fut.poll());
        assert_eq!(result, Err(OperationError::Abandoned));
        assert!(cookie.is_none());
    }

    #[test]
    fn test_kind_mismatch_is_protocol_error() {
        let (tx, rx) = oneshot::channel();
        tx.send(completed(Ok(OperationValue::Stats(vec![])))).unwrap();
        let result = OperationFuture::<Document>::new(rx).wait();
        assert_eq!(
            result,
            Err(OperationError::Transport {
                status: StatusCode::ProtocolError
            })
        );
    }

    #[test]
    fn test_wait_with_cookie_returns_cookie() {
        let (tx, rx) = oneshot::channel();
        tx.send(completed(Err(OperationError::NotFound {
            key: "missing-key".into(),
        })))
        .unwrap();

        let (result, cookie) = OperationFuture::<Document>::new(rx).wait_with_cookie();
        assert_eq!(result.unwrap_err().category(), Category::NotFound);
        assert!(cookie.is_some());
    }

    #[test]
    fn test_error_categories() {
        let timeout = OperationError::Transport {
            status: StatusCode::Timeout,
        };
        // A timed-out operation is terminal
        assert_eq!(timeout.category(), Category::Terminal);
        assert!(!timeout.is_retryable());
        assert_eq!(timeout.status_code(), Some(StatusCode::Timeout));

        let busy = OperationError::Transport {
            status: StatusCode::TemporaryFailure,
        };
        assert!(busy.is_retryable());

        // Not-found outside get
        let replace_missing = OperationError::Transport {
            status: StatusCode::KeyNotFound,
        };
        assert_eq!(replace_missing.category(), Category::Terminal);

        let unavailable = OperationError::Http {
            status: 503,
            reason: None,
        };
        assert!(unavailable.is_retryable());

        let missing_view = OperationError::Http {
            status: 404,
            reason: Some("missing".into()),
        };
        assert_eq!(missing_view.category(), Category::Terminal);
        assert_eq!(
            missing_view.to_string(),
            "view request failed with HTTP 404: missing"
        );

        let parse = OperationError::from(ParseError::UnexpectedEof);
        assert_eq!(parse.category(), Category::Terminal);
        assert_eq!(parse.status_code(), None);
    }

    #[test]
    fn test_view_rows() {
        let view = ViewResponse {
            http_status: 200,
            value: json!({
                "total_rows": 2,
                "rows": [
                    {"id": "s1", "key": "alice", "value": 1},
                    {"key": ["a", 1], "value": null}
                ]
            }),
            chunks: 1,
        };
        assert_eq!(view.total_rows(), Some(2));
        let rows = view.rows().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id.as_deref(), Some("s1"));
        assert_eq!(rows[1].id, None);
        assert_eq!(rows[1].key, json!(["a", 1]));

        let empty = ViewResponse {
            http_status: 200,
            value: json!({}),
            chunks: 1,
        };
        assert!(empty.rows().unwrap().is_empty());
    }

    #[test]
    fn test_document_json() {
        let doc = Document {
            key: "user:42".into(),
            value: Bytes::from(r#"{"active":true}"#),
            cas: 1,
        };
        assert_eq!(doc.json::<Value>().unwrap(), json!({"active": true}));
        assert_eq!(doc.as_str(), Some(r#"{"active":true}"#));
    }
}
