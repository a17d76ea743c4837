//! Completion Handlers
//!
//! These run on the event-loop thread, once per transport completion. They
//! never block and never do I/O: they only map the completion onto the
//! pending operation (feeding view chunks into its cookie) and decide
//! whether the operation is over.
//!
//! ```text
//!  get/store/stat:  completion ──> Done
//!  view:            chunk ──> Pending ──> chunk ──> ... ──> final chunk ──> Done
//!                        └──> syntax error / transport error ──────────────> Done
//! ```

use crate::commands::result::{Document, OperationError, OperationValue, Stored, ViewResponse};
use crate::connection::event_loop::PendingOp;
use crate::connection::stats::ConnectionStats;
use crate::cookie::tokenizer::is_whitespace;
use crate::cookie::{ParseError, ParseState, ParseStatus};
use crate::transport::{Category, CompletionBody, OpKind, StatusCode};
use bytes::Bytes;
use serde_json::Value;
use tracing::trace;

/// What a completion did to its operation.
#[derive(Debug, PartialEq)]
pub(crate) enum Step {
    /// More completions are expected
    Pending,
    /// The operation is over
    Done(Result<OperationValue, OperationError>),
}

/// Routes one completion to the handler for the operation's kind.
pub(crate) fn on_completion(
    op: &mut PendingOp,
    status: StatusCode,
    body: CompletionBody,
    stats: &ConnectionStats,
) -> Step {
    match op.kind {
        OpKind::Get => Step::Done(on_get(op, status, body)),
        OpKind::Store => Step::Done(on_store(status, body)),
        OpKind::Stat => Step::Done(on_stat(status, body)),
        OpKind::View => on_view_chunk(op, status, body, stats),
    }
}

fn protocol_error() -> OperationError {
    OperationError::Transport {
        status: StatusCode::ProtocolError,
    }
}

fn on_get(op: &PendingOp, status: StatusCode, body: CompletionBody) -> Result<OperationValue, OperationError> {
    match (status.category(), body) {
        (Category::Success, CompletionBody::Document { value, cas }) => {
            Ok(OperationValue::Document(Document {
                key: op.key.clone().unwrap_or_default(),
                value,
                cas,
            }))
        }
        (Category::Success, _) => Err(protocol_error()),
        (Category::NotFound, _) => Err(OperationError::NotFound {
            key: op.key.clone().unwrap_or_default(),
        }),
        _ => Err(OperationError::Transport { status }),
    }
}

fn on_store(status: StatusCode, body: CompletionBody) -> Result<OperationValue, OperationError> {
    match body {
        CompletionBody::Stored { cas } if status.is_success() => Ok(OperationValue::Stored(Stored { cas })),
        _ if status.is_success() => Err(protocol_error()),
        _ => Err(OperationError::Transport { status }),
    }
}

fn on_stat(status: StatusCode, body: CompletionBody) -> Result<OperationValue, OperationError> {
    match body {
        CompletionBody::Stats(entries) if status.is_success() => Ok(OperationValue::Stats(entries)),
        _ if status.is_success() => Err(protocol_error()),
        _ => Err(OperationError::Transport { status }),
    }
}

fn is_ok_http(status: u16) -> bool {
    (200..300).contains(&status)
}

/// Feeds one view chunk into the operation's cookie.
fn on_view_chunk(
    op: &mut PendingOp,
    status: StatusCode,
    body: CompletionBody,
    stats: &ConnectionStats,
) -> Step {
    if !status.is_success() {
        op.cookie.discard();
        return Step::Done(Err(OperationError::Transport { status }));
    }

    let CompletionBody::ViewChunk {
        http_status,
        data,
        is_final,
    } = body
    else {
        op.cookie.discard();
        return Step::Done(Err(protocol_error()));
    };

    op.http_status = http_status;
    op.chunks += 1;
    stats.view_chunk(data.len());
    trace!(
        chunk = op.chunks,
        bytes = data.len(),
        http_status,
        is_final,
        "view chunk received"
    );

    let start = op.bytes;
    op.bytes += data.len();
    if let Err(e) = feed_chunk(op, &data, start) {
        return Step::Done(Err(http_or_parse_error(op.http_status, e)));
    }
    if !is_final {
        return Step::Pending;
    }

    if let ParseStatus::SyntaxError(e) = op.cookie.finish() {
        return Step::Done(Err(http_or_parse_error(op.http_status, e)));
    }
    let Some(value) = op.cookie.take_value() else {
        return Step::Done(Err(OperationError::Parse(ParseError::UnexpectedEof)));
    };

    if !is_ok_http(op.http_status) {
        return Step::Done(Err(OperationError::Http {
            status: op.http_status,
            reason: error_reason(&value),
        }));
    }

    Step::Done(Ok(OperationValue::View(ViewResponse {
        http_status: op.http_status,
        value,
        chunks: op.chunks,
    })))
}

/// `start` is the stream offset of the chunk's first byte.
fn feed_chunk(op: &mut PendingOp, data: &Bytes, start: usize) -> Result<(), ParseError> {
    // A completed cookie ignores feeds, so check what follows it here
    if op.cookie.state() == ParseState::Complete {
        if let Some(pos) = data.iter().position(|b| !is_whitespace(*b)) {
            let offset = start + pos;
            op.cookie.discard();
            return Err(ParseError::TrailingData { offset });
        }
        return Ok(());
    }

    match op.cookie.feed(data) {
        ParseStatus::SyntaxError(e) => Err(e),
        _ => Ok(()),
    }
}

/// An error page is rarely JSON; report the HTTP status rather than the parse failure.
fn http_or_parse_error(http_status: u16, error: ParseError) -> OperationError {
    if http_status != 0 && !is_ok_http(http_status) {
        OperationError::Http {
            status: http_status,
            reason: None,
        }
    } else {
        OperationError::Parse(error)
    }
}

fn error_reason(value: &Value) -> Option<String> {
    ["reason", "error"]
        .iter()
        .find_map(|field| value.get(field).and_then(Value::as_str))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::result::Completed;
    use crate::cookie::Cookie;
    use serde_json::json;
    use std::time::Instant;
    use tokio::sync::oneshot;

    fn op(kind: OpKind, key: Option<&str>) -> (PendingOp, oneshot::Receiver<Completed>) {
        let (reply, rx) = oneshot::channel();
        let op = PendingOp::new(kind, key.map(str::to_string), Cookie::new(), Some(Instant::now()), reply);
        (op, rx)
    }

    fn chunk(http_status: u16, data: &str, is_final: bool) -> CompletionBody {
        CompletionBody::ViewChunk {
            http_status,
            data: Bytes::from(data.to_string()),
            is_final,
        }
    }

    fn feed_all(op: &mut PendingOp, chunks: &[(u16, &str, bool)]) -> Vec<Step> {
        let stats = ConnectionStats::new();
        chunks
            .iter()
            .map(|(status, data, is_final)| {
                on_completion(op, StatusCode::Success, chunk(*status, data, *is_final), &stats)
            })
            .collect()
    }

    #[test]
    fn test_get_found_and_missing() {
        let stats = ConnectionStats::new();
        let (mut get, _rx) = op(OpKind::Get, Some("user:42"));

        let step = on_completion(
            &mut get,
            StatusCode::Success,
            CompletionBody::Document {
                value: Bytes::from("{}"),
                cas: 9,
            },
            &stats,
        );
        assert_eq!(
            step,
            Step::Done(Ok(OperationValue::Document(Document {
                key: "user:42".into(),
                value: Bytes::from("{}"),
                cas: 9,
            })))
        );

        let (mut missing, _rx) = op(OpKind::Get, Some("missing-key"));
        let step = on_completion(&mut missing, StatusCode::KeyNotFound, CompletionBody::Empty, &stats);
        assert_eq!(
            step,
            Step::Done(Err(OperationError::NotFound {
                key: "missing-key".into()
            }))
        );
    }

    #[test]
    fn test_store_does_not_touch_cookie() {
        let stats = ConnectionStats::new();
        let (mut set, _rx) = op(OpKind::Store, Some("user:42"));

        let step = on_completion(&mut set, StatusCode::Success, CompletionBody::Stored { cas: 1 }, &stats);
        assert_eq!(step, Step::Done(Ok(OperationValue::Stored(Stored { cas: 1 }))));
        assert_eq!(set.cookie.state(), ParseState::Fresh);
        assert_eq!(set.cookie.chunks_fed(), 0);

        let (mut replace, _rx) = op(OpKind::Store, Some("absent"));
        let step = on_completion(&mut replace, StatusCode::KeyNotFound, CompletionBody::Empty, &stats);
        assert_eq!(
            step,
            Step::Done(Err(OperationError::Transport {
                status: StatusCode::KeyNotFound
            }))
        );
    }

    #[test]
    fn test_body_mismatch_is_protocol_error() {
        let stats = ConnectionStats::new();
        let (mut stat, _rx) = op(OpKind::Stat, None);
        let step = on_completion(&mut stat, StatusCode::Success, CompletionBody::Empty, &stats);
        assert_eq!(step, Step::Done(Err(protocol_error())));
    }

    #[test]
    fn test_view_three_chunks() {
        let (mut view, _rx) = op(OpKind::View, None);
        let steps = feed_all(
            &mut view,
            &[
                (200, "{\"rows\":[", false),
                (200, "{\"id\":\"a\"}]", false),
                (200, "}", true),
            ],
        );

        assert_eq!(steps[0], Step::Pending);
        assert_eq!(steps[1], Step::Pending);
        assert_eq!(
            steps[2],
            Step::Done(Ok(OperationValue::View(ViewResponse {
                http_status: 200,
                value: json!({"rows": [{"id": "a"}]}),
                chunks: 3,
            })))
        );
        // Value moved out; cookie recycled
        assert_eq!(view.cookie.state(), ParseState::Fresh);
    }

    #[test]
    fn test_view_syntax_error_ends_operation() {
        let (mut view, _rx) = op(OpKind::View, None);
        let steps = feed_all(&mut view, &[(200, "{\"rows\":[", false), (200, "}", false)]);
        assert_eq!(steps[0], Step::Pending);
        assert!(matches!(
            steps[1],
            Step::Done(Err(OperationError::Parse(ParseError::UnexpectedByte { byte: b'}', .. })))
        ));
    }

    #[test]
    fn test_view_trailing_data_in_later_chunk() {
        let (mut view, _rx) = op(OpKind::View, None);
        let steps = feed_all(
            &mut view,
            &[(200, "{\"rows\":[]}", false), (200, " \n", false), (200, " x", true)],
        );
        assert_eq!(steps[1], Step::Pending);
        assert_eq!(
            steps[2],
            Step::Done(Err(OperationError::Parse(ParseError::TrailingData { offset: 14 })))
        );
        assert_eq!(view.cookie.state(), ParseState::Discarded);
    }

    #[test]
    fn test_view_truncated_stream() {
        let (mut view, _rx) = op(OpKind::View, None);
        let steps = feed_all(&mut view, &[(200, "{\"rows\":[", true)]);
        assert_eq!(
            steps[0],
            Step::Done(Err(OperationError::Parse(ParseError::UnexpectedEof)))
        );
    }

    #[test]
    fn test_view_transport_error_discards_partial_state() {
        let stats = ConnectionStats::new();
        let (mut view, _rx) = op(OpKind::View, None);
        on_completion(&mut view, StatusCode::Success, chunk(200, "{\"rows\":[", false), &stats);

        let step = on_completion(&mut view, StatusCode::NetworkError, CompletionBody::Empty, &stats);
        assert_eq!(
            step,
            Step::Done(Err(OperationError::Transport {
                status: StatusCode::NetworkError
            }))
        );
        assert_eq!(view.cookie.state(), ParseState::Discarded);
        assert!(view.cookie.value().is_none());
    }

    #[test]
    fn test_view_http_errors() {
        let (mut view, _rx) = op(OpKind::View, None);
        let steps = feed_all(
            &mut view,
            &[(404, r#"{"error":"not_found","reason":"missing"}"#, true)],
        );
        assert_eq!(
            steps[0],
            Step::Done(Err(OperationError::Http {
                status: 404,
                reason: Some("missing".into())
            }))
        );

        let (mut view, _rx) = op(OpKind::View, None);
        let steps = feed_all(&mut view, &[(502, "<html>Bad Gateway</html>", true)]);
        assert_eq!(
            steps[0],
            Step::Done(Err(OperationError::Http {
                status: 502,
                reason: None
            }))
        );
    }

    #[test]
    fn test_view_chunks_counted() {
        let stats = ConnectionStats::new();
        let (mut view, _rx) = op(OpKind::View, None);
        on_completion(&mut view, StatusCode::Success, chunk(200, "[1,", false), &stats);
        on_completion(&mut view, StatusCode::Success, chunk(200, "2]", true), &stats);
        assert_eq!(stats.view_chunks.load(std::sync::atomic::Ordering::Relaxed), 2);
        assert_eq!(stats.view_bytes.load(std::sync::atomic::Ordering::Relaxed), 5);
    }
}
