//! Per-Operation Cookie
//!
//! A cookie is the context an operation carries across the asynchronous
//! boundary. For view queries it owns the streaming tokenizer and the
//! assembled value; for key/value operations it simply travels with the
//! request and comes back to the caller with the result.
//!
//! ## Life Cycle
//!
//! ```text
//!   Fresh ──feed──> Incomplete ──feed──> Complete ──take_value/reset──> Fresh
//!     │                 │
//!     │                 ├──feed/finish (malformed)──> SyntaxError
//!     │                 │
//!     └─────────────────┴──discard (transport error)──> Discarded
//! ```
//!
//! `Complete`, `SyntaxError` and `Discarded` are terminal: further feeds are
//! no-ops that report the terminal status again.

use crate::cookie::tokenizer::{JsonTokenizer, ParseError, MAX_NESTING_DEPTH};
use serde_json::Value;

/// Parse status reported after each feed.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseStatus<'a> {
    /// More chunks are needed
    Incomplete,
    /// The document is complete
    Complete(&'a Value),
    /// The document is malformed; the cookie is terminal
    SyntaxError(ParseError),
}

impl ParseStatus<'_> {
    /// Returns true for `Complete` and `SyntaxError`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ParseStatus::Incomplete)
    }
}

/// Where a cookie is in its life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseState {
    /// Nothing fed yet
    #[default]
    Fresh,
    /// Part of a document has been fed
    Incomplete,
    /// A full document has been assembled
    Complete,
    /// The input was malformed
    SyntaxError,
    /// Partial state was dropped because the operation failed in transport
    Discarded,
}

impl ParseState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ParseState::Complete | ParseState::SyntaxError | ParseState::Discarded
        )
    }
}

/// Context token bound to one in-flight operation.
///
/// # Example
///
/// ```
/// use couchlink::cookie::{Cookie, ParseStatus};
/// use serde_json::json;
///
/// let mut cookie = Cookie::new();
/// assert_eq!(cookie.feed(b"{\"rows\":["), ParseStatus::Incomplete);
/// assert_eq!(cookie.feed(b"{\"id\":\"a\"}]"), ParseStatus::Incomplete);
/// assert_eq!(
///     cookie.feed(b"}"),
///     ParseStatus::Complete(&json!({"rows": [{"id": "a"}]}))
/// );
/// ```
#[derive(Debug, Default)]
pub struct Cookie {
    tokenizer: JsonTokenizer,
    value: Option<Value>,
    state: ParseState,
    last_error: Option<ParseError>,
    chunks: u64,
}

impl Cookie {
    /// Creates a fresh cookie with the default document size limit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a fresh cookie that rejects documents larger than `max_size`.
    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            tokenizer: JsonTokenizer::with_limits(max_size, MAX_NESTING_DEPTH),
            ..Self::default()
        }
    }

    /// Feeds one response chunk.
    ///
    /// Each call resumes where the previous one stopped. A zero-length chunk
    /// changes nothing. Feeding a terminal cookie is a no-op.
    pub fn feed(&mut self, chunk: &[u8]) -> ParseStatus<'_> {
        if self.state.is_terminal() || chunk.is_empty() {
            return self.status();
        }

        self.chunks += 1;
        match self.tokenizer.feed(chunk) {
            Ok(Some(value)) => {
                self.value = Some(value);
                self.state = ParseState::Complete;
            }
            Ok(None) => self.state = ParseState::Incomplete,
            Err(e) => self.fail(e),
        }

        self.status()
    }

    /// Marks the end of the response stream.
    ///
    /// Completes a pending top-level scalar; any other unfinished document
    /// becomes a `SyntaxError`.
    pub fn finish(&mut self) -> ParseStatus<'_> {
        if self.state.is_terminal() {
            return self.status();
        }

        match self.tokenizer.finish() {
            Ok(Some(value)) => {
                self.value = Some(value);
                self.state = ParseState::Complete;
            }
            Ok(None) => {}
            Err(e) => self.fail(e),
        }

        self.status()
    }

    /// Drops all partial state after a transport failure.
    pub fn discard(&mut self) {
        self.tokenizer.reset();
        self.value = None;
        self.last_error = None;
        self.state = ParseState::Discarded;
    }

    /// Recycles the cookie for a new operation.
    pub fn reset(&mut self) {
        self.tokenizer.reset();
        self.value = None;
        self.last_error = None;
        self.state = ParseState::Fresh;
        self.chunks = 0;
    }

    /// Moves the assembled value out, recycling the cookie.
    ///
    /// Returns `None` (and leaves the cookie untouched) unless the cookie is
    /// `Complete`.
    pub fn take_value(&mut self) -> Option<Value> {
        if self.state != ParseState::Complete {
            return None;
        }
        let value = self.value.take();
        self.reset();
        value
    }

    /// Current status, without feeding anything.
    pub fn status(&self) -> ParseStatus<'_> {
        match (self.state, &self.value, &self.last_error) {
            (ParseState::Complete, Some(value), _) => ParseStatus::Complete(value),
            (ParseState::SyntaxError, _, Some(e)) => ParseStatus::SyntaxError(e.clone()),
            _ => ParseStatus::Incomplete,
        }
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    /// The assembled value, once complete.
    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    /// The error that made this cookie terminal, if any.
    pub fn last_error(&self) -> Option<&ParseError> {
        self.last_error.as_ref()
    }

    /// Number of non-empty chunks fed so far.
    pub fn chunks_fed(&self) -> u64 {
        self.chunks
    }

    /// Number of bytes consumed by the tokenizer so far.
    pub fn bytes_fed(&self) -> usize {
        self.tokenizer.consumed()
    }

    fn fail(&mut self, error: ParseError) {
        self.value = None;
        self.last_error = Some(error);
        self.state = ParseState::SyntaxError;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_view_response_in_three_chunks() {
        let mut cookie = Cookie::new();

        assert_eq!(cookie.feed(br#"{"rows":["#), ParseStatus::Incomplete);
        assert_eq!(cookie.feed(br#"{"id":"a"}]"#), ParseStatus::Incomplete);
        assert_eq!(
            cookie.feed(b"}"),
            ParseStatus::Complete(&json!({"rows": [{"id": "a"}]}))
        );
        assert_eq!(cookie.state(), ParseState::Complete);
        assert_eq!(cookie.chunks_fed(), 3);
    }

    #[test]
    fn test_empty_chunk_does_not_change_status() {
        let mut cookie = Cookie::new();
        assert_eq!(cookie.feed(b""), ParseStatus::Incomplete);
        assert_eq!(cookie.state(), ParseState::Fresh);

        cookie.feed(b"[1,");
        let consumed = cookie.bytes_fed();
        assert_eq!(cookie.feed(b""), ParseStatus::Incomplete);
        assert_eq!(cookie.bytes_fed(), consumed);
        assert_eq!(cookie.chunks_fed(), 1);

        cookie.feed(b"2]");
        assert_eq!(cookie.feed(b""), ParseStatus::Complete(&json!([1, 2])));
    }

    #[test]
    fn test_syntax_error_is_terminal() {
        let mut cookie = Cookie::new();
        cookie.feed(b"{\"a\":");
        let status = cookie.feed(b"}");
        assert!(matches!(status, ParseStatus::SyntaxError(_)));
        assert_eq!(cookie.value(), None);

        // Further input does not revive the cookie
        assert!(matches!(cookie.feed(b"1}"), ParseStatus::SyntaxError(_)));
        assert!(matches!(cookie.finish(), ParseStatus::SyntaxError(_)));
        assert_eq!(cookie.chunks_fed(), 2);
    }

    #[test]
    fn test_complete_is_not_feedable() {
        let mut cookie = Cookie::new();
        cookie.feed(b"{}");
        assert_eq!(cookie.feed(b"garbage"), ParseStatus::Complete(&json!({})));
        assert_eq!(cookie.chunks_fed(), 1);
    }

    #[test]
    fn test_finish_completes_top_level_number() {
        let mut cookie = Cookie::new();
        cookie.feed(b"12");
        assert_eq!(cookie.finish(), ParseStatus::Complete(&json!(12)));
    }

    #[test]
    fn test_finish_truncated_is_syntax_error() {
        let mut cookie = Cookie::new();
        cookie.feed(b"{\"rows\":[");
        assert_eq!(
            cookie.finish(),
            ParseStatus::SyntaxError(ParseError::UnexpectedEof)
        );
        assert_eq!(cookie.last_error(), Some(&ParseError::UnexpectedEof));
    }

    #[test]
    fn test_discard_drops_partial_state() {
        let mut cookie = Cookie::new();
        cookie.feed(b"{\"rows\":[{\"id\":");
        cookie.discard();

        assert_eq!(cookie.state(), ParseState::Discarded);
        assert_eq!(cookie.value(), None);
        assert_eq!(cookie.last_error(), None);
        assert_eq!(cookie.bytes_fed(), 0);
        assert_eq!(cookie.feed(b"\"a\"}]}"), ParseStatus::Incomplete);
    }

    #[test]
    fn test_take_value_recycles() {
        let mut cookie = Cookie::new();
        assert_eq!(cookie.take_value(), None);

        cookie.feed(b"[true]");
        assert_eq!(cookie.take_value(), Some(json!([true])));
        assert_eq!(cookie.state(), ParseState::Fresh);
        assert_eq!(cookie.chunks_fed(), 0);

        cookie.feed(b"null ");
        assert_eq!(cookie.value(), Some(&Value::Null));
    }

    #[test]
    fn test_max_size() {
        let mut cookie = Cookie::with_max_size(4);
        assert!(matches!(
            cookie.feed(b"[1,2,3]"),
            ParseStatus::SyntaxError(ParseError::DocumentTooLarge { max: 4, .. })
        ));
    }

    fn arb_json() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| json!(n)),
            ".{0,12}".prop_map(Value::String),
        ];
        leaf.prop_recursive(4, 48, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
                prop::collection::btree_map(".{0,8}", inner, 0..6)
                    .prop_map(|map| Value::Object(map.into_iter().collect())),
            ]
        })
    }

    /// Splits `bytes` at the given (unsorted, possibly repeated) positions.
    fn split_at_points(bytes: &[u8], points: &[usize]) -> Vec<Vec<u8>> {
        let mut cuts: Vec<usize> = points.iter().map(|p| p % (bytes.len() + 1)).collect();
        cuts.sort_unstable();
        let mut chunks = Vec::new();
        let mut start = 0;
        for cut in cuts {
            chunks.push(bytes[start..cut].to_vec());
            start = cut;
        }
        chunks.push(bytes[start..].to_vec());
        chunks
    }

    proptest! {
        #[test]
        fn prop_chunking_does_not_change_result(
            value in arb_json(),
            points in prop::collection::vec(any::<usize>(), 0..8),
        ) {
            let text = serde_json::to_vec(&value).unwrap();

            let mut whole = Cookie::new();
            whole.feed(&text);
            let whole_status = whole.finish();
            prop_assert_eq!(whole_status, ParseStatus::Complete(&value));

            // Empty chunks produced by repeated cut points are part of the test
            let mut chunked = Cookie::new();
            for chunk in split_at_points(&text, &points) {
                let status = chunked.feed(&chunk);
                prop_assert!(!matches!(status, ParseStatus::SyntaxError(_)));
            }
            prop_assert_eq!(chunked.finish(), ParseStatus::Complete(&value));
        }

        #[test]
        fn prop_truncated_container_never_completes(
            value in arb_json(),
            cut in any::<usize>(),
            points in prop::collection::vec(any::<usize>(), 0..4),
        ) {
            let text = serde_json::to_vec(&json!([value])).unwrap();
            let prefix = &text[..cut % text.len()];

            let mut cookie = Cookie::new();
            for chunk in split_at_points(prefix, &points) {
                let status = cookie.feed(&chunk);
                prop_assert!(!matches!(status, ParseStatus::Complete(_)));
            }
            prop_assert!(matches!(cookie.finish(), ParseStatus::SyntaxError(_)));
        }

        #[test]
        fn prop_corrupted_byte_never_completes_wrongly(
            value in arb_json(),
            at in any::<usize>(),
            byte in any::<u8>(),
            points in prop::collection::vec(any::<usize>(), 0..6),
        ) {
            let mut text = serde_json::to_vec(&json!({"v": value})).unwrap();
            let at = at % text.len();
            text[at] = byte;
            let accepted = serde_json::from_slice::<Value>(&text).ok();

            // In one chunk a value is only produced when the bytes say so
            let mut whole = Cookie::new();
            whole.feed(&text);
            let whole_status = whole.finish();
            if let ParseStatus::Complete(got) = &whole_status {
                prop_assert_eq!(Some(*got), accepted.as_ref());
            }

            // Chunked, bytes after an early close are never looked at
            let mut chunked = Cookie::new();
            for chunk in split_at_points(&text, &points) {
                chunked.feed(&chunk);
            }
            if let ParseStatus::Complete(got) = chunked.finish() {
                let early_close = matches!(
                    &whole_status,
                    ParseStatus::SyntaxError(ParseError::TrailingData { .. })
                );
                prop_assert!(
                    early_close || whole_status == ParseStatus::Complete(got),
                    "chunked {:?} vs whole {:?}",
                    got,
                    whole_status
                );
            }
        }

        #[test]
        fn prop_empty_chunks_change_nothing(
            value in arb_json(),
            points in prop::collection::vec(any::<usize>(), 0..6),
            empties in prop::collection::vec(0usize..3, 1..8),
            corrupt in prop::option::of((any::<usize>(), any::<u8>())),
        ) {
            let mut text = serde_json::to_vec(&json!([value])).unwrap();
            if let Some((at, byte)) = corrupt {
                let at = at % text.len();
                text[at] = byte;
            }

            let mut plain = Cookie::new();
            let mut padded = Cookie::new();
            for (i, chunk) in split_at_points(&text, &points).iter().enumerate() {
                plain.feed(chunk);
                for _ in 0..empties[i % empties.len()] {
                    let before = (padded.state(), padded.chunks_fed(), padded.bytes_fed());
                    padded.feed(&[]);
                    prop_assert_eq!(
                        (padded.state(), padded.chunks_fed(), padded.bytes_fed()),
                        before
                    );
                }
                padded.feed(chunk);
                prop_assert_eq!(padded.state(), plain.state());
            }

            padded.feed(&[]);
            prop_assert_eq!(padded.finish(), plain.finish());
        }

        #[test]
        fn prop_trailing_garbage_is_rejected(
            value in arb_json(),
            garbage in "[a-z{}\\[\\],:]{1,4}",
        ) {
            let mut text = serde_json::to_vec(&json!({"v": value})).unwrap();
            text.extend_from_slice(garbage.as_bytes());

            let mut cookie = Cookie::new();
            let status = cookie.feed(&text);
            prop_assert!(
                matches!(status, ParseStatus::SyntaxError(ParseError::TrailingData { .. })),
                "unexpected status {:?}",
                status
            );
        }
    }
}
