//! Resumable JSON Tokenizer
//!
//! This module implements an incremental, validating JSON scanner. View query
//! responses arrive from the transport in arbitrary chunks, so the tokenizer
//! keeps its position between calls and only materializes a value once the
//! top-level document has been closed.
//!
//! ## How the Tokenizer Works
//!
//! Every byte advances a small state machine:
//!
//! - a stack of open containers (`{` / `[`)
//! - the token expected next (value, key, colon, comma or close)
//! - the lexeme currently being scanned (string, number or literal)
//!
//! `feed()` returns:
//! - `Ok(Some(value))` - the top-level document is complete
//! - `Ok(None)` - need more data
//! - `Err(ParseError)` - the input can never become valid JSON
//!
//! Bytes are buffered until the document closes, then decoded in one pass by
//! `serde_json`. The scanner rejects malformed input as soon as the offending
//! byte arrives, so a broken response fails fast instead of buffering forever.

use bytes::BytesMut;
use serde_json::Value;
use thiserror::Error;

/// Errors that can occur while assembling a JSON document.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    /// A byte that cannot appear at this position
    #[error("unexpected byte {byte:#04x} at offset {offset}")]
    UnexpectedByte { byte: u8, offset: usize },

    /// Malformed number literal
    #[error("invalid number at offset {offset}")]
    InvalidNumber { offset: usize },

    /// Unknown escape or bad `\u` sequence inside a string
    #[error("invalid escape sequence at offset {offset}")]
    InvalidEscape { offset: usize },

    /// Raw control character inside a string
    #[error("unescaped control character at offset {offset}")]
    ControlCharacter { offset: usize },

    /// Containers nested deeper than the configured limit
    #[error("maximum nesting depth exceeded: {max}")]
    NestingTooDeep { max: usize },

    /// The document exceeds the maximum allowed size
    #[error("document too large: {size} bytes (max: {max})")]
    DocumentTooLarge { size: usize, max: usize },

    /// Non-whitespace input after the top-level value
    #[error("trailing data after document at offset {offset}")]
    TrailingData { offset: usize },

    /// The stream ended before the document was complete
    #[error("unexpected end of input")]
    UnexpectedEof,

    /// The scanner accepted the structure but decoding failed (bad UTF-8,
    /// lone surrogate escapes, ...)
    #[error("invalid document: {0}")]
    InvalidDocument(String),
}

/// Result type for tokenizer operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Maximum container nesting depth.
pub const MAX_NESTING_DEPTH: usize = 128;

/// Default maximum size of a single document (64 MB).
pub const MAX_DOCUMENT_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Container {
    Object,
    Array,
}

/// The token the scanner expects next (outside of a lexeme).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    /// A value: top level, after `:` or after `,` inside an array
    Value,
    /// Right after `[`
    ValueOrClose,
    /// Right after `{`
    KeyOrClose,
    /// After `,` inside an object
    Key,
    Colon,
    CommaOrClose,
    /// The top-level value is closed; only whitespace may follow
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Escape {
    None,
    Backslash,
    /// Hex digits still expected in a `\uXXXX` escape
    Unicode(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NumPhase {
    Minus,
    Zero,
    Int,
    Dot,
    Frac,
    Exp,
    ExpSign,
    ExpDigits,
}

impl NumPhase {
    /// Whether a number may legally end in this phase.
    fn is_terminal(self) -> bool {
        matches!(
            self,
            NumPhase::Zero | NumPhase::Int | NumPhase::Frac | NumPhase::ExpDigits
        )
    }

    fn advance(self, byte: u8) -> Option<NumPhase> {
        use NumPhase::*;
        match (self, byte) {
            (Minus, b'0') => Some(Zero),
            (Minus, b'1'..=b'9') => Some(Int),
            (Zero | Int | Frac, b'e' | b'E') => Some(Exp),
            (Zero | Int, b'.') => Some(Dot),
            (Int, b'0'..=b'9') => Some(Int),
            (Dot | Frac, b'0'..=b'9') => Some(Frac),
            (Exp, b'+' | b'-') => Some(ExpSign),
            (Exp | ExpSign | ExpDigits, b'0'..=b'9') => Some(ExpDigits),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lexeme {
    String { key: bool, escape: Escape },
    Number(NumPhase),
    Literal { word: &'static [u8], matched: usize },
}

/// JSON insignificant whitespace.
#[inline]
pub fn is_whitespace(byte: u8) -> bool {
    matches!(byte, b' ' | b'\t' | b'\n' | b'\r')
}

/// An incremental JSON tokenizer.
///
/// # Example
///
/// ```
/// use couchlink::cookie::JsonTokenizer;
///
/// let mut tokenizer = JsonTokenizer::new();
/// assert_eq!(tokenizer.feed(b"{\"rows\":[").unwrap(), None);
/// let value = tokenizer.feed(b"]}").unwrap().unwrap();
/// assert_eq!(value, serde_json::json!({"rows": []}));
/// ```
#[derive(Debug)]
pub struct JsonTokenizer {
    /// Bytes of the document seen so far
    buffer: BytesMut,
    /// Open containers, innermost last
    stack: Vec<Container>,
    expect: Expect,
    lexeme: Option<Lexeme>,
    /// Total bytes consumed across all feeds
    consumed: usize,
    max_size: usize,
    max_depth: usize,
}

impl Default for JsonTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl JsonTokenizer {
    /// Creates a tokenizer with the default size and depth limits.
    pub fn new() -> Self {
        Self::with_limits(MAX_DOCUMENT_SIZE, MAX_NESTING_DEPTH)
    }

    /// Creates a tokenizer with custom limits.
    pub fn with_limits(max_size: usize, max_depth: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            stack: Vec::new(),
            expect: Expect::Value,
            lexeme: None,
            consumed: 0,
            max_size,
            max_depth,
        }
    }

    /// Maximum document size accepted by this tokenizer.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Total number of bytes consumed so far.
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// Current container nesting depth.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Returns true once the top-level value has been closed.
    pub fn is_complete(&self) -> bool {
        self.expect == Expect::Done && self.lexeme.is_none()
    }

    /// Discards all parse state, keeping the configured limits.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.stack.clear();
        self.expect = Expect::Value;
        self.lexeme = None;
        self.consumed = 0;
    }

    /// Feeds the next chunk of input.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(value))` - this chunk completed the document
    /// - `Ok(None)` - more input is needed (or the chunk was empty, or the
    ///   document was already complete and the chunk held only whitespace)
    /// - `Err(e)` - the input is malformed; the tokenizer has been reset
    pub fn feed(&mut self, chunk: &[u8]) -> ParseResult<Option<Value>> {
        if chunk.is_empty() {
            return Ok(None);
        }

        let was_complete = self.is_complete();
        let mut end = None;

        for (i, &byte) in chunk.iter().enumerate() {
            let offset = self.consumed + i;
            if let Err(e) = self.step(byte, offset) {
                self.reset();
                return Err(e);
            }
            if end.is_none() && !was_complete && self.is_complete() {
                end = Some(i + 1);
            }
        }

        if was_complete {
            self.consumed += chunk.len();
            return Ok(None);
        }

        let take = end.unwrap_or(chunk.len());
        let size = self.buffer.len() + take;
        if size > self.max_size {
            let max = self.max_size;
            self.reset();
            return Err(ParseError::DocumentTooLarge { size, max });
        }

        self.buffer.extend_from_slice(&chunk[..take]);
        self.consumed += chunk.len();

        match end {
            Some(_) => self.decode().map(Some),
            None => Ok(None),
        }
    }

    /// Signals the end of the input stream.
    ///
    /// A top-level number has no closing delimiter, so it only completes
    /// here. Any other unfinished document is an error.
    pub fn finish(&mut self) -> ParseResult<Option<Value>> {
        if self.is_complete() {
            return Ok(None);
        }

        match self.lexeme {
            Some(Lexeme::Number(phase)) if phase.is_terminal() && self.stack.is_empty() => {
                self.lexeme = None;
                self.expect = Expect::Done;
                self.decode().map(Some)
            }
            _ => {
                self.reset();
                Err(ParseError::UnexpectedEof)
            }
        }
    }

    /// Decodes the buffered document and releases the buffer.
    fn decode(&mut self) -> ParseResult<Value> {
        let result = serde_json::from_slice(&self.buffer);
        self.buffer = BytesMut::new();
        result.map_err(|e| {
            self.reset();
            ParseError::InvalidDocument(e.to_string())
        })
    }

    /// Advances the state machine by one byte.
    fn step(&mut self, byte: u8, offset: usize) -> ParseResult<()> {
        match self.lexeme {
            Some(Lexeme::String { key, escape }) => return self.step_string(key, escape, byte, offset),
            Some(Lexeme::Literal { word, matched }) => {
                if byte != word[matched] {
                    return Err(ParseError::UnexpectedByte { byte, offset });
                }
                if matched + 1 == word.len() {
                    self.lexeme = None;
                    self.value_done();
                } else {
                    self.lexeme = Some(Lexeme::Literal {
                        word,
                        matched: matched + 1,
                    });
                }
                return Ok(());
            }
            Some(Lexeme::Number(phase)) => match phase.advance(byte) {
                Some(next) => {
                    self.lexeme = Some(Lexeme::Number(next));
                    return Ok(());
                }
                // The number ends here; the byte is structural
                None if phase.is_terminal() => {
                    self.lexeme = None;
                    self.value_done();
                }
                None => return Err(ParseError::InvalidNumber { offset }),
            },
            None => {}
        }

        self.step_structural(byte, offset)
    }

    fn step_string(&mut self, key: bool, escape: Escape, byte: u8, offset: usize) -> ParseResult<()> {
        let escape = match escape {
            Escape::None => match byte {
                b'"' => {
                    self.lexeme = None;
                    if key {
                        self.expect = Expect::Colon;
                    } else {
                        self.value_done();
                    }
                    return Ok(());
                }
                b'\\' => Escape::Backslash,
                0x00..=0x1f => return Err(ParseError::ControlCharacter { offset }),
                _ => Escape::None,
            },
            Escape::Backslash => match byte {
                b'"' | b'\\' | b'/' | b'b' | b'f' | b'n' | b'r' | b't' => Escape::None,
                b'u' => Escape::Unicode(4),
                _ => return Err(ParseError::InvalidEscape { offset }),
            },
            Escape::Unicode(remaining) => {
                if !byte.is_ascii_hexdigit() {
                    return Err(ParseError::InvalidEscape { offset });
                }
                if remaining == 1 {
                    Escape::None
                } else {
                    Escape::Unicode(remaining - 1)
                }
            }
        };

        self.lexeme = Some(Lexeme::String { key, escape });
        Ok(())
    }

    fn step_structural(&mut self, byte: u8, offset: usize) -> ParseResult<()> {
        if is_whitespace(byte) {
            return Ok(());
        }

        match self.expect {
            Expect::Done => Err(ParseError::TrailingData { offset }),
            Expect::ValueOrClose if byte == b']' => self.close(Container::Array, byte, offset),
            Expect::Value | Expect::ValueOrClose => self.begin_value(byte, offset),
            Expect::KeyOrClose if byte == b'}' => self.close(Container::Object, byte, offset),
            Expect::KeyOrClose | Expect::Key => {
                if byte != b'"' {
                    return Err(ParseError::UnexpectedByte { byte, offset });
                }
                self.lexeme = Some(Lexeme::String {
                    key: true,
                    escape: Escape::None,
                });
                Ok(())
            }
            Expect::Colon => {
                if byte != b':' {
                    return Err(ParseError::UnexpectedByte { byte, offset });
                }
                self.expect = Expect::Value;
                Ok(())
            }
            Expect::CommaOrClose => match (byte, self.stack.last()) {
                (b',', Some(Container::Object)) => {
                    self.expect = Expect::Key;
                    Ok(())
                }
                (b',', Some(Container::Array)) => {
                    self.expect = Expect::Value;
                    Ok(())
                }
                (b'}', Some(Container::Object)) => self.close(Container::Object, byte, offset),
                (b']', Some(Container::Array)) => self.close(Container::Array, byte, offset),
                _ => Err(ParseError::UnexpectedByte { byte, offset }),
            },
        }
    }

    fn begin_value(&mut self, byte: u8, offset: usize) -> ParseResult<()> {
        let lexeme = match byte {
            b'{' => return self.open(Container::Object),
            b'[' => return self.open(Container::Array),
            b'"' => Lexeme::String {
                key: false,
                escape: Escape::None,
            },
            b'-' => Lexeme::Number(NumPhase::Minus),
            b'0' => Lexeme::Number(NumPhase::Zero),
            b'1'..=b'9' => Lexeme::Number(NumPhase::Int),
            b't' => Lexeme::Literal {
                word: b"true",
                matched: 1,
            },
            b'f' => Lexeme::Literal {
                word: b"false",
                matched: 1,
            },
            b'n' => Lexeme::Literal {
                word: b"null",
                matched: 1,
            },
            _ => return Err(ParseError::UnexpectedByte { byte, offset }),
        };

        self.lexeme = Some(lexeme);
        Ok(())
    }

    fn open(&mut self, container: Container) -> ParseResult<()> {
        if self.stack.len() >= self.max_depth {
            return Err(ParseError::NestingTooDeep {
                max: self.max_depth,
            });
        }
        self.stack.push(container);
        self.expect = match container {
            Container::Object => Expect::KeyOrClose,
            Container::Array => Expect::ValueOrClose,
        };
        Ok(())
    }

    fn close(&mut self, container: Container, byte: u8, offset: usize) -> ParseResult<()> {
        if self.stack.pop() != Some(container) {
            return Err(ParseError::UnexpectedByte { byte, offset });
        }
        self.value_done();
        Ok(())
    }

    /// A value just ended: decide what may follow it.
    fn value_done(&mut self) {
        self.expect = if self.stack.is_empty() {
            Expect::Done
        } else {
            Expect::CommaOrClose
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn feed_all(chunks: &[&[u8]]) -> ParseResult<Option<Value>> {
        let mut tokenizer = JsonTokenizer::new();
        let mut last = Ok(None);
        for chunk in chunks {
            last = tokenizer.feed(chunk);
            if last.is_err() {
                return last;
            }
        }
        last
    }

    #[test]
    fn test_single_chunk_object() {
        let value = feed_all(&[br#"{"a":1,"b":[true,false,null],"c":"x"}"#])
            .unwrap()
            .unwrap();
        assert_eq!(value, json!({"a": 1, "b": [true, false, null], "c": "x"}));
    }

    #[test]
    fn test_split_inside_string_escape() {
        let mut tokenizer = JsonTokenizer::new();
        assert_eq!(tokenizer.feed(br#"["a\"#).unwrap(), None);
        assert_eq!(tokenizer.feed(br#"u00"#).unwrap(), None);
        assert_eq!(tokenizer.feed(br#"e9b"]"#).unwrap(), Some(json!(["a\u{e9}b"])));
    }

    #[test]
    fn test_split_inside_literal_and_number() {
        let mut tokenizer = JsonTokenizer::new();
        assert_eq!(tokenizer.feed(b"[tr").unwrap(), None);
        assert_eq!(tokenizer.feed(b"ue,-1").unwrap(), None);
        assert_eq!(tokenizer.feed(b"2.5e").unwrap(), None);
        assert_eq!(tokenizer.feed(b"+3]").unwrap(), Some(json!([true, -12.5e3])));
    }

    #[test]
    fn test_empty_chunk_is_noop() {
        let mut tokenizer = JsonTokenizer::new();
        tokenizer.feed(b"{\"k\"").unwrap();
        let consumed = tokenizer.consumed();
        assert_eq!(tokenizer.feed(b"").unwrap(), None);
        assert_eq!(tokenizer.consumed(), consumed);
        assert_eq!(tokenizer.feed(b":1}").unwrap(), Some(json!({"k": 1})));
    }

    #[test]
    fn test_top_level_number_needs_finish() {
        let mut tokenizer = JsonTokenizer::new();
        assert_eq!(tokenizer.feed(b"42").unwrap(), None);
        assert_eq!(tokenizer.finish().unwrap(), Some(json!(42)));
    }

    #[test]
    fn test_top_level_number_ended_by_whitespace() {
        let mut tokenizer = JsonTokenizer::new();
        assert_eq!(tokenizer.feed(b"7 ").unwrap(), Some(json!(7)));
        assert!(tokenizer.is_complete());
    }

    #[test]
    fn test_trailing_whitespace_accepted() {
        let mut tokenizer = JsonTokenizer::new();
        assert_eq!(tokenizer.feed(b"{}\r\n").unwrap(), Some(json!({})));
        assert_eq!(tokenizer.feed(b"  \n").unwrap(), None);
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        let result = feed_all(&[b"{} x"]);
        assert_eq!(result, Err(ParseError::TrailingData { offset: 3 }));
    }

    #[test]
    fn test_unexpected_byte() {
        assert_eq!(
            feed_all(&[b"{\"a\" 1}"]),
            Err(ParseError::UnexpectedByte { byte: b'1', offset: 5 })
        );
        assert!(matches!(
            feed_all(&[b"[1,]"]),
            Err(ParseError::UnexpectedByte { byte: b']', .. })
        ));
        assert!(matches!(
            feed_all(&[b"{\"a\":1]"]),
            Err(ParseError::UnexpectedByte { byte: b']', .. })
        ));
    }

    #[test]
    fn test_invalid_numbers() {
        assert!(matches!(feed_all(&[b"[-]"]), Err(ParseError::InvalidNumber { .. })));
        assert!(matches!(feed_all(&[b"[1.]"]), Err(ParseError::InvalidNumber { .. })));
        assert!(matches!(feed_all(&[b"[1e]"]), Err(ParseError::InvalidNumber { .. })));
        // A leading zero ends the number; the next digit is out of place
        assert!(matches!(
            feed_all(&[b"[01]"]),
            Err(ParseError::UnexpectedByte { byte: b'1', .. })
        ));
    }

    #[test]
    fn test_invalid_escape_and_control_character() {
        assert!(matches!(
            feed_all(&[br#"["\x"]"#]),
            Err(ParseError::InvalidEscape { .. })
        ));
        assert!(matches!(
            feed_all(&[br#"["\u12g4"]"#]),
            Err(ParseError::InvalidEscape { .. })
        ));
        assert!(matches!(
            feed_all(&[b"[\"a\nb\"]"]),
            Err(ParseError::ControlCharacter { offset: 3 })
        ));
    }

    #[test]
    fn test_lone_surrogate_rejected_on_decode() {
        assert!(matches!(
            feed_all(&[br#"["\ud800"]"#]),
            Err(ParseError::InvalidDocument(_))
        ));
    }

    #[test]
    fn test_invalid_utf8_rejected_on_decode() {
        assert!(matches!(
            feed_all(&[b"[\"\xff\"]"]),
            Err(ParseError::InvalidDocument(_))
        ));
    }

    #[test]
    fn test_nesting_limit() {
        let mut tokenizer = JsonTokenizer::with_limits(MAX_DOCUMENT_SIZE, 4);
        assert_eq!(tokenizer.feed(b"[[[[").unwrap(), None);
        assert_eq!(
            tokenizer.feed(b"["),
            Err(ParseError::NestingTooDeep { max: 4 })
        );
    }

    #[test]
    fn test_size_limit() {
        let mut tokenizer = JsonTokenizer::with_limits(8, MAX_NESTING_DEPTH);
        assert_eq!(tokenizer.feed(b"[1,2,").unwrap(), None);
        assert_eq!(
            tokenizer.feed(b"3,4,5]"),
            Err(ParseError::DocumentTooLarge { size: 11, max: 8 })
        );
        // The error reset the tokenizer
        assert_eq!(tokenizer.consumed(), 0);
        assert_eq!(tokenizer.feed(b"[]").unwrap(), Some(json!([])));
    }

    #[test]
    fn test_finish_on_truncated_document() {
        let mut tokenizer = JsonTokenizer::new();
        tokenizer.feed(b"{\"rows\":[").unwrap();
        assert_eq!(tokenizer.finish(), Err(ParseError::UnexpectedEof));
        assert_eq!(tokenizer.depth(), 0);
    }

    #[test]
    fn test_finish_without_input() {
        let mut tokenizer = JsonTokenizer::new();
        assert_eq!(tokenizer.finish(), Err(ParseError::UnexpectedEof));
    }

    #[test]
    fn test_finish_after_complete_is_noop() {
        let mut tokenizer = JsonTokenizer::new();
        tokenizer.feed(b"\"done\"").unwrap();
        assert_eq!(tokenizer.finish().unwrap(), None);
    }

    #[test]
    fn test_byte_at_a_time() {
        let doc = r#"{"total_rows":2,"rows":[{"id":"a","key":["x",1],"value":null},{"id":"b","key":"é","value":{"n":-0.5}}]}"#
            .as_bytes();
        let mut tokenizer = JsonTokenizer::new();
        let mut result = None;
        for (i, byte) in doc.iter().enumerate() {
            let status = tokenizer.feed(std::slice::from_ref(byte)).unwrap();
            if i + 1 < doc.len() {
                assert_eq!(status, None, "completed early at byte {}", i);
            } else {
                result = status;
            }
        }
        let expected: Value = serde_json::from_slice(doc).unwrap();
        assert_eq!(result, Some(expected));
    }
}
