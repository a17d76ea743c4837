//! Operation Cookies and Streaming JSON Assembly
//!
//! Every operation dispatched against the cluster is bound to a [`Cookie`].
//! The cookie is the context that travels with the request and is handed to
//! the completion handler when the transport reports back.
//!
//! ## Modules
//!
//! - `tokenizer`: resumable, validating JSON scanner
//! - `context`: the cookie and its parse status
//!
//! ## Example
//!
//! ```
//! use couchlink::cookie::{Cookie, ParseStatus};
//!
//! let mut cookie = Cookie::new();
//!
//! // A view response split across two transport chunks
//! assert_eq!(cookie.feed(b"{\"total_rows\":0,"), ParseStatus::Incomplete);
//! assert!(matches!(cookie.feed(b"\"rows\":[]}"), ParseStatus::Complete(_)));
//! ```

pub mod context;
pub mod tokenizer;

// Re-export commonly used types for convenience
pub use context::{Cookie, ParseState, ParseStatus};
pub use tokenizer::{JsonTokenizer, ParseError, ParseResult, MAX_DOCUMENT_SIZE, MAX_NESTING_DEPTH};
