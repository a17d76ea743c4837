//! Transport Status Codes
//!
//! Every completion carries a native status code. Callers rarely care about
//! the exact code; they care whether the operation succeeded, whether the
//! document was missing, and whether retrying could help. [`Category`]
//! answers that.

use std::fmt;

/// Coarse classification of a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Success,
    /// The key does not exist
    NotFound,
    /// Retrying the same operation may succeed
    Transient,
    /// Retrying will not help without outside intervention
    Terminal,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Category::Success => "success",
            Category::NotFound => "not-found",
            Category::Transient => "transient-error",
            Category::Terminal => "terminal-error",
        };
        f.write_str(name)
    }
}

/// Native status code reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Success,
    AuthError,
    ValueTooLarge,
    Busy,
    Internal,
    InvalidArgument,
    ServerOutOfMemory,
    GenericError,
    TemporaryFailure,
    KeyExists,
    KeyNotFound,
    NetworkError,
    NotMyVbucket,
    NotStored,
    NotSupported,
    UnknownHost,
    ProtocolError,
    Timeout,
    ConnectError,
    BucketNotFound,
    ClientOutOfMemory,
    ClientTemporaryFailure,
    BadHandle,
    ServerBug,
    InvalidHostFormat,
    NoMatchingServer,
    HttpError,
    Shutdown,
}

const ALL: [StatusCode; 28] = [
    StatusCode::Success,
    StatusCode::AuthError,
    StatusCode::ValueTooLarge,
    StatusCode::Busy,
    StatusCode::Internal,
    StatusCode::InvalidArgument,
    StatusCode::ServerOutOfMemory,
    StatusCode::GenericError,
    StatusCode::TemporaryFailure,
    StatusCode::KeyExists,
    StatusCode::KeyNotFound,
    StatusCode::NetworkError,
    StatusCode::NotMyVbucket,
    StatusCode::NotStored,
    StatusCode::NotSupported,
    StatusCode::UnknownHost,
    StatusCode::ProtocolError,
    StatusCode::Timeout,
    StatusCode::ConnectError,
    StatusCode::BucketNotFound,
    StatusCode::ClientOutOfMemory,
    StatusCode::ClientTemporaryFailure,
    StatusCode::BadHandle,
    StatusCode::ServerBug,
    StatusCode::InvalidHostFormat,
    StatusCode::NoMatchingServer,
    StatusCode::HttpError,
    StatusCode::Shutdown,
];

impl StatusCode {
    /// Stable numeric value of the code.
    pub const fn code(self) -> u16 {
        match self {
            StatusCode::Success => 0x00,
            StatusCode::AuthError => 0x02,
            StatusCode::ValueTooLarge => 0x04,
            StatusCode::Busy => 0x05,
            StatusCode::Internal => 0x06,
            StatusCode::InvalidArgument => 0x07,
            StatusCode::ServerOutOfMemory => 0x08,
            StatusCode::GenericError => 0x0A,
            StatusCode::TemporaryFailure => 0x0B,
            StatusCode::KeyExists => 0x0C,
            StatusCode::KeyNotFound => 0x0D,
            StatusCode::NetworkError => 0x10,
            StatusCode::NotMyVbucket => 0x11,
            StatusCode::NotStored => 0x12,
            StatusCode::NotSupported => 0x13,
            StatusCode::UnknownHost => 0x15,
            StatusCode::ProtocolError => 0x16,
            StatusCode::Timeout => 0x17,
            StatusCode::ConnectError => 0x18,
            StatusCode::BucketNotFound => 0x19,
            StatusCode::ClientOutOfMemory => 0x1A,
            StatusCode::ClientTemporaryFailure => 0x1B,
            StatusCode::BadHandle => 0x1C,
            StatusCode::ServerBug => 0x1D,
            StatusCode::InvalidHostFormat => 0x1F,
            StatusCode::NoMatchingServer => 0x23,
            StatusCode::HttpError => 0x2D,
            StatusCode::Shutdown => 0x40,
        }
    }

    /// Looks a status up by its numeric value.
    pub fn from_code(code: u16) -> Option<StatusCode> {
        ALL.iter().copied().find(|status| status.code() == code)
    }

    pub const fn category(self) -> Category {
        match self {
            StatusCode::Success => Category::Success,
            StatusCode::KeyNotFound => Category::NotFound,
            StatusCode::Busy
            | StatusCode::ServerOutOfMemory
            | StatusCode::TemporaryFailure
            | StatusCode::NetworkError
            | StatusCode::NotMyVbucket
            | StatusCode::ConnectError
            | StatusCode::ClientOutOfMemory
            | StatusCode::ClientTemporaryFailure
            | StatusCode::NoMatchingServer => Category::Transient,
            _ => Category::Terminal,
        }
    }

    #[inline]
    pub const fn is_success(self) -> bool {
        matches!(self, StatusCode::Success)
    }

    /// Human readable description.
    pub const fn description(self) -> &'static str {
        match self {
            StatusCode::Success => "success",
            StatusCode::AuthError => "authentication failed",
            StatusCode::ValueTooLarge => "value too large",
            StatusCode::Busy => "server busy",
            StatusCode::Internal => "internal error",
            StatusCode::InvalidArgument => "invalid argument",
            StatusCode::ServerOutOfMemory => "server out of memory",
            StatusCode::GenericError => "generic error",
            StatusCode::TemporaryFailure => "temporary failure",
            StatusCode::KeyExists => "key already exists",
            StatusCode::KeyNotFound => "key not found",
            StatusCode::NetworkError => "network error",
            StatusCode::NotMyVbucket => "vbucket moved to another server",
            StatusCode::NotStored => "item not stored",
            StatusCode::NotSupported => "operation not supported",
            StatusCode::UnknownHost => "unknown host",
            StatusCode::ProtocolError => "protocol error",
            StatusCode::Timeout => "operation timed out",
            StatusCode::ConnectError => "connection failure",
            StatusCode::BucketNotFound => "bucket not found",
            StatusCode::ClientOutOfMemory => "client out of memory",
            StatusCode::ClientTemporaryFailure => "client temporary failure",
            StatusCode::BadHandle => "invalid handle",
            StatusCode::ServerBug => "server bug",
            StatusCode::InvalidHostFormat => "invalid host format",
            StatusCode::NoMatchingServer => "no matching server",
            StatusCode::HttpError => "HTTP error",
            StatusCode::Shutdown => "connection shut down",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02x}, {})", self.description(), self.code(), self.category())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_codes_are_unique_and_round_trip() {
        let mut seen = HashSet::new();
        for status in ALL {
            assert!(seen.insert(status.code()), "duplicate code for {:?}", status);
            assert_eq!(StatusCode::from_code(status.code()), Some(status));
        }
        assert_eq!(StatusCode::from_code(0xFFFF), None);
    }

    #[test]
    fn test_categories() {
        assert_eq!(StatusCode::Success.category(), Category::Success);
        assert_eq!(StatusCode::KeyNotFound.category(), Category::NotFound);
        assert_eq!(StatusCode::TemporaryFailure.category(), Category::Transient);
        assert_eq!(StatusCode::Timeout.category(), Category::Terminal);
        assert_eq!(StatusCode::AuthError.category(), Category::Terminal);
        assert_eq!(StatusCode::Shutdown.category(), Category::Terminal);
    }

    #[test]
    fn test_display() {
        assert_eq!(
            StatusCode::KeyNotFound.to_string(),
            "key not found (0x0d, not-found)"
        );
    }
}
