//! Connection Parameters and Transport Configuration
//!
//! A connection is described by [`ConnectParams`] (where and as whom) and
//! tuned by an ordered list of [`ConfigOverride`]s (how). Overrides are
//! applied in order on top of [`TransportConfig::default`], so a later
//! override for the same key wins.
//!
//! ## Override Values
//!
//! ```text
//!  timeout   "2500000"  -> 2.5 s   (integer: microseconds)
//!            "2.5"      -> 2.5 s   (with a '.': seconds)
//!  bool      true/false, 1/0, on/off, yes/no
//!  size      decimal integer
//! ```

use crate::cookie::MAX_DOCUMENT_SIZE;
use crate::transport::OpKind;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Where to connect and as whom.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectParams {
    /// One or more hosts, separated by commas or whitespace
    pub endpoint: String,
    pub bucket: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Operation timeout in microseconds; 0 keeps the default
    pub timeout: u32,
}

impl ConnectParams {
    pub fn new(endpoint: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            bucket: bucket.into(),
            username: None,
            password: None,
            timeout: 0,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_timeout(mut self, timeout_us: u32) -> Self {
        self.timeout = timeout_us;
        self
    }

    /// Host list with any scheme and path removed.
    pub fn hosts(&self) -> Vec<String> {
        self.endpoint
            .split(|c: char| c == ',' || c.is_whitespace())
            .map(|host| {
                let host = ["couchbase://", "couchbases://", "http://", "https://"]
                    .iter()
                    .find_map(|scheme| host.strip_prefix(scheme))
                    .unwrap_or(host);
                host.split('/').next().unwrap_or_default()
            })
            .filter(|host| !host.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// `couchbase://host1,host2/bucket`, or `None` if no host is given.
    ///
    /// # Example
    ///
    /// ```
    /// use couchlink::connection::ConnectParams;
    ///
    /// let params = ConnectParams::new("http://10.0.0.1:8091/pools 10.0.0.2", "radius");
    /// assert_eq!(
    ///     params.connection_string().as_deref(),
    ///     Some("couchbase://10.0.0.1:8091,10.0.0.2/radius")
    /// );
    /// ```
    pub fn connection_string(&self) -> Option<String> {
        let hosts = self.hosts();
        if hosts.is_empty() {
            return None;
        }
        Some(format!("couchbase://{}/{}", hosts.join(","), self.bucket))
    }
}

impl fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectParams")
            .field("endpoint", &self.endpoint)
            .field("bucket", &self.bucket)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// One `(key, value)` transport setting.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConfigOverride {
    key: String,
    value: String,
}

impl ConfigOverride {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

impl<K: Into<String>, V: Into<String>> From<(K, V)> for ConfigOverride {
    fn from((key, value): (K, V)) -> Self {
        Self::new(key, value)
    }
}

impl FromStr for ConfigOverride {
    type Err = OverrideError;

    /// Parses `key=value`.
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => Ok(Self::new(key.trim(), value.trim())),
            _ => Err(OverrideError::Malformed {
                input: input.to_string(),
            }),
        }
    }
}

impl fmt::Display for ConfigOverride {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// Why an override was not applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OverrideError {
    #[error("unknown configuration option '{key}'")]
    UnknownKey { key: String },

    #[error("invalid value '{value}' for option '{key}': {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("malformed override '{input}', expected key=value")]
    Malformed { input: String },
}

impl OverrideError {
    /// The option the error refers to.
    pub fn key(&self) -> Option<&str> {
        match self {
            OverrideError::UnknownKey { key } | OverrideError::InvalidValue { key, .. } => Some(key),
            OverrideError::Malformed { .. } => None,
        }
    }
}

/// What connect does with an override it cannot apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverridePolicy {
    /// Log it, record it on the handle and keep going
    #[default]
    Lenient,
    /// Abort the connect
    Strict,
}

/// Effective transport settings.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportConfig {
    pub operation_timeout: Duration,
    pub views_timeout: Duration,
    pub http_timeout: Duration,
    pub config_total_timeout: Duration,
    pub durability_timeout: Duration,
    pub randomize_nodes: bool,
    pub detailed_errcodes: bool,
    pub tcp_nodelay: bool,
    pub http_poolsize: usize,
    /// Largest view response assembled per operation
    pub max_view_response_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_micros(2_500_000),
            views_timeout: Duration::from_secs(75),
            http_timeout: Duration::from_secs(75),
            config_total_timeout: Duration::from_secs(5),
            durability_timeout: Duration::from_secs(5),
            randomize_nodes: false,
            detailed_errcodes: false,
            tcp_nodelay: true,
            http_poolsize: 1,
            max_view_response_size: MAX_DOCUMENT_SIZE,
        }
    }
}

impl TransportConfig {
    /// Sets the operation timeout from a microsecond count; 0 is ignored.
    pub fn set_timeout_micros(&mut self, timeout_us: u32) {
        if timeout_us > 0 {
            self.operation_timeout = Duration::from_micros(u64::from(timeout_us));
        }
    }

    /// Applies one override.
    pub fn apply(&mut self, item: &ConfigOverride) -> Result<(), OverrideError> {
        let (key, value) = (item.key(), item.value());
        match key {
            "operation_timeout" | "op_timeout" => self.operation_timeout = parse_timeout(key, value)?,
            "views_timeout" | "view_timeout" => self.views_timeout = parse_timeout(key, value)?,
            "http_timeout" => self.http_timeout = parse_timeout(key, value)?,
            "config_total_timeout" | "bootstrap_timeout" => {
                self.config_total_timeout = parse_timeout(key, value)?
            }
            "durability_timeout" => self.durability_timeout = parse_timeout(key, value)?,
            "randomize_nodes" => self.randomize_nodes = parse_bool(key, value)?,
            "detailed_errcodes" => self.detailed_errcodes = parse_bool(key, value)?,
            "tcp_nodelay" => self.tcp_nodelay = parse_bool(key, value)?,
            "http_poolsize" => self.http_poolsize = parse_size(key, value, 0)?,
            "max_view_response_size" => self.max_view_response_size = parse_size(key, value, 1)?,
            _ => {
                return Err(OverrideError::UnknownKey {
                    key: key.to_string(),
                })
            }
        }
        Ok(())
    }

    /// Applies overrides in order.
    ///
    /// # Returns
    ///
    /// Under [`OverridePolicy::Lenient`], the overrides that were skipped.
    /// Under [`OverridePolicy::Strict`], the first failure as an error.
    pub fn apply_all(
        &mut self,
        overrides: &[ConfigOverride],
        policy: OverridePolicy,
    ) -> Result<Vec<OverrideError>, OverrideError> {
        let mut rejected = Vec::new();

        for item in overrides {
            match self.apply(item) {
                Ok(()) => debug!(key = %item.key(), value = %item.value(), "override applied"),
                Err(e) if policy == OverridePolicy::Strict => return Err(e),
                Err(e) => {
                    warn!(key = %item.key(), value = %item.value(), error = %e, "override rejected");
                    rejected.push(e);
                }
            }
        }

        Ok(rejected)
    }

    /// Deadline of one operation of the given kind.
    pub fn timeout_for(&self, kind: OpKind) -> Duration {
        match kind {
            OpKind::View => self.views_timeout,
            _ => self.operation_timeout,
        }
    }

    /// Smallest per-operation deadline.
    pub fn min_timeout(&self) -> Duration {
        self.operation_timeout.min(self.views_timeout)
    }
}

fn invalid(key: &str, value: &str, reason: &str) -> OverrideError {
    OverrideError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// Longest timeout an override may set
pub const MAX_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

fn parse_timeout(key: &str, value: &str) -> Result<Duration, OverrideError> {
    let timeout = if value.contains('.') {
        let secs: f64 = value
            .parse()
            .map_err(|_| invalid(key, value, "expected seconds"))?;
        Duration::try_from_secs_f64(secs).map_err(|_| invalid(key, value, "out of range"))?
    } else {
        let micros: u64 = value
            .parse()
            .map_err(|_| invalid(key, value, "expected microseconds"))?;
        Duration::from_micros(micros)
    };

    if timeout.is_zero() {
        return Err(invalid(key, value, "timeout must be positive"));
    }
    if timeout > MAX_TIMEOUT {
        return Err(invalid(key, value, "out of range"));
    }
    Ok(timeout)
}

fn parse_bool(key: &str, value: &str) -> Result<bool, OverrideError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "on" | "yes" => Ok(true),
        "false" | "0" | "off" | "no" => Ok(false),
        _ => Err(invalid(key, value, "expected a boolean")),
    }
}

fn parse_size(key: &str, value: &str, min: usize) -> Result<usize, OverrideError> {
    match value.parse::<usize>() {
        Ok(size) if size >= min => Ok(size),
        Ok(_) => Err(invalid(key, value, "too small")),
        Err(_) => Err(invalid(key, value, "expected an integer")),
    }
}
