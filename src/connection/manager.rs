//! Connection Manager
//!
//! The manager owns one connection to the cluster and the handle through
//! which operations are dispatched on it.
//!
//! ## Life Cycle
//!
//! ```text
//!            connect()                 ok
//!   Idle ──────────────> Connecting ─────────> Ready ──shutdown()──> Closed
//!    ▲                        │                                        ▲
//!    │                        │ error                                  │
//!    │                        ▼                                        │
//!    └───── connect() ─── Failed ─────────────── shutdown() ───────────┘
//! ```
//!
//! Overrides are applied in order on top of the defaults before the
//! transport connects. A shutdown during connect wins: the connect call
//! tears down what it built and fails with `ShutDown`. Shutting down stops the event loop (pending
//! operations fail with `StatusCode::Shutdown`) and destroys the transport
//! exactly once.

use crate::commands::dispatch::DispatchError;
use crate::connection::config::{ConfigOverride, ConnectParams, OverrideError, OverridePolicy, TransportConfig};
use crate::connection::event_loop::{EventLoopThread, LoopEvent};
use crate::connection::stats::ConnectionStats;
use crate::transport::{OpToken, StatusCode, Transport};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info};

/// Bounds of the timeout sweep interval.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);
const MAX_SWEEP_INTERVAL: Duration = Duration::from_millis(250);

/// Lifecycle state of a connection handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HandleState {
    Idle = 0,
    Connecting = 1,
    Ready = 2,
    Failed = 3,
    Closed = 4,
}

impl HandleState {
    fn from_u8(value: u8) -> HandleState {
        match value {
            0 => HandleState::Idle,
            1 => HandleState::Connecting,
            2 => HandleState::Ready,
            3 => HandleState::Failed,
            _ => HandleState::Closed,
        }
    }
}

impl fmt::Display for HandleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandleState::Idle => "idle",
            HandleState::Connecting => "connecting",
            HandleState::Ready => "ready",
            HandleState::Failed => "failed",
            HandleState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Errors returned by [`ConnectionManager::connect`].
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("no usable host in endpoint '{endpoint}'")]
    InvalidEndpoint { endpoint: String },

    #[error("no bucket given")]
    MissingBucket,

    #[error("rejected configuration override: {0}")]
    InvalidOverride(#[from] OverrideError),

    /// The transport refused to connect
    #[error("failed to connect to {connection_string}: {status}")]
    Transport {
        connection_string: String,
        status: StatusCode,
    },

    #[error("already connected")]
    AlreadyConnected,

    #[error("connection manager has been shut down")]
    ShutDown,

    #[error("failed to start the event loop: {0}")]
    EventLoop(#[from] std::io::Error),
}

impl ConnectError {
    /// Native status code, for transport failures.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ConnectError::Transport { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// A live connection: what dispatch needs.
pub(crate) struct Session {
    pub transport: Arc<dyn Transport>,
    pub config: TransportConfig,
    pub tx: mpsc::UnboundedSender<LoopEvent>,
}

struct Shared {
    state: AtomicU8,
    session: RwLock<Option<Arc<Session>>>,
    next_token: AtomicU64,
    stats: Arc<ConnectionStats>,
    params: RwLock<Option<ConnectParams>>,
    overrides: RwLock<Vec<ConfigOverride>>,
    rejected: RwLock<Vec<OverrideError>>,
    connection_string: RwLock<Option<String>>,
}

/// Handle to one cluster connection.
///
/// Cheap to clone and safe to share between threads. Operations can only
/// be dispatched while the handle is [`HandleState::Ready`].
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("state", &self.state())
            .field("connection_string", &self.connection_string())
            .finish()
    }
}

impl ConnectionHandle {
    fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: AtomicU8::new(HandleState::Idle as u8),
                session: RwLock::new(None),
                next_token: AtomicU64::new(1),
                stats: Arc::new(ConnectionStats::new()),
                params: RwLock::new(None),
                overrides: RwLock::new(Vec::new()),
                rejected: RwLock::new(Vec::new()),
                connection_string: RwLock::new(None),
            }),
        }
    }

    pub fn state(&self) -> HandleState {
        HandleState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn is_ready(&self) -> bool {
        self.state() == HandleState::Ready
    }

    /// Parameters of the last connect attempt.
    pub fn params(&self) -> Option<ConnectParams> {
        self.shared.params.read().unwrap().clone()
    }

    /// Overrides of the last connect attempt, in the order given.
    pub fn overrides(&self) -> Vec<ConfigOverride> {
        self.shared.overrides.read().unwrap().clone()
    }

    /// Overrides skipped during the last connect.
    pub fn rejected_overrides(&self) -> Vec<OverrideError> {
        self.shared.rejected.read().unwrap().clone()
    }

    pub fn connection_string(&self) -> Option<String> {
        self.shared.connection_string.read().unwrap().clone()
    }

    /// Effective transport settings while connected.
    pub fn config(&self) -> Option<TransportConfig> {
        self.shared
            .session
            .read()
            .unwrap()
            .as_ref()
            .map(|session| session.config.clone())
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.shared.stats
    }

    /// The live session, if operations may be dispatched.
    pub(crate) fn ready_session(&self) -> Result<Arc<Session>, DispatchError> {
        let state = self.state();
        if state != HandleState::Ready {
            return Err(DispatchError::NotConnected { state });
        }
        self.shared
            .session
            .read()
            .unwrap()
            .clone()
            .ok_or(DispatchError::NotConnected {
                state: HandleState::Closed,
            })
    }

    /// Swaps in a session with edited settings.
    #[cfg(test)]
    pub(crate) fn update_config(&self, edit: impl FnOnce(&mut TransportConfig)) {
        let mut session = self.shared.session.write().unwrap();
        if let Some(current) = session.as_ref() {
            let mut config = current.config.clone();
            edit(&mut config);
            *session = Some(Arc::new(Session {
                transport: Arc::clone(&current.transport),
                config,
                tx: current.tx.clone(),
            }));
        }
    }

    pub(crate) fn next_token(&self) -> OpToken {
        OpToken::new(self.shared.next_token.fetch_add(1, Ordering::Relaxed))
    }
}

/// Owns the transport and the connection built on it.
///
/// # Example
///
/// ```
/// use couchlink::connection::{ConnectParams, ConnectionManager};
/// use couchlink::transport::MemoryCluster;
/// use std::sync::Arc;
///
/// let cluster = Arc::new(MemoryCluster::new("radius"));
/// let manager = ConnectionManager::new(cluster);
/// let handle = manager
///     .connect(ConnectParams::new("localhost", "radius"), &[("op_timeout", "5000000").into()])
///     .unwrap();
/// assert!(handle.is_ready());
/// manager.shutdown();
/// ```
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    policy: OverridePolicy,
    handle: ConnectionHandle,
    event_loop: Mutex<Option<EventLoopThread>>,
    destroyed: AtomicBool,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("policy", &self.policy)
            .field("handle", &self.handle)
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            policy: OverridePolicy::default(),
            handle: ConnectionHandle::new(),
            event_loop: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn with_policy(mut self, policy: OverridePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The handle of this manager's connection, in whatever state it is.
    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    /// Connects to the cluster.
    ///
    /// `params.timeout` is applied first, then `overrides` in order.
    pub fn connect(
        &self,
        params: ConnectParams,
        overrides: &[ConfigOverride],
    ) -> Result<ConnectionHandle, ConnectError> {
        self.begin_connect()?;
        let result = self.establish(params, overrides);
        self.finish_connect(result)
    }

    /// Leaves Connecting. A shutdown that ran while connecting wins.
    fn finish_connect(&self, result: Result<(), ConnectError>) -> Result<ConnectionHandle, ConnectError> {
        match result {
            Ok(()) => {
                if !self.leave_connecting(HandleState::Ready) {
                    self.handle.shared.session.write().unwrap().take();
                    let event_loop = self.event_loop.lock().unwrap().take();
                    if let Some(mut event_loop) = event_loop {
                        event_loop.shutdown();
                    }
                    info!("shut down while connecting");
                    return Err(ConnectError::ShutDown);
                }
                info!(
                    connection_string = ?self.handle.connection_string(),
                    rejected_overrides = self.handle.rejected_overrides().len(),
                    "connected"
                );
                Ok(self.handle.clone())
            }
            Err(e) => {
                // Without its transport the manager cannot connect again
                let next = if self.destroyed.load(Ordering::Acquire) {
                    HandleState::Closed
                } else {
                    HandleState::Failed
                };
                self.leave_connecting(next);
                error!(error = %e, "connect failed");
                Err(e)
            }
        }
    }

    fn leave_connecting(&self, next: HandleState) -> bool {
        self.handle
            .shared
            .state
            .compare_exchange(
                HandleState::Connecting as u8,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Moves Idle/Failed to Connecting.
    fn begin_connect(&self) -> Result<(), ConnectError> {
        let mut current = self.handle.shared.state.load(Ordering::Acquire);
        loop {
            match HandleState::from_u8(current) {
                HandleState::Idle | HandleState::Failed => {}
                HandleState::Connecting | HandleState::Ready => return Err(ConnectError::AlreadyConnected),
                HandleState::Closed => return Err(ConnectError::ShutDown),
            }
            match self.handle.shared.state.compare_exchange(
                current,
                HandleState::Connecting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    fn establish(&self, params: ConnectParams, overrides: &[ConfigOverride]) -> Result<(), ConnectError> {
        let shared = &self.handle.shared;
        *shared.params.write().unwrap() = Some(params.clone());
        *shared.overrides.write().unwrap() = overrides.to_vec();
        shared.rejected.write().unwrap().clear();

        if params.bucket.trim().is_empty() {
            return Err(ConnectError::MissingBucket);
        }
        let connection_string = params
            .connection_string()
            .ok_or_else(|| ConnectError::InvalidEndpoint {
                endpoint: params.endpoint.clone(),
            })?;
        *shared.connection_string.write().unwrap() = Some(connection_string.clone());

        let mut config = TransportConfig::default();
        config.set_timeout_micros(params.timeout);
        let rejected = config.apply_all(overrides, self.policy)?;
        *shared.rejected.write().unwrap() = rejected;

        self.transport
            .connect(&params, &config)
            .map_err(|status| ConnectError::Transport {
                connection_string: connection_string.clone(),
                status,
            })?;

        let sweep_every = (config.min_timeout() / 4).clamp(MIN_SWEEP_INTERVAL, MAX_SWEEP_INTERVAL);
        let event_loop = match EventLoopThread::spawn(Arc::clone(&shared.stats), sweep_every) {
            Ok(event_loop) => event_loop,
            Err(e) => {
                self.destroy_transport();
                return Err(e.into());
            }
        };

        *shared.session.write().unwrap() = Some(Arc::new(Session {
            transport: Arc::clone(&self.transport),
            config,
            tx: event_loop.sender(),
        }));
        *self.event_loop.lock().unwrap() = Some(event_loop);
        Ok(())
    }

    /// Closes the connection. Idempotent.
    pub fn shutdown(&self) {
        let previous = HandleState::from_u8(
            self.handle
                .shared
                .state
                .swap(HandleState::Closed as u8, Ordering::AcqRel),
        );

        self.handle.shared.session.write().unwrap().take();
        let event_loop = self.event_loop.lock().unwrap().take();
        if let Some(mut event_loop) = event_loop {
            event_loop.shutdown();
        }

        if self.destroy_transport() {
            info!(previous = %previous, "connection closed");
        }
    }

    /// Destroys the transport unless already done. True if this call did it.
    fn destroy_transport(&self) -> bool {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.transport.destroy();
        true
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{CompletionSink, MemoryCluster, Request};
    use std::thread;

    fn manager() -> (Arc<MemoryCluster>, ConnectionManager) {
        let cluster = Arc::new(MemoryCluster::new("radius"));
        let manager = ConnectionManager::new(cluster.clone());
        (cluster, manager)
    }

    fn params() -> ConnectParams {
        ConnectParams::new("couchbase://10.0.0.1,10.0.0.2", "radius")
    }

    #[test]
    fn test_handle_exists_before_connect() {
        let (_cluster, manager) = manager();
        let handle = manager.handle();
        assert_eq!(handle.state(), HandleState::Idle);
        assert!(handle.config().is_none());
        assert!(matches!(
            handle.ready_session(),
            Err(DispatchError::NotConnected {
                state: HandleState::Idle
            })
        ));
    }

    #[test]
    fn test_connect_applies_timeout_then_overrides() {
        let (cluster, manager) = manager();
        let overrides: Vec<ConfigOverride> = vec![("views_timeout", "2.0").into()];

        let handle = manager
            .connect(params().with_timeout(1_000_000), &overrides)
            .unwrap();
        assert_eq!(handle.state(), HandleState::Ready);
        assert_eq!(
            handle.connection_string().as_deref(),
            Some("couchbase://10.0.0.1,10.0.0.2/radius")
        );

        let config = handle.config().unwrap();
        assert_eq!(config.operation_timeout, Duration::from_secs(1));
        assert_eq!(config.views_timeout, Duration::from_secs(2));
        assert_eq!(cluster.last_config(), Some(config));
        assert_eq!(handle.overrides(), overrides);
    }

    #[test]
    fn test_unknown_override_is_reported_not_fatal() {
        let (_cluster, manager) = manager();
        let overrides: Vec<ConfigOverride> =
            vec![("op_timeout", "5000000").into(), ("unknown_opt", "x").into()];

        let handle = manager.connect(params(), &overrides).unwrap();
        assert!(handle.is_ready());
        assert_eq!(handle.config().unwrap().operation_timeout, Duration::from_secs(5));
        assert_eq!(
            handle.rejected_overrides(),
            vec![OverrideError::UnknownKey {
                key: "unknown_opt".into()
            }]
        );
    }

    #[test]
    fn test_strict_policy_aborts() {
        let cluster = Arc::new(MemoryCluster::new("radius"));
        let manager = ConnectionManager::new(cluster.clone()).with_policy(OverridePolicy::Strict);

        let err = manager
            .connect(params(), &[("unknown_opt", "x").into()])
            .unwrap_err();
        assert!(matches!(err, ConnectError::InvalidOverride(_)));
        assert_eq!(manager.handle().state(), HandleState::Failed);
        assert!(!cluster.is_connected());
    }

    #[test]
    fn test_transport_error_then_retry() {
        let (cluster, manager) = manager();
        cluster.set_reachable(false);

        let err = manager.connect(params(), &[]).unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::ConnectError));
        assert!(err.to_string().contains("couchbase://10.0.0.1,10.0.0.2/radius"));
        assert_eq!(manager.handle().state(), HandleState::Failed);

        cluster.set_reachable(true);
        assert!(manager.connect(params(), &[]).unwrap().is_ready());
    }

    #[test]
    fn test_invalid_params() {
        let (_cluster, manager) = manager();
        assert!(matches!(
            manager.connect(ConnectParams::new("", "radius"), &[]),
            Err(ConnectError::InvalidEndpoint { .. })
        ));
        assert!(matches!(
            manager.connect(ConnectParams::new("localhost", " "), &[]),
            Err(ConnectError::MissingBucket)
        ));
        assert!(matches!(
            manager.connect(ConnectParams::new("localhost", "other"), &[]),
            Err(ConnectError::Transport {
                status: StatusCode::BucketNotFound,
                ..
            })
        ));
    }

    #[test]
    fn test_connect_twice() {
        let (_cluster, manager) = manager();
        manager.connect(params(), &[]).unwrap();
        assert!(matches!(
            manager.connect(params(), &[]),
            Err(ConnectError::AlreadyConnected)
        ));
    }

    #[test]
    fn test_shutdown_destroys_once() {
        let (cluster, manager) = manager();
        let handle = manager.connect(params(), &[]).unwrap();

        manager.shutdown();
        manager.shutdown();
        assert_eq!(handle.state(), HandleState::Closed);
        assert_eq!(cluster.destroy_count(), 1);
        assert!(matches!(
            manager.connect(params(), &[]),
            Err(ConnectError::ShutDown)
        ));

        drop(manager);
        assert_eq!(cluster.destroy_count(), 1);
    }

    #[test]
    fn test_drop_shuts_down() {
        let (cluster, manager) = manager();
        let handle = manager.connect(params(), &[]).unwrap();
        drop(manager);
        assert_eq!(handle.state(), HandleState::Closed);
        assert_eq!(cluster.destroy_count(), 1);
    }

    /// Takes its time connecting.
    struct SlowTransport {
        inner: Arc<MemoryCluster>,
        delay: Duration,
    }

    impl Transport for SlowTransport {
        fn connect(&self, params: &ConnectParams, config: &TransportConfig) -> Result<(), StatusCode> {
            thread::sleep(self.delay);
            self.inner.connect(params, config)
        }

        fn submit(&self, request: Request, sink: CompletionSink) -> Result<(), StatusCode> {
            self.inner.submit(request, sink)
        }

        fn destroy(&self) {
            self.inner.destroy()
        }
    }

    #[test]
    fn test_shutdown_during_connect_wins() {
        let cluster = Arc::new(MemoryCluster::new("radius"));
        let manager = Arc::new(ConnectionManager::new(Arc::new(SlowTransport {
            inner: cluster.clone(),
            delay: Duration::from_millis(200),
        })));
        let handle = manager.handle();

        let connecting = {
            let manager = Arc::clone(&manager);
            thread::spawn(move || manager.connect(params(), &[]))
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(handle.state(), HandleState::Connecting);
        manager.shutdown();

        let result = connecting.join().unwrap();
        assert!(matches!(result, Err(ConnectError::ShutDown)));
        assert_eq!(handle.state(), HandleState::Closed);
        assert!(handle.config().is_none());
        assert!(manager.event_loop.lock().unwrap().is_none());
        assert!(matches!(
            handle.get("acct:1"),
            Err(DispatchError::NotConnected {
                state: HandleState::Closed
            })
        ));

        drop(manager);
        assert_eq!(cluster.destroy_count(), 1);
    }

    #[test]
    fn test_event_loop_failure_destroys_transport() {
        let (cluster, manager) = manager();
        manager.begin_connect().unwrap();
        manager.transport.connect(&params(), &TransportConfig::default()).unwrap();
        assert!(manager.destroy_transport());

        let err = manager
            .finish_connect(Err(ConnectError::EventLoop(std::io::Error::other("no threads"))))
            .unwrap_err();
        assert!(matches!(err, ConnectError::EventLoop(_)));
        assert_eq!(manager.handle().state(), HandleState::Closed);
        assert!(!cluster.is_connected());
        assert_eq!(cluster.destroy_count(), 1);

        manager.shutdown();
        assert_eq!(cluster.destroy_count(), 1);
        assert!(matches!(
            manager.connect(params(), &[]),
            Err(ConnectError::ShutDown)
        ));
    }
}
