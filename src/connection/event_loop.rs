//! Completion Event Loop
//!
//! Every connection runs one event-loop thread. It owns the table of pending
//! operations and is the only place completion handlers run, so the table
//! and the cookies in it are never shared between threads.
//!
//! ```text
//!  dispatchers ──Register/Abandon──┐
//!                                  ├──> mpsc ──> EventLoop ──> handler(op, completion)
//!  transport ────Completion────────┘      │                        │
//!  manager ──────Shutdown──────────────────┘                        └──> oneshot ──> caller
//! ```
//!
//! A periodic sweep completes operations whose deadline has passed with
//! `StatusCode::Timeout`. On shutdown every still-pending operation
//! completes with `StatusCode::Shutdown`.

use crate::commands::callbacks::{self, Step};
use crate::commands::result::{Completed, OperationError, OperationValue};
use crate::connection::stats::ConnectionStats;
use crate::cookie::Cookie;
use crate::transport::{Completion, OpKind, OpToken, StatusCode};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, trace, warn};

/// Name of the event-loop thread.
pub const THREAD_NAME: &str = "couchlink-event-loop";

/// Messages processed by the event loop, in arrival order.
#[derive(Debug)]
pub(crate) enum LoopEvent {
    /// Start tracking an operation. Always sent before the request is submitted.
    Register { token: OpToken, op: PendingOp },
    /// Forget an operation the transport refused; no handler runs.
    Abandon(OpToken),
    Completion(Completion),
    Shutdown,
}

/// An operation between dispatch and its terminal completion.
#[derive(Debug)]
pub(crate) struct PendingOp {
    pub kind: OpKind,
    /// Document key, for key/value operations
    pub key: Option<String>,
    pub cookie: Cookie,
    /// None never expires
    pub deadline: Option<Instant>,
    /// Last HTTP status seen (views)
    pub http_status: u16,
    /// Chunks received so far (views)
    pub chunks: u64,
    /// Response bytes received so far (views)
    pub bytes: usize,
    reply: oneshot::Sender<Completed>,
}

impl PendingOp {
    pub fn new(
        kind: OpKind,
        key: Option<String>,
        cookie: Cookie,
        deadline: Option<Instant>,
        reply: oneshot::Sender<Completed>,
    ) -> Self {
        Self {
            kind,
            key,
            cookie,
            deadline,
            http_status: 0,
            chunks: 0,
            bytes: 0,
            reply,
        }
    }

    /// Hands the result and the cookie back to the caller.
    fn resolve(self, result: Result<OperationValue, OperationError>) {
        // The caller may have dropped its future
        let _ = self.reply.send(Completed {
            result,
            cookie: self.cookie,
        });
    }
}

/// The loop state. Lives on the event-loop thread only.
struct EventLoop {
    pending: HashMap<OpToken, PendingOp>,
    stats: Arc<ConnectionStats>,
}

impl EventLoop {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<LoopEvent>, sweep_every: Duration) {
        let mut sweep = tokio::time::interval(sweep_every);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(LoopEvent::Shutdown) | None => break,
                    Some(event) => self.handle_event(event),
                },
                _ = sweep.tick() => self.expire(Instant::now()),
            }
        }

        self.fail_all(StatusCode::Shutdown);
        debug!("event loop stopped");
    }

    fn handle_event(&mut self, event: LoopEvent) {
        match event {
            LoopEvent::Register { token, op } => {
                trace!(%token, kind = %op.kind, "operation registered");
                if self.pending.insert(token, op).is_some() {
                    error!(%token, "operation token reused");
                }
            }
            LoopEvent::Abandon(token) => {
                self.pending.remove(&token);
                debug!(%token, "operation abandoned");
            }
            LoopEvent::Completion(completion) => self.complete(completion),
            LoopEvent::Shutdown => {}
        }
    }

    fn complete(&mut self, completion: Completion) {
        let token = completion.token;
        let Some(op) = self.pending.get_mut(&token) else {
            self.stats.late_completion();
            warn!(%token, status = %completion.status, "completion for unknown operation ignored");
            return;
        };

        match callbacks::on_completion(op, completion.status, completion.body, &self.stats) {
            Step::Pending => {}
            Step::Done(result) => {
                if let Some(op) = self.pending.remove(&token) {
                    self.stats.op_finished(result.is_ok());
                    match &result {
                        Ok(_) => debug!(%token, kind = %op.kind, "operation completed"),
                        Err(e) => debug!(%token, kind = %op.kind, error = %e, "operation failed"),
                    }
                    op.resolve(result);
                }
            }
        }
    }

    /// Times out every operation whose deadline is at or before `now`.
    fn expire(&mut self, now: Instant) {
        let overdue: Vec<OpToken> = self
            .pending
            .iter()
            .filter(|(_, op)| op.deadline.is_some_and(|deadline| deadline <= now))
            .map(|(token, _)| *token)
            .collect();

        for token in overdue {
            if let Some(mut op) = self.pending.remove(&token) {
                op.cookie.discard();
                self.stats.op_timed_out();
                warn!(%token, kind = %op.kind, key = ?op.key, "operation timed out");
                op.resolve(Err(OperationError::Transport {
                    status: StatusCode::Timeout,
                }));
            }
        }
    }

    fn fail_all(&mut self, status: StatusCode) {
        if !self.pending.is_empty() {
            warn!(pending = self.pending.len(), %status, "failing pending operations");
        }
        for (_, mut op) in self.pending.drain() {
            op.cookie.discard();
            self.stats.op_finished(false);
            op.resolve(Err(OperationError::Transport { status }));
        }
    }
}

/// The event-loop thread of one connection.
#[derive(Debug)]
pub(crate) struct EventLoopThread {
    tx: mpsc::UnboundedSender<LoopEvent>,
    join: Option<JoinHandle<()>>,
}

impl EventLoopThread {
    /// Starts the thread. `sweep_every` is the timeout check interval.
    pub fn spawn(stats: Arc<ConnectionStats>, sweep_every: Duration) -> io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        let (tx, rx) = mpsc::unbounded_channel();

        let event_loop = EventLoop {
            pending: HashMap::new(),
            stats,
        };
        let join = std::thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || runtime.block_on(event_loop.run(rx, sweep_every)))?;

        debug!(sweep_ms = sweep_every.as_millis() as u64, "event loop started");
        Ok(Self {
            tx,
            join: Some(join),
        })
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<LoopEvent> {
        self.tx.clone()
    }

    /// Stops the loop and waits for the thread. Pending operations fail.
    pub fn shutdown(&mut self) {
        let Some(join) = self.join.take() else {
            return;
        };
        let _ = self.tx.send(LoopEvent::Shutdown);
        if join.join().is_err() {
            error!("event loop thread panicked");
        }
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}
