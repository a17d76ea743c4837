//! Active Document Expiry
//!
//! Lazy expiry in the engine only drops a document when something touches
//! it. A bucket that is written once and never read again would hold its
//! expired documents forever, and `stat` would keep reporting them in
//! `curr_items`. The sweeper is a Tokio task that drops them periodically.
//!
//! The sweep interval adapts: it halves while a large share of the bucket
//! is expiring and doubles while nothing is.

use crate::storage::StorageEngine;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, trace};

/// Sweeper tuning.
#[derive(Debug, Clone)]
pub struct ExpiryConfig {
    pub base_interval: Duration,
    pub min_interval: Duration,
    pub max_interval: Duration,
    /// Expired fraction above which sweeps speed up
    pub speedup_threshold: f64,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_millis(250),
            min_interval: Duration::from_millis(10),
            max_interval: Duration::from_secs(2),
            speedup_threshold: 0.25,
        }
    }
}

/// Handle to a running sweeper. Dropping it stops the task.
#[derive(Debug)]
pub struct ExpirySweeper {
    shutdown_tx: watch::Sender<bool>,
    swept: Arc<AtomicU64>,
}

impl ExpirySweeper {
    /// Spawns the sweeper on the current Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a runtime; use
    /// [`ExpirySweeper::try_start`] when that is possible.
    pub fn start(engine: Arc<StorageEngine>, config: ExpiryConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let swept = Arc::new(AtomicU64::new(0));

        tokio::spawn(sweep_loop(engine, config, Arc::clone(&swept), shutdown_rx));
        debug!("document expiry sweeper started");

        Self { shutdown_tx, swept }
    }

    /// Spawns the sweeper if a Tokio runtime is running on this thread.
    pub fn try_start(engine: Arc<StorageEngine>, config: ExpiryConfig) -> Option<Self> {
        tokio::runtime::Handle::try_current().ok()?;
        Some(Self::start(engine, config))
    }

    /// Documents dropped by this sweeper so far.
    pub fn swept(&self) -> u64 {
        self.swept.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        if !*self.shutdown_tx.borrow() {
            let _ = self.shutdown_tx.send(true);
            debug!("document expiry sweeper stopped");
        }
    }
}

impl Drop for ExpirySweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn sweep_loop(
    engine: Arc<StorageEngine>,
    config: ExpiryConfig,
    swept: Arc<AtomicU64>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut interval = config.base_interval;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return;
                }
            }
        }

        let before = engine.len();
        let expired = engine.cleanup_expired();
        swept.fetch_add(expired, Ordering::Relaxed);

        if before == 0 {
            continue;
        }

        let rate = expired as f64 / before as f64;
        if rate > config.speedup_threshold {
            interval = (interval / 2).max(config.min_interval);
            debug!(
                expired,
                remaining = engine.len(),
                interval_ms = interval.as_millis() as u64,
                "many documents expiring, sweeping faster"
            );
        } else if expired == 0 {
            interval = (interval * 2).min(config.max_interval);
            trace!(interval_ms = interval.as_millis() as u64, "nothing expired, backing off");
        } else {
            debug!(expired, remaining = engine.len(), "expired documents dropped");
        }
    }
}
