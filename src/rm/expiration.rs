//! Transaction auto-expiration
//!
//! Every declared transaction carries a producer-supplied timeout. A single
//! timer per state machine sleeps until the earliest deadline (bounded by
//! the configured minimum period) and asks the external coordinator to
//! abort whatever has expired. Producers whose coordinator call fails stay
//! tracked and are retried on the next tick.

use super::RmStm;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

/// Expiration tracking for one declared transaction
#[derive(Debug, Clone, Copy)]
pub struct ExpirationInfo {
    /// Producer-declared transaction timeout
    pub timeout: Duration,
    /// Last activity observed for the transaction
    pub last_update: Instant,
    /// Set by `mark_expired` to force the next tick to act
    pub is_expiration_requested: bool,
}

impl ExpirationInfo {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_update: Instant::now(),
            is_expiration_requested: false,
        }
    }

    /// When the producer-declared timeout elapses
    pub fn deadline(&self) -> Instant {
        self.last_update + self.timeout
    }

    /// Whether the transaction is due for auto-abort. `grace` is the
    /// broker-side delay added on top of the declared timeout.
    pub fn is_expired(&self, now: Instant, grace: Duration) -> bool {
        self.is_expiration_requested || self.deadline() + grace <= now
    }

    /// Record activity, pushing the deadline out
    pub fn touch(&mut self) {
        self.last_update = Instant::now();
    }
}

/// Wire form of an expiration entry; the deadline restarts on load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpirationSnapshot {
    pub pid: crate::model::ProducerIdentity,
    pub timeout_ms: i64,
}

/// Timer task: sleep to the earliest deadline, then hand every expired
/// transaction to the coordinator.
pub(crate) async fn expiration_loop(stm: Arc<RmStm>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let sleep_for = stm.next_expiration_sleep();
        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => {}
            _ = stm.expiration_wake_notified() => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }
        if stm.is_autoabort_enabled() {
            stm.abort_old_txes().await;
        }
    }
    debug!("expiration timer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_deadline_respects_timeout() {
        let info = ExpirationInfo::new(Duration::from_millis(100));
        let now = Instant::now();
        assert!(!info.is_expired(now, Duration::ZERO));
        assert!(info.is_expired(now + Duration::from_millis(100), Duration::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_delays_expiry() {
        let info = ExpirationInfo::new(Duration::from_millis(100));
        let now = Instant::now();
        let grace = Duration::from_millis(50);
        assert!(!info.is_expired(now + Duration::from_millis(120), grace));
        assert!(info.is_expired(now + Duration::from_millis(150), grace));
    }

    #[tokio::test(start_paused = true)]
    async fn test_requested_expiry_overrides_deadline() {
        let mut info = ExpirationInfo::new(Duration::from_secs(3600));
        info.is_expiration_requested = true;
        assert!(info.is_expired(Instant::now(), Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_pushes_deadline() {
        let mut info = ExpirationInfo::new(Duration::from_millis(100));
        tokio::time::advance(Duration::from_millis(80)).await;
        info.touch();
        assert!(!info.is_expired(Instant::now() + Duration::from_millis(90), Duration::ZERO));
    }
}
