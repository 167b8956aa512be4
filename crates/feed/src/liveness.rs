//! Keepalive and timeout policy shared by server and client
//!
//! Each connection owns a `LivenessMonitor` that is touched whenever the peer
//! shows activity. The side that sends pings checks the monitor on every ping
//! tick, so a silent peer is dropped at most one ping interval after its
//! deadline passes.

use crate::error::{FeedError, FeedResult};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, Interval, MissedTickBehavior};

/// Tracks the last time a peer was heard from
#[derive(Debug)]
pub struct LivenessMonitor {
    base: Instant,
    /// Milliseconds since `base` of the last observed activity
    last_activity_ms: AtomicU64,
    timeout: Duration,
}

impl LivenessMonitor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            base: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            timeout,
        }
    }

    /// Record activity from the peer
    pub fn touch(&self) {
        let elapsed = self.base.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> Instant {
        self.base + Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed))
    }

    pub fn idle_for(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_activity())
    }

    /// Instant after which the peer counts as dead
    pub fn deadline(&self) -> Instant {
        self.last_activity() + self.timeout
    }

    pub fn is_expired(&self) -> bool {
        self.idle_for() > self.timeout
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Periodic ping ticker handing out increasing nonces
pub struct PingSchedule {
    interval: Interval,
    next_nonce: u64,
}

impl PingSchedule {
    /// First tick fires one full period from now
    pub fn new(period: Duration) -> Self {
        let period = period.max(Duration::from_millis(1));
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            interval,
            next_nonce: 1,
        }
    }

    /// Wait for the next tick and return the nonce to send with it
    pub async fn tick(&mut self) -> u64 {
        self.interval.tick().await;
        let nonce = self.next_nonce;
        self.next_nonce += 1;
        nonce
    }
}

/// Bound a socket operation by `limit`
pub async fn with_io_timeout<F, T, E>(limit: Duration, op: F) -> FeedResult<T>
where
    F: Future<Output = Result<T, E>>,
    E: Into<FeedError>,
{
    match tokio::time::timeout(limit, op).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(FeedError::IoTimeout(limit)),
    }
}

/// Resolve once `signal` is raised or its sender is gone
///
/// The borrow `wait_for` hands back is released here, so the future stays
/// `Send` inside a `select!` whose other arms await.
pub async fn wait_stopped(signal: &mut watch::Receiver<bool>) {
    let _ = signal.wait_for(|stopped| *stopped).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_monitor_expires_after_timeout() {
        let monitor = LivenessMonitor::new(Duration::from_secs(15));
        assert!(!monitor.is_expired());

        tokio::time::advance(Duration::from_secs(10)).await;
        monitor.touch();
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(!monitor.is_expired());
        assert_eq!(monitor.idle_for(), Duration::from_secs(10));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(monitor.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_schedule_nonces() {
        let start = Instant::now();
        let mut pings = PingSchedule::new(Duration::from_secs(5));

        assert_eq!(pings.tick().await, 1);
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert_eq!(pings.tick().await, 2);
        assert!(start.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_period_does_not_panic() {
        let start = Instant::now();
        let mut pings = PingSchedule::new(Duration::ZERO);
        assert_eq!(pings.tick().await, 1);
        assert_eq!(pings.tick().await, 2);
        assert!(start.elapsed() >= Duration::from_millis(2));
    }

    #[tokio::test]
    async fn test_wait_stopped_on_signal_or_drop() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { wait_stopped(&mut rx).await });
        tx.send(true).unwrap();
        waiter.await.unwrap();

        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        wait_stopped(&mut rx).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_io_timeout() {
        let result: FeedResult<()> = with_io_timeout(Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok::<(), FeedError>(())
        })
        .await;
        assert!(matches!(result, Err(FeedError::IoTimeout(_))));
    }
}
