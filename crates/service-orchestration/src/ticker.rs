//! Injectable sleep for the reconciliation loop

use async_channel::{Receiver, Sender};
use async_trait::async_trait;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Source of delays between reconciliation ticks
#[async_trait]
pub trait Ticker: Send + Sync + 'static {
    /// Wait for `duration`
    async fn sleep(&self, duration: Duration);
}

/// Wall-clock ticker backed by smol timers
#[derive(Debug, Clone, Copy, Default)]
pub struct SmolTicker;

#[async_trait]
impl Ticker for SmolTicker {
    async fn sleep(&self, duration: Duration) {
        smol::Timer::after(duration).await;
    }
}

/// Virtual-time ticker for tests
///
/// Each `sleep` records the requested duration, then parks until
/// [`ManualTicker::advance`] releases it.
#[derive(Debug)]
pub struct ManualTicker {
    requested: Mutex<Vec<Duration>>,
    requests_tx: Sender<Duration>,
    requests_rx: Receiver<Duration>,
    release_tx: Sender<()>,
    release_rx: Receiver<()>,
}

impl ManualTicker {
    /// Create a ticker with no pending sleeps
    pub fn new() -> Self {
        let (requests_tx, requests_rx) = async_channel::unbounded();
        let (release_tx, release_rx) = async_channel::unbounded();
        Self {
            requested: Mutex::new(Vec::new()),
            requests_tx,
            requests_rx,
            release_tx,
            release_rx,
        }
    }

    /// Wait for the next sleep request and return its duration
    pub async fn next_request(&self) -> Option<Duration> {
        self.requests_rx.recv().await.ok()
    }

    /// Release one parked sleep
    pub fn advance(&self) {
        let _ = self.release_tx.try_send(());
    }

    /// Every duration requested so far
    pub fn requested(&self) -> Vec<Duration> {
        self.requested
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for ManualTicker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Ticker for ManualTicker {
    async fn sleep(&self, duration: Duration) {
        self.requested
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(duration);
        let _ = self.requests_tx.try_send(duration);
        let _ = self.release_rx.recv().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[smol_potat::test]
    async fn test_manual_ticker_parks_until_advanced() {
        let ticker = Arc::new(ManualTicker::new());
        let sleeper = {
            let ticker = ticker.clone();
            smol::spawn(async move { ticker.sleep(Duration::from_secs(60)).await })
        };

        assert_eq!(ticker.next_request().await, Some(Duration::from_secs(60)));
        ticker.advance();
        sleeper.await;
        assert_eq!(ticker.requested(), vec![Duration::from_secs(60)]);
    }

    #[smol_potat::test]
    async fn test_smol_ticker_sleeps() {
        let start = std::time::Instant::now();
        SmolTicker.sleep(Duration::from_millis(20)).await;
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
