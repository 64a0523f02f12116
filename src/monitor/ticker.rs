//! Analysis tick sources

use async_trait::async_trait;
use std::time::Duration;
use tokio::time::{Interval, MissedTickBehavior};

/// Yields the next analysis tick
#[async_trait]
pub trait Ticker: Send {
    /// Wait for the next tick. `false` ends the monitor.
    async fn tick(&mut self) -> bool;
}

/// Fixed-period ticks, roughly one per display frame by default
pub struct IntervalTicker {
    interval: Interval,
}

impl IntervalTicker {
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        // A stalled monitor should not burst through missed frames
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { interval }
    }

    pub fn period(&self) -> Duration {
        self.interval.period()
    }
}

#[async_trait]
impl Ticker for IntervalTicker {
    async fn tick(&mut self) -> bool {
        self.interval.tick().await;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_interval_ticks() {
        let mut ticker = IntervalTicker::new(Duration::from_millis(16));
        assert_eq!(ticker.period(), Duration::from_millis(16));

        let start = tokio::time::Instant::now();
        for _ in 0..4 {
            assert!(ticker.tick().await);
        }
        // First tick is immediate
        assert_eq!(start.elapsed(), Duration::from_millis(48));
    }
}
