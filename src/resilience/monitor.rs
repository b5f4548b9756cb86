//! Heartbeat tracking for one conversation's stream.

use std::time::Duration;

use tokio::time::Instant;

use crate::types::ConnectionState;

/// Tracks the time since the last raw event and the connection state.
#[derive(Debug, Clone)]
pub struct StreamMonitor {
    threshold: Duration,
    last_event_at: Instant,
    state: ConnectionState,
    warned: bool,
}

impl StreamMonitor {
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            last_event_at: Instant::now(),
            state: ConnectionState::Connecting,
            warned: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn last_event_at(&self) -> Instant {
        self.last_event_at
    }

    /// A turn begins: the clock restarts and the stream counts as connected.
    pub fn begin(&mut self, now: Instant) {
        self.last_event_at = now;
        self.state = ConnectionState::Connected;
        self.warned = false;
    }

    /// Record a raw event. Returns the new state when this recovers a degraded stream.
    pub fn record_event(&mut self, now: Instant) -> Option<ConnectionState> {
        self.last_event_at = now;
        self.warned = false;
        if self.state == ConnectionState::Degraded {
            self.state = ConnectionState::Connected;
            return Some(self.state);
        }
        None
    }

    /// Periodic check. Returns the silent gap once per gap that exceeds the threshold.
    pub fn check(&mut self, now: Instant) -> Option<Duration> {
        if !matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Degraded
        ) || self.warned
        {
            return None;
        }
        let elapsed = now.saturating_duration_since(self.last_event_at);
        if elapsed < self.threshold {
            return None;
        }
        self.warned = true;
        self.state = ConnectionState::Degraded;
        Some(elapsed)
    }

    pub fn close(&mut self) {
        self.state = ConnectionState::Closed;
    }

    pub fn fail(&mut self) {
        self.state = ConnectionState::Failed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn warns_once_per_silent_gap() {
        let mut monitor = StreamMonitor::new(Duration::from_secs(60));
        monitor.begin(Instant::now());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(monitor.check(Instant::now()).is_none());

        tokio::time::advance(Duration::from_secs(31)).await;
        let gap = monitor.check(Instant::now()).expect("gap should be reported");
        assert!(gap >= Duration::from_secs(60));
        assert_eq!(monitor.state(), ConnectionState::Degraded);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(monitor.check(Instant::now()).is_none());

        assert_eq!(
            monitor.record_event(Instant::now()),
            Some(ConnectionState::Connected)
        );
        assert!(monitor.check(Instant::now()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn closed_stream_is_not_checked() {
        let mut monitor = StreamMonitor::new(Duration::from_secs(1));
        monitor.begin(Instant::now());
        monitor.close();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(monitor.check(Instant::now()).is_none());
        assert_eq!(monitor.state(), ConnectionState::Closed);
    }
}
