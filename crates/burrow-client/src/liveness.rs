//! Keepalive bookkeeping for the agent side of the control connection

use burrow_proto::{now_millis, ControlMessage};
use std::time::Duration;
use tokio::time::Instant;

use crate::controller::ConnectionState;

/// Tracks inbound activity and decides when the transport is dead
#[derive(Debug)]
pub struct KeepaliveMonitor {
    timeout: Duration,
    last_activity: Instant,
}

impl KeepaliveMonitor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_activity: Instant::now(),
        }
    }

    /// Keepalive to send on a tick, or `None` when not connected
    pub fn keepalive(&self, state: ConnectionState) -> Option<ControlMessage> {
        match state {
            ConnectionState::Connected => Some(ControlMessage::Keepalive {
                timestamp: now_millis(),
            }),
            _ => None,
        }
    }

    /// Any inbound frame counts as proof of life
    pub fn record_activity(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn is_stale(&self) -> bool {
        self.last_activity.elapsed() > self.timeout
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_only_when_connected() {
        let monitor = KeepaliveMonitor::new(Duration::from_secs(90));

        assert!(matches!(
            monitor.keepalive(ConnectionState::Connected),
            Some(ControlMessage::Keepalive { .. })
        ));
        assert!(monitor.keepalive(ConnectionState::Connecting).is_none());
        assert!(monitor.keepalive(ConnectionState::Disconnected).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_goes_stale_without_activity() {
        let mut monitor = KeepaliveMonitor::new(Duration::from_secs(90));

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(!monitor.is_stale());

        monitor.record_activity();
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(!monitor.is_stale());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(monitor.is_stale());
        assert_eq!(monitor.idle_for(), Duration::from_secs(91));
    }
}
