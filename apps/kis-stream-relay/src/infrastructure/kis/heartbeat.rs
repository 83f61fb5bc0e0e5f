//! Heartbeat Monitor
//!
//! Keeps the upstream connection honest with WebSocket pings. The session
//! loop polls [`HeartbeatMonitor::tick`] alongside its reads; any inbound
//! frame counts as proof of life.

use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::infrastructure::config::WebSocketSettings;

/// Ping cadence and tolerance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Interval between pings.
    pub ping_interval: Duration,
    /// How long an unanswered ping is tolerated.
    pub pong_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(20),
            pong_timeout: Duration::from_secs(20),
        }
    }
}

impl From<&WebSocketSettings> for HeartbeatConfig {
    fn from(settings: &WebSocketSettings) -> Self {
        Self {
            ping_interval: settings.heartbeat_interval,
            pong_timeout: settings.heartbeat_timeout,
        }
    }
}

/// What the session loop should do on a heartbeat tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Send a ping now.
    SendPing,
    /// The peer stopped answering; drop the connection.
    Timeout(Duration),
}

/// Per-session heartbeat state.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    interval: Interval,
    last_seen: Instant,
    ping_outstanding: bool,
}

impl HeartbeatMonitor {
    /// Start monitoring. The first ping goes out one interval from now.
    #[must_use]
    pub fn new(config: HeartbeatConfig) -> Self {
        let period = config.ping_interval.max(Duration::from_millis(1));
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self {
            config,
            interval,
            last_seen: Instant::now(),
            ping_outstanding: false,
        }
    }

    /// Wait for the next tick. Cancel safe.
    pub async fn tick(&mut self) -> HeartbeatEvent {
        self.interval.tick().await;

        let silent_for = self.last_seen.elapsed();
        if self.ping_outstanding && silent_for > self.config.pong_timeout {
            return HeartbeatEvent::Timeout(silent_for);
        }

        self.ping_outstanding = true;
        HeartbeatEvent::SendPing
    }

    /// Record any inbound traffic.
    pub fn record_activity(&mut self) {
        self.last_seen = Instant::now();
        self.ping_outstanding = false;
    }

    /// Whether a ping is waiting for an answer.
    #[must_use]
    pub const fn is_waiting(&self) -> bool {
        self.ping_outstanding
    }
}
