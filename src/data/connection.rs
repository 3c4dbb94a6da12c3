//! Per-connection reconnect state machine with exponential backoff.

use std::time::Duration;

use rand::Rng;

/// Lifecycle of one exchange connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal: too many consecutive reconnect failures.
    Failed,
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Consecutive failures tolerated before the connection is declared
    /// failed and reported critically.
    pub max_failures: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_failures: 5,
        }
    }
}

/// Tracks backoff and failure count for one connection.
#[derive(Debug)]
pub struct Reconnector {
    policy: ReconnectPolicy,
    state: ConnectionState,
    consecutive_failures: u32,
    current_delay: Duration,
}

impl Reconnector {
    pub fn new(policy: ReconnectPolicy) -> Self {
        let current_delay = policy.initial_delay;
        Self {
            policy,
            state: ConnectionState::Disconnected,
            consecutive_failures: 0,
            current_delay,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn on_connecting(&mut self) {
        self.state = if self.consecutive_failures > 0 {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Connecting
        };
    }

    /// Reset backoff after a successful connect.
    pub fn on_connected(&mut self) {
        self.state = ConnectionState::Connected;
        self.consecutive_failures = 0;
        self.current_delay = self.policy.initial_delay;
    }

    /// Record a failure. Returns `true` once the connection has crossed
    /// the failure limit and must be reported as failed.
    pub fn on_failure(&mut self) -> bool {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.policy.max_failures {
            self.state = ConnectionState::Failed;
            true
        } else {
            self.state = ConnectionState::Reconnecting;
            false
        }
    }

    /// Jittered exponential delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current_delay;
        let jitter_cap = (base.as_millis() as u64) / 5;
        let jitter = if jitter_cap == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_cap)
        };
        let next = (self.current_delay.as_millis() as f64 * self.policy.multiplier) as u64;
        self.current_delay = Duration::from_millis(next).min(self.policy.max_delay);
        base + Duration::from_millis(jitter)
    }
}
