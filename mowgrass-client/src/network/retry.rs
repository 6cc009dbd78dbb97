//! Connection retry policy
//!
//! Linear, capped backoff and the connect state machine the network worker
//! drives. Pure: no sockets, no clocks, so it is tested directly.

use std::time::Duration;

/// Connect attempts allowed before giving up, and how long to wait between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts before giving up. 0 means unlimited.
    pub max_retries: u32,
    /// Delay unit; attempt `n` waits `n * base_delay`.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Create a policy.
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self { max_retries, base_delay, max_delay }
    }

    /// Delay after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt).min(self.max_delay)
    }

    /// Whether another attempt may follow `attempts_made` consecutive failures.
    pub fn allows(&self, attempts_made: u32) -> bool {
        self.max_retries == 0 || attempts_made < self.max_retries
    }
}

/// Where the connection lifecycle stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionPhase {
    /// Not connected; may try again.
    #[default]
    Disconnected,
    /// Attempt in flight.
    Connecting,
    /// Connected.
    Connected,
    /// Out of attempts. Terminal.
    Exhausted,
}

impl ConnectionPhase {
    /// Whether no further attempts will be made.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exhausted)
    }
}

/// Connect/retry state machine.
///
/// `Disconnected -> Connecting -> Connected -> Disconnected`, with
/// `Connecting -> Exhausted` once the policy runs out.
#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    policy: RetryPolicy,
    phase: ConnectionPhase,
    /// Consecutive failed or in-flight attempts since the last success.
    attempt: u32,
    /// Every attempt ever made.
    total_attempts: u32,
}

impl ConnectionMachine {
    /// Fresh machine in `Disconnected`.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            phase: ConnectionPhase::Disconnected,
            attempt: 0,
            total_attempts: 0,
        }
    }

    /// Start an attempt. Returns its 1-based number, or `None` when the
    /// machine is exhausted.
    pub fn begin_attempt(&mut self) -> Option<u32> {
        if self.phase.is_terminal() {
            return None;
        }
        if !self.policy.allows(self.attempt) {
            self.phase = ConnectionPhase::Exhausted;
            return None;
        }
        self.attempt += 1;
        self.total_attempts += 1;
        self.phase = ConnectionPhase::Connecting;
        Some(self.attempt)
    }

    /// Attempt succeeded. Resets the consecutive attempt counter.
    pub fn on_connected(&mut self) {
        self.phase = ConnectionPhase::Connected;
        self.attempt = 0;
    }

    /// Attempt failed. Returns how long to wait before the next one, or
    /// `None` if that was the last attempt allowed.
    pub fn on_failure(&mut self) -> Option<Duration> {
        if self.policy.allows(self.attempt) {
            self.phase = ConnectionPhase::Disconnected;
            Some(self.policy.delay_for(self.attempt))
        } else {
            self.phase = ConnectionPhase::Exhausted;
            None
        }
    }

    /// An established connection dropped. Returns the pause before
    /// reconnecting.
    pub fn on_disconnect(&mut self) -> Duration {
        self.phase = ConnectionPhase::Disconnected;
        self.attempt = 0;
        self.policy.delay_for(1)
    }

    /// Current phase.
    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    /// Consecutive attempts since the last success.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Every attempt made so far.
    pub fn total_attempts(&self) -> u32 {
        self.total_attempts
    }

    /// Policy in force.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}
