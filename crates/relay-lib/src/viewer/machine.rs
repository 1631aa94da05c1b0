//! Reconnect state machine
//!
//! Pure: it decides what to do next and never touches a socket or a
//! timer. The driver in [`super::ClientReconnector`] carries out the
//! returned [`ReconnectAction`].

use crate::models::ConnectionState;
use std::time::Duration;

/// Exponential backoff settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// First delay (default: 1 second)
    pub base: Duration,
    /// Upper bound on any delay (default: 30 seconds)
    pub cap: Duration,
    /// Consecutive failed attempts before giving up (default: 10)
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1000),
            cap: Duration::from_millis(30_000),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// `min(base * 2^attempt, cap)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectAction {
    /// Open a connection to this address now
    Connect(String),
    /// Arm the reconnect timer
    Schedule { delay: Duration, attempt: u32 },
    /// Drop any pending timer and live connection
    CancelPending,
    /// Retry budget exhausted
    GiveUp,
    Nothing,
}

#[derive(Debug)]
pub struct ReconnectMachine {
    policy: ReconnectPolicy,
    target: Option<String>,
    state: ConnectionState,
    attempt: u32,
    timer_armed: bool,
}

impl ReconnectMachine {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            target: None,
            state: ConnectionState::Disconnected,
            attempt: 0,
            timer_armed: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    /// Point the machine at a new address, or unset it.
    ///
    /// A new address starts a fresh attempt cycle. Unsetting cancels any
    /// pending reconnect and leaves the machine `Disconnected` for good.
    pub fn set_target(&mut self, target: Option<String>) -> ReconnectAction {
        self.timer_armed = false;
        self.attempt = 0;

        match target {
            Some(address) => {
                self.target = Some(address.clone());
                self.state = ConnectionState::Connecting;
                ReconnectAction::Connect(address)
            }
            None => {
                self.target = None;
                self.state = ConnectionState::Disconnected;
                ReconnectAction::CancelPending
            }
        }
    }

    /// The transport is up. Resets the attempt counter, so `max_attempts`
    /// bounds consecutive failed handshakes only: a peer that accepts and
    /// then closes is retried at the base delay for as long as the target
    /// stays set.
    pub fn connected(&mut self) {
        if self.state == ConnectionState::Connecting {
            self.state = ConnectionState::Connected;
            self.attempt = 0;
        }
    }

    /// The connection failed to open or dropped. `state` is the terminal
    /// state it ended in.
    pub fn connection_lost(&mut self, state: ConnectionState) -> ReconnectAction {
        debug_assert!(state.is_terminal());
        if self.state.is_terminal() && self.timer_armed {
            return ReconnectAction::Nothing;
        }
        self.state = state;

        if self.target.is_none() {
            return ReconnectAction::Nothing;
        }
        if self.attempt >= self.policy.max_attempts {
            return ReconnectAction::GiveUp;
        }

        let delay = self.policy.delay_for(self.attempt);
        self.attempt += 1;
        self.timer_armed = true;
        ReconnectAction::Schedule {
            delay,
            attempt: self.attempt,
        }
    }

    /// The reconnect timer elapsed
    pub fn timer_fired(&mut self) -> ReconnectAction {
        if !self.timer_armed {
            return ReconnectAction::Nothing;
        }
        self.timer_armed = false;

        match &self.target {
            Some(address) => {
                self.state = ConnectionState::Connecting;
                ReconnectAction::Connect(address.clone())
            }
            None => ReconnectAction::Nothing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDR: &str = "ws://relay/ws/stats/abc";

    #[test]
    fn test_backoff_sequence() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u64> = (0..8).map(|a| policy.delay_for(a).as_millis() as u64).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000, 30000, 30000]);
        assert_eq!(policy.delay_for(64), Duration::from_millis(30_000));
    }

    #[test]
    fn test_consecutive_failures_schedule_growing_delays() {
        let mut machine = ReconnectMachine::new(ReconnectPolicy::default());
        assert_eq!(machine.set_target(Some(ADDR.into())), ReconnectAction::Connect(ADDR.into()));

        let mut delays = Vec::new();
        for _ in 0..5 {
            match machine.connection_lost(ConnectionState::Error) {
                ReconnectAction::Schedule { delay, .. } => delays.push(delay.as_millis()),
                other => panic!("unexpected action {:?}", other),
            }
            assert_eq!(machine.timer_fired(), ReconnectAction::Connect(ADDR.into()));
            assert_eq!(machine.state(), ConnectionState::Connecting);
        }
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000]);
    }

    #[test]
    fn test_success_resets_attempts() {
        let mut machine = ReconnectMachine::new(ReconnectPolicy::default());
        machine.set_target(Some(ADDR.into()));
        machine.connection_lost(ConnectionState::Error);
        machine.timer_fired();
        machine.connection_lost(ConnectionState::Error);
        machine.timer_fired();
        assert_eq!(machine.attempt(), 2);

        machine.connected();
        assert_eq!(machine.state(), ConnectionState::Connected);
        assert_eq!(machine.attempt(), 0);

        assert_eq!(
            machine.connection_lost(ConnectionState::Disconnected),
            ReconnectAction::Schedule {
                delay: Duration::from_millis(1000),
                attempt: 1
            }
        );
    }

    #[test]
    fn test_accept_then_close_retries_at_base_delay() {
        let mut machine = ReconnectMachine::new(ReconnectPolicy::default().with_max_attempts(2));
        machine.set_target(Some(ADDR.into()));

        for _ in 0..5 {
            machine.connected();
            assert_eq!(
                machine.connection_lost(ConnectionState::Disconnected),
                ReconnectAction::Schedule {
                    delay: Duration::from_millis(1000),
                    attempt: 1
                }
            );
            assert_eq!(machine.timer_fired(), ReconnectAction::Connect(ADDR.into()));
        }
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let mut machine = ReconnectMachine::new(ReconnectPolicy::default().with_max_attempts(2));
        machine.set_target(Some(ADDR.into()));

        assert!(matches!(machine.connection_lost(ConnectionState::Error), ReconnectAction::Schedule { .. }));
        machine.timer_fired();
        assert!(matches!(machine.connection_lost(ConnectionState::Error), ReconnectAction::Schedule { .. }));
        machine.timer_fired();
        assert_eq!(machine.connection_lost(ConnectionState::Error), ReconnectAction::GiveUp);
        assert_eq!(machine.state(), ConnectionState::Error);
        assert_eq!(machine.timer_fired(), ReconnectAction::Nothing);
    }

    #[test]
    fn test_unset_target_cancels_pending_reconnect() {
        let mut machine = ReconnectMachine::new(ReconnectPolicy::default());
        machine.set_target(Some(ADDR.into()));
        assert!(matches!(machine.connection_lost(ConnectionState::Error), ReconnectAction::Schedule { .. }));

        assert_eq!(machine.set_target(None), ReconnectAction::CancelPending);
        assert_eq!(machine.state(), ConnectionState::Disconnected);

        // a stale timer firing afterwards does nothing
        assert_eq!(machine.timer_fired(), ReconnectAction::Nothing);
        assert_eq!(machine.connection_lost(ConnectionState::Disconnected), ReconnectAction::Nothing);
        assert_eq!(machine.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_new_target_starts_fresh_cycle() {
        let mut machine = ReconnectMachine::new(ReconnectPolicy::default());
        machine.set_target(Some(ADDR.into()));
        machine.connection_lost(ConnectionState::Error);

        let other = "ws://relay/ws/stats/def";
        assert_eq!(machine.set_target(Some(other.into())), ReconnectAction::Connect(other.into()));
        assert_eq!(machine.attempt(), 0);
        assert_eq!(machine.target(), Some(other));
    }
}
