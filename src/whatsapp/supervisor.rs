//! Reconnection Supervisor
//!
//! Pure state machine over [`ConnectionState`]. It never sleeps or performs
//! I/O itself: every transition returns a [`SupervisorAction`] that the
//! session runner carries out. Each transition also bumps a generation
//! counter; a scheduled reconnect only fires if its generation is still
//! current, so a newer connection event silently supersedes it.

use super::transport::{ConnectionState, ConnectionUpdate};
use std::time::Duration;

/// Bounded exponential backoff: `min(base * 2^attempt, cap)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorAction {
    Nothing,
    /// Call `connect()` after `delay`, if `generation` is still current then.
    ScheduleReconnect { delay: Duration, generation: u64 },
    /// Retry budget exhausted: wipe credentials and re-pair immediately.
    ResetCredentials { generation: u64 },
    /// Logged out: wipe credentials, stop retrying, wait for an operator.
    Halt,
}

#[derive(Debug)]
pub struct ReconnectSupervisor {
    policy: ReconnectPolicy,
    state: ConnectionState,
    attempt: u32,
    generation: u64,
}

impl ReconnectSupervisor {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            state: ConnectionState::Disconnected,
            attempt: 0,
            generation: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Feed one connection transition.
    pub fn on_update(&mut self, update: ConnectionUpdate) -> SupervisorAction {
        if self.state == ConnectionState::LoggedOut && update != ConnectionUpdate::Open {
            // Terminal until an operator restarts or a fresh pairing opens the session
            return SupervisorAction::Nothing;
        }
        self.generation += 1;

        match update {
            ConnectionUpdate::Connecting => {
                self.state = ConnectionState::Connecting;
                SupervisorAction::Nothing
            }
            ConnectionUpdate::Open => {
                self.state = ConnectionState::Open;
                self.attempt = 0;
                SupervisorAction::Nothing
            }
            ConnectionUpdate::Closed { .. } => {
                self.state = ConnectionState::Disconnected;
                if self.attempt >= self.policy.max_attempts {
                    self.attempt = 0;
                    return SupervisorAction::ResetCredentials {
                        generation: self.generation,
                    };
                }
                let delay = self.policy.delay_for(self.attempt);
                self.attempt += 1;
                SupervisorAction::ScheduleReconnect {
                    delay,
                    generation: self.generation,
                }
            }
            ConnectionUpdate::LoggedOut => {
                self.state = ConnectionState::LoggedOut;
                self.attempt = 0;
                SupervisorAction::Halt
            }
        }
    }

    /// Whether a timer scheduled under `generation` may still act.
    pub fn should_reconnect(&self, generation: u64) -> bool {
        generation == self.generation && self.state == ConnectionState::Disconnected
    }

    /// Whether a handshake deadline armed under `generation` has lapsed with
    /// nothing heard since: the session is still `connecting` in that generation.
    pub fn handshake_expired(&self, generation: u64) -> bool {
        generation == self.generation && self.state == ConnectionState::Connecting
    }

    /// Operator re-initiation; valid from any state. Returns the new generation.
    pub fn restart(&mut self) -> u64 {
        self.generation += 1;
        self.attempt = 0;
        self.state = ConnectionState::Disconnected;
        self.generation
    }
}
