//! Handshake gate
//!
//! Nothing but the acknowledgement is looked at until the device has
//! answered the handshake request. The deadline is data here; the driver
//! sleeps on it.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Default time the device gets to acknowledge the handshake
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(3000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HandshakeState {
    Idle,
    AwaitingAck,
    Established,
    Failed,
}

/// What to do with an inbound record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// Session is established; decode and dispatch
    Forward,
    /// This record completed the handshake
    Acknowledged,
    /// Not established yet (or failed); drop it
    Discard,
}

#[derive(Debug)]
pub struct Handshake {
    state: HandshakeState,
    timeout: Duration,
    deadline: Option<Instant>,
}

impl Handshake {
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: HandshakeState::Idle,
            timeout,
            deadline: None,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == HandshakeState::Established
    }

    /// Deadline for the ack while `AwaitingAck`.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The request was written: start waiting for the ack.
    pub fn begin(&mut self, now: Instant) {
        if self.state != HandshakeState::Idle {
            log::warn!("[handshake] begin ignored in state {:?}", self.state);
            return;
        }
        self.state = HandshakeState::AwaitingAck;
        self.deadline = Some(now + self.timeout);
    }

    /// Profiles without a handshake are usable as soon as the port opens.
    pub fn establish(&mut self) {
        if self.state != HandshakeState::Idle {
            log::warn!("[handshake] establish ignored in state {:?}", self.state);
            return;
        }
        self.state = HandshakeState::Established;
        self.deadline = None;
    }

    /// Route one record given whether it is the ack.
    pub fn on_record(&mut self, is_ack: bool) -> Gate {
        match self.state {
            HandshakeState::Established => Gate::Forward,
            HandshakeState::AwaitingAck if is_ack => {
                self.state = HandshakeState::Established;
                self.deadline = None;
                Gate::Acknowledged
            }
            _ => Gate::Discard,
        }
    }

    /// Returns true exactly once, when the wait for the ack has expired.
    pub fn check_timeout(&mut self, now: Instant) -> bool {
        match (self.state, self.deadline) {
            (HandshakeState::AwaitingAck, Some(deadline)) if now >= deadline => {
                self.state = HandshakeState::Failed;
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    /// Back to `Idle` after a disconnect.
    pub fn reset(&mut self) {
        self.state = HandshakeState::Idle;
        self.deadline = None;
    }
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new(DEFAULT_HANDSHAKE_TIMEOUT)
    }
}
