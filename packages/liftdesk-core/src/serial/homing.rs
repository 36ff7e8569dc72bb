//! Homing state machine
//!
//! The operator sets the minimum position, then the maximum. Each step only
//! counts once the device confirms it; the state never moves backwards and
//! never skips `MinSet`.

use super::codec::{Command, ProtocolEvent};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HomingState {
    #[default]
    NotStarted,
    MinSet,
    FullyHomed,
}

impl HomingState {
    pub fn display_text(&self) -> &'static str {
        match self {
            HomingState::NotStarted => "System Not Homed",
            HomingState::MinSet => "Min Position Set",
            HomingState::FullyHomed => "System is homed",
        }
    }
}

/// What the "set position" action does in the current state.
#[derive(Debug, Clone, PartialEq)]
pub enum SetPositionAction {
    Send(Command),
    Disabled,
}

#[derive(Debug, Default)]
pub struct HomingMachine {
    state: HomingState,
}

impl HomingMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> HomingState {
        self.state
    }

    pub fn is_fully_homed(&self) -> bool {
        self.state == HomingState::FullyHomed
    }

    pub fn current_command(&self) -> SetPositionAction {
        match self.state {
            HomingState::NotStarted => SetPositionAction::Send(Command::SetMin),
            HomingState::MinSet => SetPositionAction::Send(Command::SetMax),
            HomingState::FullyHomed => SetPositionAction::Disabled,
        }
    }

    /// Apply a decoded event. Returns the new state if it changed.
    pub fn on_event(&mut self, event: &ProtocolEvent) -> Option<HomingState> {
        let next = match (self.state, event) {
            (HomingState::NotStarted, ProtocolEvent::MinPositionConfirmed) => HomingState::MinSet,
            (HomingState::MinSet, ProtocolEvent::MaxPositionConfirmed) => HomingState::FullyHomed,
            (HomingState::NotStarted, ProtocolEvent::MaxPositionConfirmed) => {
                log::debug!("[homing] max confirmation before min, ignored");
                return None;
            }
            _ => return None,
        };
        self.state = next;
        Some(next)
    }

    pub fn reset(&mut self) {
        self.state = HomingState::NotStarted;
    }
}
