//! PiT mapping lifecycle
//!
//! | state            | event                  | next             |
//! |------------------|------------------------|------------------|
//! | `idle_or_copied` | prepare                | `preparing`      |
//! | `idle_or_copied` | delete, delete_force   | `end`            |
//! | `preparing`      | wait                   | `prepared`       |
//! | `preparing`      | flush_failed           | `stopped`        |
//! | `prepared`       | start                  | `copying`        |
//! | `prepared`       | stop                   | `stopped`        |
//! | `copying`        | wait (progress = 100%) | `idle_or_copied` |
//! | `copying`        | stop                   | `stopping`       |
//! | `stopping`       | wait                   | `stopped`        |
//! | `stopped`        | prepare                | `preparing`      |
//! | `stopped`        | delete, delete_force   | `end`            |
//!
//! `wait` models the passage of time. In states with no background work
//! it is a no-op rather than an error; while copying with a non-zero copy
//! rate it advances progress 0 → 50 → 100 and lands in `idle_or_copied`.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a PiT mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PitState {
    IdleOrCopied,
    Preparing,
    Prepared,
    Copying,
    Stopping,
    Stopped,
    End,
}

impl PitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PitState::IdleOrCopied => "idle_or_copied",
            PitState::Preparing => "preparing",
            PitState::Prepared => "prepared",
            PitState::Copying => "copying",
            PitState::Stopping => "stopping",
            PitState::Stopped => "stopped",
            PitState::End => "end",
        }
    }

    /// No further transitions possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, PitState::End)
    }

    /// No background work in flight
    pub fn is_quiescent(&self) -> bool {
        matches!(
            self,
            PitState::IdleOrCopied | PitState::Stopped | PitState::Prepared | PitState::End
        )
    }
}

impl std::fmt::Display for PitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PitState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "idle_or_copied" => Ok(PitState::IdleOrCopied),
            "preparing" => Ok(PitState::Preparing),
            "prepared" => Ok(PitState::Prepared),
            "copying" => Ok(PitState::Copying),
            "stopping" => Ok(PitState::Stopping),
            "stopped" => Ok(PitState::Stopped),
            "end" => Ok(PitState::End),
            other => Err(Error::MalformedResponse {
                command: "lsfcmap".to_string(),
                reason: format!("unknown PiT mapping status '{}'", other),
            }),
        }
    }
}

/// Event applied to a PiT mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PitEvent {
    Prepare,
    FlushFailed,
    Wait,
    Start,
    Stop,
    Delete,
    DeleteForce,
}

impl std::fmt::Display for PitEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PitEvent::Prepare => write!(f, "prepare"),
            PitEvent::FlushFailed => write!(f, "flush_failed"),
            PitEvent::Wait => write!(f, "wait"),
            PitEvent::Start => write!(f, "start"),
            PitEvent::Stop => write!(f, "stop"),
            PitEvent::Delete => write!(f, "delete"),
            PitEvent::DeleteForce => write!(f, "delete_force"),
        }
    }
}

/// Transition table, ignoring copy progress
pub fn next_state(state: PitState, event: PitEvent) -> Option<PitState> {
    use PitEvent as E;
    use PitState as S;

    match (state, event) {
        (S::IdleOrCopied, E::Prepare) => Some(S::Preparing),
        (S::IdleOrCopied, E::Delete | E::DeleteForce) => Some(S::End),
        (S::Preparing, E::FlushFailed) => Some(S::Stopped),
        (S::Preparing, E::Wait) => Some(S::Prepared),
        (S::Prepared, E::Start) => Some(S::Copying),
        (S::Prepared, E::Stop) => Some(S::Stopped),
        (S::Copying, E::Wait) => Some(S::IdleOrCopied),
        (S::Copying, E::Stop) => Some(S::Stopping),
        (S::Stopping, E::Wait) => Some(S::Stopped),
        (S::Stopped, E::Prepare) => Some(S::Preparing),
        (S::Stopped, E::Delete | E::DeleteForce) => Some(S::End),
        _ => None,
    }
}

/// Array-side PiT mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PitMapping {
    pub id: u32,
    pub name: String,
    pub source: String,
    pub target: String,
    pub copy_rate: u32,
    pub autodelete: bool,
    pub state: PitState,
    /// Background copy progress in percent
    pub progress: u8,
}

impl PitMapping {
    pub fn new(id: u32, source: &str, target: &str, copy_rate: u32, autodelete: bool) -> Self {
        Self {
            id,
            name: format!("fcmap{}", id),
            source: source.to_string(),
            target: target.to_string(),
            copy_rate,
            autodelete,
            state: PitState::IdleOrCopied,
            progress: 0,
        }
    }

    /// Apply one event
    pub fn apply(&mut self, event: PitEvent) -> Result<()> {
        if event == PitEvent::Wait {
            self.advance();
            return Ok(());
        }

        match next_state(self.state, event) {
            Some(next) => {
                if next == PitState::Copying {
                    self.progress = 0;
                }
                self.state = next;
                Ok(())
            }
            None => Err(Error::InvalidStateTransition {
                mapping: self.id.to_string(),
                state: self.state.to_string(),
                event: event.to_string(),
            }),
        }
    }

    fn advance(&mut self) {
        if self.state == PitState::Copying {
            if self.copy_rate == 0 {
                return;
            }
            if self.progress < 50 {
                self.progress = 50;
            } else {
                self.progress = 100;
                self.state = PitState::IdleOrCopied;
            }
            return;
        }
        if let Some(next) = next_state(self.state, PitEvent::Wait) {
            self.state = next;
        }
    }

    /// Eligible for automatic removal
    pub fn is_expired(&self) -> bool {
        self.state == PitState::End
            || (self.autodelete && self.progress == 100 && self.state == PitState::IdleOrCopied)
    }

    pub fn involves(&self, volume: &str) -> bool {
        self.source == volume || self.target == volume
    }
}
