//! Core closed-set types shared across the engine: step identity, state, and
//! action vocabularies.
//!
//! These mirror the fundamental domain concepts described by the state
//! machine: every step has exactly one [`State`] at a time, and every
//! transition is labeled with an [`Action`] drawn from a fixed vocabulary.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable, dense, monotonically-assigned identifier for a step.
///
/// Ids are handed out by [`crate::step::StepRegistry`] in construction order
/// and never reused. Rules and preconditions reference steps only by id,
/// never by back-pointer, so the rule table stays a flat arena instead of a
/// cyclic object graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StepId(pub u64);

impl StepId {
    #[must_use]
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A step's lifecycle position.
///
/// Initial state is always [`State::Ready`]. [`State::Succeeded`],
/// [`State::Failed`], and [`State::Skipped`] are terminal: no action is
/// defined from them in the default rule table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum State {
    Ready,
    Waiting,
    ToSkip,
    Skipped,
    Paused,
    Running,
    Interrupted,
    Succeeded,
    Failed,
    Error,
}

impl State {
    /// Terminal states have no outgoing actions in the default rule table.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Succeeded | State::Failed | State::Skipped)
    }

    /// Canonical wire/display name, matching the closed-set spelling used in
    /// persisted state and control-channel payloads (e.g. `"To-Skip"`).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            State::Ready => "Ready",
            State::Waiting => "Waiting",
            State::ToSkip => "To-Skip",
            State::Skipped => "Skipped",
            State::Paused => "Paused",
            State::Running => "Running",
            State::Interrupted => "Interrupted",
            State::Succeeded => "Succeeded",
            State::Failed => "Failed",
            State::Error => "Error",
        }
    }

    /// Parse the canonical spelling back into a `State`.
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "Ready" => State::Ready,
            "Waiting" => State::Waiting,
            "To-Skip" => State::ToSkip,
            "Skipped" => State::Skipped,
            "Paused" => State::Paused,
            "Running" => State::Running,
            "Interrupted" => State::Interrupted,
            "Succeeded" => State::Succeeded,
            "Failed" => State::Failed,
            "Error" => State::Error,
            _ => return None,
        })
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A labeled transition applicable from certain states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Start,
    Run,
    Succeed,
    Fail,
    Error,
    Pause,
    Interrupt,
    Resume,
    Rerun,
    MarkToSkip,
    Skip,
    Unskip,
}

impl Action {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Start => "Start",
            Action::Run => "Run",
            Action::Succeed => "Succeed",
            Action::Fail => "Fail",
            Action::Error => "Error",
            Action::Pause => "Pause",
            Action::Interrupt => "Interrupt",
            Action::Resume => "Resume",
            Action::Rerun => "Re-run",
            Action::MarkToSkip => "Mark-to-skip",
            Action::Skip => "Skip",
            Action::Unskip => "Unskip",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A field of the `status` operation's response, letting a caller project
/// only the columns it needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusField {
    Name,
    Tags,
    State,
    Actions,
    IoLog,
    OutputLog,
    ReturnValue,
    Exception,
}

impl StatusField {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "Name" => StatusField::Name,
            "Tags" => StatusField::Tags,
            "State" => StatusField::State,
            "Actions" => StatusField::Actions,
            "IoLog" => StatusField::IoLog,
            "OutputLog" => StatusField::OutputLog,
            "ReturnValue" => StatusField::ReturnValue,
            "Exception" => StatusField::Exception,
            _ => return None,
        })
    }

    /// All fields, the default projection when a `status` call provides an
    /// empty `status_fields` list.
    #[must_use]
    pub fn all() -> Vec<StatusField> {
        vec![
            StatusField::Name,
            StatusField::Tags,
            StatusField::State,
            StatusField::Actions,
            StatusField::IoLog,
            StatusField::OutputLog,
            StatusField::ReturnValue,
            StatusField::Exception,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_canonical_spelling() {
        for state in [
            State::Ready,
            State::Waiting,
            State::ToSkip,
            State::Skipped,
            State::Paused,
            State::Running,
            State::Interrupted,
            State::Succeeded,
            State::Failed,
            State::Error,
        ] {
            assert_eq!(State::parse(state.as_str()), Some(state));
        }
    }

    #[test]
    fn terminal_states_are_exactly_succeeded_failed_skipped() {
        assert!(State::Succeeded.is_terminal());
        assert!(State::Failed.is_terminal());
        assert!(State::Skipped.is_terminal());
        assert!(!State::Running.is_terminal());
        assert!(!State::Ready.is_terminal());
    }
}
