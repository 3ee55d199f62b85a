//! Crate-wide error types.
//!
//! Each component has its own error enum so call sites can match on the
//! specific failure mode; [`AutotrailError`] aggregates them with `#[from]`
//! for callers (chiefly [`crate::manager::Manager`]) that just need one
//! error type to propagate with `?`.

use miette::Diagnostic;
use thiserror::Error;

use crate::types::{Action, State, StepId};

/// The discriminant a step's worker classifies its outcome into, per the
/// automated resolver's `check_worker` table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerErrorKind {
    /// The designated fatal error kind; drives `Fail -> Failed`.
    Failure,
    /// Any other error; drives `Error -> Error` (retryable).
    Tempfail,
}

/// The error value produced by a step's user callable.
///
/// Carries a cause chain so a step can wrap a lower-level error without
/// losing it, the same shape the engine uses for its own diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerError {
    pub kind: WorkerErrorKind,
    pub message: String,
    pub cause: Option<Box<WorkerError>>,
    pub details: serde_json::Value,
}

impl WorkerError {
    #[must_use]
    pub fn failure<M: Into<String>>(message: M) -> Self {
        WorkerError {
            kind: WorkerErrorKind::Failure,
            message: message.into(),
            cause: None,
            details: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub fn tempfail<M: Into<String>>(message: M) -> Self {
        WorkerError {
            kind: WorkerErrorKind::Tempfail,
            message: message.into(),
            cause: None,
            details: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub fn with_cause(mut self, cause: WorkerError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    /// Render the full cause chain as a JSON value, used when writing a
    /// step's exception into the context or a status response.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "kind": match self.kind {
                WorkerErrorKind::Failure => "failure",
                WorkerErrorKind::Tempfail => "tempfail",
            },
            "message": self.message,
            "cause": self.cause.as_ref().map(|c| c.to_json()),
            "details": self.details,
        })
    }
}

impl std::fmt::Display for WorkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for WorkerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_ref().map(|c| c as &dyn std::error::Error)
    }
}

/// Malformed rule table or a precondition referencing an unknown step.
#[derive(Debug, Error, Diagnostic)]
pub enum RuleError {
    #[error("step {step} has no transition defined for action {action} from state {state}")]
    #[diagnostic(code(autotrail::rules::undefined_transition))]
    UndefinedTransition {
        step: StepId,
        state: State,
        action: Action,
    },

    #[error("precondition on step {step} references unknown step {referenced}")]
    #[diagnostic(code(autotrail::rules::unknown_reference))]
    UnknownReference { step: StepId, referenced: StepId },
}

/// Validation failures surfaced through an API response's `error` field.
#[derive(Debug, Error, Diagnostic, Clone, PartialEq)]
pub enum ApiError {
    #[error("unknown operation: {0}")]
    #[diagnostic(code(autotrail::api::unknown_operation))]
    UnknownOperation(String),

    #[error("malformed field `{field}`: expected {expected}")]
    #[diagnostic(code(autotrail::api::malformed_field))]
    MalformedField { field: &'static str, expected: &'static str },

    #[error("unknown state name: {0}")]
    #[diagnostic(code(autotrail::api::unknown_state))]
    UnknownState(String),

    #[error("unknown status field: {0}")]
    #[diagnostic(code(autotrail::api::unknown_status_field))]
    UnknownStatusField(String),

    #[error("no step matches the given name")]
    #[diagnostic(code(autotrail::api::no_matching_step))]
    NoMatchingStep,
}

/// Failures in the control channel's accept/framing/encoding layer.
#[derive(Debug, Error, Diagnostic)]
pub enum ControlError {
    #[error("failed to bind control socket at {path}: {source}")]
    #[diagnostic(code(autotrail::control::bind_failed))]
    Bind {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("socket io error: {0}")]
    #[diagnostic(code(autotrail::control::io))]
    Io(#[from] std::io::Error),

    #[error("frame was not valid percent-encoded UTF-8: {0}")]
    #[diagnostic(code(autotrail::control::bad_encoding))]
    BadEncoding(String),

    #[error("frame was not valid JSON: {0}")]
    #[diagnostic(code(autotrail::control::bad_json))]
    BadJson(#[from] serde_json::Error),
}

/// Assembly- and lifecycle-level failures for the [`crate::manager::Manager`].
#[derive(Debug, Error, Diagnostic)]
pub enum ManagerError {
    #[error("duplicate step name: {0}")]
    #[diagnostic(code(autotrail::manager::duplicate_step))]
    DuplicateStepName(String),

    #[error("edge references unknown step id {0}")]
    #[diagnostic(code(autotrail::manager::unknown_edge_endpoint))]
    UnknownEdgeEndpoint(StepId),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Rules(#[from] RuleError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Control(#[from] ControlError),

    #[error("evaluator task panicked or was aborted: {0}")]
    #[diagnostic(code(autotrail::manager::evaluator_join))]
    EvaluatorJoin(String),
}

/// Backup/restore file I/O and schema mismatches.
#[derive(Debug, Error, Diagnostic)]
pub enum PersistenceError {
    #[error("io error reading/writing persisted state at {path}: {source}")]
    #[diagnostic(code(autotrail::persistence::io))]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("persisted state is not valid JSON: {0}")]
    #[diagnostic(code(autotrail::persistence::bad_json))]
    BadJson(#[from] serde_json::Error),

    #[error("persisted state is missing step `{0}`")]
    #[diagnostic(code(autotrail::persistence::missing_step))]
    MissingStep(String),

    #[error("persisted state's parents for `{step}` disagree with the current graph")]
    #[diagnostic(code(autotrail::persistence::parent_mismatch))]
    ParentMismatch { step: String },
}

/// Aggregate error type for callers that want a single `Result` alias.
#[derive(Debug, Error, Diagnostic)]
pub enum AutotrailError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Rules(#[from] RuleError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Control(#[from] ControlError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Manager(#[from] ManagerError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Persistence(#[from] PersistenceError),
}
