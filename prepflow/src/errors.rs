//! Error types for the prepflow engine.
//!
//! The taxonomy separates caller misuse of the state machine (sequencing
//! errors, always fatal to the call), entity-scoped collaborator failures
//! (recoverable, isolated to one lamella), and experiment-scoped
//! persistence failures (fatal to the whole run).

use crate::method::Method;
use crate::stage::Stage;
use thiserror::Error;

/// The main error type for prepflow operations.
#[derive(Debug, Error)]
pub enum PrepflowError {
    /// An illegal stage transition was requested.
    #[error("{0}")]
    Sequence(#[from] StageSequenceError),

    /// A stage was queried against a method that does not include it.
    #[error("{0}")]
    NotInMethod(#[from] StageNotInMethodError),

    /// An illegal revert was requested.
    #[error("{0}")]
    Revert(#[from] InvalidRevertError),

    /// An entity name collided with an existing one.
    #[error("{0}")]
    DuplicateName(#[from] DuplicateNameError),

    /// A persisted experiment violated structural invariants.
    #[error("{0}")]
    Corrupt(#[from] CorruptExperimentError),

    /// A stage execution failed in the executor.
    #[error("{0}")]
    Execution(#[from] ExecutionError),

    /// The executor could not restore the entity's saved state.
    #[error("{0}")]
    Restore(#[from] RestoreError),

    /// The experiment could not be persisted.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error raised when `advance` is asked to skip or repeat a stage.
#[derive(Debug, Clone, Error)]
#[error("illegal transition from '{from}' to '{to}' (expected {})", .expected.map_or_else(|| "no further stage".to_string(), |s| format!("'{s}'")))]
pub struct StageSequenceError {
    /// The stage the entity is currently at.
    pub from: Stage,
    /// The requested stage.
    pub to: Stage,
    /// The only stage that would have been accepted, if any.
    pub expected: Option<Stage>,
}

impl StageSequenceError {
    /// Creates a new stage sequence error.
    #[must_use]
    pub fn new(from: Stage, to: Stage, expected: Option<Stage>) -> Self {
        Self { from, to, expected }
    }
}

/// Error raised when a stage is not part of a method's configured path.
#[derive(Debug, Clone, Error)]
#[error("stage '{stage}' is not part of the '{method}' method")]
pub struct StageNotInMethodError {
    /// The stage that was queried.
    pub stage: Stage,
    /// The method whose path was consulted.
    pub method: Method,
}

impl StageNotInMethodError {
    /// Creates a new stage-not-in-method error.
    #[must_use]
    pub fn new(stage: Stage, method: Method) -> Self {
        Self { stage, method }
    }
}

/// Error raised when reverting to a stage that is not strictly behind the
/// current one, or that the entity never reached.
#[derive(Debug, Clone, Error)]
#[error("cannot revert to '{target}' from '{current}': {reason}")]
pub struct InvalidRevertError {
    /// The revert target.
    pub target: Stage,
    /// The entity's current stage.
    pub current: Stage,
    /// Why the revert was rejected.
    pub reason: String,
}

impl InvalidRevertError {
    /// The target is not strictly before the current stage.
    #[must_use]
    pub fn not_behind(target: Stage, current: Stage) -> Self {
        Self {
            target,
            current,
            reason: "target is not strictly before the current stage".to_string(),
        }
    }

    /// The entity has no history entry for the target stage.
    #[must_use]
    pub fn never_reached(target: Stage, current: Stage) -> Self {
        Self {
            target,
            current,
            reason: "the entity never completed that stage".to_string(),
        }
    }
}

/// Error raised when appending an entity whose name already exists.
#[derive(Debug, Clone, Error)]
#[error("an entity named '{name}' already exists in the experiment")]
pub struct DuplicateNameError {
    /// The colliding name.
    pub name: String,
}

impl DuplicateNameError {
    /// Creates a new duplicate name error.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Error raised when a loaded experiment violates structural invariants,
/// e.g. a history entry referencing a stage the experiment's method does
/// not recognize.
#[derive(Debug, Clone, Error)]
#[error("corrupt experiment: {message}")]
pub struct CorruptExperimentError {
    /// Description of the violated invariant.
    pub message: String,
}

impl CorruptExperimentError {
    /// Creates a new corrupt experiment error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Failure reported by the executor while performing a stage.
///
/// Recoverable failures leave the entity retryable at its current,
/// uncompleted stage; fatal failures mark the entity failed.
#[derive(Debug, Clone, Error)]
pub enum ExecutionError {
    /// The stage failed but may succeed on a later attempt.
    #[error("stage execution failed (retryable): {reason}")]
    Recoverable {
        /// What went wrong.
        reason: String,
    },

    /// The stage failed and the entity cannot continue.
    #[error("stage execution failed (unrecoverable): {reason}")]
    Fatal {
        /// What went wrong.
        reason: String,
    },
}

impl ExecutionError {
    /// Creates a recoverable execution error.
    #[must_use]
    pub fn recoverable(reason: impl Into<String>) -> Self {
        Self::Recoverable {
            reason: reason.into(),
        }
    }

    /// Creates a fatal execution error.
    #[must_use]
    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal {
            reason: reason.into(),
        }
    }

    /// Returns true if the entity should be marked failed.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }

    /// Returns the failure reason.
    #[must_use]
    pub fn reason(&self) -> &str {
        match self {
            Self::Recoverable { reason } | Self::Fatal { reason } => reason,
        }
    }
}

/// Error raised when the physical system cannot be returned to an
/// entity's last-saved state.
#[derive(Debug, Clone, Error)]
#[error("failed to restore saved state for stage '{stage}': {reason}")]
pub struct RestoreError {
    /// The stage whose saved state was being restored.
    pub stage: Stage,
    /// What went wrong.
    pub reason: String,
}

impl RestoreError {
    /// Creates a new restore error.
    #[must_use]
    pub fn new(stage: Stage, reason: impl Into<String>) -> Self {
        Self {
            stage,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_error_message_names_expected_stage() {
        let err = StageSequenceError::new(
            Stage::PositionReady,
            Stage::MillRough,
            Some(Stage::SetupLamella),
        );
        let msg = err.to_string();
        assert!(msg.contains("position_ready"));
        assert!(msg.contains("mill_rough"));
        assert!(msg.contains("setup_lamella"));
    }

    #[test]
    fn test_sequence_error_message_at_terminal() {
        let err = StageSequenceError::new(Stage::Finished, Stage::MillRough, None);
        assert!(err.to_string().contains("no further stage"));
    }

    #[test]
    fn test_execution_error_fatality() {
        assert!(!ExecutionError::recoverable("beam drift").is_fatal());
        assert!(ExecutionError::fatal("sample destroyed").is_fatal());
        assert_eq!(ExecutionError::fatal("sample destroyed").reason(), "sample destroyed");
    }

    #[test]
    fn test_errors_convert_into_umbrella() {
        let err: PrepflowError = DuplicateNameError::new("lamella-01").into();
        assert!(err.to_string().contains("lamella-01"));

        let err: PrepflowError = CorruptExperimentError::new("unknown stage in history").into();
        assert!(err.to_string().contains("corrupt experiment"));
    }
}
