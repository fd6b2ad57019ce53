//! Collaborator contracts the engine consumes.
//!
//! These traits are implemented by the hardware/GUI layer. The engine
//! never inspects what happens behind them; it only sequences the calls
//! and reacts to their results.

use crate::errors::{ExecutionError, RestoreError};
use crate::stage::Stage;
use crate::state::Lamella;
use async_trait::async_trait;

/// Performs the actual instrument work for a stage.
///
/// Any protocol or pattern data the executor needs is read from
/// [`Lamella::protocol`](crate::state::Lamella::protocol); the engine
/// carries it opaquely. Calls may block for arbitrary, operator-controlled
/// durations; cancellation is the engine's only exit.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Returns the physical system to the entity's last-saved state
    /// before a stage begins.
    async fn restore_state(&self, lamella: &Lamella, stage: Stage) -> Result<(), RestoreError>;

    /// Performs the real work of `stage` for `lamella`.
    async fn execute(&self, lamella: &Lamella, stage: Stage) -> Result<(), ExecutionError>;

    /// Records whatever environment snapshot is needed for a future
    /// [`restore_state`](Self::restore_state) call.
    async fn capture_state(&self, lamella: &Lamella, stage: Stage) -> Result<(), ExecutionError>;
}

/// Asks the operator a yes/no question and blocks until answered.
#[async_trait]
pub trait Confirmer: Send + Sync {
    /// Returns the operator's answer.
    async fn ask(&self, message: &str) -> bool;
}

/// Confirmer for unsupervised operation: every question is answered yes.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoConfirmer;

#[async_trait]
impl Confirmer for AutoConfirmer {
    async fn ask(&self, _message: &str) -> bool {
        true
    }
}
