//! Test doubles for the collaborator contracts.
//!
//! Headless stand-ins for the hardware/GUI layer: outcomes are scripted
//! per (entity, stage) and every call is recorded for assertions.

use crate::contracts::{Confirmer, StageExecutor};
use crate::errors::{ExecutionError, RestoreError};
use crate::stage::Stage;
use crate::state::Lamella;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};

/// A stage executor whose outcomes are scripted per (entity name, stage).
///
/// Unscripted calls succeed. Scripted failures are persistent: the same
/// call keeps failing until a new executor is built, which keeps retry
/// tests deterministic.
#[derive(Default)]
pub struct ScriptedExecutor {
    recoverable: HashSet<(String, Stage)>,
    fatal: HashSet<(String, Stage)>,
    restore_failures: HashSet<(String, Stage)>,
    executions: Mutex<Vec<(String, Stage)>>,
    restores: Mutex<Vec<(String, Stage)>>,
    captures: Mutex<Vec<(String, Stage)>>,
}

impl ScriptedExecutor {
    /// Creates an executor where every call succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts a recoverable execution failure.
    #[must_use]
    pub fn failing_recoverable(mut self, entity: impl Into<String>, stage: Stage) -> Self {
        self.recoverable.insert((entity.into(), stage));
        self
    }

    /// Scripts a fatal execution failure.
    #[must_use]
    pub fn failing_fatal(mut self, entity: impl Into<String>, stage: Stage) -> Self {
        self.fatal.insert((entity.into(), stage));
        self
    }

    /// Scripts a restore failure.
    #[must_use]
    pub fn failing_restore(mut self, entity: impl Into<String>, stage: Stage) -> Self {
        self.restore_failures.insert((entity.into(), stage));
        self
    }

    /// All `execute` calls, in order.
    #[must_use]
    pub fn executions(&self) -> Vec<(String, Stage)> {
        self.executions.lock().clone()
    }

    /// All `restore_state` calls, in order.
    #[must_use]
    pub fn restores(&self) -> Vec<(String, Stage)> {
        self.restores.lock().clone()
    }

    /// All `capture_state` calls, in order.
    #[must_use]
    pub fn captures(&self) -> Vec<(String, Stage)> {
        self.captures.lock().clone()
    }
}

#[async_trait]
impl StageExecutor for ScriptedExecutor {
    async fn restore_state(&self, lamella: &Lamella, stage: Stage) -> Result<(), RestoreError> {
        let key = (lamella.name().to_string(), stage);
        self.restores.lock().push(key.clone());
        if self.restore_failures.contains(&key) {
            return Err(RestoreError::new(stage, "scripted restore failure"));
        }
        Ok(())
    }

    async fn execute(&self, lamella: &Lamella, stage: Stage) -> Result<(), ExecutionError> {
        let key = (lamella.name().to_string(), stage);
        self.executions.lock().push(key.clone());
        if self.fatal.contains(&key) {
            return Err(ExecutionError::fatal("scripted fatal failure"));
        }
        if self.recoverable.contains(&key) {
            return Err(ExecutionError::recoverable("scripted failure"));
        }
        Ok(())
    }

    async fn capture_state(&self, lamella: &Lamella, stage: Stage) -> Result<(), ExecutionError> {
        self.captures.lock().push((lamella.name().to_string(), stage));
        Ok(())
    }
}

/// A confirmer answering from a scripted queue, then a default.
#[derive(Debug, Default)]
pub struct ScriptedConfirmer {
    answers: Mutex<VecDeque<bool>>,
    default_answer: bool,
    asked: Mutex<Vec<String>>,
}

impl ScriptedConfirmer {
    /// Answers from `answers` in order, then `default_answer`.
    #[must_use]
    pub fn new(answers: Vec<bool>, default_answer: bool) -> Self {
        Self {
            answers: Mutex::new(answers.into()),
            default_answer,
            asked: Mutex::new(Vec::new()),
        }
    }

    /// Every question asked, in order.
    #[must_use]
    pub fn asked(&self) -> Vec<String> {
        self.asked.lock().clone()
    }
}

#[async_trait]
impl Confirmer for ScriptedConfirmer {
    async fn ask(&self, message: &str) -> bool {
        self.asked.lock().push(message.to_string());
        self.answers.lock().pop_front().unwrap_or(self.default_answer)
    }
}

/// A confirmer that declines everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyingConfirmer;

#[async_trait]
impl Confirmer for DenyingConfirmer {
    async fn ask(&self, _message: &str) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::Method;

    #[tokio::test]
    async fn test_scripted_executor_records_and_fails_on_script() {
        let executor = ScriptedExecutor::new()
            .failing_recoverable("lamella-01", Stage::MillRough)
            .failing_fatal("lamella-02", Stage::MillRough);
        let a = Lamella::new("lamella-01", "/data/a", Method::OnGrid);
        let b = Lamella::new("lamella-02", "/data/b", Method::OnGrid);

        assert!(executor.execute(&a, Stage::SetupLamella).await.is_ok());
        let err = executor.execute(&a, Stage::MillRough).await.unwrap_err();
        assert!(!err.is_fatal());
        let err = executor.execute(&b, Stage::MillRough).await.unwrap_err();
        assert!(err.is_fatal());

        assert_eq!(executor.executions().len(), 3);
        assert!(executor.restore_state(&a, Stage::MillRough).await.is_ok());
        assert!(executor.capture_state(&a, Stage::MillRough).await.is_ok());
        assert_eq!(executor.restores().len(), 1);
        assert_eq!(executor.captures().len(), 1);
    }

    #[tokio::test]
    async fn test_scripted_confirmer_queue_then_default() {
        let confirmer = ScriptedConfirmer::new(vec![false, true], true);
        assert!(!confirmer.ask("first?").await);
        assert!(confirmer.ask("second?").await);
        assert!(confirmer.ask("third?").await);
        assert_eq!(confirmer.asked().len(), 3);
    }
}
