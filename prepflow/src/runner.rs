//! The workflow runner: schedules stages across an experiment's entities.
//!
//! One physical instrument means strictly sequential execution — one
//! entity's stage at a time. Two disciplines share a single-stage
//! execution protocol:
//!
//! - **Batch-barrier** for trench-style stages: every eligible entity
//!   attempts stage N before any entity proceeds to stage N+1.
//! - **Sequential-pipeline** once entities are independent: one entity
//!   runs through its remaining stages before the next entity starts.

use crate::cancellation::CancellationToken;
use crate::contracts::{Confirmer, StageExecutor};
use crate::errors::PrepflowError;
use crate::events::{EventSink, NoOpEventSink};
use crate::experiment::Experiment;
use crate::graph::StageGraph;
use crate::method::Method;
use crate::stage::Stage;
use crate::state::LamellaState;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

/// Per-stage supervision requirements.
///
/// A supervised stage asks the confirmer before execution; a negative
/// answer defers the entity for the remainder of the run. Stages absent
/// from the map are unsupervised.
#[derive(Debug, Clone, Default)]
pub struct SupervisionMap {
    required: HashMap<Stage, bool>,
}

impl SupervisionMap {
    /// No stage requires confirmation.
    #[must_use]
    pub fn unsupervised() -> Self {
        Self::default()
    }

    /// Every listed stage requires confirmation.
    #[must_use]
    pub fn supervised(stages: &[Stage]) -> Self {
        Self {
            required: stages.iter().map(|&s| (s, true)).collect(),
        }
    }

    /// Sets the supervision flag for one stage.
    #[must_use]
    pub fn with_stage(mut self, stage: Stage, required: bool) -> Self {
        self.required.insert(stage, required);
        self
    }

    /// Whether `stage` requires a confirmation gate.
    #[must_use]
    pub fn requires(&self, stage: Stage) -> bool {
        self.required.get(&stage).copied().unwrap_or(false)
    }
}

/// Summary of one `run` call.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    /// Stage executions attempted (executor invoked).
    pub stages_attempted: usize,
    /// Stage executions that completed and were persisted.
    pub stages_completed: usize,
    /// Entities auto-failed by a fatal executor error during this run.
    pub entities_failed: usize,
    /// Entities deferred for the rest of the run by a declined gate.
    pub entities_deferred: usize,
    /// Entities swept to `Finished` at the end of the run.
    pub entities_finished: usize,
    /// Whether the run stopped on the cooperative abort flag.
    pub cancelled: bool,
    /// The abort reason, if cancelled.
    pub cancel_reason: Option<String>,
    /// Total wall-clock time of the run in milliseconds.
    pub duration_ms: f64,
}

/// Outcome of one single-stage execution attempt.
enum StageOutcome {
    /// The stage completed and was persisted.
    Completed,
    /// The operator declined the supervision gate.
    Declined,
    /// The stage failed recoverably; the entity stays retryable at the
    /// uncompleted stage.
    Retryable,
    /// The executor signalled an unrecoverable condition; the entity was
    /// marked failed.
    Failed,
    /// The abort flag was observed; stop all scheduling.
    Aborted,
}

/// The scheduler. Borrows an experiment for the duration of a run and
/// returns it, possibly mutated, to the caller.
pub struct WorkflowRunner {
    executor: Arc<dyn StageExecutor>,
    confirmer: Arc<dyn Confirmer>,
    events: Arc<dyn EventSink>,
    cancel: Arc<CancellationToken>,
}

impl WorkflowRunner {
    /// Creates a runner around the injected collaborators.
    #[must_use]
    pub fn new(executor: Arc<dyn StageExecutor>, confirmer: Arc<dyn Confirmer>) -> Self {
        Self {
            executor,
            confirmer,
            events: Arc::new(NoOpEventSink),
            cancel: CancellationToken::new(),
        }
    }

    /// Sets the event sink progress is reported through.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Uses an externally owned cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: Arc<CancellationToken>) -> Self {
        self.cancel = cancel;
        self
    }

    /// The token that aborts this runner.
    #[must_use]
    pub fn cancellation(&self) -> Arc<CancellationToken> {
        Arc::clone(&self.cancel)
    }

    /// Runs `stages_to_complete` across all non-failed entities of the
    /// experiment.
    ///
    /// Batch-barrier stages of the experiment's method are processed
    /// first, stage by stage across all entities; everything else runs
    /// entity by entity. The experiment is persisted after every stage
    /// transition, so an interrupted run loses at most the in-flight
    /// stage. Entity-scoped failures are isolated; persistence failures
    /// abort the run.
    pub async fn run(
        &self,
        experiment: &mut Experiment,
        stages_to_complete: &[Stage],
        supervision: &SupervisionMap,
    ) -> Result<RunReport, PrepflowError> {
        let method = experiment.method();
        for &stage in stages_to_complete {
            StageGraph::position(method, stage)?;
        }

        let start = Instant::now();
        let mut report = RunReport::default();
        let mut deferred: HashSet<Uuid> = HashSet::new();

        info!(
            experiment = experiment.name(),
            %method,
            stages = ?stages_to_complete,
            "workflow run started"
        );
        self.events.try_emit(
            "run.started",
            Some(serde_json::json!({
                "experiment": experiment.name(),
                "method": method.to_string(),
                "stages": stages_to_complete.iter().map(ToString::to_string).collect::<Vec<_>>(),
            })),
        );

        let batch_stages: Vec<Stage> = stages_to_complete
            .iter()
            .copied()
            .filter(|&s| method.uses_batch_barrier(s))
            .collect();

        // Batch-barrier discipline: all entities attempt stage N before
        // any entity sees stage N+1.
        for &stage in &batch_stages {
            for index in 0..experiment.len() {
                let entity = &experiment.positions()[index];
                if entity.state.is_failure() || deferred.contains(&entity.id()) {
                    continue;
                }
                if next_eligible(&entity.state, method)? != Some(stage) {
                    continue;
                }
                let id = entity.id();
                match self
                    .attempt_stage(experiment, index, stage, supervision, &mut report)
                    .await?
                {
                    StageOutcome::Declined => {
                        deferred.insert(id);
                        report.entities_deferred += 1;
                    }
                    StageOutcome::Aborted => {
                        return Ok(self.finish_cancelled(report, start));
                    }
                    StageOutcome::Completed
                    | StageOutcome::Retryable
                    | StageOutcome::Failed => {}
                }
            }
        }

        // Sequential-pipeline discipline: one entity runs through its
        // remaining stages before the next entity starts.
        for index in 0..experiment.len() {
            loop {
                let entity = &experiment.positions()[index];
                if entity.state.is_failure() || deferred.contains(&entity.id()) {
                    break;
                }
                let Some(next) = next_eligible(&entity.state, method)? else {
                    break;
                };
                // The terminal transition belongs to the sweep below,
                // never to the executor.
                if next.is_terminal()
                    || !stages_to_complete.contains(&next)
                    || method.uses_batch_barrier(next)
                {
                    break;
                }
                let id = entity.id();
                match self
                    .attempt_stage(experiment, index, next, supervision, &mut report)
                    .await?
                {
                    StageOutcome::Completed => {}
                    StageOutcome::Declined => {
                        deferred.insert(id);
                        report.entities_deferred += 1;
                        break;
                    }
                    StageOutcome::Retryable | StageOutcome::Failed => break,
                    StageOutcome::Aborted => {
                        return Ok(self.finish_cancelled(report, start));
                    }
                }
            }
        }

        // Terminal sweep: entities that completed the last real stage
        // move to Finished without the executor; pure bookkeeping.
        let last_real = StageGraph::last_real_stage(method);
        let mut swept = false;
        for index in 0..experiment.len() {
            let entity = &experiment.positions()[index];
            if entity.state.is_failure()
                || entity.state.current_stage() != last_real
                || !entity.state.stage_completed(last_real)
            {
                continue;
            }
            let name = entity.name().to_string();
            let lamella = experiment
                .position_mut(index)
                .ok_or_else(|| PrepflowError::Internal("entity index out of range".to_string()))?;
            lamella.state.advance(method, Stage::Finished)?;
            swept = true;
            report.entities_finished += 1;
            info!(entity = %name, "entity finished");
            self.events
                .try_emit("lamella.finished", Some(serde_json::json!({"entity": name})));
        }
        if swept {
            experiment.save()?;
        }

        report.duration_ms = start.elapsed().as_secs_f64() * 1000.0;
        info!(
            stages_completed = report.stages_completed,
            entities_finished = report.entities_finished,
            "workflow run finished"
        );
        self.events.try_emit(
            "run.finished",
            Some(serde_json::json!({
                "stages_completed": report.stages_completed,
                "entities_finished": report.entities_finished,
            })),
        );
        Ok(report)
    }

    /// The single-stage execution protocol shared by both disciplines:
    /// supervision gate, abort check, advance (with restore), execute,
    /// complete, persist.
    async fn attempt_stage(
        &self,
        experiment: &mut Experiment,
        index: usize,
        stage: Stage,
        supervision: &SupervisionMap,
        report: &mut RunReport,
    ) -> Result<StageOutcome, PrepflowError> {
        let method = experiment.method();
        let name = experiment.positions()[index].name().to_string();

        if supervision.requires(stage) {
            let question = format!("Proceed with '{stage}' for '{name}'?");
            if !self.confirmer.ask(&question).await {
                info!(entity = %name, %stage, "operator declined; entity deferred for this run");
                self.events.try_emit(
                    "stage.skipped",
                    Some(serde_json::json!({"entity": name, "stage": stage.to_string()})),
                );
                return Ok(StageOutcome::Declined);
            }
        }

        if self.cancel.is_cancelled() {
            return Ok(StageOutcome::Aborted);
        }

        let lamella = experiment
            .position_mut(index)
            .ok_or_else(|| PrepflowError::Internal("entity index out of range".to_string()))?;
        let needs_restore = lamella.state.requires_restore(method, stage)?;
        lamella.state.advance(method, stage)?;
        // Persist the in-flight marker: a crash from here on resumes by
        // re-attempting this exact stage.
        experiment.save()?;

        self.events.try_emit(
            "stage.started",
            Some(serde_json::json!({"entity": name, "stage": stage.to_string()})),
        );

        if needs_restore {
            let lamella = &experiment.positions()[index];
            if let Err(err) = self.executor.restore_state(lamella, stage).await {
                warn!(entity = %name, %stage, error = %err, "restore failed; entity left retryable");
                self.events.try_emit(
                    "stage.failed",
                    Some(serde_json::json!({
                        "entity": name,
                        "stage": stage.to_string(),
                        "error": err.to_string(),
                        "kind": "restore",
                    })),
                );
                return Ok(StageOutcome::Retryable);
            }
        }

        report.stages_attempted += 1;
        let stage_start = Instant::now();
        let result = self.executor.execute(&experiment.positions()[index], stage).await;
        let stage_ms = stage_start.elapsed().as_secs_f64() * 1000.0;

        match result {
            Ok(()) => {
                if let Err(err) = self
                    .executor
                    .capture_state(&experiment.positions()[index], stage)
                    .await
                {
                    // The stage itself succeeded; a missing snapshot only
                    // means the next restore falls back to the previous one.
                    warn!(entity = %name, %stage, error = %err, "state capture failed");
                }
                let lamella = experiment
                    .position_mut(index)
                    .ok_or_else(|| PrepflowError::Internal("entity index out of range".to_string()))?;
                lamella.state.complete_current();
                experiment.save()?;

                report.stages_completed += 1;
                info!(entity = %name, %stage, duration_ms = stage_ms, "stage completed");
                self.events.try_emit(
                    "stage.completed",
                    Some(serde_json::json!({
                        "entity": name,
                        "stage": stage.to_string(),
                        "duration_ms": stage_ms,
                    })),
                );
                Ok(StageOutcome::Completed)
            }
            Err(err) if err.is_fatal() => {
                let reason = err.reason().to_string();
                let lamella = experiment
                    .position_mut(index)
                    .ok_or_else(|| PrepflowError::Internal("entity index out of range".to_string()))?;
                lamella.state.mark_failure(&reason);
                experiment.save()?;

                report.entities_failed += 1;
                warn!(entity = %name, %stage, error = %reason, "fatal executor error; entity marked failed");
                self.events.try_emit(
                    "lamella.failed",
                    Some(serde_json::json!({
                        "entity": name,
                        "stage": stage.to_string(),
                        "error": reason,
                    })),
                );
                Ok(StageOutcome::Failed)
            }
            Err(err) => {
                warn!(entity = %name, %stage, error = %err, "stage failed; entity left retryable");
                self.events.try_emit(
                    "stage.failed",
                    Some(serde_json::json!({
                        "entity": name,
                        "stage": stage.to_string(),
                        "error": err.to_string(),
                        "kind": "execution",
                    })),
                );
                Ok(StageOutcome::Retryable)
            }
        }
    }

    fn finish_cancelled(&self, mut report: RunReport, start: Instant) -> RunReport {
        report.cancelled = true;
        report.cancel_reason = self.cancel.reason();
        report.duration_ms = start.elapsed().as_secs_f64() * 1000.0;
        info!(reason = ?report.cancel_reason, "workflow run cancelled");
        self.events.try_emit(
            "run.cancelled",
            Some(serde_json::json!({"reason": report.cancel_reason})),
        );
        report
    }
}

/// The stage the entity should execute next: its current stage while that
/// is still uncompleted (the resume contract), otherwise the stage after
/// it on the method's path. `None` once finished.
fn next_eligible(state: &LamellaState, method: Method) -> Result<Option<Stage>, PrepflowError> {
    let current = state.current_stage();
    if current.is_terminal() {
        return Ok(None);
    }
    if let Some(record) = state.record(current) {
        if !record.is_completed() {
            return Ok(Some(current));
        }
    }
    Ok(StageGraph::get_next(method, current)?)
}
