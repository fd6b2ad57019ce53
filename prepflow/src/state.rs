//! The per-entity state machine and the lamella entity itself.

use crate::errors::{InvalidRevertError, PrepflowError, StageNotInMethodError, StageSequenceError};
use crate::graph::StageGraph;
use crate::method::Method;
use crate::stage::{Stage, StageRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Live state of one entity walking a method's stage path.
///
/// Invariants:
/// - `current_stage` is always on the assigned method's path.
/// - `history` is append-only; reverts append a fresh copy of an old
///   record, they never delete.
/// - a record's `completed_at` is set iff that stage was fully executed
///   at least once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LamellaState {
    current_stage: Stage,
    records: BTreeMap<Stage, StageRecord>,
    history: Vec<StageRecord>,
    is_failure: bool,
    #[serde(default)]
    failure_note: String,
    failure_at: Option<DateTime<Utc>>,
}

impl LamellaState {
    /// Creates the initial state for `method`: at `Created`, with the
    /// creation itself recorded as complete bookkeeping.
    #[must_use]
    pub fn new(method: Method) -> Self {
        let first = StageGraph::ordered_stages(method)[0];
        let mut record = StageRecord::begin(first);
        record.complete();

        let mut records = BTreeMap::new();
        records.insert(first, record);

        Self {
            current_stage: first,
            records,
            history: Vec::new(),
            is_failure: false,
            failure_note: String::new(),
            failure_at: None,
        }
    }

    /// Creates a state positioned at `stage` with every stage up to and
    /// including it marked complete, and no execution history.
    ///
    /// Models an entity whose earlier steps happened outside this engine,
    /// e.g. a position marked ready by the operator in the viewer.
    pub fn resumed_at(method: Method, stage: Stage) -> Result<Self, StageNotInMethodError> {
        let pos = StageGraph::position(method, stage)?;
        let mut records = BTreeMap::new();
        for &done in &StageGraph::ordered_stages(method)[..=pos] {
            let mut record = StageRecord::begin(done);
            record.complete();
            records.insert(done, record);
        }

        Ok(Self {
            current_stage: stage,
            records,
            history: Vec::new(),
            is_failure: false,
            failure_note: String::new(),
            failure_at: None,
        })
    }

    /// The stage the entity is currently at.
    #[must_use]
    pub fn current_stage(&self) -> Stage {
        self.current_stage
    }

    /// Per-stage completion records, keyed by stage.
    #[must_use]
    pub fn records(&self) -> &BTreeMap<Stage, StageRecord> {
        &self.records
    }

    /// The record for `stage`, if the entity ever reached it.
    #[must_use]
    pub fn record(&self, stage: Stage) -> Option<&StageRecord> {
        self.records.get(&stage)
    }

    /// Returns true once `stage` has been fully executed at least once.
    #[must_use]
    pub fn stage_completed(&self, stage: Stage) -> bool {
        self.record(stage).is_some_and(StageRecord::is_completed)
    }

    /// The append-only audit trail of completed stage executions.
    #[must_use]
    pub fn history(&self) -> &[StageRecord] {
        &self.history
    }

    /// Whether the entity is flagged failed and excluded from scheduling.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.is_failure
    }

    /// The operator note attached to the failure flag.
    #[must_use]
    pub fn failure_note(&self) -> &str {
        &self.failure_note
    }

    /// When the entity was flagged failed.
    #[must_use]
    pub fn failure_at(&self) -> Option<DateTime<Utc>> {
        self.failure_at
    }

    /// Returns true if advancing to `stage` should restore the saved
    /// environment first, i.e. the preceding stage was already completed
    /// and there is a snapshot to return to.
    pub fn requires_restore(
        &self,
        method: Method,
        stage: Stage,
    ) -> Result<bool, StageNotInMethodError> {
        let prev = StageGraph::get_previous(method, stage)?;
        Ok(prev != stage && self.stage_completed(prev))
    }

    /// Moves the entity to `next`.
    ///
    /// Accepted transitions: exactly one step forward on the method's
    /// path, or re-entering the current stage while its record is still
    /// uncompleted (the resume contract — an interrupted stage is
    /// re-attempted, not rolled back). At `Finished` this is a no-op
    /// until the entity is explicitly reverted. Anything else is a
    /// [`StageSequenceError`].
    pub fn advance(&mut self, method: Method, next: Stage) -> Result<(), PrepflowError> {
        if self.current_stage.is_terminal() {
            return Ok(());
        }

        if next == self.current_stage {
            if !self.stage_completed(next) {
                self.records.insert(next, StageRecord::begin(next));
                return Ok(());
            }
            let expected = StageGraph::get_next(method, self.current_stage)?;
            return Err(StageSequenceError::new(self.current_stage, next, expected).into());
        }

        let expected = StageGraph::get_next(method, self.current_stage)?;
        if expected != Some(next) {
            return Err(StageSequenceError::new(self.current_stage, next, expected).into());
        }

        self.current_stage = next;
        self.records.insert(next, StageRecord::begin(next));
        Ok(())
    }

    /// Stamps the current stage's record as completed and appends a copy
    /// to the history.
    pub fn complete_current(&mut self) {
        let record = self
            .records
            .entry(self.current_stage)
            .or_insert_with(|| StageRecord::begin(self.current_stage));
        record.complete();
        self.history.push(record.clone());
    }

    /// Reverts the entity to a stage strictly before the current one.
    ///
    /// The most recent history entry for `stage` is copied with a fresh
    /// start time (its completion stamp is kept so a later advance still
    /// restores from its snapshot) and appended to the history. Nothing
    /// is ever deleted.
    pub fn revert_to(&mut self, method: Method, stage: Stage) -> Result<(), PrepflowError> {
        let target_pos = StageGraph::position(method, stage)?;
        let current_pos = StageGraph::position(method, self.current_stage)?;
        if target_pos >= current_pos {
            return Err(InvalidRevertError::not_behind(stage, self.current_stage).into());
        }

        let mut record = self
            .history
            .iter()
            .rev()
            .find(|r| r.stage == stage)
            .cloned()
            .ok_or_else(|| InvalidRevertError::never_reached(stage, self.current_stage))?;
        record.started_at = Utc::now();

        self.current_stage = stage;
        self.records.insert(stage, record.clone());
        self.history.push(record);
        Ok(())
    }

    /// Flags the entity as failed. Idempotent; the first failure time is
    /// kept, the note reflects the latest call.
    pub fn mark_failure(&mut self, note: impl Into<String>) {
        if !self.is_failure {
            self.is_failure = true;
            self.failure_at = Some(Utc::now());
        }
        self.failure_note = note.into();
    }

    /// Clears the failure flag, returning the entity to scheduling.
    /// Idempotent.
    pub fn clear_failure(&mut self) {
        self.is_failure = false;
        self.failure_note.clear();
        self.failure_at = None;
    }
}

/// One sample instance being tracked through the pipeline.
///
/// The artifact `path` and the `protocol` payload are opaque to the
/// engine; both are carried for the executor, never interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lamella {
    id: Uuid,
    name: String,
    path: String,
    #[serde(default)]
    protocol: serde_json::Value,
    /// The entity's live state machine.
    pub state: LamellaState,
}

impl Lamella {
    /// Creates a new entity at the method's first stage.
    #[must_use]
    pub fn new(name: impl Into<String>, path: impl Into<String>, method: Method) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            path: path.into(),
            protocol: serde_json::Value::Null,
            state: LamellaState::new(method),
        }
    }

    /// Attaches an opaque protocol payload (per-stage parameters for the
    /// executor).
    #[must_use]
    pub fn with_protocol(mut self, protocol: serde_json::Value) -> Self {
        self.protocol = protocol;
        self
    }

    /// The entity's unique identifier.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The entity's human-readable name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Filesystem handle for the entity's artifacts.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The opaque protocol payload.
    #[must_use]
    pub fn protocol(&self) -> &serde_json::Value {
        &self.protocol
    }
}
