//! The experiment aggregate: the durable, ordered collection of entities.

use crate::errors::{CorruptExperimentError, DuplicateNameError, PrepflowError};
use crate::graph::StageGraph;
use crate::method::Method;
use crate::stage::Stage;
use crate::state::Lamella;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

/// The aggregate root: a method, metadata, and an ordered entity list.
///
/// Insertion order of the entity list is significant and preserved
/// across save/load. The experiment must be persisted after every
/// scheduling-relevant mutation; the runner saves after every single
/// stage transition so an interrupted run loses at most the in-flight
/// stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    id: Uuid,
    name: String,
    created_at: DateTime<Utc>,
    method: Method,
    positions: Vec<Lamella>,
    #[serde(skip)]
    path: Option<PathBuf>,
}

impl Experiment {
    /// Creates an empty experiment for `method`.
    #[must_use]
    pub fn new(name: impl Into<String>, method: Method) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            created_at: Utc::now(),
            method,
            positions: Vec::new(),
            path: None,
        }
    }

    /// Sets the document path that [`save`](Self::save) writes to.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// The experiment's unique identifier.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The experiment's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// When the experiment was created.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// The method all entities in this experiment follow.
    #[must_use]
    pub fn method(&self) -> Method {
        self.method
    }

    /// The ordered entity list.
    #[must_use]
    pub fn positions(&self) -> &[Lamella] {
        &self.positions
    }

    /// Mutable access to one entity by list index.
    pub fn position_mut(&mut self, index: usize) -> Option<&mut Lamella> {
        self.positions.get_mut(index)
    }

    /// Number of entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Returns true if the experiment has no entities.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Appends an entity to the ordered list.
    ///
    /// Names must be unique within the experiment.
    pub fn append(&mut self, lamella: Lamella) -> Result<(), DuplicateNameError> {
        if self.positions.iter().any(|l| l.name() == lamella.name()) {
            return Err(DuplicateNameError::new(lamella.name()));
        }
        self.positions.push(lamella);
        Ok(())
    }

    /// Removes and returns the entity at `index`. Identifiers of the
    /// remaining entities are untouched.
    pub fn remove(&mut self, index: usize) -> Option<Lamella> {
        if index < self.positions.len() {
            Some(self.positions.remove(index))
        } else {
            None
        }
    }

    /// Serializes the full aggregate to its configured path, atomically:
    /// the document is written to a temporary file and renamed over the
    /// previous copy, so a crash mid-write never corrupts the last good
    /// version.
    pub fn save(&self) -> Result<(), PrepflowError> {
        let path = self
            .path
            .as_ref()
            .ok_or_else(|| PrepflowError::Persistence("no save path configured".to_string()))?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp = path.with_extension("tmp");
        let data = serde_json::to_vec_pretty(self)?;
        fs::write(&tmp, data)?;
        fs::rename(&tmp, path)?;
        debug!(path = %path.display(), entities = self.positions.len(), "experiment saved");
        Ok(())
    }

    /// Loads an experiment document and validates its structural
    /// invariants against the recorded method.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PrepflowError> {
        let path = path.as_ref();
        let data = fs::read_to_string(path)?;
        let mut experiment: Self = serde_json::from_str(&data)?;
        experiment.path = Some(path.to_path_buf());
        experiment.validate()?;
        Ok(experiment)
    }

    fn validate(&self) -> Result<(), CorruptExperimentError> {
        let mut names = HashSet::new();
        for lamella in &self.positions {
            if !names.insert(lamella.name()) {
                return Err(CorruptExperimentError::new(format!(
                    "duplicate entity name '{}'",
                    lamella.name()
                )));
            }

            let current = lamella.state.current_stage();
            if !StageGraph::contains(self.method, current) {
                return Err(CorruptExperimentError::new(format!(
                    "entity '{}' is at stage '{current}' which the '{}' method does not recognize",
                    lamella.name(),
                    self.method,
                )));
            }

            for stage in lamella.state.records().keys() {
                if !StageGraph::contains(self.method, *stage) {
                    return Err(CorruptExperimentError::new(format!(
                        "entity '{}' has a record for stage '{stage}' outside the '{}' method",
                        lamella.name(),
                        self.method,
                    )));
                }
            }

            for record in lamella.state.history() {
                if !StageGraph::contains(self.method, record.stage) {
                    return Err(CorruptExperimentError::new(format!(
                        "entity '{}' has history for stage '{}' outside the '{}' method",
                        lamella.name(),
                        record.stage,
                        self.method,
                    )));
                }
            }
        }
        Ok(())
    }

    /// Entities currently at `stage`.
    #[must_use]
    pub fn at_stage(&self, stage: Stage) -> Vec<&Lamella> {
        self.positions
            .iter()
            .filter(|l| l.state.current_stage() == stage)
            .collect()
    }

    /// Entities flagged as failed.
    #[must_use]
    pub fn at_failure(&self) -> Vec<&Lamella> {
        self.positions
            .iter()
            .filter(|l| l.state.is_failure())
            .collect()
    }

    /// Per-stage entity counts, for operator display.
    #[must_use]
    pub fn summary(&self) -> BTreeMap<Stage, usize> {
        let mut counts = BTreeMap::new();
        for lamella in &self.positions {
            *counts.entry(lamella.state.current_stage()).or_insert(0) += 1;
        }
        counts
    }

    /// Estimates the remaining wall-clock time: for every non-failed,
    /// non-finished entity, the mean historical duration of each stage
    /// it has not yet completed, summed. Stages with no history
    /// contribute nothing.
    #[must_use]
    pub fn estimate_remaining_time(&self) -> Duration {
        let mut totals: HashMap<Stage, (Duration, u32)> = HashMap::new();
        for lamella in &self.positions {
            for record in lamella.state.history() {
                if let Some(duration) = record.duration() {
                    let entry = totals
                        .entry(record.stage)
                        .or_insert((Duration::zero(), 0));
                    entry.0 = entry.0 + duration;
                    entry.1 += 1;
                }
            }
        }
        let means: HashMap<Stage, Duration> = totals
            .into_iter()
            .map(|(stage, (total, count))| (stage, total / i32::try_from(count).unwrap_or(i32::MAX)))
            .collect();

        let path = StageGraph::ordered_stages(self.method);
        let mut remaining = Duration::zero();
        for lamella in &self.positions {
            let state = &lamella.state;
            if state.is_failure() || state.current_stage().is_terminal() {
                continue;
            }
            for &stage in path {
                if stage.is_terminal() || state.stage_completed(stage) {
                    continue;
                }
                if let Some(mean) = means.get(&stage) {
                    remaining = remaining + *mean;
                }
            }
        }
        remaining
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::LamellaState;
    use pretty_assertions::assert_eq;

    fn lamella(name: &str, method: Method) -> Lamella {
        Lamella::new(name, format!("/data/{name}"), method)
    }

    #[test]
    fn test_append_rejects_duplicate_names() {
        let mut experiment = Experiment::new("exp-01", Method::OnGrid);
        experiment.append(lamella("lamella-01", Method::OnGrid)).unwrap();

        let err = experiment
            .append(lamella("lamella-01", Method::OnGrid))
            .unwrap_err();
        assert_eq!(err.name, "lamella-01");
        assert_eq!(experiment.len(), 1);
    }

    #[test]
    fn test_remove_preserves_other_identifiers() {
        let mut experiment = Experiment::new("exp-01", Method::OnGrid);
        experiment.append(lamella("a", Method::OnGrid)).unwrap();
        experiment.append(lamella("b", Method::OnGrid)).unwrap();
        let id_b = experiment.positions()[1].id();

        let removed = experiment.remove(0).unwrap();
        assert_eq!(removed.name(), "a");
        assert_eq!(experiment.positions()[0].id(), id_b);
        assert!(experiment.remove(5).is_none());
    }

    #[test]
    fn test_save_load_round_trip_is_structurally_equal() {
        let dir = tempfile::tempdir().unwrap();
        let doc = dir.path().join("experiment.json");

        let mut experiment =
            Experiment::new("exp-01", Method::Trench).with_path(&doc);
        let mut entity = lamella("lamella-01", Method::Trench);
        entity.state.advance(Method::Trench, Stage::PositionReady).unwrap();
        entity.state.complete_current();
        experiment.append(entity).unwrap();
        experiment.save().unwrap();

        let loaded = Experiment::load(&doc).unwrap();
        assert_eq!(loaded.id(), experiment.id());
        assert_eq!(loaded.method(), Method::Trench);
        assert_eq!(loaded.positions().len(), 1);
        assert_eq!(
            loaded.positions()[0].state,
            experiment.positions()[0].state
        );
    }

    #[test]
    fn test_save_replaces_previous_copy_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let doc = dir.path().join("experiment.json");

        let mut experiment = Experiment::new("exp-01", Method::OnGrid).with_path(&doc);
        experiment.save().unwrap();
        experiment.append(lamella("a", Method::OnGrid)).unwrap();
        experiment.save().unwrap();

        // No stale temporary file is left behind.
        assert!(!doc.with_extension("tmp").exists());
        assert_eq!(Experiment::load(&doc).unwrap().len(), 1);
    }

    #[test]
    fn test_save_without_path_is_an_error() {
        let experiment = Experiment::new("exp-01", Method::OnGrid);
        assert!(matches!(
            experiment.save(),
            Err(PrepflowError::Persistence(_))
        ));
    }

    #[test]
    fn test_load_rejects_history_from_incompatible_method() {
        let dir = tempfile::tempdir().unwrap();
        let doc = dir.path().join("experiment.json");

        // Build a liftout experiment whose entity has trench history,
        // then rewrite the document claiming the on-grid method. The
        // loader must surface this, not silently coerce.
        let mut experiment = Experiment::new("exp-01", Method::Trench).with_path(&doc);
        let mut entity = lamella("lamella-01", Method::Trench);
        entity.state = LamellaState::resumed_at(Method::Trench, Stage::MillTrench).unwrap();
        experiment.append(entity).unwrap();
        experiment.save().unwrap();

        let text = std::fs::read_to_string(&doc)
            .unwrap()
            .replace(r#""method": "trench""#, r#""method": "on_grid""#);
        std::fs::write(&doc, text).unwrap();

        let err = Experiment::load(&doc).unwrap_err();
        assert!(matches!(err, PrepflowError::Corrupt(_)));
    }

    #[test]
    fn test_queries() {
        let mut experiment = Experiment::new("exp-01", Method::OnGrid);
        let mut a = lamella("a", Method::OnGrid);
        a.state = LamellaState::resumed_at(Method::OnGrid, Stage::MillRough).unwrap();
        let mut b = lamella("b", Method::OnGrid);
        b.state.mark_failure("broken");
        experiment.append(a).unwrap();
        experiment.append(b).unwrap();

        assert_eq!(experiment.at_stage(Stage::MillRough).len(), 1);
        assert_eq!(experiment.at_stage(Stage::Created).len(), 1);
        assert_eq!(experiment.at_failure().len(), 1);

        let summary = experiment.summary();
        assert_eq!(summary.get(&Stage::MillRough), Some(&1));
        assert_eq!(summary.get(&Stage::Created), Some(&1));
    }

    /// A finished entity whose history carries exact stage durations.
    fn finished_with_history(name: &str, minutes: &[(Stage, i64)]) -> Lamella {
        use chrono::TimeZone;

        let base = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
        let history: Vec<serde_json::Value> = minutes
            .iter()
            .map(|&(stage, m)| {
                serde_json::json!({
                    "stage": stage,
                    "started_at": base,
                    "completed_at": base + Duration::minutes(m),
                })
            })
            .collect();

        let mut entity = lamella(name, Method::OnGrid);
        entity.state = serde_json::from_value(serde_json::json!({
            "current_stage": Stage::Finished,
            "records": {},
            "history": history,
            "is_failure": false,
            "failure_at": null,
        }))
        .unwrap();
        entity
    }

    #[test]
    fn test_remaining_time_averages_history_and_skips_finished_and_failed() {
        let mut experiment = Experiment::new("exp-01", Method::OnGrid);

        // Two finished entities supply the statistics; the per-stage
        // means come out at 15, 30, 40 and 50 minutes.
        experiment
            .append(finished_with_history(
                "done-a",
                &[
                    (Stage::PositionReady, 10),
                    (Stage::SetupLamella, 20),
                    (Stage::MillRough, 30),
                    (Stage::MillPolishing, 40),
                ],
            ))
            .unwrap();
        experiment
            .append(finished_with_history(
                "done-b",
                &[
                    (Stage::PositionReady, 20),
                    (Stage::SetupLamella, 40),
                    (Stage::MillRough, 50),
                    (Stage::MillPolishing, 60),
                ],
            ))
            .unwrap();

        // Pending at setup owes the rough and polishing means.
        let mut pending = lamella("pending", Method::OnGrid);
        pending.state = LamellaState::resumed_at(Method::OnGrid, Stage::SetupLamella).unwrap();
        experiment.append(pending).unwrap();

        // A fresh entity owes every real stage past creation.
        experiment.append(lamella("queued", Method::OnGrid)).unwrap();

        // A failed entity contributes nothing, whatever it still owes.
        let mut failed = lamella("failed", Method::OnGrid);
        failed.state.mark_failure("broken");
        experiment.append(failed).unwrap();

        // pending: 40 + 50; queued: 15 + 30 + 40 + 50. The finished
        // entities themselves owe nothing.
        assert_eq!(
            experiment.estimate_remaining_time(),
            Duration::minutes(90 + 135)
        );
    }

    #[test]
    fn test_remaining_time_is_zero_without_history() {
        let mut experiment = Experiment::new("exp-01", Method::OnGrid);
        experiment.append(lamella("a", Method::OnGrid)).unwrap();

        // Stages with no historical durations contribute nothing.
        assert_eq!(experiment.estimate_remaining_time(), Duration::zero());
    }
}
