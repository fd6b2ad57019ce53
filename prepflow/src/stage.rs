//! Stage identifiers and per-stage completion records.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One named step in a sample-preparation pipeline.
///
/// This is the shared superset of stage identifiers across all methods;
/// which stages apply, and in what order, is answered only by
/// [`StageGraph`](crate::graph::StageGraph) for a given method. Stages
/// carry no cross-method numeric ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// The entity exists but has no position yet.
    Created,
    /// A milling position has been selected and stored.
    PositionReady,
    /// Bulk trench milling around the target region.
    MillTrench,
    /// Undercut milling to release the chunk from the bulk.
    MillUndercut,
    /// Needle attach and lift-out of the chunk.
    Liftout,
    /// Landing of the chunk on the grid post.
    Landing,
    /// Alignment and pattern setup on the lamella face.
    SetupLamella,
    /// Rough thinning of the lamella.
    MillRough,
    /// Final polishing to electron transparency.
    MillPolishing,
    /// All preparation steps are done.
    Finished,
}

impl Stage {
    /// Returns true for the terminal stage.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::PositionReady => "position_ready",
            Self::MillTrench => "mill_trench",
            Self::MillUndercut => "mill_undercut",
            Self::Liftout => "liftout",
            Self::Landing => "landing",
            Self::SetupLamella => "setup_lamella",
            Self::MillRough => "mill_rough",
            Self::MillPolishing => "mill_polishing",
            Self::Finished => "finished",
        };
        write!(f, "{name}")
    }
}

/// Completion record for one stage of one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    /// The stage this record belongs to.
    pub stage: Stage,
    /// When work on the stage began.
    pub started_at: DateTime<Utc>,
    /// When the stage was fully executed; `None` while in flight.
    pub completed_at: Option<DateTime<Utc>>,
}

impl StageRecord {
    /// Starts a new record for `stage` with the clock at now.
    #[must_use]
    pub fn begin(stage: Stage) -> Self {
        Self {
            stage,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Stamps the completion time.
    pub fn complete(&mut self) {
        self.completed_at = Some(Utc::now());
    }

    /// Returns true once the stage has been fully executed.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }

    /// Wall-clock duration of the stage, if completed.
    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        self.completed_at.map(|done| done - self.started_at)
    }
}
