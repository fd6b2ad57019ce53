//! Preparation methods and their capability flags.

use crate::stage::Stage;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The pipeline variant an experiment runs under.
///
/// The method determines which stages apply and in what order (see
/// [`StageGraph`](crate::graph::StageGraph)) and which capability flags
/// hold for scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    /// Lamella milled directly in the bulk; no trench or lift-out.
    OnGrid,
    /// Trench-and-undercut preparation without lift-out.
    Trench,
    /// Full lift-out: trench, undercut, needle lift-out, landing.
    Liftout,
    /// Serial lift-out: trench and lift-out without a separate undercut.
    SerialLiftout,
}

impl Method {
    /// Returns true for methods that mill bulk trenches.
    #[must_use]
    pub fn is_trench_based(self) -> bool {
        matches!(self, Self::Trench | Self::Liftout | Self::SerialLiftout)
    }

    /// Returns true for methods that lift the chunk out of the bulk.
    #[must_use]
    pub fn is_liftout_based(self) -> bool {
        matches!(self, Self::Liftout | Self::SerialLiftout)
    }

    /// Returns true if `stage` is scheduled with the batch-barrier
    /// discipline under this method.
    ///
    /// Trench and undercut milling share the physical position queue, so
    /// every entity completes them before any entity proceeds further.
    /// All other stages run per entity, sequentially.
    #[must_use]
    pub fn uses_batch_barrier(self, stage: Stage) -> bool {
        self.is_trench_based() && matches!(stage, Stage::MillTrench | Stage::MillUndercut)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OnGrid => write!(f, "on_grid"),
            Self::Trench => write!(f, "trench"),
            Self::Liftout => write!(f, "liftout"),
            Self::SerialLiftout => write!(f, "serial_liftout"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_flags() {
        assert!(!Method::OnGrid.is_trench_based());
        assert!(Method::Trench.is_trench_based());
        assert!(Method::Liftout.is_trench_based());

        assert!(!Method::Trench.is_liftout_based());
        assert!(Method::SerialLiftout.is_liftout_based());
    }

    #[test]
    fn test_batch_barrier_classification() {
        assert!(Method::Trench.uses_batch_barrier(Stage::MillTrench));
        assert!(Method::Liftout.uses_batch_barrier(Stage::MillUndercut));
        assert!(!Method::Trench.uses_batch_barrier(Stage::MillRough));
        // On-grid has no batch stages at all.
        assert!(!Method::OnGrid.uses_batch_barrier(Stage::MillTrench));
    }

    #[test]
    fn test_method_serializes_snake_case() {
        let json = serde_json::to_string(&Method::SerialLiftout).unwrap();
        assert_eq!(json, r#""serial_liftout""#);
    }
}
