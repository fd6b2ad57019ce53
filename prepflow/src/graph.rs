//! Per-method stage graphs.
//!
//! A stage graph is a pure lookup table answering "what comes after/before
//! stage X" for one method. It is the only authority on stage ordering;
//! nothing else in the engine compares stages directly.

use crate::errors::StageNotInMethodError;
use crate::method::Method;
use crate::stage::Stage;

const ON_GRID: &[Stage] = &[
    Stage::Created,
    Stage::PositionReady,
    Stage::SetupLamella,
    Stage::MillRough,
    Stage::MillPolishing,
    Stage::Finished,
];

const TRENCH: &[Stage] = &[
    Stage::Created,
    Stage::PositionReady,
    Stage::MillTrench,
    Stage::MillUndercut,
    Stage::SetupLamella,
    Stage::MillRough,
    Stage::MillPolishing,
    Stage::Finished,
];

const LIFTOUT: &[Stage] = &[
    Stage::Created,
    Stage::PositionReady,
    Stage::MillTrench,
    Stage::MillUndercut,
    Stage::Liftout,
    Stage::Landing,
    Stage::SetupLamella,
    Stage::MillRough,
    Stage::MillPolishing,
    Stage::Finished,
];

const SERIAL_LIFTOUT: &[Stage] = &[
    Stage::Created,
    Stage::PositionReady,
    Stage::MillTrench,
    Stage::Liftout,
    Stage::Landing,
    Stage::SetupLamella,
    Stage::MillRough,
    Stage::MillPolishing,
    Stage::Finished,
];

/// Pure, side-effect-free stage lookup table per [`Method`].
pub struct StageGraph;

impl StageGraph {
    /// The canonical ordered stage path for `method`.
    #[must_use]
    pub fn ordered_stages(method: Method) -> &'static [Stage] {
        match method {
            Method::OnGrid => ON_GRID,
            Method::Trench => TRENCH,
            Method::Liftout => LIFTOUT,
            Method::SerialLiftout => SERIAL_LIFTOUT,
        }
    }

    /// Returns true if `stage` is part of `method`'s path.
    #[must_use]
    pub fn contains(method: Method, stage: Stage) -> bool {
        Self::ordered_stages(method).contains(&stage)
    }

    /// Index of `stage` on `method`'s path.
    pub fn position(method: Method, stage: Stage) -> Result<usize, StageNotInMethodError> {
        Self::ordered_stages(method)
            .iter()
            .position(|&s| s == stage)
            .ok_or_else(|| StageNotInMethodError::new(stage, method))
    }

    /// The stage immediately following `stage`, or `None` at the
    /// terminal stage.
    pub fn get_next(method: Method, stage: Stage) -> Result<Option<Stage>, StageNotInMethodError> {
        let path = Self::ordered_stages(method);
        let pos = Self::position(method, stage)?;
        Ok(path.get(pos + 1).copied())
    }

    /// The stage immediately preceding `stage`.
    ///
    /// At the first stage this is a stable fixed point: the stage itself
    /// is returned, not `None`. "Can't go further back" behaves like
    /// staying put, distinct from the forward direction's terminal.
    pub fn get_previous(method: Method, stage: Stage) -> Result<Stage, StageNotInMethodError> {
        let path = Self::ordered_stages(method);
        let pos = Self::position(method, stage)?;
        Ok(if pos == 0 { stage } else { path[pos - 1] })
    }

    /// The last stage before `Finished` on `method`'s path.
    #[must_use]
    pub fn last_real_stage(method: Method) -> Stage {
        let path = Self::ordered_stages(method);
        path[path.len() - 2]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_METHODS: &[Method] = &[
        Method::OnGrid,
        Method::Trench,
        Method::Liftout,
        Method::SerialLiftout,
    ];

    #[test]
    fn test_every_path_starts_created_and_ends_finished() {
        for &method in ALL_METHODS {
            let path = StageGraph::ordered_stages(method);
            assert_eq!(path.first(), Some(&Stage::Created), "{method}");
            assert_eq!(path.last(), Some(&Stage::Finished), "{method}");
        }
    }

    #[test]
    fn test_on_grid_skips_trench_and_liftout_stages() {
        assert!(!StageGraph::contains(Method::OnGrid, Stage::MillTrench));
        assert!(!StageGraph::contains(Method::OnGrid, Stage::MillUndercut));
        assert!(!StageGraph::contains(Method::OnGrid, Stage::Liftout));
        assert!(!StageGraph::contains(Method::OnGrid, Stage::Landing));
    }

    #[test]
    fn test_undercut_only_for_methods_that_mill_it() {
        assert!(StageGraph::contains(Method::Trench, Stage::MillUndercut));
        assert!(StageGraph::contains(Method::Liftout, Stage::MillUndercut));
        assert!(!StageGraph::contains(Method::SerialLiftout, Stage::MillUndercut));
    }

    #[test]
    fn test_next_of_previous_round_trips() {
        // For every stage past the first, get_next(get_previous(s)) == s.
        for &method in ALL_METHODS {
            let path = StageGraph::ordered_stages(method);
            for &stage in &path[1..] {
                let prev = StageGraph::get_previous(method, stage).unwrap();
                assert_eq!(StageGraph::get_next(method, prev).unwrap(), Some(stage));
            }
        }
    }

    #[test]
    fn test_previous_is_fixed_point_at_first_stage() {
        for &method in ALL_METHODS {
            assert_eq!(
                StageGraph::get_previous(method, Stage::Created).unwrap(),
                Stage::Created
            );
        }
    }

    #[test]
    fn test_next_is_none_at_terminal() {
        for &method in ALL_METHODS {
            assert_eq!(StageGraph::get_next(method, Stage::Finished).unwrap(), None);
        }
    }

    #[test]
    fn test_off_path_stage_is_rejected_not_coerced() {
        let err = StageGraph::get_next(Method::OnGrid, Stage::MillUndercut).unwrap_err();
        assert_eq!(err.stage, Stage::MillUndercut);
        assert_eq!(err.method, Method::OnGrid);

        assert!(StageGraph::get_previous(Method::OnGrid, Stage::MillTrench).is_err());
        assert!(StageGraph::position(Method::SerialLiftout, Stage::MillUndercut).is_err());
    }

    #[test]
    fn test_last_real_stage() {
        for &method in ALL_METHODS {
            assert_eq!(StageGraph::last_real_stage(method), Stage::MillPolishing);
        }
    }
}
