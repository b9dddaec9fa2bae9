//! Scratch data of one schedule application.

use crate::error::ScheduleError;
use std::collections::{BTreeMap, BTreeSet};
use tileforge_ir::{IterVarId, OpId};

/// Loop structure recorded while the primitives run, reset per `apply`.
///
/// Tile levels are ordered outer to inner; each level lists its axes outer to
/// inner.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulingState {
    pub inlined: BTreeSet<OpId>,
    /// Main op reduction levels; the reserved reduction axes form the last one.
    pub main_op_reduce_axis: Vec<Vec<IterVarId>>,
    /// Output op spatial levels; the reserved spatial axes form the last one.
    pub output_op_axis: Vec<Vec<IterVarId>>,
    pub last_op_axis: Vec<Vec<IterVarId>>,
    /// Axis at which each role-bearing op is tensorized.
    pub tensorize_iter: BTreeMap<OpId, IterVarId>,
}

fn level_axis(
    levels: &[Vec<IterVarId>],
    level: Option<usize>,
    axis: impl FnOnce(&[IterVarId]) -> Option<IterVarId>,
    op: &'static str,
    name: &'static str,
) -> Result<IterVarId, ScheduleError> {
    level
        .and_then(|index| levels.get(index))
        .and_then(|axes| axis(axes))
        .ok_or(ScheduleError::MissingTileLevel { op, level: name })
}

impl SchedulingState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Innermost axis of the outermost main reduction level.
    pub fn main_outermost_reduce_axis(&self) -> Result<IterVarId, ScheduleError> {
        level_axis(
            &self.main_op_reduce_axis,
            Some(0),
            |axes| axes.last().copied(),
            "main",
            "outermost reduction",
        )
    }

    /// Innermost axis of the second main reduction level, or of the first
    /// when there is only one.
    pub fn main_second_reduce_axis(&self) -> Result<IterVarId, ScheduleError> {
        if self.main_op_reduce_axis.len() > 1 {
            level_axis(
                &self.main_op_reduce_axis,
                Some(1),
                |axes| axes.last().copied(),
                "main",
                "second reduction",
            )
        } else {
            self.main_outermost_reduce_axis()
        }
    }

    /// Innermost axis of the third-innermost output level: the warp axis.
    pub fn output_warp_axis(&self) -> Result<IterVarId, ScheduleError> {
        level_axis(
            &self.output_op_axis,
            self.output_op_axis.len().checked_sub(3),
            |axes| axes.last().copied(),
            "output",
            "third innermost",
        )
    }

    pub fn output_outermost_axis(&self) -> Result<IterVarId, ScheduleError> {
        level_axis(
            &self.output_op_axis,
            Some(0),
            |axes| axes.last().copied(),
            "output",
            "outermost",
        )
    }

    /// Second-innermost axis of the last trailing-op level.
    pub fn last_second_innermost_axis(&self) -> Result<IterVarId, ScheduleError> {
        level_axis(
            &self.last_op_axis,
            self.last_op_axis.len().checked_sub(1),
            |axes| axes.len().checked_sub(2).map(|index| axes[index]),
            "last",
            "second innermost",
        )
    }

    pub fn last_outermost_axis(&self) -> Result<IterVarId, ScheduleError> {
        level_axis(
            &self.last_op_axis,
            Some(0),
            |axes| axes.first().copied(),
            "last",
            "outermost",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(range: std::ops::Range<usize>) -> Vec<IterVarId> {
        range.map(IterVarId).collect()
    }

    #[test]
    fn test_empty_state_reports_missing_levels() {
        let state = SchedulingState::new();
        assert!(matches!(
            state.main_outermost_reduce_axis(),
            Err(ScheduleError::MissingTileLevel { op: "main", .. })
        ));
        assert!(state.output_warp_axis().is_err());
        assert!(state.last_outermost_axis().is_err());
    }

    #[test]
    fn test_level_lookups() {
        let state = SchedulingState {
            main_op_reduce_axis: vec![ids(0..2), ids(2..4), ids(4..6), ids(6..7)],
            output_op_axis: vec![ids(10..11), ids(11..12), ids(12..14), ids(14..16)],
            last_op_axis: vec![ids(20..23)],
            ..SchedulingState::default()
        };
        assert_eq!(state.main_outermost_reduce_axis().unwrap(), IterVarId(1));
        assert_eq!(state.main_second_reduce_axis().unwrap(), IterVarId(3));
        assert_eq!(state.output_warp_axis().unwrap(), IterVarId(11));
        assert_eq!(state.output_outermost_axis().unwrap(), IterVarId(10));
        assert_eq!(state.last_second_innermost_axis().unwrap(), IterVarId(21));
        assert_eq!(state.last_outermost_axis().unwrap(), IterVarId(20));
    }

    #[test]
    fn test_second_reduce_level_falls_back() {
        let state = SchedulingState {
            main_op_reduce_axis: vec![ids(0..2)],
            ..SchedulingState::default()
        };
        assert_eq!(state.main_second_reduce_axis().unwrap(), IterVarId(1));
    }
}
