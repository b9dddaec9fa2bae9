//! Structural checks and the spliced compute context shared by the schedule
//! generator and applier.

use crate::error::ScheduleError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tileforge_intrinsics::{InstructionScope, IntrinMatchResult, OperationRole, Target};
use tileforge_ir::{ComputeGraph, OpId};
use tracing::debug;

/// Output of the compute transform stage: the graph to schedule and the
/// operation the recipe matched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformState {
    pub target_graph: ComputeGraph,
    pub main_op: OpId,
}

impl TransformState {
    pub fn new(target_graph: ComputeGraph, main_op: OpId) -> Self {
        Self {
            target_graph,
            main_op,
        }
    }
}

/// Per-operation recipe bookkeeping of the spliced graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipeStage {
    pub operation_role: BTreeMap<OpId, OperationRole>,
    pub capsule_key: BTreeMap<OpId, String>,
    pub reserve_inner_axis_count: BTreeMap<OpId, usize>,
    /// Indices of the main op's reduction axes kept for the instruction.
    pub main_op_reserve_reduce_axis: Vec<usize>,
    pub main_op_reserve_reduce_axis_factor: Vec<usize>,
    pub target: Target,
    pub recipe_name: String,
    pub compute_key: String,
    pub shape_key: String,
    pub scope: InstructionScope,
}

impl RecipeStage {
    pub fn role(&self, op: OpId) -> Option<OperationRole> {
        self.operation_role.get(&op).copied()
    }

    pub fn reserve_count(&self, op: OpId) -> usize {
        self.reserve_inner_axis_count.get(&op).copied().unwrap_or(0)
    }

    pub fn ops_with_role(&self, role: OperationRole) -> impl Iterator<Item = OpId> + '_ {
        self.operation_role
            .iter()
            .filter(move |(_, r)| **r == role)
            .map(|(op, _)| *op)
    }
}

/// The graph with the intrinsic sub-graph spliced in, plus role data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleComputeInfo {
    pub target_graph: ComputeGraph,
    pub main_op: OpId,
    pub output_op: OpId,
    pub main_position: usize,
    pub output_position: usize,
    pub recipe_stage: RecipeStage,
}

impl ScheduleComputeInfo {
    /// Splice the recipe's capsules in place of the main operation and assign
    /// operation roles.
    pub fn build(
        match_result: &IntrinMatchResult,
        transform_state: &TransformState,
    ) -> Result<Self, ScheduleError> {
        let target = check_schedulable(match_result, transform_state)?;
        let recipe = &match_result.recipe;
        let (ck, sk) = (
            match_result.compute_key.as_str(),
            match_result.shape_key.as_str(),
        );

        let mut graph = transform_state.target_graph.clone();
        let main = graph.op(transform_state.main_op)?.clone();
        let templates = recipe.build_subgraph(&main, &graph, ck, sk)?;
        let ids = graph.splice(main.id, templates)?;

        let dag = recipe.serialize_dag();
        let mut operation_role = BTreeMap::new();
        let mut capsule_key = BTreeMap::new();
        let mut reserve_inner_axis_count = BTreeMap::new();
        let mut main_op_reserve_reduce_axis = Vec::new();
        let mut main_op_reserve_reduce_axis_factor = Vec::new();
        let mut main_op = None;
        let mut output_op = None;

        for (name, op) in dag.order.iter().zip(&ids) {
            let reserve = recipe.reserve_axes(ck, sk, name)?;
            capsule_key.insert(*op, name.clone());
            reserve_inner_axis_count.insert(*op, reserve.spatial.len());

            let role = if !dag.reads_any(name) {
                Some(OperationRole::Load)
            } else if !dag.feeds_any(name) {
                Some(OperationRole::Output)
            } else if name == recipe.main_capsule() {
                Some(OperationRole::Main)
            } else {
                None
            };
            match role {
                Some(OperationRole::Output) => {
                    if output_op.replace(*op).is_some() {
                        return Err(ScheduleError::DuplicateRole(OperationRole::Output));
                    }
                }
                Some(OperationRole::Main) => {
                    main_op = Some(*op);
                    let reduce_count = graph.op(*op)?.reduce_axes.len();
                    let first = reduce_count.checked_sub(reserve.reduce.len()).ok_or_else(|| {
                        ScheduleError::ReservedAxesExceedRank {
                            op: name.clone(),
                            reserved: reserve.reduce.len(),
                            rank: reduce_count,
                        }
                    })?;
                    main_op_reserve_reduce_axis.extend(first..reduce_count);
                    main_op_reserve_reduce_axis_factor.extend(reserve.reduce.iter().copied());
                }
                _ => {}
            }
            if let Some(role) = role {
                operation_role.insert(*op, role);
            }
        }

        let main_op = main_op.ok_or(ScheduleError::MissingRole(OperationRole::Main))?;
        let output_op = output_op.ok_or(ScheduleError::MissingRole(OperationRole::Output))?;
        let main_position = graph
            .position(main_op)
            .ok_or(ScheduleError::MissingMainOp(main_op))?;
        let output_position = graph
            .position(output_op)
            .ok_or(ScheduleError::MissingRole(OperationRole::Output))?;
        if output_position <= main_position {
            return Err(ScheduleError::OutputBeforeMain);
        }

        debug!(
            recipe = recipe.name(),
            compute_key = ck,
            shape_key = sk,
            main_position,
            output_position,
            ops = graph.len(),
            "built schedule compute info"
        );

        Ok(Self {
            target_graph: graph,
            main_op,
            output_op,
            main_position,
            output_position,
            recipe_stage: RecipeStage {
                operation_role,
                capsule_key,
                reserve_inner_axis_count,
                main_op_reserve_reduce_axis,
                main_op_reserve_reduce_axis_factor,
                target,
                recipe_name: recipe.name().to_string(),
                compute_key: ck.to_string(),
                shape_key: sk.to_string(),
                scope: recipe.scope(),
            },
        })
    }

    pub fn role(&self, op: OpId) -> Option<OperationRole> {
        self.recipe_stage.role(op)
    }

    /// The graph-final operation.
    pub fn last_op(&self) -> Option<OpId> {
        self.target_graph.last_op()
    }
}

/// Reject graphs the scheduler cannot handle.
///
/// Only `cuda` recipes are schedulable, the main operation must be a live
/// compute operation, and it must be the only operation with reduction axes.
pub fn check_schedulable(
    match_result: &IntrinMatchResult,
    transform_state: &TransformState,
) -> Result<Target, ScheduleError> {
    let target: Target = match_result.recipe.target().parse()?;
    let graph = &transform_state.target_graph;
    let main = graph
        .get(transform_state.main_op)
        .ok_or(ScheduleError::MissingMainOp(transform_state.main_op))?;
    if !main.is_compute() {
        return Err(ScheduleError::MainNotCompute(main.name.clone()));
    }
    if let Some(extra) = graph
        .ops()
        .find(|op| op.id != main.id && op.has_reduction())
    {
        return Err(ScheduleError::ExtraReduction(extra.name.clone()));
    }
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{matmul_relu, wmma_match};
    use std::sync::Arc;
    use tileforge_intrinsics::{CapsuleSpec, Recipe, ReserveAxes};
    use tileforge_ir::{axis, DataType, GraphBuilder};

    #[test]
    fn test_build_assigns_roles() {
        let state = matmul_relu(8);
        let info = ScheduleComputeInfo::build(&wmma_match(), &state).unwrap();
        let names: Vec<&str> = info.target_graph.ops().map(|op| op.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["A", "B", "A_pad", "B_pad", "C.load_a", "C.load_b", "C.mma", "C.store", "D"]
        );
        assert_eq!(info.main_position, 6);
        assert_eq!(info.output_position, 7);

        let graph = &info.target_graph;
        let role = |name: &str| info.role(graph.find(name).unwrap());
        assert_eq!(role("C.load_a"), Some(OperationRole::Load));
        assert_eq!(role("C.load_b"), Some(OperationRole::Load));
        assert_eq!(role("C.mma"), Some(OperationRole::Main));
        assert_eq!(role("C.store"), Some(OperationRole::Output));
        assert_eq!(role("A_pad"), None);

        let stage = &info.recipe_stage;
        assert_eq!(stage.main_op_reserve_reduce_axis, vec![1]);
        assert_eq!(stage.main_op_reserve_reduce_axis_factor, vec![16]);
        assert_eq!(stage.reserve_count(info.output_op), 2);
        assert_eq!(stage.capsule_key[&info.main_op], "mma");

        let d = graph.find("D").unwrap();
        assert_eq!(graph.producers(d), &[info.output_op]);
        assert_eq!(info.last_op(), Some(d));
    }

    #[test]
    fn test_rejects_extra_reduction() {
        let mut state = matmul_relu(8);
        let mut builder = GraphBuilder::new();
        let a = builder.add_placeholder("A", &[4, 16], DataType::F16);
        let r = builder.add_reduction("R", vec![axis("i", 4)], vec![axis("k", 16)], &[a], DataType::F32);
        builder.add_reduction("S", vec![axis("i", 4)], vec![axis("k", 4)], &[r], DataType::F32);
        state.target_graph = builder.build().unwrap();
        state.main_op = r;
        let err = check_schedulable(&wmma_match(), &state).unwrap_err();
        assert!(matches!(err, ScheduleError::ExtraReduction(name) if name == "S"));
    }

    #[test]
    fn test_rejects_non_cuda_target() {
        let recipe = Recipe::builder("rocm_mfma", "rocm", InstructionScope::Warp)
            .capsule(CapsuleSpec::load("load_a", 0))
            .capsule(CapsuleSpec::compute("mma", &["load_a"]))
            .capsule(CapsuleSpec::store("store", "mma"))
            .main_capsule("mma")
            .reserve("nnn", "16x16x16", "mma", ReserveAxes::new(&[16], &[16]))
            .build()
            .unwrap();
        let matched = IntrinMatchResult::new(Arc::new(recipe), "nnn", "16x16x16");
        let err = check_schedulable(&matched, &matmul_relu(8)).unwrap_err();
        assert!(matches!(
            err,
            ScheduleError::Recipe(tileforge_intrinsics::RecipeError::UnsupportedTarget(_))
        ));
    }

    #[test]
    fn test_rejects_placeholder_main() {
        let mut state = matmul_relu(8);
        state.main_op = state.target_graph.find("A").unwrap();
        let err = check_schedulable(&wmma_match(), &state).unwrap_err();
        assert!(matches!(err, ScheduleError::MainNotCompute(_)));
    }
}
