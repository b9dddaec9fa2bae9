//! Turns one [`Params`] into concrete loop transformations.
//!
//! Operations are visited from the graph end towards its inputs, and every
//! visited operation runs the same ordered primitive table. Each primitive
//! checks its own preconditions and silently skips operations it does not
//! concern, so the table stays flat and the visit order alone decides which
//! loops already exist when a later primitive attaches to them.

use crate::config::ApplierConfig;
use crate::context::ScheduleComputeInfo;
use crate::error::ScheduleError;
use crate::params::{FactorChoice, Params};
use crate::state::SchedulingState;
use tileforge_intrinsics::{InstructionScope, IntrinMatchResult, OperationRole};
use tileforge_ir::{IterVarId, MemoryScope, OpId, Operation, Schedule, StageId};
use tracing::{debug, trace};

pub const UNROLL_PRAGMA: &str = "auto_unroll_max_step";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveStage {
    Inline,
    CacheRead,
    SetScope,
    Tiling,
    ComputeAt,
    Unroll,
    Tensorize,
}

/// Which operations a primitive may touch, judged by operation role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoleGuard {
    Unassigned,
    Assigned,
    Any,
}

impl RoleGuard {
    fn admits(self, role: Option<OperationRole>) -> bool {
        match self {
            RoleGuard::Unassigned => role.is_none(),
            RoleGuard::Assigned => role.is_some(),
            RoleGuard::Any => true,
        }
    }
}

type PrimitiveFn = fn(&mut ApplyContext<'_>, &Operation) -> Result<(), ScheduleError>;

struct Primitive {
    stage: PrimitiveStage,
    guard: RoleGuard,
    run: PrimitiveFn,
}

const PRIMITIVES: [Primitive; 7] = [
    Primitive {
        stage: PrimitiveStage::Inline,
        guard: RoleGuard::Unassigned,
        run: inline,
    },
    Primitive {
        stage: PrimitiveStage::CacheRead,
        guard: RoleGuard::Unassigned,
        run: cache_read,
    },
    Primitive {
        stage: PrimitiveStage::SetScope,
        guard: RoleGuard::Assigned,
        run: set_scope,
    },
    Primitive {
        stage: PrimitiveStage::Tiling,
        guard: RoleGuard::Any,
        run: tiling,
    },
    Primitive {
        stage: PrimitiveStage::ComputeAt,
        guard: RoleGuard::Assigned,
        run: compute_at,
    },
    Primitive {
        stage: PrimitiveStage::Unroll,
        guard: RoleGuard::Any,
        run: unroll,
    },
    Primitive {
        stage: PrimitiveStage::Tensorize,
        guard: RoleGuard::Assigned,
        run: tensorize,
    },
];

/// Names of the primitives in the order each operation runs them.
pub fn primitive_stages() -> [PrimitiveStage; 7] {
    PRIMITIVES.map(|primitive| primitive.stage)
}

/// Applies parameter sets to schedules of one spliced graph.
#[derive(Debug, Clone)]
pub struct ScheduleApplier {
    match_result: IntrinMatchResult,
    info: ScheduleComputeInfo,
    config: ApplierConfig,
    warp_size: usize,
}

struct ApplyContext<'a> {
    applier: &'a ScheduleApplier,
    schedule: &'a mut Schedule,
    params: &'a Params,
    state: SchedulingState,
}

impl ScheduleApplier {
    /// Public construction goes through [`ScheduleGenerator::applier`] so both
    /// sides agree on the warp size.
    ///
    /// [`ScheduleGenerator::applier`]: crate::generator::ScheduleGenerator::applier
    pub(crate) fn new(
        match_result: IntrinMatchResult,
        info: ScheduleComputeInfo,
        config: ApplierConfig,
        warp_size: usize,
    ) -> Self {
        Self {
            match_result,
            info,
            config,
            warp_size,
        }
    }

    pub fn compute_info(&self) -> &ScheduleComputeInfo {
        &self.info
    }

    pub fn config(&self) -> &ApplierConfig {
        &self.config
    }

    pub fn warp_size(&self) -> usize {
        self.warp_size
    }

    /// Fresh default schedule of the spliced graph with `params` applied.
    pub fn schedule(&self, params: &Params) -> Result<Schedule, ScheduleError> {
        let mut schedule = Schedule::new(&self.info.target_graph);
        self.apply(&mut schedule, params)?;
        Ok(schedule)
    }

    /// Apply `params` to `schedule`, which must have been created from the
    /// spliced graph of this applier.
    pub fn apply(&self, schedule: &mut Schedule, params: &Params) -> Result<(), ScheduleError> {
        self.check_roles()?;
        let order = self.visit_order()?;
        let mut ctx = ApplyContext {
            applier: self,
            schedule,
            params,
            state: SchedulingState::new(),
        };

        for op_id in order {
            let op = self.info.target_graph.op(op_id)?;
            let role = self.info.role(op_id);
            for primitive in &PRIMITIVES {
                if primitive.guard.admits(role) {
                    trace!(op = %op.name, stage = ?primitive.stage, "running primitive");
                    (primitive.run)(&mut ctx, op)?;
                }
            }
        }

        debug!(
            recipe = %self.info.recipe_stage.recipe_name,
            steps = ctx.schedule.steps().len(),
            inlined = ctx.state.inlined.len(),
            params = %params,
            "applied schedule"
        );
        Ok(())
    }

    fn check_roles(&self) -> Result<(), ScheduleError> {
        let stage = &self.info.recipe_stage;
        for role in [OperationRole::Main, OperationRole::Output] {
            match stage.ops_with_role(role).count() {
                0 => return Err(ScheduleError::MissingRole(role)),
                1 => {}
                _ => return Err(ScheduleError::DuplicateRole(role)),
            }
        }
        if self.info.output_position <= self.info.main_position {
            return Err(ScheduleError::OutputBeforeMain);
        }
        Ok(())
    }

    /// Compute operations from last to first, with the output operation
    /// moved ahead of the main operation when it is not already.
    fn visit_order(&self) -> Result<Vec<OpId>, ScheduleError> {
        let graph = &self.info.target_graph;
        let mut order: Vec<OpId> = graph
            .op_ids()
            .iter()
            .rev()
            .copied()
            .filter(|id| graph.get(*id).is_some_and(Operation::is_compute))
            .collect();
        let position = |order: &[OpId], id: OpId| order.iter().position(|op| *op == id);
        let main = position(&order, self.info.main_op)
            .ok_or(ScheduleError::MissingMainOp(self.info.main_op))?;
        let output = position(&order, self.info.output_op)
            .ok_or(ScheduleError::MissingRole(OperationRole::Output))?;
        if output > main {
            let op = order.remove(output);
            order.insert(main, op);
        }
        Ok(order)
    }
}

impl ApplyContext<'_> {
    fn info(&self) -> &ScheduleComputeInfo {
        &self.applier.info
    }

    fn stage_of(&self, op: OpId) -> Result<StageId, ScheduleError> {
        Ok(self.schedule.stage_of(op)?)
    }

    fn is_last(&self, op: OpId) -> bool {
        self.info().last_op() == Some(op)
    }

    fn step(value: usize) -> i64 {
        i64::try_from(value).unwrap_or(i64::MAX)
    }
}

fn inline(ctx: &mut ApplyContext<'_>, op: &Operation) -> Result<(), ScheduleError> {
    let graph = &ctx.info().target_graph;
    if !op.is_compute() || op.has_reduction() || !graph.is_consumed(op.id) {
        return Ok(());
    }
    let stage = ctx.stage_of(op.id)?;
    ctx.schedule.compute_inline(stage)?;
    ctx.state.inlined.insert(op.id);
    Ok(())
}

fn cache_read(ctx: &mut ApplyContext<'_>, op: &Operation) -> Result<(), ScheduleError> {
    let consumers = ctx.info().target_graph.consumers(op.id);
    let [consumer] = consumers.as_slice() else {
        return Ok(());
    };
    let consumer = *consumer;
    let for_load = ctx.info().role(consumer) == Some(OperationRole::Load);
    let for_last = ctx.applier.config.cache_read_for_last && ctx.is_last(consumer);
    match (for_load, for_last) {
        (true, true) => Err(ScheduleError::AmbiguousCacheRead(op.name.clone())),
        (true, false) => cache_read_for_load(ctx, op, consumer),
        (false, true) => cache_read_for_last(ctx, op, consumer),
        (false, false) => Ok(()),
    }
}

/// Stage a load operand in shared memory, filled cooperatively by the block
/// once per outer reduction step.
fn cache_read_for_load(
    ctx: &mut ApplyContext<'_>,
    op: &Operation,
    consumer: OpId,
) -> Result<(), ScheduleError> {
    let source = ctx.stage_of(op.id)?;
    let reader = ctx.stage_of(consumer)?;
    let main = ctx.stage_of(ctx.info().main_op)?;
    let attach = ctx.state.main_outermost_reduce_axis()?;
    let vector = ctx.params.vectorize.value;
    let warp_count = ctx.params.warp_count();
    let warp_size = ctx.applier.warp_size;
    let tokens = ctx.applier.config.tokens.clone();

    let cache = ctx.schedule.cache_read(source, MemoryScope::Shared, &[reader])?;
    ctx.schedule.compute_at(cache, main, attach)?;
    let leaves = ctx.schedule.leaf_axes(cache)?.to_vec();
    let fused = ctx.schedule.fuse(cache, &leaves)?;
    let (fused, vec) = ctx.schedule.split(cache, fused, vector)?;
    ctx.schedule.vectorize(cache, vec)?;
    let (fused, lane) = ctx.schedule.split(cache, fused, warp_size)?;
    ctx.schedule.bind(cache, lane, tokens.lane)?;
    let (_, warp) = ctx.schedule.split(cache, fused, warp_count)?;
    ctx.schedule.bind(cache, warp, tokens.warp)?;
    debug!(op = %op.name, vector, warp_count, "shared cache read for load");
    Ok(())
}

/// Stage an operand of the trailing operation in shared memory.
fn cache_read_for_last(
    ctx: &mut ApplyContext<'_>,
    op: &Operation,
    consumer: OpId,
) -> Result<(), ScheduleError> {
    let source = ctx.stage_of(op.id)?;
    let reader = ctx.stage_of(consumer)?;
    let attach = ctx.state.last_second_innermost_axis()?;
    let warp_count = ctx.params.last_warp_count();
    let warp_size = ctx.applier.warp_size;
    let tokens = ctx.applier.config.tokens.clone();

    let cache = ctx.schedule.cache_read(source, MemoryScope::Shared, &[reader])?;
    ctx.schedule.compute_at(cache, reader, attach)?;
    let leaves = ctx.schedule.leaf_axes(cache)?.to_vec();
    let fused = ctx.schedule.fuse(cache, &leaves)?;
    let (fused, lane) = ctx.schedule.split(cache, fused, warp_size)?;
    ctx.schedule.bind(cache, lane, tokens.lane)?;
    let (_, warp) = ctx.schedule.split(cache, fused, warp_count)?;
    ctx.schedule.bind(cache, warp, tokens.warp)?;
    debug!(op = %op.name, warp_count, "shared cache read for trailing op");
    Ok(())
}

fn set_scope(ctx: &mut ApplyContext<'_>, op: &Operation) -> Result<(), ScheduleError> {
    if ctx.info().role(op.id) == Some(OperationRole::Output) {
        return Ok(());
    }
    let stage = ctx.stage_of(op.id)?;
    ctx.schedule.set_scope(stage, MemoryScope::Local)?;
    Ok(())
}

fn tiling(ctx: &mut ApplyContext<'_>, op: &Operation) -> Result<(), ScheduleError> {
    if op.id == ctx.info().main_op {
        tile_main(ctx, op)
    } else if op.id == ctx.info().output_op {
        tile_output(ctx, op)
    } else if ctx.is_last(op.id) {
        tile_last(ctx, op)
    } else {
        Ok(())
    }
}

/// Split `axis` by `factors` (outer to inner). The first factor is implied
/// by the remaining extent.
fn split_by_factors(
    schedule: &mut Schedule,
    stage: StageId,
    axis: IterVarId,
    factors: &[usize],
) -> Result<Vec<IterVarId>, ScheduleError> {
    let mut parts = Vec::with_capacity(factors.len());
    let mut outer = axis;
    for factor in factors.iter().skip(1).rev() {
        let (next, inner) = schedule.split(stage, outer, *factor)?;
        parts.push(inner);
        outer = next;
    }
    parts.push(outer);
    parts.reverse();
    Ok(parts)
}

/// Split every axis by its factors and regroup the pieces by tile level.
fn tile_levels(
    schedule: &mut Schedule,
    stage: StageId,
    axes: &[IterVarId],
    factors: &[FactorChoice],
    op: &str,
) -> Result<Vec<Vec<IterVarId>>, ScheduleError> {
    if axes.len() != factors.len() {
        return Err(ScheduleError::ParamsMismatch(format!(
            "`{}` has {} tunable axes but {} factor tuples were given",
            op,
            axes.len(),
            factors.len()
        )));
    }
    let mut split = Vec::with_capacity(axes.len());
    for (axis, choice) in axes.iter().zip(factors) {
        split.push(split_by_factors(schedule, stage, *axis, &choice.value)?);
    }
    let depth = split.iter().map(Vec::len).max().unwrap_or(0);
    let levels = (0..depth)
        .map(|level| split.iter().filter_map(|parts| parts.get(level).copied()).collect())
        .collect();
    Ok(levels)
}

fn split_reserved(
    axes: &[IterVarId],
    reserved: usize,
    op: &str,
) -> Result<(Vec<IterVarId>, Vec<IterVarId>), ScheduleError> {
    if reserved == 0 {
        return Err(ScheduleError::NoReservedAxes(op.to_string()));
    }
    let boundary = axes
        .len()
        .checked_sub(reserved)
        .ok_or_else(|| ScheduleError::ReservedAxesExceedRank {
            op: op.to_string(),
            reserved,
            rank: axes.len(),
        })?;
    Ok((axes[..boundary].to_vec(), axes[boundary..].to_vec()))
}

fn check_depth(levels: &[Vec<IterVarId>], op: &str) -> Result<(), ScheduleError> {
    if levels.len() < 4 {
        return Err(ScheduleError::NotEnoughTileLevels {
            op: op.to_string(),
            levels: levels.len(),
        });
    }
    Ok(())
}

fn tile_output(ctx: &mut ApplyContext<'_>, op: &Operation) -> Result<(), ScheduleError> {
    let stage = ctx.stage_of(op.id)?;
    let root = ctx.schedule.stage(stage)?.root_axes.clone();
    let reserve = ctx.info().recipe_stage.reserve_count(op.id);
    let (tunable, reserved) = split_reserved(&root, reserve, &op.name)?;

    let mut levels = tile_levels(
        ctx.schedule,
        stage,
        &tunable,
        &ctx.params.spatial_factors,
        &op.name,
    )?;
    levels.push(reserved.clone());
    check_depth(&levels, &op.name)?;
    let ordered: Vec<IterVarId> = levels.iter().flatten().copied().collect();
    ctx.schedule.reorder(stage, &ordered)?;

    let outer = levels.len() - 2;
    let mut fused = Vec::with_capacity(outer);
    for level in &levels[..outer] {
        fused.push(ctx.schedule.fuse(stage, level)?);
    }
    let tokens = ctx.applier.config.tokens.clone();
    let last = fused.len() - 1;
    for (index, axis) in fused.iter().enumerate() {
        let tag = match index {
            0 => tokens.block.clone(),
            i if i == last => tokens.warp.clone(),
            _ => tokens.virtual_thread.clone(),
        };
        ctx.schedule.bind(stage, *axis, tag)?;
    }

    let mut output_levels: Vec<Vec<IterVarId>> = fused.iter().map(|axis| vec![*axis]).collect();
    let inner = &levels[outer];
    if ctx.info().recipe_stage.scope == InstructionScope::Thread {
        let thread = ctx.schedule.fuse(stage, inner)?;
        let (lane, rest) =
            ctx.schedule
                .split_nparts(stage, thread, ctx.applier.warp_size)?;
        ctx.schedule.bind(stage, lane, tokens.lane)?;
        output_levels.push(vec![lane, rest]);
    } else {
        output_levels.push(inner.clone());
    }
    output_levels.push(reserved.clone());

    // The instruction covers the two innermost reserved axes.
    let bind = reserved.len().saturating_sub(2);
    ctx.state.output_op_axis = output_levels;
    ctx.state.tensorize_iter.insert(op.id, reserved[bind]);
    debug!(op = %op.name, levels = levels.len(), "tiled output operation");
    Ok(())
}

fn tile_main(ctx: &mut ApplyContext<'_>, op: &Operation) -> Result<(), ScheduleError> {
    let stage = ctx.stage_of(op.id)?;
    let (root, reduce) = {
        let stage_ref = ctx.schedule.stage(stage)?;
        (stage_ref.root_axes.clone(), stage_ref.reduce_axes.clone())
    };
    let recipe_stage = &ctx.applier.info.recipe_stage;
    let reserve = recipe_stage.reserve_count(op.id);
    let (spatial_outer, spatial_reserved) = split_reserved(&root, reserve, &op.name)?;
    let (reduce_outer, reduce_reserved): (Vec<(usize, IterVarId)>, Vec<(usize, IterVarId)>) =
        reduce
            .iter()
            .copied()
            .enumerate()
            .partition(|(index, _)| !recipe_stage.main_op_reserve_reduce_axis.contains(index));
    let reduce_outer: Vec<IterVarId> = reduce_outer.into_iter().map(|(_, axis)| axis).collect();
    let reduce_reserved: Vec<IterVarId> =
        reduce_reserved.into_iter().map(|(_, axis)| axis).collect();

    let output = ctx.stage_of(ctx.info().output_op)?;
    let attach = ctx
        .state
        .output_warp_axis()
        .map_err(|_| ScheduleError::OutputNotTiled)?;
    ctx.schedule.compute_at(stage, output, attach)?;

    let mut levels = tile_levels(
        ctx.schedule,
        stage,
        &reduce_outer,
        &ctx.params.reduce_factors,
        &op.name,
    )?;
    levels.push(reduce_reserved);
    check_depth(&levels, &op.name)?;

    let count = levels.len();
    let mut ordered: Vec<IterVarId> = levels[..count - 2].iter().flatten().copied().collect();
    ordered.extend(&spatial_outer);
    ordered.extend(&levels[count - 2]);
    ordered.extend(&spatial_reserved);
    ordered.extend(&levels[count - 1]);
    ctx.schedule.reorder(stage, &ordered)?;

    ctx.state.main_op_reduce_axis = levels;
    ctx.state.tensorize_iter.insert(op.id, spatial_reserved[0]);
    debug!(op = %op.name, levels = count, "tiled main operation");
    Ok(())
}

fn tile_last(ctx: &mut ApplyContext<'_>, op: &Operation) -> Result<(), ScheduleError> {
    let [choice] = ctx.params.last_factors.as_slice() else {
        return Err(ScheduleError::ParamsMismatch(format!(
            "trailing op `{}` expects one factor tuple, got {}",
            op.name,
            ctx.params.last_factors.len()
        )));
    };
    let stage = ctx.stage_of(op.id)?;
    let leaves = ctx.schedule.leaf_axes(stage)?.to_vec();
    let fused = ctx.schedule.fuse(stage, &leaves)?;
    let (outer, thread) = ctx
        .schedule
        .split(stage, fused, ctx.applier.warp_size)?;
    let mut parts = split_by_factors(ctx.schedule, stage, outer, &choice.value)?;

    let tokens = ctx.applier.config.tokens.clone();
    let (Some(block), Some(warp)) = (parts.first().copied(), parts.last().copied()) else {
        return Err(ScheduleError::ParamsMismatch(format!(
            "trailing op `{}` got an empty factor tuple",
            op.name
        )));
    };
    ctx.schedule.bind(stage, block, tokens.block)?;
    if warp != block {
        ctx.schedule.bind(stage, warp, tokens.warp)?;
    }
    ctx.schedule.bind(stage, thread, tokens.lane)?;

    parts.push(thread);
    ctx.state.last_op_axis = vec![parts];
    debug!(op = %op.name, "tiled trailing operation");
    Ok(())
}

fn compute_at(ctx: &mut ApplyContext<'_>, op: &Operation) -> Result<(), ScheduleError> {
    let info = ctx.info();
    if op.id == info.main_op || op.id == info.output_op {
        return Ok(());
    }
    let position = info
        .target_graph
        .position(op.id)
        .ok_or(ScheduleError::MissingRole(OperationRole::Load))?;
    let (main_position, output_position) = (info.main_position, info.output_position);
    let (main_op, output_op) = (info.main_op, info.output_op);
    let reserve = info.recipe_stage.reserve_count(op.id);

    let stage = ctx.stage_of(op.id)?;
    if position < main_position {
        let parent = ctx.stage_of(main_op)?;
        let axis = ctx.state.main_second_reduce_axis()?;
        ctx.schedule.compute_at(stage, parent, axis)?;
    } else if position < output_position {
        let parent = ctx.stage_of(output_op)?;
        let axis = ctx.state.output_warp_axis()?;
        ctx.schedule.compute_at(stage, parent, axis)?;
    }

    let root = ctx.schedule.stage(stage)?.root_axes.clone();
    let (_, reserved) = split_reserved(&root, reserve, &op.name)?;
    ctx.state.tensorize_iter.insert(op.id, reserved[0]);
    Ok(())
}

fn unroll(ctx: &mut ApplyContext<'_>, op: &Operation) -> Result<(), ScheduleError> {
    let (axis, step) = if op.id == ctx.info().output_op {
        (
            ctx.state.output_outermost_axis()?,
            ctx.params.output_unroll_step.value,
        )
    } else if op.id == ctx.info().main_op {
        (
            ctx.state.main_outermost_reduce_axis()?,
            ctx.params.output_unroll_step.value,
        )
    } else if ctx.is_last(op.id) {
        (
            ctx.state.last_outermost_axis()?,
            ctx.params.last_unroll_step.value,
        )
    } else {
        return Ok(());
    };
    let stage = ctx.stage_of(op.id)?;
    ctx.schedule
        .pragma(stage, axis, UNROLL_PRAGMA, ApplyContext::step(step))?;
    Ok(())
}

fn tensorize(ctx: &mut ApplyContext<'_>, op: &Operation) -> Result<(), ScheduleError> {
    let info = ctx.info();
    let capsule = info
        .recipe_stage
        .capsule_key
        .get(&op.id)
        .ok_or_else(|| ScheduleError::MissingBindAxis(op.name.clone()))?;
    let matched = &ctx.applier.match_result;
    let intrinsic = matched
        .recipe
        .intrinsic(&matched.compute_key, &matched.shape_key, capsule)?
        .name
        .clone();
    let axis = ctx
        .state
        .tensorize_iter
        .get(&op.id)
        .copied()
        .ok_or_else(|| ScheduleError::MissingBindAxis(op.name.clone()))?;
    let stage = ctx.stage_of(op.id)?;
    ctx.schedule.tensorize(stage, axis, &intrinsic)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GeneratorConfig, DEFAULT_WARP_SIZE};
    use crate::context::TransformState;
    use crate::generator::ScheduleGenerator;
    use crate::testing::{matmul_relu, mma_sync_match, wmma_match};
    use std::sync::Arc;
    use tileforge_autotune::Choice;
    use tileforge_intrinsics::{CapsuleSpec, Intrinsic, Recipe, ReserveAxes};
    use tileforge_ir::{axis, Attach, DataType, GraphBuilder, ScheduleStep, ThreadTag};

    fn params() -> Params {
        Params {
            vectorize: Choice::new(8, vec![0]),
            spatial_factors: vec![
                Choice::new(vec![2, 2, 1], vec![0, 0]),
                Choice::new(vec![1, 2, 2], vec![0, 0]),
            ],
            reduce_factors: vec![Choice::new(vec![2, 2, 2], vec![0, 0])],
            last_factors: vec![Choice::new(vec![8, 16], vec![0])],
            output_unroll_step: Choice::new(512, vec![0]),
            last_unroll_step: Choice::new(64, vec![0]),
        }
    }

    fn applier(matched: IntrinMatchResult, state: &TransformState) -> ScheduleApplier {
        let info = ScheduleComputeInfo::build(&matched, state).unwrap();
        ScheduleApplier::new(matched, info, ApplierConfig::default(), DEFAULT_WARP_SIZE)
    }

    fn binding(schedule: &Schedule, axis: IterVarId) -> Option<ThreadTag> {
        schedule.iter_var(axis).and_then(|var| var.binding.clone())
    }

    #[test]
    fn test_primitive_order() {
        assert_eq!(
            primitive_stages(),
            [
                PrimitiveStage::Inline,
                PrimitiveStage::CacheRead,
                PrimitiveStage::SetScope,
                PrimitiveStage::Tiling,
                PrimitiveStage::ComputeAt,
                PrimitiveStage::Unroll,
                PrimitiveStage::Tensorize,
            ]
        );
    }

    #[test]
    fn test_apply_wmma_matmul_relu() {
        let applier = applier(wmma_match(), &matmul_relu(8));
        let schedule = applier.schedule(&params()).unwrap();

        let store = schedule.find_stage("C.store").unwrap();
        assert_eq!(store.attach, Attach::Root);
        assert_eq!(store.scope, None);
        let mma = schedule.find_stage("C.mma").unwrap();
        assert_eq!(mma.scope, Some(MemoryScope::Local));
        assert!(matches!(mma.attach, Attach::At { stage, .. } if stage == store.id));
        for load in ["C.load_a", "C.load_b"] {
            let stage = schedule.find_stage(load).unwrap();
            assert_eq!(stage.scope, Some(MemoryScope::Local));
            assert!(matches!(stage.attach, Attach::At { stage, .. } if stage == mma.id));
        }
        for pad in ["A_pad", "B_pad"] {
            assert_eq!(schedule.find_stage(pad).unwrap().attach, Attach::Inline);
            let cache = schedule.find_stage(&format!("{pad}.shared")).unwrap();
            assert!(matches!(cache.attach, Attach::At { stage, .. } if stage == mma.id));
        }
        assert_eq!(schedule.find_stage("D").unwrap().attach, Attach::Root);

        let tensorized: Vec<&str> = schedule
            .steps()
            .iter()
            .filter_map(|step| match step {
                ScheduleStep::Tensorize { intrinsic, .. } => Some(intrinsic.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(
            tensorized,
            vec![
                "wmma_store_nnn_16x16x16",
                "wmma_mma_nnn_16x16x16",
                "wmma_load_b_nnn_16x16x16",
                "wmma_load_a_nnn_16x16x16",
            ]
        );
    }

    #[test]
    fn test_output_bindings_and_pragmas() {
        let applier = applier(wmma_match(), &matmul_relu(8));
        let schedule = applier.schedule(&params()).unwrap();
        let tokens = ApplierConfig::default().tokens;

        let store = schedule.find_stage("C.store").unwrap();
        let leaves = &store.leaf_axes;
        // block, warp, two L2 axes, two reserved axes
        assert_eq!(leaves.len(), 6);
        assert_eq!(binding(&schedule, leaves[0]), Some(tokens.block.clone()));
        assert_eq!(binding(&schedule, leaves[1]), Some(tokens.warp.clone()));
        assert_eq!(schedule.iter_var(leaves[0]).unwrap().extent, 2);
        assert_eq!(schedule.iter_var(leaves[1]).unwrap().extent, 4);
        assert_eq!(schedule.iter_var(leaves[4]).unwrap().extent, 16);
        let pragmas = &schedule.iter_var(leaves[0]).unwrap().pragmas;
        assert_eq!(pragmas.len(), 1);
        assert_eq!(pragmas[0].key, UNROLL_PRAGMA);
        assert_eq!(pragmas[0].value, 512);

        let d = schedule.find_stage("D").unwrap();
        let d_leaves = &d.leaf_axes;
        assert_eq!(d_leaves.len(), 3);
        assert_eq!(binding(&schedule, d_leaves[0]), Some(tokens.block));
        assert_eq!(binding(&schedule, d_leaves[1]), Some(tokens.warp));
        assert_eq!(binding(&schedule, d_leaves[2]), Some(tokens.lane));
        assert_eq!(schedule.iter_var(d_leaves[0]).unwrap().pragmas[0].value, 64);
    }

    #[test]
    fn test_load_cache_is_vectorized_and_bound() {
        let applier = applier(wmma_match(), &matmul_relu(8));
        let schedule = applier.schedule(&params()).unwrap();
        let tokens = ApplierConfig::default().tokens;
        let cache = schedule.find_stage("A_pad.shared").unwrap();
        let leaves = &cache.leaf_axes;
        assert_eq!(leaves.len(), 4);
        assert!(schedule.iter_var(leaves[3]).unwrap().vectorized);
        assert_eq!(schedule.iter_var(leaves[3]).unwrap().extent, 8);
        assert_eq!(binding(&schedule, leaves[2]), Some(tokens.lane));
        assert_eq!(binding(&schedule, leaves[1]), Some(tokens.warp));
        assert_eq!(schedule.iter_var(leaves[1]).unwrap().extent, 4);
    }

    #[test]
    fn test_main_reduce_levels_order() {
        let applier = applier(wmma_match(), &matmul_relu(8));
        let schedule = applier.schedule(&params()).unwrap();
        let mma = schedule.find_stage("C.mma").unwrap();
        let names: Vec<&str> = mma
            .leaf_axes
            .iter()
            .map(|axis| schedule.iter_var(*axis).unwrap().name.as_str())
            .collect();
        assert_eq!(
            names,
            vec![
                "ko.outer.outer",
                "ko.outer.inner",
                "io",
                "jo",
                "ko.inner",
                "i",
                "j",
                "k"
            ]
        );
    }

    #[test]
    fn test_apply_is_deterministic() {
        let applier = applier(wmma_match(), &matmul_relu(16));
        let first = applier.schedule(&params()).unwrap();
        let second = applier.schedule(&params()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_thread_scope_splits_lane() {
        let applier = applier(mma_sync_match(), &matmul_relu(8));
        let schedule = applier.schedule(&params()).unwrap();
        let store = schedule.find_stage("C.store").unwrap();
        // block, warp, lane, rest, two reserved axes
        assert_eq!(store.leaf_axes.len(), 6);
        let lane = store.leaf_axes[2];
        assert_eq!(binding(&schedule, lane), Some(ThreadTag::THREAD_X));
        assert_eq!(schedule.iter_var(lane).unwrap().extent, 32);
    }

    #[test]
    fn test_missing_main_role() {
        let matched = wmma_match();
        let mut info = ScheduleComputeInfo::build(&matched, &matmul_relu(8)).unwrap();
        let main = info.main_op;
        info.recipe_stage.operation_role.remove(&main);
        let applier =
            ScheduleApplier::new(matched, info, ApplierConfig::default(), DEFAULT_WARP_SIZE);
        let mut schedule = Schedule::new(&applier.compute_info().target_graph);
        let err = applier.apply(&mut schedule, &params()).unwrap_err();
        assert!(matches!(err, ScheduleError::MissingRole(OperationRole::Main)));
    }

    #[test]
    fn test_factor_count_mismatch() {
        let applier = applier(wmma_match(), &matmul_relu(8));
        let mut params = params();
        params.spatial_factors.pop();
        let err = applier.schedule(&params).unwrap_err();
        assert!(matches!(err, ScheduleError::ParamsMismatch(_)));
    }

    #[test]
    fn test_two_level_split_is_rejected() {
        let applier = applier(wmma_match(), &matmul_relu(8));
        let mut params = params();
        params.spatial_factors = vec![
            Choice::new(vec![2, 2], vec![0]),
            Choice::new(vec![2, 2], vec![0]),
        ];
        let err = applier.schedule(&params).unwrap_err();
        assert!(matches!(err, ScheduleError::NotEnoughTileLevels { levels: 3, .. }));
    }

    /// `matmul_relu` with a second operand on the trailing op.
    fn matmul_bias() -> TransformState {
        let mut builder = GraphBuilder::new();
        let a = builder.add_placeholder("A", &[4, 8, 16, 16], DataType::F16);
        let b = builder.add_placeholder("B", &[4, 8, 16, 16], DataType::F16);
        let a_pad = builder.add_elementwise("A_pad", a, DataType::F16);
        let b_pad = builder.add_elementwise("B_pad", b, DataType::F16);
        let spatial = vec![axis("io", 4), axis("jo", 4), axis("i", 16), axis("j", 16)];
        let c = builder.add_reduction(
            "C",
            spatial.clone(),
            vec![axis("ko", 8), axis("k", 16)],
            &[a_pad, b_pad],
            DataType::F32,
        );
        let bias = builder.add_placeholder("Bias", &[4, 4, 16, 16], DataType::F32);
        let bias_pad = builder.add_elementwise("Bias_pad", bias, DataType::F32);
        builder.add_compute("D", spatial, &[c, bias_pad], DataType::F32);
        TransformState::new(builder.build().unwrap(), c)
    }

    #[test]
    fn test_cache_read_for_last() {
        let matched = wmma_match();
        let state = matmul_bias();
        let config = ApplierConfig {
            cache_read_for_last: true,
            ..ApplierConfig::default()
        };
        let info = ScheduleComputeInfo::build(&matched, &state).unwrap();
        let applier =
            ScheduleApplier::new(matched.clone(), info.clone(), config, DEFAULT_WARP_SIZE);
        let schedule = applier.schedule(&params()).unwrap();
        let d = schedule.find_stage("D").unwrap();
        let store = schedule.find_stage("C.store").unwrap();
        let cache = schedule.find_stage("Bias_pad.shared").unwrap();
        assert!(matches!(cache.attach, Attach::At { stage, .. } if stage == d.id));
        assert_eq!(d.reads, vec![store.id, cache.id]);
        assert_eq!(
            binding(&schedule, cache.leaf_axes[2]),
            Some(ThreadTag::THREAD_X)
        );

        // Without the flag the operand is only inlined.
        let plain =
            ScheduleApplier::new(matched, info, ApplierConfig::default(), DEFAULT_WARP_SIZE);
        let schedule = plain.schedule(&params()).unwrap();
        assert!(schedule.find_stage("Bias_pad.shared").is_none());
        assert_eq!(schedule.find_stage("Bias_pad").unwrap().attach, Attach::Inline);
    }

    /// WMMA-shaped recipe whose store also reserves the `jo` axis.
    fn wide_store_match() -> IntrinMatchResult {
        let (ck, sk) = ("nnn", "16x16x16");
        let mut builder = Recipe::builder("wide_store", "cuda", InstructionScope::Warp)
            .capsule(CapsuleSpec::load("load_a", 0))
            .capsule(CapsuleSpec::load("load_b", 1))
            .capsule(CapsuleSpec::compute("mma", &["load_a", "load_b"]))
            .capsule(CapsuleSpec::store("store", "mma"))
            .main_capsule("mma")
            .reserve(ck, sk, "load_a", ReserveAxes::new(&[16, 16], &[]))
            .reserve(ck, sk, "load_b", ReserveAxes::new(&[16, 16], &[]))
            .reserve(ck, sk, "mma", ReserveAxes::new(&[16, 16], &[16]))
            .reserve(ck, sk, "store", ReserveAxes::new(&[4, 16, 16], &[]));
        for capsule in ["load_a", "load_b", "mma", "store"] {
            builder = builder.intrinsic(ck, sk, capsule, Intrinsic::new(format!("wide_{capsule}")));
        }
        IntrinMatchResult::new(Arc::new(builder.build().unwrap()), ck, sk)
    }

    #[test]
    fn test_output_tensorizes_second_innermost_reserved_axis() {
        let applier = applier(wide_store_match(), &matmul_relu(8));
        let mut params = params();
        params.spatial_factors.truncate(1);
        let schedule = applier.schedule(&params).unwrap();
        let store = schedule.find_stage("C.store").unwrap();
        // io split three ways, then jo, i, j reserved
        assert_eq!(store.leaf_axes.len(), 6);
        let tensorized = schedule
            .steps()
            .iter()
            .find_map(|step| match step {
                ScheduleStep::Tensorize {
                    axis: bound,
                    intrinsic,
                    ..
                } if intrinsic == "wide_store" => Some(*bound),
                _ => None,
            })
            .unwrap();
        assert_eq!(schedule.iter_var(tensorized).unwrap().name, "i");
    }

    #[test]
    fn test_applier_uses_generator_warp_size() {
        let config = GeneratorConfig {
            warp_size: 16,
            ..GeneratorConfig::default()
        };
        let matched = wmma_match();
        let generator = ScheduleGenerator::new(&matched, &matmul_relu(8), config).unwrap();
        let applier = generator.applier(matched, ApplierConfig::default());
        assert_eq!(applier.warp_size(), 16);

        let schedule = applier.schedule(&params()).unwrap();
        let d = schedule.find_stage("D").unwrap();
        let lane = *d.leaf_axes.last().unwrap();
        assert_eq!(schedule.iter_var(lane).unwrap().extent, 16);
        let cache = schedule.find_stage("A_pad.shared").unwrap();
        assert_eq!(schedule.iter_var(cache.leaf_axes[2]).unwrap().extent, 16);
    }
}
