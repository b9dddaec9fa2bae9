//! Symbolic loop-nest schedule over a compute graph.
//!
//! A [`Schedule`] holds one stage per graph operation (plus stages created by
//! `cache_read`). Every primitive validates its arguments, mutates the loop
//! nest and appends a [`ScheduleStep`] to the step log, so two schedules built
//! from the same inputs compare equal and a code generator can replay the log.

use crate::builder::ComputeGraph;
use crate::dialect::{OpId, OpKind};
use crate::error::IrError;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StageId(pub usize);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IterVarId(pub usize);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum IterKind {
    Spatial,
    Reduce,
}

/// Opaque hardware parallelism token an axis can be bound to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ThreadTag(Cow<'static, str>);

impl ThreadTag {
    pub const BLOCK_X: ThreadTag = ThreadTag(Cow::Borrowed("blockIdx.x"));
    pub const THREAD_X: ThreadTag = ThreadTag(Cow::Borrowed("threadIdx.x"));
    pub const THREAD_Y: ThreadTag = ThreadTag(Cow::Borrowed("threadIdx.y"));
    pub const VTHREAD: ThreadTag = ThreadTag(Cow::Borrowed("vthread"));

    pub fn new<N: Into<Cow<'static, str>>>(name: N) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ThreadTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The token set a backend exposes for block, warp and lane parallelism.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ThreadTokens {
    pub block: ThreadTag,
    pub warp: ThreadTag,
    pub lane: ThreadTag,
    pub virtual_thread: ThreadTag,
}

impl ThreadTokens {
    pub fn cuda() -> Self {
        Self {
            block: ThreadTag::BLOCK_X,
            warp: ThreadTag::THREAD_Y,
            lane: ThreadTag::THREAD_X,
            virtual_thread: ThreadTag::VTHREAD,
        }
    }
}

impl Default for ThreadTokens {
    fn default() -> Self {
        Self::cuda()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MemoryScope {
    Global,
    Shared,
    Local,
}

impl MemoryScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryScope::Global => "global",
            MemoryScope::Shared => "shared",
            MemoryScope::Local => "local",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Pragma {
    pub key: String,
    pub value: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IterVar {
    pub id: IterVarId,
    pub name: String,
    pub extent: usize,
    pub kind: IterKind,
    pub binding: Option<ThreadTag>,
    pub vectorized: bool,
    pub pragmas: Vec<Pragma>,
    pub tensorized: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Attach {
    Root,
    Inline,
    At { stage: StageId, axis: IterVarId },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Stage {
    pub id: StageId,
    /// Graph operation this stage computes; `None` for cache stages.
    pub op: Option<OpId>,
    pub name: String,
    pub is_compute: bool,
    pub root_axes: Vec<IterVarId>,
    pub reduce_axes: Vec<IterVarId>,
    pub leaf_axes: Vec<IterVarId>,
    pub attach: Attach,
    pub scope: Option<MemoryScope>,
    pub reads: Vec<StageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ScheduleStep {
    Split {
        stage: StageId,
        axis: IterVarId,
        factor: Option<usize>,
        nparts: Option<usize>,
        outer: IterVarId,
        inner: IterVarId,
    },
    Fuse {
        stage: StageId,
        axes: Vec<IterVarId>,
        fused: IterVarId,
    },
    Reorder {
        stage: StageId,
        axes: Vec<IterVarId>,
    },
    Bind {
        stage: StageId,
        axis: IterVarId,
        tag: ThreadTag,
    },
    ComputeAt {
        stage: StageId,
        parent: StageId,
        axis: IterVarId,
    },
    ComputeInline {
        stage: StageId,
    },
    SetScope {
        stage: StageId,
        scope: MemoryScope,
    },
    CacheRead {
        source: StageId,
        scope: MemoryScope,
        readers: Vec<StageId>,
        cache: StageId,
    },
    Vectorize {
        stage: StageId,
        axis: IterVarId,
    },
    Pragma {
        stage: StageId,
        axis: IterVarId,
        key: String,
        value: i64,
    },
    Tensorize {
        stage: StageId,
        axis: IterVarId,
        intrinsic: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Schedule {
    stages: Vec<Stage>,
    order: Vec<StageId>,
    iter_vars: Vec<IterVar>,
    op_stage: BTreeMap<OpId, StageId>,
    steps: Vec<ScheduleStep>,
}

impl Schedule {
    /// Create a default schedule: one root stage per operation, leaf order
    /// spatial axes followed by reduction axes.
    pub fn new(graph: &ComputeGraph) -> Self {
        let mut schedule = Self {
            stages: Vec::with_capacity(graph.len()),
            order: Vec::with_capacity(graph.len()),
            iter_vars: Vec::new(),
            op_stage: BTreeMap::new(),
            steps: Vec::new(),
        };

        for op in graph.ops() {
            let root_axes: Vec<IterVarId> = op
                .axes
                .iter()
                .map(|axis| schedule.new_iter_var(axis.name.clone(), axis.extent, IterKind::Spatial))
                .collect();
            let reduce_axes: Vec<IterVarId> = op
                .reduce_axes
                .iter()
                .map(|axis| schedule.new_iter_var(axis.name.clone(), axis.extent, IterKind::Reduce))
                .collect();
            let reads = op
                .inputs
                .iter()
                .filter_map(|input| schedule.op_stage.get(input).copied())
                .collect();
            let id = StageId(schedule.stages.len());
            let mut leaf_axes = root_axes.clone();
            leaf_axes.extend(reduce_axes.iter().copied());
            schedule.stages.push(Stage {
                id,
                op: Some(op.id),
                name: op.name.clone(),
                is_compute: matches!(op.kind, OpKind::Compute),
                root_axes,
                reduce_axes,
                leaf_axes,
                attach: Attach::Root,
                scope: None,
                reads,
            });
            schedule.order.push(id);
            schedule.op_stage.insert(op.id, id);
        }

        schedule
    }

    pub fn stages(&self) -> impl Iterator<Item = &Stage> + '_ {
        self.order.iter().map(move |id| &self.stages[id.0])
    }

    pub fn stage(&self, id: StageId) -> Result<&Stage, IrError> {
        self.stages.get(id.0).ok_or(IrError::UnknownStage(id.0))
    }

    pub fn stage_of(&self, op: OpId) -> Result<StageId, IrError> {
        self.op_stage.get(&op).copied().ok_or(IrError::NoStageForOp(op))
    }

    pub fn find_stage(&self, name: &str) -> Option<&Stage> {
        self.stages().find(|stage| stage.name == name)
    }

    pub fn iter_var(&self, id: IterVarId) -> Option<&IterVar> {
        self.iter_vars.get(id.0)
    }

    pub fn leaf_axes(&self, stage: StageId) -> Result<&[IterVarId], IrError> {
        Ok(&self.stage(stage)?.leaf_axes)
    }

    pub fn steps(&self) -> &[ScheduleStep] {
        &self.steps
    }

    /// Split `axis` so the inner loop has extent `factor`.
    pub fn split(
        &mut self,
        stage: StageId,
        axis: IterVarId,
        factor: usize,
    ) -> Result<(IterVarId, IterVarId), IrError> {
        let position = self.leaf_position(stage, axis)?;
        if factor == 0 {
            return Err(self.zero_factor(stage));
        }
        let parent = self.iter_vars[axis.0].clone();
        let outer = self.new_iter_var(
            format!("{}.outer", parent.name),
            parent.extent.div_ceil(factor),
            parent.kind,
        );
        let inner = self.new_iter_var(format!("{}.inner", parent.name), factor, parent.kind);
        self.stages[stage.0]
            .leaf_axes
            .splice(position..=position, [outer, inner]);
        self.steps.push(ScheduleStep::Split {
            stage,
            axis,
            factor: Some(factor),
            nparts: None,
            outer,
            inner,
        });
        Ok((outer, inner))
    }

    /// Split `axis` so the outer loop has extent `nparts`.
    pub fn split_nparts(
        &mut self,
        stage: StageId,
        axis: IterVarId,
        nparts: usize,
    ) -> Result<(IterVarId, IterVarId), IrError> {
        let position = self.leaf_position(stage, axis)?;
        if nparts == 0 {
            return Err(self.zero_factor(stage));
        }
        let parent = self.iter_vars[axis.0].clone();
        let outer = self.new_iter_var(format!("{}.outer", parent.name), nparts, parent.kind);
        let inner = self.new_iter_var(
            format!("{}.inner", parent.name),
            parent.extent.div_ceil(nparts),
            parent.kind,
        );
        self.stages[stage.0]
            .leaf_axes
            .splice(position..=position, [outer, inner]);
        self.steps.push(ScheduleStep::Split {
            stage,
            axis,
            factor: None,
            nparts: Some(nparts),
            outer,
            inner,
        });
        Ok((outer, inner))
    }

    /// Fuse adjacent leaf axes, listed outer to inner, into one axis.
    ///
    /// Fusing nothing inserts a unit-extent axis at the outermost position.
    pub fn fuse(&mut self, stage: StageId, axes: &[IterVarId]) -> Result<IterVarId, IrError> {
        self.stage(stage)?;
        let (fused, range) = match axes {
            [] => {
                let fused = self.new_iter_var("fused".to_string(), 1, IterKind::Spatial);
                (fused, 0..0)
            }
            [single] => {
                self.leaf_position(stage, *single)?;
                (*single, 0..0)
            }
            [first, rest @ ..] => {
                let start = self.leaf_position(stage, *first)?;
                for (offset, axis) in rest.iter().enumerate() {
                    if self.leaf_position(stage, *axis)? != start + offset + 1 {
                        return Err(IrError::NonAdjacentFuse {
                            stage: self.stages[stage.0].name.clone(),
                        });
                    }
                }
                let extent = axes.iter().map(|id| self.iter_vars[id.0].extent).product();
                let kind = if axes
                    .iter()
                    .any(|id| self.iter_vars[id.0].kind == IterKind::Reduce)
                {
                    IterKind::Reduce
                } else {
                    IterKind::Spatial
                };
                let name = axes
                    .iter()
                    .map(|id| self.iter_vars[id.0].name.as_str())
                    .collect::<Vec<_>>()
                    .join(".");
                let fused = self.new_iter_var(format!("{}.fused", name), extent, kind);
                (fused, start..start + axes.len())
            }
        };

        if axes.len() != 1 {
            self.stages[stage.0].leaf_axes.splice(range, [fused]);
        }
        self.steps.push(ScheduleStep::Fuse {
            stage,
            axes: axes.to_vec(),
            fused,
        });
        Ok(fused)
    }

    /// Reorder the listed leaf axes into the given order, keeping the slots
    /// they currently occupy.
    pub fn reorder(&mut self, stage: StageId, axes: &[IterVarId]) -> Result<(), IrError> {
        let mut positions = Vec::with_capacity(axes.len());
        for axis in axes {
            let position = self.leaf_position(stage, *axis)?;
            if positions.contains(&position) {
                return Err(IrError::DuplicateAxis {
                    stage: self.stages[stage.0].name.clone(),
                    axis: axis.0,
                });
            }
            positions.push(position);
        }
        positions.sort_unstable();
        let leaf = &mut self.stages[stage.0].leaf_axes;
        for (position, axis) in positions.into_iter().zip(axes) {
            leaf[position] = *axis;
        }
        self.steps.push(ScheduleStep::Reorder {
            stage,
            axes: axes.to_vec(),
        });
        Ok(())
    }

    pub fn bind(&mut self, stage: StageId, axis: IterVarId, tag: ThreadTag) -> Result<(), IrError> {
        self.leaf_position(stage, axis)?;
        self.iter_vars[axis.0].binding = Some(tag.clone());
        self.steps.push(ScheduleStep::Bind { stage, axis, tag });
        Ok(())
    }

    /// Attach `stage` inside the loop `axis` of `parent`.
    pub fn compute_at(
        &mut self,
        stage: StageId,
        parent: StageId,
        axis: IterVarId,
    ) -> Result<(), IrError> {
        self.stage(stage)?;
        if stage == parent {
            return Err(IrError::SelfAttach {
                stage: self.stages[stage.0].name.clone(),
            });
        }
        self.leaf_position(parent, axis)?;
        self.stages[stage.0].attach = Attach::At {
            stage: parent,
            axis,
        };
        self.steps.push(ScheduleStep::ComputeAt {
            stage,
            parent,
            axis,
        });
        Ok(())
    }

    pub fn compute_inline(&mut self, stage: StageId) -> Result<(), IrError> {
        self.stage(stage)?;
        self.stages[stage.0].attach = Attach::Inline;
        self.steps.push(ScheduleStep::ComputeInline { stage });
        Ok(())
    }

    pub fn set_scope(&mut self, stage: StageId, scope: MemoryScope) -> Result<(), IrError> {
        self.stage(stage)?;
        self.stages[stage.0].scope = Some(scope);
        self.steps.push(ScheduleStep::SetScope { stage, scope });
        Ok(())
    }

    /// Stage the output of `source` in `scope` for `readers`.
    ///
    /// The cache stage mirrors the source's spatial shape and is placed right
    /// after the source; every reader is rewired to read the cache.
    pub fn cache_read(
        &mut self,
        source: StageId,
        scope: MemoryScope,
        readers: &[StageId],
    ) -> Result<StageId, IrError> {
        let source_stage = self.stage(source)?.clone();
        for reader in readers {
            self.stage(*reader)?;
        }

        let name = format!("{}.{}", source_stage.name, scope.as_str());
        let root_axes: Vec<IterVarId> = source_stage
            .root_axes
            .iter()
            .enumerate()
            .map(|(index, axis)| {
                let extent = self.iter_vars[axis.0].extent;
                self.new_iter_var(format!("{}_ax{}", name, index), extent, IterKind::Spatial)
            })
            .collect();
        let cache = StageId(self.stages.len());
        self.stages.push(Stage {
            id: cache,
            op: None,
            name,
            is_compute: true,
            leaf_axes: root_axes.clone(),
            root_axes,
            reduce_axes: Vec::new(),
            attach: Attach::Root,
            scope: Some(scope),
            reads: vec![source],
        });
        let position = self
            .order
            .iter()
            .position(|id| *id == source)
            .map(|index| index + 1)
            .unwrap_or(self.order.len());
        self.order.insert(position, cache);

        for reader in readers {
            for read in self.stages[reader.0].reads.iter_mut() {
                if *read == source {
                    *read = cache;
                }
            }
        }

        self.steps.push(ScheduleStep::CacheRead {
            source,
            scope,
            readers: readers.to_vec(),
            cache,
        });
        Ok(cache)
    }

    pub fn vectorize(&mut self, stage: StageId, axis: IterVarId) -> Result<(), IrError> {
        self.leaf_position(stage, axis)?;
        self.iter_vars[axis.0].vectorized = true;
        self.steps.push(ScheduleStep::Vectorize { stage, axis });
        Ok(())
    }

    pub fn pragma(
        &mut self,
        stage: StageId,
        axis: IterVarId,
        key: &str,
        value: i64,
    ) -> Result<(), IrError> {
        self.leaf_position(stage, axis)?;
        self.iter_vars[axis.0].pragmas.push(Pragma {
            key: key.to_string(),
            value,
        });
        self.steps.push(ScheduleStep::Pragma {
            stage,
            axis,
            key: key.to_string(),
            value,
        });
        Ok(())
    }

    /// Replace the loop nest rooted at `axis` with `intrinsic`.
    pub fn tensorize(
        &mut self,
        stage: StageId,
        axis: IterVarId,
        intrinsic: &str,
    ) -> Result<(), IrError> {
        self.leaf_position(stage, axis)?;
        self.iter_vars[axis.0].tensorized = Some(intrinsic.to_string());
        self.steps.push(ScheduleStep::Tensorize {
            stage,
            axis,
            intrinsic: intrinsic.to_string(),
        });
        Ok(())
    }

    fn new_iter_var(&mut self, name: String, extent: usize, kind: IterKind) -> IterVarId {
        let id = IterVarId(self.iter_vars.len());
        self.iter_vars.push(IterVar {
            id,
            name,
            extent,
            kind,
            binding: None,
            vectorized: false,
            pragmas: Vec::new(),
            tensorized: None,
        });
        id
    }

    fn leaf_position(&self, stage: StageId, axis: IterVarId) -> Result<usize, IrError> {
        let stage_ref = self.stage(stage)?;
        stage_ref
            .leaf_axes
            .iter()
            .position(|candidate| *candidate == axis)
            .ok_or_else(|| IrError::NotALeaf {
                stage: stage_ref.name.clone(),
                axis: axis.0,
            })
    }

    fn zero_factor(&self, stage: StageId) -> IrError {
        IrError::ZeroFactor {
            stage: self.stages[stage.0].name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{axis, GraphBuilder};
    use crate::dialect::DataType;

    fn small_schedule() -> (Schedule, StageId, StageId) {
        let mut builder = GraphBuilder::new();
        let a = builder.add_placeholder("A", &[32, 16], DataType::F32);
        let b = builder.add_reduction(
            "B",
            vec![axis("i", 32)],
            vec![axis("k", 16)],
            &[a],
            DataType::F32,
        );
        let graph = builder.build().unwrap();
        let schedule = Schedule::new(&graph);
        let a_stage = schedule.stage_of(a).unwrap();
        let b_stage = schedule.stage_of(b).unwrap();
        (schedule, a_stage, b_stage)
    }

    fn extents(schedule: &Schedule, stage: StageId) -> Vec<usize> {
        schedule
            .leaf_axes(stage)
            .unwrap()
            .iter()
            .map(|id| schedule.iter_var(*id).unwrap().extent)
            .collect()
    }

    #[test]
    fn test_default_leaf_order() {
        let (schedule, _, b) = small_schedule();
        assert_eq!(extents(&schedule, b), vec![32, 16]);
        let reduce = schedule.stage(b).unwrap().reduce_axes[0];
        assert_eq!(schedule.iter_var(reduce).unwrap().kind, IterKind::Reduce);
    }

    #[test]
    fn test_split_uses_ceil_division() {
        let (mut schedule, _, b) = small_schedule();
        let i = schedule.leaf_axes(b).unwrap()[0];
        let (outer, inner) = schedule.split(b, i, 5).unwrap();
        assert_eq!(schedule.iter_var(outer).unwrap().extent, 7);
        assert_eq!(schedule.iter_var(inner).unwrap().extent, 5);
        assert_eq!(extents(&schedule, b), vec![7, 5, 16]);

        let (outer, inner) = schedule.split_nparts(b, outer, 2).unwrap();
        assert_eq!(schedule.iter_var(outer).unwrap().extent, 2);
        assert_eq!(schedule.iter_var(inner).unwrap().extent, 4);
        assert!(matches!(
            schedule.split(b, i, 2),
            Err(IrError::NotALeaf { .. })
        ));
    }

    #[test]
    fn test_fuse_requires_adjacency() {
        let (mut schedule, _, b) = small_schedule();
        let i = schedule.leaf_axes(b).unwrap()[0];
        let k = schedule.leaf_axes(b).unwrap()[1];
        let (io, ii) = schedule.split(b, i, 4).unwrap();
        assert!(matches!(
            schedule.fuse(b, &[io, k]),
            Err(IrError::NonAdjacentFuse { .. })
        ));
        let fused = schedule.fuse(b, &[io, ii]).unwrap();
        assert_eq!(schedule.iter_var(fused).unwrap().extent, 32);
        assert_eq!(schedule.leaf_axes(b).unwrap(), &[fused, k]);

        let unit = schedule.fuse(b, &[]).unwrap();
        assert_eq!(schedule.leaf_axes(b).unwrap()[0], unit);
        assert_eq!(schedule.iter_var(unit).unwrap().extent, 1);
    }

    #[test]
    fn test_reorder_keeps_slots() {
        let (mut schedule, _, b) = small_schedule();
        let i = schedule.leaf_axes(b).unwrap()[0];
        let k = schedule.leaf_axes(b).unwrap()[1];
        schedule.reorder(b, &[k, i]).unwrap();
        assert_eq!(schedule.leaf_axes(b).unwrap(), &[k, i]);
        assert!(matches!(
            schedule.reorder(b, &[k, k]),
            Err(IrError::DuplicateAxis { .. })
        ));
    }

    #[test]
    fn test_cache_read_rewires_readers() {
        let (mut schedule, a, b) = small_schedule();
        let cache = schedule.cache_read(a, MemoryScope::Shared, &[b]).unwrap();
        let stage = schedule.stage(cache).unwrap();
        assert_eq!(stage.name, "A.shared");
        assert_eq!(stage.reads, vec![a]);
        assert_eq!(schedule.stage(b).unwrap().reads, vec![cache]);
        let names: Vec<&str> = schedule.stages().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["A", "A.shared", "B"]);
        assert_eq!(extents(&schedule, cache), vec![32, 16]);
    }

    #[test]
    fn test_annotations_are_logged() {
        let (mut schedule, a, b) = small_schedule();
        let i = schedule.leaf_axes(b).unwrap()[0];
        let k = schedule.leaf_axes(b).unwrap()[1];
        schedule.bind(b, i, ThreadTag::BLOCK_X).unwrap();
        schedule.pragma(b, k, "auto_unroll_max_step", 64).unwrap();
        schedule.tensorize(b, k, "dot").unwrap();
        schedule.compute_at(a, b, k).unwrap();
        assert!(schedule.compute_at(b, b, k).is_err());

        let var = schedule.iter_var(k).unwrap();
        assert_eq!(var.pragmas[0].value, 64);
        assert_eq!(var.tensorized.as_deref(), Some("dot"));
        assert_eq!(
            schedule.iter_var(i).unwrap().binding,
            Some(ThreadTag::BLOCK_X)
        );
        assert_eq!(schedule.stage(a).unwrap().attach, Attach::At { stage: b, axis: k });
        assert_eq!(schedule.steps().len(), 4);
    }
}
