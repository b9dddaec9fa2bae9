//! Graph builder entrypoints and the compute graph itself.

use crate::dialect::{AxisSpec, DataType, OpId, OpInput, OpKind, OpTemplate, Operation};
use crate::error::IrError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use tracing::debug;

#[derive(Debug, Default, Clone)]
pub struct GraphBuilder {
    nodes: Vec<Operation>,
    outputs: Vec<OpId>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn operations(&self) -> &[Operation] {
        &self.nodes
    }

    pub fn add_placeholder<N: Into<String>>(
        &mut self,
        name: N,
        shape: &[usize],
        dtype: DataType,
    ) -> OpId {
        let name = name.into();
        let axes = shape
            .iter()
            .enumerate()
            .map(|(index, extent)| AxisSpec::new(format!("{}_ax{}", name, index), *extent))
            .collect();
        self.push(name, OpKind::Placeholder, axes, Vec::new(), Vec::new(), dtype)
    }

    pub fn add_compute<N: Into<String>>(
        &mut self,
        name: N,
        axes: Vec<AxisSpec>,
        inputs: &[OpId],
        dtype: DataType,
    ) -> OpId {
        self.push(name.into(), OpKind::Compute, axes, Vec::new(), inputs.to_vec(), dtype)
    }

    pub fn add_reduction<N: Into<String>>(
        &mut self,
        name: N,
        axes: Vec<AxisSpec>,
        reduce_axes: Vec<AxisSpec>,
        inputs: &[OpId],
        dtype: DataType,
    ) -> OpId {
        self.push(name.into(), OpKind::Compute, axes, reduce_axes, inputs.to_vec(), dtype)
    }

    /// Elementwise op with the same shape as `input`.
    pub fn add_elementwise<N: Into<String>>(
        &mut self,
        name: N,
        input: OpId,
        dtype: DataType,
    ) -> OpId {
        let name = name.into();
        let axes = self
            .nodes
            .get(input.0)
            .map(|op| {
                op.axes
                    .iter()
                    .enumerate()
                    .map(|(index, axis)| AxisSpec::new(format!("{}_ax{}", name, index), axis.extent))
                    .collect()
            })
            .unwrap_or_default();
        self.push(name, OpKind::Compute, axes, Vec::new(), vec![input], dtype)
    }

    pub fn mark_output(&mut self, op: OpId) {
        if !self.outputs.contains(&op) {
            self.outputs.push(op);
        }
    }

    pub fn build(self) -> Result<ComputeGraph, IrError> {
        let mut seen = HashSet::new();
        for op in &self.nodes {
            validate_op(&op.name, &op.axes, &op.reduce_axes, &mut seen)?;
            for input in &op.inputs {
                if input.0 >= op.id.0 {
                    return Err(IrError::UnknownInput {
                        op: op.name.clone(),
                        input: *input,
                    });
                }
            }
        }

        let order: Vec<OpId> = self.nodes.iter().map(|op| op.id).collect();
        let mut graph = ComputeGraph {
            nodes: self.nodes,
            order,
            outputs: self.outputs,
        };
        for output in &graph.outputs {
            if graph.position(*output).is_none() {
                return Err(IrError::UnknownOp(*output));
            }
        }
        if graph.outputs.is_empty() {
            graph.outputs = graph
                .order
                .iter()
                .copied()
                .filter(|id| !graph.is_consumed(*id))
                .collect();
        }
        Ok(graph)
    }

    fn push(
        &mut self,
        name: String,
        kind: OpKind,
        axes: Vec<AxisSpec>,
        reduce_axes: Vec<AxisSpec>,
        inputs: Vec<OpId>,
        dtype: DataType,
    ) -> OpId {
        let id = OpId(self.nodes.len());
        self.nodes.push(Operation {
            id,
            name,
            kind,
            axes,
            reduce_axes,
            inputs,
            dtype,
        });
        id
    }
}

/// Data-flow graph of tensor operations in a fixed linear order.
///
/// Operations live in an arena indexed by [`OpId`]; the linear order only
/// lists live operations. Splicing retires the replaced operation from the
/// order while keeping its arena slot so outstanding ids stay meaningful.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeGraph {
    nodes: Vec<Operation>,
    order: Vec<OpId>,
    outputs: Vec<OpId>,
}

impl ComputeGraph {
    pub fn builder() -> GraphBuilder {
        GraphBuilder::new()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Live operation ids in linear order.
    pub fn op_ids(&self) -> &[OpId] {
        &self.order
    }

    pub fn ops(&self) -> impl Iterator<Item = &Operation> + '_ {
        self.order.iter().map(move |id| &self.nodes[id.0])
    }

    pub fn outputs(&self) -> &[OpId] {
        &self.outputs
    }

    pub fn contains(&self, id: OpId) -> bool {
        self.position(id).is_some()
    }

    pub fn get(&self, id: OpId) -> Option<&Operation> {
        if self.contains(id) {
            self.nodes.get(id.0)
        } else {
            None
        }
    }

    pub fn op(&self, id: OpId) -> Result<&Operation, IrError> {
        self.get(id).ok_or(IrError::UnknownOp(id))
    }

    pub fn find(&self, name: &str) -> Option<OpId> {
        self.ops().find(|op| op.name == name).map(|op| op.id)
    }

    /// Index of `id` in the linear order.
    pub fn position(&self, id: OpId) -> Option<usize> {
        self.order.iter().position(|candidate| *candidate == id)
    }

    /// The graph-final operation.
    pub fn last_op(&self) -> Option<OpId> {
        self.order.last().copied()
    }

    pub fn producers(&self, id: OpId) -> &[OpId] {
        self.get(id).map(|op| op.inputs.as_slice()).unwrap_or(&[])
    }

    /// Live operations reading `id`, in linear order.
    pub fn consumers(&self, id: OpId) -> Vec<OpId> {
        self.ops()
            .filter(|op| op.inputs.contains(&id))
            .map(|op| op.id)
            .collect()
    }

    pub fn is_consumed(&self, id: OpId) -> bool {
        self.ops().any(|op| op.inputs.contains(&id))
    }

    /// Replace `target` by the `replacement` sequence.
    ///
    /// The templates are inserted at the target's position in order; the last
    /// one takes over every consumer of the target and its output slot.
    /// Returns the ids assigned to the templates.
    pub fn splice(
        &mut self,
        target: OpId,
        replacement: Vec<OpTemplate>,
    ) -> Result<Vec<OpId>, IrError> {
        let position = self.position(target).ok_or(IrError::UnknownOp(target))?;
        let target_op = &self.nodes[target.0];
        if !target_op.is_compute() {
            return Err(IrError::SpliceOnPlaceholder(target_op.name.clone()));
        }
        if replacement.is_empty() {
            return Err(IrError::EmptySplice);
        }

        let mut seen: HashSet<&str> = self
            .ops()
            .filter(|op| op.id != target)
            .map(|op| op.name.as_str())
            .collect();
        for template in &replacement {
            let mut local = HashSet::new();
            validate_op(&template.name, &template.axes, &template.reduce_axes, &mut local)?;
            if !seen.insert(template.name.as_str()) {
                return Err(IrError::InvalidName {
                    name: template.name.clone(),
                });
            }
        }

        let base = self.nodes.len();
        let mut new_ops = Vec::with_capacity(replacement.len());
        for (index, template) in replacement.into_iter().enumerate() {
            let mut inputs = Vec::with_capacity(template.inputs.len());
            for input in template.inputs {
                let resolved = match input {
                    OpInput::Existing(id) => {
                        if id == target || !self.contains(id) {
                            return Err(IrError::UnknownInput {
                                op: template.name.clone(),
                                input: id,
                            });
                        }
                        id
                    }
                    OpInput::Template(earlier) => {
                        if earlier >= index {
                            return Err(IrError::ForwardTemplate {
                                index,
                                target: earlier,
                            });
                        }
                        OpId(base + earlier)
                    }
                };
                inputs.push(resolved);
            }
            new_ops.push(Operation {
                id: OpId(base + index),
                name: template.name,
                kind: template.kind,
                axes: template.axes,
                reduce_axes: template.reduce_axes,
                inputs,
                dtype: template.dtype,
            });
        }

        let ids: Vec<OpId> = new_ops.iter().map(|op| op.id).collect();
        let takeover = *ids.last().ok_or(IrError::EmptySplice)?;
        self.nodes.extend(new_ops);
        self.order.splice(position..=position, ids.iter().copied());

        for id in self.order.clone() {
            if ids.contains(&id) {
                continue;
            }
            for input in self.nodes[id.0].inputs.iter_mut() {
                if *input == target {
                    *input = takeover;
                }
            }
        }
        for output in self.outputs.iter_mut() {
            if *output == target {
                *output = takeover;
            }
        }

        debug!(
            target = %target,
            inserted = ids.len(),
            takeover = %takeover,
            "spliced replacement into compute graph"
        );
        Ok(ids)
    }
}

impl fmt::Display for ComputeGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph {{")?;
        for op in self.ops() {
            let shape = op
                .axes
                .iter()
                .map(|axis| axis.extent.to_string())
                .collect::<Vec<_>>()
                .join("x");
            let inputs = op
                .inputs
                .iter()
                .map(|id| self.nodes[id.0].name.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            match op.kind {
                OpKind::Placeholder => {
                    writeln!(f, "  {} = placeholder<{}x{}>", op.name, shape, op.dtype)?;
                }
                OpKind::Compute if op.has_reduction() => {
                    let reduce = op
                        .reduce_axes
                        .iter()
                        .map(|axis| axis.extent.to_string())
                        .collect::<Vec<_>>()
                        .join("x");
                    writeln!(
                        f,
                        "  {} = reduce<{}x{}>[{}]({})",
                        op.name, shape, op.dtype, reduce, inputs
                    )?;
                }
                OpKind::Compute => {
                    writeln!(f, "  {} = compute<{}x{}>({})", op.name, shape, op.dtype, inputs)?;
                }
            }
        }
        write!(f, "}}")
    }
}

pub fn axis(name: &str, extent: usize) -> AxisSpec {
    AxisSpec::new(name, extent)
}

fn validate_op<'a>(
    name: &'a str,
    axes: &[AxisSpec],
    reduce_axes: &[AxisSpec],
    seen: &mut HashSet<&'a str>,
) -> Result<(), IrError> {
    if name.is_empty() || !seen.insert(name) {
        return Err(IrError::InvalidName {
            name: name.to_string(),
        });
    }
    for axis in axes.iter().chain(reduce_axes) {
        if axis.extent == 0 {
            return Err(IrError::ZeroExtent {
                op: name.to_string(),
                axis: axis.name.clone(),
            });
        }
    }
    Ok(())
}
