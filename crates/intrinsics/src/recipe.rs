//! Capability descriptors ("recipes") describing a hardware instruction as a
//! small sub-graph of load, compute and store capsules.

use crate::config::{
    CapsuleInput, CapsuleKind, CapsuleSpec, InstructionScope, Intrinsic, IntrinsicKey, ReserveAxes,
};
use crate::error::RecipeError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tileforge_ir::{AxisSpec, ComputeGraph, OpInput, OpKind, OpTemplate, Operation};

/// Dependency structure of a recipe's capsules.
///
/// `reads` only lists capsules that read at least one other capsule and
/// `feeds` only lists capsules read by at least one other capsule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapsuleDag {
    pub order: Vec<String>,
    pub reads: BTreeMap<String, Vec<String>>,
    pub feeds: BTreeMap<String, Vec<String>>,
}

impl CapsuleDag {
    pub fn reads_any(&self, capsule: &str) -> bool {
        self.reads.contains_key(capsule)
    }

    pub fn feeds_any(&self, capsule: &str) -> bool {
        self.feeds.contains_key(capsule)
    }
}

#[derive(Debug, Clone)]
pub struct Recipe {
    name: String,
    target: String,
    scope: InstructionScope,
    main_capsule: String,
    capsules: Vec<CapsuleSpec>,
    reserve_axes: BTreeMap<IntrinsicKey, ReserveAxes>,
    intrinsics: BTreeMap<IntrinsicKey, Intrinsic>,
}

impl Recipe {
    pub fn builder<N: Into<String>>(name: N, target: &str, scope: InstructionScope) -> RecipeBuilder {
        RecipeBuilder::new(name, target, scope)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn scope(&self) -> InstructionScope {
        self.scope
    }

    pub fn main_capsule(&self) -> &str {
        &self.main_capsule
    }

    pub fn capsules(&self) -> &[CapsuleSpec] {
        &self.capsules
    }

    pub fn capsule(&self, name: &str) -> Option<&CapsuleSpec> {
        self.capsules.iter().find(|capsule| capsule.name == name)
    }

    /// Shape keys the recipe provides data for, sorted.
    pub fn shape_keys(&self) -> Vec<&str> {
        let keys: BTreeSet<&str> = self
            .reserve_axes
            .keys()
            .map(|key| key.shape_key.as_str())
            .collect();
        keys.into_iter().collect()
    }

    pub fn supports(&self, compute_key: &str, shape_key: &str) -> bool {
        self.capsules.iter().all(|capsule| {
            self.reserve_axes
                .contains_key(&IntrinsicKey::new(compute_key, shape_key, &capsule.name))
        })
    }

    pub fn serialize_dag(&self) -> CapsuleDag {
        let mut reads: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut feeds: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for capsule in &self.capsules {
            for read in capsule.capsule_reads() {
                reads
                    .entry(capsule.name.clone())
                    .or_default()
                    .push(read.to_string());
                feeds
                    .entry(read.to_string())
                    .or_default()
                    .push(capsule.name.clone());
            }
        }
        CapsuleDag {
            order: self.capsules.iter().map(|c| c.name.clone()).collect(),
            reads,
            feeds,
        }
    }

    pub fn reserve_axes(
        &self,
        compute_key: &str,
        shape_key: &str,
        capsule: &str,
    ) -> Result<&ReserveAxes, RecipeError> {
        let key = IntrinsicKey::new(compute_key, shape_key, capsule);
        self.reserve_axes.get(&key).ok_or_else(|| {
            if self.capsule(capsule).is_none() {
                RecipeError::UnknownCapsule {
                    recipe: self.name.clone(),
                    capsule: capsule.to_string(),
                }
            } else {
                RecipeError::UnknownShapeKey {
                    recipe: self.name.clone(),
                    shape_key: shape_key.to_string(),
                }
            }
        })
    }

    pub fn intrinsic(
        &self,
        compute_key: &str,
        shape_key: &str,
        capsule: &str,
    ) -> Result<&Intrinsic, RecipeError> {
        self.intrinsics
            .get(&IntrinsicKey::new(compute_key, shape_key, capsule))
            .ok_or_else(|| RecipeError::UnknownIntrinsic {
                recipe: self.name.clone(),
                compute_key: compute_key.to_string(),
                shape_key: shape_key.to_string(),
                capsule: capsule.to_string(),
            })
    }

    /// Materialize the capsule sub-graph against a concrete main operation.
    ///
    /// Templates come out in capsule order and are named
    /// `<main op>.<capsule>`. Load capsules copy the shape of the main-op
    /// input they read; compute and store capsules copy the main op's
    /// iteration space. Every capsule's innermost axes must match its reserved
    /// extents.
    pub fn build_subgraph(
        &self,
        main_op: &Operation,
        graph: &ComputeGraph,
        compute_key: &str,
        shape_key: &str,
    ) -> Result<Vec<OpTemplate>, RecipeError> {
        let mut templates: Vec<OpTemplate> = Vec::with_capacity(self.capsules.len());
        let mut index_of: BTreeMap<&str, usize> = BTreeMap::new();

        for capsule in &self.capsules {
            let name = format!("{}.{}", main_op.name, capsule.name);
            let mut inputs = Vec::with_capacity(capsule.reads.len());
            for read in &capsule.reads {
                inputs.push(match read {
                    CapsuleInput::External(position) => {
                        let id = main_op.inputs.get(*position).copied().ok_or_else(|| {
                            self.mismatch(main_op, format!("missing input {}", position))
                        })?;
                        OpInput::Existing(id)
                    }
                    CapsuleInput::Capsule(source) => {
                        let index = index_of.get(source.as_str()).copied().ok_or_else(|| {
                            RecipeError::UnknownCapsule {
                                recipe: self.name.clone(),
                                capsule: source.clone(),
                            }
                        })?;
                        OpInput::Template(index)
                    }
                });
            }

            let (axes, reduce_axes, dtype) = match capsule.kind {
                CapsuleKind::Load => {
                    let source = match inputs.first() {
                        Some(OpInput::Existing(id)) => graph.get(*id),
                        _ => None,
                    }
                    .ok_or_else(|| {
                        self.mismatch(main_op, format!("load `{}` has no graph input", capsule.name))
                    })?;
                    let axes = source
                        .axes
                        .iter()
                        .map(|axis| AxisSpec::new(format!("{}.{}", capsule.name, axis.name), axis.extent))
                        .collect();
                    (axes, Vec::new(), source.dtype)
                }
                CapsuleKind::Compute => (
                    main_op.axes.clone(),
                    main_op.reduce_axes.clone(),
                    main_op.dtype,
                ),
                CapsuleKind::Store => (main_op.axes.clone(), Vec::new(), main_op.dtype),
            };

            let reserve = self.reserve_axes(compute_key, shape_key, &capsule.name)?;
            self.check_reserved(main_op, &capsule.name, &axes, &reserve.spatial)?;
            self.check_reserved(main_op, &capsule.name, &reduce_axes, &reserve.reduce)?;

            index_of.insert(capsule.name.as_str(), templates.len());
            templates.push(OpTemplate {
                name,
                kind: OpKind::Compute,
                axes,
                reduce_axes,
                inputs,
                dtype,
            });
        }

        Ok(templates)
    }

    fn check_reserved(
        &self,
        main_op: &Operation,
        capsule: &str,
        axes: &[AxisSpec],
        reserved: &[usize],
    ) -> Result<(), RecipeError> {
        let fits = axes.len() >= reserved.len()
            && axes[axes.len() - reserved.len()..]
                .iter()
                .zip(reserved)
                .all(|(axis, extent)| axis.extent == *extent);
        if fits {
            Ok(())
        } else {
            Err(self.mismatch(
                main_op,
                format!(
                    "capsule `{}` expects innermost extents {:?}",
                    capsule, reserved
                ),
            ))
        }
    }

    fn mismatch(&self, main_op: &Operation, reason: String) -> RecipeError {
        RecipeError::ShapeMismatch {
            recipe: self.name.clone(),
            op: main_op.name.clone(),
            reason,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecipeBuilder {
    name: String,
    target: String,
    scope: InstructionScope,
    main_capsule: Option<String>,
    capsules: Vec<CapsuleSpec>,
    reserve_axes: BTreeMap<IntrinsicKey, ReserveAxes>,
    intrinsics: BTreeMap<IntrinsicKey, Intrinsic>,
}

impl RecipeBuilder {
    pub fn new<N: Into<String>>(name: N, target: &str, scope: InstructionScope) -> Self {
        Self {
            name: name.into(),
            target: target.to_string(),
            scope,
            main_capsule: None,
            capsules: Vec::new(),
            reserve_axes: BTreeMap::new(),
            intrinsics: BTreeMap::new(),
        }
    }

    pub fn capsule(mut self, capsule: CapsuleSpec) -> Self {
        self.capsules.push(capsule);
        self
    }

    pub fn main_capsule(mut self, name: &str) -> Self {
        self.main_capsule = Some(name.to_string());
        self
    }

    pub fn reserve(
        mut self,
        compute_key: &str,
        shape_key: &str,
        capsule: &str,
        axes: ReserveAxes,
    ) -> Self {
        self.reserve_axes
            .insert(IntrinsicKey::new(compute_key, shape_key, capsule), axes);
        self
    }

    pub fn intrinsic(
        mut self,
        compute_key: &str,
        shape_key: &str,
        capsule: &str,
        intrinsic: Intrinsic,
    ) -> Self {
        self.intrinsics
            .insert(IntrinsicKey::new(compute_key, shape_key, capsule), intrinsic);
        self
    }

    pub fn build(self) -> Result<Recipe, RecipeError> {
        let malformed = |reason: String| RecipeError::Malformed {
            recipe: self.name.clone(),
            reason,
        };

        let mut seen = HashSet::new();
        for capsule in &self.capsules {
            for read in capsule.capsule_reads() {
                if !seen.contains(read) {
                    return Err(malformed(format!(
                        "capsule `{}` reads `{}` before it is defined",
                        capsule.name, read
                    )));
                }
            }
            if !seen.insert(capsule.name.as_str()) {
                return Err(malformed(format!("duplicate capsule `{}`", capsule.name)));
            }
        }

        let main_capsule = self
            .main_capsule
            .clone()
            .ok_or_else(|| malformed("no main capsule".to_string()))?;
        match self.capsules.iter().find(|c| c.name == main_capsule) {
            Some(capsule) if capsule.kind == CapsuleKind::Compute => {}
            Some(_) => {
                return Err(malformed(format!(
                    "main capsule `{}` is not a compute capsule",
                    main_capsule
                )))
            }
            None => {
                return Err(RecipeError::UnknownCapsule {
                    recipe: self.name.clone(),
                    capsule: main_capsule,
                })
            }
        }

        Ok(Recipe {
            name: self.name,
            target: self.target,
            scope: self.scope,
            main_capsule,
            capsules: self.capsules,
            reserve_axes: self.reserve_axes,
            intrinsics: self.intrinsics,
        })
    }
}

/// Output of the intrinsic matching stage: which recipe variant fits the
/// main operation.
#[derive(Debug, Clone)]
pub struct IntrinMatchResult {
    pub recipe: Arc<Recipe>,
    pub compute_key: String,
    pub shape_key: String,
}

impl IntrinMatchResult {
    pub fn new(recipe: Arc<Recipe>, compute_key: &str, shape_key: &str) -> Self {
        Self {
            recipe,
            compute_key: compute_key.to_string(),
            shape_key: shape_key.to_string(),
        }
    }
}
