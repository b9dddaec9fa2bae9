//! Search loop proposing [`Params`] for one graph and recipe pairing.

use crate::applier::ScheduleApplier;
use crate::config::{ApplierConfig, GeneratorConfig};
use crate::context::{ScheduleComputeInfo, TransformState};
use crate::error::ScheduleError;
use crate::params::Params;
use std::collections::HashSet;
use tileforge_autotune::{
    Choice, Policy, SearchArchive, SearchEntry, SplitFactorGenerator, UnrollStepGenerator,
    VectorizeLengthGenerator,
};
use tileforge_intrinsics::IntrinMatchResult;
use tracing::debug;

pub struct ScheduleGenerator {
    info: ScheduleComputeInfo,
    config: GeneratorConfig,
    reduce_splits: Vec<SplitFactorGenerator>,
    spatial_splits: Vec<SplitFactorGenerator>,
    last_splits: Vec<SplitFactorGenerator>,
    vectorize: VectorizeLengthGenerator,
    unroll_output: UnrollStepGenerator,
    unroll_last: UnrollStepGenerator,
    archive: SearchArchive<Params>,
    visited: HashSet<String>,
    rng: fastrand::Rng,
}

impl ScheduleGenerator {
    /// Check the graph, splice the recipe in and build one parameter
    /// generator per tunable dimension.
    pub fn new(
        match_result: &IntrinMatchResult,
        transform_state: &TransformState,
        config: GeneratorConfig,
    ) -> Result<Self, ScheduleError> {
        config.validate().map_err(ScheduleError::InvalidConfig)?;
        let info = ScheduleComputeInfo::build(match_result, transform_state)?;
        let graph = &info.target_graph;
        let stage = &info.recipe_stage;
        let mut seeds = fastrand::Rng::with_seed(config.seed);

        let main = graph.op(info.main_op)?;
        let reserved_reduce: HashSet<usize> =
            stage.main_op_reserve_reduce_axis.iter().copied().collect();
        let mut reduce_splits = Vec::new();
        for (index, axis) in main.reduce_axes.iter().enumerate() {
            if !reserved_reduce.contains(&index) {
                reduce_splits.push(
                    SplitFactorGenerator::split(axis.extent, config.reduce_parts, seeds.u64(..))?
                        .with_exploration(config.explore),
                );
            }
        }

        let output = graph.op(info.output_op)?;
        let reserved = stage.reserve_count(info.output_op);
        let split_count = output.axes.len().checked_sub(reserved).ok_or_else(|| {
            ScheduleError::ReservedAxesExceedRank {
                op: output.name.clone(),
                reserved,
                rank: output.axes.len(),
            }
        })?;
        let mut spatial_splits = Vec::with_capacity(split_count);
        for axis in &output.axes[..split_count] {
            spatial_splits.push(
                SplitFactorGenerator::split(axis.extent, config.spatial_parts, seeds.u64(..))?
                    .with_exploration(config.explore),
            );
        }

        let last = info
            .last_op()
            .ok_or(ScheduleError::MissingRole(tileforge_intrinsics::OperationRole::Output))?;
        let last_extent = graph.op(last)?.flat_extent();
        let last_splits = vec![
            SplitFactorGenerator::split(last_extent, config.last_parts, seeds.u64(..))?
                .with_exploration(config.explore),
        ];

        let input_dtype = main
            .inputs
            .first()
            .map(|input| graph.op(*input).map(|op| op.dtype))
            .transpose()?
            .unwrap_or(main.dtype);
        let max_vector = stage.target.max_vector_length(input_dtype);
        let vectorize = VectorizeLengthGenerator::vector_lengths(max_vector, seeds.u64(..))?
            .with_exploration(config.explore);
        let unroll_output = UnrollStepGenerator::menu(&config.unroll_steps, seeds.u64(..))?
            .with_exploration(config.explore);
        let unroll_last = UnrollStepGenerator::menu(&config.unroll_steps, seeds.u64(..))?
            .with_exploration(config.explore);

        debug!(
            reduce_splits = reduce_splits.len(),
            spatial_splits = spatial_splits.len(),
            last_extent,
            max_vector,
            "initialized parameter generators"
        );

        Ok(Self {
            archive: SearchArchive::new(config.archive_capacity),
            rng: fastrand::Rng::with_seed(seeds.u64(..)),
            info,
            config,
            reduce_splits,
            spatial_splits,
            last_splits,
            vectorize,
            unroll_output,
            unroll_last,
            visited: HashSet::new(),
        })
    }

    pub fn compute_info(&self) -> &ScheduleComputeInfo {
        &self.info
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    /// Applier for the same spliced graph, tiling with this generator's warp
    /// size.
    pub fn applier(
        &self,
        match_result: IntrinMatchResult,
        config: ApplierConfig,
    ) -> ScheduleApplier {
        ScheduleApplier::new(match_result, self.info.clone(), config, self.config.warp_size)
    }

    pub fn archive(&self) -> &SearchArchive<Params> {
        &self.archive
    }

    pub fn best(&self) -> Option<&SearchEntry<Params>> {
        self.archive.best()
    }

    /// Hard validity: both warp-level factor products fit in a warp.
    pub fn valid(&self, params: &Params) -> bool {
        params.fits_warp(self.config.warp_size)
    }

    /// Propose the next parameter set.
    ///
    /// Falls back to the best archived record after `max_trials` rejected
    /// candidates, or to the first candidate of this call when nothing has
    /// been measured yet.
    pub fn get(
        &mut self,
        policy: Policy,
        repeat: bool,
        max_trials: usize,
    ) -> Result<Params, ScheduleError> {
        let mut first: Option<Params> = None;
        let mut first_valid: Option<Params> = None;

        for _ in 0..max_trials.max(1) {
            let candidate = match policy {
                Policy::Greedy => {
                    if let Some(best) = self.archive.best() {
                        return Ok(best.record.clone());
                    }
                    self.random_params()
                }
                Policy::Q if !self.archive.is_empty() && self.rng.f64() >= self.config.eps => {
                    match self
                        .archive
                        .anneal_select(self.config.top_k, &mut self.rng)
                        .map(|entry| entry.record.clone())
                    {
                        Some(hint) => self.step_params(&hint),
                        None => self.random_params(),
                    }
                }
                Policy::Q | Policy::Random => self.random_params(),
            };
            let Some(candidate) = candidate else {
                continue;
            };

            let valid = self.valid(&candidate);
            if first.is_none() {
                first = Some(candidate.clone());
            }
            if valid && first_valid.is_none() {
                first_valid = Some(candidate.clone());
            }
            if !valid {
                continue;
            }
            let key = candidate.to_string();
            if repeat || !self.visited.contains(&key) {
                self.visited.insert(key);
                return Ok(candidate);
            }
        }

        let fallback = self
            .archive
            .best()
            .map(|entry| entry.record.clone())
            .or(first_valid)
            .or(first);
        debug!(
            %policy,
            max_trials,
            archived = self.archive.len(),
            "search exhausted, returning fallback params"
        );
        fallback.ok_or(ScheduleError::NoCandidate)
    }

    /// Record the measured `cost` (higher is better) of `params`.
    pub fn feedback(&mut self, params: &Params, cost: f64) {
        self.archive.push(SearchEntry::new(params.clone(), cost));
        self.vectorize.feedback(&params.vectorize, cost);
        for (generator, choice) in self.spatial_splits.iter_mut().zip(&params.spatial_factors) {
            generator.feedback(choice, cost);
        }
        for (generator, choice) in self.reduce_splits.iter_mut().zip(&params.reduce_factors) {
            generator.feedback(choice, cost);
        }
        for (generator, choice) in self.last_splits.iter_mut().zip(&params.last_factors) {
            generator.feedback(choice, cost);
        }
        self.unroll_output.feedback(&params.output_unroll_step, cost);
        self.unroll_last.feedback(&params.last_unroll_step, cost);
        debug!(cost, params = %params, "recorded feedback");
    }

    fn random_params(&mut self) -> Option<Params> {
        Some(Params {
            vectorize: self.vectorize.get(Policy::Random, None)?,
            spatial_factors: random_all(&mut self.spatial_splits)?,
            reduce_factors: random_all(&mut self.reduce_splits)?,
            last_factors: random_all(&mut self.last_splits)?,
            output_unroll_step: self.unroll_output.get(Policy::Random, None)?,
            last_unroll_step: self.unroll_last.get(Policy::Random, None)?,
        })
    }

    /// Step every generator from the matching component of `hint`.
    fn step_params(&mut self, hint: &Params) -> Option<Params> {
        Some(Params {
            vectorize: self.vectorize.get(Policy::Q, Some(&hint.vectorize.value))?,
            spatial_factors: step_all(&mut self.spatial_splits, &hint.spatial_factors)?,
            reduce_factors: step_all(&mut self.reduce_splits, &hint.reduce_factors)?,
            last_factors: step_all(&mut self.last_splits, &hint.last_factors)?,
            output_unroll_step: self
                .unroll_output
                .get(Policy::Q, Some(&hint.output_unroll_step.value))?,
            last_unroll_step: self
                .unroll_last
                .get(Policy::Q, Some(&hint.last_unroll_step.value))?,
        })
    }
}

fn random_all(generators: &mut [SplitFactorGenerator]) -> Option<Vec<Choice<Vec<usize>>>> {
    generators
        .iter_mut()
        .map(|generator| generator.get(Policy::Random, None))
        .collect()
}

fn step_all(
    generators: &mut [SplitFactorGenerator],
    hints: &[Choice<Vec<usize>>],
) -> Option<Vec<Choice<Vec<usize>>>> {
    generators
        .iter_mut()
        .enumerate()
        .map(|(index, generator)| {
            generator.get(Policy::Q, hints.get(index).map(|choice| &choice.value))
        })
        .collect()
}
