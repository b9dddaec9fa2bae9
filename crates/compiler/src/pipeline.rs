//! Tuning pipeline assembly: configuration, generator and applier.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tileforge_autotune::{Policy, SearchEntry};
use tileforge_intrinsics::IntrinMatchResult;
use tileforge_ir::Schedule;
use tileforge_schedule::{
    ApplierConfig, GeneratorConfig, Params, ScheduleApplier, ScheduleComputeInfo,
    ScheduleGenerator, TransformState,
};
use tracing::{debug, info};

pub const SEED_ENV: &str = "TILEFORGE_SEED";
pub const TRIALS_ENV: &str = "TILEFORGE_TRIALS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningConfig {
    pub generator: GeneratorConfig,
    pub applier: ApplierConfig,
    /// Measured iterations per session.
    pub trials: usize,
    /// Policy of every iteration after the first, which is always random.
    pub policy: Policy,
    /// Candidates drawn per `get` before falling back.
    pub max_trials: usize,
    pub log_path: Option<PathBuf>,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            generator: GeneratorConfig::default(),
            applier: ApplierConfig::default(),
            trials: 32,
            policy: Policy::Q,
            max_trials: 100,
            log_path: None,
        }
    }
}

impl TuningConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("reading tuning config {}", path.display()))?;
        let config = Self::from_json(&data)?;
        Ok(config)
    }

    /// Apply `TILEFORGE_SEED` and `TILEFORGE_TRIALS` from the process
    /// environment.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(seed) = lookup(SEED_ENV) {
            self.generator.seed = seed
                .trim()
                .parse()
                .with_context(|| format!("{SEED_ENV} must be an unsigned integer"))?;
        }
        if let Some(trials) = lookup(TRIALS_ENV) {
            self.trials = trials
                .trim()
                .parse()
                .with_context(|| format!("{TRIALS_ENV} must be an unsigned integer"))?;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), String> {
        self.generator.validate()?;
        if self.max_trials == 0 {
            return Err("max_trials must be > 0".into());
        }
        Ok(())
    }
}

/// A compiled schedule for one parameter set.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleResult {
    pub schedule: Schedule,
    /// Number of primitive steps applied on top of the default schedule.
    pub steps: usize,
}

/// Check that the graph can be scheduled with the matched recipe and return
/// the spliced compute context.
pub fn auto_schedule(
    match_result: &IntrinMatchResult,
    transform_state: &TransformState,
) -> Result<ScheduleComputeInfo> {
    let info = ScheduleComputeInfo::build(match_result, transform_state)?;
    info!(
        recipe = %info.recipe_stage.recipe_name,
        compute_key = %info.recipe_stage.compute_key,
        shape_key = %info.recipe_stage.shape_key,
        ops = info.target_graph.len(),
        "graph accepted for tensorized scheduling"
    );
    Ok(info)
}

pub struct TuningPipeline {
    generator: ScheduleGenerator,
    applier: ScheduleApplier,
    config: TuningConfig,
}

impl TuningPipeline {
    pub fn prepare(
        match_result: &IntrinMatchResult,
        transform_state: &TransformState,
        config: TuningConfig,
    ) -> Result<Self> {
        config.validate().map_err(anyhow::Error::msg)?;
        let generator =
            ScheduleGenerator::new(match_result, transform_state, config.generator.clone())?;
        let applier = generator.applier(match_result.clone(), config.applier.clone());
        debug!(
            trials = config.trials,
            policy = %config.policy,
            seed = config.generator.seed,
            "prepared tuning pipeline"
        );
        Ok(Self {
            generator,
            applier,
            config,
        })
    }

    /// Next candidate under `policy`.
    pub fn propose(&mut self, policy: Policy) -> Result<Params> {
        let params = self.generator.get(policy, false, self.config.max_trials)?;
        Ok(params)
    }

    /// Apply `params` to a fresh schedule of the spliced graph.
    pub fn compile(&self, params: &Params) -> Result<ScheduleResult> {
        let schedule = self.applier.schedule(params)?;
        let steps = schedule.steps().len();
        Ok(ScheduleResult { schedule, steps })
    }

    pub fn feedback(&mut self, params: &Params, cost: f64) {
        self.generator.feedback(params, cost);
    }

    pub fn best(&self) -> Option<&SearchEntry<Params>> {
        self.generator.best()
    }

    /// Tuning-log key: recipe, compute key and shape key.
    pub fn tuning_key(&self) -> String {
        let stage = &self.generator.compute_info().recipe_stage;
        format!(
            "{}/{}/{}",
            stage.recipe_name, stage.compute_key, stage.shape_key
        )
    }

    pub fn generator(&self) -> &ScheduleGenerator {
        &self.generator
    }

    pub fn applier(&self) -> &ScheduleApplier {
        &self.applier
    }

    pub fn config(&self) -> &TuningConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        assert!(TuningConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_config() {
        let config = TuningConfig::from_json(
            r#"{"trials": 8, "policy": "greedy", "generator": {"seed": 3}}"#,
        )
        .unwrap();
        assert_eq!(config.trials, 8);
        assert_eq!(config.policy, Policy::Greedy);
        assert_eq!(config.generator.seed, 3);
        assert_eq!(config.generator.top_k, GeneratorConfig::default().top_k);
        assert_eq!(config.applier, ApplierConfig::default());
        assert!(config.log_path.is_none());

        let json = config.to_json().unwrap();
        assert_eq!(TuningConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn test_overrides() {
        let config = TuningConfig::default()
            .with_overrides(|key| match key {
                SEED_ENV => Some("77".into()),
                TRIALS_ENV => Some(" 5 ".into()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.generator.seed, 77);
        assert_eq!(config.trials, 5);

        let err = TuningConfig::default()
            .with_overrides(|key| (key == SEED_ENV).then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains(SEED_ENV));
    }

    #[test]
    fn test_zero_max_trials_rejected() {
        let mut config = TuningConfig::default();
        config.max_trials = 0;
        assert!(config.validate().is_err());
    }
}
