//! Tuning session orchestration: propose, compile, measure, feed back.

use crate::pipeline::{ScheduleResult, TuningPipeline};
use anyhow::Result;
use std::path::Path;
use tileforge_autotune::{Policy, SearchEntry, TuningLog};
use tileforge_schedule::Params;
use tracing::{debug, info, warn};

/// Scores a compiled schedule. Higher is better.
///
/// Called synchronously between proposing a candidate and feeding its cost
/// back, so implementations may block on a benchmark run.
pub trait Measure {
    fn measure(&mut self, result: &ScheduleResult, params: &Params) -> Result<f64>;
}

impl<F> Measure for F
where
    F: FnMut(&ScheduleResult, &Params) -> Result<f64>,
{
    fn measure(&mut self, result: &ScheduleResult, params: &Params) -> Result<f64> {
        self(result, params)
    }
}

#[derive(Debug, Clone)]
pub struct TuningReport {
    pub trials: usize,
    pub measured: usize,
    pub skipped: usize,
    pub best: Option<SearchEntry<Params>>,
}

pub struct TuningSession<M> {
    pipeline: TuningPipeline,
    measure: M,
    best: Option<SearchEntry<Params>>,
}

impl<M: Measure> TuningSession<M> {
    pub fn new(pipeline: TuningPipeline, measure: M) -> Self {
        Self {
            pipeline,
            measure,
            best: None,
        }
    }

    pub fn run(&mut self) -> Result<TuningReport> {
        let trials = self.pipeline.config().trials;
        let policy = self.pipeline.config().policy;
        let mut measured = 0;
        let mut skipped = 0;

        for trial in 0..trials {
            let policy = if trial == 0 { Policy::Random } else { policy };
            let params = self.pipeline.propose(policy)?;
            let result = self.pipeline.compile(&params)?;
            let cost = match self.measure.measure(&result, &params) {
                Ok(cost) => cost,
                Err(err) => {
                    warn!(trial, params = %params, error = %err, "measurement failed, skipping trial");
                    skipped += 1;
                    continue;
                }
            };
            measured += 1;
            self.pipeline.feedback(&params, cost);
            debug!(trial, %policy, cost, steps = result.steps, "trial measured");

            if self.best.as_ref().map_or(true, |best| cost > best.cost) {
                info!(trial, cost, params = %params, "new best schedule");
                self.best = Some(SearchEntry::new(params, cost));
            }
        }

        if let (Some(path), Some(best)) = (&self.pipeline.config().log_path, &self.best) {
            self.persist(path, best)?;
        }

        info!(
            trials,
            measured,
            skipped,
            best_cost = self.best.as_ref().map(|best| best.cost),
            "tuning session finished"
        );
        Ok(TuningReport {
            trials,
            measured,
            skipped,
            best: self.best.clone(),
        })
    }

    /// Merge `best` into the tuning log at `path`.
    fn persist(&self, path: &Path, best: &SearchEntry<Params>) -> Result<()> {
        let key = self.pipeline.tuning_key();
        let mut log = TuningLog::<Params>::load_from_file(path)?;
        if log.record(&key, best.clone()) {
            log.save_to_file(path)?;
            info!(key = %key, path = %path.display(), cost = best.cost, "updated tuning log");
        } else {
            debug!(key = %key, "tuning log already holds a better record");
        }
        Ok(())
    }

    pub fn best(&self) -> Option<&SearchEntry<Params>> {
        self.best.as_ref()
    }

    pub fn pipeline(&self) -> &TuningPipeline {
        &self.pipeline
    }

    pub fn into_pipeline(self) -> TuningPipeline {
        self.pipeline
    }
}
