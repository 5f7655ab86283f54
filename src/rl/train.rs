//! Evaluate/train alternation over a vectorized environment
//!
//! The gradient update itself lives behind [`Learner`]; this module owns the
//! cadence, statistics, checkpoint-on-improvement and resource release.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

use burn::prelude::Backend;

use super::checkpoint::{CheckpointError, CheckpointStore};
use super::env::{EnvError, StatsSummary, VecEnv};
use super::layout::LayoutError;
use super::metrics::{StatsLogger, TrainingMetrics};
use super::policy::Policy;

#[derive(Debug, Error)]
pub enum TrainError {
    /// External interruption; never reported as a failure
    #[error("training interrupted")]
    Interrupted,
    #[error("environment: {0}")]
    Env(#[from] EnvError),
    #[error("checkpoint: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("stats log: {0}")]
    Io(#[from] std::io::Error),
    #[error("learner: {0}")]
    Learner(String),
    #[error("observation: {0}")]
    Layout(#[from] LayoutError),
    #[error("policy expects observations of width {policy}, environment produces {env}")]
    ObservationSize { policy: usize, env: usize },
    #[error("policy produces actions of width {policy}, environment expects {env}")]
    ActionSize { policy: usize, env: usize },
    #[error("training loop already closed")]
    Closed,
}

/// Reject an environment whose per-agent widths differ from the policy's
pub fn check_policy_fits<B: Backend, E: VecEnv>(
    policy: &Policy<B>,
    env: &E,
) -> Result<(), TrainError> {
    if env.observation_size() != policy.observation_size() {
        return Err(TrainError::ObservationSize {
            policy: policy.observation_size(),
            env: env.observation_size(),
        });
    }
    if env.action_size() != policy.action_size() {
        return Err(TrainError::ActionSize {
            policy: policy.action_size(),
            env: env.action_size(),
        });
    }
    Ok(())
}

/// External PPO implementation driven by [`TrainLoop`].
///
/// Observations read from the environment must go through
/// [`Policy::forward_observations`] so malformed engine data fails with
/// [`TrainError::Layout`] instead of reaching the tensors.
pub trait Learner<E: VecEnv> {
    /// Agent steps collected so far
    fn global_step(&self) -> u64;

    /// Collect one rollout from `env`; returns the statistics reports the
    /// environment emitted meanwhile.
    fn evaluate(&mut self, env: &mut E) -> Result<Vec<StatsSummary>, TrainError>;

    /// One optimization pass over the collected rollout
    fn train(&mut self) -> Result<(), TrainError>;

    fn save_checkpoint(
        &mut self,
        store: &CheckpointStore,
        epoch: usize,
    ) -> Result<PathBuf, TrainError>;

    fn close(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Evaluating,
    Training,
    Closing,
    Closed,
}

#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub total_timesteps: u64,
    /// Statistic tracked as the run's score
    pub objective_key: String,
    /// Summaries averaged into the reported objective
    pub objective_window: usize,
    pub checkpoint_on_improvement: bool,
    pub data_dir: PathBuf,
    pub exp_id: String,
    /// Write every summary to `<data_dir>/<exp_id>/stats/*.csv`
    pub log_stats: bool,
    pub log_interval_secs: f64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            total_timesteps: 250_000_000,
            objective_key: "drone_0_shots_hit".to_string(),
            objective_window: 10,
            checkpoint_on_improvement: true,
            data_dir: PathBuf::from("experiments"),
            exp_id: "run".to_string(),
            log_stats: true,
            log_interval_secs: 5.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TrainOutcome {
    /// Final statistics, objective averaged over the recent summaries
    Completed(StatsSummary),
    Interrupted,
}

impl TrainOutcome {
    pub fn summary(&self) -> Option<&StatsSummary> {
        match self {
            Self::Completed(summary) => Some(summary),
            Self::Interrupted => None,
        }
    }
}

pub struct TrainLoop<E: VecEnv, L: Learner<E>> {
    config: LoopConfig,
    env: E,
    learner: L,
    interrupt: Arc<AtomicBool>,
    state: LoopState,
    metrics: TrainingMetrics,
    checkpoints: CheckpointStore,
    stats_logger: Option<StatsLogger>,
    best_score: Option<f32>,
    epoch: usize,
}

impl<E: VecEnv, L: Learner<E>> TrainLoop<E, L> {
    pub fn new(config: LoopConfig, env: E, learner: L, interrupt: Arc<AtomicBool>) -> Self {
        let metrics = TrainingMetrics::new(config.objective_key.clone(), config.objective_window);
        let checkpoints = CheckpointStore::new(&config.data_dir, &config.exp_id);
        Self {
            config,
            env,
            learner,
            interrupt,
            state: LoopState::Idle,
            metrics,
            checkpoints,
            stats_logger: None,
            best_score: None,
            epoch: 0,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn env(&self) -> &E {
        &self.env
    }

    pub fn learner(&self) -> &L {
        &self.learner
    }

    pub fn best_score(&self) -> Option<f32> {
        self.best_score
    }

    /// Run until the step budget is exhausted, then release resources.
    ///
    /// Interruption yields `Ok(TrainOutcome::Interrupted)`; any other error is
    /// traced and returned after the environment and learner are closed.
    pub fn run(&mut self) -> Result<TrainOutcome, TrainError> {
        if self.state != LoopState::Idle {
            return Err(TrainError::Closed);
        }

        tracing::info!(
            "Starting training run {} for {} steps",
            self.config.exp_id,
            self.config.total_timesteps
        );
        let result = self.run_phases();

        self.transition(LoopState::Closing);
        self.release();
        self.transition(LoopState::Closed);

        match result {
            Ok(()) => {
                tracing::info!(
                    "Training complete after {} epochs, {} steps",
                    self.epoch,
                    self.learner.global_step()
                );
                Ok(TrainOutcome::Completed(self.metrics.final_summary()))
            }
            Err(TrainError::Interrupted) => {
                tracing::info!("Training interrupted at epoch {}", self.epoch);
                Ok(TrainOutcome::Interrupted)
            }
            Err(e) => {
                tracing::error!("Training failed: {e:?}");
                Err(e)
            }
        }
    }

    fn run_phases(&mut self) -> Result<(), TrainError> {
        while self.learner.global_step() < self.config.total_timesteps {
            self.check_interrupt()?;
            self.transition(LoopState::Evaluating);
            let summaries = self.learner.evaluate(&mut self.env)?;
            for summary in summaries {
                self.record_summary(summary)?;
            }

            self.check_interrupt()?;
            self.transition(LoopState::Training);
            self.learner.train()?;

            self.epoch += 1;
            self.metrics
                .update_epoch(self.epoch, self.learner.global_step());
            if self.metrics.secs_since_last_log() >= self.config.log_interval_secs {
                self.metrics.log_to_console();
            }
        }
        Ok(())
    }

    fn record_summary(&mut self, summary: StatsSummary) -> Result<(), TrainError> {
        let step = self.learner.global_step();
        if self.config.log_stats {
            if self.stats_logger.is_none() {
                let dir = self.checkpoints.dir().join("stats");
                self.stats_logger = Some(StatsLogger::new(dir)?);
            }
            if let Some(logger) = self.stats_logger.as_mut() {
                logger.log_summary(&summary, step)?;
            }
        }

        let Some(score) = self.metrics.record_summary(summary) else {
            return Ok(());
        };
        if !self.config.checkpoint_on_improvement {
            return Ok(());
        }
        if self.best_score.is_some_and(|best| score <= best) {
            return Ok(());
        }

        tracing::info!(
            "New best {}={:.3} at epoch {}",
            self.config.objective_key,
            score,
            self.epoch
        );
        self.learner.save_checkpoint(&self.checkpoints, self.epoch)?;
        self.best_score = Some(score);
        Ok(())
    }

    fn check_interrupt(&self) -> Result<(), TrainError> {
        if self.interrupt.load(Ordering::SeqCst) {
            Err(TrainError::Interrupted)
        } else {
            Ok(())
        }
    }

    fn transition(&mut self, next: LoopState) {
        tracing::debug!("Train loop {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn release(&mut self) {
        self.env.close();
        self.learner.close();
        if let Some(mut logger) = self.stats_logger.take() {
            if let Err(e) = logger.close() {
                tracing::warn!("Failed to close stats logs: {e}");
            }
        }
    }
}
