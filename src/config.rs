//! Run configuration grouped by concern and validated once after parsing

use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::{Args, ValueEnum};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::rl::layout::{LayoutError, MAX_DRONES};
use crate::rl::{EncoderConfig, EncoderKind, LoopConfig, PolicyConfig};

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{name} must be {expected}, got {value}")]
    OutOfRange {
        name: &'static str,
        value: f64,
        expected: &'static str,
    },
    #[error("{name} ({value}) must be divisible by {divisor_name} ({divisor})")]
    NotDivisible {
        name: &'static str,
        value: usize,
        divisor_name: &'static str,
        divisor: usize,
    },
    #[error("bptt_horizon must be a power of two, got {0}")]
    BpttNotPowerOfTwo(usize),
    #[error("unknown hyperparameter in suggestion: {0}")]
    UnknownParameter(String),
    #[error("policy layout: {0}")]
    Layout(#[from] LayoutError),
}

/// Training hyperparameters, run identity and checkpoint policy
#[derive(Debug, Clone, Args, Serialize, Deserialize)]
#[command(next_help_heading = "Training")]
pub struct TrainConfig {
    /// Checkpoint and stats root directory
    #[arg(long, default_value = "checkpoints")]
    pub data_dir: PathBuf,
    /// Experiment id; generated when omitted
    #[arg(long)]
    pub exp_id: Option<String>,
    /// Random seed; drawn when omitted
    #[arg(long)]
    pub seed: Option<u64>,
    #[arg(long, default_value_t = 250_000_000)]
    pub total_timesteps: u64,
    /// Environments simulated by each engine instance
    #[arg(long, default_value_t = 1024)]
    pub num_envs: usize,
    /// Drones per match
    #[arg(long, default_value_t = 2)]
    pub num_drones: usize,
    #[arg(long, default_value_t = 262_144)]
    pub batch_size: usize,
    #[arg(long, default_value_t = 64)]
    pub bptt_horizon: usize,
    #[arg(long, default_value_t = 65_536)]
    pub minibatch_size: usize,
    #[arg(long, default_value_t = 1)]
    pub update_epochs: usize,
    #[arg(long, default_value_t = 0.2)]
    pub clip_coef: f64,
    #[arg(long, default_value_t = 0.1)]
    pub vf_clip_coef: f64,
    #[arg(long, default_value_t = 0.0005)]
    pub ent_coef: f64,
    #[arg(long, default_value_t = 0.90)]
    pub gae_lambda: f64,
    #[arg(long, default_value_t = 0.99)]
    pub gamma: f64,
    #[arg(long, default_value_t = 0.0003)]
    pub learning_rate: f64,
    #[arg(long, default_value_t = 1.0)]
    pub max_grad_norm: f64,
    #[arg(long, default_value_t = 0.5)]
    pub vf_coef: f64,
    #[arg(long, default_value_t = 0.2)]
    pub target_kl: f64,
    #[arg(long)]
    pub anneal_lr: bool,
    /// Statistic used as the run's score and sweep objective
    #[arg(long, default_value = "drone_0_shots_hit")]
    pub objective_key: String,
    /// Periodic summaries averaged into the reported objective
    #[arg(long, default_value_t = 10)]
    pub objective_window: usize,
    /// Save a checkpoint whenever the objective improves
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub checkpoint_on_improvement: bool,
    /// Step cap of an evaluation episode
    #[arg(long, default_value_t = 10_000)]
    pub eval_max_steps: usize,
}

/// Engine vectorization
#[derive(Debug, Clone, Args, Serialize, Deserialize)]
#[command(next_help_heading = "Vectorization")]
pub struct VecConfig {
    #[arg(
        id = "vec_backend",
        long = "vec-backend",
        value_enum,
        default_value_t = VecBackend::Multiprocessing
    )]
    pub backend: VecBackend,
    /// Engine instances
    #[arg(id = "vec_num_envs", long = "vec-num-envs", default_value_t = 16)]
    pub num_envs: usize,
    #[arg(id = "vec_num_workers", long = "vec-num-workers", default_value_t = 16)]
    pub num_workers: usize,
    /// Engine instances stepped per batch
    #[arg(id = "vec_env_batch_size", long = "vec-env-batch-size", default_value_t = 16)]
    pub env_batch_size: usize,
    #[arg(
        id = "vec_zero_copy",
        long = "vec-zero-copy",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub zero_copy: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum VecBackend {
    Serial,
    Multiprocessing,
}

/// Policy architecture
#[derive(Debug, Clone, Args, Serialize, Deserialize)]
#[command(next_help_heading = "Policy")]
pub struct PolicyArgs {
    #[arg(long, value_enum, default_value_t = EncoderKind::EntityEmbedding)]
    pub encoder: EncoderKind,
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub recurrent: bool,
    #[arg(long, default_value_t = 256)]
    pub lstm_hidden_size: usize,
}

impl PolicyArgs {
    pub fn policy_config(&self, num_drones: usize) -> PolicyConfig {
        let mut encoder = EncoderConfig::new().with_kind(self.encoder);
        encoder.layout.num_drones = num_drones;
        PolicyConfig::new()
            .with_encoder(encoder)
            .with_recurrent(self.recurrent)
            .with_lstm_hidden_size(self.lstm_hidden_size)
    }
}

/// Hyperparameter search identity
#[derive(Debug, Clone, Args, Serialize, Deserialize)]
#[command(next_help_heading = "Sweep")]
pub struct SweepConfig {
    /// Existing sweep to join; a new sweep is created when omitted
    #[arg(long, env = "IMPULSE_WARS_SWEEP_ID")]
    pub sweep_id: Option<String>,
    #[arg(long, default_value = "sweeps")]
    pub sweep_dir: PathBuf,
    #[arg(long, default_value = "impulse-wars")]
    pub sweep_name: String,
    /// Stop the coordinator after this many trials
    #[arg(long)]
    pub max_trials: Option<usize>,
}

/// Every configuration group of a run
#[derive(Debug, Clone, Args, Serialize, Deserialize)]
pub struct AppConfig {
    #[command(flatten)]
    pub train: TrainConfig,
    #[command(flatten)]
    pub vec: VecConfig,
    #[command(flatten)]
    pub policy: PolicyArgs,
    #[command(flatten)]
    pub sweep: SweepConfig,
}

#[cfg(test)]
#[derive(clap::Parser)]
struct ConfigCli {
    #[command(flatten)]
    config: AppConfig,
}

#[cfg(test)]
impl AppConfig {
    pub(crate) fn parse_from<'a>(args: impl IntoIterator<Item = &'a str>) -> Self {
        use clap::Parser;
        ConfigCli::parse_from(std::iter::once("impulse-wars").chain(args)).config
    }
}

#[cfg(test)]
impl Default for AppConfig {
    fn default() -> Self {
        Self::parse_from([])
    }
}

impl AppConfig {
    /// Fill generated defaults and validate every group
    pub fn resolve(mut self) -> Result<Self, ConfigError> {
        self.train.resolve_identity();
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.train.validate()?;
        self.vec.validate()?;
        self.policy_config().encoder.layout.validate()?;
        Ok(())
    }

    pub fn policy_config(&self) -> PolicyConfig {
        self.policy.policy_config(self.train.num_drones)
    }
}

impl TrainConfig {
    /// Draw a seed and generate an experiment id where none was given
    pub fn resolve_identity(&mut self) {
        if self.seed.is_none() {
            self.seed = Some(rand::random());
        }
        if self.exp_id.is_none() {
            self.exp_id = Some(uuid::Uuid::new_v4().simple().to_string());
        }
    }

    pub fn exp_id(&self) -> &str {
        self.exp_id.as_deref().unwrap_or("run")
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_drones == 0 || self.num_drones > MAX_DRONES {
            return Err(ConfigError::OutOfRange {
                name: "num_drones",
                value: self.num_drones as f64,
                expected: "between 1 and the engine's drone limit",
            });
        }
        for (name, value) in [
            ("num_envs", self.num_envs),
            ("batch_size", self.batch_size),
            ("minibatch_size", self.minibatch_size),
            ("update_epochs", self.update_epochs),
            ("objective_window", self.objective_window),
            ("eval_max_steps", self.eval_max_steps),
        ] {
            if value == 0 {
                return Err(ConfigError::OutOfRange {
                    name,
                    value: 0.0,
                    expected: "positive",
                });
            }
        }
        if !self.bptt_horizon.is_power_of_two() {
            return Err(ConfigError::BpttNotPowerOfTwo(self.bptt_horizon));
        }
        divisible("batch_size", self.batch_size, "minibatch_size", self.minibatch_size)?;
        divisible("minibatch_size", self.minibatch_size, "bptt_horizon", self.bptt_horizon)?;

        for (name, value) in [("gamma", self.gamma), ("gae_lambda", self.gae_lambda)] {
            if !(value > 0.0 && value < 1.0) {
                return Err(ConfigError::OutOfRange {
                    name,
                    value,
                    expected: "in (0, 1)",
                });
            }
        }
        for (name, value) in [
            ("learning_rate", self.learning_rate),
            ("vf_coef", self.vf_coef),
            ("clip_coef", self.clip_coef),
        ] {
            if !(value > 0.0 && value.is_finite()) {
                return Err(ConfigError::OutOfRange {
                    name,
                    value,
                    expected: "positive",
                });
            }
        }
        for (name, value) in [
            ("ent_coef", self.ent_coef),
            ("max_grad_norm", self.max_grad_norm),
            ("vf_clip_coef", self.vf_clip_coef),
            ("target_kl", self.target_kl),
        ] {
            if !(value >= 0.0 && value.is_finite()) {
                return Err(ConfigError::OutOfRange {
                    name,
                    value,
                    expected: "non-negative",
                });
            }
        }
        Ok(())
    }

    /// Merge decoded sweep values. Nothing changes unless the merged
    /// configuration validates.
    pub fn apply_suggestion(&mut self, values: &BTreeMap<String, f64>) -> Result<(), ConfigError> {
        let mut merged = self.clone();
        for (name, value) in values {
            match name.as_str() {
                "total_timesteps" => merged.total_timesteps = value.round().max(0.0) as u64,
                "bptt_horizon" => merged.bptt_horizon = value.round().max(0.0) as usize,
                "ent_coef" => merged.ent_coef = *value,
                "gae_lambda" => merged.gae_lambda = *value,
                "gamma" => merged.gamma = *value,
                "learning_rate" => merged.learning_rate = *value,
                "max_grad_norm" => merged.max_grad_norm = *value,
                "vf_coef" => merged.vf_coef = *value,
                _ => return Err(ConfigError::UnknownParameter(name.clone())),
            }
        }
        merged.validate()?;
        *self = merged;
        Ok(())
    }

    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            total_timesteps: self.total_timesteps,
            objective_key: self.objective_key.clone(),
            objective_window: self.objective_window,
            checkpoint_on_improvement: self.checkpoint_on_improvement,
            data_dir: self.data_dir.clone(),
            exp_id: self.exp_id().to_string(),
            ..LoopConfig::default()
        }
    }
}

impl VecConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("vec_num_envs", self.num_envs),
            ("vec_num_workers", self.num_workers),
            ("vec_env_batch_size", self.env_batch_size),
        ] {
            if value == 0 {
                return Err(ConfigError::OutOfRange {
                    name,
                    value: 0.0,
                    expected: "positive",
                });
            }
        }
        divisible("vec_num_envs", self.num_envs, "vec_num_workers", self.num_workers)?;
        divisible("vec_num_envs", self.num_envs, "vec_env_batch_size", self.env_batch_size)?;
        Ok(())
    }
}

fn divisible(
    name: &'static str,
    value: usize,
    divisor_name: &'static str,
    divisor: usize,
) -> Result<(), ConfigError> {
    if divisor == 0 || value % divisor != 0 {
        return Err(ConfigError::NotDivisible {
            name,
            value,
            divisor_name,
            divisor,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert_eq!(config.train.total_timesteps, 250_000_000);
        assert_eq!(config.train.batch_size, 262_144);
        assert_eq!(config.train.bptt_horizon, 64);
        assert_eq!(config.vec.num_envs, 16);
        assert!(config.train.checkpoint_on_improvement);
        config.validate().unwrap();
    }

    #[test]
    fn test_resolve_draws_identity() {
        let config = AppConfig::default().resolve().unwrap();
        assert!(config.train.seed.is_some());
        assert_eq!(config.train.exp_id().len(), 32);
    }

    #[test]
    fn test_rejects_non_power_of_two_horizon() {
        let mut config = AppConfig::default();
        config.train.bptt_horizon = 48;
        assert_eq!(config.validate(), Err(ConfigError::BpttNotPowerOfTwo(48)));
    }

    #[test]
    fn test_rejects_indivisible_batch() {
        let mut config = AppConfig::default();
        config.train.minibatch_size = 65_000;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NotDivisible {
                name: "batch_size",
                ..
            })
        ));
    }

    #[test]
    fn test_rejects_bad_drone_count() {
        let mut config = AppConfig::default();
        config.train.num_drones = MAX_DRONES + 1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange {
                name: "num_drones",
                ..
            })
        ));
    }

    #[test]
    fn test_apply_suggestion() {
        let mut train = AppConfig::default().train;
        let values = BTreeMap::from([
            ("total_timesteps".to_string(), 150_000_000.0),
            ("bptt_horizon".to_string(), 32.0),
            ("gamma".to_string(), 0.995),
            ("learning_rate".to_string(), 1e-4),
        ]);

        train.apply_suggestion(&values).unwrap();

        assert_eq!(train.total_timesteps, 150_000_000);
        assert_eq!(train.bptt_horizon, 32);
        assert_eq!(train.gamma, 0.995);
        assert_eq!(train.learning_rate, 1e-4);
    }

    #[test]
    fn test_apply_suggestion_rejects_unknown_and_invalid() {
        let mut train = AppConfig::default().train;
        let unknown = BTreeMap::from([("momentum".to_string(), 0.9)]);
        assert_eq!(
            train.apply_suggestion(&unknown),
            Err(ConfigError::UnknownParameter("momentum".to_string()))
        );

        let invalid = BTreeMap::from([("gamma".to_string(), 1.0)]);
        assert!(train.apply_suggestion(&invalid).is_err());
    }

    #[test]
    fn test_rejected_suggestion_leaves_config_untouched() {
        let mut train = AppConfig::default().train;
        let before = format!("{train:?}");

        // learning_rate is valid, gamma is not
        let values = BTreeMap::from([
            ("gamma".to_string(), 1.5),
            ("learning_rate".to_string(), 1e-4),
        ]);
        assert!(train.apply_suggestion(&values).is_err());
        assert_eq!(format!("{train:?}"), before);

        let unknown = BTreeMap::from([
            ("bptt_horizon".to_string(), 16.0),
            ("momentum".to_string(), 0.9),
        ]);
        assert!(train.apply_suggestion(&unknown).is_err());
        assert_eq!(train.bptt_horizon, 64);
    }

    #[test]
    fn test_command_definition_is_consistent() {
        use clap::CommandFactory;
        ConfigCli::command().debug_assert();
    }

    #[test]
    fn test_train_and_vec_env_counts_parse_separately() {
        let config = AppConfig::parse_from([
            "--num-envs",
            "8",
            "--vec-num-envs",
            "32",
            "--vec-num-workers",
            "4",
            "--vec-backend",
            "serial",
        ]);
        assert_eq!(config.train.num_envs, 8);
        assert_eq!(config.vec.num_envs, 32);
        assert_eq!(config.vec.num_workers, 4);
        assert_eq!(config.vec.backend, VecBackend::Serial);
        config.validate().unwrap();
    }

    #[test]
    fn test_policy_config_follows_drone_count() {
        let mut config = AppConfig::default();
        config.train.num_drones = 3;
        config.policy.encoder = EncoderKind::MultiHot;
        let policy = config.policy_config();
        assert_eq!(policy.encoder.layout.num_drones, 3);
        assert_eq!(policy.encoder.kind, EncoderKind::MultiHot);
    }
}
