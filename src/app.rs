//! Mode dispatch for the command-line entry point

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::{Context, bail};
use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::rl::{
    CheckpointStore, EvalReport, Learner, Policy, TrainLoop, TrainOutcome, VecEnv,
    check_policy_fits, load_policy, run_episode,
};
use crate::sweep::{
    BayesConfig, ChildProcessLauncher, SweepController, TrialOutcome, default_params,
    default_transforms, forwarded_args,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum Mode {
    Train,
    Eval,
    /// Coordinate a hyperparameter sweep
    Sweep,
    /// Run one sweep trial; launched by the coordinator
    SweepChild,
}

/// What a mode needs to train or evaluate a policy
pub trait TrainingRuntime {
    fn train(&self, config: &AppConfig, interrupt: Arc<AtomicBool>)
    -> anyhow::Result<TrainOutcome>;

    fn evaluate(&self, config: &AppConfig, model_path: &Path) -> anyhow::Result<EvalReport>;

    /// Whether a simulation engine backs `train` and `evaluate`
    fn links_engine(&self) -> bool {
        true
    }
}

/// Bindings to a simulation engine and the PPO learner that trains on it
pub trait Engine<B: AutodiffBackend> {
    type Env: VecEnv;
    type Learner: Learner<Self::Env>;

    fn vec_env(&self, config: &AppConfig) -> anyhow::Result<Self::Env>;

    /// Learner that optimizes `policy` in place
    fn learner(&self, config: &AppConfig, policy: Policy<B>) -> anyhow::Result<Self::Learner>;
}

/// Builds the policy from configuration and drives [`TrainLoop`] with it.
/// Training runs on the autodiff back end `B`, evaluation on its inner back end.
pub struct EngineRuntime<B: AutodiffBackend, G> {
    engine: G,
    device: B::Device,
}

impl<B: AutodiffBackend, G: Engine<B>> EngineRuntime<B, G> {
    pub fn new(engine: G, device: B::Device) -> Self {
        Self { engine, device }
    }
}

impl<B: AutodiffBackend, G: Engine<B>> TrainingRuntime for EngineRuntime<B, G> {
    fn train(
        &self,
        config: &AppConfig,
        interrupt: Arc<AtomicBool>,
    ) -> anyhow::Result<TrainOutcome> {
        let policy = config.policy_config().init::<B>(&self.device)?;
        let mut env = self.engine.vec_env(config)?;
        if let Err(e) = check_policy_fits(&policy, &env) {
            env.close();
            return Err(e.into());
        }
        tracing::info!(
            "Policy: {:?} encoder, recurrent={}, observation width {}, {} agents",
            config.policy.encoder,
            policy.is_recurrent(),
            policy.observation_size(),
            env.num_agents()
        );

        let learner = self.engine.learner(config, policy)?;
        let mut train_loop = TrainLoop::new(config.train.loop_config(), env, learner, interrupt);
        Ok(train_loop.run()?)
    }

    fn evaluate(&self, config: &AppConfig, model_path: &Path) -> anyhow::Result<EvalReport> {
        let policy =
            load_policy::<B::InnerBackend>(&config.policy_config(), model_path, &self.device)?;
        let mut env = self.engine.vec_env(config)?;
        let report = run_episode(
            &policy,
            &mut env,
            config.train.seed,
            config.train.eval_max_steps,
            &self.device,
        );
        env.close();
        Ok(report?)
    }
}

/// Runtime of a build without a simulation engine; only sweep coordination works
pub struct UnlinkedEngine;

impl TrainingRuntime for UnlinkedEngine {
    fn train(
        &self,
        _config: &AppConfig,
        _interrupt: Arc<AtomicBool>,
    ) -> anyhow::Result<TrainOutcome> {
        bail!("no simulation engine is linked into this build; training requires one")
    }

    fn evaluate(&self, _config: &AppConfig, _model_path: &Path) -> anyhow::Result<EvalReport> {
        bail!("no simulation engine is linked into this build; evaluation requires one")
    }

    fn links_engine(&self) -> bool {
        false
    }
}

pub fn run(
    mode: Mode,
    config: AppConfig,
    eval_model_path: Option<PathBuf>,
    runtime: &dyn TrainingRuntime,
    interrupt: Arc<AtomicBool>,
    raw_args: &[String],
) -> anyhow::Result<()> {
    match mode {
        Mode::Train => {
            match runtime.train(&config, interrupt)? {
                TrainOutcome::Completed(summary) => {
                    tracing::info!("Final statistics: {:?}", summary.values);
                }
                TrainOutcome::Interrupted => tracing::info!("Training stopped early"),
            }
            Ok(())
        }
        Mode::Eval => {
            let model_path = match eval_model_path {
                Some(path) => path,
                None => CheckpointStore::new(&config.train.data_dir, config.train.exp_id())
                    .latest()?
                    .context("no checkpoint to evaluate; pass --eval-model-path")?,
            };
            let report = runtime.evaluate(&config, &model_path)?;
            tracing::info!(
                "Evaluation of {}: reward={:.3} length={}",
                model_path.display(),
                report.total_reward,
                report.length
            );
            Ok(())
        }
        Mode::Sweep => {
            // every trial would fail, so an unbounded sweep would never end
            if !runtime.links_engine() && config.sweep.max_trials.is_none() {
                bail!(
                    "no simulation engine is linked into this build; \
                     pass --max-trials to bound a sweep whose trials cannot train"
                );
            }
            let mut controller =
                SweepController::create_or_open(&config.sweep, default_params(), BayesConfig::default())?;
            let mut launcher = ChildProcessLauncher::current_exe(forwarded_args(raw_args))
                .context("locating the current executable")?;
            controller.run_coordinator(&mut launcher, config.sweep.max_trials, &interrupt)?;
            Ok(())
        }
        Mode::SweepChild => {
            run_sweep_child(&config, runtime, interrupt)?;
            Ok(())
        }
    }
}

/// One trial inside a child process. Training failures become failure
/// records; only a missing or unreadable sweep is an error.
pub fn run_sweep_child(
    config: &AppConfig,
    runtime: &dyn TrainingRuntime,
    interrupt: Arc<AtomicBool>,
) -> anyhow::Result<TrialOutcome> {
    if config.sweep.sweep_id.is_none() {
        bail!("sweep-child mode requires --sweep-id");
    }
    let mut controller =
        SweepController::create_or_open(&config.sweep, default_params(), BayesConfig::default())?;
    let mut backend = controller.open_backend()?;

    let outcome = controller.run_trial(
        &mut backend,
        &default_transforms(),
        &config.train.objective_key,
        |suggestion| -> anyhow::Result<_> {
            let mut trial_config = config.clone();
            trial_config.train.apply_suggestion(&suggestion.values)?;
            tracing::info!("Training args: {:?}", trial_config.train);

            let outcome = runtime.train(&trial_config, interrupt)?;
            Ok(outcome.summary().cloned())
        },
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rl::StatsSummary;
    use crate::rl::{EnvError, StepBatch, TrainError};
    use crate::sweep::{SearchBackend, SweepHistory};
    use burn::backend::{Autodiff, NdArray};
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type TrainBackend = Autodiff<NdArray>;

    const AGENTS: usize = 2;

    /// Never-ending episodes of all-zero observations
    struct ZeroEnv {
        obs_size: usize,
        action_size: usize,
        closed: Arc<AtomicUsize>,
    }

    impl VecEnv for ZeroEnv {
        fn observation_size(&self) -> usize {
            self.obs_size
        }

        fn action_size(&self) -> usize {
            self.action_size
        }

        fn num_agents(&self) -> usize {
            AGENTS
        }

        fn reset(&mut self, _seed: Option<u64>) -> Result<Vec<f32>, EnvError> {
            Ok(vec![0.0; AGENTS * self.obs_size])
        }

        fn step(&mut self, actions: &[f32]) -> Result<StepBatch, EnvError> {
            if actions.len() != AGENTS * self.action_size {
                return Err(EnvError::ActionShape {
                    got: actions.len(),
                    expected: AGENTS * self.action_size,
                });
            }
            Ok(StepBatch {
                observations: vec![0.0; AGENTS * self.obs_size],
                rewards: vec![0.0; AGENTS],
                terminals: vec![false; AGENTS],
                truncations: vec![false; AGENTS],
                infos: Vec::new(),
            })
        }

        fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Rolls the policy one step per evaluation; reports the step count as
    /// the objective so every epoch improves.
    struct RolloutLearner {
        policy: Policy<TrainBackend>,
        step: u64,
    }

    impl Learner<ZeroEnv> for RolloutLearner {
        fn global_step(&self) -> u64 {
            self.step
        }

        fn evaluate(&mut self, env: &mut ZeroEnv) -> Result<Vec<StatsSummary>, TrainError> {
            let observations = env.reset(None)?;
            let device = Default::default();
            let output = self.policy.forward_observations(&observations, None, &device)?;
            let actions: Vec<f32> = output
                .distribution
                .sample()
                .into_data()
                .to_vec()
                .map_err(|e| TrainError::Learner(format!("{e:?}")))?;
            env.step(&actions)?;

            self.step += AGENTS as u64;
            let mut summary = StatsSummary::default();
            summary.insert("drone_0_shots_hit", self.step as f32);
            Ok(vec![summary])
        }

        fn train(&mut self) -> Result<(), TrainError> {
            Ok(())
        }

        fn save_checkpoint(
            &mut self,
            store: &CheckpointStore,
            epoch: usize,
        ) -> Result<PathBuf, TrainError> {
            Ok(store.save(&self.policy, epoch)?)
        }

        fn close(&mut self) {}
    }

    struct FakeEngine {
        /// Extra observation width to simulate an engine built for another layout
        obs_size_delta: usize,
        closed: Arc<AtomicUsize>,
    }

    impl Engine<TrainBackend> for FakeEngine {
        type Env = ZeroEnv;
        type Learner = RolloutLearner;

        fn vec_env(&self, config: &AppConfig) -> anyhow::Result<ZeroEnv> {
            let policy = config.policy_config();
            Ok(ZeroEnv {
                obs_size: policy.encoder.observation_size() + self.obs_size_delta,
                action_size: policy.action_size,
                closed: self.closed.clone(),
            })
        }

        fn learner(
            &self,
            _config: &AppConfig,
            policy: Policy<TrainBackend>,
        ) -> anyhow::Result<RolloutLearner> {
            Ok(RolloutLearner { policy, step: 0 })
        }
    }

    fn engine_runtime(obs_size_delta: usize) -> EngineRuntime<TrainBackend, FakeEngine> {
        EngineRuntime::new(
            FakeEngine {
                obs_size_delta,
                closed: Arc::new(AtomicUsize::new(0)),
            },
            Default::default(),
        )
    }

    fn engine_config(data_dir: &Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.train.data_dir = data_dir.to_path_buf();
        config.train.exp_id = Some("engine".to_string());
        config.train.total_timesteps = 3 * AGENTS as u64;
        config.train.eval_max_steps = 3;
        config.policy.recurrent = false;
        config
    }

    /// Records the configurations it was asked to train
    struct RecordingRuntime {
        trained: Mutex<Vec<AppConfig>>,
        objective: Option<f32>,
    }

    impl TrainingRuntime for RecordingRuntime {
        fn train(
            &self,
            config: &AppConfig,
            _interrupt: Arc<AtomicBool>,
        ) -> anyhow::Result<TrainOutcome> {
            self.trained.lock().unwrap().push(config.clone());
            match self.objective {
                Some(objective) => {
                    let mut summary = StatsSummary::default();
                    summary.insert("drone_0_shots_hit", objective);
                    Ok(TrainOutcome::Completed(summary))
                }
                None => bail!("engine crashed"),
            }
        }

        fn evaluate(&self, _config: &AppConfig, model_path: &Path) -> anyhow::Result<EvalReport> {
            bail!("unexpected evaluation of {}", model_path.display())
        }
    }

    fn sweep_config(dir: &Path) -> AppConfig {
        let history = SweepHistory::create(dir, "test", default_params()).unwrap();
        let mut config = AppConfig::default();
        config.sweep.sweep_dir = dir.to_path_buf();
        config.sweep.sweep_id = Some(history.sweep_id().to_string());
        config
    }

    #[test]
    fn test_sweep_child_applies_suggestion() {
        let dir = tempfile::tempdir().unwrap();
        let config = sweep_config(dir.path());
        let runtime = RecordingRuntime {
            trained: Mutex::new(Vec::new()),
            objective: Some(7.0),
        };

        let outcome =
            run_sweep_child(&config, &runtime, Arc::new(AtomicBool::new(false))).unwrap();

        assert!(matches!(outcome, TrialOutcome::Success { objective, .. } if objective == 7.0));
        let trained = runtime.trained.lock().unwrap();
        assert_eq!(trained.len(), 1);
        assert!(trained[0].train.total_timesteps >= 100_000_000);
        assert!(trained[0].train.bptt_horizon.is_power_of_two());
    }

    #[test]
    fn test_sweep_child_survives_training_failure() {
        let dir = tempfile::tempdir().unwrap();
        let config = sweep_config(dir.path());
        let runtime = RecordingRuntime {
            trained: Mutex::new(Vec::new()),
            objective: None,
        };

        let outcome =
            run_sweep_child(&config, &runtime, Arc::new(AtomicBool::new(false))).unwrap();
        assert_eq!(outcome, TrialOutcome::Failed);

        let controller = SweepController::create_or_open(
            &config.sweep,
            default_params(),
            BayesConfig::default(),
        )
        .unwrap();
        let state = controller.open_backend().unwrap().state();
        assert_eq!(state.failures, 1);
        assert_eq!(state.successes, 0);
    }

    #[test]
    fn test_sweep_child_requires_sweep_id() {
        let runtime = UnlinkedEngine;
        let result = run_sweep_child(
            &AppConfig::default(),
            &runtime,
            Arc::new(AtomicBool::new(false)),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_unlinked_engine_reports_missing_engine() {
        let result = run(
            Mode::Train,
            AppConfig::default(),
            None,
            &UnlinkedEngine,
            Arc::new(AtomicBool::new(false)),
            &[],
        );
        let message = format!("{:#}", result.unwrap_err());
        assert!(message.contains("no simulation engine"));
    }

    #[test]
    fn test_eval_without_checkpoint_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.train.data_dir = dir.path().to_path_buf();

        let result = run(
            Mode::Eval,
            config,
            None,
            &UnlinkedEngine,
            Arc::new(AtomicBool::new(false)),
            &[],
        );
        assert!(format!("{:#}", result.unwrap_err()).contains("no checkpoint"));
    }

    #[test]
    fn test_engine_runtime_trains_then_evaluates_latest_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let config = engine_config(dir.path());
        let runtime = engine_runtime(0);

        let outcome = runtime
            .train(&config, Arc::new(AtomicBool::new(false)))
            .unwrap();

        // objective averaged over steps 2, 4, 6
        let summary = outcome.summary().unwrap();
        assert_eq!(summary.get("drone_0_shots_hit"), Some(4.0));
        let store = CheckpointStore::new(dir.path(), "engine");
        assert_eq!(store.latest().unwrap(), Some(store.path_for(2)));
        assert_eq!(runtime.engine.closed.load(Ordering::SeqCst), 1);

        run(
            Mode::Eval,
            config,
            None,
            &runtime,
            Arc::new(AtomicBool::new(false)),
            &[],
        )
        .unwrap();
        assert_eq!(runtime.engine.closed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_engine_runtime_rejects_mismatched_engine() {
        let dir = tempfile::tempdir().unwrap();
        let config = engine_config(dir.path());
        let runtime = engine_runtime(1);

        let error = runtime
            .train(&config, Arc::new(AtomicBool::new(false)))
            .unwrap_err();

        assert!(matches!(
            error.downcast_ref::<TrainError>(),
            Some(TrainError::ObservationSize { .. })
        ));
        assert_eq!(runtime.engine.closed.load(Ordering::SeqCst), 1);
        assert!(!dir.path().join("engine").exists());
    }

    #[test]
    fn test_unbounded_sweep_without_engine_refuses_to_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.sweep.sweep_dir = dir.path().to_path_buf();
        config.sweep.sweep_id = None;

        let result = run(
            Mode::Sweep,
            config,
            None,
            &UnlinkedEngine,
            Arc::new(AtomicBool::new(false)),
            &[],
        );

        assert!(format!("{:#}", result.unwrap_err()).contains("--max-trials"));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
