//! Sweep coordinator and trial roles
//!
//! The coordinator never trains: it launches one isolated child per trial and
//! stops on the first child that exits unsuccessfully. Each child runs
//! [`SweepController::run_trial`], which turns any training error into a
//! failure record so the search survives crashed trials.

use std::fmt::Display;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use thiserror::Error;

use super::backend::{SearchBackend, SearchError};
use super::bayes::{BayesBackend, BayesConfig};
use super::history::SweepHistory;
use super::space::ParamSpec;
use super::suggestion::{Suggestion, TransformTable};
use crate::config::SweepConfig;
use crate::rl::StatsSummary;

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("search backend: {0}")]
    Search(#[from] SearchError),
    #[error("failed to spawn trial process {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("trial process exited with {}", exit_code_label(.code))]
    ChildFailed { code: Option<i32> },
}

fn exit_code_label(code: &Option<i32>) -> String {
    code.map_or_else(|| "a signal".to_string(), |code| format!("code {code}"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepPhase {
    NoSweep,
    SweepCreated,
    ChildSpawning,
    TrialRunning,
    Recording,
    Done,
}

/// Result of one trial as seen by the optimizer
#[derive(Debug, Clone, PartialEq)]
pub enum TrialOutcome {
    Success { objective: f64, cost: f64 },
    Failed,
}

/// Runs one trial in an isolated task
pub trait TrialLauncher {
    /// Blocks until the trial finishes; an unsuccessful exit is an error
    fn launch(&mut self, sweep_id: &str) -> Result<(), SweepError>;
}

/// Re-executes a program as a sweep child with inherited stdio
#[derive(Debug, Clone)]
pub struct ChildProcessLauncher {
    program: PathBuf,
    forwarded_args: Vec<String>,
}

impl ChildProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, forwarded_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            forwarded_args,
        }
    }

    /// Launcher for the running executable
    pub fn current_exe(forwarded_args: Vec<String>) -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, forwarded_args))
    }

    pub fn child_args(&self, sweep_id: &str) -> Vec<String> {
        let mut args = vec![
            "--mode".to_string(),
            "sweep-child".to_string(),
            "--sweep-id".to_string(),
            sweep_id.to_string(),
        ];
        args.extend(self.forwarded_args.iter().cloned());
        args
    }
}

impl TrialLauncher for ChildProcessLauncher {
    fn launch(&mut self, sweep_id: &str) -> Result<(), SweepError> {
        let args = self.child_args(sweep_id);
        tracing::info!(
            "Running child training process: {} {}",
            self.program.display(),
            args.join(" ")
        );

        let status = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .map_err(|source| SweepError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if status.success() {
            Ok(())
        } else {
            Err(SweepError::ChildFailed {
                code: status.code(),
            })
        }
    }
}

/// Command-line arguments to forward to children: everything except the
/// program name and the mode and sweep id flags the launcher sets itself.
pub fn forwarded_args(args: &[String]) -> Vec<String> {
    const OWNED: [&str; 2] = ["--mode", "--sweep-id"];

    let mut forwarded = Vec::new();
    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        if OWNED.contains(&arg.as_str()) {
            iter.next();
            continue;
        }
        if OWNED
            .iter()
            .any(|flag| arg.starts_with(&format!("{flag}=")))
        {
            continue;
        }
        forwarded.push(arg.clone());
    }
    forwarded
}

pub struct SweepController {
    history: SweepHistory,
    bayes: BayesConfig,
    phase: SweepPhase,
}

impl SweepController {
    /// Join `config.sweep_id`, or create a new sweep over `params`
    pub fn create_or_open(
        config: &SweepConfig,
        params: Vec<ParamSpec>,
        bayes: BayesConfig,
    ) -> Result<Self, SweepError> {
        let history = match &config.sweep_id {
            Some(sweep_id) => SweepHistory::open(&config.sweep_dir, sweep_id)?,
            None => SweepHistory::create(&config.sweep_dir, &config.sweep_name, params)?,
        };

        let controller = Self {
            history,
            bayes,
            phase: SweepPhase::NoSweep,
        };
        Ok(controller.with_phase(SweepPhase::SweepCreated))
    }

    pub fn sweep_id(&self) -> &str {
        self.history.sweep_id()
    }

    pub fn phase(&self) -> SweepPhase {
        self.phase
    }

    /// Optimizer rebuilt from the persisted history
    pub fn open_backend(&self) -> Result<BayesBackend, SweepError> {
        Ok(BayesBackend::open(self.history.clone(), self.bayes.clone())?)
    }

    /// Launch trials until `max_trials` have run or `interrupt` is set.
    /// Returns the number of trials that finished.
    pub fn run_coordinator(
        &mut self,
        launcher: &mut dyn TrialLauncher,
        max_trials: Option<usize>,
        interrupt: &AtomicBool,
    ) -> Result<usize, SweepError> {
        let mut trials = 0;
        while max_trials.is_none_or(|max| trials < max) && !interrupt.load(Ordering::SeqCst) {
            self.set_phase(SweepPhase::ChildSpawning);
            if let Err(e) = launcher.launch(self.sweep_id()) {
                tracing::error!("Sweep {} stopped after {} trials: {e}", self.sweep_id(), trials);
                self.set_phase(SweepPhase::Done);
                return Err(e);
            }
            trials += 1;
        }

        self.set_phase(SweepPhase::Done);
        tracing::info!("Sweep {} finished {} trials", self.sweep_id(), trials);
        Ok(trials)
    }

    /// Run one trial: suggest, decode, train, record.
    ///
    /// `train` receives the decoded suggestion and returns the final
    /// statistics, or `None` when interrupted. Every failure is recorded
    /// against the optimizer and never propagated.
    pub fn run_trial<F, E>(
        &mut self,
        backend: &mut dyn SearchBackend,
        transforms: &TransformTable,
        objective_key: &str,
        train: F,
    ) -> TrialOutcome
    where
        F: FnOnce(&Suggestion) -> Result<Option<StatsSummary>, E>,
        E: Display,
    {
        let state = backend.state();
        tracing::info!(
            "Optimizer state: success={} failures={} outstanding={} resample_count={} resampling={} random_sampling={}",
            state.successes,
            state.failures,
            state.outstanding,
            state.resample_count,
            backend.will_resample(),
            backend.is_random_sampling()
        );

        self.set_phase(SweepPhase::TrialRunning);
        let suggestion = match backend.suggest() {
            Ok(suggestion) => suggestion.decode(transforms),
            Err(e) => {
                tracing::error!("Failed to get a suggestion: {e}");
                self.set_phase(SweepPhase::Done);
                return TrialOutcome::Failed;
            }
        };
        tracing::info!("Suggestion {}: {:?}", suggestion.id, suggestion.values);

        let start = Instant::now();
        let result = match train(&suggestion) {
            Ok(Some(summary)) => match summary.get(objective_key) {
                Some(objective) => Ok(objective as f64),
                None => Err(format!("training summary has no {objective_key}")),
            },
            Ok(None) => Err("training was interrupted".to_string()),
            Err(e) => Err(e.to_string()),
        };
        let cost = start.elapsed().as_secs_f64();

        self.set_phase(SweepPhase::Recording);
        let outcome = match result {
            Ok(objective) => match backend.record_observation(objective, cost) {
                Ok(()) => TrialOutcome::Success { objective, cost },
                Err(e) => {
                    tracing::warn!("Failed to record observation: {e}");
                    Self::record_failure(backend);
                    TrialOutcome::Failed
                }
            },
            Err(reason) => {
                tracing::warn!("Trial {} failed: {reason}", suggestion.id);
                Self::record_failure(backend);
                TrialOutcome::Failed
            }
        };

        self.set_phase(SweepPhase::Done);
        tracing::info!("Trial {} finished: {:?}", suggestion.id, outcome);
        outcome
    }

    fn record_failure(backend: &mut dyn SearchBackend) {
        if let Err(e) = backend.record_failure() {
            tracing::error!("Failed to record trial failure: {e}");
        }
    }

    fn set_phase(&mut self, next: SweepPhase) {
        tracing::debug!("Sweep {:?} -> {:?}", self.phase, next);
        self.phase = next;
    }

    fn with_phase(mut self, next: SweepPhase) -> Self {
        self.set_phase(next);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sweep::space::default_params;
    use crate::sweep::suggestion::default_transforms;

    fn sweep_config(dir: &std::path::Path, sweep_id: Option<String>) -> SweepConfig {
        SweepConfig {
            sweep_id,
            sweep_dir: dir.to_path_buf(),
            sweep_name: "test".to_string(),
            max_trials: None,
        }
    }

    fn bayes() -> BayesConfig {
        BayesConfig {
            seed: Some(1),
            ..BayesConfig::default()
        }
    }

    fn controller(dir: &std::path::Path) -> SweepController {
        SweepController::create_or_open(&sweep_config(dir, None), default_params(), bayes())
            .unwrap()
    }

    fn summary(objective: f32) -> StatsSummary {
        let mut summary = StatsSummary::default();
        summary.insert("drone_0_shots_hit", objective);
        summary
    }

    #[test]
    fn test_trial_error_records_one_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = controller(dir.path());
        let mut backend = controller.open_backend().unwrap();
        let before = backend.state();

        let outcome = controller.run_trial(
            &mut backend,
            &default_transforms(),
            "drone_0_shots_hit",
            |_| Err::<Option<StatsSummary>, _>("engine crashed"),
        );

        assert_eq!(outcome, TrialOutcome::Failed);
        let after = backend.state();
        assert_eq!(after.failures, before.failures + 1);
        assert_eq!(after.successes, before.successes);
        assert_eq!(after.outstanding, 0);
        assert_eq!(controller.phase(), SweepPhase::Done);

        // persisted for the next trial process
        let reopened = controller.open_backend().unwrap();
        assert_eq!(reopened.state().failures, 1);
    }

    #[test]
    fn test_trial_success_records_objective_and_decodes() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = controller(dir.path());
        let mut backend = controller.open_backend().unwrap();
        let mut horizon = 0.0;

        let outcome = controller.run_trial(
            &mut backend,
            &default_transforms(),
            "drone_0_shots_hit",
            |suggestion| {
                horizon = suggestion.values["bptt_horizon"];
                Ok::<_, String>(Some(summary(4.0)))
            },
        );

        assert!(matches!(outcome, TrialOutcome::Success { objective, .. } if objective == 4.0));
        assert!([16.0, 32.0, 64.0, 128.0, 256.0].contains(&horizon));
        assert_eq!(backend.state().successes, 1);
    }

    #[test]
    fn test_missing_objective_or_interrupt_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = controller(dir.path());
        let mut backend = controller.open_backend().unwrap();
        let transforms = default_transforms();

        let missing = controller.run_trial(&mut backend, &transforms, "drone_0_wins", |_| {
            Ok::<_, String>(Some(summary(1.0)))
        });
        let interrupted =
            controller.run_trial(&mut backend, &transforms, "drone_0_shots_hit", |_| {
                Ok::<_, String>(None)
            });

        assert_eq!(missing, TrialOutcome::Failed);
        assert_eq!(interrupted, TrialOutcome::Failed);
        assert_eq!(backend.state().failures, 2);
        assert_eq!(backend.state().successes, 0);
    }

    #[test]
    fn test_open_existing_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let created = controller(dir.path());
        let sweep_id = created.sweep_id().to_string();

        let opened = SweepController::create_or_open(
            &sweep_config(dir.path(), Some(sweep_id.clone())),
            Vec::new(),
            bayes(),
        )
        .unwrap();
        assert_eq!(opened.sweep_id(), sweep_id);
        assert_eq!(opened.phase(), SweepPhase::SweepCreated);

        let missing = SweepController::create_or_open(
            &sweep_config(dir.path(), Some("nope".to_string())),
            Vec::new(),
            bayes(),
        );
        assert!(matches!(
            missing,
            Err(SweepError::Search(SearchError::UnknownSweep(_)))
        ));
    }

    struct ScriptedLauncher {
        launched: Vec<String>,
        fail_on: Option<usize>,
    }

    impl TrialLauncher for ScriptedLauncher {
        fn launch(&mut self, sweep_id: &str) -> Result<(), SweepError> {
            self.launched.push(sweep_id.to_string());
            if self.fail_on == Some(self.launched.len()) {
                return Err(SweepError::ChildFailed { code: Some(1) });
            }
            Ok(())
        }
    }

    #[test]
    fn test_coordinator_runs_max_trials() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = controller(dir.path());
        let mut launcher = ScriptedLauncher {
            launched: Vec::new(),
            fail_on: None,
        };

        let trials = controller
            .run_coordinator(&mut launcher, Some(3), &AtomicBool::new(false))
            .unwrap();

        assert_eq!(trials, 3);
        assert!(launcher.launched.iter().all(|id| id == controller.sweep_id()));
        assert_eq!(controller.phase(), SweepPhase::Done);
    }

    #[test]
    fn test_coordinator_stops_on_child_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = controller(dir.path());
        let mut launcher = ScriptedLauncher {
            launched: Vec::new(),
            fail_on: Some(2),
        };

        let result = controller.run_coordinator(&mut launcher, None, &AtomicBool::new(false));

        assert!(matches!(result, Err(SweepError::ChildFailed { code: Some(1) })));
        assert_eq!(launcher.launched.len(), 2);
    }

    #[test]
    fn test_coordinator_respects_interrupt() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = controller(dir.path());
        let mut launcher = ScriptedLauncher {
            launched: Vec::new(),
            fail_on: None,
        };

        let trials = controller
            .run_coordinator(&mut launcher, None, &AtomicBool::new(true))
            .unwrap();
        assert_eq!(trials, 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_child_process_exit_status() {
        let mut ok = ChildProcessLauncher::new("true", Vec::new());
        ok.launch("abc").unwrap();

        let mut failing = ChildProcessLauncher::new("false", Vec::new());
        assert!(matches!(
            failing.launch("abc"),
            Err(SweepError::ChildFailed { code: Some(1) })
        ));

        let mut missing = ChildProcessLauncher::new("/nonexistent/impulse-wars", Vec::new());
        assert!(matches!(missing.launch("abc"), Err(SweepError::Spawn { .. })));
    }

    #[test]
    fn test_child_args_forwarding() {
        let args: Vec<String> = [
            "impulse-wars",
            "--mode",
            "sweep",
            "--learning-rate",
            "0.001",
            "--sweep-id=old",
            "--vec-num-envs",
            "8",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let launcher = ChildProcessLauncher::new("impulse-wars", forwarded_args(&args));
        assert_eq!(
            launcher.child_args("s1"),
            vec![
                "--mode",
                "sweep-child",
                "--sweep-id",
                "s1",
                "--learning-rate",
                "0.001",
                "--vec-num-envs",
                "8",
            ]
        );
    }
}
