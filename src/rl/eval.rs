//! Evaluation-only rollouts of a saved policy

use burn::prelude::*;

use super::env::{StatsSummary, VecEnv};
use super::policy::{Policy, PolicyState};
use super::train::{TrainError, check_policy_fits};

/// Result of one deterministic episode
#[derive(Debug, Clone, Default)]
pub struct EvalReport {
    /// Reward summed over every agent
    pub total_reward: f32,
    /// Steps until the first agent finished its episode
    pub length: usize,
    /// Last statistics report seen during the episode
    pub summary: Option<StatsSummary>,
}

/// Roll one episode with deterministic actions, stopping when any agent's
/// episode ends or after `max_steps`.
pub fn run_episode<B: Backend, E: VecEnv>(
    policy: &Policy<B>,
    env: &mut E,
    seed: Option<u64>,
    max_steps: usize,
    device: &B::Device,
) -> Result<EvalReport, TrainError> {
    check_policy_fits(policy, env)?;

    let mut observations = env.reset(seed)?;
    let mut state: PolicyState<B> = None;
    let mut report = EvalReport::default();

    while report.length < max_steps {
        let (actions, next_state) = policy.act_deterministic(&observations, state, device)?;
        state = next_state;

        let actions: Vec<f32> = actions
            .into_data()
            .to_vec()
            .map_err(|e| TrainError::Learner(format!("action readback: {e:?}")))?;
        let batch = env.step(&actions)?;

        report.length += 1;
        report.total_reward += batch.rewards.iter().sum::<f32>();
        if let Some(summary) = batch.infos.into_iter().last() {
            report.summary = Some(summary);
        }

        let done = batch
            .terminals
            .iter()
            .zip(&batch.truncations)
            .any(|(terminal, truncated)| *terminal || *truncated);
        if done {
            break;
        }
        observations = batch.observations;
    }

    tracing::info!(
        "Evaluation episode: length={}, total_reward={:.3}",
        report.length,
        report.total_reward
    );
    Ok(report)
}
