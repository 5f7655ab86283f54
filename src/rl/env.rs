//! Vectorized environment contract of the simulation engine

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::layout::NUM_WEAPONS;

#[derive(Debug, Error)]
pub enum EnvError {
    #[error("action buffer has length {got}, engine expects {expected}")]
    ActionShape { got: usize, expected: usize },
    #[error("environment is closed")]
    Closed,
    #[error("simulation engine failure: {0}")]
    Engine(String),
}

/// Periodic statistics report, keyed by statistic name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSummary {
    pub values: BTreeMap<String, f32>,
}

impl StatsSummary {
    pub fn get(&self, key: &str) -> Option<f32> {
        self.values.get(key).copied()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: f32) {
        self.values.insert(key.into(), value);
    }
}

/// Per-drone statistics aggregated by the engine over finished episodes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DroneStats {
    pub reward: f32,
    pub wins: f32,
    pub distance_traveled: f32,
    pub abs_distance_traveled: f32,
    pub shots_fired: [f32; NUM_WEAPONS],
    pub shots_hit: [f32; NUM_WEAPONS],
    pub shots_taken: [f32; NUM_WEAPONS],
    pub own_shots_taken: [f32; NUM_WEAPONS],
    pub weapons_picked_up: [f32; NUM_WEAPONS],
    pub shot_distances: [f32; NUM_WEAPONS],
}

/// Raw aggregated log drained from the engine
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineLog {
    /// Mean episode length; zero when no episode finished
    pub length: f32,
    pub stats: Vec<DroneStats>,
}

impl EngineLog {
    /// Flatten into named statistics for the first `num_drones` drones.
    /// Per-weapon counters are summed. Returns `None` for an empty log.
    pub fn summarize(&self, num_drones: usize) -> Option<StatsSummary> {
        if self.length <= 0.0 {
            return None;
        }

        let mut summary = StatsSummary::default();
        summary.insert("length", self.length);

        for (i, stats) in self.stats.iter().take(num_drones).enumerate() {
            let sum = |values: &[f32; NUM_WEAPONS]| values.iter().sum::<f32>();
            summary.insert(format!("drone_{i}_reward"), stats.reward);
            summary.insert(format!("drone_{i}_wins"), stats.wins);
            summary.insert(format!("drone_{i}_distance_traveled"), stats.distance_traveled);
            summary.insert(
                format!("drone_{i}_abs_distance_traveled"),
                stats.abs_distance_traveled,
            );
            summary.insert(format!("drone_{i}_shots_fired"), sum(&stats.shots_fired));
            summary.insert(format!("drone_{i}_shots_hit"), sum(&stats.shots_hit));
            summary.insert(format!("drone_{i}_shots_taken"), sum(&stats.shots_taken));
            summary.insert(format!("drone_{i}_own_shots_taken"), sum(&stats.own_shots_taken));
            summary.insert(
                format!("drone_{i}_weapons_picked_up"),
                sum(&stats.weapons_picked_up),
            );
            summary.insert(format!("drone_{i}_shots_distance"), sum(&stats.shot_distances));
        }

        Some(summary)
    }
}

/// Result of stepping every environment in the batch once
#[derive(Debug, Clone, Default)]
pub struct StepBatch {
    /// Flat `[num_agents * observation_size]` observations
    pub observations: Vec<f32>,
    pub rewards: Vec<f32>,
    pub terminals: Vec<bool>,
    pub truncations: Vec<bool>,
    /// Statistics reports emitted this step, usually empty
    pub infos: Vec<StatsSummary>,
}

/// Synchronous batch interface of the simulation engine.
///
/// `reset` and `step` block until every worker in the batch has advanced one
/// tick. Widths are engine constants and never change after construction.
pub trait VecEnv {
    /// Flat observation length per agent
    fn observation_size(&self) -> usize;

    /// Continuous action length per agent
    fn action_size(&self) -> usize;

    /// Agents across all environments in the batch
    fn num_agents(&self) -> usize;

    /// Returns flat `[num_agents * observation_size]` observations
    fn reset(&mut self, seed: Option<u64>) -> Result<Vec<f32>, EnvError>;

    /// `actions` is flat `[num_agents * action_size]`
    fn step(&mut self, actions: &[f32]) -> Result<StepBatch, EnvError>;

    fn close(&mut self);
}
