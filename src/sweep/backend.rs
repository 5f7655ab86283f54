//! Optimizer interface used by the sweep controller

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::suggestion::Suggestion;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("sweep history {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed sweep manifest {path}: {source}")]
    Manifest {
        path: std::path::PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("serialize sweep record: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("no suggestion is outstanding in this process")]
    NoOutstanding,
    #[error("objective {0} is not finite")]
    InvalidObjective(f64),
    #[error("parameter space is empty")]
    EmptySpace,
    #[error("search center of {name} ({center}) is outside its space")]
    InvalidCenter { name: String, center: f64 },
    #[error("sweep {0} not found")]
    UnknownSweep(String),
}

/// Counts describing the optimizer's progress
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchState {
    pub successes: usize,
    pub failures: usize,
    /// Suggestions issued without a recorded outcome, across all trials
    pub outstanding: usize,
    pub resample_count: usize,
}

/// Whether the next suggestion may re-issue an explored point.
///
/// A zero `resample_frequency` disables resampling.
pub fn resample_due(state: &SearchState, random_sampling: bool, resample_frequency: usize) -> bool {
    resample_frequency > 0
        && !random_sampling
        && state.successes > (state.resample_count + 1) * resample_frequency
}

/// Bayesian optimizer. Observations and failures apply to the suggestion
/// most recently issued by this instance.
pub trait SearchBackend {
    fn suggest(&mut self) -> Result<Suggestion, SearchError>;

    fn record_observation(&mut self, objective: f64, cost: f64) -> Result<(), SearchError>;

    fn record_failure(&mut self) -> Result<(), SearchError>;

    fn state(&self) -> SearchState;

    /// Still in the initial random-sampling phase
    fn is_random_sampling(&self) -> bool;

    /// Whether the next `suggest` would resample
    fn will_resample(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(successes: usize, resample_count: usize) -> SearchState {
        SearchState {
            successes,
            resample_count,
            ..SearchState::default()
        }
    }

    #[test]
    fn test_resample_boundary() {
        // threshold (1 + 1) * 5 = 10
        assert!(!resample_due(&state(10, 1), false, 5));
        assert!(resample_due(&state(11, 1), false, 5));
        // first resample threshold is 5
        assert!(!resample_due(&state(5, 0), false, 5));
        assert!(resample_due(&state(6, 0), false, 5));
    }

    #[test]
    fn test_no_resample_while_random_sampling() {
        assert!(!resample_due(&state(100, 0), true, 5));
    }

    #[test]
    fn test_zero_frequency_disables_resampling() {
        assert!(!resample_due(&state(100, 0), false, 0));
    }
}
