//! Cost-aware Bayesian optimizer over the sweep parameter space
//!
//! Points live in search coordinates (see [`ValueSpace`]). The surrogate is a
//! kernel-weighted mean of normalized objectives with a distance-based
//! variance proxy; candidates are scored by upper confidence bound minus
//! penalties for nearby failures and for predicted cost over budget.
//!
//! [`ValueSpace`]: super::space::ValueSpace

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::backend::{SearchBackend, SearchError, SearchState, resample_due};
use super::history::{HistoryRecord, SweepHistory, timestamp};
use super::space::ParamSpec;
use super::suggestion::Suggestion;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BayesConfig {
    /// Drawn per process when unset
    pub seed: Option<u64>,
    /// Seconds; candidates predicted to cost more are penalized
    pub max_suggestion_cost: f64,
    /// Successes gathered by random sampling; twice the parameter count when unset
    pub num_random_samples: Option<usize>,
    /// Standard deviation of candidate perturbations in search coordinates
    pub initial_search_radius: f64,
    pub num_candidates_per_dim: usize,
    pub resample_frequency: usize,
    /// UCB exploration weight
    pub exploration_factor: f64,
    pub length_scale: f64,
}

impl Default for BayesConfig {
    fn default() -> Self {
        Self {
            seed: None,
            max_suggestion_cost: 1800.0,
            num_random_samples: None,
            initial_search_radius: 0.5,
            num_candidates_per_dim: 100,
            resample_frequency: 5,
            exploration_factor: 2.0,
            length_scale: 0.5,
        }
    }
}

#[derive(Debug, Clone)]
struct Observation {
    point: Vec<f64>,
    values: BTreeMap<String, f64>,
    objective: f64,
    cost: f64,
}

pub struct BayesBackend {
    params: Vec<ParamSpec>,
    config: BayesConfig,
    num_random_samples: usize,
    rng: StdRng,
    successes: Vec<Observation>,
    failures: Vec<Vec<f64>>,
    outstanding: BTreeMap<Uuid, BTreeMap<String, f64>>,
    resample_count: usize,
    /// Suggestion issued by this process and not yet resolved
    current: Option<Uuid>,
    history: Option<SweepHistory>,
}

impl BayesBackend {
    /// In-memory optimizer with no persisted history
    pub fn new(params: Vec<ParamSpec>, config: BayesConfig) -> Result<Self, SearchError> {
        if params.is_empty() {
            return Err(SearchError::EmptySpace);
        }
        if let Some(param) = params
            .iter()
            .find(|param| !param.space.contains(param.search_center))
        {
            return Err(SearchError::InvalidCenter {
                name: param.name.clone(),
                center: param.search_center,
            });
        }

        let num_random_samples = config.num_random_samples.unwrap_or(2 * params.len());
        let seed = config.seed.unwrap_or_else(rand::random);
        Ok(Self {
            params,
            num_random_samples,
            rng: StdRng::seed_from_u64(seed),
            config,
            successes: Vec::new(),
            failures: Vec::new(),
            outstanding: BTreeMap::new(),
            resample_count: 0,
            current: None,
            history: None,
        })
    }

    /// Rebuild the optimizer from a sweep's persisted history; new outcomes
    /// are appended to it.
    pub fn open(history: SweepHistory, config: BayesConfig) -> Result<Self, SearchError> {
        let mut backend = Self::new(history.manifest().params.clone(), config)?;
        for record in history.records()? {
            backend.replay(record);
        }
        backend.history = Some(history);

        let state = backend.state();
        tracing::info!(
            "Loaded optimizer state: success={} failures={} outstanding={} resample_count={}",
            state.successes,
            state.failures,
            state.outstanding,
            state.resample_count
        );
        Ok(backend)
    }

    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    /// Best observed objective and its values
    pub fn best(&self) -> Option<(f64, &BTreeMap<String, f64>)> {
        self.best_observation()
            .map(|observation| (observation.objective, &observation.values))
    }

    fn replay(&mut self, record: HistoryRecord) {
        match record {
            HistoryRecord::Suggested {
                id,
                values,
                resampled,
                ..
            } => {
                if resampled {
                    self.resample_count += 1;
                }
                self.outstanding.insert(id, values);
            }
            HistoryRecord::Observed {
                id,
                objective,
                cost,
                ..
            } => {
                if let Some(values) = self.outstanding.remove(&id) {
                    self.push_success(values, objective, cost);
                }
            }
            HistoryRecord::Failed { id, .. } => {
                if let Some(values) = self.outstanding.remove(&id) {
                    let point = self.to_point(&values);
                    self.failures.push(point);
                }
            }
        }
    }

    fn push_success(&mut self, values: BTreeMap<String, f64>, objective: f64, cost: f64) {
        let point = self.to_point(&values);
        self.successes.push(Observation {
            point,
            values,
            objective,
            cost,
        });
    }

    fn append(&self, record: HistoryRecord) -> Result<(), SearchError> {
        match &self.history {
            Some(history) => history.append(&record),
            None => Ok(()),
        }
    }

    fn to_point(&self, values: &BTreeMap<String, f64>) -> Vec<f64> {
        self.params
            .iter()
            .map(|param| {
                let value = values.get(&param.name).copied().unwrap_or(param.search_center);
                param.space.to_search(value)
            })
            .collect()
    }

    fn from_point(&self, point: &[f64]) -> BTreeMap<String, f64> {
        self.params
            .iter()
            .zip(point)
            .map(|(param, x)| (param.name.clone(), param.space.from_search(*x)))
            .collect()
    }

    fn center(&self) -> Vec<f64> {
        self.params
            .iter()
            .map(|param| param.space.to_search(param.search_center))
            .collect()
    }

    /// Standard normal sample (Box-Muller)
    fn gaussian(&mut self) -> f64 {
        let u1: f64 = self.rng.random::<f64>().max(f64::MIN_POSITIVE);
        let u2: f64 = self.rng.random();
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
    }

    fn perturb(&mut self, around: &[f64]) -> Vec<f64> {
        let radius = self.config.initial_search_radius;
        around
            .iter()
            .map(|x| x + radius * self.gaussian())
            .collect()
    }

    fn best_observation(&self) -> Option<&Observation> {
        self.successes
            .iter()
            .max_by(|a, b| a.objective.total_cmp(&b.objective))
    }

    fn kernel(&self, a: &[f64], b: &[f64]) -> f64 {
        let sq_dist: f64 = a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum();
        let length_scale = self.config.length_scale;
        (-sq_dist / (2.0 * length_scale * length_scale)).exp()
    }

    /// Acquisition value of a candidate point; higher is better
    fn score(&self, point: &[f64], objective_mean: f64, objective_std: f64) -> f64 {
        let weights: Vec<f64> = self
            .successes
            .iter()
            .map(|observation| self.kernel(point, &observation.point))
            .collect();
        let total_weight: f64 = weights.iter().sum();

        let (mean, predicted_cost) = if total_weight < 1e-10 {
            (0.0, 0.0)
        } else {
            let mean = weights
                .iter()
                .zip(&self.successes)
                .map(|(w, observation)| w * (observation.objective - objective_mean) / objective_std)
                .sum::<f64>()
                / total_weight;
            let cost = weights
                .iter()
                .zip(&self.successes)
                .map(|(w, observation)| w * observation.cost)
                .sum::<f64>()
                / total_weight;
            (mean, cost)
        };
        let max_kernel = weights.iter().fold(0.0f64, |a, &b| a.max(b));
        let variance = (1.0 - max_kernel).max(0.01);
        let ucb = mean + self.config.exploration_factor * variance.sqrt();

        let failure_penalty = self
            .failures
            .iter()
            .map(|failure| self.kernel(point, failure))
            .fold(0.0f64, f64::max);
        let cost_penalty = if predicted_cost > self.config.max_suggestion_cost {
            predicted_cost / self.config.max_suggestion_cost - 1.0
        } else {
            0.0
        };

        ucb - failure_penalty - cost_penalty
    }

    fn best_candidate(&mut self) -> BTreeMap<String, f64> {
        let anchor = self
            .best_observation()
            .map(|observation| observation.point.clone())
            .unwrap_or_else(|| self.center());

        let count = self.successes.len().max(1) as f64;
        let objective_mean = self.successes.iter().map(|o| o.objective).sum::<f64>() / count;
        let variance = self
            .successes
            .iter()
            .map(|o| (o.objective - objective_mean).powi(2))
            .sum::<f64>()
            / count;
        let objective_std = if variance > 1e-18 { variance.sqrt() } else { 1.0 };

        let num_candidates = self.config.num_candidates_per_dim * self.params.len();
        let mut best: Option<(f64, BTreeMap<String, f64>)> = None;
        for _ in 0..num_candidates.max(1) {
            let candidate = self.perturb(&anchor);
            // score the point actually issued after clamping and rounding
            let values = self.from_point(&candidate);
            let score = self.score(&self.to_point(&values), objective_mean, objective_std);
            if best.as_ref().is_none_or(|(best_score, _)| score > *best_score) {
                best = Some((score, values));
            }
        }

        best.map(|(_, values)| values)
            .unwrap_or_else(|| self.from_point(&anchor))
    }
}

impl SearchBackend for BayesBackend {
    fn suggest(&mut self) -> Result<Suggestion, SearchError> {
        let random_sampling = self.is_random_sampling();
        let resampled = self.will_resample();

        let values = if random_sampling {
            let center = self.center();
            let point = self.perturb(&center);
            self.from_point(&point)
        } else if let (true, Some(best)) = (resampled, self.best_observation()) {
            best.values.clone()
        } else {
            self.best_candidate()
        };

        let suggestion = Suggestion::new(values);
        self.append(HistoryRecord::Suggested {
            id: suggestion.id,
            values: suggestion.values.clone(),
            resampled,
            at: timestamp(),
        })?;

        if resampled {
            self.resample_count += 1;
        }
        self.outstanding
            .insert(suggestion.id, suggestion.values.clone());
        self.current = Some(suggestion.id);

        tracing::debug!(
            "Suggestion {} (random_sampling={} resampling={}): {:?}",
            suggestion.id,
            random_sampling,
            resampled,
            suggestion.values
        );
        Ok(suggestion)
    }

    fn record_observation(&mut self, objective: f64, cost: f64) -> Result<(), SearchError> {
        if !objective.is_finite() {
            return Err(SearchError::InvalidObjective(objective));
        }
        let id = self.current.ok_or(SearchError::NoOutstanding)?;
        self.append(HistoryRecord::Observed {
            id,
            objective,
            cost,
            at: timestamp(),
        })?;

        self.current = None;
        if let Some(values) = self.outstanding.remove(&id) {
            self.push_success(values, objective, cost);
        }
        Ok(())
    }

    fn record_failure(&mut self) -> Result<(), SearchError> {
        let id = self.current.ok_or(SearchError::NoOutstanding)?;
        self.append(HistoryRecord::Failed {
            id,
            at: timestamp(),
        })?;

        self.current = None;
        if let Some(values) = self.outstanding.remove(&id) {
            let point = self.to_point(&values);
            self.failures.push(point);
        }
        Ok(())
    }

    fn state(&self) -> SearchState {
        SearchState {
            successes: self.successes.len(),
            failures: self.failures.len(),
            outstanding: self.outstanding.len(),
            resample_count: self.resample_count,
        }
    }

    fn is_random_sampling(&self) -> bool {
        self.successes.len() < self.num_random_samples
    }

    fn will_resample(&self) -> bool {
        resample_due(
            &self.state(),
            self.is_random_sampling(),
            self.config.resample_frequency,
        )
    }
}
