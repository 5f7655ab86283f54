//! Hyperparameter value spaces
//!
//! The optimizer works in an unbounded "search" coordinate per parameter.
//! Each space maps natural values there and back:
//! linear `v / scale`, log `ln(v) / scale`, logit `ln(v / (1 - v)) / scale`.

use serde::{Deserialize, Serialize};

/// Search coordinates of logit spaces are clamped here so the decoded value
/// stays strictly inside (0, 1)
const LOGIT_SEARCH_LIMIT: f64 = 20.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpaceKind {
    Linear,
    Log,
    Logit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueSpace {
    pub kind: SpaceKind,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub scale: f64,
    #[serde(default)]
    pub is_integer: bool,
    /// Natural values snap to multiples of this
    #[serde(default)]
    pub rounding_factor: Option<f64>,
}

impl ValueSpace {
    pub fn linear(scale: f64) -> Self {
        Self {
            kind: SpaceKind::Linear,
            min: None,
            max: None,
            scale,
            is_integer: false,
            rounding_factor: None,
        }
    }

    pub fn log(scale: f64) -> Self {
        Self {
            kind: SpaceKind::Log,
            ..Self::linear(scale)
        }
    }

    pub fn logit(scale: f64) -> Self {
        Self {
            kind: SpaceKind::Logit,
            min: Some(0.0),
            max: Some(1.0),
            ..Self::linear(scale)
        }
    }

    pub fn with_min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    pub fn with_max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }

    pub fn integer(mut self) -> Self {
        self.is_integer = true;
        self
    }

    pub fn with_rounding(mut self, factor: f64) -> Self {
        self.rounding_factor = Some(factor);
        self
    }

    /// Natural value -> search coordinate
    pub fn to_search(&self, value: f64) -> f64 {
        let raw = match self.kind {
            SpaceKind::Linear => value,
            SpaceKind::Log => value.ln(),
            SpaceKind::Logit => (value / (1.0 - value)).ln(),
        };
        raw / self.scale
    }

    /// Search coordinate -> natural value, clamped to bounds and rounded
    pub fn from_search(&self, x: f64) -> f64 {
        let raw = x * self.scale;
        let value = match self.kind {
            SpaceKind::Linear => raw,
            SpaceKind::Log => raw.exp(),
            SpaceKind::Logit => {
                let limited = raw.clamp(-LOGIT_SEARCH_LIMIT, LOGIT_SEARCH_LIMIT);
                1.0 / (1.0 + (-limited).exp())
            }
        };
        self.round(self.clamp(value))
    }

    pub fn contains(&self, value: f64) -> bool {
        let open = matches!(self.kind, SpaceKind::Logit);
        let above_min = self.min.is_none_or(|min| if open { value > min } else { value >= min });
        let below_max = self.max.is_none_or(|max| if open { value < max } else { value <= max });
        let in_domain = match self.kind {
            SpaceKind::Linear => true,
            SpaceKind::Log => value > 0.0,
            SpaceKind::Logit => value > 0.0 && value < 1.0,
        };
        value.is_finite() && above_min && below_max && in_domain
    }

    fn clamp(&self, value: f64) -> f64 {
        // Logit bounds are the open ends of the domain itself
        if self.kind == SpaceKind::Logit {
            return value;
        }
        let value = self.min.map_or(value, |min| value.max(min));
        self.max.map_or(value, |max| value.min(max))
    }

    fn round(&self, value: f64) -> f64 {
        let value = match self.rounding_factor {
            Some(factor) if factor > 0.0 => (value / factor).round() * factor,
            _ => value,
        };
        if self.is_integer { value.round() } else { value }
    }
}

/// One searched hyperparameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub space: ValueSpace,
    /// Natural value the random phase samples around
    pub search_center: f64,
}

impl ParamSpec {
    pub fn new(name: impl Into<String>, space: ValueSpace, search_center: f64) -> Self {
        Self {
            name: name.into(),
            space,
            search_center,
        }
    }
}

/// Default search over the PPO hyperparameters.
///
/// `bptt_horizon` is searched as its base-2 exponent.
pub fn default_params() -> Vec<ParamSpec> {
    vec![
        ParamSpec::new(
            "total_timesteps",
            ValueSpace::linear(100_000_000.0)
                .with_min(100_000_000.0)
                .with_rounding(10_000_000.0)
                .integer(),
            150_000_000.0,
        ),
        ParamSpec::new(
            "bptt_horizon",
            ValueSpace::linear(3.0).with_min(4.0).with_max(8.0).integer(),
            5.0,
        ),
        ParamSpec::new("ent_coef", ValueSpace::log(1.0), 0.0005),
        ParamSpec::new("gae_lambda", ValueSpace::logit(0.5), 0.95),
        ParamSpec::new("gamma", ValueSpace::logit(0.5), 0.99),
        ParamSpec::new("learning_rate", ValueSpace::log(1.0), 0.0001),
        ParamSpec::new("max_grad_norm", ValueSpace::linear(2.0).with_min(0.0), 1.0),
        ParamSpec::new("vf_coef", ValueSpace::logit(0.5), 0.5),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() <= 1e-9 * b.abs().max(1.0), "{a} != {b}");
    }

    #[test]
    fn test_linear_round_trip() {
        let space = ValueSpace::linear(2.0).with_min(0.0);
        for value in [0.0, 0.3, 1.0, 7.5] {
            assert_close(space.from_search(space.to_search(value)), value);
        }
        assert_close(space.to_search(1.0), 0.5);
    }

    #[test]
    fn test_log_round_trip() {
        let space = ValueSpace::log(1.0);
        for value in [1e-6, 0.0005, 0.0003, 1.0, 42.0] {
            assert_close(space.from_search(space.to_search(value)), value);
        }
    }

    #[test]
    fn test_logit_round_trip_and_open_bounds() {
        let space = ValueSpace::logit(0.5);
        for value in [0.01, 0.5, 0.9, 0.95, 0.99] {
            assert_close(space.from_search(space.to_search(value)), value);
        }
        for x in [-1e6, 1e6] {
            let value = space.from_search(x);
            assert!(value > 0.0 && value < 1.0);
        }
    }

    #[test]
    fn test_clamp_and_rounding() {
        let params = default_params();
        let steps = &params[0].space;
        assert_eq!(steps.from_search(0.0), 100_000_000.0);
        assert_eq!(steps.from_search(1.234_567), 120_000_000.0);

        let horizon = &params[1].space;
        assert_eq!(horizon.from_search(10.0), 8.0);
        assert_eq!(horizon.from_search(5.4 / 3.0), 5.0);
    }

    #[test]
    fn test_default_centers_inside_spaces() {
        for param in default_params() {
            assert!(
                param.space.contains(param.search_center),
                "{} center outside its space",
                param.name
            );
            assert!(param.space.to_search(param.search_center).is_finite());
        }
    }

    #[test]
    fn test_contains() {
        let space = ValueSpace::logit(0.5);
        assert!(!space.contains(0.0));
        assert!(!space.contains(1.0));
        assert!(!ValueSpace::log(1.0).contains(0.0));
        assert!(ValueSpace::linear(1.0).with_max(8.0).contains(8.0));
        assert!(!ValueSpace::linear(1.0).with_max(8.0).contains(8.5));
    }
}
