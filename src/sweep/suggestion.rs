//! Suggestions and the reversible transforms applied before training

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One proposed hyperparameter assignment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub id: Uuid,
    pub values: BTreeMap<String, f64>,
}

impl Suggestion {
    pub fn new(values: BTreeMap<String, f64>) -> Self {
        Self {
            id: Uuid::new_v4(),
            values,
        }
    }

    /// Optimizer values -> training values
    pub fn decode(&self, transforms: &TransformTable) -> Self {
        self.map_values(|name, value| {
            transforms
                .get(name)
                .map_or(value, |transform| transform.decode(value))
        })
    }

    /// Training values -> optimizer values
    pub fn encode(&self, transforms: &TransformTable) -> Self {
        self.map_values(|name, value| {
            transforms
                .get(name)
                .map_or(value, |transform| transform.encode(value))
        })
    }

    fn map_values(&self, f: impl Fn(&str, f64) -> f64) -> Self {
        Self {
            id: self.id,
            values: self
                .values
                .iter()
                .map(|(name, value)| (name.clone(), f(name, *value)))
                .collect(),
        }
    }
}

/// Reversible mapping between an optimizer value and a training value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueTransform {
    /// Searched as an integer exponent, trained as `2^e`
    Pow2Exponent,
}

impl ValueTransform {
    pub fn decode(&self, value: f64) -> f64 {
        match self {
            Self::Pow2Exponent => 2f64.powi(value.round() as i32),
        }
    }

    pub fn encode(&self, value: f64) -> f64 {
        match self {
            Self::Pow2Exponent => value.log2().round(),
        }
    }
}

pub type TransformTable = BTreeMap<String, ValueTransform>;

pub fn default_transforms() -> TransformTable {
    BTreeMap::from([("bptt_horizon".to_string(), ValueTransform::Pow2Exponent)])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pow2_exponent_round_trip() {
        let transform = ValueTransform::Pow2Exponent;
        for exponent in 0..=16 {
            let exponent = exponent as f64;
            assert_eq!(transform.encode(transform.decode(exponent)), exponent);
        }
        for horizon in [1.0, 16.0, 64.0, 256.0, 65_536.0] {
            assert_eq!(transform.decode(transform.encode(horizon)), horizon);
        }
    }

    #[test]
    fn test_suggestion_decode_only_touches_transformed() {
        let transforms = default_transforms();
        let suggestion = Suggestion::new(BTreeMap::from([
            ("bptt_horizon".to_string(), 6.0),
            ("gamma".to_string(), 0.99),
        ]));

        let decoded = suggestion.decode(&transforms);
        assert_eq!(decoded.id, suggestion.id);
        assert_eq!(decoded.values["bptt_horizon"], 64.0);
        assert_eq!(decoded.values["gamma"], 0.99);
        assert_eq!(decoded.encode(&transforms), suggestion);
    }
}
