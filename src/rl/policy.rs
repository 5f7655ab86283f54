//! Actor-critic policy: encoder, optional LSTM, Gaussian action head

use burn::module::{Module, Param};
use burn::nn::{Initializer, Linear, LinearConfig, Lstm, LstmConfig, LstmState};
use burn::prelude::*;
use burn::tensor::Distribution;

use super::encoder::{EncoderConfig, FeatureEncoder, ObservationEncoder};
use super::layout::{ACTION_HIGH, ACTION_LOW, ACTION_SIZE, LayoutError};

/// log-std is clamped to this range before exponentiating
pub const LOG_STD_MIN: f32 = -20.0;
pub const LOG_STD_MAX: f32 = 2.0;

const LOG_2PI: f32 = 1.837_877_1;

/// Recurrent state carried between steps; `None` starts a fresh sequence
pub type PolicyState<B> = Option<LstmState<B, 2>>;

/// Configuration for the full policy
#[derive(Config, Debug)]
pub struct PolicyConfig {
    #[config(default = "EncoderConfig::new()")]
    pub encoder: EncoderConfig,
    /// Wrap the encoder output in an LSTM
    #[config(default = true)]
    pub recurrent: bool,
    #[config(default = 256)]
    pub lstm_hidden_size: usize,
    #[config(default = "ACTION_SIZE")]
    pub action_size: usize,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<Policy<B>, LayoutError> {
        Policy::new(device, self)
    }
}

/// Independent per-dimension Gaussian over continuous actions
#[derive(Debug, Clone)]
pub struct DiagGaussian<B: Backend> {
    pub mean: Tensor<B, 2>,
    pub std: Tensor<B, 2>,
}

impl<B: Backend> DiagGaussian<B> {
    pub fn sample(&self) -> Tensor<B, 2> {
        let noise = Tensor::<B, 2>::random(
            self.mean.shape(),
            Distribution::Normal(0.0, 1.0),
            &self.mean.device(),
        );
        self.mean.clone() + self.std.clone() * noise
    }

    /// Deterministic action
    pub fn mode(&self) -> Tensor<B, 2> {
        self.mean.clone()
    }

    /// Summed log density of `actions` across action dimensions
    pub fn log_prob(&self, actions: Tensor<B, 2>) -> Tensor<B, 1> {
        let z = (actions - self.mean.clone()) / self.std.clone();
        let per_dim = z.powf_scalar(2.0) * -0.5 - self.std.clone().log() - LOG_2PI * 0.5;
        per_dim.sum_dim(1).squeeze(1)
    }

    pub fn entropy(&self) -> Tensor<B, 1> {
        let per_dim = self.std.clone().log() + 0.5 * (1.0 + LOG_2PI);
        per_dim.sum_dim(1).squeeze(1)
    }
}

/// Maps an encoded feature to an action distribution and a value estimate
#[derive(Module, Debug)]
pub struct ActorCriticHead<B: Backend> {
    actor_mean: Linear<B>,
    /// State-independent, shared across the batch
    actor_log_std: Param<Tensor<B, 2>>,
    critic: Linear<B>,
}

impl<B: Backend> ActorCriticHead<B> {
    pub fn new(device: &B::Device, input_size: usize, action_size: usize) -> Self {
        Self {
            actor_mean: LinearConfig::new(input_size, action_size)
                .with_initializer(Initializer::XavierUniform { gain: 0.01 })
                .init(device),
            actor_log_std: Param::from_tensor(Tensor::zeros([1, action_size], device)),
            critic: LinearConfig::new(input_size, 1)
                .with_initializer(Initializer::XavierUniform { gain: 1.0 })
                .init(device),
        }
    }

    /// Strictly positive standard deviation row `[1, action_size]`
    pub fn std(&self) -> Tensor<B, 2> {
        self.actor_log_std
            .val()
            .clamp(LOG_STD_MIN, LOG_STD_MAX)
            .exp()
    }

    /// Returns the action distribution and `[batch]` values
    pub fn forward(&self, hidden: Tensor<B, 2>) -> (DiagGaussian<B>, Tensor<B, 1>) {
        let mean = self.actor_mean.forward(hidden.clone());
        let std = Tensor::ones_like(&mean) * self.std();
        let value = self.critic.forward(hidden).squeeze(1);

        (DiagGaussian { mean, std }, value)
    }
}

/// Output of one policy step
pub struct PolicyOutput<B: Backend> {
    pub distribution: DiagGaussian<B>,
    pub value: Tensor<B, 1>,
    pub state: PolicyState<B>,
}

impl<B: Backend> std::fmt::Debug for PolicyOutput<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyOutput")
            .field("distribution", &self.distribution)
            .field("value", &self.value)
            .field("has_state", &self.state.is_some())
            .finish()
    }
}

/// Encoder -> optional LSTM -> actor-critic head
#[derive(Module, Debug)]
pub struct Policy<B: Backend> {
    encoder: ObservationEncoder<B>,
    lstm: Option<Lstm<B>>,
    head: ActorCriticHead<B>,
    action_size: usize,
}

impl<B: Backend> Policy<B> {
    pub fn new(device: &B::Device, config: &PolicyConfig) -> Result<Self, LayoutError> {
        let encoder = config.encoder.init(device)?;
        let features = encoder.output_size();

        let (lstm, head_input) = if config.recurrent {
            let lstm = LstmConfig::new(features, config.lstm_hidden_size, true).init(device);
            (Some(lstm), config.lstm_hidden_size)
        } else {
            (None, features)
        };

        Ok(Self {
            encoder,
            lstm,
            head: ActorCriticHead::new(device, head_input, config.action_size),
            action_size: config.action_size,
        })
    }

    pub fn is_recurrent(&self) -> bool {
        self.lstm.is_some()
    }

    pub fn observation_size(&self) -> usize {
        self.encoder.observation_size()
    }

    pub fn action_size(&self) -> usize {
        self.action_size
    }

    pub fn head(&self) -> &ActorCriticHead<B> {
        &self.head
    }

    /// One step over `[batch, obs_len]` observations whose codes are known
    /// to be in range.
    ///
    /// Non-recurrent policies ignore `state` and always return `None`.
    pub fn forward(&self, obs: Tensor<B, 2>, state: PolicyState<B>) -> PolicyOutput<B> {
        let features = self.encoder.encode(obs);
        self.forward_features(features, state)
    }

    /// One step over a flat engine buffer, validated against the layout first
    pub fn forward_observations(
        &self,
        observations: &[f32],
        state: PolicyState<B>,
        device: &B::Device,
    ) -> Result<PolicyOutput<B>, LayoutError> {
        let features = self.encoder.encode_observations(observations, device)?;
        Ok(self.forward_features(features, state))
    }

    fn forward_features(&self, features: Tensor<B, 2>, state: PolicyState<B>) -> PolicyOutput<B> {
        let (hidden, state) = match &self.lstm {
            Some(lstm) => {
                let [batch, width] = features.dims();
                let (output, next) = lstm.forward(features.reshape([batch, 1, width]), state);
                let [_, _, hidden_size] = output.dims();
                (output.reshape([batch, hidden_size]), Some(next))
            }
            None => (features, None),
        };

        let (distribution, value) = self.head.forward(hidden);
        PolicyOutput {
            distribution,
            value,
            state,
        }
    }

    /// Deterministic action clamped to the engine's action range
    pub fn act_deterministic(
        &self,
        observations: &[f32],
        state: PolicyState<B>,
        device: &B::Device,
    ) -> Result<(Tensor<B, 2>, PolicyState<B>), LayoutError> {
        let output = self.forward_observations(observations, state, device)?;
        let actions = output.distribution.mode().clamp(ACTION_LOW, ACTION_HIGH);
        Ok((actions, output.state))
    }
}
