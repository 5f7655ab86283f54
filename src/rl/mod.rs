//! Policy architecture and training loop for the drone arena
//!
//! # Architecture
//!
//! ```text
//! VecEnv (external simulation engine)
//!     │  flat [num_agents, obs_len] observations
//!     ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  ObservationEncoder                                         │
//! │  - EntityEmbedding: per-slot embeddings + map CNN           │
//! │  - MultiHot: offset one-hot map channels + scalar MLP       │
//! └─────────────────────────────────────────────────────────────┘
//!     │  [batch, 256]
//!     ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Optional LSTM (state carried between steps)                │
//! └─────────────────────────────────────────────────────────────┘
//!     │
//!     ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  ActorCriticHead                                            │
//! │  - Actor: mean + state-independent log-std                  │
//! │  - Critic: scalar value                                     │
//! └─────────────────────────────────────────────────────────────┘
//!     │  continuous actions in [-1, 1]
//!     ▼
//! TrainLoop (evaluate / train alternation via an external Learner)
//! ```

pub mod checkpoint;
pub mod encoder;
pub mod env;
pub mod eval;
pub mod layout;
pub mod metrics;
pub mod policy;
pub mod train;

pub use checkpoint::{CheckpointError, CheckpointStore, load_policy};
pub use encoder::{EncoderConfig, EncoderKind, FeatureEncoder, ObservationEncoder};
pub use env::{DroneStats, EngineLog, EnvError, StatsSummary, StepBatch, VecEnv};
pub use eval::{EvalReport, run_episode};
pub use layout::{LayoutError, MultiHotLayout, ObsLayout};
pub use metrics::{MovingAverage, StatsLogger, TrainingMetrics};
pub use policy::{ActorCriticHead, DiagGaussian, Policy, PolicyConfig, PolicyOutput, PolicyState};
pub use train::{
    Learner, LoopConfig, LoopState, TrainError, TrainLoop, TrainOutcome, check_policy_fits,
};
