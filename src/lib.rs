pub mod app;
pub mod config;
pub mod rl;
pub mod sweep;

// Re-export commonly used types for convenience
pub use app::{Engine, EngineRuntime, TrainingRuntime};
pub use config::{AppConfig, ConfigError};
pub use rl::{Policy, PolicyConfig, TrainLoop, TrainOutcome, VecEnv};
pub use sweep::{SweepController, SweepError};
