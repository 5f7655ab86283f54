//! Resumable Bayesian hyperparameter search across training processes

pub mod backend;
pub mod bayes;
pub mod controller;
pub mod history;
pub mod space;
pub mod suggestion;

pub use backend::{SearchBackend, SearchError, SearchState, resample_due};
pub use bayes::{BayesBackend, BayesConfig};
pub use controller::{
    ChildProcessLauncher, SweepController, SweepError, SweepPhase, TrialLauncher, TrialOutcome,
    forwarded_args,
};
pub use history::{HistoryRecord, SweepHistory, SweepManifest};
pub use space::{ParamSpec, SpaceKind, ValueSpace, default_params};
pub use suggestion::{Suggestion, TransformTable, ValueTransform, default_transforms};
