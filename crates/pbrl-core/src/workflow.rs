use crate::{
    checkpoint::Checkpoint,
    metrics::{EvaluateMetric, TrainMetric, WorkflowMetric},
    rng::PrngKey,
};
use anyhow::Result;
use candle_core::Device;
use serde::{Deserialize, Serialize};

/// Hyperparameters a population member can have perturbed between iterations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HyperParams {
    pub lr: f64,
}

/// A training procedure driven one step at a time. `step` and `evaluate` are pure in the
/// state: the input is left untouched and the successor is returned.
pub trait Workflow: Send + Sync {
    type State: WorkflowState;

    fn setup(&self, key: PrngKey, device: &Device) -> Result<Self::State>;

    fn step(&self, state: &Self::State) -> Result<(TrainMetric, Self::State)>;

    fn evaluate(&self, state: &Self::State) -> Result<(EvaluateMetric, Self::State)>;
}

/// What a population based scheduler needs to know about a member's training state.
pub trait WorkflowState: Clone + Send + Sync + Checkpoint {
    fn metrics(&self) -> &WorkflowMetric;

    /// Copy that shares no tensor storage with `self`.
    fn deep_copy(&self) -> Result<Self>;

    /// Same state with every tensor on `device`.
    fn to_device(&self, device: &Device) -> Result<Self>;

    /// Same state drawing its randomness from `key` from now on.
    fn with_key(&self, key: PrngKey) -> Self;

    fn hyperparams(&self) -> HyperParams;

    /// Same state with `hyperparams` written into the optimizer state. Step counters and
    /// moment estimates are kept.
    fn apply_hyperparams(&self, hyperparams: &HyperParams) -> Self;
}
