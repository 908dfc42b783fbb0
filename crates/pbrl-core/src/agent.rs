use crate::{distributed::Replica, gradients::HasParams, rng::PrngKey, rollout::Trajectory};
use anyhow::Result;
use candle_core::{Device, Tensor};
use std::collections::BTreeMap;

/// Named scalar loss terms, e.g. `actor_loss`, `critic_loss`, `actor_entropy_loss`.
pub type LossDict = BTreeMap<String, Tensor>;

#[derive(Debug, Clone)]
pub struct PolicyExtras {
    /// Log-probability of the sampled actions under the behavior policy, `[B]`.
    pub logp: Tensor,
}

/// A policy together with its value function. The agent itself holds only structure and
/// constants; everything learnable or updated lives in `Self::State`.
pub trait Agent: Send + Sync {
    type State: HasParams + Clone + Send + Sync;

    fn init(&self, key: PrngKey, device: &Device) -> Result<Self::State>;

    /// Samples actions for a batch of observations `[B, obs_dim]`.
    fn compute_actions(
        &self,
        state: &Self::State,
        obs: &Tensor,
        key: PrngKey,
    ) -> Result<(Tensor, PolicyExtras)>;

    /// Deterministic actions (the mode of the policy), detached.
    fn evaluate_actions(&self, state: &Self::State, obs: &Tensor, key: PrngKey) -> Result<Tensor>;

    /// Loss terms over a flattened batch carrying targets and advantages.
    fn loss(&self, state: &Self::State, batch: &Trajectory, key: PrngKey) -> Result<LossDict>;

    fn compute_values(&self, state: &Self::State, obs: &Tensor) -> Result<Tensor>;

    /// Folds freshly collected observations (`[T, B, obs_dim]`) into any observation
    /// statistics the agent keeps.
    fn observe(
        &self,
        state: &Self::State,
        _obs: &Tensor,
        _replica: Option<&Replica>,
    ) -> Result<Self::State> {
        Ok(state.clone())
    }
}
