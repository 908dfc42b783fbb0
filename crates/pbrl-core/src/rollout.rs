use crate::{
    agent::Agent,
    distributed::Replica,
    env::{Env, EnvState},
    rng::PrngKey,
    tensor::{flatten_leading, select_rows},
};
use anyhow::Result;
use candle_core::Tensor;

/// Transitions collected by [`rollout`]. Fresh trajectories are `[T, B, ...]`; after
/// [`Trajectory::flatten`] the leading axes are merged into one of size `T * B`.
#[derive(Debug, Clone)]
pub struct Trajectory {
    pub obs: Tensor,
    /// `u32`
    pub actions: Tensor,
    pub rewards: Tensor,
    pub dones: Tensor,
    pub next_obs: Tensor,
    /// Behavior policy log-probabilities.
    pub logp: Tensor,
    pub autoreset: Tensor,
    pub episode_return: Tensor,
    pub v_targets: Option<Tensor>,
    pub advantages: Option<Tensor>,
}

impl Trajectory {
    /// Number of transitions along the leading axis.
    pub fn len(&self) -> usize {
        self.rewards.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn try_map(&self, f: impl Fn(&Tensor) -> Result<Tensor>) -> Result<Self> {
        Ok(Self {
            obs: f(&self.obs)?,
            actions: f(&self.actions)?,
            rewards: f(&self.rewards)?,
            dones: f(&self.dones)?,
            next_obs: f(&self.next_obs)?,
            logp: f(&self.logp)?,
            autoreset: f(&self.autoreset)?,
            episode_return: f(&self.episode_return)?,
            v_targets: self.v_targets.as_ref().map(&f).transpose()?,
            advantages: self.advantages.as_ref().map(&f).transpose()?,
        })
    }

    /// `[T, B, ...] -> [T * B, ...]`
    pub fn flatten(&self) -> Result<Self> {
        self.try_map(flatten_leading)
    }

    /// Gathers the given rows of a flattened trajectory.
    pub fn select(&self, indices: &[usize]) -> Result<Self> {
        self.try_map(|t| select_rows(t, indices))
    }

    pub fn detach(&self) -> Result<Self> {
        self.try_map(|t| Ok(t.detach()))
    }
}

/// Unrolls the agent for `rollout_length` steps from `env_state`.
pub fn rollout<E: Env, A: Agent>(
    env: &E,
    agent: &A,
    env_state: &EnvState<E::Inner>,
    agent_state: &A::State,
    key: PrngKey,
    rollout_length: usize,
) -> Result<(Trajectory, EnvState<E::Inner>)> {
    let mut obs = Vec::with_capacity(rollout_length);
    let mut actions = Vec::with_capacity(rollout_length);
    let mut rewards = Vec::with_capacity(rollout_length);
    let mut dones = Vec::with_capacity(rollout_length);
    let mut next_obs = Vec::with_capacity(rollout_length);
    let mut logp = Vec::with_capacity(rollout_length);
    let mut autoreset = Vec::with_capacity(rollout_length);
    let mut episode_return = Vec::with_capacity(rollout_length);

    let mut state = env_state.clone();
    for step_key in key.split(rollout_length) {
        let (action, extras) = agent.compute_actions(agent_state, &state.obs, step_key)?;
        let action = action.detach();
        let next_state = env.step(&state, &action)?;
        obs.push(state.obs.clone());
        actions.push(action);
        rewards.push(next_state.reward.clone());
        dones.push(next_state.done.clone());
        next_obs.push(next_state.obs.clone());
        logp.push(extras.logp.detach());
        autoreset.push(next_state.info.autoreset.clone());
        episode_return.push(next_state.info.episode_return.clone());
        state = next_state;
    }

    let trajectory = Trajectory {
        obs: Tensor::stack(&obs, 0)?,
        actions: Tensor::stack(&actions, 0)?,
        rewards: Tensor::stack(&rewards, 0)?,
        dones: Tensor::stack(&dones, 0)?,
        next_obs: Tensor::stack(&next_obs, 0)?,
        logp: Tensor::stack(&logp, 0)?,
        autoreset: Tensor::stack(&autoreset, 0)?,
        episode_return: Tensor::stack(&episode_return, 0)?,
        v_targets: None,
        advantages: None,
    };
    Ok((trajectory, state))
}

/// Mean return of the episodes that finished inside the trajectory, summed over replicas when a
/// replica handle is given. `None` when no episode finished anywhere.
pub fn average_episode_return(
    episode_return: &Tensor,
    dones: &Tensor,
    replica: Option<&Replica>,
) -> Result<Option<f64>> {
    let mut total = episode_return.mul(dones)?.sum_all()?.to_scalar::<f32>()? as f64;
    let mut count = dones.sum_all()?.to_scalar::<f32>()? as f64;
    if let Some(replica) = replica {
        total = replica.all_reduce_sum(total)?;
        count = replica.all_reduce_sum(count)?;
    }
    if count > 0. {
        Ok(Some(total / count))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod test {
    use super::average_episode_return;
    use anyhow::Result;
    use candle_core::{Device, Tensor};

    #[test]
    fn average_over_finished_episodes() -> Result<()> {
        let returns = Tensor::new(&[[1f32, 4.], [2., 5.], [3., 6.]], &Device::Cpu)?;
        let dones = Tensor::new(&[[0f32, 0.], [1., 0.], [0., 1.]], &Device::Cpu)?;
        assert_eq!(average_episode_return(&returns, &dones, None)?, Some(4.));
        let none = dones.zeros_like()?;
        assert_eq!(average_episode_return(&returns, &none, None)?, None);
        Ok(())
    }
}
