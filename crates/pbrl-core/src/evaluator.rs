use crate::{
    agent::Agent, distributed::Replica, env::Env, metrics::EvaluateMetric, rng::PrngKey,
};
use anyhow::Result;
use candle_core::Device;
use tracing::debug;

/// Greedy evaluation on an environment that does not reset finished slots.
pub struct Evaluator<E: Env> {
    pub env: E,
    pub max_episode_steps: usize,
}

impl<E: Env> Evaluator<E> {
    pub fn new(env: E, max_episode_steps: usize) -> Self {
        Self {
            env,
            max_episode_steps,
        }
    }

    /// Runs at least `num_episodes` episodes (rounded up to whole batches of environments) and
    /// returns their mean return and length. With a replica handle the means are taken over the
    /// episodes of every replica.
    pub fn evaluate<A: Agent>(
        &self,
        agent: &A,
        agent_state: &A::State,
        num_episodes: usize,
        key: PrngKey,
        device: &Device,
        replica: Option<&Replica>,
    ) -> Result<EvaluateMetric> {
        let num_envs = self.env.num_envs();
        let num_batches = num_episodes.div_ceil(num_envs).max(1);
        let mut return_sum = 0f64;
        let mut length_sum = 0f64;
        for batch_key in key.split(num_batches) {
            let [reset_key, action_key] = batch_key.split_n();
            let mut state = self.env.reset(reset_key, device)?;
            for step_key in action_key.split(self.max_episode_steps) {
                let actions = agent.evaluate_actions(agent_state, &state.obs, step_key)?;
                state = self.env.step(&state, &actions)?;
                if state.done.sum_all()?.to_scalar::<f32>()? >= num_envs as f32 {
                    break;
                }
            }
            return_sum += state.info.episode_return.sum_all()?.to_scalar::<f32>()? as f64;
            length_sum += state.info.episode_length.sum_all()?.to_scalar::<f32>()? as f64;
        }
        let mut count = (num_batches * num_envs) as f64;
        if let Some(replica) = replica {
            return_sum = replica.all_reduce_sum(return_sum)?;
            length_sum = replica.all_reduce_sum(length_sum)?;
            count = replica.all_reduce_sum(count)?;
        }
        let metric = EvaluateMetric {
            episode_returns: return_sum / count,
            episode_lengths: length_sum / count,
        };
        debug!(?metric, "evaluation finished");
        Ok(metric)
    }
}
