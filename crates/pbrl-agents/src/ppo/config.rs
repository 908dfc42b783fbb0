use crate::networks::NetworkConfig;
use pbrl_core::optimizer::OptimizerConfig;
use pbrl_gym::EnvConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

pub const ACTOR_LOSS: &str = "actor_loss";
pub const CRITIC_LOSS: &str = "critic_loss";
pub const ACTOR_ENTROPY_LOSS: &str = "actor_entropy_loss";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PpoConfig {
    pub env: EnvConfig,
    pub agent_network: NetworkConfig,
    pub optimizer: OptimizerConfig,
    /// Training environments, summed over all replicas.
    pub num_envs: usize,
    pub num_eval_envs: usize,
    pub rollout_length: usize,
    pub total_timesteps: u64,
    /// Minibatch size, summed over all replicas.
    pub minibatch_size: usize,
    pub reuse_rollout_epochs: usize,
    pub discount: f32,
    pub gae_lambda: f32,
    pub clip_epsilon: f32,
    pub normalize_obs: bool,
    pub normalize_gae: bool,
    /// Weight of every named loss term in the optimized scalar. Negative weights maximize.
    pub loss_weights: BTreeMap<String, f64>,
    pub eval_interval: u64,
    pub eval_episodes: usize,
}

impl Default for PpoConfig {
    fn default() -> Self {
        Self {
            env: EnvConfig::default(),
            agent_network: NetworkConfig::default(),
            optimizer: OptimizerConfig::default(),
            num_envs: 8,
            num_eval_envs: 8,
            rollout_length: 128,
            total_timesteps: 200_000,
            minibatch_size: 256,
            reuse_rollout_epochs: 4,
            discount: 0.99,
            gae_lambda: 0.95,
            clip_epsilon: 0.2,
            normalize_obs: false,
            normalize_gae: false,
            loss_weights: [
                (ACTOR_LOSS.to_string(), 1.),
                (CRITIC_LOSS.to_string(), 0.5),
                (ACTOR_ENTROPY_LOSS.to_string(), -0.01),
            ]
            .into(),
            eval_interval: 10,
            eval_episodes: 16,
        }
    }
}

impl PpoConfig {
    /// Splits the global env counts and minibatch size over `num_replicas`, truncating and
    /// warning where they do not divide.
    pub fn rescale(&self, num_replicas: usize) -> PpoConfig {
        let num_replicas = num_replicas.max(1);
        let mut config = self.clone();
        for (name, value) in [
            ("num_envs", &mut config.num_envs),
            ("num_eval_envs", &mut config.num_eval_envs),
            ("minibatch_size", &mut config.minibatch_size),
        ] {
            if *value % num_replicas != 0 {
                warn!(
                    "{name} ({value}) cannot be divided by the number of replicas \
                     ({num_replicas}), rescaled to {} per replica",
                    *value / num_replicas
                );
            }
            *value /= num_replicas;
        }
        config
    }
}
