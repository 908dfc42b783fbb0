pub mod cartpole;

use anyhow::{Result, bail};
use cartpole::CartPole;
use pbrl_core::error::Error;
use serde::{Deserialize, Serialize};

/// What happens to a slot once its episode is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoresetMode {
    /// The step after `done` resets the slot. That step ignores the action, yields reward 0 and
    /// is flagged with `autoreset`.
    Envpool,
    /// Finished slots stay finished. Used for evaluation.
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EnvConfig {
    pub env_name: String,
    pub max_episode_steps: usize,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            env_name: "CartPole-v1".into(),
            max_episode_steps: cartpole::DEFAULT_MAX_STEPS,
        }
    }
}

pub fn make_env(
    env_name: &str,
    num_envs: usize,
    max_episode_steps: usize,
    autoreset_mode: AutoresetMode,
) -> Result<CartPole> {
    if num_envs == 0 {
        bail!(Error::unsupported("num_envs", num_envs));
    }
    match env_name {
        "CartPole-v1" | "CartPole" | "cartpole" => Ok(CartPole::new(
            num_envs,
            max_episode_steps,
            autoreset_mode,
        )),
        other => bail!(Error::unsupported("env_name", other)),
    }
}

impl EnvConfig {
    pub fn make(&self, num_envs: usize, autoreset_mode: AutoresetMode) -> Result<CartPole> {
        make_env(
            &self.env_name,
            num_envs,
            self.max_episode_steps,
            autoreset_mode,
        )
    }
}
