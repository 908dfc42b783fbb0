use super::config::{ACTOR_ENTROPY_LOSS, ACTOR_LOSS, CRITIC_LOSS};
use crate::{
    distributions::Categorical,
    networks::{Mlp, NetworkConfig},
};
use anyhow::{Result, bail};
use candle_core::{D, Device, Tensor};
use pbrl_core::{
    agent::{Agent, LossDict, PolicyExtras},
    distributed::Replica,
    env::Space,
    error::Error,
    gradients::HasParams,
    rng::PrngKey,
    rollout::Trajectory,
    running_mean::RunningMeanStd,
    tensor::{Logp, LogpDiff, Params, PolicyLoss, ValueLoss, ValuesPred, masked_mean},
};
use std::collections::HashMap;
use std::ops::Deref;

#[derive(Debug, Clone)]
pub struct PpoAgentState {
    /// Policy and value parameters, `policy*` and `value*` entries.
    pub params: Params,
    pub obs_stats: Option<RunningMeanStd>,
}

impl HasParams for PpoAgentState {
    fn params(&self) -> &Params {
        &self.params
    }

    fn with_params(&self, params: Params) -> Self {
        Self {
            params,
            obs_stats: self.obs_stats.clone(),
        }
    }
}

impl PpoAgentState {
    pub fn deep_copy(&self) -> Result<Self> {
        let obs_stats = match &self.obs_stats {
            Some(stats) => Some(RunningMeanStd {
                mean: stats.mean.copy()?,
                var: stats.var.copy()?,
                count: stats.count,
            }),
            None => None,
        };
        Ok(Self {
            params: self.params.deep_copy()?,
            obs_stats,
        })
    }

    pub fn to_device(&self, device: &Device) -> Result<Self> {
        let obs_stats = match &self.obs_stats {
            Some(stats) => Some(RunningMeanStd {
                mean: stats.mean.to_device(device)?,
                var: stats.var.to_device(device)?,
                count: stats.count,
            }),
            None => None,
        };
        Ok(Self {
            params: self.params.to_device(device)?,
            obs_stats,
        })
    }

    pub fn export(&self, prefix: &str, out: &mut HashMap<String, Tensor>) {
        self.params.export(prefix, out);
        if let Some(stats) = &self.obs_stats {
            out.insert(format!("{prefix}.obs_mean"), stats.mean.clone());
            out.insert(format!("{prefix}.obs_var"), stats.var.clone());
        }
    }
}

/// Clipped-surrogate actor critic with a categorical policy.
#[derive(Debug, Clone)]
pub struct PpoAgent {
    policy_network: Mlp,
    value_network: Mlp,
    obs_size: usize,
    pub normalize_obs: bool,
    pub clip_epsilon: f32,
}

impl PpoAgent {
    pub fn new(
        observation_space: &Space,
        action_space: &Space,
        network: &NetworkConfig,
        normalize_obs: bool,
        clip_epsilon: f32,
    ) -> Result<Self> {
        let Space::Discrete(action_size) = action_space else {
            bail!(Error::unsupported("action_space", format!("{action_space:?}")));
        };
        let obs_size = observation_space.size();
        Ok(Self {
            policy_network: Mlp::new(
                "policy",
                obs_size,
                &network.actor_hidden_layer_sizes,
                *action_size,
            ),
            value_network: Mlp::new("value", obs_size, &network.critic_hidden_layer_sizes, 1),
            obs_size,
            normalize_obs,
            clip_epsilon,
        })
    }

    fn preprocess(&self, state: &PpoAgentState, obs: &Tensor) -> Result<Tensor> {
        match &state.obs_stats {
            Some(stats) if self.normalize_obs => stats.normalize(obs),
            _ => Ok(obs.clone()),
        }
    }

    fn distribution(&self, state: &PpoAgentState, obs: &Tensor) -> Result<Categorical> {
        let obs = self.preprocess(state, obs)?;
        let logits = self.policy_network.forward(&state.params, &obs)?;
        Ok(Categorical::new(logits))
    }
}

impl Agent for PpoAgent {
    type State = PpoAgentState;

    fn init(&self, key: PrngKey, device: &Device) -> Result<PpoAgentState> {
        let [policy_key, value_key] = key.split_n();
        let mut params = Params::new();
        self.policy_network.init(policy_key, device, &mut params)?;
        self.value_network.init(value_key, device, &mut params)?;
        let obs_stats = if self.normalize_obs {
            Some(RunningMeanStd::new(self.obs_size, device)?)
        } else {
            None
        };
        Ok(PpoAgentState { params, obs_stats })
    }

    fn compute_actions(
        &self,
        state: &PpoAgentState,
        obs: &Tensor,
        key: PrngKey,
    ) -> Result<(Tensor, PolicyExtras)> {
        let dist = self.distribution(state, obs)?;
        let actions = dist.sample(key)?;
        let logp = dist.log_prob(&actions)?.detach();
        Ok((actions, PolicyExtras { logp }))
    }

    fn evaluate_actions(
        &self,
        state: &PpoAgentState,
        obs: &Tensor,
        _key: PrngKey,
    ) -> Result<Tensor> {
        self.distribution(state, obs)?.mode()
    }

    fn loss(&self, state: &PpoAgentState, batch: &Trajectory, _key: PrngKey) -> Result<LossDict> {
        let (Some(v_targets), Some(advantages)) = (&batch.v_targets, &batch.advantages) else {
            bail!(Error::shape(
                "ppo loss",
                "batch with targets and advantages",
                "unlabeled batch"
            ));
        };
        // transitions right after an automatic reset carry no signal
        let mask = batch.autoreset.affine(-1., 1.)?;

        let values_pred = ValuesPred(self.compute_values(state, &batch.obs)?);
        let value_loss = ValueLoss(masked_mean(&values_pred.sub(v_targets)?.sqr()?, &mask)?);

        let dist = self.distribution(state, &batch.obs)?;
        let logp = Logp(dist.log_prob(&batch.actions)?);
        let logp_diff = LogpDiff(logp.deref().sub(&batch.logp)?);
        let ratio = logp_diff.exp()?;
        let clip_adv =
            (ratio.clamp(1. - self.clip_epsilon, 1. + self.clip_epsilon)? * advantages)?;
        let policy_loss = PolicyLoss(masked_mean(
            &Tensor::minimum(&(&ratio * advantages)?, &clip_adv)?.neg()?,
            &mask,
        )?);
        let entropy_loss = masked_mean(&dist.entropy()?, &mask)?;

        Ok([
            (ACTOR_LOSS.to_string(), policy_loss.0),
            (CRITIC_LOSS.to_string(), value_loss.0),
            (ACTOR_ENTROPY_LOSS.to_string(), entropy_loss),
        ]
        .into())
    }

    fn compute_values(&self, state: &PpoAgentState, obs: &Tensor) -> Result<Tensor> {
        let obs = self.preprocess(state, obs)?;
        let values = self.value_network.forward(&state.params, &obs)?;
        Ok(values.squeeze(D::Minus1)?)
    }

    fn observe(
        &self,
        state: &PpoAgentState,
        obs: &Tensor,
        replica: Option<&Replica>,
    ) -> Result<PpoAgentState> {
        match &state.obs_stats {
            Some(stats) if self.normalize_obs => Ok(PpoAgentState {
                params: state.params.clone(),
                obs_stats: Some(stats.update(obs, replica)?),
            }),
            _ => Ok(state.clone()),
        }
    }
}
