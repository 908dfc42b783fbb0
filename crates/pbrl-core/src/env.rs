use crate::rng::PrngKey;
use anyhow::Result;
use candle_core::{Device, Tensor};

#[derive(Debug, Clone, PartialEq)]
pub enum Space {
    Discrete(usize),
    Continous {
        low: Option<f32>,
        high: Option<f32>,
        size: usize,
    },
}

impl Space {
    pub fn continous_from_dims(dims: &[usize]) -> Self {
        Self::Continous {
            low: None,
            high: None,
            size: dims.iter().product(),
        }
    }

    pub fn size(&self) -> usize {
        match &self {
            Self::Discrete(size) => *size,
            Self::Continous { size, .. } => *size,
        }
    }
}

/// Per-slot bookkeeping the environment carries alongside its observations. All tensors are
/// `[B]`, `f32`.
#[derive(Debug, Clone)]
pub struct EnvInfo {
    /// Return of the current (or just finished) episode.
    pub episode_return: Tensor,
    pub episode_length: Tensor,
    /// 1 on the step that follows an automatic reset. Such transitions carry no learning
    /// signal.
    pub autoreset: Tensor,
}

/// Snapshot of a batch of `B` environments. `inner` is the backend specific part.
#[derive(Debug, Clone)]
pub struct EnvState<I> {
    /// `[B, obs_dim]`
    pub obs: Tensor,
    pub reward: Tensor,
    /// 1 when the episode terminated or was truncated on this step.
    pub done: Tensor,
    pub info: EnvInfo,
    pub inner: I,
}

/// A batch of environments stepped in lockstep. Implementations are pure: stepping returns a new
/// state and never mutates the old one.
pub trait Env: Send + Sync {
    type Inner: Clone + Send + Sync;

    fn num_envs(&self) -> usize;

    fn observation_space(&self) -> Space;

    fn action_space(&self) -> Space;

    fn reset(&self, key: PrngKey, device: &Device) -> Result<EnvState<Self::Inner>>;

    /// `action` is `[B]`, `u32` for discrete action spaces.
    fn step(&self, state: &EnvState<Self::Inner>, action: &Tensor)
    -> Result<EnvState<Self::Inner>>;
}

impl<I: Clone> EnvState<I> {
    /// Copy whose tensors share no storage with `self`.
    pub fn deep_copy(&self) -> Result<Self> {
        Ok(Self {
            obs: self.obs.copy()?,
            reward: self.reward.copy()?,
            done: self.done.copy()?,
            info: EnvInfo {
                episode_return: self.info.episode_return.copy()?,
                episode_length: self.info.episode_length.copy()?,
                autoreset: self.info.autoreset.copy()?,
            },
            inner: self.inner.clone(),
        })
    }

    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            obs: self.obs.to_device(device)?,
            reward: self.reward.to_device(device)?,
            done: self.done.to_device(device)?,
            info: EnvInfo {
                episode_return: self.info.episode_return.to_device(device)?,
                episode_length: self.info.episode_length.to_device(device)?,
                autoreset: self.info.autoreset.to_device(device)?,
            },
            inner: self.inner.clone(),
        })
    }
}
