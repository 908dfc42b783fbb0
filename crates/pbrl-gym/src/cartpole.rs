// Classic cart-pole balancing, vectorized over a batch of environments. Physics state is kept in
// struct-of-arrays form on the host; observations are handed out as tensors on the requested
// device.

use crate::AutoresetMode;
use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use pbrl_core::{
    env::{Env, EnvInfo, EnvState, Space},
    rng::PrngKey,
};

const GRAVITY: f32 = 9.8;
const CART_MASS: f32 = 1.0;
const POLE_MASS: f32 = 0.1;
const POLE_LENGTH: f32 = 0.5;
const FORCE_MAG: f32 = 10.0;
const DT: f32 = 0.02;
const X_THRESHOLD: f32 = 2.4;
const THETA_THRESHOLD: f32 = 12.0 * std::f32::consts::PI / 180.0;
const INIT_RANGE: f64 = 0.05;

pub const OBS_SIZE: usize = 4;
pub const DEFAULT_MAX_STEPS: usize = 500;

#[derive(Debug, Clone)]
pub struct CartPoleInner {
    x: Vec<f32>,
    x_dot: Vec<f32>,
    theta: Vec<f32>,
    theta_dot: Vec<f32>,
    ticks: Vec<usize>,
    episode_return: Vec<f32>,
    done: Vec<bool>,
    key: PrngKey,
}

impl CartPoleInner {
    fn reset_single(&mut self, idx: usize, key: PrngKey) {
        let values = key.uniform_vec(4, -INIT_RANGE, INIT_RANGE);
        self.x[idx] = values[0] as f32;
        self.x_dot[idx] = values[1] as f32;
        self.theta[idx] = values[2] as f32;
        self.theta_dot[idx] = values[3] as f32;
        self.ticks[idx] = 0;
        self.episode_return[idx] = 0.;
        self.done[idx] = false;
    }

    // returns whether the pole fell or the cart left the track
    fn step_single(&mut self, idx: usize, action: u32) -> bool {
        let force = if action == 1 { FORCE_MAG } else { -FORCE_MAG };
        let (x, x_dot, theta, theta_dot) =
            (self.x[idx], self.x_dot[idx], self.theta[idx], self.theta_dot[idx]);

        let cos_theta = theta.cos();
        let sin_theta = theta.sin();
        let total_mass = CART_MASS + POLE_MASS;
        let pole_mass_length = POLE_MASS * POLE_LENGTH;

        let temp = (force + pole_mass_length * theta_dot * theta_dot * sin_theta) / total_mass;
        let denom = POLE_LENGTH * (4.0 / 3.0 - POLE_MASS * cos_theta * cos_theta / total_mass);
        let theta_acc = (GRAVITY * sin_theta - cos_theta * temp) / denom.max(1e-6);
        let x_acc = temp - pole_mass_length * theta_acc * cos_theta / total_mass;

        self.x[idx] = x + DT * x_dot;
        self.x_dot[idx] = x_dot + DT * x_acc;
        self.theta[idx] = theta + DT * theta_dot;
        self.theta_dot[idx] = theta_dot + DT * theta_acc;
        self.ticks[idx] += 1;

        self.x[idx].abs() > X_THRESHOLD || self.theta[idx].abs() > THETA_THRESHOLD
    }

    fn obs(&self) -> Vec<f32> {
        (0..self.x.len())
            .flat_map(|i| [self.x[i], self.x_dot[i], self.theta[i], self.theta_dot[i]])
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct CartPole {
    num_envs: usize,
    max_episode_steps: usize,
    autoreset_mode: AutoresetMode,
}

impl CartPole {
    pub fn new(num_envs: usize, max_episode_steps: usize, autoreset_mode: AutoresetMode) -> Self {
        Self {
            num_envs,
            max_episode_steps,
            autoreset_mode,
        }
    }

    fn state(
        &self,
        inner: CartPoleInner,
        reward: Vec<f32>,
        autoreset: Vec<f32>,
        device: &Device,
    ) -> Result<EnvState<CartPoleInner>> {
        let b = self.num_envs;
        let done: Vec<f32> = inner.done.iter().map(|d| *d as u8 as f32).collect();
        let episode_length: Vec<f32> = inner.ticks.iter().map(|t| *t as f32).collect();
        Ok(EnvState {
            obs: Tensor::from_vec(inner.obs(), (b, OBS_SIZE), device)?,
            reward: Tensor::from_vec(reward, b, device)?,
            done: Tensor::from_vec(done, b, device)?,
            info: EnvInfo {
                episode_return: Tensor::from_vec(inner.episode_return.clone(), b, device)?,
                episode_length: Tensor::from_vec(episode_length, b, device)?,
                autoreset: Tensor::from_vec(autoreset, b, device)?,
            },
            inner,
        })
    }
}

impl Env for CartPole {
    type Inner = CartPoleInner;

    fn num_envs(&self) -> usize {
        self.num_envs
    }

    fn observation_space(&self) -> Space {
        Space::continous_from_dims(&[OBS_SIZE])
    }

    fn action_space(&self) -> Space {
        Space::Discrete(2)
    }

    fn reset(&self, key: PrngKey, device: &Device) -> Result<EnvState<CartPoleInner>> {
        let b = self.num_envs;
        let [key, init_key] = key.split_n();
        let mut inner = CartPoleInner {
            x: vec![0.; b],
            x_dot: vec![0.; b],
            theta: vec![0.; b],
            theta_dot: vec![0.; b],
            ticks: vec![0; b],
            episode_return: vec![0.; b],
            done: vec![false; b],
            key,
        };
        for (idx, slot_key) in init_key.split(b).into_iter().enumerate() {
            inner.reset_single(idx, slot_key);
        }
        self.state(inner, vec![0.; b], vec![0.; b], device)
    }

    fn step(
        &self,
        state: &EnvState<CartPoleInner>,
        action: &Tensor,
    ) -> Result<EnvState<CartPoleInner>> {
        let b = self.num_envs;
        let actions = action
            .to_dtype(DType::U32)?
            .to_device(&Device::Cpu)?
            .flatten_all()?
            .to_vec1::<u32>()?;
        let mut inner = state.inner.clone();
        let [key, reset_key] = inner.key.split_n();
        inner.key = key;
        let reset_keys = reset_key.split(b);

        let mut reward = vec![0f32; b];
        let mut autoreset = vec![0f32; b];
        for idx in 0..b {
            if inner.done[idx] {
                match self.autoreset_mode {
                    // the action is ignored, the slot restarts
                    AutoresetMode::Envpool => {
                        inner.reset_single(idx, reset_keys[idx]);
                        autoreset[idx] = 1.;
                    }
                    AutoresetMode::Disabled => {}
                }
                continue;
            }
            let terminated = inner.step_single(idx, actions[idx]);
            let truncated = inner.ticks[idx] >= self.max_episode_steps;
            reward[idx] = 1.;
            inner.episode_return[idx] += 1.;
            inner.done[idx] = terminated || truncated;
        }
        self.state(inner, reward, autoreset, state.obs.device())
    }
}
