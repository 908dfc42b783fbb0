use crate::tensor::Params;
use anyhow::Result;
use serde::{Deserialize, Serialize};

/// A stateless update rule. All state lives in `Self::State`, which is threaded through
/// [`Optimizer::update`] so it can be copied between population members.
pub trait Optimizer: Send + Sync {
    type State: Clone + Send + Sync;

    fn init(&self, params: &Params) -> Result<Self::State>;

    /// Returns the additive updates and the next optimizer state.
    fn update(&self, grads: &Params, state: &Self::State) -> Result<(Params, Self::State)>;
}

/// Optimizer states whose hyperparameters can be swapped without touching the rest.
pub trait InjectHyperparams {
    fn learning_rate(&self) -> f64;

    fn with_learning_rate(&self, learning_rate: f64) -> Self;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdamHyperParams {
    pub learning_rate: f64,
}

#[derive(Debug, Clone)]
pub struct AdamState {
    pub count: u64,
    pub hyperparams: AdamHyperParams,
    pub mu: Params,
    pub nu: Params,
}

impl InjectHyperparams for AdamState {
    fn learning_rate(&self) -> f64 {
        self.hyperparams.learning_rate
    }

    fn with_learning_rate(&self, learning_rate: f64) -> Self {
        Self {
            count: self.count,
            hyperparams: AdamHyperParams { learning_rate },
            mu: self.mu.clone(),
            nu: self.nu.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub grad_clip_norm: Option<f32>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 3e-4,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            grad_clip_norm: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Adam {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub max_grad_norm: Option<f32>,
}

impl From<&OptimizerConfig> for Adam {
    fn from(config: &OptimizerConfig) -> Self {
        Self {
            learning_rate: config.learning_rate,
            beta1: config.beta1,
            beta2: config.beta2,
            eps: config.eps,
            max_grad_norm: config.grad_clip_norm,
        }
    }
}

impl Adam {
    pub fn new(learning_rate: f64) -> Self {
        Self::from(&OptimizerConfig {
            learning_rate,
            ..Default::default()
        })
    }

    pub fn set_max_grad_norm(mut self, max_grad_norm: Option<f32>) -> Self {
        self.max_grad_norm = max_grad_norm;
        self
    }
}

/// Rescales `grads` so that their global norm does not exceed `max_norm`.
pub fn clip_by_global_norm(grads: &Params, max_norm: f32) -> Result<Params> {
    let total_norm = grads.global_norm()?;
    if total_norm > max_norm {
        let clip_coef = max_norm / (total_norm + 1e-6);
        grads.scale(clip_coef as f64)
    } else {
        Ok(grads.clone())
    }
}

pub fn apply_updates(params: &Params, updates: &Params) -> Result<Params> {
    params.zip_map(updates, |p, u| p.add(u).map(|t| t.detach()))
}

impl Optimizer for Adam {
    type State = AdamState;

    fn init(&self, params: &Params) -> Result<AdamState> {
        Ok(AdamState {
            count: 0,
            hyperparams: AdamHyperParams {
                learning_rate: self.learning_rate,
            },
            mu: params.zeros_like()?,
            nu: params.zeros_like()?,
        })
    }

    fn update(&self, grads: &Params, state: &AdamState) -> Result<(Params, AdamState)> {
        let grads = match self.max_grad_norm {
            Some(max_norm) => clip_by_global_norm(grads, max_norm)?,
            None => grads.clone(),
        };
        let count = state.count + 1;
        let (beta1, beta2) = (self.beta1, self.beta2);
        let mu = state
            .mu
            .zip_map(&grads, |m, g| (m.affine(beta1, 0.)? + g.affine(1. - beta1, 0.)?))?;
        let nu = state.nu.zip_map(&grads, |v, g| {
            v.affine(beta2, 0.)? + g.sqr()?.affine(1. - beta2, 0.)?
        })?;
        let mu_correction = 1. / (1. - beta1.powi(count as i32));
        let nu_correction = 1. / (1. - beta2.powi(count as i32));
        let learning_rate = state.hyperparams.learning_rate;
        let eps = self.eps;
        let updates = mu.zip_map(&nu, |m, v| {
            let m_hat = m.affine(mu_correction, 0.)?;
            let denom = v.affine(nu_correction, 0.)?.sqrt()?.affine(1., eps)?;
            m_hat.div(&denom)?.affine(-learning_rate, 0.)
        })?;
        Ok((
            updates,
            AdamState {
                count,
                hyperparams: state.hyperparams,
                mu,
                nu,
            },
        ))
    }
}
