use anyhow::{Result, bail};
use pbrl_core::{error::Error, mesh::ExecutionStrategy};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub low: f64,
    pub high: f64,
}

/// Ranges the initial hyperparameters are drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSpace {
    pub lr: Bounds,
}

impl Default for SearchSpace {
    fn default() -> Self {
        Self {
            lr: Bounds {
                low: 1e-4,
                high: 1e-3,
            },
        }
    }
}

/// Relative perturbation applied to a copied hyperparameter: `new = old * (1 + u)` with
/// `u ~ uniform(-factor, factor)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerturbFactor {
    pub lr: f64,
}

impl Default for PerturbFactor {
    fn default() -> Self {
        Self { lr: 0.2 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PbtConfig {
    pub pop_size: usize,
    pub num_iters: u64,
    pub per_iter_workflow_steps: u64,
    /// Target workflow steps before the first exploit/explore.
    pub warmup_steps: u64,
    pub parallel_train: bool,
    pub parallel_eval: bool,
    pub bottom_ratio: f64,
    pub top_ratio: f64,
    pub perturb_factor: PerturbFactor,
    pub search_space: SearchSpace,
}

impl Default for PbtConfig {
    fn default() -> Self {
        Self {
            pop_size: 8,
            num_iters: 10,
            per_iter_workflow_steps: 2,
            warmup_steps: 0,
            parallel_train: true,
            parallel_eval: true,
            bottom_ratio: 0.25,
            top_ratio: 0.25,
            perturb_factor: PerturbFactor::default(),
            search_space: SearchSpace::default(),
        }
    }
}

impl PbtConfig {
    pub fn validate(&self) -> Result<()> {
        if self.pop_size == 0 {
            bail!(Error::unsupported("pop_size", 0));
        }
        if self.per_iter_workflow_steps == 0 {
            bail!(Error::unsupported("per_iter_workflow_steps", 0));
        }
        for (key, ratio) in [
            ("bottom_ratio", self.bottom_ratio),
            ("top_ratio", self.top_ratio),
        ] {
            if !(0.0..=1.0).contains(&ratio) {
                bail!(Error::unsupported(key, ratio));
            }
        }
        if self.bottom_ratio + self.top_ratio > 1.0 {
            bail!(Error::unsupported(
                "bottom_ratio + top_ratio",
                self.bottom_ratio + self.top_ratio
            ));
        }
        let Bounds { low, high } = self.search_space.lr;
        if !(low > 0.0 && low <= high) {
            bail!(Error::unsupported(
                "search_space.lr",
                format!("[{low}, {high}]")
            ));
        }
        if !(0.0..1.0).contains(&self.perturb_factor.lr) {
            bail!(Error::unsupported("perturb_factor.lr", self.perturb_factor.lr));
        }
        Ok(())
    }

    pub fn train_strategy(&self) -> ExecutionStrategy {
        ExecutionStrategy::from_parallel(self.parallel_train)
    }

    pub fn eval_strategy(&self) -> ExecutionStrategy {
        ExecutionStrategy::from_parallel(self.parallel_eval)
    }

    /// Number of leading iterations that skip exploit/explore.
    pub fn warmup_iters(&self) -> u64 {
        self.warmup_steps.div_ceil(self.per_iter_workflow_steps.max(1))
    }

    /// `(bottoms_num, tops_num)` for a population of `pop_size`, rounded half to even.
    pub fn exploit_counts(&self, pop_size: usize) -> (usize, usize) {
        let count = |ratio: f64| (pop_size as f64 * ratio).round_ties_even() as usize;
        (count(self.bottom_ratio), count(self.top_ratio))
    }
}
