use anyhow::{Result, bail};
use pbrl_core::{error::Error, workflow::HyperParams};
use serde::{Deserialize, Serialize};

fn check_indices(indices: &[usize], len: usize) -> Result<()> {
    if let Some(&index) = indices.iter().find(|&&i| i >= len) {
        bail!(Error::IndexOutOfRange { index, len });
    }
    Ok(())
}

/// Gathers `pop[indices]`.
pub fn read<T: Clone>(indices: &[usize], pop: &[T]) -> Result<Vec<T>> {
    check_indices(indices, pop.len())?;
    Ok(indices.iter().map(|&i| pop[i].clone()).collect())
}

/// Copy of `pop` with `pop[indices[j]] = values[j]`. When an index repeats the last write wins.
pub fn write<T: Clone>(indices: &[usize], pop: &[T], values: Vec<T>) -> Result<Vec<T>> {
    check_indices(indices, pop.len())?;
    if indices.len() != values.len() {
        bail!(Error::shape("population write", indices.len(), values.len()));
    }
    let mut out = pop.to_vec();
    for (&i, value) in indices.iter().zip(values) {
        out[i] = value;
    }
    Ok(out)
}

/// Hyperparameters of a whole population, one column per hyperparameter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PopHyperParams {
    pub lr: Vec<f64>,
}

impl PopHyperParams {
    pub fn len(&self) -> usize {
        self.lr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lr.is_empty()
    }

    pub fn get(&self, member: usize) -> Result<HyperParams> {
        check_indices(&[member], self.len())?;
        Ok(HyperParams {
            lr: self.lr[member],
        })
    }

    pub fn members(&self) -> impl Iterator<Item = HyperParams> + '_ {
        self.lr.iter().map(|&lr| HyperParams { lr })
    }

    pub fn read(&self, indices: &[usize]) -> Result<Vec<HyperParams>> {
        check_indices(indices, self.len())?;
        Ok(indices.iter().map(|&i| HyperParams { lr: self.lr[i] }).collect())
    }

    pub fn write(&self, indices: &[usize], values: &[HyperParams]) -> Result<Self> {
        Ok(Self {
            lr: write(indices, &self.lr, values.iter().map(|hp| hp.lr).collect())?,
        })
    }
}

impl FromIterator<HyperParams> for PopHyperParams {
    fn from_iter<T: IntoIterator<Item = HyperParams>>(iter: T) -> Self {
        Self {
            lr: iter.into_iter().map(|hp| hp.lr).collect(),
        }
    }
}
