use crate::error::Error;
use anyhow::{Result, bail, ensure};
use candle_core::{Device, Tensor};
use derive_more::{Deref, DerefMut, Display};
use std::collections::{BTreeMap, HashMap};

/// Named learnable tensors. Every operation returns a new map; tensors are never updated in
/// place, so a clone is a value copy as far as the rest of the crate is concerned.
#[derive(Debug, Clone, Default, Deref, DerefMut)]
pub struct Params(pub BTreeMap<String, Tensor>);

impl Params {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn map(&self, f: impl Fn(&Tensor) -> candle_core::Result<Tensor>) -> Result<Self> {
        let mut out = BTreeMap::new();
        for (name, tensor) in self.iter() {
            out.insert(name.clone(), f(tensor)?);
        }
        Ok(Self(out))
    }

    pub fn zip_map(
        &self,
        other: &Params,
        f: impl Fn(&Tensor, &Tensor) -> candle_core::Result<Tensor>,
    ) -> Result<Self> {
        ensure!(
            self.len() == other.len(),
            Error::shape("params zip", self.len(), other.len())
        );
        let mut out = BTreeMap::new();
        for (name, tensor) in self.iter() {
            let Some(rhs) = other.get(name) else {
                bail!(Error::shape("params zip", name, "missing entry"));
            };
            out.insert(name.clone(), f(tensor, rhs)?);
        }
        Ok(Self(out))
    }

    pub fn zeros_like(&self) -> Result<Self> {
        self.map(|t| t.zeros_like())
    }

    /// Copies every tensor into fresh storage.
    pub fn deep_copy(&self) -> Result<Self> {
        self.map(|t| t.copy())
    }

    /// No-op for tensors that already live on `device`.
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        self.map(|t| t.to_device(device))
    }

    pub fn scale(&self, factor: f64) -> Result<Self> {
        self.map(|t| t.affine(factor, 0.))
    }

    pub fn global_norm(&self) -> Result<f32> {
        let mut total_norm_squared = 0f32;
        for tensor in self.values() {
            total_norm_squared += tensor.sqr()?.sum_all()?.to_scalar::<f32>()?;
        }
        Ok(total_norm_squared.sqrt())
    }

    pub fn device(&self) -> Option<&Device> {
        self.values().next().map(|t| t.device())
    }

    pub fn export(&self, prefix: &str, out: &mut HashMap<String, Tensor>) {
        for (name, tensor) in self.iter() {
            out.insert(format!("{prefix}.{name}"), tensor.clone());
        }
    }
}

#[derive(Deref, DerefMut, Debug, Display)]
pub struct Logp(pub Tensor);

#[derive(Deref, DerefMut, Debug, Display)]
pub struct LogpDiff(pub Tensor);

#[derive(Deref, DerefMut, Debug, Display)]
pub struct ValuesPred(pub Tensor);

#[derive(Deref, DerefMut, Debug, Display)]
pub struct PolicyLoss(pub Tensor);

#[derive(Deref, DerefMut, Debug, Display)]
pub struct ValueLoss(pub Tensor);

/// Mean over the entries where `mask` is 1. Masked entries are selected away, not multiplied
/// by zero, so non-finite values there do not leak. An all-zero mask yields 0.
pub fn masked_mean(xs: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let count = mask.sum_all()?.to_scalar::<f32>()?.max(1.);
    let kept = mask.ne(0f32)?.where_cond(xs, &xs.zeros_like()?)?;
    Ok((kept.sum_all()? / f64::from(count))?)
}

/// `[T, B, ...] -> [T * B, ...]`
pub fn flatten_leading(t: &Tensor) -> Result<Tensor> {
    let dims = t.dims();
    ensure!(
        dims.len() >= 2,
        Error::shape("flatten_leading", "rank >= 2", format!("{dims:?}"))
    );
    let mut new_dims = vec![dims[0] * dims[1]];
    new_dims.extend_from_slice(&dims[2..]);
    Ok(t.reshape(new_dims)?)
}

pub fn select_rows(t: &Tensor, indices: &[usize]) -> Result<Tensor> {
    let indices: Vec<u32> = indices.iter().map(|i| *i as u32).collect();
    let len = indices.len();
    let indices = Tensor::from_vec(indices, len, t.device())?;
    Ok(t.index_select(&indices, 0)?)
}
