use crate::distributed::Replica;
use anyhow::Result;
use candle_core::{DType, Device, Tensor, shape::Dim};

/// Running per-feature mean and variance of observations.
#[derive(Debug, Clone)]
pub struct RunningMeanStd {
    pub mean: Tensor,
    pub var: Tensor,
    pub count: f32,
}

pub(crate) fn biased_var<D: Dim>(t: &Tensor, dim: D) -> candle_core::Result<Tensor> {
    let dim = dim.to_index(t.shape(), "var")?;
    let mean = t.mean_keepdim(dim)?;
    let squares = t.broadcast_sub(&mean)?.sqr()?;
    (squares.sum_keepdim(dim)? / t.dim(dim)? as f64)?.squeeze(dim)
}

impl RunningMeanStd {
    pub fn new(size: usize, device: &Device) -> Result<Self> {
        Ok(Self {
            mean: Tensor::zeros(size, DType::F32, device)?,
            var: Tensor::ones(size, DType::F32, device)?,
            count: 0.,
        })
    }

    /// Folds a batch of observations (any leading shape, features last) into the statistics.
    /// With a replica handle the batch moments of every replica are merged in rank order, so
    /// all replicas end up with the same statistics.
    pub fn update(&self, obs: &Tensor, replica: Option<&Replica>) -> Result<Self> {
        let features = obs.dim(obs.rank().saturating_sub(1))?;
        let flat = obs.reshape(((), features))?;
        let batch_mean = flat.mean(0)?;
        let batch_var = biased_var(&flat, 0)?;
        let batch_count = flat.dim(0)? as f32;

        let Some(replica) = replica else {
            return self.update_from_moments(&batch_mean, &batch_var, batch_count);
        };
        let moments = (
            batch_mean.to_vec1::<f32>()?,
            batch_var.to_vec1::<f32>()?,
            batch_count,
        );
        let device = self.mean.device();
        let mut stats = self.clone();
        for (mean, var, count) in replica.all_gather(moments)? {
            let mean = Tensor::from_vec(mean, features, device)?;
            let var = Tensor::from_vec(var, features, device)?;
            stats = stats.update_from_moments(&mean, &var, count)?;
        }
        Ok(stats)
    }

    // parallel variant of Welford's algorithm
    fn update_from_moments(
        &self,
        batch_mean: &Tensor,
        batch_var: &Tensor,
        batch_count: f32,
    ) -> Result<Self> {
        if self.count == 0. {
            return Ok(Self {
                mean: batch_mean.clone(),
                var: batch_var.clone(),
                count: batch_count,
            });
        }
        let delta = batch_mean.sub(&self.mean)?;
        let tot_count = self.count + batch_count;
        let mean = self
            .mean
            .add(&delta.affine((batch_count / tot_count) as f64, 0.)?)?;
        let m_a = self.var.affine(self.count as f64, 0.)?;
        let m_b = batch_var.affine(batch_count as f64, 0.)?;
        let m_2 = m_a
            .add(&m_b)?
            .add(&delta.sqr()?.affine((self.count * batch_count / tot_count) as f64, 0.)?)?;
        Ok(Self {
            mean,
            var: m_2.affine(1. / tot_count as f64, 0.)?,
            count: tot_count,
        })
    }

    /// `(obs - mean) / sqrt(var + eps)`, broadcast over the leading axes.
    pub fn normalize(&self, obs: &Tensor) -> Result<Tensor> {
        let std = self.var.affine(1., 1e-8)?.sqrt()?;
        Ok(obs.broadcast_sub(&self.mean)?.broadcast_div(&std)?)
    }
}
