use anyhow::Result;
use candle_core::{D, DType, Tensor};
use candle_nn::ops::{log_softmax, softmax};
use pbrl_core::{error::Error, rng::PrngKey};
use rand::distr::{Distribution, weighted::WeightedIndex};

/// Categorical distribution over the last axis of `logits`.
pub struct Categorical {
    logits: Tensor,
}

impl Categorical {
    pub fn new(logits: Tensor) -> Self {
        Self { logits }
    }

    /// One `u32` action per row of `[B, A]` logits.
    pub fn sample(&self, key: PrngKey) -> Result<Tensor> {
        let probs = softmax(&self.logits.detach(), D::Minus1)?.to_vec2::<f32>()?;
        let mut rng = key.rng();
        let mut actions = Vec::with_capacity(probs.len());
        for row in probs.iter() {
            let dist = WeightedIndex::new(row)
                .map_err(|err| Error::unsupported("action probabilities", err))?;
            actions.push(dist.sample(&mut rng) as u32);
        }
        let len = actions.len();
        Ok(Tensor::from_vec(actions, len, self.logits.device())?)
    }

    pub fn mode(&self) -> Result<Tensor> {
        Ok(self.logits.argmax(D::Minus1)?.detach())
    }

    pub fn log_prob(&self, actions: &Tensor) -> Result<Tensor> {
        let log_probs = log_softmax(&self.logits, D::Minus1)?;
        let actions = actions.to_dtype(DType::U32)?.unsqueeze(D::Minus1)?;
        Ok(log_probs.gather(&actions, D::Minus1)?.squeeze(D::Minus1)?)
    }

    pub fn entropy(&self) -> Result<Tensor> {
        let log_probs = log_softmax(&self.logits, D::Minus1)?;
        let probs = log_probs.exp()?;
        Ok(probs.mul(&log_probs)?.sum(D::Minus1)?.neg()?)
    }
}

#[cfg(test)]
mod test {
    use super::Categorical;
    use anyhow::Result;
    use candle_core::{Device, Tensor};
    use pbrl_core::rng::PrngKey;

    #[test]
    fn uniform_logits() -> Result<()> {
        let dist = Categorical::new(Tensor::zeros((3, 4), candle_core::DType::F32, &Device::Cpu)?);
        let entropy = dist.entropy()?.to_vec1::<f32>()?;
        assert!(entropy.iter().all(|e| (e - 4f32.ln()).abs() < 1e-5));
        let actions = Tensor::new(&[0u32, 3, 1], &Device::Cpu)?;
        let logp = dist.log_prob(&actions)?.to_vec1::<f32>()?;
        assert!(logp.iter().all(|l| (l + 4f32.ln()).abs() < 1e-5));
        Ok(())
    }

    #[test]
    fn mode_and_sample_pick_dominant_action() -> Result<()> {
        let logits = Tensor::new(&[[0f32, 50.], [50., 0.]], &Device::Cpu)?;
        let dist = Categorical::new(logits);
        assert_eq!(dist.mode()?.to_vec1::<u32>()?, vec![1, 0]);
        assert_eq!(dist.sample(PrngKey::new(3))?.to_vec1::<u32>()?, vec![1, 0]);
        Ok(())
    }
}
