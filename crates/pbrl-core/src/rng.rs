// Randomness is threaded explicitly through keys. A key is consumed by exactly one stochastic
// operation; anything that needs more randomness splits first.

use anyhow::Result;
use candle_core::{Device, Shape, Tensor};
use rand::{Rng, SeedableRng, rngs::StdRng, seq::SliceRandom};
use rand_distr::{Distribution, Uniform};
use serde::{Deserialize, Serialize};

const GOLDEN_GAMMA: u64 = 0x9E37_79B9_7F4A_7C15;

// splitmix64 finalizer, a bijection on u64
fn mix(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// A splittable pseudorandom key.
///
/// Children produced by a single [`PrngKey::split`] are pairwise distinct: the i-th child is the
/// image of `parent + (i + 1) * GOLDEN_GAMMA` under a bijective mixer, and `GOLDEN_GAMMA` is odd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrngKey(u64);

impl PrngKey {
    pub fn new(seed: u64) -> Self {
        Self(mix(seed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    fn child(self, i: u64) -> PrngKey {
        PrngKey(mix(self.0.wrapping_add(GOLDEN_GAMMA.wrapping_mul(i + 1))))
    }

    /// The `data`-th child, equal to `self.split(n)[data]` for any `n > data`.
    pub fn fold_in(self, data: usize) -> PrngKey {
        self.child(data as u64)
    }

    pub fn split(self, num: usize) -> Vec<PrngKey> {
        (0..num as u64).map(|i| self.child(i)).collect()
    }

    /// Fixed-size split, meant to be destructured: `let [key, sub_key] = key.split_n();`
    pub fn split_n<const N: usize>(self) -> [PrngKey; N] {
        std::array::from_fn(|i| self.child(i as u64))
    }

    pub fn rng(self) -> StdRng {
        StdRng::seed_from_u64(self.0)
    }

    /// Draws from `[low, high)`. A degenerate range returns `low`.
    pub fn uniform(self, low: f64, high: f64) -> f64 {
        if high <= low {
            return low;
        }
        low + self.rng().random::<f64>() * (high - low)
    }

    pub fn uniform_vec(self, num: usize, low: f64, high: f64) -> Vec<f64> {
        let mut rng = self.rng();
        (0..num)
            .map(|_| {
                if high <= low {
                    low
                } else {
                    low + rng.random::<f64>() * (high - low)
                }
            })
            .collect()
    }

    /// `f32` tensor with entries drawn from `[low, high)`.
    pub fn uniform_tensor(
        self,
        shape: impl Into<Shape>,
        low: f32,
        high: f32,
        device: &Device,
    ) -> Result<Tensor> {
        let shape: Shape = shape.into();
        if high <= low {
            return Ok(Tensor::full(low, shape, device)?);
        }
        let dist = Uniform::new(low, high)?;
        let mut rng = self.rng();
        let data: Vec<f32> = (0..shape.elem_count())
            .map(|_| dist.sample(&mut rng))
            .collect();
        Ok(Tensor::from_vec(data, shape, device)?)
    }

    pub fn permutation(self, num: usize) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..num).collect();
        indices.shuffle(&mut self.rng());
        indices
    }

    /// Draws `num` elements of `candidates` with replacement.
    pub fn choice(self, candidates: &[usize], num: usize) -> Vec<usize> {
        if candidates.is_empty() {
            return vec![];
        }
        let mut rng = self.rng();
        (0..num)
            .map(|_| candidates[rng.random_range(0..candidates.len())])
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::PrngKey;
    use std::collections::HashSet;

    #[test]
    fn split_children_are_distinct() {
        let key = PrngKey::new(42);
        let children = key.split(1024);
        let unique: HashSet<_> = children.iter().copied().collect();
        assert_eq!(unique.len(), 1024);
        assert!(!unique.contains(&key));
    }

    #[test]
    fn split_is_deterministic() {
        assert_eq!(PrngKey::new(7).split(5), PrngKey::new(7).split(5));
        assert_ne!(PrngKey::new(7).split(5), PrngKey::new(8).split(5));
        let [a, b] = PrngKey::new(7).split_n();
        assert_eq!(vec![a, b], PrngKey::new(7).split(2));
        assert_eq!(PrngKey::new(7).fold_in(3), PrngKey::new(7).split(5)[3]);
    }

    #[test]
    fn uniform_respects_bounds() {
        let values = PrngKey::new(3).uniform_vec(100, -0.5, 0.25);
        assert!(values.iter().all(|v| (-0.5..0.25).contains(v)));
        assert_eq!(PrngKey::new(3).uniform(1.0, 1.0), 1.0);
    }

    #[test]
    fn uniform_tensor_shape_and_bounds() -> anyhow::Result<()> {
        let t = PrngKey::new(9).uniform_tensor((4, 3), -0.1, 0.1, &candle_core::Device::Cpu)?;
        assert_eq!(t.dims(), &[4, 3]);
        let values = t.flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|v| (-0.1..0.1).contains(v)));
        Ok(())
    }

    #[test]
    fn permutation_covers_all_indices() {
        let mut perm = PrngKey::new(11).permutation(17);
        perm.sort();
        assert_eq!(perm, (0..17).collect::<Vec<_>>());
    }
}
