use anyhow::{Result, bail};
use candle_core::{Device, Tensor};
use candle_nn::{Activation, Linear, Module};
use pbrl_core::{error::Error, rng::PrngKey, tensor::Params};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    pub actor_hidden_layer_sizes: Vec<usize>,
    pub critic_hidden_layer_sizes: Vec<usize>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            actor_hidden_layer_sizes: vec![64, 64],
            critic_hidden_layer_sizes: vec![64, 64],
        }
    }
}

/// Shape of a fully connected network with ReLU between layers. Weights are not owned by the
/// network; they are looked up in a [`Params`] map under `{prefix}{idx}_weight` and
/// `{prefix}{idx}_bias`.
#[derive(Debug, Clone)]
pub struct Mlp {
    prefix: String,
    layer_sizes: Vec<usize>,
}

impl Mlp {
    pub fn new(prefix: &str, input_dim: usize, hidden: &[usize], output_dim: usize) -> Self {
        let mut layer_sizes = vec![input_dim];
        layer_sizes.extend_from_slice(hidden);
        layer_sizes.push(output_dim);
        Self {
            prefix: prefix.to_owned(),
            layer_sizes,
        }
    }

    fn num_layers(&self) -> usize {
        self.layer_sizes.len() - 1
    }

    fn names(&self, idx: usize) -> (String, String) {
        (
            format!("{}{idx}_weight", self.prefix),
            format!("{}{idx}_bias", self.prefix),
        )
    }

    /// Uniform fan-in initialization, `U(-1/sqrt(in), 1/sqrt(in))`.
    pub fn init(&self, key: PrngKey, device: &Device, params: &mut Params) -> Result<()> {
        for (idx, layer_key) in key.split(self.num_layers()).into_iter().enumerate() {
            let (in_dim, out_dim) = (self.layer_sizes[idx], self.layer_sizes[idx + 1]);
            let bound = 1. / (in_dim as f32).sqrt();
            let [weight_key, bias_key] = layer_key.split_n();
            let (weight_name, bias_name) = self.names(idx);
            params.insert(
                weight_name,
                weight_key.uniform_tensor((out_dim, in_dim), -bound, bound, device)?,
            );
            params.insert(
                bias_name,
                bias_key.uniform_tensor(out_dim, -bound, bound, device)?,
            );
        }
        Ok(())
    }

    pub fn forward(&self, params: &Params, xs: &Tensor) -> Result<Tensor> {
        let mut xs = xs.clone();
        for idx in 0..self.num_layers() {
            let (weight_name, bias_name) = self.names(idx);
            let (Some(weight), Some(bias)) = (params.get(&weight_name), params.get(&bias_name))
            else {
                bail!(Error::shape("mlp forward", weight_name, "missing parameter"));
            };
            let layer = Linear::new(weight.clone(), Some(bias.clone()));
            xs = layer.forward(&xs)?;
            if idx + 1 < self.num_layers() {
                xs = Activation::Relu.forward(&xs)?;
            }
        }
        Ok(xs)
    }
}
