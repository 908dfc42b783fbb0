use crate::{
    distributed::Replica,
    optimizer::{Optimizer, apply_updates},
    rng::PrngKey,
    tensor::Params,
};
use anyhow::Result;
use candle_core::{Tensor, Var};
use std::collections::BTreeMap;

/// States that carry learnable parameters.
pub trait HasParams {
    fn params(&self) -> &Params;

    /// The same state with its parameters replaced.
    fn with_params(&self, params: Params) -> Self;
}

pub struct GradientUpdateOutput<S, OS, A> {
    /// Detached scalar loss.
    pub loss: Tensor,
    pub aux: A,
    pub state: S,
    pub opt_state: OS,
}

/// Fuses "differentiate the loss, average the gradient across replicas, apply the optimizer"
/// into a single call. Inputs are never mutated.
pub struct GradientUpdate<'a, O, L> {
    loss_fn: L,
    optimizer: &'a O,
    replica: Option<&'a Replica>,
}

impl<'a, O: Optimizer, L> GradientUpdate<'a, O, L> {
    pub fn new(loss_fn: L, optimizer: &'a O, replica: Option<&'a Replica>) -> Self {
        Self {
            loss_fn,
            optimizer,
            replica,
        }
    }

    pub fn apply<S, B, A>(
        &self,
        opt_state: &O::State,
        state: &S,
        batch: &B,
        key: PrngKey,
    ) -> Result<GradientUpdateOutput<S, O::State, A>>
    where
        S: HasParams,
        L: Fn(&S, &B, PrngKey) -> Result<(Tensor, A)>,
    {
        // fresh variables so the graph only reaches the parameters, never other state tensors
        let mut vars = BTreeMap::new();
        for (name, tensor) in state.params().iter() {
            vars.insert(name.clone(), Var::from_tensor(&tensor.detach())?);
        }
        let tracked = Params(
            vars.iter()
                .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
                .collect(),
        );
        let (loss, aux) = (self.loss_fn)(&state.with_params(tracked), batch, key)?;

        let grad_store = loss.backward()?;
        let mut grads = Params::new();
        for (name, var) in vars.iter() {
            let grad = match grad_store.get(var.as_tensor()) {
                Some(grad) => grad.clone(),
                // parameter does not influence the loss
                None => var.as_tensor().zeros_like()?,
            };
            grads.insert(name.clone(), grad);
        }
        if let Some(replica) = self.replica {
            grads = replica.all_reduce_mean(&grads)?;
        }

        let (updates, opt_state) = self.optimizer.update(&grads, opt_state)?;
        let params = apply_updates(state.params(), &updates)?;
        Ok(GradientUpdateOutput {
            loss: loss.detach(),
            aux,
            state: state.with_params(params),
            opt_state,
        })
    }
}
