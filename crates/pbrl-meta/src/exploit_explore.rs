use crate::{config::PbtConfig, population::PopHyperParams};
use anyhow::{Result, bail};
use pbrl_core::{
    error::Error,
    rng::PrngKey,
    workflow::{HyperParams, WorkflowState},
};
use tracing::debug;

/// Signature shared by [`exploit_and_explore`] and [`skip_exploit_and_explore`] so the scheduler
/// can pick one per iteration.
pub type ExploitExploreFn<S> =
    fn(&PbtConfig, PrngKey, &[f64], &PopHyperParams, &[S]) -> Result<(PopHyperParams, Vec<S>)>;

/// Member indices ordered by ascending fitness. Ties keep member order.
pub fn argsort(fitness: &[f64]) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..fitness.len()).collect();
    indices.sort_by(|&a, &b| fitness[a].total_cmp(&fitness[b]));
    indices
}

/// Warmup branch: population returned as is.
pub fn skip_exploit_and_explore<S: WorkflowState>(
    _config: &PbtConfig,
    _key: PrngKey,
    _fitness: &[f64],
    pop: &PopHyperParams,
    pop_states: &[S],
) -> Result<(PopHyperParams, Vec<S>)> {
    Ok((pop.clone(), pop_states.to_vec()))
}

/// Replaces the worst members by perturbed copies of randomly drawn top members.
///
/// Each bottom slot receives a donor drawn with replacement from the top set. The donor's state
/// is deep copied and its learning rate multiplied by `1 + uniform(-f, f)`, one draw per replaced
/// member, then injected into the copied optimizer state. Optimizer counters and moments come
/// along with the copy; the key does not, every copy gets a fresh one so it never replays its
/// donor's randomness.
pub fn exploit_and_explore<S: WorkflowState>(
    config: &PbtConfig,
    key: PrngKey,
    fitness: &[f64],
    pop: &PopHyperParams,
    pop_states: &[S],
) -> Result<(PopHyperParams, Vec<S>)> {
    let pop_size = pop_states.len();
    if fitness.len() != pop_size || pop.len() != pop_size {
        bail!(Error::shape(
            "exploit_and_explore",
            pop_size,
            format!("{} fitness values, {} hyperparams", fitness.len(), pop.len())
        ));
    }
    let (bottoms_num, tops_num) = config.exploit_counts(pop_size);
    let (bottoms_num, tops_num) = (bottoms_num.min(pop_size), tops_num.min(pop_size));
    if bottoms_num == 0 || tops_num == 0 {
        return skip_exploit_and_explore(config, key, fitness, pop, pop_states);
    }

    let indices = argsort(fitness);
    let bottoms = &indices[..bottoms_num];
    let tops = &indices[pop_size - tops_num..];

    let [exploit_key, explore_key, member_key] = key.split_n();
    let donors = exploit_key.choice(tops, bottoms.len());
    let factor = config.perturb_factor.lr;

    let new_hyperparams: Vec<HyperParams> = pop
        .read(&donors)?
        .into_iter()
        .zip(explore_key.split(bottoms.len()))
        .map(|(donor, key)| HyperParams {
            lr: donor.lr * (1.0 + key.uniform(-factor, factor)),
        })
        .collect();
    let new_states = crate::population::read(&donors, pop_states)?
        .iter()
        .zip(new_hyperparams.iter())
        .zip(bottoms.iter())
        .map(|((state, hyperparams), &slot)| {
            Ok(state
                .deep_copy()?
                .apply_hyperparams(hyperparams)
                .with_key(member_key.fold_in(slot)))
        })
        .collect::<Result<Vec<_>>>()?;

    for ((slot, donor), hp) in bottoms.iter().zip(donors.iter()).zip(new_hyperparams.iter()) {
        debug!(slot, donor, lr = hp.lr, "member replaced");
    }

    let pop = pop.write(bottoms, &new_hyperparams)?;
    let pop_states = crate::population::write(bottoms, pop_states, new_states)?;
    Ok((pop, pop_states))
}
