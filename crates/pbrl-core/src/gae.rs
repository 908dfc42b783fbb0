use crate::error::Error;
use anyhow::{Result, ensure};
use candle_core::Tensor;

/// Generalized advantage estimation over a `[T, B]` trajectory.
///
/// `values` holds `T + 1` rows: the baseline for every step followed by the bootstrap value of
/// the last next-observation. A done flag cuts both the bootstrap term and the recursion at that
/// step. Returns `(targets, advantages)`, both `[T, B]` and detached from the graph.
pub fn compute_gae(
    dones: &Tensor,
    rewards: &Tensor,
    values: &Tensor,
    gae_lambda: f32,
    discount: f32,
) -> Result<(Tensor, Tensor)> {
    let (horizon, batch) = rewards.dims2()?;
    ensure!(
        dones.dims() == rewards.dims(),
        Error::shape(
            "compute_gae",
            format!("dones {:?}", rewards.dims()),
            format!("{:?}", dones.dims())
        )
    );
    ensure!(
        values.dims() == [horizon + 1, batch],
        Error::shape(
            "compute_gae",
            format!("values {:?}", [horizon + 1, batch]),
            format!("{:?}", values.dims())
        )
    );
    let device = rewards.device().clone();

    let rewards = rewards.to_vec2::<f32>()?;
    let dones = dones.to_vec2::<f32>()?;
    let values = values.to_vec2::<f32>()?;

    let mut advantages = vec![0f32; horizon * batch];
    let mut targets = vec![0f32; horizon * batch];
    let mut last_gae_lam = vec![0f32; batch];
    for t in (0..horizon).rev() {
        for b in 0..batch {
            let next_non_terminal = 1. - dones[t][b];
            let delta =
                rewards[t][b] + discount * next_non_terminal * values[t + 1][b] - values[t][b];
            last_gae_lam[b] = delta + discount * gae_lambda * next_non_terminal * last_gae_lam[b];
            advantages[t * batch + b] = last_gae_lam[b];
            targets[t * batch + b] = last_gae_lam[b] + values[t][b];
        }
    }

    let targets = Tensor::from_vec(targets, (horizon, batch), &device)?.detach();
    let advantages = Tensor::from_vec(advantages, (horizon, batch), &device)?.detach();
    Ok((targets, advantages))
}

/// Standardizes advantages to zero mean and unit variance.
pub fn normalize_advantages(advantages: &Tensor) -> Result<Tensor> {
    let mean = advantages.mean_all()?;
    let centered = advantages.broadcast_sub(&mean)?;
    let std = centered.sqr()?.mean_all()?.sqrt()?.affine(1., 1e-8)?;
    Ok(centered.broadcast_div(&std)?)
}

#[cfg(test)]
mod test {
    use super::compute_gae;
    use crate::error::Error;
    use anyhow::Result;
    use candle_core::{Device, Tensor};

    fn column(values: &[f32]) -> Result<Tensor> {
        Ok(Tensor::from_slice(values, (values.len(), 1), &Device::Cpu)?)
    }

    fn flat(t: &Tensor) -> Result<Vec<f32>> {
        Ok(t.flatten_all()?.to_vec1::<f32>()?)
    }

    #[test]
    fn monte_carlo_advantage_with_unit_lambda_and_discount() -> Result<()> {
        let (targets, advantages) = compute_gae(
            &column(&[0., 0., 0.])?,
            &column(&[1., 1., 1.])?,
            &column(&[0., 0., 0., 0.])?,
            1.,
            1.,
        )?;
        assert_eq!(flat(&targets)?, vec![3., 2., 1.]);
        assert_eq!(flat(&advantages)?, vec![3., 2., 1.]);
        Ok(())
    }

    #[test]
    fn monte_carlo_advantage_subtracts_baseline() -> Result<()> {
        let rewards = [0.5f32, -1., 2., 0.25];
        let values = [0.1f32, 0.4, -0.3, 0.7, 1.5];
        let (_, advantages) =
            compute_gae(&column(&[0.; 4])?, &column(&rewards)?, &column(&values)?, 1., 1.)?;
        let advantages = flat(&advantages)?;
        for t in 0..4 {
            let n_step_return: f32 = rewards[t..].iter().sum::<f32>() + values[4];
            assert!((advantages[t] - (n_step_return - values[t])).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn done_cuts_bootstrap() -> Result<()> {
        let rewards = [1f32, 2., 3.];
        let values = [0.5f32, 0.25, 4., 8.];
        let (gamma, lambda) = (0.9f32, 0.8f32);
        let (_, advantages) = compute_gae(
            &column(&[0., 1., 0.])?,
            &column(&rewards)?,
            &column(&values)?,
            lambda,
            gamma,
        )?;
        let advantages = flat(&advantages)?;
        // step 1 is terminal: its advantage is just its own residual without bootstrap
        assert!((advantages[1] - (rewards[1] - values[1])).abs() < 1e-6);
        let delta0 = rewards[0] + gamma * values[1] - values[0];
        assert!((advantages[0] - (delta0 + gamma * lambda * advantages[1])).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn batch_columns_are_independent() -> Result<()> {
        let rewards = Tensor::from_slice(&[1f32, 0., 1., 0.], (2, 2), &Device::Cpu)?;
        let dones = Tensor::from_slice(&[0f32, 1., 0., 0.], (2, 2), &Device::Cpu)?;
        let values = Tensor::zeros((3, 2), candle_core::DType::F32, &Device::Cpu)?;
        let (_, advantages) = compute_gae(&dones, &rewards, &values, 1., 1.)?;
        assert_eq!(advantages.to_vec2::<f32>()?, vec![vec![2., 0.], vec![1., 0.]]);
        Ok(())
    }

    #[test]
    fn values_without_bootstrap_row_are_rejected() -> Result<()> {
        let err = compute_gae(
            &column(&[0., 0., 0.])?,
            &column(&[1., 1., 1.])?,
            &column(&[0., 0., 0.])?,
            1.,
            1.,
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::ShapeMismatch { .. })
        ));
        Ok(())
    }
}
