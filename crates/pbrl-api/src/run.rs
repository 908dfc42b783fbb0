use crate::{
    builders::{PbtWorkflowBuilder, PpoWorkflowBuilder},
    config::{PbtRunConfig, PpoRunConfig},
};
use anyhow::Result;
use pbrl_agents::ppo::PpoTrainingState;
use pbrl_core::{
    checkpoint::CheckpointManager,
    mesh::DeviceMesh,
    recorder::Recorder,
    rng::PrngKey,
    workflow::Workflow,
};
use pbrl_gym::cartpole::CartPoleInner;
use pbrl_meta::PbtState;
use tracing::info;

/// Trains PPO to the end of its budget. More than one device means data-parallel replicas.
pub fn run_ppo(config: &PpoRunConfig) -> Result<PpoTrainingState<CartPoleInner>> {
    let mesh = DeviceMesh::from_spec(&config.run.devices)?;
    let mut recorder = config.run.recorder.build()?;
    let mut checkpoints = config.run.checkpoint.build();
    let key = PrngKey::new(config.run.seed);
    let builder = PpoWorkflowBuilder::from(config.ppo.clone());

    let state = if mesh.len() == 1 {
        let workflow = builder.build()?;
        info!(
            iterations = workflow.num_iterations(),
            seed = config.run.seed,
            "training ppo"
        );
        let state = workflow.setup(key, mesh.device(0))?;
        workflow.learn(
            state,
            Some(&mut recorder as &mut dyn Recorder),
            Some(&mut checkpoints as &mut dyn CheckpointManager),
        )?
    } else {
        builder
            .build_data_parallel(&mesh)?
            .learn(key, &mut recorder, &mut checkpoints)?
    };
    info!(
        iterations = state.metrics.iterations,
        sampled_timesteps = state.metrics.sampled_timesteps,
        "ppo finished"
    );
    Ok(state)
}

/// Runs `num_iters` PBT iterations over PPO members spread on the configured devices.
pub fn run_pbt(config: &PbtRunConfig) -> Result<PbtState<PpoTrainingState<CartPoleInner>>> {
    let mesh = DeviceMesh::from_spec(&config.run.devices)?;
    let mut recorder = config.run.recorder.build()?;
    let mut checkpoints = config.run.checkpoint.build();
    let builder = PbtWorkflowBuilder::new(
        config.pbt.clone(),
        PpoWorkflowBuilder::from(config.target_workflow.clone()),
    );
    let pbt = builder.build(mesh)?;
    info!(
        pop_size = pbt.config().pop_size,
        num_iters = pbt.config().num_iters,
        seed = config.run.seed,
        "training pbt"
    );

    let state = pbt.setup(PrngKey::new(config.run.seed))?;
    let state = pbt.learn(
        state,
        Some(&mut recorder as &mut dyn Recorder),
        Some(&mut checkpoints as &mut dyn CheckpointManager),
    )?;
    info!(
        iterations = state.metrics.iterations,
        sampled_timesteps = state.metrics.sampled_timesteps,
        "pbt finished"
    );
    Ok(state)
}
