use anyhow::Result;
use candle_core::{Device, Tensor};
use pbrl_agents::{
    networks::NetworkConfig,
    ppo::{PpoAgent, PpoConfig, PpoTrainingState, PpoWorkflow},
};
use pbrl_core::{
    checkpoint::{CheckpointManager, SafetensorsCheckpointManager},
    env::Env,
    mesh::DeviceMesh,
    recorder::{MemoryRecorder, Recorder},
    rng::PrngKey,
    workflow::{Workflow, WorkflowState},
};
use pbrl_gym::{
    AutoresetMode, EnvConfig,
    cartpole::{CartPole, CartPoleInner},
};
use pbrl_meta::{
    PbtConfig, PbtWorkflow, exploit_explore::exploit_and_explore, population::PopHyperParams,
};

fn ppo_config() -> PpoConfig {
    PpoConfig {
        env: EnvConfig {
            max_episode_steps: 30,
            ..Default::default()
        },
        agent_network: NetworkConfig {
            actor_hidden_layer_sizes: vec![8],
            critic_hidden_layer_sizes: vec![8],
        },
        num_envs: 4,
        num_eval_envs: 2,
        rollout_length: 8,
        minibatch_size: 16,
        reuse_rollout_epochs: 1,
        eval_episodes: 2,
        ..Default::default()
    }
}

fn ppo() -> Result<PpoWorkflow<CartPole>> {
    let config = ppo_config();
    let env = config.env.make(config.num_envs, AutoresetMode::Envpool)?;
    let eval_env = config.env.make(config.num_eval_envs, AutoresetMode::Disabled)?;
    let agent = PpoAgent::new(
        &env.observation_space(),
        &env.action_space(),
        &config.agent_network,
        config.normalize_obs,
        config.clip_epsilon,
    )?;
    PpoWorkflow::new(env, eval_env, agent, config, None)
}

fn pbt_config() -> PbtConfig {
    PbtConfig {
        pop_size: 4,
        num_iters: 3,
        per_iter_workflow_steps: 1,
        ..Default::default()
    }
}

fn values(t: &Tensor) -> Result<Vec<f32>> {
    Ok(t.flatten_all()?.to_vec1::<f32>()?)
}

#[test]
fn replaced_member_carries_the_donor_optimizer_state() -> Result<()> {
    let workflow = ppo()?;
    let config = PbtConfig {
        pop_size: 5,
        bottom_ratio: 0.2,
        top_ratio: 0.2,
        ..Default::default()
    };
    let mut members: Vec<PpoTrainingState<CartPoleInner>> = vec![];
    for (i, key) in PrngKey::new(0).split(5).into_iter().enumerate() {
        let state = workflow.setup(key, &Device::Cpu)?;
        // members differ in how far they trained
        let state = if i == 2 { workflow.step(&state)?.1 } else { state };
        members.push(state);
    }
    let pop: PopHyperParams = members.iter().map(|m| m.hyperparams()).collect();
    let fitness = [5., 1., 9., 3., 7.];

    let (new_pop, new_members) =
        exploit_and_explore(&config, PrngKey::new(1), &fitness, &pop, &members)?;

    let donor = &members[2];
    let replaced = &new_members[1];
    assert_eq!(replaced.opt_state.count, donor.opt_state.count);
    assert_eq!(replaced.opt_state.count, 2);
    for (name, mu) in donor.opt_state.mu.iter() {
        assert_eq!(values(&replaced.opt_state.mu[name])?, values(mu)?);
        assert_eq!(values(&replaced.opt_state.nu[name])?, values(&donor.opt_state.nu[name])?);
        assert_eq!(
            values(&replaced.agent_state.params[name])?,
            values(&donor.agent_state.params[name])?
        );
    }
    assert_ne!(replaced.hyperparams().lr, donor.hyperparams().lr);
    assert_eq!(replaced.hyperparams().lr, new_pop.lr[1]);
    assert_eq!(replaced.metrics, donor.metrics);
    assert_ne!(replaced.key, donor.key);
    // the donor keeps its own learning rate
    assert_eq!(new_members[2].hyperparams().lr, pop.lr[2]);
    Ok(())
}

#[test]
fn moving_a_member_keeps_its_training_state() -> Result<()> {
    let workflow = ppo()?;
    let state = workflow.setup(PrngKey::new(4), &Device::Cpu)?;
    let state = workflow.step(&state)?.1;
    let moved = state.to_device(&Device::Cpu)?;

    assert_eq!(moved.key, state.key);
    assert_eq!(moved.metrics, state.metrics);
    assert_eq!(moved.opt_state.count, state.opt_state.count);
    assert_eq!(moved.hyperparams(), state.hyperparams());
    for (name, param) in state.agent_state.params.iter() {
        let moved_param = &moved.agent_state.params[name];
        assert!(moved_param.device().same_device(&Device::Cpu));
        assert_eq!(values(moved_param)?, values(param)?);
        assert_eq!(values(&moved.opt_state.mu[name])?, values(&state.opt_state.mu[name])?);
    }
    assert_eq!(values(&moved.env_state.obs)?, values(&state.env_state.obs)?);

    // the moved member keeps training exactly like the original
    let (_, a) = workflow.step(&state)?;
    let (_, b) = workflow.step(&moved)?;
    for (name, param) in a.agent_state.params.iter() {
        assert_eq!(values(&b.agent_state.params[name])?, values(param)?);
    }
    Ok(())
}

#[test]
fn pbt_over_ppo_learns_and_checkpoints() -> Result<()> {
    let pbt = PbtWorkflow::new(ppo()?, pbt_config(), DeviceMesh::cpu(2))?;
    let dir = std::env::temp_dir().join(format!("pbrl-pbt-{}", std::process::id()));
    let mut checkpoints = SafetensorsCheckpointManager::new(&dir);
    let memory = MemoryRecorder::new();
    let mut recorder = memory.clone();

    let state = pbt.setup(PrngKey::new(5))?;
    let state = pbt.learn(
        state,
        Some(&mut recorder as &mut dyn Recorder),
        Some(&mut checkpoints as &mut dyn CheckpointManager),
    )?;

    assert_eq!(state.metrics.iterations, 3);
    // 4 members, 3 iterations of one 32 timestep step, copies included
    assert_eq!(state.metrics.sampled_timesteps, 4 * 3 * 32);
    for (member, lr) in state.pop_workflow_state.iter().zip(state.pop.lr.iter()) {
        assert_eq!(member.hyperparams().lr, *lr);
        assert_eq!(member.metrics().iterations, 3);
    }
    assert_eq!(memory.records().len(), 6);

    for step in 1..=3 {
        let step_dir = checkpoints.step_dir(step);
        let tensors =
            candle_core::safetensors::load(step_dir.join("state.safetensors"), &Device::Cpu)?;
        assert!(tensors.contains_key("state.pop.3.agent.policy0_weight"));
        let meta: serde_json::Value =
            serde_json::from_slice(&std::fs::read(step_dir.join("meta.json"))?)?;
        assert_eq!(meta["metrics"]["iterations"], step);
        assert_eq!(meta["members"].as_array().map(Vec::len), Some(4));
    }
    std::fs::remove_dir_all(&dir)?;
    Ok(())
}

#[test]
fn vectorized_and_sequential_runs_agree() -> Result<()> {
    let vectorized = PbtWorkflow::new(ppo()?, pbt_config(), DeviceMesh::cpu(2))?;
    let sequential = PbtWorkflow::new(
        ppo()?,
        PbtConfig {
            parallel_train: false,
            parallel_eval: false,
            ..pbt_config()
        },
        DeviceMesh::cpu(2),
    )?;
    let run = |pbt: &PbtWorkflow<PpoWorkflow<CartPole>>| {
        let mut state = pbt.setup(PrngKey::new(11))?;
        for _ in 0..2 {
            state = pbt.step(&state)?.1;
        }
        anyhow::Ok(state)
    };
    let a = run(&vectorized)?;
    let b = run(&sequential)?;
    assert_eq!(a.pop, b.pop);
    assert_eq!(a.metrics, b.metrics);
    for (x, y) in a.pop_workflow_state.iter().zip(b.pop_workflow_state.iter()) {
        assert_eq!(x.opt_state.count, y.opt_state.count);
        for (name, p) in x.agent_state.params.iter() {
            for (u, v) in values(p)?.iter().zip(values(&y.agent_state.params[name])?) {
                assert!((u - v).abs() < 1e-5, "{name} differs: {u} vs {v}");
            }
        }
    }
    Ok(())
}
