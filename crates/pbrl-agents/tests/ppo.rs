use anyhow::Result;
use candle_core::{Device, Tensor};
use pbrl_agents::{
    data_parallel::DataParallelPpo,
    networks::NetworkConfig,
    ppo::{PpoAgent, PpoConfig, PpoWorkflow},
};
use pbrl_core::{
    agent::Agent,
    checkpoint::{CheckpointManager, NoopCheckpointManager},
    distributed::{Replica, ReplicaGroup},
    env::Env,
    error::Error,
    mesh::DeviceMesh,
    recorder::{MemoryRecorder, Recorder},
    rng::PrngKey,
    rollout::Trajectory,
    workflow::{Workflow, WorkflowState},
};
use pbrl_gym::{AutoresetMode, EnvConfig, cartpole::CartPole};

fn tiny_config() -> PpoConfig {
    PpoConfig {
        env: EnvConfig {
            max_episode_steps: 50,
            ..Default::default()
        },
        agent_network: NetworkConfig {
            actor_hidden_layer_sizes: vec![16],
            critic_hidden_layer_sizes: vec![16],
        },
        num_envs: 4,
        num_eval_envs: 2,
        rollout_length: 8,
        total_timesteps: 96,
        minibatch_size: 16,
        reuse_rollout_epochs: 2,
        eval_interval: 2,
        eval_episodes: 2,
        ..Default::default()
    }
}

fn build(config: &PpoConfig, replica: Option<Replica>) -> Result<PpoWorkflow<CartPole>> {
    let env = config.env.make(config.num_envs, AutoresetMode::Envpool)?;
    let eval_env = config.env.make(config.num_eval_envs, AutoresetMode::Disabled)?;
    let agent = PpoAgent::new(
        &env.observation_space(),
        &env.action_space(),
        &config.agent_network,
        config.normalize_obs,
        config.clip_epsilon,
    )?;
    PpoWorkflow::new(env, eval_env, agent, config.clone(), replica)
}

#[test]
fn step_updates_counters_and_parameters() -> Result<()> {
    let workflow = build(&tiny_config(), None)?;
    let state = workflow.setup(PrngKey::new(0), &Device::Cpu)?;
    let (train_metrics, next) = workflow.step(&state)?;
    assert_eq!(next.metrics().iterations, 1);
    assert_eq!(next.metrics().sampled_timesteps, 32);
    // 2 epochs of 32 / 16 minibatches
    assert_eq!(next.opt_state.count, 4);
    assert!(train_metrics.loss.is_finite());
    assert_eq!(train_metrics.raw_loss_dict.len(), 3);
    let before = state.agent_state.params["policy0_weight"].flatten_all()?.to_vec1::<f32>()?;
    let after = next.agent_state.params["policy0_weight"].flatten_all()?.to_vec1::<f32>()?;
    assert_ne!(before, after);
    // the input state is untouched
    assert_eq!(state.metrics().iterations, 0);
    assert_eq!(state.opt_state.count, 0);
    Ok(())
}

#[test]
fn same_seed_same_training() -> Result<()> {
    let workflow = build(&tiny_config(), None)?;
    let run = |seed| -> Result<f64> {
        let state = workflow.setup(PrngKey::new(seed), &Device::Cpu)?;
        let (metrics, _) = workflow.step(&state)?;
        Ok(metrics.loss)
    };
    assert_eq!(run(3)?, run(3)?);
    Ok(())
}

#[test]
fn learn_records_every_iteration() -> Result<()> {
    let config = PpoConfig {
        normalize_obs: true,
        normalize_gae: true,
        ..tiny_config()
    };
    let workflow = build(&config, None)?;
    assert_eq!(workflow.num_iterations(), 3);
    let memory = MemoryRecorder::new();
    let mut recorder = memory.clone();
    let mut checkpoints = NoopCheckpointManager;
    let state = workflow.setup(PrngKey::new(1), &Device::Cpu)?;
    let state = workflow.learn(
        state,
        Some(&mut recorder as &mut dyn Recorder),
        Some(&mut checkpoints as &mut dyn CheckpointManager),
    )?;
    assert_eq!(state.metrics().iterations, 3);
    assert_eq!(state.metrics().sampled_timesteps, 96);
    let records = memory.records();
    // workflow and train metrics every iteration, evaluation on iteration 2
    assert_eq!(records.len(), 7);
    let eval = records
        .iter()
        .find_map(|(step, m)| m.scalar("eval/episode_returns").map(|r| (*step, r)));
    let (step, episode_return) = eval.expect("evaluation was recorded");
    assert_eq!(step, 2);
    assert!((1. ..=50.).contains(&episode_return));
    Ok(())
}

#[test]
fn evaluation_is_bounded_by_episode_length() -> Result<()> {
    let workflow = build(&tiny_config(), None)?;
    let state = workflow.setup(PrngKey::new(2), &Device::Cpu)?;
    let (metrics, next) = workflow.evaluate(&state)?;
    assert!(metrics.episode_lengths >= 1. && metrics.episode_lengths <= 50.);
    // every step yields reward 1
    assert_eq!(metrics.episode_returns, metrics.episode_lengths);
    assert_ne!(next.key, state.key);
    Ok(())
}

#[test]
fn unknown_loss_term_is_rejected() {
    let mut config = tiny_config();
    config.loss_weights.insert("kl_loss".into(), 1.);
    let err = build(&config, None).err().expect("construction must fail");
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::UnsupportedConfig { .. })
    ));
}

fn labeled_batch(agent: &PpoAgent, extra_rows: usize) -> Result<Trajectory> {
    let device = Device::Cpu;
    let state = agent.init(PrngKey::new(4), &device)?;
    let n = 6;
    let obs = PrngKey::new(5).uniform_tensor((n, 4), -1., 1., &device)?;
    let (actions, extras) = agent.compute_actions(&state, &obs, PrngKey::new(6))?;
    let v_targets = PrngKey::new(7).uniform_tensor(n, -1., 1., &device)?;
    let advantages = PrngKey::new(8).uniform_tensor(n, -1., 1., &device)?;
    let zeros = Tensor::zeros(n, candle_core::DType::F32, &device)?;
    let batch = Trajectory {
        obs: obs.clone(),
        actions,
        rewards: zeros.clone(),
        dones: zeros.clone(),
        next_obs: obs,
        logp: extras.logp,
        autoreset: zeros.clone(),
        episode_return: zeros,
        v_targets: Some(v_targets),
        advantages: Some(advantages),
    };
    if extra_rows == 0 {
        return Ok(batch);
    }
    // masked rows with values that would dominate every loss term if they leaked in
    let junk_obs = Tensor::full(30f32, (extra_rows, 4), &device)?;
    let junk = Tensor::full(1000f32, extra_rows, &device)?;
    let ones = Tensor::ones(extra_rows, candle_core::DType::F32, &device)?;
    let junk_actions = Tensor::zeros(extra_rows, candle_core::DType::U32, &device)?;
    let cat = |a: &Tensor, b: &Tensor| Tensor::cat(&[a, b], 0);
    Ok(Trajectory {
        obs: cat(&batch.obs, &junk_obs)?,
        actions: cat(&batch.actions, &junk_actions)?,
        rewards: cat(&batch.rewards, &junk)?,
        dones: cat(&batch.dones, &ones)?,
        next_obs: cat(&batch.next_obs, &junk_obs)?,
        logp: cat(&batch.logp, &Tensor::full(-10f32, extra_rows, &device)?)?,
        autoreset: cat(&batch.autoreset, &ones)?,
        episode_return: cat(&batch.episode_return, &junk)?,
        v_targets: Some(cat(batch.v_targets.as_ref().expect("labeled"), &junk)?),
        advantages: Some(cat(batch.advantages.as_ref().expect("labeled"), &junk)?),
    })
}

#[test]
fn autoreset_transitions_do_not_change_losses() -> Result<()> {
    let config = tiny_config();
    let env = config.env.make(1, AutoresetMode::Envpool)?;
    let agent = PpoAgent::new(
        &env.observation_space(),
        &env.action_space(),
        &config.agent_network,
        false,
        0.2,
    )?;
    let state = agent.init(PrngKey::new(4), &Device::Cpu)?;
    let clean = agent.loss(&state, &labeled_batch(&agent, 0)?, PrngKey::new(9))?;
    let padded = agent.loss(&state, &labeled_batch(&agent, 3)?, PrngKey::new(9))?;
    for (name, term) in clean.iter() {
        let a = term.to_scalar::<f32>()?;
        let b = padded[name].to_scalar::<f32>()?;
        assert!((a - b).abs() < 1e-5, "{name}: {a} != {b}");
    }
    Ok(())
}

#[test]
fn data_parallel_replicas_stay_in_sync() -> Result<()> {
    let config = PpoConfig {
        total_timesteps: 64,
        normalize_obs: true,
        ..tiny_config()
    };
    let mesh = DeviceMesh::cpu(2);
    let per_replica = config.rescale(mesh.len());
    let workflows = ReplicaGroup::new(mesh.len())
        .into_iter()
        .map(|replica| build(&per_replica, Some(replica)))
        .collect::<Result<Vec<_>>>()?;
    let runner = DataParallelPpo::new(workflows, mesh)?;
    let memory = MemoryRecorder::new();
    let mut recorder = memory.clone();
    let state = runner.learn(PrngKey::new(0), &mut recorder, &mut NoopCheckpointManager)?;
    // 2 replicas * 2 envs * 8 steps per iteration
    assert_eq!(state.metrics().sampled_timesteps, 64);
    assert_eq!(state.metrics().iterations, 2);
    assert!(!memory.records().is_empty());
    Ok(())
}
