use super::{
    agent::{PpoAgent, PpoAgentState},
    config::{ACTOR_ENTROPY_LOSS, ACTOR_LOSS, CRITIC_LOSS, PpoConfig},
};
use anyhow::{Result, bail};
use candle_core::{Device, Tensor};
use pbrl_core::{
    agent::Agent,
    checkpoint::{Checkpoint, CheckpointManager},
    distributed::Replica,
    env::{Env, EnvState},
    error::Error,
    evaluator::Evaluator,
    gae::{compute_gae, normalize_advantages},
    gradients::GradientUpdate,
    metrics::{EvaluateMetric, ToLocalDict, TrainMetric, WorkflowMetric},
    optimizer::{Adam, AdamState, InjectHyperparams, Optimizer},
    recorder::Recorder,
    rng::PrngKey,
    rollout::{Trajectory, average_episode_return, rollout},
    workflow::{HyperParams, Workflow, WorkflowState},
};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len().max(1) as f64
}

#[derive(Debug, Clone)]
pub struct PpoTrainingState<I> {
    pub key: PrngKey,
    pub metrics: WorkflowMetric,
    pub agent_state: PpoAgentState,
    pub opt_state: AdamState,
    pub env_state: EnvState<I>,
}

impl<I: Clone + Send + Sync> WorkflowState for PpoTrainingState<I> {
    fn metrics(&self) -> &WorkflowMetric {
        &self.metrics
    }

    fn deep_copy(&self) -> Result<Self> {
        Ok(Self {
            key: self.key,
            metrics: self.metrics,
            agent_state: self.agent_state.deep_copy()?,
            opt_state: AdamState {
                count: self.opt_state.count,
                hyperparams: self.opt_state.hyperparams,
                mu: self.opt_state.mu.deep_copy()?,
                nu: self.opt_state.nu.deep_copy()?,
            },
            env_state: self.env_state.deep_copy()?,
        })
    }

    fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            agent_state: self.agent_state.to_device(device)?,
            opt_state: AdamState {
                mu: self.opt_state.mu.to_device(device)?,
                nu: self.opt_state.nu.to_device(device)?,
                ..self.opt_state.clone()
            },
            env_state: self.env_state.to_device(device)?,
            ..self.clone()
        })
    }

    fn with_key(&self, key: PrngKey) -> Self {
        Self {
            key,
            ..self.clone()
        }
    }

    fn hyperparams(&self) -> HyperParams {
        HyperParams {
            lr: self.opt_state.learning_rate(),
        }
    }

    fn apply_hyperparams(&self, hyperparams: &HyperParams) -> Self {
        Self {
            opt_state: self.opt_state.with_learning_rate(hyperparams.lr),
            ..self.clone()
        }
    }
}

impl<I> Checkpoint for PpoTrainingState<I> {
    fn export_tensors(&self, prefix: &str, out: &mut HashMap<String, Tensor>) {
        self.agent_state.export(&format!("{prefix}.agent"), out);
        self.opt_state.mu.export(&format!("{prefix}.opt.mu"), out);
        self.opt_state.nu.export(&format!("{prefix}.opt.nu"), out);
    }

    fn metadata(&self) -> serde_json::Value {
        serde_json::json!({
            "key": self.key,
            "metrics": self.metrics,
            "opt_count": self.opt_state.count,
            "learning_rate": self.opt_state.hyperparams.learning_rate,
        })
    }
}

/// On-policy PPO with GAE. With a replica handle the workflow is one data-parallel shard:
/// gradients, observation statistics and metrics are synchronized with the other replicas.
pub struct PpoWorkflow<E: Env> {
    env: E,
    agent: PpoAgent,
    optimizer: Adam,
    evaluator: Evaluator<E>,
    config: PpoConfig,
    replica: Option<Replica>,
}

impl<E: Env> PpoWorkflow<E> {
    /// `config` holds per-replica sizes, see [`PpoConfig::rescale`].
    pub fn new(
        env: E,
        eval_env: E,
        agent: PpoAgent,
        config: PpoConfig,
        replica: Option<Replica>,
    ) -> Result<Self> {
        for name in config.loss_weights.keys() {
            if ![ACTOR_LOSS, CRITIC_LOSS, ACTOR_ENTROPY_LOSS].contains(&name.as_str()) {
                bail!(Error::unsupported("loss_weights", name));
            }
        }
        if config.loss_weights.is_empty() {
            bail!(Error::unsupported("loss_weights", "no loss terms"));
        }
        if config.rollout_length == 0 {
            bail!(Error::unsupported("rollout_length", 0));
        }
        if config.minibatch_size == 0 {
            bail!(Error::unsupported("minibatch_size", 0));
        }
        let batch_size = config.rollout_length * config.num_envs;
        if config.minibatch_size > batch_size {
            bail!(Error::unsupported(
                "minibatch_size",
                format!("{} exceeds rollout batch {batch_size}", config.minibatch_size)
            ));
        }
        if batch_size % config.minibatch_size != 0 {
            warn!(
                "minibatch_size ({}) does not divide num_envs * rollout_length ({batch_size}), \
                 the remainder of every epoch is dropped",
                config.minibatch_size
            );
        }
        let max_episode_steps = config.env.max_episode_steps;
        Ok(Self {
            env,
            agent,
            optimizer: Adam::from(&config.optimizer),
            evaluator: Evaluator::new(eval_env, max_episode_steps),
            config,
            replica,
        })
    }

    pub fn config(&self) -> &PpoConfig {
        &self.config
    }

    pub fn agent(&self) -> &PpoAgent {
        &self.agent
    }

    pub fn replica(&self) -> Option<&Replica> {
        self.replica.as_ref()
    }

    fn num_replicas(&self) -> usize {
        self.replica.as_ref().map_or(1, |r| r.size())
    }

    fn rank_key(&self, key: PrngKey) -> PrngKey {
        match &self.replica {
            Some(replica) => key.fold_in(replica.rank()),
            None => key,
        }
    }

    /// Transitions sampled by one step over all replicas.
    pub fn timesteps_per_iteration(&self) -> u64 {
        (self.config.rollout_length * self.config.num_envs * self.num_replicas()) as u64
    }

    pub fn num_iterations(&self) -> u64 {
        self.config
            .total_timesteps
            .div_ceil(self.timesteps_per_iteration())
    }

    fn weighted_loss(
        &self,
        agent_state: &PpoAgentState,
        batch: &Trajectory,
        key: PrngKey,
    ) -> Result<(Tensor, BTreeMap<String, f64>)> {
        let loss_dict = self.agent.loss(agent_state, batch, key)?;
        let mut loss: Option<Tensor> = None;
        for (name, weight) in self.config.loss_weights.iter() {
            let Some(term) = loss_dict.get(name) else {
                bail!(Error::MissingLossTerm(name.clone()));
            };
            let weighted = term.affine(*weight, 0.)?;
            loss = Some(match loss {
                Some(loss) => (loss + weighted)?,
                None => weighted,
            });
        }
        let Some(loss) = loss else {
            bail!(Error::unsupported("loss_weights", "no loss terms"));
        };
        let mut raw_loss_dict = BTreeMap::new();
        for (name, term) in loss_dict.iter() {
            raw_loss_dict.insert(name.clone(), term.to_scalar::<f32>()? as f64);
        }
        Ok((loss, raw_loss_dict))
    }

    /// Collected trajectory with value targets and advantages, flattened to `[T * B, ...]`.
    fn label(&self, trajectory: Trajectory, agent_state: &PpoAgentState) -> Result<Trajectory> {
        let horizon = self.config.rollout_length;
        let last_next_obs = trajectory.next_obs.narrow(0, horizon - 1, 1)?;
        let obs = Tensor::cat(&[&trajectory.obs, &last_next_obs], 0)?;
        let values = self.agent.compute_values(agent_state, &obs)?.detach();
        let (v_targets, advantages) = compute_gae(
            &trajectory.dones,
            &trajectory.rewards,
            &values,
            self.config.gae_lambda,
            self.config.discount,
        )?;
        let trajectory = Trajectory {
            v_targets: Some(v_targets),
            advantages: Some(advantages),
            ..trajectory
        }
        .flatten()?;
        match (&trajectory.advantages, self.config.normalize_gae) {
            (Some(advantages), true) => Ok(Trajectory {
                advantages: Some(normalize_advantages(advantages)?),
                ..trajectory.clone()
            }),
            _ => Ok(trajectory),
        }
    }

    /// Runs the remaining iterations of the training budget. Metrics and checkpoints are
    /// written when a recorder and a checkpoint manager are handed in.
    pub fn learn(
        &self,
        state: PpoTrainingState<E::Inner>,
        mut recorder: Option<&mut dyn Recorder>,
        mut checkpoints: Option<&mut dyn CheckpointManager>,
    ) -> Result<PpoTrainingState<E::Inner>> {
        let num_iters = self.num_iterations();
        let mut state = state;
        for i in state.metrics.iterations..num_iters {
            let (train_metrics, next_state) = self.step(&state)?;
            state = next_state;
            let iters = i + 1;
            if let Some(recorder) = recorder.as_deref_mut() {
                recorder.write(&state.metrics.to_local_dict(), iters);
                recorder.write(&train_metrics.to_local_dict(), iters);
            }

            if iters % self.config.eval_interval.max(1) == 0 {
                let (eval_metrics, next_state) = self.evaluate(&state)?;
                state = next_state;
                if let Some(recorder) = recorder.as_deref_mut() {
                    recorder.write(&eval_metrics.to_local_dict().prefixed("eval"), iters);
                }
                info!(
                    iteration = iters,
                    episode_return = eval_metrics.episode_returns,
                    "evaluation"
                );
            }

            if let Some(checkpoints) = checkpoints.as_deref_mut() {
                checkpoints.save(iters, &state)?;
            }
        }
        Ok(state)
    }
}

impl<E: Env> Workflow for PpoWorkflow<E> {
    type State = PpoTrainingState<E::Inner>;

    /// Every replica draws the same agent initialization and its own environment and training
    /// keys.
    fn setup(&self, key: PrngKey, device: &Device) -> Result<Self::State> {
        let [key, agent_key, env_key] = key.split_n();
        let agent_state = self.agent.init(agent_key, device)?;
        let opt_state = self.optimizer.init(&agent_state.params)?;
        let env_state = self.env.reset(self.rank_key(env_key), device)?;
        Ok(PpoTrainingState {
            key: self.rank_key(key),
            metrics: WorkflowMetric::default(),
            agent_state,
            opt_state,
            env_state,
        })
    }

    fn step(&self, state: &Self::State) -> Result<(TrainMetric, Self::State)> {
        let replica = self.replica.as_ref();
        let [key, rollout_key, learn_key] = state.key.split_n();

        // collect
        let (trajectory, env_state) = rollout(
            &self.env,
            &self.agent,
            &state.env_state,
            &state.agent_state,
            rollout_key,
            self.config.rollout_length,
        )?;
        let agent_state = self.agent.observe(&state.agent_state, &trajectory.obs, replica)?;
        let train_episode_return =
            average_episode_return(&trajectory.episode_return, &trajectory.dones, replica)?;

        // label, bootstrapping with the agent that collected the data
        let trajectory = self.label(trajectory, &state.agent_state)?;

        // shuffle and train
        let batch_size = trajectory.len();
        let minibatch_size = self.config.minibatch_size;
        let num_minibatches = batch_size / minibatch_size;
        let update = GradientUpdate::new(
            |agent_state: &PpoAgentState, batch: &Trajectory, key: PrngKey| {
                self.weighted_loss(agent_state, batch, key)
            },
            &self.optimizer,
            replica,
        );
        let mut agent_state = agent_state;
        let mut opt_state = state.opt_state.clone();
        let mut epoch_key = learn_key;
        let mut losses = vec![];
        let mut loss_dicts: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for _ in 0..self.config.reuse_rollout_epochs {
            let [perm_key, mut minibatch_key] = epoch_key.split_n();
            let perm = perm_key.permutation(batch_size);
            for chunk in perm.chunks_exact(minibatch_size).take(num_minibatches) {
                let [next_key, learn_key] = minibatch_key.split_n();
                minibatch_key = next_key;
                let batch = trajectory.select(chunk)?;
                let out = update.apply(&opt_state, &agent_state, &batch, learn_key)?;
                agent_state = out.state;
                opt_state = out.opt_state;
                losses.push(out.loss.to_scalar::<f32>()? as f64);
                for (name, value) in out.aux {
                    loss_dicts.entry(name).or_default().push(value);
                }
            }
            epoch_key = minibatch_key;
        }

        // metrics
        let mut loss = mean(&losses);
        let mut raw_loss_dict: BTreeMap<String, f64> = loss_dicts
            .iter()
            .map(|(name, values)| (name.clone(), mean(values)))
            .collect();
        let mut sampled_timesteps = (self.config.rollout_length * self.config.num_envs) as f64;
        if let Some(replica) = replica {
            sampled_timesteps = replica.all_reduce_sum(sampled_timesteps)?;
            loss = replica.all_reduce_mean_scalar(loss)?;
            for value in raw_loss_dict.values_mut() {
                *value = replica.all_reduce_mean_scalar(*value)?;
            }
        }
        let metrics = WorkflowMetric {
            sampled_timesteps: state.metrics.sampled_timesteps + sampled_timesteps as u64,
            iterations: state.metrics.iterations + 1,
        };
        let train_metrics = TrainMetric {
            train_episode_return,
            loss,
            raw_loss_dict,
        };
        debug!(iteration = metrics.iterations, loss, "ppo step");

        Ok((
            train_metrics,
            PpoTrainingState {
                key,
                metrics,
                agent_state,
                opt_state,
                env_state,
            },
        ))
    }

    fn evaluate(&self, state: &Self::State) -> Result<(EvaluateMetric, Self::State)> {
        let [key, eval_key] = state.key.split_n();
        let metric = self.evaluator.evaluate(
            &self.agent,
            &state.agent_state,
            self.config.eval_episodes,
            eval_key,
            state.env_state.obs.device(),
            self.replica.as_ref(),
        )?;
        Ok((
            metric,
            PpoTrainingState {
                key,
                ..state.clone()
            },
        ))
    }
}
