use anyhow::Result;
use pbrl_agents::{
    data_parallel::DataParallelPpo,
    networks::NetworkConfig,
    ppo::{PpoAgent, PpoConfig, PpoWorkflow},
};
use pbrl_core::{
    distributed::{Replica, ReplicaGroup},
    env::Env,
    mesh::DeviceMesh,
    optimizer::OptimizerConfig,
};
use pbrl_gym::{AutoresetMode, cartpole::CartPole};
use std::collections::BTreeMap;

/// Builds PPO workflows from a [`PpoConfig`], either standalone or as data-parallel replicas.
#[derive(Debug, Clone, Default)]
pub struct PpoWorkflowBuilder {
    pub config: PpoConfig,
}

impl From<PpoConfig> for PpoWorkflowBuilder {
    fn from(config: PpoConfig) -> Self {
        Self { config }
    }
}

impl PpoWorkflowBuilder {
    pub fn set_env_name(&mut self, env_name: impl Into<String>) {
        self.config.env.env_name = env_name.into();
    }

    pub fn set_max_episode_steps(&mut self, max_episode_steps: usize) {
        self.config.env.max_episode_steps = max_episode_steps;
    }

    pub fn set_num_envs(&mut self, num_envs: usize) {
        self.config.num_envs = num_envs;
    }

    pub fn set_num_eval_envs(&mut self, num_eval_envs: usize) {
        self.config.num_eval_envs = num_eval_envs;
    }

    pub fn set_rollout_length(&mut self, rollout_length: usize) {
        self.config.rollout_length = rollout_length;
    }

    pub fn set_total_timesteps(&mut self, total_timesteps: u64) {
        self.config.total_timesteps = total_timesteps;
    }

    pub fn set_minibatch_size(&mut self, minibatch_size: usize) {
        self.config.minibatch_size = minibatch_size;
    }

    pub fn set_reuse_rollout_epochs(&mut self, reuse_rollout_epochs: usize) {
        self.config.reuse_rollout_epochs = reuse_rollout_epochs;
    }

    pub fn set_discount(&mut self, discount: f32) {
        self.config.discount = discount;
    }

    pub fn set_gae_lambda(&mut self, gae_lambda: f32) {
        self.config.gae_lambda = gae_lambda;
    }

    pub fn set_clip_epsilon(&mut self, clip_epsilon: f32) {
        self.config.clip_epsilon = clip_epsilon;
    }

    pub fn set_normalize_obs(&mut self, normalize_obs: bool) {
        self.config.normalize_obs = normalize_obs;
    }

    pub fn set_normalize_gae(&mut self, normalize_gae: bool) {
        self.config.normalize_gae = normalize_gae;
    }

    pub fn set_loss_weights(&mut self, loss_weights: BTreeMap<String, f64>) {
        self.config.loss_weights = loss_weights;
    }

    pub fn set_network(&mut self, network: NetworkConfig) {
        self.config.agent_network = network;
    }

    pub fn set_optimizer(&mut self, optimizer: OptimizerConfig) {
        self.config.optimizer = optimizer;
    }

    pub fn set_eval(&mut self, eval_interval: u64, eval_episodes: usize) {
        self.config.eval_interval = eval_interval;
        self.config.eval_episodes = eval_episodes;
    }

    fn build_with(
        &self,
        config: PpoConfig,
        replica: Option<Replica>,
    ) -> Result<PpoWorkflow<CartPole>> {
        let env = config.env.make(config.num_envs, AutoresetMode::Envpool)?;
        let eval_env = config.env.make(config.num_eval_envs, AutoresetMode::Disabled)?;
        let agent = PpoAgent::new(
            &env.observation_space(),
            &env.action_space(),
            &config.agent_network,
            config.normalize_obs,
            config.clip_epsilon,
        )?;
        PpoWorkflow::new(env, eval_env, agent, config, replica)
    }

    pub fn build(&self) -> Result<PpoWorkflow<CartPole>> {
        self.build_with(self.config.clone(), None)
    }

    /// One replica per device of `mesh`. Env counts and the minibatch size are split over the
    /// replicas.
    pub fn build_data_parallel(&self, mesh: &DeviceMesh) -> Result<DataParallelPpo<CartPole>> {
        let config = self.config.rescale(mesh.len());
        let workflows = ReplicaGroup::new(mesh.len())
            .into_iter()
            .map(|replica| self.build_with(config.clone(), Some(replica)))
            .collect::<Result<Vec<_>>>()?;
        DataParallelPpo::new(workflows, mesh.clone())
    }
}

#[cfg(test)]
mod test {
    use super::PpoWorkflowBuilder;
    use pbrl_core::{error::Error, mesh::DeviceMesh};

    #[test]
    fn setters_reach_the_workflow() -> anyhow::Result<()> {
        let mut builder = PpoWorkflowBuilder::default();
        builder.set_num_envs(4);
        builder.set_rollout_length(8);
        builder.set_minibatch_size(16);
        builder.set_total_timesteps(64);
        let workflow = builder.build()?;
        assert_eq!(workflow.config().num_envs, 4);
        assert_eq!(workflow.num_iterations(), 2);
        Ok(())
    }

    #[test]
    fn unknown_env_is_rejected() {
        let mut builder = PpoWorkflowBuilder::default();
        builder.set_env_name("MountainCar-v0");
        let err = builder.build().err().expect("unknown env");
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::UnsupportedConfig { .. })
        ));
    }

    #[test]
    fn data_parallel_splits_envs() -> anyhow::Result<()> {
        let mut builder = PpoWorkflowBuilder::default();
        builder.set_num_envs(4);
        builder.set_num_eval_envs(2);
        builder.set_rollout_length(8);
        builder.set_minibatch_size(16);
        let data_parallel = builder.build_data_parallel(&DeviceMesh::cpu(2))?;
        assert_eq!(data_parallel.num_replicas(), 2);
        Ok(())
    }
}
