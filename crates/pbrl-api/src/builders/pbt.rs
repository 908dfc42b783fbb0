use super::ppo::PpoWorkflowBuilder;
use anyhow::Result;
use derive_more::{Deref, DerefMut};
use pbrl_agents::ppo::PpoWorkflow;
use pbrl_core::mesh::DeviceMesh;
use pbrl_gym::cartpole::CartPole;
use pbrl_meta::{
    PbtConfig, PbtWorkflow,
    config::{Bounds, PerturbFactor},
};

/// PBT over PPO members. Dereferences to the builder of the target workflow, so the member
/// setters are available directly.
#[derive(Debug, Clone, Default, Deref, DerefMut)]
pub struct PbtWorkflowBuilder {
    #[deref]
    #[deref_mut]
    target_workflow: PpoWorkflowBuilder,
    pub config: PbtConfig,
}

impl PbtWorkflowBuilder {
    pub fn new(config: PbtConfig, target_workflow: PpoWorkflowBuilder) -> Self {
        Self {
            target_workflow,
            config,
        }
    }

    pub fn set_pop_size(&mut self, pop_size: usize) {
        self.config.pop_size = pop_size;
    }

    pub fn set_num_iters(&mut self, num_iters: u64) {
        self.config.num_iters = num_iters;
    }

    pub fn set_per_iter_workflow_steps(&mut self, steps: u64) {
        self.config.per_iter_workflow_steps = steps;
    }

    pub fn set_warmup_steps(&mut self, warmup_steps: u64) {
        self.config.warmup_steps = warmup_steps;
    }

    pub fn set_parallel(&mut self, parallel_train: bool, parallel_eval: bool) {
        self.config.parallel_train = parallel_train;
        self.config.parallel_eval = parallel_eval;
    }

    pub fn set_ratios(&mut self, bottom_ratio: f64, top_ratio: f64) {
        self.config.bottom_ratio = bottom_ratio;
        self.config.top_ratio = top_ratio;
    }

    pub fn set_lr_perturb_factor(&mut self, lr: f64) {
        self.config.perturb_factor = PerturbFactor { lr };
    }

    pub fn set_lr_search_space(&mut self, low: f64, high: f64) {
        self.config.search_space.lr = Bounds { low, high };
    }

    /// Members run with the single-device target workflow; the mesh only decides where they
    /// live.
    pub fn build(&self, mesh: DeviceMesh) -> Result<PbtWorkflow<PpoWorkflow<CartPole>>> {
        let workflow = self.target_workflow.build()?;
        PbtWorkflow::new(workflow, self.config.clone(), mesh)
    }
}

#[cfg(test)]
mod test {
    use super::PbtWorkflowBuilder;
    use pbrl_core::{error::Error, mesh::DeviceMesh};

    #[test]
    fn member_setters_go_through_deref() -> anyhow::Result<()> {
        let mut builder = PbtWorkflowBuilder::default();
        builder.set_pop_size(6);
        builder.set_num_envs(2);
        builder.set_rollout_length(8);
        builder.set_minibatch_size(8);
        let pbt = builder.build(DeviceMesh::cpu(4))?;
        assert_eq!(pbt.config().pop_size, 4);
        assert_eq!(pbt.workflow().config().num_envs, 2);
        Ok(())
    }

    #[test]
    fn overlapping_ratios_are_rejected() {
        let mut builder = PbtWorkflowBuilder::default();
        builder.set_ratios(0.7, 0.5);
        let err = builder.build(DeviceMesh::cpu(1)).err().expect("bad ratios");
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::UnsupportedConfig { .. })
        ));
    }
}
