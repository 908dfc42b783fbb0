use crate::ppo::{PpoTrainingState, PpoWorkflow};
use anyhow::{Result, bail};
use pbrl_core::{
    checkpoint::CheckpointManager,
    env::Env,
    error::Error,
    mesh::DeviceMesh,
    recorder::Recorder,
    rng::PrngKey,
    workflow::Workflow,
};
use tracing::info;

/// PPO replicated over the devices of a mesh. Replica `r` runs on device `r`; rank 0 writes
/// metrics and checkpoints.
pub struct DataParallelPpo<E: Env> {
    workflows: Vec<PpoWorkflow<E>>,
    mesh: DeviceMesh,
}

impl<E: Env> DataParallelPpo<E> {
    /// `workflows[r]` must hold the replica handle of rank `r`.
    pub fn new(workflows: Vec<PpoWorkflow<E>>, mesh: DeviceMesh) -> Result<Self> {
        if workflows.is_empty() || workflows.len() != mesh.len() {
            bail!(Error::unsupported(
                "replicas",
                format!("{} workflows for {} devices", workflows.len(), mesh.len())
            ));
        }
        Ok(Self { workflows, mesh })
    }

    pub fn num_replicas(&self) -> usize {
        self.workflows.len()
    }

    /// Sets up every replica from `key` and trains to the end of the budget. Returns the state
    /// of rank 0.
    pub fn learn(
        &self,
        key: PrngKey,
        recorder: &mut dyn Recorder,
        checkpoints: &mut dyn CheckpointManager,
    ) -> Result<PpoTrainingState<E::Inner>> {
        info!(replicas = self.num_replicas(), "starting data parallel training");
        let mut recorder = Some(recorder);
        let mut checkpoints = Some(checkpoints);
        let results = crossbeam::scope(|s| {
            let handles: Vec<_> = self
                .workflows
                .iter()
                .enumerate()
                .map(|(rank, workflow)| {
                    let device = self.mesh.device(rank).clone();
                    let recorder = if rank == 0 { recorder.take() } else { None };
                    let checkpoints = if rank == 0 { checkpoints.take() } else { None };
                    s.spawn(move |_| {
                        let res = workflow
                            .setup(key, &device)
                            .and_then(|state| workflow.learn(state, recorder, checkpoints));
                        if res.is_err() {
                            if let Some(replica) = workflow.replica() {
                                replica.abort();
                            }
                        }
                        res
                    })
                })
                .collect();
            handles
                .into_iter()
                .enumerate()
                .map(|(rank, handle)| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(Error::ShardPanicked(rank).into()))
                })
                .collect::<Vec<_>>()
        })
        .map_err(|_| Error::ShardPanicked(0))?;

        let mut states = vec![];
        let mut errors = vec![];
        for res in results {
            match res {
                Ok(state) => states.push(state),
                Err(err) => errors.push(err),
            }
        }
        if !errors.is_empty() {
            // report the failure that caused the abort rather than the aborted collectives
            let root = errors
                .iter()
                .position(|err| {
                    !matches!(err.downcast_ref::<Error>(), Some(Error::CollectiveAborted))
                })
                .unwrap_or(0);
            return Err(errors.swap_remove(root));
        }
        match states.into_iter().next() {
            Some(state) => Ok(state),
            None => Err(Error::unsupported("replicas", 0).into()),
        }
    }
}
