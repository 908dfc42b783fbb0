use crate::{
    config::{Bounds, PbtConfig},
    exploit_explore::{ExploitExploreFn, exploit_and_explore, skip_exploit_and_explore},
    metrics::{PbtEvalMetric, PbtTrainMetric},
    population::PopHyperParams,
};
use anyhow::Result;
use candle_core::Tensor;
use pbrl_core::{
    checkpoint::{Checkpoint, CheckpointManager},
    mesh::DeviceMesh,
    metrics::{ToLocalDict, TrainMetric, WorkflowMetric},
    recorder::Recorder,
    rng::PrngKey,
    workflow::{Workflow, WorkflowState},
};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Scheduler state: the population's hyperparameters and the training state of every member,
/// both in member order.
#[derive(Debug, Clone)]
pub struct PbtState<S> {
    pub key: PrngKey,
    pub metrics: WorkflowMetric,
    pub pop: PopHyperParams,
    pub pop_workflow_state: Vec<S>,
}

impl<S: Checkpoint> Checkpoint for PbtState<S> {
    fn export_tensors(&self, prefix: &str, out: &mut HashMap<String, Tensor>) {
        for (i, member) in self.pop_workflow_state.iter().enumerate() {
            member.export_tensors(&format!("{prefix}.pop.{i}"), out);
        }
    }

    fn metadata(&self) -> serde_json::Value {
        serde_json::json!({
            "key": self.key,
            "metrics": self.metrics,
            "pop": self.pop,
            "members": self
                .pop_workflow_state
                .iter()
                .map(|member| member.metadata())
                .collect::<Vec<_>>(),
        })
    }
}

/// Population based training over copies of an inner workflow.
///
/// One iteration trains every member for `per_iter_workflow_steps` steps, evaluates every
/// member, and, once past warmup, replaces the worst members with perturbed copies of the best.
/// Members are spread over the devices of the mesh, see [`DeviceMesh::map`].
pub struct PbtWorkflow<W: Workflow> {
    workflow: W,
    config: PbtConfig,
    mesh: DeviceMesh,
}

impl<W: Workflow> PbtWorkflow<W> {
    /// Validates `config` and truncates the population to a multiple of the device count. A
    /// population smaller than the mesh is rejected.
    pub fn new(workflow: W, config: PbtConfig, mesh: DeviceMesh) -> Result<Self> {
        config.validate()?;
        let pop_size = mesh.rescale("pop_size", config.pop_size)?;
        let config = PbtConfig { pop_size, ..config };
        if config.num_iters <= config.warmup_iters() {
            warn!(
                num_iters = config.num_iters,
                warmup_iters = config.warmup_iters(),
                "the whole run is warmup, exploit/explore never happens"
            );
        }
        Ok(Self {
            workflow,
            config,
            mesh,
        })
    }

    pub fn config(&self) -> &PbtConfig {
        &self.config
    }

    pub fn workflow(&self) -> &W {
        &self.workflow
    }

    pub fn mesh(&self) -> &DeviceMesh {
        &self.mesh
    }

    pub fn setup(&self, key: PrngKey) -> Result<PbtState<W::State>> {
        let pop_size = self.config.pop_size;
        let [key, workflow_key, pop_key] = key.split_n();
        let Bounds { low, high } = self.config.search_space.lr;
        let pop = PopHyperParams {
            lr: pop_key.uniform_vec(pop_size, low, high),
        };

        let pop_ref = &pop;
        let pop_workflow_state = self.mesh.map(
            workflow_key.split(pop_size),
            self.config.train_strategy(),
            |i, key, device| {
                let state = self.workflow.setup(key, device)?;
                Ok(state.apply_hyperparams(&pop_ref.get(i)?))
            },
        )?;
        info!(pop_size, devices = self.mesh.len(), "population initialized");

        Ok(PbtState {
            key,
            metrics: WorkflowMetric::default(),
            pop,
            pop_workflow_state,
        })
    }

    fn train_members(
        &self,
        pop_workflow_state: Vec<W::State>,
    ) -> Result<(Vec<TrainMetric>, Vec<W::State>)> {
        let steps = self.config.per_iter_workflow_steps;
        let trained = self.mesh.map(
            pop_workflow_state,
            self.config.train_strategy(),
            |_, mut wf_state, _| {
                let mut last = TrainMetric::default();
                for _ in 0..steps {
                    let (train_metrics, next) = self.workflow.step(&wf_state)?;
                    wf_state = next;
                    last = train_metrics;
                }
                Ok((last, wf_state))
            },
        )?;
        Ok(trained.into_iter().unzip())
    }

    fn evaluate_members(
        &self,
        pop_workflow_state: Vec<W::State>,
    ) -> Result<(PbtEvalMetric, Vec<W::State>)> {
        let evaluated = self.mesh.map(
            pop_workflow_state,
            self.config.eval_strategy(),
            |_, wf_state, _| self.workflow.evaluate(&wf_state),
        )?;
        let (eval_metrics, pop_workflow_state): (Vec<_>, Vec<_>) = evaluated.into_iter().unzip();
        Ok((PbtEvalMetric::from(eval_metrics.as_slice()), pop_workflow_state))
    }

    // A copied member still lives on its donor's device. Members already in place are untouched.
    fn place_members(&self, pop_workflow_state: Vec<W::State>) -> Result<Vec<W::State>> {
        self.mesh.map(
            pop_workflow_state,
            self.config.train_strategy(),
            |_, wf_state, device| wf_state.to_device(device),
        )
    }

    /// Whether exploit/explore is skipped in the iteration following `state`.
    pub fn in_warmup(&self, state: &PbtState<W::State>) -> bool {
        state.metrics.iterations < self.config.warmup_iters()
    }

    pub fn step(
        &self,
        state: &PbtState<W::State>,
    ) -> Result<(PbtTrainMetric, PbtState<W::State>)> {
        let (pop_train_metrics, pop_workflow_state) =
            self.train_members(state.pop_workflow_state.clone())?;
        let (pop_eval_metrics, pop_workflow_state) = self.evaluate_members(pop_workflow_state)?;

        let [key, exploit_and_explore_key] = state.key.split_n();
        let warmup = self.in_warmup(state);
        let exploit_and_explore_fn: ExploitExploreFn<W::State> = if warmup {
            skip_exploit_and_explore
        } else {
            exploit_and_explore
        };
        let (pop, pop_workflow_state) = exploit_and_explore_fn(
            &self.config,
            exploit_and_explore_key,
            &pop_eval_metrics.pop_episode_returns,
            &state.pop,
            &pop_workflow_state,
        )?;
        let pop_workflow_state = self.place_members(pop_workflow_state)?;

        let metrics = WorkflowMetric {
            sampled_timesteps: pop_workflow_state
                .iter()
                .map(|wf_state| wf_state.metrics().sampled_timesteps)
                .sum(),
            iterations: state.metrics.iterations + 1,
        };
        let train_metrics = PbtTrainMetric::new(&pop_train_metrics, pop_eval_metrics);
        debug!(iteration = metrics.iterations, warmup, "pbt step done");

        Ok((
            train_metrics,
            PbtState {
                key,
                metrics,
                pop,
                pop_workflow_state,
            },
        ))
    }

    /// Evaluates every member without training. Consumes each member's evaluation key.
    pub fn evaluate(
        &self,
        state: &PbtState<W::State>,
    ) -> Result<(PbtEvalMetric, PbtState<W::State>)> {
        let (eval_metrics, pop_workflow_state) =
            self.evaluate_members(state.pop_workflow_state.clone())?;
        Ok((
            eval_metrics,
            PbtState {
                pop_workflow_state,
                ..state.clone()
            },
        ))
    }

    /// Runs the remaining iterations up to `num_iters`. Every iteration is recorded and
    /// checkpointed when a recorder and a checkpoint manager are handed in.
    pub fn learn(
        &self,
        state: PbtState<W::State>,
        mut recorder: Option<&mut dyn Recorder>,
        mut checkpoints: Option<&mut dyn CheckpointManager>,
    ) -> Result<PbtState<W::State>> {
        let mut state = state;
        for _ in state.metrics.iterations..self.config.num_iters {
            let (train_metrics, next_state) = self.step(&state)?;
            state = next_state;
            let iters = state.metrics.iterations;
            if let Some(recorder) = recorder.as_deref_mut() {
                recorder.write(&state.metrics.to_local_dict(), iters);
                recorder.write(
                    &train_metrics
                        .to_local_dict()
                        .with("pop_lr", state.pop.lr.clone()),
                    iters,
                );
            }
            info!(
                iteration = iters,
                best_return = train_metrics
                    .pop_episode_returns
                    .iter()
                    .copied()
                    .fold(f64::NEG_INFINITY, f64::max),
                sampled_timesteps = state.metrics.sampled_timesteps,
                "pbt iteration"
            );
            if let Some(checkpoints) = checkpoints.as_deref_mut() {
                checkpoints.save(iters, &state)?;
            }
        }
        Ok(state)
    }
}
