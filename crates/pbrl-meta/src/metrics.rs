use pbrl_core::metrics::{EvaluateMetric, Metrics, ToLocalDict, TrainMetric};
use serde::{Deserialize, Serialize};

/// Per member results of one PBT iteration, in member order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PbtTrainMetric {
    pub pop_episode_returns: Vec<f64>,
    pub pop_episode_lengths: Vec<f64>,
    /// Last training step of every member.
    pub pop_train_episode_returns: Vec<Option<f64>>,
    pub pop_loss: Vec<f64>,
}

impl PbtTrainMetric {
    pub fn new(train: &[TrainMetric], eval: PbtEvalMetric) -> Self {
        Self {
            pop_episode_returns: eval.pop_episode_returns,
            pop_episode_lengths: eval.pop_episode_lengths,
            pop_train_episode_returns: train.iter().map(|m| m.train_episode_return).collect(),
            pop_loss: train.iter().map(|m| m.loss).collect(),
        }
    }
}

impl ToLocalDict for PbtTrainMetric {
    fn to_local_dict(&self) -> Metrics {
        let mut metrics = Metrics::new()
            .with("pop_episode_returns", self.pop_episode_returns.clone())
            .with("pop_episode_lengths", self.pop_episode_lengths.clone())
            .with("pop_loss", self.pop_loss.clone());
        for (i, ret) in self.pop_train_episode_returns.iter().enumerate() {
            metrics.insert(format!("pop_train_episode_returns/{i}"), (*ret).into());
        }
        metrics
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PbtEvalMetric {
    pub pop_episode_returns: Vec<f64>,
    pub pop_episode_lengths: Vec<f64>,
}

impl From<&[EvaluateMetric]> for PbtEvalMetric {
    fn from(eval: &[EvaluateMetric]) -> Self {
        Self {
            pop_episode_returns: eval.iter().map(|m| m.episode_returns).collect(),
            pop_episode_lengths: eval.iter().map(|m| m.episode_lengths).collect(),
        }
    }
}

impl ToLocalDict for PbtEvalMetric {
    fn to_local_dict(&self) -> Metrics {
        Metrics::new()
            .with("pop_episode_returns", self.pop_episode_returns.clone())
            .with("pop_episode_lengths", self.pop_episode_lengths.clone())
    }
}
