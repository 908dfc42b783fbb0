use derive_more::{Deref, DerefMut};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Scalar(f64),
    Vector(Vec<f64>),
    /// Written as `null`, e.g. a training return when no episode finished.
    Missing,
}

impl From<f64> for MetricValue {
    fn from(value: f64) -> Self {
        Self::Scalar(value)
    }
}

impl From<Option<f64>> for MetricValue {
    fn from(value: Option<f64>) -> Self {
        value.map_or(Self::Missing, Self::Scalar)
    }
}

impl From<Vec<f64>> for MetricValue {
    fn from(value: Vec<f64>) -> Self {
        Self::Vector(value)
    }
}

/// A flat, ordered mapping of metric name to value, the unit a recorder writes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Deref, DerefMut)]
pub struct Metrics(pub BTreeMap<String, MetricValue>);

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<MetricValue>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    /// Same metrics with every name prefixed by `prefix/`.
    pub fn prefixed(&self, prefix: &str) -> Self {
        Self(
            self.iter()
                .map(|(name, value)| (format!("{prefix}/{name}"), value.clone()))
                .collect(),
        )
    }

    pub fn scalar(&self, name: &str) -> Option<f64> {
        match self.get(name) {
            Some(MetricValue::Scalar(v)) => Some(*v),
            _ => None,
        }
    }
}

pub trait ToLocalDict {
    fn to_local_dict(&self) -> Metrics;
}

/// Counters carried in a workflow state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMetric {
    pub sampled_timesteps: u64,
    pub iterations: u64,
}

impl ToLocalDict for WorkflowMetric {
    fn to_local_dict(&self) -> Metrics {
        Metrics::new()
            .with("sampled_timesteps", self.sampled_timesteps as f64)
            .with("iterations", self.iterations as f64)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainMetric {
    pub train_episode_return: Option<f64>,
    pub loss: f64,
    pub raw_loss_dict: BTreeMap<String, f64>,
}

impl ToLocalDict for TrainMetric {
    fn to_local_dict(&self) -> Metrics {
        let mut metrics = Metrics::new()
            .with("train_episode_return", self.train_episode_return)
            .with("loss", self.loss);
        for (name, value) in self.raw_loss_dict.iter() {
            metrics.insert(format!("raw_loss_dict/{name}"), (*value).into());
        }
        metrics
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluateMetric {
    pub episode_returns: f64,
    pub episode_lengths: f64,
}

impl ToLocalDict for EvaluateMetric {
    fn to_local_dict(&self) -> Metrics {
        Metrics::new()
            .with("episode_returns", self.episode_returns)
            .with("episode_lengths", self.episode_lengths)
    }
}
