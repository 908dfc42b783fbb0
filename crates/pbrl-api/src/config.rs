use anyhow::{Context, Result};
use pbrl_agents::ppo::PpoConfig;
use pbrl_core::{checkpoint::CheckpointConfig, recorder::RecorderConfig};
use pbrl_meta::PbtConfig;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::path::Path;

/// Settings shared by every run regardless of the workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    pub seed: u64,
    /// `cpu`, `cpu:N` or `cuda:I,J,...`
    pub devices: String,
    pub recorder: RecorderConfig,
    pub checkpoint: CheckpointConfig,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            seed: 42,
            devices: "cpu".into(),
            recorder: RecorderConfig::default(),
            checkpoint: CheckpointConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PpoRunConfig {
    pub run: RunOptions,
    pub ppo: PpoConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PbtRunConfig {
    pub run: RunOptions,
    pub pbt: PbtConfig,
    /// Configuration of every population member.
    pub target_workflow: PpoConfig,
}

/// Reads a JSON config. Missing keys keep their defaults; without a path the defaults are used.
pub fn load<T: DeserializeOwned + Default>(path: Option<&Path>) -> Result<T> {
    let Some(path) = path else {
        return Ok(T::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("could not read config {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid config {}", path.display()))
}
