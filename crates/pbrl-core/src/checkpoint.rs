use anyhow::Result;
use candle_core::Tensor;
use enum_dispatch::enum_dispatch;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};
use tracing::debug;

/// Anything that can be written to a checkpoint: named tensors plus scalar metadata.
pub trait Checkpoint {
    fn export_tensors(&self, prefix: &str, out: &mut HashMap<String, Tensor>);

    fn metadata(&self) -> serde_json::Value;
}

#[enum_dispatch]
pub trait CheckpointManager: Send {
    /// Persists `state` under `step`. Saving the same step again replaces the earlier files.
    fn save(&mut self, step: u64, state: &dyn Checkpoint) -> Result<()>;
}

#[enum_dispatch(CheckpointManager)]
pub enum CheckpointManagerKind {
    Noop(NoopCheckpointManager),
    Safetensors(SafetensorsCheckpointManager),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CheckpointConfig {
    pub enable: bool,
    pub dir: Option<PathBuf>,
}

impl CheckpointConfig {
    pub fn build(&self) -> CheckpointManagerKind {
        match (&self.enable, &self.dir) {
            (true, Some(dir)) => SafetensorsCheckpointManager::new(dir).into(),
            (true, None) => SafetensorsCheckpointManager::new("checkpoints").into(),
            _ => NoopCheckpointManager.into(),
        }
    }
}

#[derive(Debug, Default)]
pub struct NoopCheckpointManager;

impl CheckpointManager for NoopCheckpointManager {
    fn save(&mut self, _step: u64, _state: &dyn Checkpoint) -> Result<()> {
        Ok(())
    }
}

/// Writes `<dir>/step_<n>/state.safetensors` and `<dir>/step_<n>/meta.json`.
#[derive(Debug)]
pub struct SafetensorsCheckpointManager {
    dir: PathBuf,
}

impl SafetensorsCheckpointManager {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn step_dir(&self, step: u64) -> PathBuf {
        self.dir.join(format!("step_{step}"))
    }
}

impl CheckpointManager for SafetensorsCheckpointManager {
    fn save(&mut self, step: u64, state: &dyn Checkpoint) -> Result<()> {
        let target = self.step_dir(step);
        // files land in a staging directory first so a crash never leaves a half-written step
        let staging = self.dir.join(format!(".step_{step}.partial"));
        if staging.exists() {
            std::fs::remove_dir_all(&staging)?;
        }
        std::fs::create_dir_all(&staging)?;

        let mut tensors = HashMap::new();
        state.export_tensors("state", &mut tensors);
        candle_core::safetensors::save(&tensors, staging.join("state.safetensors"))?;
        let meta = serde_json::to_vec_pretty(&state.metadata())?;
        std::fs::write(staging.join("meta.json"), meta)?;

        if target.exists() {
            std::fs::remove_dir_all(&target)?;
        }
        std::fs::rename(&staging, &target)?;
        debug!(step, path = %target.display(), "checkpoint saved");
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::{Checkpoint, CheckpointManager, SafetensorsCheckpointManager};
    use anyhow::Result;
    use candle_core::{Device, Tensor};
    use std::collections::HashMap;

    struct Counter(f32);

    impl Checkpoint for Counter {
        fn export_tensors(&self, prefix: &str, out: &mut HashMap<String, Tensor>) {
            if let Ok(t) = Tensor::new(&[self.0], &Device::Cpu) {
                out.insert(format!("{prefix}.value"), t);
            }
        }

        fn metadata(&self) -> serde_json::Value {
            serde_json::json!({ "value": self.0 })
        }
    }

    #[test]
    fn saving_a_step_twice_overwrites_it() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("pbrl-ckpt-{}", std::process::id()));
        let mut manager = SafetensorsCheckpointManager::new(&dir);
        manager.save(1, &Counter(1.))?;
        manager.save(1, &Counter(2.))?;
        let step_dir = manager.step_dir(1);
        let tensors =
            candle_core::safetensors::load(step_dir.join("state.safetensors"), &Device::Cpu)?;
        assert_eq!(tensors["state.value"].to_vec1::<f32>()?, vec![2.]);
        let meta: serde_json::Value =
            serde_json::from_slice(&std::fs::read(step_dir.join("meta.json"))?)?;
        assert_eq!(meta["value"], 2.);
        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }
}
