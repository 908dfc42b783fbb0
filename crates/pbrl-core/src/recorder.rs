use crate::metrics::{MetricValue, Metrics};
use anyhow::Result;
use enum_dispatch::enum_dispatch;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::{File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use tracing::{info, warn};

/// A sink for metrics. Writing never fails the caller; sinks report their own I/O problems.
#[enum_dispatch]
pub trait Recorder: Send {
    fn write(&mut self, data: &Metrics, step: u64);
}

#[enum_dispatch(Recorder)]
pub enum RecorderKind {
    Log(LogRecorder),
    Jsonl(JsonlRecorder),
    Memory(MemoryRecorder),
    Chain(ChainRecorder),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecorderConfig {
    #[default]
    Log,
    Jsonl { path: PathBuf },
    LogAndJsonl { path: PathBuf },
}

impl RecorderConfig {
    pub fn build(&self) -> Result<RecorderKind> {
        Ok(match self {
            Self::Log => LogRecorder.into(),
            Self::Jsonl { path } => JsonlRecorder::create(path)?.into(),
            Self::LogAndJsonl { path } => ChainRecorder(vec![
                LogRecorder.into(),
                JsonlRecorder::create(path)?.into(),
            ])
            .into(),
        })
    }
}

/// Emits one `info!` event per write.
#[derive(Debug, Default)]
pub struct LogRecorder;

impl Recorder for LogRecorder {
    fn write(&mut self, data: &Metrics, step: u64) {
        match serde_json::to_string(&data.0) {
            Ok(json) => info!(step, "{json}"),
            Err(err) => warn!(step, "could not serialize metrics: {err}"),
        }
    }
}

#[derive(Serialize)]
struct JsonlLine<'a> {
    step: u64,
    #[serde(flatten)]
    data: &'a BTreeMap<String, MetricValue>,
}

/// Appends one JSON object per write to a file.
pub struct JsonlRecorder {
    writer: BufWriter<File>,
}

impl JsonlRecorder {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    fn try_write(&mut self, data: &Metrics, step: u64) -> Result<()> {
        let line = JsonlLine {
            step,
            data: &data.0,
        };
        serde_json::to_writer(&mut self.writer, &line)?;
        writeln!(self.writer)?;
        self.writer.flush()?;
        Ok(())
    }
}

impl Recorder for JsonlRecorder {
    fn write(&mut self, data: &Metrics, step: u64) {
        if let Err(err) = self.try_write(data, step) {
            warn!(step, "could not write metrics: {err}");
        }
    }
}

/// Keeps every write in memory. Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecorder {
    records: Arc<Mutex<Vec<(u64, Metrics)>>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<(u64, Metrics)> {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Recorder for MemoryRecorder {
    fn write(&mut self, data: &Metrics, step: u64) {
        let mut records = self
            .records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        records.push((step, data.clone()));
    }
}

/// Forwards every write to each inner recorder in order.
pub struct ChainRecorder(pub Vec<RecorderKind>);

impl Recorder for ChainRecorder {
    fn write(&mut self, data: &Metrics, step: u64) {
        for recorder in self.0.iter_mut() {
            recorder.write(data, step);
        }
    }
}

#[cfg(test)]
mod test {
    use super::{JsonlRecorder, MemoryRecorder, Recorder, RecorderKind};
    use crate::metrics::{MetricValue, Metrics};
    use anyhow::Result;

    #[test]
    fn memory_recorder_shares_storage_with_clones() {
        let memory = MemoryRecorder::new();
        let mut recorder: RecorderKind = memory.clone().into();
        recorder.write(&Metrics::new().with("loss", 1.), 3);
        let records = memory.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, 3);
        assert_eq!(records[0].1.scalar("loss"), Some(1.));
    }

    #[test]
    fn jsonl_recorder_writes_one_line_per_call() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("pbrl-jsonl-{}", std::process::id()));
        let path = dir.join("metrics.jsonl");
        let _ = std::fs::remove_file(&path);
        let mut recorder = JsonlRecorder::create(&path)?;
        recorder.write(&Metrics::new().with("a", 1.), 1);
        recorder.write(&Metrics::new().with("a", None::<f64>), 2);
        let content = std::fs::read_to_string(&path)?;
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines, vec![r#"{"step":1,"a":1.0}"#, r#"{"step":2,"a":null}"#]);
        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }
}
