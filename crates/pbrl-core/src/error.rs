use thiserror::Error;

/// Fatal conditions raised by the core. Everything here aborts the current call stack; the
/// recoverable configuration problems are truncated and reported with `tracing::warn!` instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("shape mismatch in {op}: expected {expected}, got {got}")]
    ShapeMismatch {
        op: &'static str,
        expected: String,
        got: String,
    },

    #[error("unsupported configuration value for `{key}`: {value}")]
    UnsupportedConfig { key: String, value: String },

    #[error("index {index} out of range for population of size {len}")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("loss term `{0}` is not produced by the agent")]
    MissingLossTerm(String),

    #[error("replica group was aborted by a failing replica")]
    CollectiveAborted,

    #[error("shard {0} panicked")]
    ShardPanicked(usize),
}

impl Error {
    pub fn unsupported(key: impl Into<String>, value: impl ToString) -> Self {
        Self::UnsupportedConfig {
            key: key.into(),
            value: value.to_string(),
        }
    }

    pub fn shape(op: &'static str, expected: impl ToString, got: impl ToString) -> Self {
        Self::ShapeMismatch {
            op,
            expected: expected.to_string(),
            got: got.to_string(),
        }
    }
}
