pub mod agent;
pub mod checkpoint;
pub mod distributed;
pub mod env;
pub mod error;
pub mod evaluator;
pub mod gae;
pub mod gradients;
pub mod mesh;
pub mod metrics;
pub mod optimizer;
pub mod recorder;
pub mod rng;
pub mod rollout;
pub mod running_mean;
pub mod tensor;
pub mod workflow;

pub use error::Error;
