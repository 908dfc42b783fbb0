pub mod config;
pub mod exploit_explore;
pub mod metrics;
pub mod pbt;
pub mod population;

pub use config::PbtConfig;
pub use pbt::{PbtState, PbtWorkflow};
