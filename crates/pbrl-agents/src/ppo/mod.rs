pub mod agent;
pub mod config;
pub mod workflow;

pub use agent::{PpoAgent, PpoAgentState};
pub use config::PpoConfig;
pub use workflow::{PpoTrainingState, PpoWorkflow};
