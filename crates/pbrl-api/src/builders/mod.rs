pub mod pbt;
pub mod ppo;

pub use pbt::PbtWorkflowBuilder;
pub use ppo::PpoWorkflowBuilder;
