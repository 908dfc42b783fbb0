pub mod data_parallel;
pub mod distributions;
pub mod networks;
pub mod ppo;
