// builders + run configs + the entry points the cli drives
pub mod builders;
pub mod config;
pub mod run;
