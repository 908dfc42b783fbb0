use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use pbrl_api::{
    config::{PbtRunConfig, PpoRunConfig, RunOptions, load},
    run::{run_pbt, run_ppo},
};
use std::{path::PathBuf, process::ExitCode};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pbrl", about = "Population based training for on-policy RL")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train a single PPO agent, data parallel over the devices.
    Ppo(RunArgs),
    /// Train a population of PPO agents with PBT.
    Pbt(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// JSON config file. Defaults are used for anything missing.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Overrides the seed of the config.
    #[arg(long)]
    seed: Option<u64>,
    /// Overrides the devices of the config: `cpu`, `cpu:N` or `cuda:0,1`.
    #[arg(long)]
    devices: Option<String>,
}

impl RunArgs {
    fn apply(&self, run: &mut RunOptions) {
        if let Some(seed) = self.seed {
            run.seed = seed;
        }
        if let Some(devices) = &self.devices {
            run.devices = devices.clone();
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Ppo(args) => {
            let mut config: PpoRunConfig = load(args.config.as_deref())?;
            args.apply(&mut config.run);
            run_ppo(&config)?;
        }
        Command::Pbt(args) => {
            let mut config: PbtRunConfig = load(args.config.as_deref())?;
            args.apply(&mut config.run);
            run_pbt(&config)?;
        }
    }
    Ok(())
}
