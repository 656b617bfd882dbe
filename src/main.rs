use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use worldgen::config::Settings;

mod cmd;

#[derive(Parser)]
#[command(name = "worldgen")]
#[command(version, about = "Generate game worlds per seed in isolated compute units")]
pub struct Cli {
    /// Path to worldgen.toml (defaults to $WORLDGEN_CONFIG, then ./worldgen.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate the world for a seed and wait for the job to finish
    Generate {
        seed: String,
        /// Regenerate even when artifacts already exist
        #[arg(long)]
        force: bool,
        /// Always launch a cold unit, even when the pool is enabled
        #[arg(long)]
        no_pool: bool,
    },
    /// Print the launch plan for a seed without running anything
    Plan { seed: String },
    /// Show the latest recorded job for a seed
    Status { seed: String },
    /// Inspect or manage the warm engine pool
    Pool {
        #[command(subcommand)]
        command: PoolCommands,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum PoolCommands {
    /// List engines known to the runtime
    Status,
    /// Start engines until `count` are running
    Warm {
        #[arg(long, default_value = "1")]
        count: usize,
    },
    /// Retire idle engines past their TTL
    Cleanup,
    /// Stop and remove every engine
    Shutdown,
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    let mut settings = Settings::resolve(cli.config.as_deref())?;
    if let Some(dir) = &cli.data_dir {
        settings.data_dir = dir.clone();
    }
    if cli.json_logs {
        settings.logging.json = true;
    }
    if settings.data_dir.is_relative() {
        let cwd = std::env::current_dir().context("Failed to get current directory")?;
        settings.data_dir = cwd.join(&settings.data_dir);
    }
    Ok(settings)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let settings = load_settings(&cli)?;
    let _logging = worldgen::logging::init_logging(&settings.logging)
        .context("Failed to initialize logging")?;

    match &cli.command {
        Commands::Generate {
            seed,
            force,
            no_pool,
        } => cmd::cmd_generate(&settings, seed, *force, *no_pool).await?,
        Commands::Plan { seed } => cmd::cmd_plan(&settings, seed)?,
        Commands::Status { seed } => cmd::cmd_status(&settings, seed).await?,
        Commands::Pool { command } => cmd::cmd_pool(&settings, command.clone()).await?,
        Commands::Config { command } => cmd::cmd_config(&settings, command.clone())?,
    }

    Ok(())
}
