mod scenario;

use clap::{Parser, Subcommand, ValueEnum};
use conductor_coordination::{Coordinator, CoordinatorConfig};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "conductor", about = "Conductor: multi-agent coordination engine")]
struct Cli {
    /// Path to config file; built-in defaults are used when it is absent
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Json,
    Pretty,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and validate the config, then print the effective settings
    Validate,
    /// Replay a scenario file through the engine and print the result as JSON
    Simulate {
        /// Scenario TOML with [[agents]] and [[tasks]]
        scenario: PathBuf,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .pretty()
            .with_writer(std::io::stderr)
            .init(),
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<CoordinatorConfig> {
    match path {
        Some(path) => Ok(CoordinatorConfig::from_file(path)?),
        None => Ok(CoordinatorConfig::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = load_config(cli.config.as_ref())?;
    config.validate()?;

    match cli.command {
        Commands::Validate => {
            info!(strategy = %config.strategy, "Config is valid");
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Simulate { scenario } => {
            let content = tokio::fs::read_to_string(&scenario).await.map_err(|e| {
                anyhow::anyhow!("Failed to read scenario '{}': {}", scenario.display(), e)
            })?;
            let parsed = scenario::Scenario::from_toml_str(&content)?;
            info!(
                agents = parsed.agents.len(),
                tasks = parsed.tasks.len(),
                strategy = %config.strategy,
                "Starting simulation"
            );
            let coordinator = Coordinator::new(config)?;
            let report = scenario::run(&coordinator, &parsed).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}
