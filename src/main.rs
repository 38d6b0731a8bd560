use blockfeed::cli::run::{block_on, RunOverrides, RUNTIME_SHUTDOWN_GRACE};
use blockfeed::config::{resolve_config_path, Mode};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "blockfeed")]
#[command(about = "Blockchain node console ingestor and block stream server", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    Run {
        /// Line source: stdin, logs or node
        #[arg(long)]
        mode: Option<Mode>,

        #[arg(long)]
        start_block: Option<u64>,

        /// Last block to ingest (inclusive); 0 runs unbounded
        #[arg(long)]
        stop_block: Option<u64>,

        /// Block stream listen address
        #[arg(long)]
        listen: Option<String>,
    },
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Init {
        #[arg(long)]
        stdout: bool,
    },
    Validate,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logs go to stderr so `config init --stdout` output stays clean
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "blockfeed=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    block_on(dispatch(cli), RUNTIME_SHUTDOWN_GRACE)?
}

async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = resolve_config_path(cli.config.as_deref());

    match cli.command {
        Some(Commands::Run {
            mode,
            start_block,
            stop_block,
            listen,
        }) => {
            let overrides = RunOverrides {
                mode,
                start_block,
                stop_block,
                listen,
            };
            blockfeed::cli::run::run(config_path, overrides).await?;
        }
        None => {
            // Default behavior is to run
            blockfeed::cli::run::run(config_path, RunOverrides::default()).await?;
        }
        Some(Commands::Config { action }) => match action {
            ConfigAction::Init { stdout } => {
                blockfeed::cli::config::init(stdout)?;
            }
            ConfigAction::Validate => {
                blockfeed::cli::config::validate(config_path)?;
            }
        },
    }

    Ok(())
}
