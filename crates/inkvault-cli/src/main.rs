use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use inkvault_sync::{IngestConfig, ProcessingOrder, RunMode};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "inkvault-cli")]
#[command(about = "Chapter ingestion pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Walk the catalog forever.
    Run(PassArgs),
    /// Walk the catalog once and exit.
    Once(PassArgs),
    /// Apply database migrations and exit.
    Migrate,
}

#[derive(Debug, Clone, Default, Args)]
struct PassArgs {
    /// Overrides RUN_MODE.
    #[arg(long, value_enum)]
    run_mode: Option<RunModeArg>,
    /// Process series in reverse catalog order.
    #[arg(long)]
    reverse: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RunModeArg {
    Full,
    Top30,
}

impl From<RunModeArg> for RunMode {
    fn from(value: RunModeArg) -> Self {
        match value {
            RunModeArg::Full => RunMode::Full,
            RunModeArg::Top30 => RunMode::Top30,
        }
    }
}

fn load_config(args: &PassArgs) -> Result<IngestConfig> {
    let mut config = IngestConfig::from_env()?;
    if let Some(mode) = args.run_mode {
        config.run_mode = mode.into();
    }
    if args.reverse {
        config.order = ProcessingOrder::Reverse;
    }
    config.log_redacted();
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("inkvault=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run(PassArgs::default())) {
        Commands::Run(args) => {
            let config = load_config(&args)?;
            let orchestrator = inkvault_sync::build_orchestrator(&config).await?;
            let shutdown = orchestrator.shutdown_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("interrupted, finishing the current chapter");
                    shutdown.cancel();
                }
            });
            orchestrator.run_forever().await;
        }
        Commands::Once(args) => {
            let config = load_config(&args)?;
            let orchestrator = inkvault_sync::build_orchestrator(&config).await?;
            let summary = orchestrator.run_pass().await?;
            println!(
                "pass complete: listed={} selected={} processed={} locked={} failed={} chapters_ingested={} chapters_failed={}",
                summary.series_listed,
                summary.series_selected,
                summary.series_processed,
                summary.series_locked,
                summary.series_failed,
                summary.chapters_ingested,
                summary.chapters_failed
            );
        }
        Commands::Migrate => {
            let database_url = inkvault_sync::config::database_url_from_env();
            inkvault_sync::connect_catalog(&database_url).await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
