use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use accelbench_core::TracingObserver;
use accelbench_pipeline::{BenchConfig, BenchSession};

mod cli;

use cli::{Cli, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("accelbench v{}", env!("CARGO_PKG_VERSION"));

    // Load or create config.
    let mut config = if let Some(config_path) = &cli.config {
        let data = std::fs::read_to_string(config_path)?;
        serde_json::from_str(&data)?
    } else {
        cli.preset.map(|p| p.config()).unwrap_or_default()
    };
    if let Some(device) = cli.device {
        config.device_ordinal = device;
    }

    match cli.command {
        Command::Run(args) => {
            args.apply(&mut config)?;
            let mut session = build_session(config, cli.progress)?;
            let result = tokio::task::spawn_blocking(move || session.run_simple()).await??;
            cli::print_benchmark(&result, cli.format)?;
        }
        Command::DoubleBuffer(args) => {
            args.apply(&mut config)?;
            let mut session = build_session(config, cli.progress)?;
            let result =
                tokio::task::spawn_blocking(move || session.run_double_buffered()).await??;
            cli::print_double_buffered(&result, cli.format)?;
        }
        Command::Stream(args) => {
            args.run.apply(&mut config)?;
            if let Some(capacity) = args.channel_capacity {
                config.channel_capacity = capacity;
            }
            let mut session = build_session(config, cli.progress)?;
            let report = match args.batches {
                Some(batches) => session.run_streaming_batches(batches).await?,
                None => {
                    let duration = Duration::from_millis(args.duration_ms.unwrap_or(1000));
                    session.run_streaming(duration).await?
                }
            };
            cli::print_stream(&report, cli.format)?;
        }
        Command::Tasks => cli::print_tasks(cli.format)?,
    }

    Ok(())
}

fn build_session(config: BenchConfig, progress: bool) -> anyhow::Result<BenchSession> {
    tracing::debug!(config = ?config, "effective config");
    let mut session = BenchSession::build(config)?;
    if progress {
        session.subscribe(Arc::new(TracingObserver));
    }
    Ok(session)
}
