//! Permits ETL - Main entry point

use anyhow::{Context, Result};
use clap::Parser;
use permits_common::logging::{init_logging, ConsoleStream, LogConfig, LogLevel, LogOutput};
use serde::Serialize;
use std::process;
use tracing::{error, info, warn};

use permits_etl::{Cli, Commands, Config, PipelineCoordinator, Stores};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_config = LogConfig::builder()
        .level(if cli.verbose { LogLevel::Debug } else { LogLevel::Info })
        .output(LogOutput::Console)
        // stdout carries the JSON results a scheduler reads
        .console_stream(ConsoleStream::Stderr)
        .log_file_prefix("permits-etl")
        .filter_directives("permits_etl=debug,sqlx=warn,aws_config=warn")
        .build();

    // Environment variables take precedence
    let log_config = log_config.merge_env().unwrap_or_else(|e| {
        eprintln!("Ignoring invalid LOG_* settings: {}", e);
        LogConfig::default()
    });
    let _guard = match init_logging(&log_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Logging disabled: {}", e);
            None
        }
    };

    if let Err(e) = execute(cli).await {
        error!(error = %e, "Command failed");
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn execute(cli: Cli) -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;
    let dataset_key = cli
        .dataset
        .clone()
        .unwrap_or_else(|| config.pipeline.dataset_key.clone());

    let stores = if cli.in_memory {
        warn!("Using in-memory stores; nothing is persisted");
        Stores::in_memory()
    } else {
        Stores::connect(&config)
            .await
            .context("Failed to connect to stores")?
    };

    let coordinator = PipelineCoordinator::new(stores, &config);

    let token = coordinator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling at the next step boundary");
            token.cancel();
        }
    });

    match &cli.command {
        Commands::Run { source } => {
            let source = Commands::raw_source(source.as_ref().or(config.pipeline.raw_file_path.as_ref()));
            let summary = coordinator.run(&dataset_key, source).await?;
            info!(run_id = %summary.run.run_id, "Pipeline run succeeded");
            print_json(&summary)
        }

        Commands::Begin => {
            let run = coordinator.begin(&dataset_key).await?;
            print_json(&run)
        }

        Commands::Stage { step, run_id, source } => {
            let source = Commands::raw_source(source.as_ref());
            let outcome = coordinator
                .run_step(*run_id, *step, &source)
                .await
                .with_context(|| format!("Step {} failed for run {}", step, run_id))?;
            print_json(&outcome)
        }

        Commands::RebuildIndex => {
            let outcome = coordinator.rebuild_index(&dataset_key).await?;
            print_json(&outcome)
        }

        Commands::Report => {
            let report = coordinator.report(&dataset_key).await?;
            print_json(&report)
        }

        Commands::Status => match coordinator.status(&dataset_key).await? {
            Some(run) => print_json(&run),
            None => {
                println!("No runs recorded for dataset '{}'", dataset_key);
                Ok(())
            }
        },
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("Failed to render output")?;
    println!("{}", rendered);
    Ok(())
}
