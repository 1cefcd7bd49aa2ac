//! kvlogd — the kvlog daemon.
//!
//! Assembles one service instance:
//! - Log broker connection (in-process or Kafka)
//! - State store (dict, disk or sqlite)
//! - Log materializer
//! - Log publisher
//! - HTTP API
//!
//! # Usage
//!
//! ```text
//! KV_API_KAFKA_KEY_VALUE_TOPIC=kv kvlogd serve --config /etc/kvlog/kvlog.toml
//! kvlogd probe http://127.0.0.1:8080/healthz/ready
//! ```

mod probe;
mod service;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use kvlog_core::ServiceConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::service::Service;

const DEFAULT_LOG_FILTER: &str = "info,kvlogd=debug,kvlog=debug";

#[derive(Parser)]
#[command(name = "kvlogd", about = "kvlog daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the key-value API.
    Serve {
        /// TOML configuration file. Environment variables override it.
        #[arg(long, env = "KVLOG_CONFIG")]
        config: Option<PathBuf>,

        /// Log output format.
        #[arg(long, value_enum, default_value = "text")]
        log_format: LogFormat,
    },
    /// Probe an HTTP endpoint once. Exits 0 on a 2xx answer, 1 otherwise.
    Probe {
        /// Full URL, e.g. http://127.0.0.1:8080/healthz/ready
        url: String,

        /// Request timeout in milliseconds.
        #[arg(long, default_value = "5000")]
        timeout_ms: u64,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config, log_format } => {
            init_tracing(log_format);
            run_serve(config.as_deref()).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Probe { url, timeout_ms } => {
            init_tracing(LogFormat::Text);
            let healthy = probe::probe(&url, Duration::from_millis(timeout_ms)).await?;
            Ok(if healthy {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}

async fn run_serve(config_path: Option<&Path>) -> anyhow::Result<()> {
    info!("kvlog daemon starting");

    let config = ServiceConfig::load(config_path).context("invalid configuration")?;
    let service = Service::bind(config).await?;

    // Graceful shutdown on Ctrl-C.
    service
        .run(async {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install CTRL+C handler");
            info!("shutdown signal received");
        })
        .await?;

    info!("kvlog daemon stopped");
    Ok(())
}
