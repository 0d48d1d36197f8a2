use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde_json::json;
use tracing::info;

use modelserve::service_adapters::{ServiceRequest, ServiceRequestor};
use modelserve::serving_config::{ConfigManager, LogFormat};
use modelserve::ModelServer;

/// modelserve - asynchronous model serving core
#[derive(Parser)]
#[command(name = "modelserve")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file (JSON, YAML or TOML)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Log output format, overrides the configuration
    #[arg(long, value_enum)]
    log_format: Option<LogFormatArg>,

    /// Log filter directive, overrides the configuration (RUST_LOG still wins)
    #[arg(long)]
    log_level: Option<String>,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormatArg {
    Text,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(format: LogFormatArg) -> Self {
        match format {
            LogFormatArg::Text => LogFormat::Text,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

/// Answers every service call with the request it received
fn echo_requestor() -> Arc<dyn ServiceRequestor> {
    Arc::new(|request: &ServiceRequest| -> Result<serde_json::Value> {
        Ok(json!({
            "service_type": request.service_type,
            "service_name": request.service_name,
            "parameters": request.parameters,
        }))
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_manager = match &cli.config {
        Some(path) => ConfigManager::from_file(path),
        None => ConfigManager::new(),
    }
    .context("Failed to load configuration")?;

    let mut config = config_manager.into_config();
    if let Some(format) = cli.log_format {
        config.logging.format = format.into();
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    logging::init(&config.logging);

    if let Some(path) = &cli.config {
        info!("Using configuration file {}", path.display());
    }

    let server = ModelServer::new(config, echo_requestor(), echo_requestor())?;
    server.start().await?;

    info!("modelserve is running, press Ctrl+C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    server.stop(true).await?;

    Ok(())
}
