//! Fieldlink gateway entry point.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use fieldlink_common::init_tracing;
use fieldlink_gateway::credential::CredentialIssuer;
use fieldlink_gateway::master::RtuConnector;
use fieldlink_gateway::mqtt::MqttConnector;
use fieldlink_gateway::{Gateway, GatewayConfig, GatewayRunner, Links, Timings};

/// Modbus RTU to cloud MQTT gateway.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to configuration file.
    #[arg(short, long, default_value = "gateway.json5")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = GatewayConfig::load_from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    let mut logging = config.logging.clone();
    if let Some(level) = args.log_level {
        logging.level = level;
    }
    init_tracing(&logging)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        device = %config.cloud.identity.device_id,
        document = %config.modbus.config_path.display(),
        "Starting fieldlink gateway"
    );

    let links = Links {
        master: Arc::new(RtuConnector),
        cloud: Arc::new(MqttConnector::from_config(&config.cloud)?),
        issuer: CredentialIssuer::from_config(
            &config.credential,
            &config.cloud.identity.project_id,
        )?,
    };

    let mut runner = GatewayRunner::new("fieldlink-gateway");
    Gateway::launch(&mut runner, &config, links, Timings::default());
    runner.run().await;

    Ok(())
}
