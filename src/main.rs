//! Storage Array Driver
//!
//! Loads the driver configuration, connects to the array (or to the
//! in-process simulator), runs the setup checks and prints the capacity
//! report as JSON.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use storage_array_driver::{
    ArrayDriver, ArrayGatewayRef, ArraySimulator, DriverConfig, MemoryCatalog, SshConfig,
    SshGateway,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Storage Array Driver - block volumes on CLI-managed arrays
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Driver configuration file (YAML)
    #[arg(long, env = "DRIVER_CONFIG")]
    config: Option<PathBuf>,

    /// Array management address, overrides the file
    #[arg(long, env = "SAN_IP")]
    san_ip: Option<String>,

    /// Pool for new volumes, overrides the file
    #[arg(long, env = "VOLPOOL_NAME")]
    pool: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Talk to the in-process simulator instead of the array
    #[arg(long, env = "SIMULATE")]
    simulate: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let mut config = match &args.config {
        Some(path) => DriverConfig::from_yaml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => DriverConfig::default(),
    };
    if let Some(ip) = &args.san_ip {
        config.san_ip = ip.clone();
    }
    if let Some(pool) = &args.pool {
        config.volpool_name = pool.clone();
    }

    info!("Starting Storage Array Driver");
    info!("  Version: {}", storage_array_driver::VERSION);
    info!("  Pool: {}", config.volpool_name);
    info!("  Protocol: {}", config.connection_protocol);
    info!("  Simulated: {}", args.simulate);

    let gateway: ArrayGatewayRef = if args.simulate {
        if config.san_ip.is_empty() {
            config.san_ip = "simulator".to_string();
        }
        if config.san_password.is_none() && config.san_private_key.is_none() {
            config.san_password = Some("simulator".to_string());
        }
        Arc::new(ArraySimulator::new(&config.volpool_name))
    } else {
        Arc::new(SshGateway::new(SshConfig::from(&config)))
    };

    let driver = ArrayDriver::new(config, gateway, Arc::new(MemoryCatalog::new()));
    driver.do_setup().await.context("array setup failed")?;
    driver
        .check_for_setup_error()
        .await
        .context("configuration does not match the array")?;

    let profile = driver.profile()?;
    info!(
        "Connected to {} ({}) with {} node(s)",
        profile.system_name,
        profile.system_id,
        profile.nodes.len()
    );

    let stats = driver.get_volume_stats(true).await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    // Logs go to stderr so stdout carries only the report
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
