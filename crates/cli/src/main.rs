//! WgVault CLI - Main Entry Point
//!
//! Operator interface for provisioning devices, managing licenses,
//! and driving VPN sessions.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod output;

use commands::{device, license, seed, vpn, Context};
use wgvault_common::ServiceConfig;

/// WgVault CLI - WireGuard provisioning and license metering
#[derive(Parser)]
#[command(name = "wgvault")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Config file path (defaults + env when absent)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Seed an endpoint, IP pool, demo tenant, and trial license
    Seed(seed::SeedArgs),

    /// Manage devices
    #[command(subcommand)]
    Device(device::DeviceCommands),

    /// Manage VPN sessions
    #[command(subcommand)]
    Vpn(vpn::VpnCommands),

    /// Manage licenses
    #[command(subcommand)]
    License(license::LicenseCommands),

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .init();

    if matches!(cli.command, Commands::Version) {
        println!("WgVault CLI v{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config = match &cli.config {
        Some(path) => ServiceConfig::load(path)?,
        None => ServiceConfig::from_env()?,
    };
    let ctx = Context::new(config)?;

    match cli.command {
        Commands::Seed(args) => seed::run(args, &ctx).await?,
        Commands::Device(cmd) => device::run(cmd, &ctx, cli.format).await?,
        Commands::Vpn(cmd) => vpn::run(cmd, &ctx, cli.format).await?,
        Commands::License(cmd) => license::run(cmd, &ctx, cli.format).await?,
        Commands::Version => unreachable!(),
    }

    Ok(())
}
