//! gcdeploy
//!
//! Dual local/remote shell for a Compute Engine instance.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gcdeploy::app::{App, AppSettings};
use gcdeploy::config::{default_log_path, Config};
use gcdeploy::resolver::ConfiguredResolver;
use gcdeploy::session::{SshConnector, SshOptions};
use gcdeploy::ui;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// gcdeploy - run a deployment across a local and a remote shell.
#[derive(Parser, Debug)]
#[command(name = "gcdeploy")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (skips .gcd.toml discovery)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable debug logging and show debug entries in the log pane
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// Write logs to this file instead of the cache directory
    #[arg(long, global = true, value_name = "FILE")]
    pub log_file: Option<PathBuf>,

    /// Subcommand to execute (defaults to opening the session)
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Validate the configuration and print the deployment plan
    Check,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    // Load configuration
    let (mut config, config_path) = match &cli.config {
        Some(path) => (Config::load(path)?, path.clone()),
        None => Config::load_discovered()?,
    };

    // Apply environment variable overrides
    config.apply_env_overrides();

    // Validate configuration
    config.validate()?;

    let log_path = cli.log_file.clone().unwrap_or_else(default_log_path);
    let level = if cli.debug {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    let _guard = init_tracing(&log_path, level)?;

    tracing::info!(config = %config_path.display(), "gcdeploy starting");

    match cli.command {
        Some(Commands::Check) => {
            print_check(&config, &config_path);
            Ok(())
        }
        None => run_session(config, cli.debug).await,
    }
}

/// Logs go to a file because the TUI owns the terminal.
fn init_tracing(path: &Path, level: &str) -> Result<WorkerGuard> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
    let file_name = path
        .file_name()
        .context("Log file path has no file name")?;

    let appender = tracing_appender::rolling::never(dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(level))
        .with_writer(writer)
        .with_ansi(false)
        .init();

    Ok(guard)
}

async fn run_session(config: Config, debug: bool) -> Result<()> {
    let connector = SshConnector::new(
        ConfiguredResolver::from_config(&config),
        config.instance.descriptor(),
        config.ssh_key_path(),
        SshOptions {
            port: config.session.port,
            connect_timeout: config.session.connect_timeout(),
            ..Default::default()
        },
    );

    let mut app = App::new(
        connector,
        config.plan(),
        AppSettings::from_config(&config, debug),
    );

    let result = ui::run(&mut app, config.session.tick_interval()).await;
    tracing::info!("gcdeploy stopped");
    result
}

fn print_check(config: &Config, config_path: &Path) {
    let instance = &config.instance;
    println!("Configuration: {}", config_path.display());
    println!(
        "  Instance: {} (project {}, zone {})",
        instance.name, instance.project_id, instance.zone
    );
    match ConfiguredResolver::from_config(config) {
        ConfiguredResolver::Static(_) => println!(
            "  Address:  {} (fixed)",
            instance.address.as_deref().unwrap_or_default()
        ),
        ConfiguredResolver::Gcloud(_) => println!("  Address:  resolved with gcloud"),
    }
    println!("  SSH key:  {}", config.ssh_key_path().display());
    println!("  Shell:    {}", config.session.shell);

    let plan = config.plan();
    if plan.is_empty() {
        if let Some(command) = config.initial_command() {
            println!("  Command:  {command}");
        }
        return;
    }
    println!("  Deployment ({} steps):", plan.len());
    for (i, step) in plan.iter().enumerate() {
        println!("    {:>2}. [{}] {}", i + 1, step.target, step.command);
    }
}
