//! envctl - Entry Point
//!
//! Deploys, stops, removes and inspects local multi-process test
//! environments described by a JSON manifest.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use envctl::commands::{self, Context};
use envctl::filesys::file::File;
use envctl::logs::{init_logging, LogLevel, LogOptions};
use envctl::storage::settings::Settings;
use envctl::utils::version_info;

#[derive(Parser)]
#[command(name = "envctl")]
#[command(about = "Deploy multi-process test environments", long_about = None)]
struct Cli {
    /// Settings file
    #[arg(long, global = true, default_value = "envctl.json")]
    settings: PathBuf,

    /// Environment name, overrides the settings file
    #[arg(long, global = true)]
    env: Option<String>,

    /// Selected profile, repeatable. Replaces the profiles of the settings file.
    #[arg(long = "profile", global = true)]
    profiles: Vec<String>,

    /// Root of all environment state
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy every app the manifest selects
    Deploy {
        /// Manifest file
        #[arg(short, long, default_value = "manifest.json")]
        manifest: PathBuf,

        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Stop every running app
    Stop,

    /// Remove every container and the environment's state
    Remove,

    /// Show the recorded state of every app
    Inspect {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print version information
    Version,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Commands::Version = cli.command {
        match serde_json::to_string_pretty(&version_info()) {
            Ok(json) => println!("{}", json),
            Err(_) => println!("{}", version_info()),
        }
        return ExitCode::SUCCESS;
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("{} {:#}", "✗".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    // Retrieve the settings file, then apply command line overrides
    let mut settings = Settings::load(&File::new(&cli.settings))
        .await
        .with_context(|| format!("Unable to read settings file {}", cli.settings.display()))?;
    if let Some(env) = cli.env {
        settings.env = env;
    }
    if !cli.profiles.is_empty() {
        settings.profiles = cli.profiles;
    }
    if let Some(state_dir) = cli.state_dir {
        settings.state_dir = state_dir;
    }
    if let Some(level) = cli.log_level {
        settings.log_level = level;
    }
    settings.validate()?;

    // Initialize logging
    let log_options = LogOptions {
        log_level: settings.log_level,
        json_format: settings.json_logs,
    };
    if let Err(e) = init_logging(&log_options) {
        eprintln!("Failed to initialize logging: {e}");
    }

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            await_shutdown_signal().await;
            cancel.cancel();
        }
    });

    let ctx = Context::new(settings, cancel);
    info!(
        env = %ctx.settings.env,
        profiles = ?ctx.settings.profiles,
        "Using state in {}",
        ctx.layout.env_dir().path().display()
    );

    match cli.command {
        Commands::Deploy { manifest, json } => {
            let report = commands::deploy(&ctx, &File::new(manifest))
                .await
                .context("Deployment failed")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", commands::render_report(&report));
            }
        }
        Commands::Stop => {
            let stopped = commands::stop(&ctx).await?;
            for name in stopped {
                println!("{} stopped {}", "✓".green().bold(), name.bold());
            }
        }
        Commands::Remove => {
            let removed = commands::remove(&ctx).await?;
            println!(
                "{} removed {} containers of environment {}",
                "✓".green().bold(),
                removed.len(),
                ctx.settings.env.bold()
            );
        }
        Commands::Inspect { json } => {
            let rows = commands::inspect(&ctx).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                print!("{}", commands::render_summary(&rows));
            }
        }
        Commands::Version => {}
    }

    Ok(())
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!("Unable to listen for SIGTERM: {}", e);
                match tokio::signal::ctrl_c().await {
                    Ok(()) => info!("Ctrl+C received, cancelling..."),
                    Err(_) => std::future::pending::<()>().await,
                }
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, cancelling...");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, cancelling...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Ctrl+C received, cancelling..."),
            Err(e) => {
                warn!("Unable to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        }
    }
}
