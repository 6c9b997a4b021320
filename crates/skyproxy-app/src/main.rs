//! SkyProxy - switch the system proxy between saved profiles.
//!
//! Each invocation opens the profile database, repairs anything damaged,
//! runs one command and prints a status line.

mod cli;
mod commands;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use directories::ProjectDirs;
use skyproxy_agent::AgentConfig;
use skyproxy_storage::Database;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cli::{Args, Command};
use crate::commands::{run_rules, App};

/// Get the logs directory path.
fn logs_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "skyproxy", "skyproxy").map(|dirs| dirs.data_dir().join("logs"))
}

/// Initialize logging with file rotation.
fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = if args.debug { "debug" } else { &args.log_level };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("skyproxy={},warn", log_level)));

    if let Some(log_dir) = logs_dir() {
        if std::fs::create_dir_all(&log_dir).is_ok() {
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(5)
                .filename_prefix("skyproxy")
                .filename_suffix("log")
                .build(&log_dir)
                .ok();

            if let Some(appender) = file_appender {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);

                // Console output would interleave with command output
                if args.debug {
                    tracing_subscriber::registry()
                        .with(env_filter)
                        .with(fmt::layer().with_writer(std::io::stderr))
                        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                        .init();
                } else {
                    tracing_subscriber::registry()
                        .with(env_filter)
                        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                        .init();
                }

                tracing::debug!("Logging to {:?}", log_dir);
                return Some(guard);
            }
        }
    }

    // Fallback: console logging only
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    tracing::warn!("File logging unavailable, using console only");
    None
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Keep guard alive for the duration of the program
    let _log_guard = init_logging(&args);

    tracing::debug!("Args: {:?}", args);

    let output = match args.command {
        Command::Rules(rules) => run_rules(&rules)?,
        command => {
            let db = match &args.db {
                Some(path) => Database::with_path(path),
                None => Database::new(),
            }
            .context("Failed to open database")?;

            let config = AgentConfig::default()
                .with_probe_url(args.probe_url.clone())
                .with_probe_timeout(Duration::from_secs(args.probe_timeout));

            let app = App::new(db, args.sink, &config);
            for warning in app.load().await?.warnings {
                eprintln!("warning: {warning}");
            }

            // Dropping the command on Ctrl-C abandons a running test; its
            // restore finishes on its own task before we exit.
            let mut run = Box::pin(app.run(command));
            let finished = tokio::select! {
                output = &mut run => Some(output),
                _ = tokio::signal::ctrl_c() => None,
            };

            match finished {
                Some(output) => output?,
                None => {
                    drop(run);
                    tracing::info!("Interrupted, waiting for pending proxy changes");
                    app.wait_idle().await;
                    anyhow::bail!("Interrupted");
                }
            }
        }
    };

    println!("{output}");
    Ok(())
}
