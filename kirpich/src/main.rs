//! `kirpich`: line-mode client for the Kirpich sync engine.
//!
//! Logs in, keeps chats in sync over the realtime connection, prints sync
//! events, and reads commands from stdin. Configuration via CLI flags,
//! environment variables, or config file (`~/.config/kirpich/config.toml`).
//!
//! ```bash
//! cargo run --bin kirpich -- --endpoint ws://127.0.0.1:9100/ws \
//!     --api-url http://127.0.0.1:9100 --email me@kirpich.app --password secret
//! ```

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;

use kirpich::app::{App, parse_command};
use kirpich::backend::Backend;
use kirpich::backend::http::HttpBackend;
use kirpich::config::{CliArgs, ClientConfig};
use kirpich::engine::SyncEngine;
use kirpich::event::SyncEvent;
use kirpich::transport::Connector;
use kirpich::transport::ws::WsConnector;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(2);
        }
    };

    // Logs go to a file; stdout carries the transcript.
    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());

    let Some(target) = config.account_target() else {
        eprintln!("error: --endpoint, --api-url, --email and --password are required");
        return ExitCode::from(2);
    };

    let backend = match HttpBackend::new(&target.api_url, config.request_timeout) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(2);
        }
    };

    tracing::info!(endpoint = %target.endpoint, "kirpich starting");
    let (engine, mut events) = SyncEngine::new(WsConnector::new(), backend, &target.endpoint, &config);

    if let Err(e) = engine.login(&target.email, &target.password).await {
        eprintln!("login failed: {e}");
        return ExitCode::FAILURE;
    }
    if let Err(e) = engine.start() {
        eprintln!("cannot start: {e}");
        return ExitCode::FAILURE;
    }

    let code = run(&engine, &mut events).await;
    tracing::info!("kirpich exiting");
    code
}

/// Initialize file-based logging.
///
/// Returns a [`WorkerGuard`] that must be held until shutdown so buffered
/// log lines are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("kirpich.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_env("KIRPICH_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

/// Interleaves stdin commands with engine events until logout, session
/// expiry, or end of input.
async fn run<C: Connector, B: Backend>(
    engine: &SyncEngine<C, B>,
    events: &mut mpsc::Receiver<SyncEvent>,
) -> ExitCode {
    let mut app = App::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let command = match parse_command(&line) {
                        Ok(Some(command)) => command,
                        Ok(None) => continue,
                        Err(e) => {
                            println!("! {e}");
                            continue;
                        }
                    };
                    match app.execute(engine, command).await {
                        Ok(outcome) => {
                            for line in &outcome.lines {
                                println!("{line}");
                            }
                            if outcome.quit {
                                return ExitCode::SUCCESS;
                            }
                        }
                        Err(e) => println!("! {e}"),
                    }
                }
                Ok(None) => {
                    engine.disconnect().await;
                    return ExitCode::SUCCESS;
                }
                Err(e) => {
                    tracing::error!(error = %e, "stdin read failed");
                    engine.disconnect().await;
                    return ExitCode::FAILURE;
                }
            },
            Some(event) = events.recv() => {
                if let Some(line) = app.observe(&event) {
                    println!("{line}");
                }
                if matches!(event, SyncEvent::AuthExpired { .. }) {
                    println!("* log in again to continue");
                    engine.logout().await;
                    return ExitCode::FAILURE;
                }
            }
        }
    }
}
