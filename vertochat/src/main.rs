//! `VertoChat`: serverless LAN chat in the terminal.
//!
//! Reads commands from stdin and prints chat events as lines. Logs go to a
//! file so they do not mix with the conversation. Configuration via CLI
//! flags, environment variables, or config file
//! (`~/.config/vertochat/config.toml`).
//!
//! ```bash
//! cargo run --bin vertochat -- --nick kenny
//!
//! # Pick the interface and skip private chat
//! VERTOCHAT_INTERFACE=eth0 cargo run --bin vertochat -- --no-private-chat
//! ```

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::non_blocking::WorkerGuard;

use vertochat::chat::{ChatEvent, Controller, ControllerError};
use vertochat::config::settings::{TomlSettingsSaver, default_settings_path, load_settings};
use vertochat::config::{CliArgs, ClientConfig};
use vertochat::console;
use vertochat::transport::Network;
use vertochat::transport::udp::UdpNetwork;

#[tokio::main]
async fn main() -> io::Result<()> {
    let cli = CliArgs::parse();

    let mut config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::default()
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!("vertochat starting");

    let settings_path = config
        .settings_path
        .clone()
        .or_else(default_settings_path)
        .unwrap_or_else(|| PathBuf::from("vertochat-settings.toml"));
    let settings = load_settings(&settings_path);

    // Settings only fill in what the command line and config file left open.
    if config.network.interface.is_none() {
        config.network.interface.clone_from(&settings.network_interface);
    }
    if settings.no_private_chat {
        config.network.private_chat_enabled = false;
    }

    let (chat, mut events) = Controller::new(
        Arc::new(UdpNetwork::new()),
        config.network,
        config.chat,
        settings,
        Arc::new(TomlSettingsSaver::new(settings_path)),
    );
    if let Some(nick) = config.nick.as_deref() {
        report(chat.change_my_nick(nick));
    }

    chat.start();
    if let Err(e) = chat.log_on().await {
        println!("*** Could not log on: {e}");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            Some(event) = events.recv() => print_event(&event),
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !handle_line(&chat, &line).await {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "failed to read stdin");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
        }
    }

    chat.shutdown();
    while let Ok(event) = events.try_recv() {
        print_event(&event);
    }
    tracing::info!("vertochat exiting");
    Ok(())
}

/// Initialize file-based logging.
///
/// Returns a [`WorkerGuard`] that must be held until shutdown to ensure all
/// buffered log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("vertochat.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

fn print_event(event: &ChatEvent) {
    if let Some(line) = console::render(event) {
        println!("{line}");
    }
}

fn report<T>(result: Result<T, ControllerError>) {
    if let Err(e) = result {
        println!("*** {e}");
    }
}

/// Run one line of input. Returns false to quit.
async fn handle_line<N: Network>(chat: &Controller<N>, line: &str) -> bool {
    let command = match console::parse(line) {
        Ok(command) => command,
        Err(e) => {
            println!("*** {e}");
            return true;
        }
    };
    let outcome = console::execute(chat, command).await;
    for line in &outcome.lines {
        println!("{line}");
    }
    !outcome.quit
}
