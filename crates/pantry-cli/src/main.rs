//! Pantry CLI - a command-line client for the pantry recipe service.
//!
//! Signs in and out of the backend, shows the stored session, and issues
//! authenticated requests. The session is persisted between runs and renewed
//! in the background while a command is running.

mod commands;

use std::io;
use std::path::PathBuf;

use anyhow::Result;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pantry_core::Config;

const USAGE: &str = "\
Usage: pantry <command> [args]

Commands:
  login [email]      Sign in and store the session
  register [email]   Create an account and sign in
  logout             Sign out and clear the stored session
  status             Show the stored session
  get <path>         GET a backend path with the session's token
  watch              Keep the session alive, logging renewals";

/// Initialize the tracing subscriber for logging.
///
/// Logs go to stderr; with `PANTRY_LOG_DIR` set they are also written to a
/// daily log file there. The returned guard must live until exit.
fn init_tracing() -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match std::env::var_os("PANTRY_LOG_DIR").map(PathBuf::from) {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "pantry.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let _log_guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        eprintln!("{}", USAGE);
        std::process::exit(2);
    };

    // A missing backend URL is a startup error, reported before anything runs
    let config = Config::from_env()?;
    info!(backend = %config.backend_url, store = ?config.store, "Pantry CLI starting");

    match command.as_str() {
        "login" => commands::login(&config, args.get(1).cloned(), false).await,
        "register" => commands::login(&config, args.get(1).cloned(), true).await,
        "logout" => commands::logout(&config).await,
        "status" => commands::status(&config).await,
        "get" => match args.get(1) {
            Some(path) => commands::get(&config, path).await,
            None => {
                eprintln!("{}", USAGE);
                std::process::exit(2);
            }
        },
        "watch" => commands::watch(&config).await,
        "help" | "--help" | "-h" => {
            println!("{}", USAGE);
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}\n\n{}", other, USAGE);
            std::process::exit(2);
        }
    }
}
