//! Command implementations for the pantry CLI.

use std::io::{self, Write};

use anyhow::{Context, Result};
use chrono::{Local, Utc};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use pantry_core::api::HttpRequest;
use pantry_core::auth::{login_failure_message, AuthApi, SessionEvent, SessionManager};
use pantry_core::config::Preferences;
use pantry_core::{Config, RequestClient, SessionError, SessionState};

/// Build a session manager over the configured store and restore any
/// persisted session.
async fn open_session(config: &Config) -> Result<SessionManager> {
    let store = config.open_store()?;
    let client = RequestClient::with_reqwest()?;
    let api = AuthApi::new(config.backend_url.clone(), client);
    Ok(SessionManager::start(api, store, config.session.clone()).await)
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

fn prompt_email(last_email: Option<&str>) -> Result<String> {
    match last_email {
        Some(last) => {
            let input = prompt(&format!("Email [{}]: ", last))?;
            Ok(if input.is_empty() {
                last.to_string()
            } else {
                input
            })
        }
        None => prompt("Email: "),
    }
}

/// Sign in (or register) and persist the session.
pub async fn login(config: &Config, email: Option<String>, register: bool) -> Result<()> {
    let mut prefs = Preferences::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load preferences");
        Preferences::default()
    });

    let manager = open_session(config).await?;
    if !register {
        if let Some(current) = manager.email().filter(|_| manager.is_logged_in()) {
            println!("Already logged in as {}", current);
            manager.shutdown();
            return Ok(());
        }
    }

    let email = match email {
        Some(email) => email,
        None => prompt_email(prefs.last_email.as_deref())?,
    };
    let password = rpassword::prompt_password("Password: ")?;

    let result = if register {
        manager.register(&email, &password).await
    } else {
        manager.sign_in(&email, &password).await
    };
    manager.shutdown();

    match result {
        Ok(()) => {
            prefs.last_email = Some(email.trim().to_string());
            if let Err(e) = prefs.save() {
                warn!(error = %e, "Failed to save preferences");
            }
            println!("{}", if register { "Account created." } else { "Login successful." });
            Ok(())
        }
        Err(SessionError::Request(e)) => {
            debug!(status = ?manager.api().client().last_status(), "Login rejected");
            anyhow::bail!(login_failure_message(&e))
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn logout(config: &Config) -> Result<()> {
    let manager = open_session(config).await?;
    let was_logged_in = manager.is_logged_in();
    manager.sign_out().await;
    manager.shutdown();

    if was_logged_in {
        println!("Logged out.");
    } else {
        println!("No active session.");
    }
    Ok(())
}

pub async fn status(config: &Config) -> Result<()> {
    let manager = open_session(config).await?;
    let next_refresh = manager.next_refresh_at();
    manager.shutdown();

    match manager.state() {
        SessionState::Anonymous => println!("Not logged in."),
        SessionState::Authenticated(session) | SessionState::Refreshing(session) => {
            println!("Logged in as {}", session.email);
            if let Some(expiry) = session.access_token_expiry {
                let minutes = (expiry - Utc::now()).num_minutes().max(0);
                println!(
                    "Access token expires {} ({} min)",
                    expiry.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
                    minutes
                );
            }
            if let Some(due) = next_refresh {
                println!(
                    "Next renewal at {}",
                    due.with_timezone(&Local).format("%H:%M:%S")
                );
            }
        }
    }
    Ok(())
}

/// GET a backend path and print the response body.
pub async fn get(config: &Config, path: &str) -> Result<()> {
    let manager = open_session(config).await?;
    let client = RequestClient::with_reqwest()?;
    let url = manager.api().url(path);

    let result = manager.send_authorized(&client, HttpRequest::get(url)).await;
    manager.shutdown();

    let body = result.with_context(|| format!("GET {} failed", path))?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

/// Run until the session ends, printing renewals as they happen.
pub async fn watch(config: &Config) -> Result<()> {
    let manager = open_session(config).await?;
    if !manager.is_logged_in() {
        anyhow::bail!("Not logged in");
    }

    let mut events = manager.events();
    println!(
        "Watching session for {}",
        manager.email().unwrap_or_default()
    );
    if let Some(due) = manager.next_refresh_at() {
        println!("Next renewal at {}", due.with_timezone(&Local).format("%H:%M:%S"));
    }

    loop {
        match events.recv().await {
            Ok(SessionEvent::Refreshed) => {
                let next = manager
                    .next_refresh_at()
                    .map(|due| due.with_timezone(&Local).format("%H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!("Access token renewed; next renewal at {}", next);
            }
            Ok(SessionEvent::LoggedOut { reason }) => {
                println!("Session ended ({:?})", reason);
                return Ok(());
            }
            Ok(SessionEvent::LoggedIn { email }) => println!("Logged in as {}", email),
            Err(RecvError::Lagged(skipped)) => {
                debug!(skipped, "Missed session events");
            }
            Err(RecvError::Closed) => return Ok(()),
        }
    }
}
