//! Planboard CLI - sign in to a Planboard workspace and inspect the session.
//!
//! Each invocation restores the persisted session, runs one command and
//! exits. Logs go to stderr (and optionally a file); results go to stdout.

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use planboard_core::api::{ApiClient, AuthorizedClient, Registration};
use planboard_core::auth::SessionManager;
use planboard_core::config::Config;
use planboard_core::models::Role;
use planboard_core::nav::Navigator;

const USAGE: &str = "\
Usage: planboard <command>

Commands:
  login [username]   Sign in (prompts for the password)
  logout             Sign out and clear the stored session
  register           Create an account
  whoami             Print the signed-in identity
  status             Print session state and expiry
  refresh            Renew the session credential
  visit <path>       Resolve a dashboard route through the navigation guard
  request <path>     GET an API path with the session attached";

/// Initialize the tracing subscriber for logging.
///
/// `RUST_LOG` controls the level (default `warn`). When the config names a
/// log file, a second non-ANSI layer writes there; the returned guard must
/// live until exit so buffered lines are flushed.
fn init_tracing(config: &Config) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match &config.log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .map(|dir| dir.to_path_buf())
                .unwrap_or_else(|| ".".into());
            let name = path
                .file_name()
                .map(|name| name.to_os_string())
                .unwrap_or_else(|| "planboard.log".into());
            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
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

    let mut config = Config::load()?;
    let _log_guard = init_tracing(&config);
    config.apply_env();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        println!("{}", USAGE);
        return Ok(());
    };

    config.require_restorable_session()?;
    let api = ApiClient::new(&config)?;
    let session = Arc::new(SessionManager::with_api(&config, api.clone())?);
    session.initialize();
    info!(command = %command, "planboard starting");

    match command.as_str() {
        "login" => login(&config, &session, args.get(1).cloned()).await,
        "logout" => {
            session.logout().await;
            println!("Signed out.");
            Ok(())
        }
        "register" => register(&session).await,
        "whoami" => whoami(&session),
        "status" => status(&session),
        "refresh" => {
            let claims = session.refresh().await?;
            println!("Session refreshed for {}.", claims.username);
            print_expiry(&session);
            Ok(())
        }
        "visit" => {
            let path = args.get(1).context("visit needs a path")?;
            let mut navigator = Navigator::from_config(&config, session.clone());
            let navigation = navigator.navigate(path).await?;
            if let Some(from) = &navigation.redirected_from {
                println!("{} -> {}", from, navigation.path);
            } else {
                println!("{}", navigation.path);
            }
            println!("Title: {}", navigation.title);
            Ok(())
        }
        "request" => {
            let path = args.get(1).context("request needs a path")?;
            let client = AuthorizedClient::new(api, session.clone());
            let body: serde_json::Value = client.get(path).await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
            Ok(())
        }
        "help" | "-h" | "--help" => {
            println!("{}", USAGE);
            Ok(())
        }
        other => bail!("Unknown command: {}\n\n{}", other, USAGE),
    }
}

async fn login(config: &Config, session: &SessionManager, username: Option<String>) -> Result<()> {
    let username = match username.or_else(|| config.last_username.clone()) {
        Some(name) => {
            let entered = prompt(&format!("Username [{}]: ", name))?;
            if entered.is_empty() {
                name
            } else {
                entered
            }
        }
        None => prompt("Username: ")?,
    };
    let password = rpassword::prompt_password("Password: ")?;

    println!("\nAuthenticating...");
    let claims = session.login(&username, &password).await?;

    if let Err(e) = Config::remember_username(&claims.username) {
        tracing::warn!(error = %e, "Failed to remember username");
    }

    println!(
        "Signed in as {} ({}, {}).",
        claims.username, claims.company_name, claims.role
    );
    Ok(())
}

async fn register(session: &SessionManager) -> Result<()> {
    let username = prompt("Username (email): ")?;
    let company_name = prompt("Company: ")?;
    let role = prompt("Role [member]: ")?;
    let password = rpassword::prompt_password("Password: ")?;

    let registration = Registration {
        username,
        password,
        company_name,
        role: if role.is_empty() {
            Role::Member
        } else {
            Role::from(role)
        },
    };
    let user = session.register(&registration).await?;
    println!(
        "Account created for {} at {}. You can now sign in.",
        user.username, user.company_name
    );
    Ok(())
}

fn whoami(session: &SessionManager) -> Result<()> {
    session.check_expiry();
    let view = session.identity().current();
    match view.claims() {
        Some(claims) => {
            println!("{}", claims.username);
            println!("Company: {}", claims.company_name);
            println!("Role:    {}", claims.role);
            if view.is_admin() {
                println!("Access:  admin");
            } else if view.is_manager() {
                println!("Access:  manager");
            }
            Ok(())
        }
        None => bail!("Not signed in"),
    }
}

fn status(session: &SessionManager) -> Result<()> {
    if !session.check_expiry() {
        println!("Signed out ({:?} mode).", session.mode());
        return Ok(());
    }
    if let Some(claims) = session.current_identity() {
        println!(
            "Signed in as {} ({:?} mode).",
            claims.username,
            session.mode()
        );
    }
    print_expiry(session);
    Ok(())
}

fn print_expiry(session: &SessionManager) {
    match session.time_until_expiry() {
        Some(remaining) => {
            println!("Expires in {} min.", remaining.num_minutes());
            if session.needs_refresh() {
                println!("Session expires soon; run `planboard refresh`.");
            }
        }
        None => println!("No expiry recorded."),
    }
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}
