//! Terminal host for the keyflow session lifecycle.
//!
//! Provider settings come from `KEYFLOW_*` environment variables; the
//! authorization redirect is captured on a loopback listener, so the
//! registered client must allow `http://127.0.0.1` redirect URIs.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use keyflow_core::browser::LoopbackRedirectListener;
use keyflow_core::manager::{LoginOptions, LoginProgress, Prompt};
use keyflow_core::{
    FileSessionStore, ProviderConfig, Session, SessionManager, SessionStatus, SystemBrowser,
};

#[derive(Parser)]
#[command(name = "keyflow", about = "OIDC session lifecycle from the terminal", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Log in through the system browser and persist the session.
    Login {
        /// Additional scopes beyond the configured defaults.
        #[arg(long = "scope")]
        scopes: Vec<String>,
        /// Requested authentication context class references.
        #[arg(long = "acr")]
        acr_values: Vec<String>,
        /// Prompt behaviour: none, login, consent, or select_account.
        #[arg(long)]
        prompt: Option<String>,
    },
    /// Show the persisted session and its current status.
    Status,
    /// Force a token refresh of the persisted session.
    Refresh,
    /// End the session at the provider and locally.
    Logout,
    /// Delete all local session data without contacting the provider.
    Reset,
}

/// Startup waits this long for the refresh before falling back to the stored
/// session in an offline state.
const OFFLINE_FALLBACK: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Login {
            scopes,
            acr_values,
            prompt,
        } => login(scopes, acr_values, prompt).await,
        Command::Status => status().await,
        Command::Refresh => refresh().await,
        Command::Logout => logout().await,
        Command::Reset => reset(),
    }
}

fn build_manager(config: ProviderConfig) -> Result<SessionManager<FileSessionStore>> {
    let store = FileSessionStore::with_default_locator(config.storage_namespace.clone())
        .context("failed to open session storage")?;
    SessionManager::new(config, store).context("failed to construct session manager")
}

fn load_config() -> Result<ProviderConfig> {
    ProviderConfig::from_env().context("incomplete provider configuration")
}

fn parse_prompt(raw: &str) -> Result<Prompt> {
    match raw {
        "none" => Ok(Prompt::None),
        "login" => Ok(Prompt::Login),
        "consent" => Ok(Prompt::Consent),
        "select_account" => Ok(Prompt::SelectAccount),
        other => anyhow::bail!("unknown prompt value '{other}'"),
    }
}

async fn login(scopes: Vec<String>, acr_values: Vec<String>, prompt: Option<String>) -> Result<()> {
    let mut config = load_config()?;

    // Capture the authorization redirect on a loopback listener instead of
    // the configured deep link; the post-logout URI stays as configured.
    let listener = LoopbackRedirectListener::bind()
        .await
        .context("failed to bind loopback listener")?;
    config.redirect_uri = listener
        .redirect_uri("/callback")
        .context("failed to build loopback redirect URI")?;

    let manager = build_manager(config)?;
    manager.initialize(Some(OFFLINE_FALLBACK)).await.ok();

    let options = LoginOptions {
        extra_scopes: scopes,
        acr_values,
        prompt: prompt.as_deref().map(parse_prompt).transpose()?,
    };

    let login_task = {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager
                .present_login(Arc::new(SystemBrowser), options, |step| {
                    if step == LoginProgress::BrowserWillAppear {
                        eprintln!("Complete the login in your browser...");
                    }
                })
                .await
        })
    };

    // The browser lands on the loopback listener; feed the URL back in.
    let redirect = listener
        .accept_redirect()
        .await
        .context("failed to receive authorization redirect")?;
    if !manager.resume_redirect(&redirect) {
        anyhow::bail!("redirect did not match the pending login");
    }

    let session = login_task
        .await
        .context("login task failed")?
        .context("login failed")?;
    println!("Logged in.");
    print_session(&session);
    Ok(())
}

async fn status() -> Result<()> {
    let manager = build_manager(load_config()?)?;
    match manager.initialize(Some(OFFLINE_FALLBACK)).await {
        Ok(Some(session)) => print_session(&session),
        Ok(None) => println!("No session."),
        Err(err) => anyhow::bail!("session could not be resolved: {err}"),
    }
    Ok(())
}

async fn refresh() -> Result<()> {
    let manager = build_manager(load_config()?)?;
    manager.initialize(Some(OFFLINE_FALLBACK)).await.ok();
    let session = manager
        .refresh_session()
        .await
        .context("refresh failed")?;
    println!("Session refreshed.");
    print_session(&session);
    Ok(())
}

async fn logout() -> Result<()> {
    let manager = build_manager(load_config()?)?;
    manager.initialize(Some(OFFLINE_FALLBACK)).await.ok();
    manager
        .logout(Arc::new(SystemBrowser))
        .await
        .context("logout failed")?;
    println!("Logged out.");
    Ok(())
}

fn reset() -> Result<()> {
    let manager = build_manager(load_config()?)?;
    manager.delete_all_data();
    println!("Local session data deleted.");
    Ok(())
}

fn print_session(session: &Session) {
    let status = match session.status() {
        SessionStatus::Valid => "valid",
        SessionStatus::Expired => "expired",
        SessionStatus::NoSession => "unusable",
    };
    let connectivity = if session.online { "online" } else { "offline" };
    println!("Status: {status} ({connectivity})");
    if let Some(claims) = &session.claims {
        println!("Subject: {}", claims.sub);
        if let Some(name) = &claims.name {
            println!("Name: {name}");
        }
        println!("Expires: {}", claims.exp);
        if let Ok(json) = serde_json::to_string_pretty(claims) {
            println!("Claims: {json}");
        }
    }
}
