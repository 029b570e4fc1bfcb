//! teams-meeting - sign in to Microsoft Graph for creating Teams meetings
//!
//! Manages the application settings and the cached OAuth tokens used to create
//! online meetings or calendar events with a Teams meeting attached.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use teams_meeting_auth::auth::scopes::requested_scopes;
use teams_meeting_auth::auth::{
    validate_settings, AuthError, LoopbackBrowserFlow, ReqwestTransport, TokenManager, UnavailableFlow,
};
use teams_meeting_auth::config::{FileSecretStore, FileSettingsProvider};
use teams_meeting_auth::{AccountMode, MeetingMode};

#[derive(Parser)]
#[command(name = "teams-meeting")]
#[command(about = "Sign in to Microsoft Graph for creating Teams meetings", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file (tokens are kept next to it)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Change settings; options that are not given keep their value
    Configure {
        /// Application (client) ID of the app registration
        #[arg(long)]
        client_id: Option<String>,

        /// Tenant GUID, verified domain, or organizations/common/consumers
        #[arg(long)]
        tenant: Option<String>,

        /// Login endpoint, e.g. https://login.microsoftonline.com
        #[arg(long)]
        authority_host: Option<String>,

        /// Space separated scopes; an empty string restores the defaults
        #[arg(long)]
        scopes: Option<String>,

        /// work or personal
        #[arg(long)]
        account_mode: Option<AccountMode>,

        /// direct (online meeting) or calendar (event with Teams meeting)
        #[arg(long)]
        meeting_mode: Option<MeetingMode>,

        /// Loopback redirect URI registered for the app
        #[arg(long)]
        redirect_uri: Option<String>,

        /// Log settings warnings and debug output
        #[arg(long)]
        debug: Option<bool>,

        /// Accept an authority host outside the known Microsoft clouds without warning
        #[arg(long)]
        allow_custom_authority_host: Option<bool>,
    },

    /// Check the settings without signing in
    Validate,

    /// Sign in through the browser
    Login {
        /// Discard cached tokens and sign in again
        #[arg(short, long)]
        force: bool,
    },

    /// Print an access token for the configured scopes
    Token {
        /// Never open a browser; fail if no cached or refreshable token exists
        #[arg(short, long)]
        silent: bool,
    },

    /// Show current authentication status
    Status,

    /// Log out and clear cached tokens
    Logout,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (settings, store) = match &cli.config {
        Some(path) => (
            FileSettingsProvider::new(path),
            FileSecretStore::new(path.with_file_name("tokens.toml")),
        ),
        None => (
            FileSettingsProvider::default_location()?,
            FileSecretStore::default_location()?,
        ),
    };

    // Initialize logging
    let debug_enabled = settings.load().map(|s| s.debug_enabled).unwrap_or(false);
    let filter = if cli.verbose || debug_enabled { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let result = run(cli.command, settings, store).await;
    if let Err(err) = &result {
        if let Some(AuthError::NotConfigured) = err.downcast_ref::<AuthError>() {
            eprintln!("Run 'teams-meeting configure --client-id <APPLICATION_ID>' first.");
        }
    }
    result
}

async fn run(command: Commands, settings: FileSettingsProvider, store: FileSecretStore) -> Result<()> {
    match command {
        Commands::Configure {
            client_id,
            tenant,
            authority_host,
            scopes,
            account_mode,
            meeting_mode,
            redirect_uri,
            debug,
            allow_custom_authority_host,
        } => {
            let mut current = settings.load().context("Failed to load settings")?;
            if let Some(mode) = account_mode {
                current.account_mode = mode;
                // Follow the account kind unless a tenant is given explicitly
                if tenant.is_none() {
                    current.tenant = mode.default_tenant().to_string();
                }
            }
            if let Some(value) = client_id {
                current.client_id = value.trim().to_string();
            }
            if let Some(value) = tenant {
                current.tenant = value;
            }
            if let Some(value) = authority_host {
                current.authority_host = value;
            }
            if let Some(value) = scopes {
                current.scopes = value;
            }
            if let Some(mode) = meeting_mode {
                current.meeting_mode = mode;
            }
            if let Some(value) = redirect_uri {
                current.redirect_uri = value;
            }
            if let Some(value) = debug {
                current.debug_enabled = value;
            }
            if let Some(value) = allow_custom_authority_host {
                current.allow_custom_authority_host = value;
            }

            settings.save(&current).context("Failed to save settings")?;
            println!("Settings saved to {}", settings.path().display());

            let report = validate_settings(&current);
            for issue in &report.errors {
                eprintln!("Warning: {}", issue);
            }
        }
        Commands::Validate => {
            let current = settings.load().context("Failed to load settings")?;
            let report = validate_settings(&current);

            if !current.is_configured() {
                println!("Client ID:   not configured");
            }
            for warning in &report.warnings {
                println!("Warning:     {}", warning);
            }
            if !report.is_ok() {
                for issue in &report.errors {
                    println!("Error:       {}", issue);
                }
                bail!(AuthError::InvalidConfiguration(report.errors));
            }

            println!("Authority:   {}", report.normalized.authority());
            println!("Scopes:      {}", requested_scopes(&current));
            println!("Settings OK.");
        }
        Commands::Login { force } => {
            let manager = token_manager(settings, store)?;
            if force {
                manager.logout().await?;
            }

            tracing::info!("Starting authentication flow...");
            let identity = manager.test_connection().await?;
            if identity.email.is_empty() {
                println!("Login successful.");
            } else {
                println!("Login successful: {} ({} account)", identity.email, identity.account_type);
            }
            if let Some(note) = manager.status().await?.account_mode_mismatch() {
                eprintln!("Warning: {}", note);
            }
        }
        Commands::Token { silent } => {
            let manager = token_manager(settings, store)?;
            let token = manager.get_access_token(!silent).await?;
            println!("{}", token);
        }
        Commands::Status => {
            let manager = token_manager(settings, store)?;
            let status = manager.status().await?;

            println!("Configured:  {}", if status.configured { "yes" } else { "no" });
            println!("Account:     {} mode", status.account_mode);
            match status.token_expires_at {
                Some(expires_at) if expires_at > Utc::now().timestamp_millis() => {
                    println!("Access tok:  valid");
                    if let Some(at) = Utc.timestamp_millis_opt(expires_at).single() {
                        println!("  expires_at: {}", at.to_rfc3339());
                    }
                }
                Some(_) => println!("Access tok:  expired"),
                None => println!("Access tok:  none"),
            }
            println!(
                "Refresh tok: {}",
                if status.has_refresh_token { "present" } else { "none" }
            );
            if !status.token_scopes.is_empty() {
                println!("Scopes:      {}", status.token_scopes);
            }
            if let Some(identity) = &status.identity {
                println!("Signed in:   {} ({})", identity.email, identity.account_type);
            }
            if let Some(note) = status.account_mode_mismatch() {
                println!("Note:        {}", note);
            }

            if !status.signed_in() {
                println!("\nRun 'teams-meeting login' to authenticate.");
            }
        }
        Commands::Logout => {
            tracing::info!("Logging out...");
            token_manager(settings, store)?.logout().await?;
            println!("Logged out.");
        }
    }

    Ok(())
}

/// Manager over the file stores, signing in through the system browser.
fn token_manager(settings: FileSettingsProvider, store: FileSecretStore) -> Result<TokenManager> {
    let redirect_uri = settings.load().map(|s| s.redirect_uri).unwrap_or_default();
    let transport = ReqwestTransport::new().context("Failed to build HTTP client")?;
    let manager = TokenManager::new(Arc::new(settings), Arc::new(store), Arc::new(transport));

    Ok(match LoopbackBrowserFlow::new(&redirect_uri) {
        Ok(flow) => {
            let flow = Arc::new(flow);
            manager.with_interactive_flow(flow.clone(), flow)
        }
        Err(e) => {
            tracing::debug!("Browser sign-in unavailable: {}", e);
            let unavailable = Arc::new(UnavailableFlow::new(e.to_string()));
            manager.with_interactive_flow(unavailable.clone(), unavailable)
        }
    })
}
