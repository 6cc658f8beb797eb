//! CLI subcommand handlers.

use crate::AuthAction;
use crate::Commands;
use crate::ConfigAction;
use dialoguer::Password;
use mutalab_core::config::{self, MutalabConfig};
use mutalab_core::credentials::{
    EnvTokenProvider, FallbackTokenProvider, KeyringTokenProvider, StaticToken, TokenProvider,
    TokenStore,
};
use mutalab_core::error::ConfigError;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Flags shared by every subcommand.
#[derive(Debug, Clone)]
pub struct GlobalOptions {
    pub workspace: PathBuf,
    pub config_file: Option<PathBuf>,
    pub base_url: Option<String>,
    pub quiet: bool,
}

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, options: &GlobalOptions) -> anyhow::Result<()> {
    match command {
        Commands::Run(args) => {
            let config = load(options)?;
            crate::run::run_experiment(args, config, options.quiet).await
        }
        Commands::Auth { action } => handle_auth(action, options),
        Commands::Config { action } => handle_config(action, options),
    }
}

/// Load configuration and apply command-line overrides.
pub fn load(options: &GlobalOptions) -> mutalab_core::Result<MutalabConfig> {
    let mut config = match &options.config_file {
        Some(path) => config::load_config_file(path)?,
        None => config::load_config(Some(&options.workspace), None)?,
    };

    if let Some(base_url) = &options.base_url {
        config.service.base_url = base_url.clone();
        config.validate().map_err(|e| ConfigError::Invalid {
            message: format!("--base-url: {}", e),
        })?;
    }
    Ok(config)
}

/// Token lookup order: inline config token, environment variable, OS keyring.
pub fn token_provider(config: &MutalabConfig) -> Arc<dyn TokenProvider> {
    let mut providers: Vec<Box<dyn TokenProvider>> = Vec::new();
    if let Some(token) = config
        .auth
        .token
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
    {
        providers.push(Box::new(StaticToken::new(token)));
    }
    providers.push(Box::new(EnvTokenProvider::new(
        config.auth.token_env.clone(),
    )));
    providers.push(Box::new(KeyringTokenProvider::new(&config.auth.profile)));
    Arc::new(FallbackTokenProvider::new(providers))
}

fn handle_auth(action: AuthAction, options: &GlobalOptions) -> anyhow::Result<()> {
    let config = load(options)?;
    let store = KeyringTokenProvider::new(&config.auth.profile);

    match action {
        AuthAction::Login { token } => {
            let token = match token {
                Some(t) => t,
                None => Password::new()
                    .with_prompt(format!(
                        "Token for {} (profile '{}')",
                        config.service.base_url, config.auth.profile
                    ))
                    .interact()?,
            };
            let token = token.trim();
            if token.is_empty() {
                anyhow::bail!("Token cannot be empty");
            }
            store.store_token(token)?;
            info!(profile = %config.auth.profile, "Token stored in keyring");
            println!(
                "Token stored in the OS keyring as {}.",
                KeyringTokenProvider::account_name(&config.auth.profile)
            );
            Ok(())
        }
        AuthAction::Logout => {
            if !store.has_token() {
                println!(
                    "No token stored for profile '{}'.",
                    config.auth.profile
                );
                return Ok(());
            }
            store.delete_token()?;
            println!("Token removed for profile '{}'.", config.auth.profile);
            Ok(())
        }
        AuthAction::Status => {
            let inline = config
                .auth
                .token
                .as_deref()
                .is_some_and(|t| !t.trim().is_empty());
            let env = EnvTokenProvider::new(config.auth.token_env.clone())
                .token()
                .is_ok();
            let keyring = store.has_token();

            println!("Service: {}", config.service.base_url);
            println!("Profile: {}", config.auth.profile);
            println!("  config token:  {}", yes_no(inline));
            println!("  ${}: {}", config.auth.token_env, yes_no(env));
            println!("  keyring:       {}", yes_no(keyring));
            println!();
            match active_source(inline, env, keyring) {
                Some(source) => println!("Requests will use the {} token.", source),
                None => println!("No token available. Run `mutalab auth login`."),
            }
            Ok(())
        }
    }
}

fn yes_no(present: bool) -> &'static str {
    if present { "set" } else { "not set" }
}

/// Which source `token_provider` would pick, in lookup order.
fn active_source(inline: bool, env: bool, keyring: bool) -> Option<&'static str> {
    if inline {
        Some("config")
    } else if env {
        Some("environment")
    } else if keyring {
        Some("keyring")
    } else {
        None
    }
}

fn handle_config(action: ConfigAction, options: &GlobalOptions) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            let config = load(options)?;
            println!("{}", config.to_toml_string()?);
            Ok(())
        }
        ConfigAction::Path => {
            let mut paths = Vec::new();
            if let Some(explicit) = &options.config_file {
                paths.push(("explicit", explicit.clone()));
            } else {
                if let Some(user) = config::user_config_path() {
                    paths.push(("user", user));
                }
                paths.push((
                    "workspace",
                    config::workspace_config_path(&options.workspace),
                ));
            }
            for (label, path) in paths {
                let state = if path.exists() { "" } else { " (missing)" };
                println!("{:<10} {}{}", label, path.display(), state);
            }
            Ok(())
        }
    }
}
