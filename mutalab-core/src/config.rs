//! Configuration system for Mutalab.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> CLI args.
//! Configuration is loaded from the user config directory (`config.toml`) and/or
//! `.mutalab/config.toml` in the workspace directory.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Environment variable prefix; nested keys are separated by `__`.
pub const ENV_PREFIX: &str = "MUTALAB_";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MutalabConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

/// Where the transformation service lives and how to talk to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Base URL; endpoint paths are appended to it.
    pub base_url: String,
    /// Authorization scheme placed before the token, e.g. `Token` or `Bearer`.
    pub auth_scheme: String,
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            auth_scheme: "Token".to_string(),
            timeout_secs: 120,
            connect_timeout_secs: 10,
        }
    }
}

/// Exponential backoff for transient service failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Where the auth token comes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Keyring profile used by `mutalab auth login`.
    pub profile: String,
    /// Environment variable consulted when the keyring has no token.
    pub token_env: String,
    /// Inline token. Never written back out.
    #[serde(default, skip_serializing)]
    pub token: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            profile: "default".to_string(),
            token_env: "MUTALAB_TOKEN".to_string(),
            token: None,
        }
    }
}

impl MutalabConfig {
    /// Check values figment cannot check on its own.
    pub fn validate(&self) -> Result<(), ConfigError> {
        url::Url::parse(&self.service.base_url).map_err(|e| ConfigError::Invalid {
            message: format!("service.base_url '{}': {}", self.service.base_url, e),
        })?;
        if self.service.auth_scheme.trim().is_empty() {
            return Err(ConfigError::Invalid {
                message: "service.auth_scheme must not be empty".to_string(),
            });
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid {
                message: "retry.backoff_multiplier must be at least 1.0".to_string(),
            });
        }
        Ok(())
    }

    /// Render as TOML, as shown by `mutalab config show`.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })
    }
}

/// User-level config file location, if a home directory can be determined.
pub fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "mutalab", "mutalab")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Workspace-level config file location.
pub fn workspace_config_path(workspace: &Path) -> PathBuf {
    workspace.join(".mutalab").join("config.toml")
}

/// Load configuration from all sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `MUTALAB_`)
/// 3. Workspace-local config (`.mutalab/config.toml`)
/// 4. User config (`~/.config/mutalab/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&MutalabConfig>,
) -> Result<MutalabConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(MutalabConfig::default()));

    if let Some(user_config) = user_config_path()
        && user_config.exists()
    {
        figment = figment.merge(Toml::file(&user_config));
    }

    if let Some(ws) = workspace {
        let ws_config = workspace_config_path(ws);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // MUTALAB_SERVICE__BASE_URL, MUTALAB_RETRY__MAX_RETRIES, etc.
    figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    let config: MutalabConfig = figment.extract()?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from a single explicit file on top of the defaults and environment.
pub fn load_config_file(path: &Path) -> Result<MutalabConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.to_path_buf(),
        });
    }
    let config: MutalabConfig = Figment::from(Serialized::defaults(MutalabConfig::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MutalabConfig::default();
        assert_eq!(config.service.base_url, "http://localhost:8000");
        assert_eq!(config.service.auth_scheme, "Token");
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.auth.token_env, "MUTALAB_TOKEN");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_config_from_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let ws_dir = dir.path().join(".mutalab");
        std::fs::create_dir_all(&ws_dir).unwrap();
        std::fs::write(
            ws_dir.join("config.toml"),
            r#"
[service]
base_url = "https://lab.example.org"
auth_scheme = "Bearer"
timeout_secs = 30
connect_timeout_secs = 5

[retry]
max_retries = 0
initial_backoff_ms = 100
max_backoff_ms = 1000
backoff_multiplier = 2.0
"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(config.service.base_url, "https://lab.example.org");
        assert_eq!(config.service.auth_scheme, "Bearer");
        assert_eq!(config.retry.max_retries, 0);
        // Untouched sections keep their defaults
        assert_eq!(config.auth.profile, "default");
    }

    #[test]
    fn test_load_config_with_overrides() {
        let mut overrides = MutalabConfig::default();
        overrides.service.base_url = "http://10.0.0.5:9000".to_string();
        let config = load_config(None, Some(&overrides)).unwrap();
        assert_eq!(config.service.base_url, "http://10.0.0.5:9000");
    }

    #[test]
    fn test_load_config_file_missing() {
        let err = load_config_file(Path::new("/nonexistent/mutalab.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_load_config_file_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "[auth]\nprofile = \"staging\"\ntoken_env = \"LAB_TOKEN\"\n").unwrap();
        let config = load_config_file(&path).unwrap();
        assert_eq!(config.auth.profile, "staging");
        assert_eq!(config.auth.token_env, "LAB_TOKEN");
        assert_eq!(config.service.timeout_secs, 120);
    }

    #[test]
    fn test_validate_rejects_bad_url() {
        let mut config = MutalabConfig::default();
        config.service.base_url = "not a url".to_string();
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::Invalid { .. }
        ));
    }

    #[test]
    fn test_toml_output_omits_inline_token() {
        let mut config = MutalabConfig::default();
        config.auth.token = Some("secret".to_string());
        let rendered = config.to_toml_string().unwrap();
        assert!(rendered.contains("base_url = \"http://localhost:8000\""));
        assert!(!rendered.contains("secret"));
    }
}
