//! Auth tokens for the transformation service.
//!
//! The HTTP client never reads ambient global state for its token; it is handed a
//! [`TokenProvider`] instead. Implementations:
//! - `StaticToken`: a fixed token, mostly for tests and one-off runs.
//! - `EnvTokenProvider`: reads an environment variable on every request.
//! - `KeyringTokenProvider`: uses the OS-native credential store (macOS Keychain,
//!   Windows Credential Manager, Linux Secret Service).
//! - `InMemoryTokenStore`: in-memory store for testing.
//! - `FallbackTokenProvider`: tries several providers in order.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Keyring service name under which tokens are stored.
pub const KEYRING_SERVICE: &str = "mutalab";

/// Errors from token lookup and storage.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("Credential not found for {service}:{account}")]
    NotFound { service: String, account: String },

    #[error("Environment variable not set: {var}")]
    EnvVarMissing { var: String },

    #[error("Failed to store credential: {message}")]
    StoreFailed { message: String },

    #[error("Failed to delete credential: {message}")]
    DeleteFailed { message: String },

    #[error("Keyring backend not available: {message}")]
    BackendUnavailable { message: String },
}

/// Supplies the token attached to every service request.
pub trait TokenProvider: Send + Sync {
    fn token(&self) -> Result<String, CredentialError>;
}

/// Token storage that can also be written to, used by `mutalab auth`.
pub trait TokenStore: TokenProvider {
    fn store_token(&self, token: &str) -> Result<(), CredentialError>;

    fn delete_token(&self) -> Result<(), CredentialError>;

    fn has_token(&self) -> bool {
        self.token().is_ok()
    }
}

/// A fixed token.
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StaticToken(***)")
    }
}

impl TokenProvider for StaticToken {
    fn token(&self) -> Result<String, CredentialError> {
        Ok(self.0.clone())
    }
}

/// Reads the token from an environment variable at request time.
#[derive(Debug, Clone)]
pub struct EnvTokenProvider {
    var: String,
}

impl EnvTokenProvider {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl TokenProvider for EnvTokenProvider {
    fn token(&self) -> Result<String, CredentialError> {
        match std::env::var(&self.var) {
            Ok(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
            _ => Err(CredentialError::EnvVarMissing {
                var: self.var.clone(),
            }),
        }
    }
}

/// OS-native token store using the `keyring` crate.
///
/// Stores tokens under service `"mutalab"` with account names formatted as
/// `"service:{profile}"`, so several service deployments can keep separate tokens.
#[derive(Debug, Clone)]
pub struct KeyringTokenProvider {
    service: String,
    account: String,
}

impl KeyringTokenProvider {
    pub fn new(profile: &str) -> Self {
        Self {
            service: KEYRING_SERVICE.to_string(),
            account: Self::account_name(profile),
        }
    }

    /// Format the account name for a given profile.
    pub fn account_name(profile: &str) -> String {
        format!("service:{profile}")
    }

    fn entry(&self) -> Result<keyring::Entry, CredentialError> {
        keyring::Entry::new(&self.service, &self.account).map_err(|e| {
            CredentialError::BackendUnavailable {
                message: e.to_string(),
            }
        })
    }
}

impl TokenProvider for KeyringTokenProvider {
    fn token(&self) -> Result<String, CredentialError> {
        self.entry()?.get_password().map_err(|e| match e {
            keyring::Error::NoEntry => CredentialError::NotFound {
                service: self.service.clone(),
                account: self.account.clone(),
            },
            other => CredentialError::StoreFailed {
                message: other.to_string(),
            },
        })
    }
}

impl TokenStore for KeyringTokenProvider {
    fn store_token(&self, token: &str) -> Result<(), CredentialError> {
        self.entry()?
            .set_password(token)
            .map_err(|e| CredentialError::StoreFailed {
                message: e.to_string(),
            })
    }

    fn delete_token(&self) -> Result<(), CredentialError> {
        self.entry()?
            .delete_credential()
            .map_err(|e| CredentialError::DeleteFailed {
                message: e.to_string(),
            })
    }
}

/// In-memory token store for testing.
///
/// Thread-safe via `Mutex<HashMap>`. Does not persist across process restarts.
#[derive(Debug)]
pub struct InMemoryTokenStore {
    account: String,
    store: Mutex<HashMap<String, String>>,
}

impl InMemoryTokenStore {
    pub fn new(profile: &str) -> Self {
        Self {
            account: KeyringTokenProvider::account_name(profile),
            store: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryTokenStore {
    fn default() -> Self {
        Self::new("default")
    }
}

impl TokenProvider for InMemoryTokenStore {
    fn token(&self) -> Result<String, CredentialError> {
        self.store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&self.account)
            .cloned()
            .ok_or_else(|| CredentialError::NotFound {
                service: KEYRING_SERVICE.to_string(),
                account: self.account.clone(),
            })
    }
}

impl TokenStore for InMemoryTokenStore {
    fn store_token(&self, token: &str) -> Result<(), CredentialError> {
        self.store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(self.account.clone(), token.to_string());
        Ok(())
    }

    fn delete_token(&self) -> Result<(), CredentialError> {
        self.store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.account);
        Ok(())
    }
}

/// Tries each provider in turn and returns the first token found.
pub struct FallbackTokenProvider {
    providers: Vec<Box<dyn TokenProvider>>,
}

impl FallbackTokenProvider {
    pub fn new(providers: Vec<Box<dyn TokenProvider>>) -> Self {
        Self { providers }
    }
}

impl TokenProvider for FallbackTokenProvider {
    fn token(&self) -> Result<String, CredentialError> {
        let mut last_err = None;
        for provider in &self.providers {
            match provider.token() {
                Ok(token) => return Ok(token),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| CredentialError::NotFound {
            service: KEYRING_SERVICE.to_string(),
            account: "(no providers)".to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_token() {
        let provider = StaticToken::new("abc123");
        assert_eq!(provider.token().unwrap(), "abc123");
        assert_eq!(format!("{:?}", provider), "StaticToken(***)");
    }

    #[test]
    fn test_env_token_provider() {
        // SAFETY: test-only env var manipulation
        unsafe { std::env::set_var("MUTALAB_TEST_TOKEN_PRESENT", "  tok-42 \n") };
        let provider = EnvTokenProvider::new("MUTALAB_TEST_TOKEN_PRESENT");
        assert_eq!(provider.token().unwrap(), "tok-42");
        // SAFETY: test-only env var manipulation
        unsafe { std::env::remove_var("MUTALAB_TEST_TOKEN_PRESENT") };
    }

    #[test]
    fn test_env_token_provider_missing() {
        let provider = EnvTokenProvider::new("MUTALAB_TEST_TOKEN_NEVER_SET");
        assert!(matches!(
            provider.token().unwrap_err(),
            CredentialError::EnvVarMissing { .. }
        ));
    }

    #[test]
    fn test_in_memory_store_roundtrip() {
        let store = InMemoryTokenStore::default();
        assert!(!store.has_token());
        store.store_token("t1").unwrap();
        assert_eq!(store.token().unwrap(), "t1");
        store.store_token("t2").unwrap();
        assert_eq!(store.token().unwrap(), "t2");
        store.delete_token().unwrap();
        assert!(matches!(
            store.token().unwrap_err(),
            CredentialError::NotFound { .. }
        ));
    }

    #[test]
    fn test_profiles_are_isolated() {
        let staging = InMemoryTokenStore::new("staging");
        let prod = InMemoryTokenStore::new("prod");
        staging.store_token("s").unwrap();
        assert!(staging.has_token());
        assert!(!prod.has_token());
    }

    #[test]
    fn test_account_name_format() {
        assert_eq!(
            KeyringTokenProvider::account_name("default"),
            "service:default"
        );
    }

    #[test]
    fn test_fallback_uses_first_available() {
        let empty = InMemoryTokenStore::default();
        let provider = FallbackTokenProvider::new(vec![
            Box::new(empty),
            Box::new(EnvTokenProvider::new("MUTALAB_TEST_TOKEN_NEVER_SET")),
            Box::new(StaticToken::new("from-static")),
        ]);
        assert_eq!(provider.token().unwrap(), "from-static");
    }

    #[test]
    fn test_fallback_reports_last_error() {
        let provider = FallbackTokenProvider::new(vec![
            Box::new(InMemoryTokenStore::default()),
            Box::new(EnvTokenProvider::new("MUTALAB_TEST_TOKEN_NEVER_SET")),
        ]);
        assert!(matches!(
            provider.token().unwrap_err(),
            CredentialError::EnvVarMissing { .. }
        ));
        assert!(FallbackTokenProvider::new(Vec::new()).token().is_err());
    }
}
