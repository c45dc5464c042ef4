//! Keychain credential provider
//!
//! Resolves connection secrets stored in the OS keychain. Auth parameters:
//!
//! - `account` (required): keychain account name
//! - `service` (optional): keychain service, defaults to `unidb_default`
//! - `username` (optional): overrides the configured username
//!
//! The stored value is either the bare secret or a JSON object
//! `{"username": ..., "secret": ..., "expires_at": ...}` for rotated
//! credentials.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::engine::credentials::{AuthConfig, CredentialProvider, ResolvedCredentials};
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::types::ConnectionConfig;
use crate::vault::storage::VaultStorage;

const DEFAULT_NAMESPACE: &str = "default";

#[derive(Deserialize)]
struct StoredCredentials {
    username: Option<String>,
    secret: String,
    expires_at: Option<DateTime<Utc>>,
}

pub struct KeyringCredentialProvider;

impl KeyringCredentialProvider {
    fn storage(auth: &AuthConfig) -> VaultStorage {
        match auth.parameters.get("service") {
            Some(service) => VaultStorage::with_service(service.clone()),
            None => VaultStorage::new(DEFAULT_NAMESPACE),
        }
    }
}

/// Interprets a stored keychain value.
fn parse_stored(raw: &str, default_username: &str) -> ResolvedCredentials {
    match serde_json::from_str::<StoredCredentials>(raw) {
        Ok(stored) => ResolvedCredentials {
            username: stored.username.unwrap_or_else(|| default_username.to_string()),
            secret: stored.secret,
            expires_at: stored.expires_at,
        },
        Err(_) => ResolvedCredentials {
            username: default_username.to_string(),
            secret: raw.to_string(),
            expires_at: None,
        },
    }
}

#[async_trait]
impl CredentialProvider for KeyringCredentialProvider {
    fn id(&self) -> &'static str {
        "keyring"
    }

    #[tracing::instrument(skip_all, fields(account = auth.parameters.get("account").map(String::as_str)))]
    async fn resolve(
        &self,
        config: &ConnectionConfig,
        auth: &AuthConfig,
        cancel: &CancellationToken,
    ) -> EngineResult<ResolvedCredentials> {
        let account = auth.parameter("account")?.to_string();
        let username = auth
            .parameters
            .get("username")
            .cloned()
            .unwrap_or_else(|| config.username.clone());
        let storage = Self::storage(auth);

        // Keychain access blocks on some platforms
        let lookup_account = account.clone();
        let lookup = tokio::task::spawn_blocking(move || storage.load_secret(&lookup_account));

        let raw = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            joined = lookup => joined
                .map_err(|e| EngineError::internal(format!("Keyring task failed: {}", e)))??,
        };

        let raw = raw.ok_or_else(|| {
            EngineError::credential_error(format!("No keychain entry for account '{}'", account))
        })?;
        Ok(parse_stored(&raw, &username))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_secrets_keep_the_configured_username() {
        let resolved = parse_stored("hunter2", "app");
        assert_eq!(resolved.username, "app");
        assert_eq!(resolved.secret, "hunter2");
        assert!(resolved.expires_at.is_none());
    }

    #[test]
    fn json_entries_carry_rotation_metadata() {
        let resolved = parse_stored(
            r#"{"username": "svc_reader", "secret": "tok", "expires_at": "2030-01-01T00:00:00Z"}"#,
            "app",
        );
        assert_eq!(resolved.username, "svc_reader");
        assert_eq!(resolved.secret, "tok");
        assert!(resolved.expires_at.is_some());
    }

    #[tokio::test]
    async fn account_parameter_is_required() {
        let config = ConnectionConfig::new("postgres", "localhost", 5432);
        let auth = AuthConfig::new("keyring");
        let err = KeyringCredentialProvider
            .resolve(&config, &auth, &CancellationToken::new())
            .await
            .expect_err("missing account");
        assert!(matches!(err, EngineError::CredentialError { .. }));
    }

    #[tokio::test]
    async fn cancelled_lookups_stop_early() {
        let config = ConnectionConfig::new("postgres", "localhost", 5432);
        let auth = AuthConfig::new("keyring").with_parameter("account", "prod-db");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = KeyringCredentialProvider
            .resolve(&config, &auth, &cancel)
            .await
            .expect_err("cancelled");
        assert!(matches!(err, EngineError::Cancelled));
    }
}
