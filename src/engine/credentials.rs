//! Credential providers and the process-wide credential cache
//!
//! A connection config may name a provider in `auth`; adapters then resolve
//! username/secret through [`CredentialCache`] at connect time and again
//! before pooled operations, swapping connect options when the secret rotates.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::types::ConnectionConfig;

/// Default window before expiry in which credentials are re-resolved.
pub const DEFAULT_REFRESH_THRESHOLD_SECS: i64 = 300;

/// Selects a credential provider and its parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    pub provider: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl AuthConfig {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn parameter(&self, key: &str) -> EngineResult<&str> {
        self.parameters
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| EngineError::credential_error(format!("Missing auth parameter '{}'", key)))
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct ResolvedCredentials {
    pub username: String,
    pub secret: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ResolvedCredentials {
    pub fn needs_refresh(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at - threshold <= now,
            None => false,
        }
    }
}

impl fmt::Debug for ResolvedCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedCredentials")
            .field("username", &self.username)
            .field("secret", &"***")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Identifier matched against `AuthConfig::provider`
    fn id(&self) -> &'static str;

    async fn resolve(
        &self,
        config: &ConnectionConfig,
        auth: &AuthConfig,
        cancel: &CancellationToken,
    ) -> EngineResult<ResolvedCredentials>;
}

/// Reads `username`/`secret` straight from the auth parameters.
pub struct StaticCredentialProvider;

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    fn id(&self) -> &'static str {
        "static"
    }

    async fn resolve(
        &self,
        config: &ConnectionConfig,
        auth: &AuthConfig,
        _cancel: &CancellationToken,
    ) -> EngineResult<ResolvedCredentials> {
        let username = auth
            .parameters
            .get("username")
            .cloned()
            .unwrap_or_else(|| config.username.clone());
        Ok(ResolvedCredentials {
            username,
            secret: auth.parameter("secret")?.to_string(),
            expires_at: None,
        })
    }
}

/// Process-wide cache of resolved credentials keyed by provider and target
pub struct CredentialCache {
    providers: RwLock<HashMap<String, Arc<dyn CredentialProvider>>>,
    entries: Mutex<HashMap<String, ResolvedCredentials>>,
    /// Per-key gates so one rotation costs one provider call
    resolving: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    refresh_threshold: Duration,
}

impl CredentialCache {
    pub fn new(refresh_threshold: Duration) -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
            entries: Mutex::new(HashMap::new()),
            resolving: Mutex::new(HashMap::new()),
            refresh_threshold,
        }
    }

    pub async fn register(&self, provider: Arc<dyn CredentialProvider>) {
        let mut providers = self.providers.write().await;
        providers.insert(provider.id().to_string(), provider);
    }

    pub fn refresh_threshold(&self) -> Duration {
        self.refresh_threshold
    }

    fn cache_key(config: &ConnectionConfig, auth: &AuthConfig) -> String {
        let params = auth
            .parameters
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        format!(
            "{}|{}|{}:{}|{}|{}|{}",
            auth.provider,
            config.driver,
            config.host,
            config.port,
            config.database.as_deref().unwrap_or(""),
            config.username,
            params
        )
    }

    /// Returns cached credentials, re-resolving when missing or near expiry.
    ///
    /// Concurrent callers for the same key share one provider call.
    #[instrument(skip(self, config, auth, cancel), fields(provider = %auth.provider, host = %config.host))]
    pub async fn get(
        &self,
        config: &ConnectionConfig,
        auth: &AuthConfig,
        cancel: &CancellationToken,
    ) -> EngineResult<ResolvedCredentials> {
        let key = Self::cache_key(config, auth);
        let seen = {
            let entries = self.entries.lock().await;
            match entries.get(&key) {
                Some(entry) if !entry.needs_refresh(self.refresh_threshold, Utc::now()) => {
                    return Ok(entry.clone());
                }
                entry => entry.cloned(),
            }
        };

        let gate = {
            let mut resolving = self.resolving.lock().await;
            Arc::clone(resolving.entry(key.clone()).or_default())
        };
        let result = tokio::select! {
            guard = gate.lock() => {
                let _resolving = guard;
                self.resolve_gated(&key, seen, config, auth, cancel).await
            }
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
        };

        {
            let mut resolving = self.resolving.lock().await;
            // Only the map and this caller still hold the gate.
            if Arc::strong_count(&gate) <= 2 {
                resolving.remove(&key);
            }
        }
        result
    }

    async fn resolve_gated(
        &self,
        key: &str,
        seen: Option<ResolvedCredentials>,
        config: &ConnectionConfig,
        auth: &AuthConfig,
        cancel: &CancellationToken,
    ) -> EngineResult<ResolvedCredentials> {
        {
            // Someone else resolved while this caller waited on the gate.
            let entries = self.entries.lock().await;
            if let Some(entry) = entries.get(key) {
                if seen.as_ref() != Some(entry) || !entry.needs_refresh(self.refresh_threshold, Utc::now()) {
                    return Ok(entry.clone());
                }
            }
        }

        let provider = {
            let providers = self.providers.read().await;
            providers.get(&auth.provider).cloned().ok_or_else(|| {
                EngineError::credential_error(format!("Unknown credential provider '{}'", auth.provider))
            })?
        };

        let resolved = tokio::select! {
            result = provider.resolve(config, auth, cancel) => result?,
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
        };
        tracing::debug!(expires_at = ?resolved.expires_at, "Resolved credentials");

        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), resolved.clone());
        Ok(resolved)
    }

    pub async fn invalidate(&self, config: &ConnectionConfig, auth: &AuthConfig) {
        let mut entries = self.entries.lock().await;
        entries.remove(&Self::cache_key(config, auth));
    }

    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

impl Default for CredentialCache {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_REFRESH_THRESHOLD_SECS))
    }
}

/// Per-adapter view of the cache that remembers the last credentials used
pub struct CredentialHandle {
    cache: Arc<CredentialCache>,
    config: ConnectionConfig,
    cancel: CancellationToken,
    current: Mutex<Option<ResolvedCredentials>>,
}

impl CredentialHandle {
    pub fn new(cache: Arc<CredentialCache>, config: ConnectionConfig) -> Self {
        Self {
            cache,
            config,
            cancel: CancellationToken::new(),
            current: Mutex::new(None),
        }
    }

    /// Username and password to open the connection with.
    pub async fn resolve(&self) -> EngineResult<(String, String)> {
        match &self.config.auth {
            None => Ok((self.config.username.clone(), self.config.password.clone())),
            Some(auth) => {
                let resolved = self.cache.get(&self.config, auth, &self.cancel).await?;
                let pair = (resolved.username.clone(), resolved.secret.clone());
                *self.current.lock().await = Some(resolved);
                Ok(pair)
            }
        }
    }

    /// Returns new credentials only when they differ from the ones in use.
    pub async fn refreshed(&self) -> EngineResult<Option<(String, String)>> {
        let Some(auth) = &self.config.auth else {
            return Ok(None);
        };
        let resolved = self.cache.get(&self.config, auth, &self.cancel).await?;
        let mut current = self.current.lock().await;
        if current.as_ref() == Some(&resolved) {
            return Ok(None);
        }
        let pair = (resolved.username.clone(), resolved.secret.clone());
        *current = Some(resolved);
        Ok(Some(pair))
    }

    /// Aborts any in-flight resolution.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}
