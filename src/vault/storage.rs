//! Vault Storage
//!
//! Secrets kept in the OS keychain under one service per namespace.

use keyring::Entry;

use crate::engine::error::{EngineError, EngineResult};

const SERVICE_PREFIX: &str = "unidb";

/// Keychain-backed secret storage
#[derive(Debug, Clone)]
pub struct VaultStorage {
    service: String,
}

impl VaultStorage {
    /// Storage isolated under `unidb_<namespace>`
    pub fn new(namespace: &str) -> Self {
        Self {
            service: format!("{}_{}", SERVICE_PREFIX, namespace),
        }
    }

    /// Storage for an explicit keychain service name
    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    fn entry(&self, account: &str) -> EngineResult<Entry> {
        Entry::new(&self.service, account)
            .map_err(|e| EngineError::credential_error(format!("Keyring error: {}", e)))
    }

    pub fn save_secret(&self, account: &str, secret: &str) -> EngineResult<()> {
        self.entry(account)?
            .set_password(secret)
            .map_err(|e| EngineError::credential_error(format!("Failed to save secret: {}", e)))
    }

    /// `None` when the keychain has no entry for `account`.
    pub fn load_secret(&self, account: &str) -> EngineResult<Option<String>> {
        match self.entry(account)?.get_password() {
            Ok(secret) => Ok(Some(secret)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(EngineError::credential_error(format!(
                "Failed to read secret for '{}': {}",
                account, e
            ))),
        }
    }

    /// Removing a missing entry is not an error.
    pub fn delete_secret(&self, account: &str) -> EngineResult<()> {
        match self.entry(account)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(EngineError::credential_error(format!("Failed to delete secret: {}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespaces_map_to_prefixed_services() {
        assert_eq!(VaultStorage::new("prod").service(), "unidb_prod");
        assert_eq!(VaultStorage::with_service("corp-db").service(), "corp-db");
    }
}
