//! Vault requests
//!
//! Stores secrets that connection configs later reference through the
//! `keyring` credential provider.

use crate::commands::Response;
use crate::engine::error::{EngineError, EngineResult};
use crate::vault::VaultStorage;

const DEFAULT_NAMESPACE: &str = "default";

fn storage(service: Option<String>) -> VaultStorage {
    match service {
        Some(service) if !service.trim().is_empty() => VaultStorage::with_service(service.trim()),
        _ => VaultStorage::new(DEFAULT_NAMESPACE),
    }
}

fn account_name(account: &str) -> EngineResult<String> {
    let account = account.trim();
    if account.is_empty() {
        return Err(EngineError::credential_error("Account is required"));
    }
    Ok(account.to_string())
}

async fn blocking<F>(task: F) -> EngineResult<()>
where
    F: FnOnce() -> EngineResult<()> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| EngineError::internal(format!("Keyring task failed: {}", e)))?
}

pub async fn save_secret(service: Option<String>, account: String, secret: String) -> EngineResult<Response> {
    let account = account_name(&account)?;
    if secret.is_empty() {
        return Err(EngineError::credential_error("Secret must not be empty"));
    }
    let storage = storage(service);
    tracing::info!(service = storage.service(), account = %account, "Saving secret");
    blocking(move || storage.save_secret(&account, &secret)).await?;
    Ok(Response::Ok)
}

pub async fn delete_secret(service: Option<String>, account: String) -> EngineResult<Response> {
    let account = account_name(&account)?;
    let storage = storage(service);
    tracing::info!(service = storage.service(), account = %account, "Deleting secret");
    blocking(move || storage.delete_secret(&account)).await?;
    Ok(Response::Ok)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_services_fall_back_to_the_default_namespace() {
        assert_eq!(storage(None).service(), "unidb_default");
        assert_eq!(storage(Some("  ".into())).service(), "unidb_default");
        assert_eq!(storage(Some("corp_vault".into())).service(), "corp_vault");
    }

    #[tokio::test]
    async fn empty_inputs_are_rejected_before_the_keychain() {
        let err = save_secret(None, " ".into(), "s".into()).await.expect_err("account");
        assert!(matches!(err, EngineError::CredentialError { .. }));

        let err = save_secret(None, "prod".into(), String::new()).await.expect_err("secret");
        assert!(matches!(err, EngineError::CredentialError { .. }));
    }
}
