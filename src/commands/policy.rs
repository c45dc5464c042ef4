//! Safety policy requests.

use crate::commands::Response;
use crate::config::SafetyPolicy;
use crate::engine::error::EngineResult;
use crate::Engine;

/// Returns the current policy (env overrides applied at startup).
pub async fn get_safety_policy(engine: &Engine) -> EngineResult<Response> {
    let settings = engine.connections().settings().await;
    Ok(Response::SafetyPolicy(settings.safety))
}

/// Stores the policy for connections opened from now on and persists it.
/// A failed write keeps the in-memory policy.
pub async fn set_safety_policy(engine: &Engine, policy: SafetyPolicy) -> EngineResult<Response> {
    engine.connections().set_safety_policy(policy.clone()).await;

    let settings = engine.connections().settings().await;
    let persisted = tokio::task::spawn_blocking(move || settings.save_to_file()).await;
    match persisted {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!("Failed to persist safety policy: {}", e),
        Err(e) => tracing::warn!("Failed to persist safety policy: {}", e),
    }

    Ok(Response::SafetyPolicy(policy))
}
