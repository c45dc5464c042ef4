//! SSH Tunnel
//!
//! Provides SSH tunneling for connecting to databases behind firewalls.
//! Uses the native OpenSSH client for maximum compatibility. Tunnels are
//! shared between adapters through [`TunnelRegistry`], keyed by SSH endpoint,
//! identity, host key settings and forwarded target.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration, Instant};
use tracing::instrument;

use crate::config;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::types::{SshAuth, SshHostKeyPolicy, SshTunnelConfig};

const LOCAL_HOST: &str = "127.0.0.1";

/// A running port forward
#[async_trait]
pub trait TunnelHandle: Send + Sync {
    fn local_host(&self) -> &str;
    fn local_port(&self) -> u16;
    async fn teardown(&mut self) -> EngineResult<()>;
}

/// Opens port forwards through an SSH endpoint
#[async_trait]
pub trait TunnelProvider: Send + Sync {
    async fn establish(
        &self,
        ssh: &SshTunnelConfig,
        remote_host: &str,
        remote_port: u16,
    ) -> EngineResult<Box<dyn TunnelHandle>>;
}

fn ssh_error(message: impl Into<String>) -> EngineError {
    EngineError::SshError {
        message: message.into(),
    }
}

/// Represents an active SSH tunnel using native OpenSSH
pub struct SshTunnel {
    local_port: u16,
    process: Option<Child>,
}

/// Builds the `ssh` argument list for a forward on `local_port`.
pub fn build_ssh_args(
    config: &SshTunnelConfig,
    local_port: u16,
    remote_host: &str,
    remote_port: u16,
) -> EngineResult<Vec<String>> {
    let mut args: Vec<String> = vec!["-N".into(), "-o".into(), "ExitOnForwardFailure=yes".into()];
    let mut opt = |value: String| {
        args.push("-o".into());
        args.push(value);
    };

    match config.host_key_policy {
        SshHostKeyPolicy::AcceptNew | SshHostKeyPolicy::Strict => {
            let known_hosts = config
                .known_hosts_path
                .clone()
                .unwrap_or_else(|| config::data_dir().join("known_hosts").display().to_string());
            let checking = if config.host_key_policy == SshHostKeyPolicy::Strict {
                "yes"
            } else {
                "accept-new"
            };
            opt(format!("StrictHostKeyChecking={}", checking));
            opt(format!("UserKnownHostsFile={}", known_hosts));
        }
        SshHostKeyPolicy::InsecureNoCheck => {
            opt("StrictHostKeyChecking=no".into());
            opt("UserKnownHostsFile=/dev/null".into());
        }
    }
    opt("BatchMode=yes".into());
    opt(format!("ConnectTimeout={}", config.connect_timeout_secs.max(1)));
    opt(format!("ServerAliveInterval={}", config.keepalive_interval_secs));
    opt(format!("ServerAliveCountMax={}", config.keepalive_count_max));

    if let Some(jump) = &config.proxy_jump {
        args.push("-J".into());
        args.push(jump.clone());
    }

    args.push("-L".into());
    args.push(format!("{}:{}:{}:{}", LOCAL_HOST, local_port, remote_host, remote_port));
    args.push("-p".into());
    args.push(config.port.to_string());

    match &config.auth {
        SshAuth::Password { .. } => {
            // Password auth requires an interactive prompt; rely on keys or ssh-agent.
            return Err(ssh_error("Password authentication not supported. Use SSH keys instead."));
        }
        SshAuth::Key { private_key_path, .. } => {
            args.push("-i".into());
            args.push(private_key_path.clone());
        }
    }

    args.push(format!("{}@{}", config.username, config.host));
    Ok(args)
}

impl SshTunnel {
    /// Spawns `ssh -N -L` and waits until the local end accepts connections.
    #[instrument(skip(config), fields(ssh_host = %config.host))]
    pub async fn open(config: &SshTunnelConfig, remote_host: &str, remote_port: u16) -> EngineResult<Self> {
        // Find an available local port
        let listener = tokio::net::TcpListener::bind((LOCAL_HOST, 0))
            .await
            .map_err(|e| ssh_error(format!("Failed to bind local port: {}", e)))?;
        let local_port = listener
            .local_addr()
            .map_err(|e| ssh_error(format!("Failed to get local address: {}", e)))?
            .port();
        // Drop the listener so ssh can bind to this port
        drop(listener);

        let args = build_ssh_args(config, local_port, remote_host, remote_port)?;
        let process = Command::new("ssh")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ssh_error(format!("Failed to spawn SSH process: {}. Is OpenSSH installed?", e)))?;

        let mut tunnel = Self {
            local_port,
            process: Some(process),
        };
        let deadline = Duration::from_secs(u64::from(config.connect_timeout_secs.max(1)) + 2);
        tunnel.wait_ready(deadline).await?;
        tracing::info!(local_port, "SSH tunnel established");
        Ok(tunnel)
    }

    async fn wait_ready(&mut self, limit: Duration) -> EngineResult<()> {
        let started = Instant::now();
        loop {
            if let Some(process) = self.process.as_mut() {
                if let Ok(Some(status)) = process.try_wait() {
                    let mut stderr = String::new();
                    if let Some(mut pipe) = process.stderr.take() {
                        let _ = pipe.read_to_string(&mut stderr).await;
                    }
                    self.process = None;
                    return Err(ssh_error(format!(
                        "SSH exited with {}: {}",
                        status,
                        stderr.trim()
                    )));
                }
            }

            if tokio::net::TcpStream::connect((LOCAL_HOST, self.local_port)).await.is_ok() {
                return Ok(());
            }
            if started.elapsed() >= limit {
                let _ = self.close().await;
                return Err(ssh_error("Timed out waiting for SSH tunnel"));
            }
            sleep(Duration::from_millis(100)).await;
        }
    }

    /// Returns the local address to use for database connection
    pub fn local_addr(&self) -> String {
        format!("{}:{}", LOCAL_HOST, self.local_port)
    }

    /// Closes the tunnel
    pub async fn close(&mut self) -> EngineResult<()> {
        if let Some(mut process) = self.process.take() {
            process
                .kill()
                .await
                .map_err(|e| ssh_error(format!("Failed to kill SSH process: {}", e)))?;
        }
        Ok(())
    }
}

#[async_trait]
impl TunnelHandle for SshTunnel {
    fn local_host(&self) -> &str {
        LOCAL_HOST
    }

    fn local_port(&self) -> u16 {
        self.local_port
    }

    async fn teardown(&mut self) -> EngineResult<()> {
        self.close().await
    }
}

impl Drop for SshTunnel {
    fn drop(&mut self) {
        if let Some(mut process) = self.process.take() {
            // Best effort kill on drop
            let _ = process.start_kill();
        }
    }
}

/// Default provider spawning the system OpenSSH client
pub struct OpenSshTunnelProvider;

#[async_trait]
impl TunnelProvider for OpenSshTunnelProvider {
    async fn establish(
        &self,
        ssh: &SshTunnelConfig,
        remote_host: &str,
        remote_port: u16,
    ) -> EngineResult<Box<dyn TunnelHandle>> {
        let tunnel = SshTunnel::open(ssh, remote_host, remote_port).await?;
        Ok(Box::new(tunnel))
    }
}

struct SharedTunnel {
    handle: Box<dyn TunnelHandle>,
    leases: usize,
}

/// Process-wide tunnel cache with reference-counted leases
pub struct TunnelRegistry {
    provider: Arc<dyn TunnelProvider>,
    tunnels: Mutex<HashMap<String, SharedTunnel>>,
    /// Per-key gates serializing establishment; the map lock is never held
    /// across a handshake.
    establishing: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TunnelRegistry {
    pub fn new(provider: Arc<dyn TunnelProvider>) -> Self {
        Self {
            provider,
            tunnels: Mutex::new(HashMap::new()),
            establishing: Mutex::new(HashMap::new()),
        }
    }

    /// Digest of every parameter that changes which session the forward
    /// rides on, so secrets never sit in the map in clear.
    fn key(ssh: &SshTunnelConfig, remote_host: &str, remote_port: u16) -> String {
        let identity = match &ssh.auth {
            SshAuth::Password { password } => format!("password:{}", password),
            SshAuth::Key {
                private_key_path,
                passphrase,
            } => format!("key:{}:{}", private_key_path, passphrase.as_deref().unwrap_or("")),
        };
        let composite = format!(
            "{}@{}:{}|{}|{}|{:?}|{}|{}:{}",
            ssh.username,
            ssh.host,
            ssh.port,
            ssh.proxy_jump.as_deref().unwrap_or(""),
            identity,
            ssh.host_key_policy,
            ssh.known_hosts_path.as_deref().unwrap_or(""),
            remote_host,
            remote_port
        );

        let mut hasher = Sha256::new();
        hasher.update(composite.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    async fn lease_existing(self: &Arc<Self>, key: &str) -> Option<TunnelLease> {
        let mut tunnels = self.tunnels.lock().await;
        let shared = tunnels.get_mut(key)?;
        shared.leases += 1;
        Some(TunnelLease {
            registry: Arc::clone(self),
            local_host: shared.handle.local_host().to_string(),
            local_port: shared.handle.local_port(),
            key: key.to_string(),
            released: false,
        })
    }

    /// Returns a lease on a shared tunnel, establishing it when absent.
    pub async fn acquire(
        self: &Arc<Self>,
        ssh: &SshTunnelConfig,
        remote_host: &str,
        remote_port: u16,
    ) -> EngineResult<TunnelLease> {
        let key = Self::key(ssh, remote_host, remote_port);
        if let Some(lease) = self.lease_existing(&key).await {
            return Ok(lease);
        }

        let gate = {
            let mut establishing = self.establishing.lock().await;
            Arc::clone(establishing.entry(key.clone()).or_default())
        };
        let result = {
            let _establishing = gate.lock().await;
            self.establish_gated(&key, ssh, remote_host, remote_port).await
        };

        {
            let mut establishing = self.establishing.lock().await;
            // Only the map and this caller still hold the gate.
            if Arc::strong_count(&gate) <= 2 {
                establishing.remove(&key);
            }
        }
        result
    }

    async fn establish_gated(
        self: &Arc<Self>,
        key: &str,
        ssh: &SshTunnelConfig,
        remote_host: &str,
        remote_port: u16,
    ) -> EngineResult<TunnelLease> {
        // Another caller may have finished while this one waited on the gate.
        if let Some(lease) = self.lease_existing(key).await {
            return Ok(lease);
        }

        let handle = self.provider.establish(ssh, remote_host, remote_port).await?;
        let lease = TunnelLease {
            registry: Arc::clone(self),
            local_host: handle.local_host().to_string(),
            local_port: handle.local_port(),
            key: key.to_string(),
            released: false,
        };
        self.tunnels
            .lock()
            .await
            .insert(key.to_string(), SharedTunnel { handle, leases: 1 });
        Ok(lease)
    }

    async fn release_key(&self, key: &str) {
        let removed = {
            let mut tunnels = self.tunnels.lock().await;
            match tunnels.get_mut(key) {
                Some(shared) if shared.leases > 1 => {
                    shared.leases -= 1;
                    None
                }
                Some(_) => tunnels.remove(key),
                None => None,
            }
        };

        if let Some(mut shared) = removed {
            if let Err(e) = shared.handle.teardown().await {
                tracing::warn!("Tunnel teardown failed: {}", e);
            }
        }
    }

    pub async fn active_count(&self) -> usize {
        self.tunnels.lock().await.len()
    }

    /// Tears down every tunnel regardless of outstanding leases.
    pub async fn clear(&self) {
        let drained: Vec<SharedTunnel> = {
            let mut tunnels = self.tunnels.lock().await;
            tunnels.drain().map(|(_, shared)| shared).collect()
        };
        for mut shared in drained {
            if let Err(e) = shared.handle.teardown().await {
                tracing::warn!("Tunnel teardown failed: {}", e);
            }
        }
    }
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::new(Arc::new(OpenSshTunnelProvider))
    }
}

/// One adapter's claim on a shared tunnel
pub struct TunnelLease {
    registry: Arc<TunnelRegistry>,
    key: String,
    local_host: String,
    local_port: u16,
    released: bool,
}

impl TunnelLease {
    pub fn local_host(&self) -> &str {
        &self.local_host
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub async fn release(mut self) {
        self.released = true;
        self.registry.release_key(&self.key).await;
    }
}

impl Drop for TunnelLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let registry = Arc::clone(&self.registry);
            let key = std::mem::take(&mut self.key);
            runtime.spawn(async move {
                registry.release_key(&key).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    fn ssh_config() -> SshTunnelConfig {
        SshTunnelConfig {
            host: "bastion.example.com".into(),
            port: 22,
            username: "deploy".into(),
            auth: SshAuth::Key {
                private_key_path: "/home/deploy/.ssh/id_ed25519".into(),
                passphrase: None,
            },
            host_key_policy: SshHostKeyPolicy::Strict,
            known_hosts_path: Some("/tmp/known_hosts".into()),
            proxy_jump: Some("jump@hop:2222".into()),
            connect_timeout_secs: 5,
            keepalive_interval_secs: 30,
            keepalive_count_max: 3,
        }
    }

    struct FakeHandle {
        port: u16,
        teardowns: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TunnelHandle for FakeHandle {
        fn local_host(&self) -> &str {
            LOCAL_HOST
        }

        fn local_port(&self) -> u16 {
            self.port
        }

        async fn teardown(&mut self) -> EngineResult<()> {
            self.teardowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FakeProvider {
        established: AtomicUsize,
        teardowns: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TunnelProvider for FakeProvider {
        async fn establish(
            &self,
            _ssh: &SshTunnelConfig,
            _remote_host: &str,
            _remote_port: u16,
        ) -> EngineResult<Box<dyn TunnelHandle>> {
            let n = self.established.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeHandle {
                port: 40_000 + n as u16,
                teardowns: Arc::clone(&self.teardowns),
            }))
        }
    }

    /// Hangs forever for `stalled.internal`, otherwise delegates.
    struct StallingProvider {
        inner: FakeProvider,
        entered: Arc<Notify>,
    }

    #[async_trait]
    impl TunnelProvider for StallingProvider {
        async fn establish(
            &self,
            ssh: &SshTunnelConfig,
            remote_host: &str,
            remote_port: u16,
        ) -> EngineResult<Box<dyn TunnelHandle>> {
            if remote_host == "stalled.internal" {
                self.entered.notify_one();
                std::future::pending::<()>().await;
            }
            self.inner.establish(ssh, remote_host, remote_port).await
        }
    }

    fn fake_provider() -> FakeProvider {
        FakeProvider {
            established: AtomicUsize::new(0),
            teardowns: Arc::new(AtomicUsize::new(0)),
        }
    }

    #[test]
    fn strict_policy_uses_known_hosts_and_jump_host() {
        let args = build_ssh_args(&ssh_config(), 50_000, "db.internal", 5432).expect("args");
        let joined = args.join(" ");

        assert!(joined.contains("StrictHostKeyChecking=yes"));
        assert!(joined.contains("UserKnownHostsFile=/tmp/known_hosts"));
        assert!(joined.contains("-J jump@hop:2222"));
        assert!(joined.contains("-L 127.0.0.1:50000:db.internal:5432"));
        assert_eq!(args.last().map(String::as_str), Some("deploy@bastion.example.com"));
    }

    #[test]
    fn password_auth_is_rejected() {
        let mut config = ssh_config();
        config.auth = SshAuth::Password {
            password: "secret".into(),
        };
        assert!(build_ssh_args(&config, 1, "h", 1).is_err());
    }

    #[tokio::test]
    async fn leases_share_one_tunnel_until_last_release() {
        let teardowns = Arc::new(AtomicUsize::new(0));
        let provider = Arc::new(FakeProvider {
            established: AtomicUsize::new(0),
            teardowns: Arc::clone(&teardowns),
        });
        let registry = Arc::new(TunnelRegistry::new(provider.clone()));

        let first = registry.acquire(&ssh_config(), "db.internal", 5432).await.expect("first");
        let second = registry.acquire(&ssh_config(), "db.internal", 5432).await.expect("second");

        assert_eq!(first.local_port(), second.local_port());
        assert_eq!(provider.established.load(Ordering::SeqCst), 1);

        first.release().await;
        assert_eq!(registry.active_count().await, 1);
        assert_eq!(teardowns.load(Ordering::SeqCst), 0);

        second.release().await;
        assert_eq!(registry.active_count().await, 0);
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_identities_get_separate_tunnels() {
        let provider = Arc::new(fake_provider());
        let registry = Arc::new(TunnelRegistry::new(provider.clone()));

        let mut other_key = ssh_config();
        other_key.auth = SshAuth::Key {
            private_key_path: "/home/deploy/.ssh/id_ops".into(),
            passphrase: None,
        };
        let mut other_policy = ssh_config();
        other_policy.host_key_policy = SshHostKeyPolicy::AcceptNew;

        let first = registry.acquire(&ssh_config(), "db.internal", 5432).await.expect("first");
        let second = registry.acquire(&other_key, "db.internal", 5432).await.expect("second");
        let third = registry.acquire(&other_policy, "db.internal", 5432).await.expect("third");

        assert_eq!(provider.established.load(Ordering::SeqCst), 3);
        assert_ne!(first.local_port(), second.local_port());
        assert_eq!(registry.active_count().await, 3);

        for lease in [first, second, third] {
            lease.release().await;
        }
        assert_eq!(registry.active_count().await, 0);
    }

    #[test]
    fn tunnel_keys_do_not_carry_secrets() {
        let mut config = ssh_config();
        config.auth = SshAuth::Key {
            private_key_path: "/k".into(),
            passphrase: Some("hunter2".into()),
        };
        let key = TunnelRegistry::key(&config, "db.internal", 5432);
        assert!(!key.contains("hunter2"));
        assert_eq!(key.len(), 64);
    }

    #[tokio::test]
    async fn stalled_handshake_does_not_block_other_endpoints() {
        let entered = Arc::new(Notify::new());
        let provider = Arc::new(StallingProvider {
            inner: fake_provider(),
            entered: Arc::clone(&entered),
        });
        let registry = Arc::new(TunnelRegistry::new(provider));

        let stalled = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                let ssh = ssh_config();
                registry.acquire(&ssh, "stalled.internal", 5432).await.map(drop)
            })
        };
        entered.notified().await;

        let lease = tokio::time::timeout(
            Duration::from_secs(2),
            registry.acquire(&ssh_config(), "db.internal", 5432),
        )
        .await
        .expect("acquire must not wait on another endpoint")
        .expect("acquire");
        assert_eq!(registry.active_count().await, 1);

        lease.release().await;
        stalled.abort();
    }

    #[tokio::test]
    async fn concurrent_acquires_establish_once() {
        let provider = Arc::new(fake_provider());
        let registry = Arc::new(TunnelRegistry::new(provider.clone()));

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    let ssh = ssh_config();
                    registry.acquire(&ssh, "db.internal", 5432).await
                })
            })
            .collect();

        let mut leases = Vec::new();
        for task in tasks {
            leases.push(task.await.expect("join").expect("acquire"));
        }
        assert_eq!(provider.established.load(Ordering::SeqCst), 1);
        assert!(registry.establishing.lock().await.is_empty());

        for lease in leases {
            lease.release().await;
        }
        assert_eq!(registry.active_count().await, 0);
    }
}
