//! Remote WireGuard peer management
//!
//! A `PeerManager` owns the command channel to one endpoint host and
//! serializes mutations against it: the wg tooling gives no atomicity
//! guarantee across concurrent invocations on the same interface.
//! `WgBackend` hands out one manager per endpoint, created lazily and
//! cached for the life of the process.

use crate::remote::{CommandChannel, CommandOutput, SshChannel};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;
use wgvault_common::{Endpoint, Error, Result, WireguardConfig};

/// Best-effort endpoint health snapshot. Monitoring read: remote
/// failures degrade to `status: "error"` instead of propagating.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointHealth {
    pub peer_count: u32,
    pub status: String,
}

/// Commits peer entries to endpoint hosts. The saga and deprovision
/// path talk to this seam so tests can substitute a mock.
#[async_trait]
pub trait PeerBackend: Send + Sync {
    async fn add_peer(&self, endpoint: &Endpoint, public_key: &str, address: Ipv4Addr)
        -> Result<()>;

    /// Idempotent: removing an absent peer succeeds.
    async fn remove_peer(&self, endpoint: &Endpoint, public_key: &str) -> Result<()>;

    async fn endpoint_health(&self, endpoint: &Endpoint) -> EndpointHealth;
}

/// Peer operations against one endpoint over a command channel.
pub struct PeerManager {
    channel: Arc<dyn CommandChannel>,
    interface: String,
    /// Serializes add/remove against this endpoint.
    lock: Mutex<()>,
}

impl PeerManager {
    pub fn new(channel: Arc<dyn CommandChannel>, interface: String) -> Self {
        Self {
            channel,
            interface,
            lock: Mutex::new(()),
        }
    }

    fn check(command: String, output: CommandOutput) -> Result<CommandOutput> {
        if !output.success() {
            return Err(Error::RemoteCommand {
                command,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }

    /// Commit a peer with a single-address allow-list and persist the
    /// running configuration so it survives an endpoint restart.
    pub async fn add_peer(&self, public_key: &str, address: Ipv4Addr) -> Result<()> {
        let _guard = self.lock.lock().await;

        let command = format!(
            "wg set {} peer {} allowed-ips {}/32",
            self.interface, public_key, address
        );
        Self::check(command.clone(), self.channel.exec(&command).await?)?;

        let save = format!("wg-quick save {}", self.interface);
        Self::check(save.clone(), self.channel.exec(&save).await?)?;

        info!("Added peer {} at {} on {}", public_key, address, self.interface);
        Ok(())
    }

    pub async fn remove_peer(&self, public_key: &str) -> Result<()> {
        let _guard = self.lock.lock().await;

        let command = format!("wg set {} peer {} remove", self.interface, public_key);
        Self::check(command.clone(), self.channel.exec(&command).await?)?;

        let save = format!("wg-quick save {}", self.interface);
        Self::check(save.clone(), self.channel.exec(&save).await?)?;

        info!("Removed peer {} from {}", public_key, self.interface);
        Ok(())
    }

    /// Peer count and liveness. Never propagates remote errors.
    pub async fn status(&self) -> EndpointHealth {
        let command = format!("wg show {} peers | wc -l", self.interface);
        match self.channel.exec(&command).await {
            Ok(output) if output.success() => {
                let peer_count = output.stdout.trim().parse().unwrap_or(0);
                EndpointHealth {
                    peer_count,
                    status: "active".to_string(),
                }
            }
            Ok(output) => {
                debug!("Endpoint status probe failed: {}", output.stderr.trim());
                EndpointHealth {
                    peer_count: 0,
                    status: "error".to_string(),
                }
            }
            Err(e) => {
                debug!("Endpoint status probe failed: {}", e);
                EndpointHealth {
                    peer_count: 0,
                    status: "error".to_string(),
                }
            }
        }
    }

    pub async fn close(&self) {
        self.channel.close().await;
    }
}

/// SSH-backed `PeerBackend` with one cached manager per endpoint.
pub struct WgBackend {
    config: WireguardConfig,
    managers: DashMap<Uuid, Arc<PeerManager>>,
}

impl WgBackend {
    pub fn new(config: WireguardConfig) -> Self {
        Self {
            config,
            managers: DashMap::new(),
        }
    }

    fn manager_for(&self, endpoint: &Endpoint) -> Arc<PeerManager> {
        self.managers
            .entry(endpoint.id)
            .or_insert_with(|| {
                let channel = Arc::new(SshChannel::new(endpoint, &self.config));
                Arc::new(PeerManager::new(channel, self.config.interface.clone()))
            })
            .clone()
    }

    pub async fn close_all(&self) {
        for entry in self.managers.iter() {
            entry.value().close().await;
        }
    }
}

#[async_trait]
impl PeerBackend for WgBackend {
    async fn add_peer(
        &self,
        endpoint: &Endpoint,
        public_key: &str,
        address: Ipv4Addr,
    ) -> Result<()> {
        self.manager_for(endpoint).add_peer(public_key, address).await
    }

    async fn remove_peer(&self, endpoint: &Endpoint, public_key: &str) -> Result<()> {
        self.manager_for(endpoint).remove_peer(public_key).await
    }

    async fn endpoint_health(&self, endpoint: &Endpoint) -> EndpointHealth {
        self.manager_for(endpoint).status().await
    }
}

/// Render the client-side configuration for a device. Pure formatting,
/// no network involved; the private key only transits this string on
/// its way to the caller.
pub fn render_client_config(
    private_key: &str,
    address: Ipv4Addr,
    endpoint: &Endpoint,
    config: &WireguardConfig,
) -> String {
    format!(
        "[Interface]\n\
         PrivateKey = {private_key}\n\
         Address = {address}/32\n\
         DNS = {dns}\n\
         \n\
         [Peer]\n\
         PublicKey = {endpoint_key}\n\
         Endpoint = {host}:{port}\n\
         AllowedIPs = 0.0.0.0/0\n\
         PersistentKeepalive = 25\n",
        private_key = private_key,
        address = address,
        dns = config.dns.join(", "),
        endpoint_key = endpoint.public_key,
        host = endpoint.public_ip,
        port = endpoint.endpoint_port,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use wgvault_common::{now_epoch_secs, EndpointStatus};

    /// Channel that records commands and replays scripted outputs.
    struct ScriptedChannel {
        commands: StdMutex<Vec<String>>,
        outputs: StdMutex<Vec<Result<CommandOutput>>>,
    }

    impl ScriptedChannel {
        fn new(outputs: Vec<Result<CommandOutput>>) -> Self {
            Self {
                commands: StdMutex::new(Vec::new()),
                outputs: StdMutex::new(outputs),
            }
        }

        fn ok() -> Result<CommandOutput> {
            Ok(CommandOutput {
                code: 0,
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }

    #[async_trait]
    impl CommandChannel for ScriptedChannel {
        async fn exec(&self, command: &str) -> Result<CommandOutput> {
            self.commands.lock().unwrap().push(command.to_string());
            let mut outputs = self.outputs.lock().unwrap();
            if outputs.is_empty() {
                Self::ok()
            } else {
                outputs.remove(0)
            }
        }

        async fn close(&self) {}
    }

    fn endpoint() -> Endpoint {
        Endpoint {
            id: Uuid::new_v4(),
            name: "ep".into(),
            region: "us-east".into(),
            public_ip: "198.51.100.7".into(),
            public_key: "ugJvPBwy++vfwEl31oGjoio5Vx2T+DLvdPqfcuzyRU8=".into(),
            endpoint_port: 51820,
            ssh_host: "198.51.100.7".into(),
            ssh_user: "root".into(),
            ssh_key_path: "/tmp/id".into(),
            capacity: 10,
            current_load: 0,
            status: EndpointStatus::Active,
            created_at: now_epoch_secs(),
        }
    }

    #[tokio::test]
    async fn add_peer_sets_single_address_and_saves() {
        let channel = Arc::new(ScriptedChannel::new(vec![]));
        let manager = PeerManager::new(channel.clone(), "wg0".into());

        manager
            .add_peer("pubkey==", "10.8.0.2".parse().unwrap())
            .await
            .unwrap();

        let commands = channel.commands.lock().unwrap();
        assert_eq!(
            commands.as_slice(),
            &[
                "wg set wg0 peer pubkey== allowed-ips 10.8.0.2/32".to_string(),
                "wg-quick save wg0".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn nonzero_exit_maps_to_remote_command_error() {
        let channel = Arc::new(ScriptedChannel::new(vec![Ok(CommandOutput {
            code: 1,
            stdout: String::new(),
            stderr: "Unable to modify interface: Operation not permitted".into(),
        })]));
        let manager = PeerManager::new(channel, "wg0".into());

        let err = manager
            .add_peer("pubkey==", "10.8.0.2".parse().unwrap())
            .await
            .unwrap_err();
        match err {
            Error::RemoteCommand { stderr, .. } => {
                assert!(stderr.contains("not permitted"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn status_degrades_instead_of_failing() {
        let channel = Arc::new(ScriptedChannel::new(vec![Err(Error::RemoteConnect(
            "unreachable".into(),
        ))]));
        let manager = PeerManager::new(channel, "wg0".into());

        let health = manager.status().await;
        assert_eq!(health.peer_count, 0);
        assert_eq!(health.status, "error");
    }

    #[tokio::test]
    async fn status_parses_peer_count() {
        let channel = Arc::new(ScriptedChannel::new(vec![Ok(CommandOutput {
            code: 0,
            stdout: "17\n".into(),
            stderr: String::new(),
        })]));
        let manager = PeerManager::new(channel, "wg0".into());

        let health = manager.status().await;
        assert_eq!(health.peer_count, 17);
        assert_eq!(health.status, "active");
    }

    #[test]
    fn client_config_layout() {
        let config = WireguardConfig::default();
        let rendered = render_client_config(
            "PRIVATE",
            "10.8.0.5".parse().unwrap(),
            &endpoint(),
            &config,
        );
        assert!(rendered.starts_with("[Interface]\nPrivateKey = PRIVATE\n"));
        assert!(rendered.contains("Address = 10.8.0.5/32\n"));
        assert!(rendered.contains("DNS = 1.1.1.1, 8.8.8.8\n"));
        assert!(rendered.contains("Endpoint = 198.51.100.7:51820\n"));
        assert!(rendered.contains("AllowedIPs = 0.0.0.0/0\n"));
        assert!(rendered.contains("PersistentKeepalive = 25\n"));
    }
}
