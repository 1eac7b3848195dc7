//! Device provisioning saga
//!
//! Creating a VPN identity spans three systems: the database record,
//! the endpoint's peer table, and the address pool. There is no
//! transaction across them, so ordering carries the consistency: the
//! device insert (which claims the pool slot) is the database commit
//! point, and a failure committing the peer remotely compensates by
//! deleting that row and releasing the slot. The allocator's view of
//! allocated addresses is driven by ACTIVE device rows, so a rolled
//! back or revoked device frees its address by construction.

use crate::allocator;
use crate::keys;
use crate::peers::{render_client_config, EndpointHealth, PeerBackend};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;
use wgvault_common::{
    db::is_unique_violation, now_epoch_secs, Database, Device, DeviceStatus, Endpoint, Error,
    KeySealer, PoolConfig, Result, WireguardConfig,
};

/// Client-facing endpoint coordinates. Management details (SSH) stay
/// server-side.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointInfo {
    pub region: String,
    pub public_ip: String,
    pub endpoint_port: u16,
}

impl From<&Endpoint> for EndpointInfo {
    fn from(endpoint: &Endpoint) -> Self {
        Self {
            region: endpoint.region.clone(),
            public_ip: endpoint.public_ip.clone(),
            endpoint_port: endpoint.endpoint_port,
        }
    }
}

/// A provisioned device plus its rendered client configuration. The
/// config embeds the plaintext private key and exists only on this
/// in-memory return path.
#[derive(Debug, Clone, Serialize)]
pub struct ProvisionedDevice {
    pub device: Device,
    pub endpoint: EndpointInfo,
    pub config: String,
}

/// Orchestrates allocator, key material, persistence, and the remote
/// peer backend.
#[derive(Clone)]
pub struct Provisioner {
    db: Database,
    sealer: KeySealer,
    peers: Arc<dyn PeerBackend>,
    wireguard: WireguardConfig,
    pool: PoolConfig,
}

impl Provisioner {
    pub fn new(
        db: Database,
        sealer: KeySealer,
        peers: Arc<dyn PeerBackend>,
        wireguard: WireguardConfig,
        pool: PoolConfig,
    ) -> Self {
        Self {
            db,
            sealer,
            peers,
            wireguard,
            pool,
        }
    }

    /// Provision a new device for a user and return its rendered
    /// client configuration.
    pub async fn provision(&self, user_id: Uuid, device_name: &str) -> Result<ProvisionedDevice> {
        let device_name = device_name.trim();
        if device_name.is_empty() || device_name.len() > 64 {
            return Err(Error::Validation(
                "device name must be 1-64 characters".to_string(),
            ));
        }

        let user = self
            .db
            .get_user(user_id)?
            .ok_or_else(|| Error::not_found("user", user_id))?;
        let tenant = self
            .db
            .get_tenant(user.tenant_id)?
            .ok_or_else(|| Error::not_found("tenant", user.tenant_id))?;

        let active = self.db.count_active_devices(user_id)?;
        if active >= tenant.max_devices_per_user {
            return Err(Error::DeviceLimitExceeded {
                limit: tenant.max_devices_per_user,
            });
        }

        let endpoint = self
            .db
            .least_loaded_endpoint()?
            .ok_or(Error::NoAvailableEndpoint)?;

        let keypair = keys::generate_keypair()?;
        let sealed = self.sealer.seal(&keypair.private_key)?;

        // Allocate and claim. A concurrent provisioner racing us to the
        // same address loses on the partial unique index and retries
        // against the updated allocated set.
        let mut device = None;
        for attempt in 0..2 {
            let allocated: HashSet<_> =
                self.db.active_device_ips(endpoint.id)?.into_iter().collect();
            let address = allocator::allocate(&allocated, self.pool.start, self.pool.end)
                .ok_or_else(|| Error::PoolExhausted {
                    endpoint: endpoint.name.clone(),
                })?;

            let candidate = Device {
                id: Uuid::new_v4(),
                user_id,
                endpoint_id: endpoint.id,
                name: device_name.to_string(),
                public_key: keypair.public_key.clone(),
                private_key_sealed: sealed.clone(),
                assigned_ip: address,
                status: DeviceStatus::Active,
                last_connected_at: None,
                created_at: now_epoch_secs(),
            };
            match self.db.insert_device_claiming_slot(&candidate) {
                Ok(()) => {
                    device = Some(candidate);
                    break;
                }
                Err(e) if is_unique_violation(&e) && attempt == 0 => {
                    warn!(
                        "Lost allocation race for {} on {}, retrying",
                        address, endpoint.name
                    );
                }
                Err(e) => return Err(e),
            }
        }
        let device = device.ok_or_else(|| Error::PoolExhausted {
            endpoint: endpoint.name.clone(),
        })?;

        // Remote commit. On failure the just-created row is rolled
        // back so no orphaned device is ever visible to the user.
        if let Err(e) = self
            .peers
            .add_peer(&endpoint, &device.public_key, device.assigned_ip)
            .await
        {
            warn!(
                "Peer commit for device {} failed, rolling back: {}",
                device.id, e
            );
            self.db.delete_device(device.id)?;
            self.db.free_pool_slot(endpoint.id, device.assigned_ip)?;
            self.db.adjust_endpoint_load(endpoint.id, -1)?;
            return Err(Error::ProvisioningFailed(Box::new(e)));
        }

        info!(
            "Provisioned device {} ({}) at {} on {}",
            device.id, device.name, device.assigned_ip, endpoint.name
        );

        let config = render_client_config(
            &keypair.private_key,
            device.assigned_ip,
            &endpoint,
            &self.wireguard,
        );
        Ok(ProvisionedDevice {
            endpoint: EndpointInfo::from(&endpoint),
            device,
            config,
        })
    }

    /// Tear down a device. Peer removal is best-effort: a stray remote
    /// peer is reconciled out of band and must not block the user.
    pub async fn deprovision(&self, device_id: Uuid, user_id: Uuid) -> Result<()> {
        let device = self
            .db
            .get_device_for_user(device_id, user_id, None)?
            .ok_or_else(|| Error::not_found("device", device_id))?;

        match self.db.get_endpoint(device.endpoint_id)? {
            Some(endpoint) => {
                if let Err(e) = self.peers.remove_peer(&endpoint, &device.public_key).await {
                    warn!(
                        "Failed to remove peer for device {}, continuing teardown: {}",
                        device.id, e
                    );
                }
            }
            None => warn!(
                "Device {} references missing endpoint {}, skipping peer removal",
                device.id, device.endpoint_id
            ),
        }

        let was_active = device.status == DeviceStatus::Active;
        self.db.set_device_status(device.id, DeviceStatus::Revoked)?;
        self.db.free_pool_slot(device.endpoint_id, device.assigned_ip)?;
        if was_active {
            self.db.adjust_endpoint_load(device.endpoint_id, -1)?;
        }

        info!("Deprovisioned device {} ({})", device.id, device.name);
        Ok(())
    }

    /// Active devices for a user with re-rendered client configs. The
    /// sealed key is opened transiently per device.
    pub fn list_active_devices(&self, user_id: Uuid) -> Result<Vec<ProvisionedDevice>> {
        let mut out = Vec::new();
        for device in self.db.list_active_devices(user_id)? {
            let endpoint = self
                .db
                .get_endpoint(device.endpoint_id)?
                .ok_or_else(|| Error::not_found("endpoint", device.endpoint_id))?;
            let private_key = self.sealer.open(&device.private_key_sealed)?;
            let config = render_client_config(
                &private_key,
                device.assigned_ip,
                &endpoint,
                &self.wireguard,
            );
            out.push(ProvisionedDevice {
                endpoint: EndpointInfo::from(&endpoint),
                device,
                config,
            });
        }
        Ok(out)
    }

    /// Config for one active device.
    pub fn device_config(&self, device_id: Uuid, user_id: Uuid) -> Result<ProvisionedDevice> {
        let device = self
            .db
            .get_device_for_user(device_id, user_id, Some(DeviceStatus::Active))?
            .ok_or_else(|| Error::not_found("device", device_id))?;
        let endpoint = self
            .db
            .get_endpoint(device.endpoint_id)?
            .ok_or_else(|| Error::not_found("endpoint", device.endpoint_id))?;
        let private_key = self.sealer.open(&device.private_key_sealed)?;
        let config =
            render_client_config(&private_key, device.assigned_ip, &endpoint, &self.wireguard);
        Ok(ProvisionedDevice {
            endpoint: EndpointInfo::from(&endpoint),
            device,
            config,
        })
    }

    /// Health of every endpoint, best-effort.
    pub async fn endpoint_status(&self) -> Result<Vec<(Endpoint, EndpointHealth)>> {
        let mut out = Vec::new();
        for endpoint in self.db.list_endpoints()? {
            let health = self.peers.endpoint_health(&endpoint).await;
            out.push((endpoint, health));
        }
        Ok(out)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use wgvault_common::{EndpointStatus, PoolSlotStatus};

    /// Peer backend that records calls and fails on demand.
    #[derive(Default)]
    pub struct MockBackend {
        pub fail_add: AtomicBool,
        pub fail_remove: AtomicBool,
        pub added: Mutex<Vec<(String, Ipv4Addr)>>,
        pub removed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PeerBackend for MockBackend {
        async fn add_peer(
            &self,
            _endpoint: &Endpoint,
            public_key: &str,
            address: Ipv4Addr,
        ) -> Result<()> {
            if self.fail_add.load(Ordering::SeqCst) {
                return Err(Error::RemoteCommand {
                    command: "wg set wg0 ...".into(),
                    stderr: "simulated failure".into(),
                });
            }
            self.added
                .lock()
                .unwrap()
                .push((public_key.to_string(), address));
            Ok(())
        }

        async fn remove_peer(&self, _endpoint: &Endpoint, public_key: &str) -> Result<()> {
            if self.fail_remove.load(Ordering::SeqCst) {
                return Err(Error::RemoteConnect("simulated outage".into()));
            }
            self.removed.lock().unwrap().push(public_key.to_string());
            Ok(())
        }

        async fn endpoint_health(&self, _endpoint: &Endpoint) -> EndpointHealth {
            EndpointHealth {
                peer_count: self.added.lock().unwrap().len() as u32,
                status: "active".into(),
            }
        }
    }

    pub struct Fixture {
        pub provisioner: Provisioner,
        pub backend: Arc<MockBackend>,
        pub db: Database,
        pub user_id: Uuid,
        pub tenant_id: Uuid,
        pub endpoint: Endpoint,
    }

    pub fn fixture(max_devices: u32, pool_end: &str) -> Fixture {
        let db = Database::open_memory().unwrap();
        let tenant = db.create_tenant("acme", max_devices).unwrap();
        let user = db.create_user(tenant.id, "dev@acme.test").unwrap();
        let endpoint = Endpoint {
            id: Uuid::new_v4(),
            name: "us-east-primary".into(),
            region: "us-east".into(),
            public_ip: "198.51.100.7".into(),
            public_key: "ugJvPBwy++vfwEl31oGjoio5Vx2T+DLvdPqfcuzyRU8=".into(),
            endpoint_port: 51820,
            ssh_host: "198.51.100.7".into(),
            ssh_user: "root".into(),
            ssh_key_path: "/tmp/id".into(),
            capacity: 100,
            current_load: 0,
            status: EndpointStatus::Active,
            created_at: now_epoch_secs(),
        };
        db.insert_endpoint(&endpoint).unwrap();

        let pool = PoolConfig {
            start: "10.8.0.2".parse().unwrap(),
            end: pool_end.parse().unwrap(),
            subnet: "10.8.0.0/24".into(),
        };
        db.seed_pool(endpoint.id, pool.start, pool.end).unwrap();

        let backend = Arc::new(MockBackend::default());
        let provisioner = Provisioner::new(
            db.clone(),
            KeySealer::from_bytes(&[1u8; 32]),
            backend.clone(),
            WireguardConfig::default(),
            pool,
        );
        Fixture {
            provisioner,
            backend,
            db,
            user_id: user.id,
            tenant_id: tenant.id,
            endpoint,
        }
    }

    #[tokio::test]
    async fn provision_allocates_ascending_until_exhausted() {
        let f = fixture(10, "10.8.0.4");

        let a = f.provisioner.provision(f.user_id, "laptop").await.unwrap();
        assert_eq!(a.device.assigned_ip, "10.8.0.2".parse::<Ipv4Addr>().unwrap());
        let b = f.provisioner.provision(f.user_id, "phone").await.unwrap();
        assert_eq!(b.device.assigned_ip, "10.8.0.3".parse::<Ipv4Addr>().unwrap());
        let c = f.provisioner.provision(f.user_id, "tablet").await.unwrap();
        assert_eq!(c.device.assigned_ip, "10.8.0.4".parse::<Ipv4Addr>().unwrap());

        let err = f.provisioner.provision(f.user_id, "tv").await.unwrap_err();
        assert!(matches!(err, Error::PoolExhausted { .. }));
    }

    #[tokio::test]
    async fn provision_renders_config_with_sealed_key_round_trip() {
        let f = fixture(10, "10.8.0.20");
        let provisioned = f.provisioner.provision(f.user_id, "laptop").await.unwrap();

        assert!(provisioned.config.contains("Address = 10.8.0.2/32"));
        assert!(provisioned.config.contains("Endpoint = 198.51.100.7:51820"));

        // Re-rendering from the sealed key must reproduce the config.
        let listed = f.provisioner.list_active_devices(f.user_id).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].config, provisioned.config);

        let single = f
            .provisioner
            .device_config(provisioned.device.id, f.user_id)
            .unwrap();
        assert_eq!(single.config, provisioned.config);
    }

    #[tokio::test]
    async fn device_cap_enforced() {
        let f = fixture(1, "10.8.0.20");
        f.provisioner.provision(f.user_id, "laptop").await.unwrap();
        let err = f.provisioner.provision(f.user_id, "phone").await.unwrap_err();
        assert!(matches!(err, Error::DeviceLimitExceeded { limit: 1 }));
    }

    #[tokio::test]
    async fn no_active_endpoint_fails_early() {
        let f = fixture(10, "10.8.0.20");
        // Saturate the only endpoint.
        f.db.adjust_endpoint_load(f.endpoint.id, 100).unwrap();
        let err = f.provisioner.provision(f.user_id, "laptop").await.unwrap_err();
        assert!(matches!(err, Error::NoAvailableEndpoint));
    }

    #[tokio::test]
    async fn remote_failure_compensates_fully() {
        let f = fixture(10, "10.8.0.20");
        f.backend.fail_add.store(true, Ordering::SeqCst);

        let err = f.provisioner.provision(f.user_id, "laptop").await.unwrap_err();
        match err {
            Error::ProvisioningFailed(inner) => {
                assert!(matches!(*inner, Error::RemoteCommand { .. }));
            }
            other => panic!("unexpected error: {}", other),
        }

        // No device row remains queryable.
        assert!(f.provisioner.list_active_devices(f.user_id).unwrap().is_empty());
        assert_eq!(f.db.count_active_devices(f.user_id).unwrap(), 0);

        // The address went back to the pool and the next attempt
        // receives it again.
        f.backend.fail_add.store(false, Ordering::SeqCst);
        let provisioned = f.provisioner.provision(f.user_id, "laptop").await.unwrap();
        assert_eq!(
            provisioned.device.assigned_ip,
            "10.8.0.2".parse::<Ipv4Addr>().unwrap()
        );
        // Endpoint load reflects exactly one live device.
        let endpoint = f.db.get_endpoint(f.endpoint.id).unwrap().unwrap();
        assert_eq!(endpoint.current_load, 1);
    }

    #[tokio::test]
    async fn deprovision_survives_remote_outage() {
        let f = fixture(10, "10.8.0.20");
        let provisioned = f.provisioner.provision(f.user_id, "laptop").await.unwrap();

        f.backend.fail_remove.store(true, Ordering::SeqCst);
        f.provisioner
            .deprovision(provisioned.device.id, f.user_id)
            .await
            .unwrap();

        // Device is revoked and its address is AVAILABLE again.
        let device = f
            .db
            .get_device_for_user(provisioned.device.id, f.user_id, None)
            .unwrap()
            .unwrap();
        assert_eq!(device.status, DeviceStatus::Revoked);
        let slot = f
            .db
            .pool_slot(f.endpoint.id, provisioned.device.assigned_ip)
            .unwrap()
            .unwrap();
        assert_eq!(slot.status, PoolSlotStatus::Available);

        // And the next provision reuses the freed address.
        let next = f.provisioner.provision(f.user_id, "phone").await.unwrap();
        assert_eq!(next.device.assigned_ip, provisioned.device.assigned_ip);
    }

    #[tokio::test]
    async fn deprovision_unknown_device_not_found() {
        let f = fixture(10, "10.8.0.20");
        let err = f
            .provisioner
            .deprovision(Uuid::new_v4(), f.user_id)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));

        // Devices are scoped to their owner.
        let other_user = f.db.create_user(f.tenant_id, "other@acme.test").unwrap();
        let provisioned = f.provisioner.provision(f.user_id, "laptop").await.unwrap();
        let err = f
            .provisioner
            .deprovision(provisioned.device.id, other_user.id)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn blank_device_name_rejected() {
        let f = fixture(10, "10.8.0.20");
        let err = f.provisioner.provision(f.user_id, "  ").await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
