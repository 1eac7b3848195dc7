//! CLI Commands

pub mod device;
pub mod license;
pub mod seed;
pub mod vpn;

use std::sync::Arc;
use tracing::debug;
use wgvault_common::{Database, KeySealer, ServiceConfig};
use wgvault_core::{LicenseEngine, Provisioner, SessionService, WgBackend};

/// Shared wiring for all commands.
pub struct Context {
    pub db: Database,
    pub config: ServiceConfig,
    pub licenses: LicenseEngine,
    pub sessions: SessionService,
    backend: Arc<WgBackend>,
}

impl Context {
    pub fn new(config: ServiceConfig) -> anyhow::Result<Self> {
        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::open(&config.db_path)?;
        debug!("Using state database at {}", config.db_path.display());
        let licenses = LicenseEngine::new(
            db.clone(),
            config.license.trial_max_uses,
            config.upgrade_url.clone(),
        );
        let sessions = SessionService::new(db.clone(), licenses.clone(), config.product.clone());
        let backend = Arc::new(WgBackend::new(config.wireguard.clone()));
        Ok(Self {
            db,
            config,
            licenses,
            sessions,
            backend,
        })
    }

    /// Provisioner requires the sealing key; built on demand so
    /// license admin commands work without one.
    pub fn provisioner(&self) -> anyhow::Result<Provisioner> {
        let sealer = KeySealer::from_hex(self.config.sealing_key()?)?;
        Ok(Provisioner::new(
            self.db.clone(),
            sealer,
            self.backend.clone(),
            self.config.wireguard.clone(),
            self.config.pool.clone(),
        ))
    }
}
