//! Session lifecycle
//!
//! Connects are gated by the license engine before any session row is
//! written. Metering runs after the session exists and is best-effort:
//! the user is already connected, so a failed increment is logged and
//! reconciled out of band rather than surfaced.

use crate::license::{LicenseEngine, Validation};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;
use wgvault_common::{
    now_epoch_secs, Database, DeviceStatus, Error, Result, Session, SessionStatus,
};

/// Result of a successful connect.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectOutcome {
    pub session: Session,
    /// Key the connect was metered against.
    pub license_key: String,
    /// None = unlimited.
    pub uses_remaining: Option<u32>,
}

/// Records connect/disconnect events for devices.
#[derive(Clone)]
pub struct SessionService {
    db: Database,
    licenses: LicenseEngine,
    product: String,
}

impl SessionService {
    pub fn new(db: Database, licenses: LicenseEngine, product: String) -> Self {
        Self {
            db,
            licenses,
            product,
        }
    }

    /// Open a session for a device. `license_key` falls back to the
    /// tenant's default (auto-provisioned trial on first use).
    pub fn connect(
        &self,
        device_id: Uuid,
        user_id: Uuid,
        license_key: Option<&str>,
    ) -> Result<ConnectOutcome> {
        let user = self
            .db
            .get_user(user_id)?
            .ok_or_else(|| Error::not_found("user", user_id))?;

        let key = match license_key {
            Some(key) => key.to_string(),
            None => {
                self.licenses
                    .get_or_create_trial(user.tenant_id, &self.product)?
                    .key
            }
        };

        // License gate. Must short-circuit before any session exists.
        let uses_remaining = match self.licenses.validate(&key, &self.product)? {
            Validation::Valid { uses_remaining, .. } => uses_remaining,
            Validation::Denied {
                reason,
                upgrade_url,
            } => {
                return Err(Error::LicenseGate {
                    reason,
                    upgrade_url,
                })
            }
        };

        let device = self
            .db
            .get_device_for_user(device_id, user_id, Some(DeviceStatus::Active))?
            .ok_or_else(|| Error::not_found("device", device_id))?;

        let session = Session {
            id: Uuid::new_v4(),
            device_id: device.id,
            endpoint_id: device.endpoint_id,
            tenant_id: user.tenant_id,
            status: SessionStatus::Active,
            connected_at: now_epoch_secs(),
            disconnected_at: None,
        };
        self.db.insert_session(&session)?;
        self.db
            .touch_device_last_connected(device.id, session.connected_at)?;

        // Best-effort metering; never unwinds the connection.
        if let Err(e) = self.licenses.increment_usage(&key) {
            warn!("Failed to increment usage for license {}: {}", key, e);
        }

        info!("Device {} connected (session {})", device.id, session.id);
        Ok(ConnectOutcome {
            session,
            license_key: key,
            uses_remaining,
        })
    }

    /// Close the device's most recent active session.
    pub fn disconnect(&self, device_id: Uuid, user_id: Uuid) -> Result<Session> {
        let device = self
            .db
            .get_device_for_user(device_id, user_id, None)?
            .ok_or_else(|| Error::not_found("device", device_id))?;

        let mut session = self
            .db
            .latest_active_session(device.id)?
            .ok_or_else(|| Error::NoActiveSession {
                device: device.id.to_string(),
            })?;

        let at = now_epoch_secs();
        self.db.close_session(session.id, at)?;
        session.status = SessionStatus::Disconnected;
        session.disconnected_at = Some(at);

        info!("Device {} disconnected (session {})", device.id, session.id);
        Ok(session)
    }

    /// Active sessions across all of the user's devices.
    pub fn active_sessions(&self, user_id: Uuid) -> Result<Vec<Session>> {
        self.db.active_sessions_for_user(user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::license::{CreateLicense, MaxUses};
    use crate::provision::tests::fixture;
    use wgvault_common::{LicenseDenial, PlanTier};

    const PRODUCT: &str = "wgvault-vpn";

    struct Setup {
        sessions: SessionService,
        licenses: LicenseEngine,
        db: Database,
        user_id: Uuid,
        tenant_id: Uuid,
        device_id: Uuid,
    }

    async fn setup(trial_max_uses: u32) -> Setup {
        let f = fixture(10, "10.8.0.20");
        let provisioned = f.provisioner.provision(f.user_id, "laptop").await.unwrap();
        let licenses = LicenseEngine::new(
            f.db.clone(),
            trial_max_uses,
            "https://wgvault.dev/upgrade".into(),
        );
        let sessions = SessionService::new(f.db.clone(), licenses.clone(), PRODUCT.into());
        Setup {
            sessions,
            licenses,
            db: f.db,
            user_id: f.user_id,
            tenant_id: f.tenant_id,
            device_id: provisioned.device.id,
        }
    }

    #[tokio::test]
    async fn connect_auto_provisions_trial_and_meters() {
        let s = setup(3).await;

        let outcome = s.sessions.connect(s.device_id, s.user_id, None).unwrap();
        assert!(outcome.license_key.starts_with("wgv_trial_"));
        assert_eq!(outcome.uses_remaining, Some(3));

        let license = s.licenses.get_by_key(&outcome.license_key).unwrap();
        assert_eq!(license.used_count, 1);

        // Device's last-connected timestamp is maintained.
        let device = s
            .db
            .get_device_for_user(s.device_id, s.user_id, None)
            .unwrap()
            .unwrap();
        assert!(device.last_connected_at.is_some());
    }

    #[tokio::test]
    async fn wrong_product_fails_before_session_creation() {
        let s = setup(3).await;
        let foreign = s
            .licenses
            .create(CreateLicense {
                tenant_id: s.tenant_id,
                product: "other-product".into(),
                plan: PlanTier::Pro,
                max_uses: MaxUses::Unlimited,
                expires_at: None,
            })
            .unwrap();

        let err = s
            .sessions
            .connect(s.device_id, s.user_id, Some(&foreign.key))
            .unwrap_err();
        match err {
            Error::LicenseGate { reason, .. } => {
                assert_eq!(reason, LicenseDenial::WrongProduct);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(s.sessions.active_sessions(s.user_id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn exhausted_trial_blocks_connect() {
        let s = setup(1).await;

        s.sessions.connect(s.device_id, s.user_id, None).unwrap();
        let err = s.sessions.connect(s.device_id, s.user_id, None).unwrap_err();
        match err {
            Error::LicenseGate { reason, .. } => {
                assert_eq!(reason, LicenseDenial::TrialExhausted);
            }
            other => panic!("unexpected error: {}", other),
        }
        // The refused connect left no session behind; the first one is
        // still the only active session.
        assert_eq!(s.sessions.active_sessions(s.user_id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn disconnect_closes_most_recent_session() {
        let s = setup(5).await;

        s.sessions.connect(s.device_id, s.user_id, None).unwrap();
        let closed = s.sessions.disconnect(s.device_id, s.user_id).unwrap();
        assert_eq!(closed.status, SessionStatus::Disconnected);
        assert!(closed.disconnected_at.is_some());

        let err = s.sessions.disconnect(s.device_id, s.user_id).unwrap_err();
        assert!(matches!(err, Error::NoActiveSession { .. }));
    }

    #[tokio::test]
    async fn multiple_active_sessions_permitted() {
        // No single-session invariant is enforced at connect time.
        let s = setup(5).await;
        s.sessions.connect(s.device_id, s.user_id, None).unwrap();
        s.sessions.connect(s.device_id, s.user_id, None).unwrap();
        assert_eq!(s.sessions.active_sessions(s.user_id).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn revoked_device_cannot_connect() {
        let s = setup(5).await;
        s.db.set_device_status(s.device_id, DeviceStatus::Revoked)
            .unwrap();
        let err = s.sessions.connect(s.device_id, s.user_id, None).unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }
}
