//! License validation and usage metering
//!
//! Per-license state machine: ACTIVE -> EXPIRED happens lazily the
//! first time validation observes a past expiry (persisted through an
//! idempotent transition, separate from the read); ACTIVE -> REVOKED
//! is admin-only and terminal. Usage counts only move forward, via an
//! atomic in-place increment at the storage layer.

use rand::RngCore;
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;
use wgvault_common::{
    now_epoch_secs, Database, Error, License, LicenseDenial, LicenseFilter, LicenseStatus,
    PlanTier, Result,
};

/// Outcome of validating a key against a product.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "lowercase")]
pub enum Validation {
    Valid {
        license: License,
        /// None = unlimited.
        uses_remaining: Option<u32>,
    },
    Denied {
        reason: LicenseDenial,
        upgrade_url: String,
    },
}

impl Validation {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid { .. })
    }
}

/// Usage bound requested at license creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxUses {
    /// Take the plan's default cap.
    PlanDefault,
    Limited(u32),
    Unlimited,
}

/// Request for an admin-created license.
#[derive(Debug, Clone)]
pub struct CreateLicense {
    pub tenant_id: Uuid,
    pub product: String,
    pub plan: PlanTier,
    pub max_uses: MaxUses,
    pub expires_at: Option<i64>,
}

fn product_prefix(product: &str) -> &'static str {
    match product {
        "wgvault-vpn" => "wgv",
        _ => "lic",
    }
}

fn generate_key(product: &str, plan: PlanTier) -> String {
    let tier = if plan == PlanTier::Trial { "trial" } else { "live" };
    let mut random = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut random);
    format!("{}_{}_{}", product_prefix(product), tier, hex::encode(random))
}

/// Tracks entitlement state per tenant + product.
#[derive(Clone)]
pub struct LicenseEngine {
    db: Database,
    trial_max_uses: u32,
    upgrade_url: String,
}

impl LicenseEngine {
    pub fn new(db: Database, trial_max_uses: u32, upgrade_url: String) -> Self {
        Self {
            db,
            trial_max_uses,
            upgrade_url,
        }
    }

    fn plan_default_max_uses(&self, plan: PlanTier) -> Option<u32> {
        match plan {
            PlanTier::Trial => Some(self.trial_max_uses),
            PlanTier::Starter => Some(100),
            PlanTier::Pro | PlanTier::Enterprise => None,
        }
    }

    /// Create a new license key for a tenant + product.
    pub fn create(&self, request: CreateLicense) -> Result<License> {
        if self.db.get_tenant(request.tenant_id)?.is_none() {
            return Err(Error::not_found("tenant", request.tenant_id));
        }

        let max_uses = match request.max_uses {
            MaxUses::PlanDefault => self.plan_default_max_uses(request.plan),
            MaxUses::Limited(n) => Some(n),
            MaxUses::Unlimited => None,
        };

        let license = License {
            id: Uuid::new_v4(),
            key: generate_key(&request.product, request.plan),
            tenant_id: request.tenant_id,
            product: request.product,
            plan: request.plan,
            max_uses,
            used_count: 0,
            expires_at: request.expires_at,
            status: LicenseStatus::Active,
            created_at: now_epoch_secs(),
        };
        self.db.insert_license(&license)?;
        info!(
            "Created {} license {} for tenant {}",
            license.plan, license.key, license.tenant_id
        );
        Ok(license)
    }

    /// Validate a key before allowing a connect. Does not touch the
    /// usage counter; call `increment_usage` after success.
    pub fn validate(&self, key: &str, product: &str) -> Result<Validation> {
        let Some(license) = self.db.get_license_by_key(key)? else {
            return Ok(self.denied(LicenseDenial::Invalid));
        };

        if license.product != product {
            return Ok(self.denied(LicenseDenial::WrongProduct));
        }

        if license.status == LicenseStatus::Revoked {
            return Ok(self.denied(LicenseDenial::Revoked));
        }

        let expired_by_clock = license
            .expires_at
            .is_some_and(|at| at < now_epoch_secs());
        if license.status == LicenseStatus::Expired || expired_by_clock {
            if expired_by_clock && license.status == LicenseStatus::Active {
                self.db.mark_license_expired(license.id)?;
                debug!("License {} transitioned to EXPIRED", license.key);
            }
            return Ok(self.denied(LicenseDenial::Expired));
        }

        if let Some(max_uses) = license.max_uses {
            if license.used_count >= max_uses {
                // Reason is trial_exhausted for every tier's cap.
                return Ok(self.denied(LicenseDenial::TrialExhausted));
            }
        }

        let uses_remaining = license.uses_remaining();
        Ok(Validation::Valid {
            license,
            uses_remaining,
        })
    }

    fn denied(&self, reason: LicenseDenial) -> Validation {
        Validation::Denied {
            reason,
            upgrade_url: self.upgrade_url.clone(),
        }
    }

    /// Atomically bump the usage counter after a successful connect.
    pub fn increment_usage(&self, key: &str) -> Result<()> {
        self.db.increment_license_usage(key)
    }

    /// Revoke a key immediately. Terminal.
    pub fn revoke(&self, key: &str) -> Result<License> {
        let license = self
            .db
            .get_license_by_key(key)?
            .ok_or_else(|| Error::not_found("license", key))?;
        self.db.mark_license_revoked(license.id)?;
        info!("Revoked license {}", key);
        self.db
            .get_license_by_key(key)?
            .ok_or_else(|| Error::not_found("license", key))
    }

    pub fn list(&self, filter: &LicenseFilter) -> Result<Vec<License>> {
        self.db.list_licenses(filter)
    }

    pub fn get_by_key(&self, key: &str) -> Result<License> {
        self.db
            .get_license_by_key(key)?
            .ok_or_else(|| Error::not_found("license", key))
    }

    /// Existing ACTIVE license for the tenant + product
    /// (earliest-created wins), else a fresh auto-provisioned trial.
    pub fn get_or_create_trial(&self, tenant_id: Uuid, product: &str) -> Result<License> {
        if let Some(existing) = self.db.earliest_active_license(tenant_id, product)? {
            return Ok(existing);
        }
        self.create(CreateLicense {
            tenant_id,
            product: product.to_string(),
            plan: PlanTier::Trial,
            max_uses: MaxUses::PlanDefault,
            expires_at: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRODUCT: &str = "wgvault-vpn";

    fn engine() -> (LicenseEngine, Uuid) {
        let db = Database::open_memory().unwrap();
        let tenant = db.create_tenant("acme", 5).unwrap();
        (
            LicenseEngine::new(db, 3, "https://wgvault.dev/upgrade".into()),
            tenant.id,
        )
    }

    fn trial(engine: &LicenseEngine, tenant_id: Uuid) -> License {
        engine
            .create(CreateLicense {
                tenant_id,
                product: PRODUCT.into(),
                plan: PlanTier::Trial,
                max_uses: MaxUses::PlanDefault,
                expires_at: None,
            })
            .unwrap()
    }

    fn reason(v: &Validation) -> LicenseDenial {
        match v {
            Validation::Denied { reason, .. } => *reason,
            Validation::Valid { .. } => panic!("expected denial"),
        }
    }

    #[test]
    fn key_format() {
        let license = {
            let (engine, tenant_id) = engine();
            trial(&engine, tenant_id)
        };
        let parts: Vec<_> = license.key.splitn(3, '_').collect();
        assert_eq!(parts[0], "wgv");
        assert_eq!(parts[1], "trial");
        assert_eq!(parts[2].len(), 48);

        let (engine, tenant_id) = engine();
        let live = engine
            .create(CreateLicense {
                tenant_id,
                product: PRODUCT.into(),
                plan: PlanTier::Pro,
                max_uses: MaxUses::PlanDefault,
                expires_at: None,
            })
            .unwrap();
        assert!(live.key.starts_with("wgv_live_"));
        assert_eq!(live.max_uses, None);
    }

    #[test]
    fn unknown_key_is_invalid() {
        let (engine, _) = engine();
        let v = engine.validate("wgv_trial_missing", PRODUCT).unwrap();
        assert_eq!(reason(&v), LicenseDenial::Invalid);
    }

    #[test]
    fn wrong_product_denied() {
        let (engine, tenant_id) = engine();
        let license = trial(&engine, tenant_id);
        let v = engine.validate(&license.key, "other-product").unwrap();
        assert_eq!(reason(&v), LicenseDenial::WrongProduct);
    }

    #[test]
    fn revoked_is_terminal() {
        let (engine, tenant_id) = engine();
        let license = trial(&engine, tenant_id);
        engine.revoke(&license.key).unwrap();
        let v = engine.validate(&license.key, PRODUCT).unwrap();
        assert_eq!(reason(&v), LicenseDenial::Revoked);
    }

    #[test]
    fn lazy_expiry_is_one_way() {
        let (engine, tenant_id) = engine();
        let license = engine
            .create(CreateLicense {
                tenant_id,
                product: PRODUCT.into(),
                plan: PlanTier::Starter,
                max_uses: MaxUses::PlanDefault,
                expires_at: Some(now_epoch_secs() - 60),
            })
            .unwrap();

        let v = engine.validate(&license.key, PRODUCT).unwrap();
        assert_eq!(reason(&v), LicenseDenial::Expired);
        let stored = engine.get_by_key(&license.key).unwrap();
        assert_eq!(stored.status, LicenseStatus::Expired);

        // Stays EXPIRED on subsequent validations.
        let v = engine.validate(&license.key, PRODUCT).unwrap();
        assert_eq!(reason(&v), LicenseDenial::Expired);
        assert_eq!(
            engine.get_by_key(&license.key).unwrap().status,
            LicenseStatus::Expired
        );
    }

    #[test]
    fn cap_reached_reports_trial_exhausted() {
        let (engine, tenant_id) = engine();
        let license = trial(&engine, tenant_id);
        for _ in 0..3 {
            engine.increment_usage(&license.key).unwrap();
        }
        let v = engine.validate(&license.key, PRODUCT).unwrap();
        assert_eq!(reason(&v), LicenseDenial::TrialExhausted);

        // Paid caps reuse the same reason.
        let starter = engine
            .create(CreateLicense {
                tenant_id,
                product: PRODUCT.into(),
                plan: PlanTier::Starter,
                max_uses: MaxUses::Limited(1),
                expires_at: None,
            })
            .unwrap();
        engine.increment_usage(&starter.key).unwrap();
        let v = engine.validate(&starter.key, PRODUCT).unwrap();
        assert_eq!(reason(&v), LicenseDenial::TrialExhausted);
    }

    #[test]
    fn valid_license_reports_remaining() {
        let (engine, tenant_id) = engine();
        let license = trial(&engine, tenant_id);
        engine.increment_usage(&license.key).unwrap();

        match engine.validate(&license.key, PRODUCT).unwrap() {
            Validation::Valid { uses_remaining, .. } => {
                assert_eq!(uses_remaining, Some(2));
            }
            Validation::Denied { reason, .. } => panic!("denied: {}", reason),
        }

        let unlimited = engine
            .create(CreateLicense {
                tenant_id,
                product: PRODUCT.into(),
                plan: PlanTier::Enterprise,
                max_uses: MaxUses::PlanDefault,
                expires_at: None,
            })
            .unwrap();
        match engine.validate(&unlimited.key, PRODUCT).unwrap() {
            Validation::Valid { uses_remaining, .. } => assert_eq!(uses_remaining, None),
            Validation::Denied { reason, .. } => panic!("denied: {}", reason),
        }
    }

    #[test]
    fn get_or_create_trial_prefers_earliest_active() {
        let (engine, tenant_id) = engine();
        let first = engine.get_or_create_trial(tenant_id, PRODUCT).unwrap();
        let again = engine.get_or_create_trial(tenant_id, PRODUCT).unwrap();
        assert_eq!(first.id, again.id);

        // A revoked license no longer counts as the tenant default.
        engine.revoke(&first.key).unwrap();
        let fresh = engine.get_or_create_trial(tenant_id, PRODUCT).unwrap();
        assert_ne!(fresh.id, first.id);
        assert_eq!(fresh.plan, PlanTier::Trial);
        assert_eq!(fresh.max_uses, Some(3));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_increments_count_exactly() {
        let (engine, tenant_id) = engine();
        let license = engine
            .create(CreateLicense {
                tenant_id,
                product: PRODUCT.into(),
                plan: PlanTier::Pro,
                max_uses: MaxUses::Unlimited,
                expires_at: None,
            })
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..32 {
            let engine = engine.clone();
            let key = license.key.clone();
            handles.push(tokio::spawn(async move {
                engine.increment_usage(&key).unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(engine.get_by_key(&license.key).unwrap().used_count, 32);
    }
}
