//! Core entity types for WgVault
//!
//! Entities mirror the persisted schema in `db`. Timestamps are unix
//! epoch seconds. Status enums round-trip through their lowercase (or
//! uppercase, for plan tiers) TEXT column form.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use uuid::Uuid;

/// Current unix time in epoch seconds.
pub fn now_epoch_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

// ============================================================================
// Tenant and user
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    /// Per-user device cap enforced at provisioning time.
    pub max_devices_per_user: u32,
    pub status: TenantStatus,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
    Active,
    Suspended,
}

impl std::fmt::Display for TenantStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Suspended => write!(f, "suspended"),
        }
    }
}

impl std::str::FromStr for TenantStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "suspended" => Ok(Self::Suspended),
            _ => Err(format!("unknown tenant status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub email: String,
    pub created_at: i64,
}

// ============================================================================
// Endpoint (tunnel server)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointStatus {
    Active,
    Inactive,
}

impl std::fmt::Display for EndpointStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Inactive => write!(f, "inactive"),
        }
    }
}

impl std::str::FromStr for EndpointStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            _ => Err(format!("unknown endpoint status: {}", s)),
        }
    }
}

/// A remote host running the WireGuard daemon that devices connect to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: Uuid,
    pub name: String,
    pub region: String,
    /// Public address clients dial.
    pub public_ip: String,
    /// The endpoint's WireGuard public key (base64).
    pub public_key: String,
    pub endpoint_port: u16,
    /// Management channel coordinates.
    pub ssh_host: String,
    pub ssh_user: String,
    pub ssh_key_path: String,
    pub capacity: u32,
    pub current_load: u32,
    pub status: EndpointStatus,
    pub created_at: i64,
}

// ============================================================================
// Device
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Active,
    Revoked,
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Revoked => write!(f, "revoked"),
        }
    }
}

impl std::str::FromStr for DeviceStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "revoked" => Ok(Self::Revoked),
            _ => Err(format!("unknown device status: {}", s)),
        }
    }
}

/// One provisioned VPN identity bound to a user.
///
/// The private key is stored sealed (`crypto::KeySealer`) and is only
/// opened transiently when rendering a client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: Uuid,
    pub user_id: Uuid,
    pub endpoint_id: Uuid,
    pub name: String,
    /// WireGuard public key (base64).
    pub public_key: String,
    /// Sealed private key, base64(nonce || ciphertext).
    pub private_key_sealed: String,
    pub assigned_ip: Ipv4Addr,
    pub status: DeviceStatus,
    pub last_connected_at: Option<i64>,
    pub created_at: i64,
}

// ============================================================================
// IP pool
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolSlotStatus {
    Available,
    Allocated,
}

impl std::fmt::Display for PoolSlotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Available => write!(f, "available"),
            Self::Allocated => write!(f, "allocated"),
        }
    }
}

impl std::str::FromStr for PoolSlotStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(Self::Available),
            "allocated" => Ok(Self::Allocated),
            _ => Err(format!("unknown pool slot status: {}", s)),
        }
    }
}

/// One assignable tunnel address on an endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSlot {
    pub endpoint_id: Uuid,
    pub address: Ipv4Addr,
    pub status: PoolSlotStatus,
    pub device_id: Option<Uuid>,
    pub allocated_at: Option<i64>,
}

// ============================================================================
// Session
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Disconnected,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "disconnected" => Ok(Self::Disconnected),
            _ => Err(format!("unknown session status: {}", s)),
        }
    }
}

/// One connect-to-disconnect interval for a device on an endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub device_id: Uuid,
    pub endpoint_id: Uuid,
    pub tenant_id: Uuid,
    pub status: SessionStatus,
    pub connected_at: i64,
    pub disconnected_at: Option<i64>,
}

// ============================================================================
// License
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PlanTier {
    Trial,
    Starter,
    Pro,
    Enterprise,
}

impl std::fmt::Display for PlanTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trial => write!(f, "TRIAL"),
            Self::Starter => write!(f, "STARTER"),
            Self::Pro => write!(f, "PRO"),
            Self::Enterprise => write!(f, "ENTERPRISE"),
        }
    }
}

impl std::str::FromStr for PlanTier {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TRIAL" => Ok(Self::Trial),
            "STARTER" => Ok(Self::Starter),
            "PRO" => Ok(Self::Pro),
            "ENTERPRISE" => Ok(Self::Enterprise),
            _ => Err(format!("unknown plan tier: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LicenseStatus {
    Active,
    Expired,
    Revoked,
}

impl std::fmt::Display for LicenseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "ACTIVE"),
            Self::Expired => write!(f, "EXPIRED"),
            Self::Revoked => write!(f, "REVOKED"),
        }
    }
}

impl std::str::FromStr for LicenseStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(Self::Active),
            "EXPIRED" => Ok(Self::Expired),
            "REVOKED" => Ok(Self::Revoked),
            _ => Err(format!("unknown license status: {}", s)),
        }
    }
}

/// Entitlement record gating how many connects a tenant/product pair
/// may make.
///
/// `used_count` only ever increases. REVOKED is terminal; EXPIRED is
/// entered lazily the first time validation observes a past expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct License {
    pub id: Uuid,
    pub key: String,
    pub tenant_id: Uuid,
    pub product: String,
    pub plan: PlanTier,
    /// None = unlimited.
    pub max_uses: Option<u32>,
    pub used_count: u32,
    pub expires_at: Option<i64>,
    pub status: LicenseStatus,
    pub created_at: i64,
}

impl License {
    /// Remaining uses, clamped at zero. None = unlimited.
    pub fn uses_remaining(&self) -> Option<u32> {
        self.max_uses.map(|m| m.saturating_sub(self.used_count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_enums_round_trip() {
        for s in ["active", "revoked"] {
            let parsed: DeviceStatus = s.parse().unwrap();
            assert_eq!(parsed.to_string(), s);
        }
        for s in ["TRIAL", "STARTER", "PRO", "ENTERPRISE"] {
            let parsed: PlanTier = s.parse().unwrap();
            assert_eq!(parsed.to_string(), s);
        }
        assert!("bogus".parse::<LicenseStatus>().is_err());
    }

    #[test]
    fn uses_remaining_clamps() {
        let mut license = License {
            id: Uuid::new_v4(),
            key: "wgv_trial_00".into(),
            tenant_id: Uuid::new_v4(),
            product: "wgvault-vpn".into(),
            plan: PlanTier::Trial,
            max_uses: Some(3),
            used_count: 5,
            expires_at: None,
            status: LicenseStatus::Active,
            created_at: 0,
        };
        assert_eq!(license.uses_remaining(), Some(0));
        license.max_uses = None;
        assert_eq!(license.uses_remaining(), None);
    }
}
