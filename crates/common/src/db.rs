//! SQLite persistence for WgVault
//!
//! Tables:
//! - tenants: billing boundary, holds the per-user device cap
//! - users: identity anchor (auth lives outside this service)
//! - endpoints: WireGuard servers with capacity and management coords
//! - devices: provisioned VPN identities, logical delete via status
//! - ip_pool: assignable tunnel addresses per endpoint
//! - sessions: connect/disconnect intervals
//! - licenses: entitlement records with atomic usage counters
//!
//! Device/address uniqueness is backed by a partial unique index on
//! (endpoint_id, assigned_ip) for ACTIVE devices so a losing writer in
//! an allocation race gets a constraint violation and can retry.

use crate::types::*;
use crate::{Error, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Database wrapper for state persistence
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

/// True if the error is a SQLite uniqueness/constraint violation, as
/// raised when two writers race for the same (endpoint, address) slot.
pub fn is_unique_violation(err: &Error) -> bool {
    match err {
        Error::Database(rusqlite::Error::SqliteFailure(e, _)) => {
            e.code == rusqlite::ErrorCode::ConstraintViolation
        }
        _ => false,
    }
}

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;

        // WAL for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            -- Tenants
            CREATE TABLE IF NOT EXISTS tenants (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                max_devices_per_user INTEGER NOT NULL DEFAULT 5,
                status TEXT NOT NULL DEFAULT 'active',
                created_at INTEGER NOT NULL
            );

            -- Users
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                email TEXT NOT NULL UNIQUE,
                created_at INTEGER NOT NULL,
                FOREIGN KEY(tenant_id) REFERENCES tenants(id)
            );
            CREATE INDEX IF NOT EXISTS idx_users_tenant ON users(tenant_id);

            -- Endpoints
            CREATE TABLE IF NOT EXISTS endpoints (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                region TEXT NOT NULL,
                public_ip TEXT NOT NULL,
                public_key TEXT NOT NULL,
                endpoint_port INTEGER NOT NULL DEFAULT 51820,
                ssh_host TEXT NOT NULL,
                ssh_user TEXT NOT NULL DEFAULT 'root',
                ssh_key_path TEXT NOT NULL,
                capacity INTEGER NOT NULL,
                current_load INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'active',
                created_at INTEGER NOT NULL
            );

            -- Devices
            CREATE TABLE IF NOT EXISTS devices (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                endpoint_id TEXT NOT NULL,
                name TEXT NOT NULL,
                public_key TEXT NOT NULL,
                private_key_sealed TEXT NOT NULL,
                assigned_ip TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                last_connected_at INTEGER,
                created_at INTEGER NOT NULL,
                FOREIGN KEY(user_id) REFERENCES users(id),
                FOREIGN KEY(endpoint_id) REFERENCES endpoints(id)
            );
            CREATE INDEX IF NOT EXISTS idx_devices_user ON devices(user_id);
            CREATE INDEX IF NOT EXISTS idx_devices_endpoint ON devices(endpoint_id);
            -- At most one ACTIVE device may hold an address on an endpoint.
            CREATE UNIQUE INDEX IF NOT EXISTS idx_devices_active_ip
                ON devices(endpoint_id, assigned_ip) WHERE status = 'active';

            -- IP pool
            CREATE TABLE IF NOT EXISTS ip_pool (
                endpoint_id TEXT NOT NULL,
                address TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'available',
                device_id TEXT,
                allocated_at INTEGER,
                PRIMARY KEY (endpoint_id, address),
                FOREIGN KEY(endpoint_id) REFERENCES endpoints(id)
            );

            -- Sessions
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                device_id TEXT NOT NULL,
                endpoint_id TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                connected_at INTEGER NOT NULL,
                disconnected_at INTEGER,
                FOREIGN KEY(device_id) REFERENCES devices(id)
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_device ON sessions(device_id);
            CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);

            -- Licenses
            CREATE TABLE IF NOT EXISTS licenses (
                id TEXT PRIMARY KEY,
                key TEXT NOT NULL UNIQUE,
                tenant_id TEXT NOT NULL,
                product TEXT NOT NULL,
                plan TEXT NOT NULL DEFAULT 'TRIAL',
                max_uses INTEGER,
                used_count INTEGER NOT NULL DEFAULT 0,
                expires_at INTEGER,
                status TEXT NOT NULL DEFAULT 'ACTIVE',
                created_at INTEGER NOT NULL,
                FOREIGN KEY(tenant_id) REFERENCES tenants(id)
            );
            CREATE INDEX IF NOT EXISTS idx_licenses_key ON licenses(key);
            CREATE INDEX IF NOT EXISTS idx_licenses_tenant ON licenses(tenant_id, product);
            "#,
        )?;

        Ok(())
    }

    // ========================================================================
    // Tenant operations
    // ========================================================================

    pub fn create_tenant(&self, name: &str, max_devices_per_user: u32) -> Result<Tenant> {
        let tenant = Tenant {
            id: Uuid::new_v4(),
            name: name.to_string(),
            max_devices_per_user,
            status: TenantStatus::Active,
            created_at: now_epoch_secs(),
        };
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO tenants (id, name, max_devices_per_user, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                tenant.id.to_string(),
                tenant.name,
                tenant.max_devices_per_user,
                tenant.status.to_string(),
                tenant.created_at,
            ],
        )?;
        Ok(tenant)
    }

    pub fn get_tenant(&self, id: Uuid) -> Result<Option<Tenant>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, name, max_devices_per_user, status, created_at
             FROM tenants WHERE id = ?1",
            params![id.to_string()],
            |row| {
                Ok(Tenant {
                    id: Uuid::parse_str(&row.get::<_, String>(0)?).unwrap(),
                    name: row.get(1)?,
                    max_devices_per_user: row.get(2)?,
                    status: row.get::<_, String>(3)?.parse().unwrap(),
                    created_at: row.get(4)?,
                })
            },
        )
        .optional()
        .map_err(Error::from)
    }

    // ========================================================================
    // User operations
    // ========================================================================

    pub fn create_user(&self, tenant_id: Uuid, email: &str) -> Result<User> {
        let user = User {
            id: Uuid::new_v4(),
            tenant_id,
            email: email.to_string(),
            created_at: now_epoch_secs(),
        };
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO users (id, tenant_id, email, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                user.id.to_string(),
                user.tenant_id.to_string(),
                user.email,
                user.created_at,
            ],
        )?;
        Ok(user)
    }

    pub fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, tenant_id, email, created_at FROM users WHERE id = ?1",
            params![id.to_string()],
            |row| {
                Ok(User {
                    id: Uuid::parse_str(&row.get::<_, String>(0)?).unwrap(),
                    tenant_id: Uuid::parse_str(&row.get::<_, String>(1)?).unwrap(),
                    email: row.get(2)?,
                    created_at: row.get(3)?,
                })
            },
        )
        .optional()
        .map_err(Error::from)
    }

    // ========================================================================
    // Endpoint operations
    // ========================================================================

    pub fn insert_endpoint(&self, endpoint: &Endpoint) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO endpoints (id, name, region, public_ip, public_key, endpoint_port,
                                    ssh_host, ssh_user, ssh_key_path, capacity, current_load,
                                    status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                endpoint.id.to_string(),
                endpoint.name,
                endpoint.region,
                endpoint.public_ip,
                endpoint.public_key,
                endpoint.endpoint_port,
                endpoint.ssh_host,
                endpoint.ssh_user,
                endpoint.ssh_key_path,
                endpoint.capacity,
                endpoint.current_load,
                endpoint.status.to_string(),
                endpoint.created_at,
            ],
        )?;
        Ok(())
    }

    fn endpoint_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Endpoint> {
        Ok(Endpoint {
            id: Uuid::parse_str(&row.get::<_, String>(0)?).unwrap(),
            name: row.get(1)?,
            region: row.get(2)?,
            public_ip: row.get(3)?,
            public_key: row.get(4)?,
            endpoint_port: row.get(5)?,
            ssh_host: row.get(6)?,
            ssh_user: row.get(7)?,
            ssh_key_path: row.get(8)?,
            capacity: row.get(9)?,
            current_load: row.get(10)?,
            status: row.get::<_, String>(11)?.parse().unwrap(),
            created_at: row.get(12)?,
        })
    }

    const ENDPOINT_COLS: &'static str = "id, name, region, public_ip, public_key, endpoint_port, \
         ssh_host, ssh_user, ssh_key_path, capacity, current_load, status, created_at";

    pub fn get_endpoint(&self, id: Uuid) -> Result<Option<Endpoint>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!(
                "SELECT {} FROM endpoints WHERE id = ?1",
                Self::ENDPOINT_COLS
            ),
            params![id.to_string()],
            Self::endpoint_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    pub fn list_endpoints(&self) -> Result<Vec<Endpoint>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM endpoints ORDER BY name",
            Self::ENDPOINT_COLS
        ))?;
        let rows = stmt.query_map([], Self::endpoint_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    /// Least-loaded ACTIVE endpoint with spare capacity, if any.
    pub fn least_loaded_endpoint(&self) -> Result<Option<Endpoint>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!(
                "SELECT {} FROM endpoints
                 WHERE status = 'active' AND current_load < capacity
                 ORDER BY current_load ASC LIMIT 1",
                Self::ENDPOINT_COLS
            ),
            [],
            Self::endpoint_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    pub fn adjust_endpoint_load(&self, id: Uuid, delta: i32) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE endpoints SET current_load = MAX(0, current_load + ?2) WHERE id = ?1",
            params![id.to_string(), delta],
        )?;
        Ok(())
    }

    // ========================================================================
    // Device operations
    // ========================================================================

    fn device_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Device> {
        Ok(Device {
            id: Uuid::parse_str(&row.get::<_, String>(0)?).unwrap(),
            user_id: Uuid::parse_str(&row.get::<_, String>(1)?).unwrap(),
            endpoint_id: Uuid::parse_str(&row.get::<_, String>(2)?).unwrap(),
            name: row.get(3)?,
            public_key: row.get(4)?,
            private_key_sealed: row.get(5)?,
            assigned_ip: row.get::<_, String>(6)?.parse().unwrap(),
            status: row.get::<_, String>(7)?.parse().unwrap(),
            last_connected_at: row.get(8)?,
            created_at: row.get(9)?,
        })
    }

    const DEVICE_COLS: &'static str = "id, user_id, endpoint_id, name, public_key, \
         private_key_sealed, assigned_ip, status, last_connected_at, created_at";

    /// Insert a device and claim its pool slot in one transaction.
    ///
    /// This is the saga's commit point for database state. The partial
    /// unique index on (endpoint_id, assigned_ip) makes the losing
    /// writer of a concurrent allocation fail here with a constraint
    /// violation (see `is_unique_violation`).
    pub fn insert_device_claiming_slot(&self, device: &Device) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO devices (id, user_id, endpoint_id, name, public_key,
                                  private_key_sealed, assigned_ip, status,
                                  last_connected_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                device.id.to_string(),
                device.user_id.to_string(),
                device.endpoint_id.to_string(),
                device.name,
                device.public_key,
                device.private_key_sealed,
                device.assigned_ip.to_string(),
                device.status.to_string(),
                device.last_connected_at,
                device.created_at,
            ],
        )?;
        tx.execute(
            "UPDATE ip_pool SET status = 'allocated', device_id = ?3, allocated_at = ?4
             WHERE endpoint_id = ?1 AND address = ?2",
            params![
                device.endpoint_id.to_string(),
                device.assigned_ip.to_string(),
                device.id.to_string(),
                now_epoch_secs(),
            ],
        )?;
        tx.execute(
            "UPDATE endpoints SET current_load = current_load + 1 WHERE id = ?1",
            params![device.endpoint_id.to_string()],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Physically delete a device row. Only used by provisioning
    /// rollback; every other teardown is a status transition.
    pub fn delete_device(&self, id: Uuid) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM devices WHERE id = ?1", params![id.to_string()])?;
        Ok(())
    }

    pub fn get_device_for_user(
        &self,
        device_id: Uuid,
        user_id: Uuid,
        status: Option<DeviceStatus>,
    ) -> Result<Option<Device>> {
        let conn = self.conn.lock();
        match status {
            Some(s) => conn
                .query_row(
                    &format!(
                        "SELECT {} FROM devices WHERE id = ?1 AND user_id = ?2 AND status = ?3",
                        Self::DEVICE_COLS
                    ),
                    params![device_id.to_string(), user_id.to_string(), s.to_string()],
                    Self::device_from_row,
                )
                .optional()
                .map_err(Error::from),
            None => conn
                .query_row(
                    &format!(
                        "SELECT {} FROM devices WHERE id = ?1 AND user_id = ?2",
                        Self::DEVICE_COLS
                    ),
                    params![device_id.to_string(), user_id.to_string()],
                    Self::device_from_row,
                )
                .optional()
                .map_err(Error::from),
        }
    }

    pub fn list_active_devices(&self, user_id: Uuid) -> Result<Vec<Device>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM devices WHERE user_id = ?1 AND status = 'active'
             ORDER BY created_at",
            Self::DEVICE_COLS
        ))?;
        let rows = stmt.query_map(params![user_id.to_string()], Self::device_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    pub fn count_active_devices(&self, user_id: Uuid) -> Result<u32> {
        let conn = self.conn.lock();
        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM devices WHERE user_id = ?1 AND status = 'active'",
            params![user_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Addresses currently held by ACTIVE devices on an endpoint. This
    /// is the allocated-set the allocator scans against; it is driven
    /// by device status, not the pool table, so a rolled-back device
    /// frees its address implicitly.
    pub fn active_device_ips(&self, endpoint_id: Uuid) -> Result<Vec<Ipv4Addr>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT assigned_ip FROM devices WHERE endpoint_id = ?1 AND status = 'active'",
        )?;
        let rows = stmt.query_map(params![endpoint_id.to_string()], |row| {
            Ok(row.get::<_, String>(0)?.parse::<Ipv4Addr>().unwrap())
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    pub fn set_device_status(&self, id: Uuid, status: DeviceStatus) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE devices SET status = ?2 WHERE id = ?1",
            params![id.to_string(), status.to_string()],
        )?;
        Ok(())
    }

    pub fn touch_device_last_connected(&self, id: Uuid, at: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE devices SET last_connected_at = ?2 WHERE id = ?1",
            params![id.to_string(), at],
        )?;
        Ok(())
    }

    // ========================================================================
    // IP pool operations
    // ========================================================================

    /// Seed pool rows for every address in [start, end] on an endpoint.
    /// Existing rows are left untouched.
    pub fn seed_pool(&self, endpoint_id: Uuid, start: Ipv4Addr, end: Ipv4Addr) -> Result<u32> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut created = 0u32;
        for raw in u32::from(start)..=u32::from(end) {
            let address = Ipv4Addr::from(raw);
            created += tx.execute(
                "INSERT OR IGNORE INTO ip_pool (endpoint_id, address, status)
                 VALUES (?1, ?2, 'available')",
                params![endpoint_id.to_string(), address.to_string()],
            )? as u32;
        }
        tx.commit()?;
        Ok(created)
    }

    /// Return an address to the pool: mark AVAILABLE and clear the
    /// device backreference.
    pub fn free_pool_slot(&self, endpoint_id: Uuid, address: Ipv4Addr) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE ip_pool SET status = 'available', device_id = NULL, allocated_at = NULL
             WHERE endpoint_id = ?1 AND address = ?2",
            params![endpoint_id.to_string(), address.to_string()],
        )?;
        Ok(())
    }

    pub fn pool_slot(&self, endpoint_id: Uuid, address: Ipv4Addr) -> Result<Option<PoolSlot>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT endpoint_id, address, status, device_id, allocated_at
             FROM ip_pool WHERE endpoint_id = ?1 AND address = ?2",
            params![endpoint_id.to_string(), address.to_string()],
            |row| {
                Ok(PoolSlot {
                    endpoint_id: Uuid::parse_str(&row.get::<_, String>(0)?).unwrap(),
                    address: row.get::<_, String>(1)?.parse().unwrap(),
                    status: row.get::<_, String>(2)?.parse().unwrap(),
                    device_id: row
                        .get::<_, Option<String>>(3)?
                        .map(|s| Uuid::parse_str(&s).unwrap()),
                    allocated_at: row.get(4)?,
                })
            },
        )
        .optional()
        .map_err(Error::from)
    }

    // ========================================================================
    // Session operations
    // ========================================================================

    fn session_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
        Ok(Session {
            id: Uuid::parse_str(&row.get::<_, String>(0)?).unwrap(),
            device_id: Uuid::parse_str(&row.get::<_, String>(1)?).unwrap(),
            endpoint_id: Uuid::parse_str(&row.get::<_, String>(2)?).unwrap(),
            tenant_id: Uuid::parse_str(&row.get::<_, String>(3)?).unwrap(),
            status: row.get::<_, String>(4)?.parse().unwrap(),
            connected_at: row.get(5)?,
            disconnected_at: row.get(6)?,
        })
    }

    const SESSION_COLS: &'static str =
        "id, device_id, endpoint_id, tenant_id, status, connected_at, disconnected_at";

    pub fn insert_session(&self, session: &Session) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sessions (id, device_id, endpoint_id, tenant_id, status,
                                   connected_at, disconnected_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                session.id.to_string(),
                session.device_id.to_string(),
                session.endpoint_id.to_string(),
                session.tenant_id.to_string(),
                session.status.to_string(),
                session.connected_at,
                session.disconnected_at,
            ],
        )?;
        Ok(())
    }

    /// Most recent ACTIVE session for a device, if any.
    pub fn latest_active_session(&self, device_id: Uuid) -> Result<Option<Session>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!(
                "SELECT {} FROM sessions
                 WHERE device_id = ?1 AND status = 'active'
                 ORDER BY connected_at DESC LIMIT 1",
                Self::SESSION_COLS
            ),
            params![device_id.to_string()],
            Self::session_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    pub fn close_session(&self, id: Uuid, disconnected_at: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE sessions SET status = 'disconnected', disconnected_at = ?2 WHERE id = ?1",
            params![id.to_string(), disconnected_at],
        )?;
        Ok(())
    }

    pub fn active_sessions_for_user(&self, user_id: Uuid) -> Result<Vec<Session>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT s.id, s.device_id, s.endpoint_id, s.tenant_id, s.status,
                    s.connected_at, s.disconnected_at
             FROM sessions s
             JOIN devices d ON d.id = s.device_id
             WHERE d.user_id = ?1 AND s.status = 'active'
             ORDER BY s.connected_at DESC",
        )?;
        let rows = stmt.query_map(params![user_id.to_string()], Self::session_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    // ========================================================================
    // License operations
    // ========================================================================

    fn license_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<License> {
        Ok(License {
            id: Uuid::parse_str(&row.get::<_, String>(0)?).unwrap(),
            key: row.get(1)?,
            tenant_id: Uuid::parse_str(&row.get::<_, String>(2)?).unwrap(),
            product: row.get(3)?,
            plan: row.get::<_, String>(4)?.parse().unwrap(),
            max_uses: row.get(5)?,
            used_count: row.get(6)?,
            expires_at: row.get(7)?,
            status: row.get::<_, String>(8)?.parse().unwrap(),
            created_at: row.get(9)?,
        })
    }

    const LICENSE_COLS: &'static str =
        "id, key, tenant_id, product, plan, max_uses, used_count, expires_at, status, created_at";

    pub fn insert_license(&self, license: &License) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO licenses (id, key, tenant_id, product, plan, max_uses,
                                   used_count, expires_at, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                license.id.to_string(),
                license.key,
                license.tenant_id.to_string(),
                license.product,
                license.plan.to_string(),
                license.max_uses,
                license.used_count,
                license.expires_at,
                license.status.to_string(),
                license.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_license_by_key(&self, key: &str) -> Result<Option<License>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM licenses WHERE key = ?1", Self::LICENSE_COLS),
            params![key],
            Self::license_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Idempotent ACTIVE -> EXPIRED transition. A license already out
    /// of ACTIVE is left untouched.
    pub fn mark_license_expired(&self, id: Uuid) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE licenses SET status = 'EXPIRED' WHERE id = ?1 AND status = 'ACTIVE'",
            params![id.to_string()],
        )?;
        Ok(())
    }

    pub fn mark_license_revoked(&self, id: Uuid) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE licenses SET status = 'REVOKED' WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(())
    }

    /// Atomic in-place usage increment. Never read-modify-write in the
    /// application: concurrent connects must each count exactly once.
    pub fn increment_license_usage(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE licenses SET used_count = used_count + 1 WHERE key = ?1",
            params![key],
        )?;
        if updated == 0 {
            return Err(Error::not_found("license", key));
        }
        Ok(())
    }

    /// Earliest-created ACTIVE license for a tenant + product.
    pub fn earliest_active_license(
        &self,
        tenant_id: Uuid,
        product: &str,
    ) -> Result<Option<License>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!(
                "SELECT {} FROM licenses
                 WHERE tenant_id = ?1 AND product = ?2 AND status = 'ACTIVE'
                 ORDER BY created_at ASC LIMIT 1",
                Self::LICENSE_COLS
            ),
            params![tenant_id.to_string(), product],
            Self::license_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    pub fn list_licenses(&self, filter: &LicenseFilter) -> Result<Vec<License>> {
        let conn = self.conn.lock();
        let mut sql = format!(
            "SELECT {} FROM licenses WHERE 1=1",
            Self::LICENSE_COLS
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(tenant_id) = filter.tenant_id {
            args.push(Box::new(tenant_id.to_string()));
            sql.push_str(&format!(" AND tenant_id = ?{}", args.len()));
        }
        if let Some(product) = &filter.product {
            args.push(Box::new(product.clone()));
            sql.push_str(&format!(" AND product = ?{}", args.len()));
        }
        if let Some(plan) = filter.plan {
            args.push(Box::new(plan.to_string()));
            sql.push_str(&format!(" AND plan = ?{}", args.len()));
        }
        if let Some(status) = filter.status {
            args.push(Box::new(status.to_string()));
            sql.push_str(&format!(" AND status = ?{}", args.len()));
        }
        sql.push_str(" ORDER BY created_at DESC");

        let mut stmt = conn.prepare(&sql)?;
        let params = rusqlite::params_from_iter(args.iter().map(|a| a.as_ref()));
        let rows = stmt.query_map(params, Self::license_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }
}

/// Optional filters for license listing.
#[derive(Debug, Clone, Default)]
pub struct LicenseFilter {
    pub tenant_id: Option<Uuid>,
    pub product: Option<String>,
    pub plan: Option<PlanTier>,
    pub status: Option<LicenseStatus>,
}
