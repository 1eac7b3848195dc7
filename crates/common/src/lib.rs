//! WgVault Common Library
//!
//! Shared types, persistence, and crypto for the WgVault platform.

pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod types;

// Re-export commonly used types
pub use config::{PoolConfig, ServiceConfig, WireguardConfig};
pub use crypto::KeySealer;
pub use db::{Database, LicenseFilter};
pub use error::{Error, LicenseDenial, Result};
pub use types::*;

/// WgVault version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
