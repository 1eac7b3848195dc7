//! Error types for WgVault

use thiserror::Error;

/// Result type alias using WgVault Error
pub type Result<T> = std::result::Result<T, Error>;

/// Reason a license was rejected at validation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LicenseDenial {
    /// Key does not exist.
    Invalid,
    /// Key exists but was issued for a different product.
    WrongProduct,
    /// License was revoked by an administrator.
    Revoked,
    /// License expiry timestamp has passed.
    Expired,
    /// Usage cap reached (any plan tier, not just trials).
    TrialExhausted,
}

impl std::fmt::Display for LicenseDenial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Invalid => write!(f, "invalid"),
            Self::WrongProduct => write!(f, "wrong_product"),
            Self::Revoked => write!(f, "revoked"),
            Self::Expired => write!(f, "expired"),
            Self::TrialExhausted => write!(f, "trial_exhausted"),
        }
    }
}

/// WgVault error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },

    #[error("Device limit reached: maximum {limit} devices per user")]
    DeviceLimitExceeded { limit: u32 },

    #[error("No available endpoints with spare capacity")]
    NoAvailableEndpoint,

    #[error("IP pool exhausted for endpoint {endpoint}")]
    PoolExhausted { endpoint: String },

    #[error("License rejected: {reason} (upgrade at {upgrade_url})")]
    LicenseGate {
        reason: LicenseDenial,
        upgrade_url: String,
    },

    #[error("Remote command failed: {command}: {stderr}")]
    RemoteCommand { command: String, stderr: String },

    #[error("Failed to reach endpoint: {0}")]
    RemoteConnect(String),

    #[error("VPN provisioning failed: {0}")]
    ProvisioningFailed(#[source] Box<Error>),

    #[error("No active session for device {device}")]
    NoActiveSession { device: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Operation timeout after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a typed not-found error.
    pub fn not_found(kind: &str, id: impl ToString) -> Self {
        Self::NotFound {
            kind: kind.to_string(),
            id: id.to_string(),
        }
    }

    /// True if this error came from the remote management channel.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            Self::RemoteCommand { .. } | Self::RemoteConnect(_) | Self::Timeout { .. }
        )
    }
}
