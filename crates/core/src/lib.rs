//! WgVault Core
//!
//! Provisioning-and-metering orchestration: address allocation, key
//! material, remote peer management, the license engine, the device
//! provisioning saga, and session lifecycle.

pub mod allocator;
pub mod keys;
pub mod license;
pub mod peers;
pub mod provision;
pub mod remote;
pub mod session;

pub use keys::WgKeyPair;
pub use license::{CreateLicense, LicenseEngine, MaxUses, Validation};
pub use peers::{EndpointHealth, PeerBackend, PeerManager, WgBackend};
pub use provision::{ProvisionedDevice, Provisioner};
pub use remote::{CommandChannel, CommandOutput, SshChannel};
pub use session::{ConnectOutcome, SessionService};
