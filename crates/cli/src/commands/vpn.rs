//! VPN session commands

use anyhow::Result;
use clap::Subcommand;
use serde::Serialize;
use uuid::Uuid;
use wgvault_common::Session;

use super::Context;
use crate::output::{print_list, print_success, OutputFormat, TableDisplay};

#[derive(Subcommand)]
pub enum VpnCommands {
    /// Connect a device (license-gated)
    Connect {
        /// Device ID
        device_id: Uuid,

        /// Owning user ID
        #[arg(long)]
        user_id: Uuid,

        /// License key; defaults to the tenant's trial
        #[arg(long)]
        license: Option<String>,
    },

    /// Disconnect a device's active session
    Disconnect {
        /// Device ID
        device_id: Uuid,

        /// Owning user ID
        #[arg(long)]
        user_id: Uuid,
    },

    /// List a user's active sessions
    Sessions {
        /// Owning user ID
        user_id: Uuid,
    },

    /// Show endpoint health
    Status,
}

#[derive(Serialize)]
struct SessionRow {
    id: Uuid,
    device_id: Uuid,
    status: String,
    connected_at: i64,
    disconnected_at: Option<i64>,
}

impl From<&Session> for SessionRow {
    fn from(s: &Session) -> Self {
        Self {
            id: s.id,
            device_id: s.device_id,
            status: s.status.to_string(),
            connected_at: s.connected_at,
            disconnected_at: s.disconnected_at,
        }
    }
}

impl TableDisplay for SessionRow {
    fn headers() -> Vec<&'static str> {
        vec!["ID", "DEVICE", "STATUS", "CONNECTED", "DISCONNECTED"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.id.to_string(),
            self.device_id.to_string(),
            self.status.clone(),
            self.connected_at.to_string(),
            self.disconnected_at
                .map(|t| t.to_string())
                .unwrap_or_else(|| "-".to_string()),
        ]
    }
}

#[derive(Serialize)]
struct EndpointRow {
    name: String,
    region: String,
    load: String,
    peers: u32,
    status: String,
}

impl TableDisplay for EndpointRow {
    fn headers() -> Vec<&'static str> {
        vec!["NAME", "REGION", "LOAD", "PEERS", "STATUS"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.name.clone(),
            self.region.clone(),
            self.load.clone(),
            self.peers.to_string(),
            self.status.clone(),
        ]
    }
}

pub async fn run(command: VpnCommands, ctx: &Context, format: OutputFormat) -> Result<()> {
    match command {
        VpnCommands::Connect {
            device_id,
            user_id,
            license,
        } => {
            let outcome = ctx.sessions.connect(device_id, user_id, license.as_deref())?;
            print_success(&format!(
                "Connected (session {}, license {})",
                outcome.session.id, outcome.license_key
            ));
            match outcome.uses_remaining {
                Some(n) => println!("Uses remaining: {}", n),
                None => println!("Uses remaining: unlimited"),
            }
        }
        VpnCommands::Disconnect { device_id, user_id } => {
            let session = ctx.sessions.disconnect(device_id, user_id)?;
            print_success(&format!("Disconnected (session {})", session.id));
        }
        VpnCommands::Sessions { user_id } => {
            let sessions = ctx.sessions.active_sessions(user_id)?;
            let rows: Vec<SessionRow> = sessions.iter().map(SessionRow::from).collect();
            print_list(&rows, format);
        }
        VpnCommands::Status => {
            let statuses = ctx.provisioner()?.endpoint_status().await?;
            let rows: Vec<EndpointRow> = statuses
                .iter()
                .map(|(endpoint, health)| EndpointRow {
                    name: endpoint.name.clone(),
                    region: endpoint.region.clone(),
                    load: format!("{}/{}", endpoint.current_load, endpoint.capacity),
                    peers: health.peer_count,
                    status: health.status.clone(),
                })
                .collect();
            print_list(&rows, format);
        }
    }
    Ok(())
}
