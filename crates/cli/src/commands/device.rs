//! Device Commands

use anyhow::Result;
use clap::Subcommand;
use serde::Serialize;
use uuid::Uuid;
use wgvault_core::ProvisionedDevice;

use super::Context;
use crate::output::{print_item, print_list, print_success, OutputFormat, TableDisplay};

#[derive(Subcommand)]
pub enum DeviceCommands {
    /// Provision a new device and print its client config
    Provision {
        /// Owning user ID
        user_id: Uuid,

        /// Device name
        #[arg(short, long)]
        name: String,
    },

    /// Revoke a device and free its address
    Deprovision {
        /// Device ID
        device_id: Uuid,

        /// Owning user ID
        #[arg(long)]
        user_id: Uuid,
    },

    /// List a user's active devices
    List {
        /// Owning user ID
        user_id: Uuid,
    },

    /// Print the client config for one device
    Config {
        /// Device ID
        device_id: Uuid,

        /// Owning user ID
        #[arg(long)]
        user_id: Uuid,
    },
}

#[derive(Serialize)]
struct DeviceRow {
    id: Uuid,
    name: String,
    address: String,
    region: String,
    endpoint: String,
    status: String,
}

impl From<&ProvisionedDevice> for DeviceRow {
    fn from(p: &ProvisionedDevice) -> Self {
        Self {
            id: p.device.id,
            name: p.device.name.clone(),
            address: p.device.assigned_ip.to_string(),
            region: p.endpoint.region.clone(),
            endpoint: format!("{}:{}", p.endpoint.public_ip, p.endpoint.endpoint_port),
            status: p.device.status.to_string(),
        }
    }
}

impl TableDisplay for DeviceRow {
    fn headers() -> Vec<&'static str> {
        vec!["ID", "NAME", "ADDRESS", "REGION", "ENDPOINT", "STATUS"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.id.to_string(),
            self.name.clone(),
            self.address.clone(),
            self.region.clone(),
            self.endpoint.clone(),
            self.status.clone(),
        ]
    }
}

pub async fn run(command: DeviceCommands, ctx: &Context, format: OutputFormat) -> Result<()> {
    match command {
        DeviceCommands::Provision { user_id, name } => {
            let provisioned = ctx.provisioner()?.provision(user_id, &name).await?;
            print_item(&DeviceRow::from(&provisioned), format);
            // Raw config last so it can be piped into a .conf file.
            println!("\n{}", provisioned.config);
        }
        DeviceCommands::Deprovision { device_id, user_id } => {
            ctx.provisioner()?.deprovision(device_id, user_id).await?;
            print_success(&format!("Device {} deprovisioned", device_id));
        }
        DeviceCommands::List { user_id } => {
            let devices = ctx.provisioner()?.list_active_devices(user_id)?;
            let rows: Vec<DeviceRow> = devices.iter().map(DeviceRow::from).collect();
            print_list(&rows, format);
        }
        DeviceCommands::Config { device_id, user_id } => {
            let provisioned = ctx.provisioner()?.device_config(device_id, user_id)?;
            println!("{}", provisioned.config);
        }
    }
    Ok(())
}
