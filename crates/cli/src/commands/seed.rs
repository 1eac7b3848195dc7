//! Database seeding for development and first-run bootstrap
//!
//! Creates an endpoint, its IP pool, a demo tenant + user, and a
//! trial license, mirroring what production provisioning tooling sets
//! up out of band.

use anyhow::Result;
use clap::Args;
use uuid::Uuid;
use wgvault_common::{crypto, now_epoch_secs, Endpoint, EndpointStatus};

use super::Context;
use crate::output::{print_success, print_warning};

#[derive(Args)]
pub struct SeedArgs {
    /// Endpoint name
    #[arg(long, default_value = "us-east-primary")]
    name: String,

    /// Endpoint region
    #[arg(long, default_value = "us-east")]
    region: String,

    /// Public address clients dial
    #[arg(long)]
    public_ip: String,

    /// Endpoint WireGuard public key (base64)
    #[arg(long)]
    public_key: String,

    /// WireGuard port
    #[arg(long, default_value = "51820")]
    port: u16,

    /// SSH host for the management channel (defaults to public IP)
    #[arg(long)]
    ssh_host: Option<String>,

    /// SSH user
    #[arg(long, default_value = "root")]
    ssh_user: String,

    /// SSH identity file
    #[arg(long)]
    ssh_key_path: String,

    /// Device capacity
    #[arg(long, default_value = "500")]
    capacity: u32,

    /// Demo tenant name
    #[arg(long, default_value = "Demo Tenant")]
    tenant_name: String,

    /// Per-user device cap for the demo tenant
    #[arg(long, default_value = "5")]
    max_devices: u32,

    /// Demo user email
    #[arg(long, default_value = "demo@wgvault.dev")]
    email: String,
}

pub async fn run(args: SeedArgs, ctx: &Context) -> Result<()> {
    let endpoint = Endpoint {
        id: Uuid::new_v4(),
        name: args.name,
        region: args.region,
        ssh_host: args.ssh_host.unwrap_or_else(|| args.public_ip.clone()),
        public_ip: args.public_ip,
        public_key: args.public_key,
        endpoint_port: args.port,
        ssh_user: args.ssh_user,
        ssh_key_path: args.ssh_key_path,
        capacity: args.capacity,
        current_load: 0,
        status: EndpointStatus::Active,
        created_at: now_epoch_secs(),
    };
    ctx.db.insert_endpoint(&endpoint)?;
    print_success(&format!(
        "Endpoint {} created ({})",
        endpoint.name, endpoint.id
    ));

    let seeded = ctx
        .db
        .seed_pool(endpoint.id, ctx.config.pool.start, ctx.config.pool.end)?;
    print_success(&format!(
        "IP pool seeded: {} addresses ({} - {})",
        seeded, ctx.config.pool.start, ctx.config.pool.end
    ));

    let tenant = ctx.db.create_tenant(&args.tenant_name, args.max_devices)?;
    print_success(&format!("Tenant {} created ({})", tenant.name, tenant.id));

    let user = ctx.db.create_user(tenant.id, &args.email)?;
    print_success(&format!("User {} created ({})", user.email, user.id));

    let license = ctx
        .licenses
        .get_or_create_trial(tenant.id, &ctx.config.product)?;
    print_success(&format!("Trial license: {}", license.key));

    if ctx.config.sealing_key.is_none() {
        print_warning("No sealing key configured; provisioning will fail without one.");
        println!(
            "Generated key (export as WGVAULT_SEALING_KEY):\n{}",
            crypto::generate_sealing_key_hex()
        );
    }

    Ok(())
}
