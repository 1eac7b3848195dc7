//! License admin commands

use anyhow::Result;
use clap::Subcommand;
use serde::Serialize;
use uuid::Uuid;
use wgvault_common::{License, LicenseFilter, LicenseStatus, PlanTier};
use wgvault_core::{CreateLicense, MaxUses, Validation};

use super::Context;
use crate::output::{print_item, print_list, print_success, print_warning, OutputFormat, TableDisplay};

fn parse_plan(s: &str) -> std::result::Result<PlanTier, String> {
    s.to_uppercase().parse()
}

fn parse_status(s: &str) -> std::result::Result<LicenseStatus, String> {
    s.to_uppercase().parse()
}

#[derive(Subcommand)]
pub enum LicenseCommands {
    /// Issue a new license key
    Create {
        /// Tenant ID
        tenant_id: Uuid,

        /// Product the key is valid for
        #[arg(long)]
        product: Option<String>,

        /// Plan tier (trial, starter, pro, enterprise)
        #[arg(long, value_parser = parse_plan, default_value = "TRIAL")]
        plan: PlanTier,

        /// Usage cap; omitted = plan default
        #[arg(long, conflicts_with = "unlimited")]
        max_uses: Option<u32>,

        /// No usage cap
        #[arg(long)]
        unlimited: bool,

        /// Expiry as unix epoch seconds
        #[arg(long)]
        expires_at: Option<i64>,
    },

    /// Revoke a key immediately
    Revoke {
        /// License key
        key: String,
    },

    /// Validate a key without consuming a use
    Validate {
        /// License key
        key: String,

        /// Product to validate against
        #[arg(long)]
        product: Option<String>,
    },

    /// List licenses
    List {
        #[arg(long)]
        tenant: Option<Uuid>,

        #[arg(long)]
        product: Option<String>,

        #[arg(long, value_parser = parse_plan)]
        plan: Option<PlanTier>,

        #[arg(long, value_parser = parse_status)]
        status: Option<LicenseStatus>,
    },

    /// Show one license
    Show {
        /// License key
        key: String,
    },
}

#[derive(Serialize)]
struct LicenseRow {
    key: String,
    tenant_id: Uuid,
    product: String,
    plan: String,
    used: String,
    expires_at: Option<i64>,
    status: String,
}

impl From<&License> for LicenseRow {
    fn from(l: &License) -> Self {
        let used = match l.max_uses {
            Some(max) => format!("{}/{}", l.used_count, max),
            None => format!("{}/∞", l.used_count),
        };
        Self {
            key: l.key.clone(),
            tenant_id: l.tenant_id,
            product: l.product.clone(),
            plan: l.plan.to_string(),
            used,
            expires_at: l.expires_at,
            status: l.status.to_string(),
        }
    }
}

impl TableDisplay for LicenseRow {
    fn headers() -> Vec<&'static str> {
        vec!["KEY", "TENANT", "PRODUCT", "PLAN", "USED", "EXPIRES", "STATUS"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.key.clone(),
            self.tenant_id.to_string(),
            self.product.clone(),
            self.plan.clone(),
            self.used.clone(),
            self.expires_at
                .map(|t| t.to_string())
                .unwrap_or_else(|| "-".to_string()),
            self.status.clone(),
        ]
    }
}

pub async fn run(command: LicenseCommands, ctx: &Context, format: OutputFormat) -> Result<()> {
    match command {
        LicenseCommands::Create {
            tenant_id,
            product,
            plan,
            max_uses,
            unlimited,
            expires_at,
        } => {
            let max_uses = if unlimited {
                MaxUses::Unlimited
            } else {
                max_uses.map(MaxUses::Limited).unwrap_or(MaxUses::PlanDefault)
            };
            let license = ctx.licenses.create(CreateLicense {
                tenant_id,
                product: product.unwrap_or_else(|| ctx.config.product.clone()),
                plan,
                max_uses,
                expires_at,
            })?;
            print_item(&LicenseRow::from(&license), format);
        }
        LicenseCommands::Revoke { key } => {
            let license = ctx.licenses.revoke(&key)?;
            print_success(&format!("License {} revoked", license.key));
        }
        LicenseCommands::Validate { key, product } => {
            let product = product.unwrap_or_else(|| ctx.config.product.clone());
            match ctx.licenses.validate(&key, &product)? {
                Validation::Valid { uses_remaining, .. } => {
                    print_success("License valid");
                    match uses_remaining {
                        Some(n) => println!("Uses remaining: {}", n),
                        None => println!("Uses remaining: unlimited"),
                    }
                }
                Validation::Denied {
                    reason,
                    upgrade_url,
                } => {
                    print_warning(&format!("License rejected: {}", reason));
                    println!("Upgrade at: {}", upgrade_url);
                }
            }
        }
        LicenseCommands::List {
            tenant,
            product,
            plan,
            status,
        } => {
            let licenses = ctx.licenses.list(&LicenseFilter {
                tenant_id: tenant,
                product,
                plan,
                status,
            })?;
            let rows: Vec<LicenseRow> = licenses.iter().map(LicenseRow::from).collect();
            print_list(&rows, format);
        }
        LicenseCommands::Show { key } => {
            let license = ctx.licenses.get_by_key(&key)?;
            print_item(&LicenseRow::from(&license), format);
        }
    }
    Ok(())
}
