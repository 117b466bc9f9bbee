use clap::{Parser, Subcommand};

use crate::ops::{CreatePublicOutcome, OpsError, Operator};

/// Multi-tenant workspace service and its operator commands.
#[derive(Debug, Parser)]
#[command(name = "tenancy-app", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Run the HTTP server (default)
    Serve,
    /// Create the public tenant that serves non-customer hosts
    CreatePublic {
        #[arg(long, default_value = "localhost")]
        hostname: String,
    },
    /// Provision a tenant on an explicit primary hostname
    CreateTenant {
        identifier: String,
        display_name: String,
        hostname: String,
    },
    /// Print every tenant with its domains
    ListTenants,
    /// Route local development hosts to the public tenant
    AddDevDomains {
        /// Port of the local server, defaults to the configured bind port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Register an extra hostname for a tenant
    AddDomain {
        identifier: String,
        hostname: String,
        #[arg(long)]
        primary: bool,
    },
}

/// Runs an operator command and prints its outcome to stdout.
pub async fn run(command: Command, operator: &Operator, default_port: u16) -> Result<(), OpsError> {
    match command {
        Command::Serve => {}
        Command::CreatePublic { hostname } => match operator.create_public(&hostname).await? {
            CreatePublicOutcome::Created(created) => {
                println!(
                    "Created public tenant on {} (partition {})",
                    created.primary_domain.hostname,
                    created.tenant.partition.location()
                );
            }
            CreatePublicOutcome::AlreadyExists(tenant) => {
                println!(
                    "Public tenant already exists (partition {})",
                    tenant.partition.location()
                );
            }
        },
        Command::CreateTenant {
            identifier,
            display_name,
            hostname,
        } => {
            let created = operator
                .create_tenant(&identifier, &display_name, &hostname)
                .await?;
            println!(
                "Created tenant {} ({}) on {}",
                created.tenant.identifier, created.tenant.display_name, created.primary_domain.hostname
            );
        }
        Command::ListTenants => {
            let listings = operator.list_tenants().await?;
            for listing in &listings {
                println!(
                    "{}  {}  {}",
                    listing.tenant.identifier,
                    listing.tenant.display_name,
                    listing.tenant.partition.location()
                );
                for domain in &listing.domains {
                    let marker = if domain.is_primary { " (primary)" } else { "" };
                    println!("    {}{marker}", domain.hostname);
                }
            }
            println!("{} tenant(s)", listings.len());
        }
        Command::AddDevDomains { port } => {
            let report = operator.add_dev_domains(port.unwrap_or(default_port)).await?;
            for domain in report {
                if domain.added {
                    println!("Added domain: {}", domain.hostname);
                } else {
                    println!("Domain already exists: {}", domain.hostname);
                }
            }
        }
        Command::AddDomain {
            identifier,
            hostname,
            primary,
        } => {
            let domain = operator.add_domain(&identifier, &hostname, primary).await?;
            println!(
                "Added {} to {}{}",
                domain.hostname,
                domain.tenant,
                if domain.is_primary { " as primary" } else { "" }
            );
        }
    }
    Ok(())
}
