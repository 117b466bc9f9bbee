mod cli;
mod ops;
mod problem;
mod provisioning;
mod resolver;
mod router;
mod signup;
mod telemetry;

use std::{net::SocketAddr, sync::Arc};

use clap::Parser;
use tracing::info;

use tenancy_storage::{Database, SqlitePartitionStore};
use tenancy_util::{load_env_file, AppConfig};

use crate::cli::{Cli, Command};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let cli = Cli::parse();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;
    let partitions = SqlitePartitionStore::new(config.partition_dir.clone());

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(&config, database, partitions).await,
        command => {
            let resolver = resolver::TenantResolver::new(database.clone(), &config.public_hosts);
            let provisioner = provisioning::TenantProvisioner::new(
                database.clone(),
                Arc::new(partitions),
                resolver,
                &config.base_domain,
            );
            let operator = ops::Operator::new(database, provisioner);
            cli::run(command, &operator, config.bind_addr.port()).await?;
            Ok(())
        }
    }
}

async fn serve(
    config: &AppConfig,
    database: Database,
    partitions: SqlitePartitionStore,
) -> Result<(), Box<dyn std::error::Error>> {
    let metrics = telemetry::init_metrics()?;
    let state = router::AppState::new(
        metrics,
        database,
        partitions,
        &config.base_domain,
        &config.public_hosts,
    );

    let addr: SocketAddr = config.bind_addr;
    info!(
        stage = "app",
        %addr,
        env = %config.environment.as_str(),
        base_domain = %config.base_domain,
        partition_dir = %config.partition_dir.display(),
        "starting HTTP server"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .await
        .map_err(|err| err.into())
}
