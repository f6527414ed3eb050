//! db-provider - command-line entry point.
//!
//! Exposes the provider layer for installers and operators: provider
//! metadata, DDL generation, database creation and lock table setup.

use clap::Parser;
use db_provider::config::{Command, Config, DatabaseConfig, ProviderSettings, parse_lock_arg};
use db_provider::db::ConnectionManager;
use db_provider::locking::{LockId, install_lock_table};
use db_provider::models::{DatabaseModel, ProviderMetadata, ProviderName, TableDefinition};
use db_provider::registry::{ProviderRegistry, init_default_providers};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Initialize the tracing subscriber for logging.
///
/// Logs go to stderr so JSON printed on stdout stays machine-readable.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> CliResult<()> {
    let config = Config::parse();
    init_tracing(&config);

    let settings = config.provider_settings()?;
    let registry = init_default_providers(&settings);

    info!(
        providers = ?registry.names(),
        lock_table = %settings.lock.table,
        "Starting db-provider v{}",
        env!("CARGO_PKG_VERSION")
    );

    let result = run(config.command, registry, &settings).await;
    if let Err(e) = &result {
        error!(error = %e, "Command failed");
    }
    result
}

async fn run(
    command: Command,
    registry: Arc<ProviderRegistry>,
    settings: &ProviderSettings,
) -> CliResult<()> {
    match command {
        Command::Providers { schema } => {
            if schema {
                let schema = schemars::schema_for!(Vec<ProviderMetadata>);
                println!("{}", serde_json::to_string_pretty(&schema)?);
            } else {
                println!("{}", serde_json::to_string_pretty(&registry.metadata())?);
            }
        }

        Command::Ddl { provider, file } => {
            let services = registry.resolve(&ProviderName::new(&provider))?;
            let json = std::fs::read_to_string(&file)?;
            let table: TableDefinition = serde_json::from_str(&json)?;
            for statement in services.syntax.create_table_statements(&table, false)? {
                println!("{};", statement);
            }
        }

        Command::Check { databases } => {
            let manager = ConnectionManager::new(registry.clone());
            for url in &databases {
                let db_config = DatabaseConfig::parse(url)?;
                let conn_config = db_config.to_connection_config()?;
                let services = registry.resolve(&conn_config.db_type.provider_name())?;
                let info = manager.connect(conn_config).await?;

                let mut conn = manager.open(&info.connection_id).await?;
                let tables = services.syntax.get_tables_in_schema(conn.as_mut()).await?;
                drop(conn);

                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "connection": info,
                        "tables": tables,
                    }))?
                );
            }
            manager.close_all().await;
        }

        Command::CreateDatabase { database } => {
            let conn_config = DatabaseConfig::parse(&database)?.to_connection_config()?;
            let services = registry.resolve(&conn_config.db_type.provider_name())?;
            let created = services.creator.create_database(&conn_config).await?;
            println!(
                "{}",
                serde_json::json!({ "id": conn_config.id, "created": created })
            );
        }

        Command::InstallLocks { database, locks } => {
            let rows = locks
                .iter()
                .map(|arg| parse_lock_arg(arg))
                .collect::<Result<Vec<_>, _>>()?;
            let rows: Vec<(LockId, &str)> = rows
                .iter()
                .map(|(id, name)| (LockId(*id), name.as_str()))
                .collect();

            let conn_config = DatabaseConfig::parse(&database)?.to_connection_config()?;
            let services = registry.resolve(&conn_config.db_type.provider_name())?;
            let manager = ConnectionManager::new(registry.clone());
            let info = manager.connect(conn_config).await?;

            let mut conn = manager.open(&info.connection_id).await?;
            let inserted = install_lock_table(
                conn.as_mut(),
                services.syntax.as_ref(),
                &settings.lock.table,
                &rows,
            )
            .await?;
            drop(conn);
            manager.close_all().await;

            println!(
                "{}",
                serde_json::json!({ "table": settings.lock.table, "inserted": inserted })
            );
        }

        Command::ConnectionString {
            provider,
            server,
            database_name,
            login,
            password,
        } => {
            let services = registry.resolve(&ProviderName::new(&provider))?;
            let model = DatabaseModel {
                server,
                database_name,
                login,
                password,
                integrated_auth: false,
            };
            println!("{}", services.metadata.generate_connection_string(&model)?);
        }
    }
    Ok(())
}
