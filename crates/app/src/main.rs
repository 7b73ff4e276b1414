use std::{sync::Arc, time::Duration};

use accounting::{AccountingService, Scanner, SqlStore};
use migration::{Migrator, MigratorTrait};
use tokio::sync::watch;

mod settings;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let settings = settings::Settings::new()?;

    tracing_subscriber::fmt()
        .with_env_filter(format!(
            "tally={level},accounting={level}",
            level = settings.app.level
        ))
        .init();

    let database = connect_database(&settings.database).await?;
    let store = SqlStore::new(database);
    let service = Arc::new(AccountingService::load(&store).await?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scanner = Scanner::new(
        service.clone(),
        Duration::from_secs(settings.scanner.interval_secs.max(1)),
    )
    .flush_on_shutdown(settings.scanner.flush_on_shutdown);

    let mut tasks = tokio::task::JoinSet::new();
    tasks.spawn(async move {
        scanner.run(&store, shutdown_rx).await;
    });

    tasks.spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Shutdown requested"),
            Err(err) => tracing::error!("failed to listen for shutdown signal: {err}"),
        }
        let _ = shutdown_tx.send(true);
    });

    while tasks.join_next().await.is_some() {}

    Ok(())
}

async fn connect_database(
    config: &settings::Database,
) -> Result<sea_orm::DatabaseConnection, Box<dyn std::error::Error + Send + Sync>> {
    let database = sea_orm::Database::connect(config.url()).await?;
    Migrator::up(&database, None).await?;
    tracing::info!("Connected to {}", config.url());
    Ok(database)
}
