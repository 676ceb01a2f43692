use anyhow::{Context, Result};
use application::{Router, Supervisor};
use clap::Parser;
use infrastructure::{ConfigSource, PostgresDeviceRepository, PostgresSchemaRepository};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the route/pattern/broker configuration YAML file.
    #[arg(long, default_value = "config/default.yaml")]
    config: String,

    /// MQTT worker-pool size: the number of handler dispatches allowed to
    /// run concurrently per broker connection.
    #[arg(long, default_value = "8")]
    workers: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,ingest_engine=debug,application=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    info!("Ingest Engine Starting...");
    info!(config = %args.config, "loading configuration");

    let config_source = Arc::new(ConfigSource::load(&args.config).context("failed to load initial configuration")?);
    let snapshot = config_source.current();

    info!(uri = %snapshot.database.uri, "connecting to database");
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(snapshot.database.max_connections)
        .connect(&snapshot.database.uri)
        .await
        .context("failed to connect to database")?;

    info!("running device_mapper migrations");
    let db = sea_orm::Database::connect(snapshot.database.uri.clone())
        .await
        .context("failed to open sea-orm connection for migrations")?;
    <migration::Migrator as migration::MigratorTrait>::up(&db, None)
        .await
        .context("failed to run migrations")?;
    info!("migrations applied");

    let schema_repo = Arc::new(PostgresSchemaRepository::new(pool.clone()));
    let device_repo = Arc::new(PostgresDeviceRepository::new(pool));

    let broker_hub = Arc::new(infrastructure::BrokerHub::new(args.workers));
    let router = Arc::new(Router::new(schema_repo, device_repo));
    let supervisor = Arc::new(Supervisor::new(broker_hub.clone(), router));

    supervisor.rebuild(&snapshot).await;
    info!("initial subscriptions installed");

    config_source.subscribe(supervisor.reload_callback());

    let poll_task = {
        let config_source = config_source.clone();
        tokio::spawn(async move { config_source.run().await })
    };

    info!("ingest engine running; press ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("shutdown signal received");

    poll_task.abort();
    broker_hub.stop_all().await;
    if let Err(e) = db.close().await {
        tracing::warn!(error = %e, "error closing migration database connection during shutdown");
    }
    info!("mqtt clients stopped and database connections released");
    Ok(())
}
