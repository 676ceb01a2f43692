use anyhow::{Context, Result};
use application::AlertMonitor;
use clap::Parser;
use infrastructure::{BrokerHub, ConfigSource};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the same configuration YAML the ingest engine reads; only
    /// the `alerts` and `mqtt_servers` sections are used here.
    #[arg(long, default_value = "config/default.yaml")]
    config: String,

    /// MQTT worker-pool size for threshold-check dispatches.
    #[arg(long, default_value = "4")]
    workers: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,alert_monitor=debug,application=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    info!("Alert Monitor Starting...");
    info!(config = %args.config, "loading configuration");

    let config_source = Arc::new(ConfigSource::load(&args.config).context("failed to load initial configuration")?);
    let snapshot = config_source.current();

    let broker_hub = Arc::new(BrokerHub::new(args.workers));
    let monitor = Arc::new(AlertMonitor::new(broker_hub.clone()));

    monitor.rebuild(&snapshot).await;
    info!("initial alert subscriptions installed");

    let monitor_for_reload = monitor.clone();
    config_source.subscribe(Box::new(move |snapshot| {
        let monitor = monitor_for_reload.clone();
        tokio::spawn(async move { monitor.rebuild(&snapshot).await });
    }));

    let poll_task = {
        let config_source = config_source.clone();
        tokio::spawn(async move { config_source.run().await })
    };

    info!("alert monitor running; press ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("shutdown signal received");

    poll_task.abort();
    broker_hub.stop_all().await;
    info!("mqtt clients stopped");
    Ok(())
}
