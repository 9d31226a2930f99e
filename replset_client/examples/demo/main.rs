use std::time::Duration;

use anyhow::Context;
use replset_client::{MaxStaleness, ReadMode, ReadPreference, TagSet, TopologyBuilder};
use tracing::subscriber::set_global_default;
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_log::LogTracer;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Registry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_tracing()?;

    let hosts = std::env::var("REPLSET_HOSTS").unwrap_or_else(|_| "localhost:27017".to_string());
    let hosts: Vec<&str> = hosts.split(',').map(str::trim).collect();
    let set_name = std::env::var("REPLSET_NAME").unwrap_or_else(|_| "rs0".to_string());

    let topology = TopologyBuilder::new()
        .set_hosts(&hosts)
        .set_replica_set_name(&set_name)
        .set_server_selection_timeout(Duration::from_secs(10))
        .build()?;

    let read_preference = ReadPreference::new(
        ReadMode::SecondaryPreferred,
        MaxStaleness::Seconds(120),
        vec![TagSet::new().with("dc", "east"), TagSet::new()],
    )?;

    match topology.select_server(&read_preference, None).await {
        Ok(address) => println!("Selected {}", address),
        Err(e) => tracing::error!("Server selection failed. Caused by: {}", e),
    }

    println!("{}", topology.current_topology());
    topology.shutdown().await;

    Ok(())
}

fn setup_tracing() -> anyhow::Result<()> {
    // Redirect all `log`'s events to the subscriber
    LogTracer::init().context("Failed to set logger")?;
    // Set up tracing
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("REPLSET_LOG_FORMAT")
        .map(|format| format == "json")
        .unwrap_or(false);
    let subscriber = Registry::default()
        .with(env_filter)
        .with(json.then_some(JsonStorageLayer))
        .with(json.then(|| BunyanFormattingLayer::new("replset-demo".into(), std::io::stdout)))
        .with((!json).then(tracing_subscriber::fmt::layer));
    set_global_default(subscriber).context("Failed to set subscriber")?;
    Ok(())
}
