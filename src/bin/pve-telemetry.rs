use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use pve_telemetry::{
    actors::{
        BufferDrainTask, BufferWriterTask, Manager, ManagerOptions, MetricsCollector,
        OutboxPublisherTask, RawIngestTask,
    },
    config::{Config, read_config_file},
    proxmox::PveClient,
    storage::open_backend,
    util,
    wal::WriteAheadBuffer,
};
use tracing::{error, info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file (defaults to $PVE_TELEMETRY_CONFIG or ./config.json)
    #[arg(short)]
    file: Option<String>,
}

fn init(log_level: &str) {
    let level = log_level.parse::<LevelFilter>().unwrap_or(LevelFilter::INFO);
    let filter = filter::Targets::new().with_targets(vec![("pve_telemetry", level)]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    let path = args.file.clone().unwrap_or_else(util::get_config_path);
    let config =
        read_config_file(&path).with_context(|| format!("failed to read config file {path}"))?;

    init(&config.log_level);
    trace!("started with args: {args:?}");

    let backend = open_backend(&config.storage)
        .await
        .context("failed to open storage")?;

    let manager = Arc::new(
        Manager::new(
            backend.clone(),
            ManagerOptions {
                notifier_capacity: config.buffer.notifier_capacity,
            },
        )
        .await?,
    );

    register_tasks(&manager, &config).await?;
    manager.start_all().await;

    #[cfg(feature = "api")]
    if config.api.enabled {
        let state = pve_telemetry::api::ApiState::new(manager.clone());
        pve_telemetry::api::spawn_api_server(config.api.bind_addr, state)
            .await
            .context("failed to start API server")?;
    }

    info!("pipeline running, press Ctrl-C to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {e}");
    }

    manager.shutdown().await;

    if let Err(e) = backend.close().await {
        warn!("failed to close storage: {e}");
    }

    info!("shut down");
    Ok(())
}

async fn register_tasks(manager: &Manager, config: &Config) -> anyhow::Result<()> {
    let client = PveClient::new(&config.proxmox).context("failed to create Proxmox client")?;
    manager
        .add_task(Box::new(MetricsCollector::new(
            client,
            config.collector.clone(),
        )))
        .await;

    let buffer = Arc::new(WriteAheadBuffer::new(config.buffer.path.clone()));
    manager
        .add_task(Box::new(BufferWriterTask::new(buffer.clone())))
        .await;
    manager
        .add_task(Box::new(BufferDrainTask::new(buffer, config.drain.clone())))
        .await;

    if config.publisher.enabled {
        manager
            .add_task(Box::new(OutboxPublisherTask::new(
                config.publisher.clone(),
                config.mqtt.clone(),
            )))
            .await;
    }

    if config.subscriber.enabled {
        manager
            .add_task(Box::new(RawIngestTask::new(
                config.subscriber.clone(),
                config.mqtt.clone(),
            )))
            .await;
    }

    Ok(())
}
