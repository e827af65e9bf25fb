//! Event Tail
//!
//! Tails Nakadi event types through the consumer library and logs every
//! event, or prints the offsets a consumer has committed.

use clap::{Parser, Subcommand};
use config::{Config, CoordinationMode};
use core_config::tracing::{init_tracing, install_color_eyre};
use core_config::{Environment, FromEnv};
use eyre::{Result, WrapErr};
use nakadi_consumer::http::fetch_partitions;
use nakadi_consumer::{
    AccessTokenProvider, BackoffConfig, ConsumerRegistry, CoordinatedOffsetStore,
    CoordinationStore, EventType, HealthState, LeaderElectionCoordinator, LocalCoordinator,
    OffsetStore, PartitionCoordinator, RedisCoordinationStore, StaticTokenProvider, Transports,
    health_router, init_metrics,
};
use serde_json::json;
use std::sync::Arc;
use tail::LoggingListener;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

mod config;
mod tail;

#[derive(Parser)]
#[command(name = "event-tail")]
#[command(about = "Tail Nakadi event types and inspect committed offsets")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume event types and log every event
    Consume {
        /// Event types to consume
        #[arg(required = true, value_delimiter = ',')]
        event_types: Vec<String>,

        /// Overrides NAKADI_COORDINATION
        #[arg(short, long, value_enum)]
        coordination: Option<CoordinationMode>,

        /// Hand events over per batch instead of one by one
        #[arg(short, long)]
        bulk: bool,

        /// Log full payloads
        #[arg(short, long)]
        verbose: bool,
    },

    /// Print committed offsets next to the broker's newest offsets
    Offsets {
        /// Event type to inspect
        event_type: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    install_color_eyre();

    let environment = Environment::from_env();
    init_tracing(&environment);

    let cli = Cli::parse();
    let config = Config::from_env().wrap_err("Failed to load configuration")?;

    match cli.command {
        Commands::Consume {
            event_types,
            coordination,
            bulk,
            verbose,
        } => {
            let mode = coordination.unwrap_or(config.mode);
            consume(config, mode, event_types, bulk, verbose).await
        }
        Commands::Offsets { event_type } => offsets(config, EventType::new(event_type)).await,
    }
}

async fn connect_store(config: &Config) -> Result<Arc<dyn CoordinationStore>> {
    info!(url = %config.coordination.redis_url, "Connecting to coordination store...");
    let store = RedisCoordinationStore::connect_with_retry(
        &config.coordination.redis_url,
        BackoffConfig::default(),
    )
    .await
    .wrap_err("Failed to connect to the coordination store")?;
    Ok(Arc::new(store))
}

fn transports(config: &Config) -> Result<Transports> {
    let tokens = config
        .access_token
        .clone()
        .map(|token| Arc::new(StaticTokenProvider::new(token)) as Arc<dyn AccessTokenProvider>);
    Transports::reqwest(&config.consumer, tokens).wrap_err("Failed to build HTTP client")
}

async fn consume(
    config: Config,
    mode: CoordinationMode,
    event_types: Vec<String>,
    bulk: bool,
    verbose: bool,
) -> Result<()> {
    init_metrics();
    info!(
        consumer = %config.consumer.consumer_name,
        mode = %mode,
        event_types = ?event_types,
        "Starting event tail"
    );

    let (coordinator, store): (Arc<dyn PartitionCoordinator>, Option<Arc<dyn CoordinationStore>>) =
        match mode {
            CoordinationMode::Simple => (Arc::new(LocalCoordinator::simple(&config.consumer)), None),
            CoordinationMode::Durable => {
                let store = connect_store(&config).await?;
                let offsets =
                    CoordinatedOffsetStore::new(store.clone(), config.coordination.key_space());
                (
                    Arc::new(LocalCoordinator::durable(&config.consumer, Arc::new(offsets))),
                    Some(store),
                )
            }
            CoordinationMode::Leader => {
                let store = connect_store(&config).await?;
                let coordinator = LeaderElectionCoordinator::new(
                    &config.consumer,
                    config.coordination.clone(),
                    store.clone(),
                );
                info!(member_id = %coordinator.member_id(), "Joining consumer group");
                (Arc::new(coordinator), Some(store))
            }
        };

    let mut registry = ConsumerRegistry::new(config.consumer.clone(), coordinator, transports(&config)?);
    for event_type in event_types {
        registry
            .subscribe(EventType::new(event_type), LoggingListener::handler(verbose, bulk))
            .wrap_err("Failed to subscribe")?;
    }
    let registry = Arc::new(registry);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let mut health_state = HealthState::new(
        registry.clone(),
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
    );
    if let Some(store) = store {
        health_state = health_state.with_store(store);
    }
    let address = config.server.address();
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state, &address).await {
            error!(error = %e, "Health server failed");
        }
    });

    registry.run(shutdown_rx).await.wrap_err("Consumer failed")?;

    info!("Event tail stopped");
    Ok(())
}

async fn offsets(config: Config, event_type: EventType) -> Result<()> {
    let store = connect_store(&config).await?;
    let offsets = CoordinatedOffsetStore::new(store, config.coordination.key_space());
    let committed = offsets
        .list(&event_type, &config.consumer.consumer_name)
        .await
        .wrap_err("Failed to read committed offsets")?;

    let transports = transports(&config)?;
    let partitions = fetch_partitions(
        transports.partitions.as_ref(),
        &config.consumer.nakadi_url,
        &event_type,
    )
    .await
    .wrap_err("Failed to fetch partitions")?;

    let rows: Vec<_> = partitions
        .iter()
        .map(|partition| {
            let committed = committed
                .iter()
                .find(|cursor| cursor.partition_id() == partition.partition)
                .map(|cursor| cursor.offset().to_string());
            json!({
                "partition": partition.partition,
                "committed": committed,
                "oldest": partition.oldest_available_offset,
                "newest": partition.newest_available_offset,
            })
        })
        .collect();

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "event_type": event_type.name(),
            "consumer": config.consumer.consumer_name.as_str(),
            "partitions": rows,
        }))?
    );
    Ok(())
}

/// Health, readiness, status and metrics endpoints
async fn start_health_server(state: HealthState, address: &str) -> Result<()> {
    let listener = TcpListener::bind(address)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {}", address))?;

    info!(address = %address, "Health server listening");

    axum::serve(listener, health_router(state))
        .await
        .wrap_err("Health server failed")?;

    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating shutdown..."),
        _ = terminate => info!("Received SIGTERM, initiating shutdown..."),
    }
}
