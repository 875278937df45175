use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use telemetra_broker::{BrokerAdmin, MessageSource};
use telemetra_broker_memory::MemoryBroker;
use telemetra_broker_rabbitmq::RabbitMqAdmin;
use telemetra_ingest::{
    ConsumerRegistry, EventRouter, HandlerContext, LivePublisher, QueueCatalog, RouterConfig,
};
use telemetra_provision::{CatalogRefresh, Provisioner};
use telemetra_server::api::stream::ConnectionRegistry;
use telemetra_server::api::{self, AppState};
use telemetra_server::config::{BrokerBackend, StoreBackend, TelemetraConfig};
use telemetra_server::telemetry;
use telemetra_store::EventStore;
use telemetra_store_memory::MemoryEventStore;
use telemetra_store_postgres::PostgresEventStore;

/// Telemetra analytics server.
#[derive(Parser, Debug)]
#[command(name = "telemetra-server", about = "Game telemetry ingestion and KPI streaming")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "telemetra.toml")]
    config: String,

    /// Override the bind host.
    #[arg(long)]
    host: Option<String>,

    /// Override the bind port.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Load configuration, or run on defaults if the file does not exist.
    let config: TelemetraConfig = if Path::new(&cli.config).exists() {
        let contents = std::fs::read_to_string(&cli.config)?;
        toml::from_str(&contents)?
    } else {
        toml::from_str("")?
    };

    telemetry::init();

    if !Path::new(&cli.config).exists() {
        info!(path = %cli.config, "config file not found, using defaults");
    }

    // Event store backend.
    let store: Arc<dyn EventStore> = match config.store.backend {
        StoreBackend::Memory => Arc::new(MemoryEventStore::new()),
        StoreBackend::Postgres => {
            let pg = config
                .store
                .postgres
                .ok_or("[store.postgres] is required when store.backend = \"postgres\"")?;
            Arc::new(PostgresEventStore::new(pg).await?)
        }
    };
    info!(backend = ?config.store.backend, "event store initialized");

    // Broker backend. The memory broker also serves as the message
    // source, running consumers inside this process; with RabbitMQ this
    // process only provisions, and consumption happens wherever tenant
    // queues are drained.
    let (admin, source): (Arc<dyn BrokerAdmin>, Option<Arc<dyn MessageSource>>) =
        match config.broker.backend {
            BrokerBackend::Memory => {
                let broker = Arc::new(MemoryBroker::new());
                (Arc::clone(&broker) as _, Some(broker as _))
            }
            BrokerBackend::Rabbitmq => {
                let mq = config
                    .broker
                    .rabbitmq
                    .ok_or("[broker.rabbitmq] is required when broker.backend = \"rabbitmq\"")?;
                (Arc::new(RabbitMqAdmin::new(mq)?) as _, None)
            }
        };

    let refresh = CatalogRefresh::new();
    let refresh_rx = refresh.subscribe();
    let provisioner = Arc::new(Provisioner::new(admin, Arc::clone(&store), refresh));

    let live = LivePublisher::new(config.consumer.live_capacity);

    // Queue catalog: loaded once at startup, reloaded on each
    // provisioning refresh signal.
    let catalog = Arc::new(QueueCatalog::new(Arc::clone(&store)));
    let loaded = catalog.load().await?;
    info!(queues = loaded, "queue catalog loaded");

    let cancel = CancellationToken::new();
    let refresh_task = tokio::spawn(Arc::clone(&catalog).run_refresh(refresh_rx, cancel.clone()));

    let worker_handles = if let Some(source) = source {
        let ctx = HandlerContext {
            store: Arc::clone(&store),
            live: live.clone(),
        };
        let router_config = RouterConfig {
            receive_wait: Duration::from_millis(config.consumer.receive_wait_ms),
            idle_backoff: Duration::from_millis(config.consumer.idle_backoff_ms),
        };
        let router = EventRouter::new(
            catalog,
            Arc::new(ConsumerRegistry::standard()),
            source,
            ctx,
            router_config,
        );
        let handles = router.spawn_workers(&cancel);
        info!(workers = handles.len(), "consumer workers started");
        handles
    } else {
        info!("external broker configured, consumers run out of process");
        Vec::new()
    };

    let state = AppState {
        store,
        provisioner,
        live,
        connections: Arc::new(ConnectionRegistry::new(
            config.server.max_sse_connections_per_product,
        )),
    };
    let app = api::router(state);

    let host = cli.host.unwrap_or_else(|| config.server.host.clone());
    let port = cli.port.unwrap_or(config.server.port);
    let listener = tokio::net::TcpListener::bind(format!("{host}:{port}")).await?;
    info!(addr = %listener.local_addr()?, "server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop workers and the refresh task, bounded so a stuck handler
    // cannot hold shutdown hostage. Workers settle their in-flight
    // message before exiting.
    info!("shutting down consumer workers");
    cancel.cancel();
    let drain = async {
        for handle in worker_handles {
            let _ = handle.await;
        }
        let _ = refresh_task.await;
    };
    let deadline = Duration::from_secs(config.server.shutdown_timeout_seconds);
    if tokio::time::timeout(deadline, drain).await.is_err() {
        warn!("shutdown timeout elapsed with workers still running");
    }

    info!("shutdown complete");
    Ok(())
}

/// Resolves on ctrl-c or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }

    info!("shutdown signal received");
}
