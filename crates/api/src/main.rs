//! API server entry point.

use std::sync::Arc;

use api::config::{BusBackend, Config, LogFormat};
use api::seed::Seed;
use domain::{
    InMemoryOrderStore, InMemoryStockLedger, InMemoryTransactionStore, OrderStore,
    PostgresOrderStore, PostgresTransactionStore, TransactionStore,
};
use event_bus::{EventBus, InMemoryEventBus, InMemoryInbox, Inbox, PostgresInbox};
use saga::{
    CheckoutSaga, Collaborators, InMemoryCartService, InMemoryPaymentGateway, InMemorySearchIndex,
    InMemoryUserService, SagaConsumer,
};
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Order, transaction and inbox storage: PostgreSQL when configured.
async fn stores(
    config: &Config,
) -> (
    Arc<dyn OrderStore>,
    Arc<dyn TransactionStore>,
    Arc<dyn Inbox>,
) {
    let Some(url) = config.database_url.as_deref() else {
        tracing::warn!("DATABASE_URL not set, using in-memory stores");
        return (
            Arc::new(InMemoryOrderStore::new()),
            Arc::new(InMemoryTransactionStore::new()),
            Arc::new(InMemoryInbox::new()),
        );
    };

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(url)
        .await
        .expect("failed to connect to PostgreSQL");
    domain::run_migrations(&pool)
        .await
        .expect("failed to run migrations");
    tracing::info!("connected to PostgreSQL, migrations applied");

    (
        Arc::new(PostgresOrderStore::new(pool.clone())),
        Arc::new(PostgresTransactionStore::new(pool.clone())),
        Arc::new(PostgresInbox::new(pool)),
    )
}

/// The event bus. The in-memory bus is also returned so it can be closed.
fn event_bus(backend: BusBackend) -> (Arc<dyn EventBus>, Option<InMemoryEventBus>) {
    match backend {
        BusBackend::InMemory => {
            tracing::warn!("KAFKA_BROKERS not set, using the in-memory event bus");
            let bus = InMemoryEventBus::new();
            (Arc::new(bus.clone()), Some(bus))
        }
        BusBackend::Kafka { brokers } => (kafka_bus(&brokers), None),
    }
}

#[cfg(feature = "kafka")]
fn kafka_bus(brokers: &str) -> Arc<dyn EventBus> {
    let config = event_bus::KafkaEventBusConfig::new(brokers);
    Arc::new(event_bus::KafkaEventBus::new(config).expect("failed to create Kafka producer"))
}

#[cfg(not(feature = "kafka"))]
fn kafka_bus(_brokers: &str) -> Arc<dyn EventBus> {
    panic!("KAFKA_BROKERS is set but the api was built without the `kafka` feature");
}

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    // 1. Initialize tracing
    init_tracing(&config);

    // 2. Install Prometheus metrics recorder
    let prometheus_builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    let metrics_handle = prometheus_builder
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 3. Wire the saga
    let backend = config.bus_backend().expect("invalid event bus configuration");
    let (orders, transactions, inbox) = stores(&config).await;
    let (bus, in_memory_bus) = event_bus(backend);

    let ledger = InMemoryStockLedger::new();
    let cart = InMemoryCartService::new();
    let users = InMemoryUserService::new();
    if let Some(path) = config.seed_path.as_deref() {
        let seed = Seed::load(path).expect("failed to load seed file");
        seed.apply(&ledger, &cart, &users).await;
    }

    let saga = CheckoutSaga::new(
        Collaborators {
            orders,
            transactions,
            ledger: Arc::new(ledger),
            cart: Arc::new(cart),
            users: Arc::new(users),
            gateway: Arc::new(InMemoryPaymentGateway::new()),
            search: Arc::new(InMemorySearchIndex::new()),
            bus: bus.clone(),
        },
        config.saga.clone(),
    );

    // 4. Start consumers and the outbox relay
    let consumer = SagaConsumer::new(bus, inbox, config.saga.clone());
    saga.start(&consumer)
        .await
        .expect("failed to start saga consumers");

    // 5. Build the application
    let app = api::create_app(Arc::new(api::AppState::new(&saga)), metrics_handle);

    // 6. Start server
    let addr = config.addr();
    tracing::info!(%addr, "starting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // 7. Drain in-flight saga messages
    consumer.shutdown().await;
    if let Some(bus) = in_memory_bus {
        bus.close();
    }

    tracing::info!("server shut down gracefully");
}
