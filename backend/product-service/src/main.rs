use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpResponse, HttpServer};
use chrono::Utc;
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use event_consumer::{
    ConsumerConfig, ConsumerLoop, RetryPolicy, SqlxDeadLetterSink, SqlxOffsetStore,
};
use product_service::consumers::{ConsumerSupervisor, MeteredDeadLetterSink};
use product_service::db::SqlxProductStore;
use product_service::handlers::{self, PublishState};
use product_service::kafka::EventPublisher;
use product_service::services::{ProductApplier, StockApplier};
use product_service::{metrics, Config};

struct HealthState {
    db_pool: sqlx::Pool<sqlx::Postgres>,
}

#[derive(Serialize, Clone)]
#[serde(rename_all = "lowercase")]
enum ComponentStatus {
    Healthy,
    Unhealthy,
}

#[derive(Serialize)]
struct ComponentCheck {
    status: ComponentStatus,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    latency_ms: Option<u64>,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    status: ComponentStatus,
    checks: HashMap<String, ComponentCheck>,
    timestamp: String,
}

impl HealthState {
    async fn check_postgres(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.db_pool)
            .await
            .map(|_| ())
    }
}

async fn health_summary(state: web::Data<HealthState>) -> HttpResponse {
    match state.check_postgres().await {
        Ok(_) => HttpResponse::Ok().json(serde_json::json!({
            "status": "ok",
            "service": "product-service",
            "version": env!("CARGO_PKG_VERSION")
        })),
        Err(e) => HttpResponse::ServiceUnavailable().json(serde_json::json!({
            "status": "unhealthy",
            "error": format!("PostgreSQL connection failed: {}", e),
            "service": "product-service"
        })),
    }
}

async fn readiness_summary(state: web::Data<HealthState>) -> HttpResponse {
    let mut checks = HashMap::new();
    let mut ready = true;

    let start = Instant::now();
    let pg_result = state.check_postgres().await;
    let pg_latency = Some(start.elapsed().as_millis() as u64);
    let postgres_check = match pg_result {
        Ok(_) => ComponentCheck {
            status: ComponentStatus::Healthy,
            message: "PostgreSQL connection successful".to_string(),
            latency_ms: pg_latency,
        },
        Err(e) => {
            ready = false;
            ComponentCheck {
                status: ComponentStatus::Unhealthy,
                message: format!("PostgreSQL connection failed: {}", e),
                latency_ms: pg_latency,
            }
        }
    };
    checks.insert("postgresql".to_string(), postgres_check);

    let status = if ready {
        ComponentStatus::Healthy
    } else {
        ComponentStatus::Unhealthy
    };

    let response = ReadinessResponse {
        ready,
        status,
        checks,
        timestamp: Utc::now().to_rfc3339(),
    };

    if ready {
        HttpResponse::Ok().json(response)
    } else {
        HttpResponse::ServiceUnavailable().json(response)
    }
}

async fn liveness_check() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({"alive": true}))
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = terminate.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    }
}

/// Product Service
///
/// Event-driven catalog service. HTTP mutations publish envelopes to Kafka
/// and answer 202 Accepted; background consumer loops apply them to
/// PostgreSQL idempotently. Reads query the store directly.
///
/// # Routes
///
/// - `POST   /api/v1/products` - accept a product creation
/// - `GET    /api/v1/products` - list live products
/// - `GET    /api/v1/products/{id}` - read one product (may lag writes)
/// - `PATCH  /api/v1/products/{id}` - accept a partial update
/// - `DELETE /api/v1/products/{id}` - accept a deletion
/// - `POST   /api/v1/products/{id}/stock` - accept a stock adjustment
#[actix_web::main]
async fn main() -> io::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,actix_web=debug,sqlx=warn,rdkafka=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!("Configuration loading failed: {}", e);
            eprintln!("ERROR: Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    tracing::info!("Starting product-service v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Environment: {}", config.app.env);

    metrics::initialize_metrics();

    // Initialize database connection pool
    let db_pool = match PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await
    {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!("Database pool creation failed: {}", e);
            eprintln!("ERROR: Failed to connect to database: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = sqlx::migrate!("./migrations").run(&db_pool).await {
        tracing::error!("Database migration failed: {}", e);
        eprintln!("ERROR: Failed to run migrations: {}", e);
        std::process::exit(1);
    }

    tracing::info!("Connected to database, migrations applied");

    let broker_list = config.kafka.broker_list();

    // Publisher for the write path
    let publisher = match EventPublisher::new(&broker_list, config.kafka.request_timeout_ms) {
        Ok(publisher) => publisher,
        Err(e) => {
            tracing::error!("Kafka producer creation failed: {}", e);
            eprintln!("ERROR: Failed to create Kafka producer: {}", e);
            std::process::exit(1);
        }
    };

    let publish_state = web::Data::new(PublishState {
        publisher,
        product_topic: config.kafka.product_topic.clone(),
        inventory_topic: config.kafka.inventory_topic.clone(),
    });

    // Consumer-side plumbing: one shared store, offsets, dead letters
    let product_store = Arc::new(SqlxProductStore::new(db_pool.clone()));
    let offset_store = Arc::new(SqlxOffsetStore::new(db_pool.clone()));
    let dead_letters = Arc::new(MeteredDeadLetterSink::new(SqlxDeadLetterSink::new(
        db_pool.clone(),
    )));

    let retry = RetryPolicy {
        max_retries: config.consumer.max_apply_retries,
        backoff_ms: config.consumer.retry_backoff_ms,
        max_backoff_ms: config.consumer.max_backoff_ms,
    };

    let consumer_config = |topic: &str| ConsumerConfig {
        brokers: broker_list.clone(),
        group_id: config.kafka.group_id.clone(),
        topic: topic.to_string(),
        batch_size: config.consumer.batch_size,
        poll_timeout: Duration::from_millis(config.consumer.poll_timeout_ms),
        retry: retry.clone(),
    };

    let mut supervisor = ConsumerSupervisor::new();

    supervisor.spawn(
        "product-events",
        ConsumerLoop::new(
            consumer_config(&config.kafka.product_topic),
            Arc::new(ProductApplier::new(product_store.clone())),
            offset_store.clone(),
            dead_letters.clone(),
            supervisor.subscribe(),
        ),
    );
    supervisor.spawn(
        "inventory-events",
        ConsumerLoop::new(
            consumer_config(&config.kafka.inventory_topic),
            Arc::new(StockApplier::new(product_store.clone())),
            offset_store.clone(),
            dead_letters.clone(),
            supervisor.subscribe(),
        ),
    );

    let health_state = web::Data::new(HealthState {
        db_pool: db_pool.clone(),
    });
    let db_pool_http = db_pool.clone();

    let bind_address = format!("{}:{}", config.app.host, config.app.port);
    tracing::info!("Starting HTTP server at {}", bind_address);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(db_pool_http.clone()))
            .app_data(publish_state.clone())
            .app_data(health_state.clone())
            .wrap(cors)
            .wrap(Logger::default())
            .wrap(tracing_actix_web::TracingLogger::default())
            .route("/metrics", web::get().to(metrics::metrics_handler))
            // Health check endpoints
            .route("/api/v1/health", web::get().to(health_summary))
            .route("/api/v1/health/ready", web::get().to(readiness_summary))
            .route("/api/v1/health/live", web::get().to(liveness_check))
            .service(
                web::scope("/api/v1/products")
                    .service(
                        web::resource("")
                            .route(web::post().to(handlers::create_product))
                            .route(web::get().to(handlers::list_products)),
                    )
                    .service(
                        web::resource("/{product_id}")
                            .route(web::get().to(handlers::get_product))
                            .route(web::patch().to(handlers::update_product))
                            .route(web::delete().to(handlers::delete_product)),
                    )
                    .route(
                        "/{product_id}/stock",
                        web::post().to(handlers::adjust_stock),
                    ),
            )
    })
    .bind(&bind_address)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    shutdown_signal().await;
    tracing::info!("Shutdown signal received");

    // Stop accepting requests first, then drain the consumer loops so
    // in-flight batches commit before the process exits.
    server_handle.stop(true).await;
    supervisor
        .shutdown(Duration::from_millis(config.consumer.shutdown_grace_ms))
        .await;

    match server_task.await {
        Ok(result) => result,
        Err(e) => Err(io::Error::new(io::ErrorKind::Other, e.to_string())),
    }
}
