/// Configuration management for Product Service
///
/// This module handles loading and managing configuration from environment
/// variables.
use serde::{Deserialize, Serialize};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Application settings
    pub app: AppConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Kafka configuration
    pub kafka: KafkaConfig,
    /// Consumer-loop tuning
    pub consumer: ConsumerConfig,
}

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application environment (dev, staging, prod)
    pub env: String,
    /// Server host to bind to
    pub host: String,
    /// Server port to bind to
    pub port: u16,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database URL
    pub url: String,
    /// Max connections in pool
    pub max_connections: u32,
}

/// Kafka configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Kafka brokers
    pub brokers: Vec<String>,
    /// Product mutation topic
    pub product_topic: String,
    /// Stock-adjustment topic
    pub inventory_topic: String,
    /// Consumer group id
    pub group_id: String,
    #[serde(default = "default_kafka_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl KafkaConfig {
    /// Broker list in librdkafka's comma-separated form.
    pub fn broker_list(&self) -> String {
        self.brokers.join(",")
    }
}

/// Consumer-loop tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    pub batch_size: usize,
    pub poll_timeout_ms: u64,
    /// Retry budget for deterministic failures before dead-lettering
    pub max_apply_retries: u32,
    pub retry_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// How long shutdown waits for in-flight batches to commit
    pub shutdown_grace_ms: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, String> {
        let app_env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        Ok(Config {
            app: AppConfig {
                env: app_env,
                host: std::env::var("PRODUCT_SERVICE_HOST")
                    .unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: std::env::var("PRODUCT_SERVICE_PORT")
                    .ok()
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(8080),
            },
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "postgresql://localhost/catalog".to_string()),
                max_connections: std::env::var("DATABASE_MAX_CONNECTIONS")
                    .ok()
                    .and_then(|c| c.parse().ok())
                    .unwrap_or(10),
            },
            kafka: KafkaConfig {
                brokers: std::env::var("KAFKA_BROKERS")
                    .unwrap_or_else(|_| "localhost:9092".to_string())
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .collect(),
                product_topic: std::env::var("KAFKA_PRODUCT_TOPIC")
                    .unwrap_or_else(|_| "catalog.product.events".to_string()),
                inventory_topic: std::env::var("KAFKA_INVENTORY_TOPIC")
                    .unwrap_or_else(|_| "catalog.inventory.events".to_string()),
                group_id: std::env::var("KAFKA_GROUP_ID")
                    .unwrap_or_else(|_| "product-service".to_string()),
                request_timeout_ms: std::env::var("KAFKA_REQUEST_TIMEOUT_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_else(default_kafka_request_timeout_ms),
            },
            consumer: ConsumerConfig {
                batch_size: std::env::var("CONSUMER_BATCH_SIZE")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(100),
                poll_timeout_ms: std::env::var("CONSUMER_POLL_TIMEOUT_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(500),
                max_apply_retries: std::env::var("CONSUMER_MAX_APPLY_RETRIES")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(3),
                retry_backoff_ms: std::env::var("CONSUMER_RETRY_BACKOFF_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(100),
                max_backoff_ms: std::env::var("CONSUMER_MAX_BACKOFF_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(5_000),
                shutdown_grace_ms: std::env::var("CONSUMER_SHUTDOWN_GRACE_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(10_000),
            },
        })
    }
}

fn default_kafka_request_timeout_ms() -> u64 {
    5_000
}
