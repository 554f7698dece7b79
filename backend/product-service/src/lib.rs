/// Product Service Library
///
/// Catalog service with event-driven state synchronization. HTTP mutations
/// never touch the `products` table directly: they are published as envelopes
/// to Kafka and acknowledged with 202 Accepted, and background consumer loops
/// apply them to PostgreSQL. Reads go straight to the store and may lag the
/// most recently accepted write.
///
/// # Modules
///
/// - `handlers`: HTTP request handlers (publish on write, read from store)
/// - `models`: request payloads and the canonical product row
/// - `services`: apply engine (the only mutator of the store)
/// - `db`: store trait and PostgreSQL repository
/// - `kafka`: envelope publisher
/// - `consumers`: background-loop lifecycle owner
/// - `error`: error types and HTTP mapping
/// - `config`: configuration management
/// - `metrics`: Prometheus collectors
pub mod config;
pub mod consumers;
pub mod db;
pub mod error;
pub mod handlers;
pub mod kafka;
pub mod metrics;
pub mod models;
pub mod services;

pub use config::Config;
pub use error::{AppError, Result};

/// Source tag stamped into every envelope this service publishes.
pub const SERVICE_SOURCE: &str = "product-service";
