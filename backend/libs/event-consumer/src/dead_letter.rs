//! Append-only sink for envelopes that exhaust their retry budget.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use crate::error::StateResult;
use crate::RawEvent;

/// A dead-lettered envelope with its original content intact.
#[derive(Debug, Clone)]
pub struct DeadLetterEntry {
    pub id: Uuid,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// Original partition key, when it was valid UTF-8
    pub key: Option<String>,
    /// Original payload bytes, unmodified
    pub payload: Vec<u8>,
    pub failure_reason: String,
    pub retry_count: i32,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn from_event(event: &RawEvent, reason: impl Into<String>, retry_count: i32) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: event.topic.clone(),
            partition: event.partition,
            offset: event.offset,
            key: event
                .key
                .as_ref()
                .and_then(|k| String::from_utf8(k.clone()).ok()),
            payload: event.payload.clone(),
            failure_reason: reason.into(),
            retry_count,
            failed_at: Utc::now(),
        }
    }
}

/// Destination for envelopes that permanently failed to apply.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn record(&self, entry: &DeadLetterEntry) -> StateResult<()>;
}

/// PostgreSQL-backed implementation of [`DeadLetterSink`].
pub struct SqlxDeadLetterSink {
    pool: PgPool,
}

impl SqlxDeadLetterSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeadLetterSink for SqlxDeadLetterSink {
    async fn record(&self, entry: &DeadLetterEntry) -> StateResult<()> {
        sqlx::query(
            r#"
            INSERT INTO dead_letter_events (
                id, topic, partition, log_offset, partition_key,
                payload, failure_reason, retry_count, failed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(entry.id)
        .bind(&entry.topic)
        .bind(entry.partition)
        .bind(entry.offset)
        .bind(&entry.key)
        .bind(&entry.payload)
        .bind(&entry.failure_reason)
        .bind(entry.retry_count)
        .bind(entry.failed_at)
        .execute(&self.pool)
        .await
        .context("Failed to record dead-lettered event")?;

        warn!(
            topic = %entry.topic,
            partition = entry.partition,
            offset = entry.offset,
            reason = %entry.failure_reason,
            retry_count = entry.retry_count,
            "Envelope routed to dead-letter sink"
        );

        Ok(())
    }
}
