//! Durable (topic, partition) → offset mapping.
//!
//! Kafka's own committed offsets are the primary cursor, but consumer
//! progress must stay readable and writable independently of the log, so
//! every batch commit is mirrored into the `consumer_offsets` table and
//! consulted on startup.

use anyhow::Context;
use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::debug;

use crate::error::StateResult;

/// Persistent store for per-partition consumer progress.
///
/// The stored value is the offset of the last successfully applied envelope.
/// It never moves past an envelope that has not been durably applied.
#[async_trait]
pub trait OffsetStore: Send + Sync {
    /// Offset of the last applied envelope, if any progress was recorded.
    async fn load(&self, group_id: &str, topic: &str, partition: i32)
        -> StateResult<Option<i64>>;

    /// Record progress after a fully applied batch.
    async fn commit(
        &self,
        group_id: &str,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> StateResult<()>;
}

/// PostgreSQL-backed implementation of [`OffsetStore`].
pub struct SqlxOffsetStore {
    pool: PgPool,
}

impl SqlxOffsetStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OffsetStore for SqlxOffsetStore {
    async fn load(
        &self,
        group_id: &str,
        topic: &str,
        partition: i32,
    ) -> StateResult<Option<i64>> {
        let row = sqlx::query(
            r#"
            SELECT last_offset
            FROM consumer_offsets
            WHERE group_id = $1 AND topic = $2 AND partition = $3
            "#,
        )
        .bind(group_id)
        .bind(topic)
        .bind(partition)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load consumer offset")?;

        Ok(row.map(|r| r.get::<i64, _>("last_offset")))
    }

    async fn commit(
        &self,
        group_id: &str,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> StateResult<()> {
        sqlx::query(
            r#"
            INSERT INTO consumer_offsets (group_id, topic, partition, last_offset, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (group_id, topic, partition)
            DO UPDATE SET last_offset = EXCLUDED.last_offset, updated_at = NOW()
            "#,
        )
        .bind(group_id)
        .bind(topic)
        .bind(partition)
        .bind(offset)
        .execute(&self.pool)
        .await
        .context("Failed to commit consumer offset")?;

        debug!(
            group_id = %group_id,
            topic = %topic,
            partition = partition,
            offset = offset,
            "Consumer offset committed"
        );

        Ok(())
    }
}
