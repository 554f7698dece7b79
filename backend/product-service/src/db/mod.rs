/// Database access layer
///
/// The store trait is the seam between the apply engine and PostgreSQL:
/// tests drive the engine against an in-memory implementation, production
/// uses [`SqlxProductStore`]. Read-side queries for the HTTP handlers live
/// in `product_repo` as plain functions.
use async_trait::async_trait;
use event_schema::ProductPayload;
use uuid::Uuid;

use crate::models::{NewProduct, ProductRecord};

pub mod product_repo;

pub use product_repo::SqlxProductStore;

/// Result of an idempotency-guarded stock adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StockOutcome {
    /// Delta applied
    Applied,
    /// Event id was seen before; nothing changed
    Duplicate,
    /// Product is tombstoned; adjustment discarded
    Tombstoned,
    /// Product never existed
    NotFound,
}

/// Canonical-store operations available to the apply engine.
///
/// Every method is a single conditional write (or a read), so redelivery of
/// an already-applied envelope falls out as a no-op rather than an error.
#[async_trait]
pub trait ProductStore: Send + Sync {
    /// Fetch a row including tombstones; the apply engine needs to see them.
    async fn fetch_any(&self, id: Uuid) -> Result<Option<ProductRecord>, sqlx::Error>;

    /// Insert if no row (live or tombstoned) exists for the id.
    /// Returns false when one already does.
    async fn insert_if_absent(&self, product: &NewProduct) -> Result<bool, sqlx::Error>;

    /// Merge the supplied fields into a live row, guarded by the revision
    /// read beforehand. Returns false when the revision moved or the row is
    /// gone, which the caller treats as contention.
    async fn update_if_revision(
        &self,
        id: Uuid,
        expected_revision: i64,
        patch: &ProductPayload,
    ) -> Result<bool, sqlx::Error>;

    /// Tombstone a live row. Returns false when there was nothing live to
    /// delete (already tombstoned or never created) — a no-op, not an error.
    async fn tombstone(&self, id: Uuid) -> Result<bool, sqlx::Error>;

    /// Apply a stock delta exactly once per event id. Marking the event and
    /// adjusting the stock happen in one transaction, because a bare
    /// increment would double-count under at-least-once redelivery.
    async fn adjust_stock_once(
        &self,
        event_id: Uuid,
        id: Uuid,
        delta: i32,
    ) -> Result<StockOutcome, sqlx::Error>;
}
