use async_trait::async_trait;
use event_schema::ProductPayload;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::db::{ProductStore, StockOutcome};
use crate::models::{NewProduct, ProductRecord};

/// Find a product by ID (excluding tombstoned products)
pub async fn find_product_by_id(
    pool: &PgPool,
    product_id: Uuid,
) -> Result<Option<ProductRecord>, sqlx::Error> {
    let product = sqlx::query_as::<_, ProductRecord>(
        r#"
        SELECT id, name, description, price, stock, brand, category, sku,
               revision, created_at, updated_at, deleted_at
        FROM products
        WHERE id = $1 AND deleted_at IS NULL
        "#,
    )
    .bind(product_id)
    .fetch_optional(pool)
    .await?;

    Ok(product)
}

/// List live products in descending order by creation date
pub async fn list_products(
    pool: &PgPool,
    limit: i64,
    offset: i64,
) -> Result<Vec<ProductRecord>, sqlx::Error> {
    let products = sqlx::query_as::<_, ProductRecord>(
        r#"
        SELECT id, name, description, price, stock, brand, category, sku,
               revision, created_at, updated_at, deleted_at
        FROM products
        WHERE deleted_at IS NULL
        ORDER BY created_at DESC
        LIMIT $1 OFFSET $2
        "#,
    )
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;

    Ok(products)
}

/// PostgreSQL-backed implementation of [`ProductStore`].
pub struct SqlxProductStore {
    pool: PgPool,
}

impl SqlxProductStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProductStore for SqlxProductStore {
    async fn fetch_any(&self, id: Uuid) -> Result<Option<ProductRecord>, sqlx::Error> {
        sqlx::query_as::<_, ProductRecord>(
            r#"
            SELECT id, name, description, price, stock, brand, category, sku,
                   revision, created_at, updated_at, deleted_at
            FROM products
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn insert_if_absent(&self, product: &NewProduct) -> Result<bool, sqlx::Error> {
        // ON CONFLICT DO NOTHING makes duplicate creates a no-op, which is
        // what keeps redelivered create envelopes harmless.
        let result = sqlx::query(
            r#"
            INSERT INTO products (id, name, description, price, stock, brand, category, sku)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(product.id)
        .bind(&product.name)
        .bind(&product.description)
        .bind(product.price)
        .bind(product.stock)
        .bind(&product.brand)
        .bind(&product.category)
        .bind(&product.sku)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_if_revision(
        &self,
        id: Uuid,
        expected_revision: i64,
        patch: &ProductPayload,
    ) -> Result<bool, sqlx::Error> {
        // COALESCE keeps unspecified fields unchanged; the revision guard is
        // the conditional write that defends against concurrent apply of the
        // same entity.
        let result = sqlx::query(
            r#"
            UPDATE products
            SET name        = COALESCE($3, name),
                description = COALESCE($4, description),
                price       = COALESCE($5, price),
                stock       = COALESCE($6, stock),
                brand       = COALESCE($7, brand),
                category    = COALESCE($8, category),
                sku         = COALESCE($9, sku),
                revision    = revision + 1,
                updated_at  = NOW()
            WHERE id = $1 AND revision = $2 AND deleted_at IS NULL
            "#,
        )
        .bind(id)
        .bind(expected_revision)
        .bind(&patch.name)
        .bind(&patch.description)
        .bind(patch.price)
        .bind(patch.stock)
        .bind(&patch.brand)
        .bind(&patch.category)
        .bind(&patch.sku)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn tombstone(&self, id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE products
            SET deleted_at = NOW(),
                revision   = revision + 1,
                updated_at = NOW()
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn adjust_stock_once(
        &self,
        event_id: Uuid,
        id: Uuid,
        delta: i32,
    ) -> Result<StockOutcome, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let marked = sqlx::query(
            r#"
            INSERT INTO applied_events (event_id)
            VALUES ($1)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(event_id)
        .execute(&mut *tx)
        .await?;

        if marked.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(StockOutcome::Duplicate);
        }

        let updated = sqlx::query(
            r#"
            UPDATE products
            SET stock      = stock + $2,
                revision   = revision + 1,
                updated_at = NOW()
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(id)
        .bind(delta)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() > 0 {
            tx.commit().await?;
            return Ok(StockOutcome::Applied);
        }

        // Nothing live to adjust; find out why before deciding the outcome.
        let exists = sqlx::query("SELECT 1 AS present FROM products WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .map(|row| row.get::<i32, _>("present"))
            .is_some();

        if exists {
            // Keep the event marker so a redelivered adjustment for a
            // tombstoned product stays a no-op.
            tx.commit().await?;
            Ok(StockOutcome::Tombstoned)
        } else {
            // Drop the marker: nothing was applied, and a later redelivery
            // must be able to apply the delta once the create lands.
            tx.rollback().await?;
            Ok(StockOutcome::NotFound)
        }
    }
}
