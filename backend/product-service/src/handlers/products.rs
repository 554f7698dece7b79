/// Product handlers - HTTP endpoints for catalog operations
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use sqlx::PgPool;
use uuid::Uuid;
use validator::Validate;

use event_schema::{EventEnvelope, StockAdjustment};

use crate::db::product_repo;
use crate::error::{AppError, Result};
use crate::kafka::EventPublisher;
use crate::models::{AcceptedResponse, CreateProductRequest, UpdateProductRequest};
use crate::SERVICE_SOURCE;

/// Publisher plus the topics it writes to, shared across handlers.
pub struct PublishState {
    pub publisher: EventPublisher,
    pub product_topic: String,
    pub inventory_topic: String,
}

#[derive(Debug, Deserialize)]
pub struct PaginationParams {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct AdjustStockRequest {
    pub delta: i32,
}

/// Accept a product creation.
///
/// The id is assigned here (or taken from the request) so the client can
/// poll the read path for the product before the consumer has applied it.
pub async fn create_product(
    publish: web::Data<PublishState>,
    req: web::Json<CreateProductRequest>,
) -> Result<HttpResponse> {
    let req = req.into_inner();
    req.validate()?;

    let product_id = req.id.unwrap_or_else(Uuid::new_v4);
    let envelope = EventEnvelope::create(SERVICE_SOURCE, product_id, req.into_payload());
    let event_id = envelope.event_id;

    publish
        .publisher
        .publish(&publish.product_topic, &envelope)
        .await?;

    Ok(HttpResponse::Accepted().json(AcceptedResponse::new(product_id, event_id)))
}

/// Accept a partial update for an existing product.
pub async fn update_product(
    publish: web::Data<PublishState>,
    product_id: web::Path<Uuid>,
    req: web::Json<UpdateProductRequest>,
) -> Result<HttpResponse> {
    let req = req.into_inner();
    req.validate()?;
    if req.is_empty() {
        return Err(AppError::BadRequest(
            "update must change at least one field".to_string(),
        ));
    }

    let envelope = EventEnvelope::update(SERVICE_SOURCE, *product_id, req.into_payload());
    let event_id = envelope.event_id;

    publish
        .publisher
        .publish(&publish.product_topic, &envelope)
        .await?;

    Ok(HttpResponse::Accepted().json(AcceptedResponse::new(*product_id, event_id)))
}

/// Accept a product deletion.
///
/// Always 202, even for ids that were never created; the apply engine treats
/// the resulting no-op delete as success.
pub async fn delete_product(
    publish: web::Data<PublishState>,
    product_id: web::Path<Uuid>,
) -> Result<HttpResponse> {
    let envelope = EventEnvelope::<event_schema::ProductPayload>::delete(SERVICE_SOURCE, *product_id);
    let event_id = envelope.event_id;

    publish
        .publisher
        .publish(&publish.product_topic, &envelope)
        .await?;

    Ok(HttpResponse::Accepted().json(AcceptedResponse::new(*product_id, event_id)))
}

/// Accept a stock adjustment, published to the inventory topic.
pub async fn adjust_stock(
    publish: web::Data<PublishState>,
    product_id: web::Path<Uuid>,
    req: web::Json<AdjustStockRequest>,
) -> Result<HttpResponse> {
    if req.delta == 0 {
        return Err(AppError::BadRequest(
            "stock adjustment delta must be non-zero".to_string(),
        ));
    }

    let envelope = EventEnvelope::update(
        SERVICE_SOURCE,
        *product_id,
        StockAdjustment { delta: req.delta },
    );
    let event_id = envelope.event_id;

    publish
        .publisher
        .publish(&publish.inventory_topic, &envelope)
        .await?;

    Ok(HttpResponse::Accepted().json(AcceptedResponse::new(*product_id, event_id)))
}

/// Get a product by ID.
///
/// Reads the canonical store, so a just-accepted mutation may not be
/// visible yet.
pub async fn get_product(
    pool: web::Data<PgPool>,
    product_id: web::Path<Uuid>,
) -> Result<HttpResponse> {
    match product_repo::find_product_by_id(&pool, *product_id).await? {
        Some(product) => Ok(HttpResponse::Ok().json(product)),
        None => Err(AppError::NotFound(format!(
            "product {} not found",
            product_id
        ))),
    }
}

/// List live products with pagination.
pub async fn list_products(
    pool: web::Data<PgPool>,
    query: web::Query<PaginationParams>,
) -> Result<HttpResponse> {
    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    let offset = query.offset.unwrap_or(0).max(0);

    let products = product_repo::list_products(&pool, limit, offset).await?;
    Ok(HttpResponse::Ok().json(products))
}
