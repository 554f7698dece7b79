/// Data structures for the product catalog.
use chrono::{DateTime, Utc};
use event_schema::ProductPayload;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// Canonical product row.
///
/// Mutated only by the apply engine; the HTTP layer reads it and nothing
/// else. A non-null `deleted_at` is a tombstone: the product is gone from
/// every read path but the row keeps recording that a delete happened, which
/// is what lets a redelivered earlier update lose to it.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ProductRecord {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub price: f64,
    pub stock: i32,
    pub brand: Option<String>,
    pub category: Option<String>,
    pub sku: Option<String>,
    /// Bumped on every applied mutation; apply uses it for conditional writes
    pub revision: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing)]
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Fully materialized product ready for insertion.
///
/// Built by the apply engine from a create payload that passed
/// completeness validation, so required fields are plain values here.
#[derive(Debug, Clone)]
pub struct NewProduct {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub price: f64,
    pub stock: i32,
    pub brand: Option<String>,
    pub category: Option<String>,
    pub sku: Option<String>,
}

impl NewProduct {
    /// Materialize from a create payload. Returns `None` when the payload
    /// lacks required fields.
    pub fn from_payload(id: Uuid, payload: &ProductPayload) -> Option<Self> {
        let name = payload.name.clone()?;
        let price = payload.price?;
        Some(Self {
            id,
            name,
            description: payload.description.clone(),
            price,
            stock: payload.stock.unwrap_or(0),
            brand: payload.brand.clone(),
            category: payload.category.clone(),
            sku: payload.sku.clone(),
        })
    }
}

/// Create-product request body.
#[derive(Debug, Deserialize, Validate)]
pub struct CreateProductRequest {
    /// Caller-assigned id; the service assigns one when absent
    pub id: Option<Uuid>,
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    pub description: Option<String>,
    #[validate(range(min = 0.0))]
    pub price: f64,
    #[validate(range(min = 0))]
    pub stock: Option<i32>,
    pub brand: Option<String>,
    pub category: Option<String>,
    pub sku: Option<String>,
}

impl CreateProductRequest {
    pub fn into_payload(self) -> ProductPayload {
        ProductPayload {
            name: Some(self.name),
            description: self.description,
            price: Some(self.price),
            stock: self.stock,
            brand: self.brand,
            category: self.category,
            sku: self.sku,
        }
    }
}

/// Partial-update request body; absent fields stay unchanged.
#[derive(Debug, Deserialize, Validate)]
pub struct UpdateProductRequest {
    #[validate(length(min = 1, max = 255))]
    pub name: Option<String>,
    pub description: Option<String>,
    #[validate(range(min = 0.0))]
    pub price: Option<f64>,
    #[validate(range(min = 0))]
    pub stock: Option<i32>,
    pub brand: Option<String>,
    pub category: Option<String>,
    pub sku: Option<String>,
}

impl UpdateProductRequest {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.price.is_none()
            && self.stock.is_none()
            && self.brand.is_none()
            && self.category.is_none()
            && self.sku.is_none()
    }

    pub fn into_payload(self) -> ProductPayload {
        ProductPayload {
            name: self.name,
            description: self.description,
            price: self.price,
            stock: self.stock,
            brand: self.brand,
            category: self.category,
            sku: self.sku,
        }
    }
}

/// Response for accepted (not yet applied) mutations.
#[derive(Debug, Serialize)]
pub struct AcceptedResponse {
    pub id: Uuid,
    pub event_id: Uuid,
    pub status: &'static str,
}

impl AcceptedResponse {
    pub fn new(id: Uuid, event_id: Uuid) -> Self {
        Self {
            id,
            event_id,
            status: "accepted",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_product_requires_name_and_price() {
        let id = Uuid::new_v4();
        assert!(NewProduct::from_payload(id, &ProductPayload::default()).is_none());

        let payload = ProductPayload {
            name: Some("Widget".into()),
            price: Some(10.0),
            ..ProductPayload::default()
        };
        let product = NewProduct::from_payload(id, &payload).unwrap();
        assert_eq!(product.stock, 0);
        assert_eq!(product.name, "Widget");
    }

    #[test]
    fn test_create_request_rejects_bad_fields() {
        let negative_price = CreateProductRequest {
            id: None,
            name: "Widget".into(),
            description: None,
            price: -1.0,
            stock: None,
            brand: None,
            category: None,
            sku: None,
        };
        assert!(negative_price.validate().is_err());

        let empty_name = CreateProductRequest {
            id: None,
            name: String::new(),
            description: None,
            price: 10.0,
            stock: None,
            brand: None,
            category: None,
            sku: None,
        };
        assert!(empty_name.validate().is_err());
    }

    #[test]
    fn test_empty_update_detection() {
        let update = UpdateProductRequest {
            name: None,
            description: None,
            price: None,
            stock: None,
            brand: None,
            category: None,
            sku: None,
        };
        assert!(update.is_empty());
    }
}
