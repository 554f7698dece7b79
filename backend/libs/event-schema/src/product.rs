//! Catalog entity payloads carried by [`EventEnvelope`](crate::EventEnvelope).

use serde::{Deserialize, Serialize};

/// Product fields carried by create and update envelopes.
///
/// Every field is optional so the same type serves both shapes: a create
/// envelope carries the full entity, an update envelope carries only the
/// fields being changed. The apply side decides what "full" means for a
/// create (name and price are required there).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stock: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sku: Option<String>,
}

impl ProductPayload {
    /// Whether this payload is sufficient to materialize a new product.
    pub fn is_complete_for_create(&self) -> bool {
        self.name.is_some() && self.price.is_some()
    }
}

/// Stock delta applied by the inventory pipeline.
///
/// Positive delta restocks, negative delta reserves. Published on its own
/// topic but flows through the same envelope and consumer machinery as
/// product mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockAdjustment {
    pub delta: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_payload_skips_absent_fields() {
        let payload = ProductPayload {
            price: Some(12.0),
            ..ProductPayload::default()
        };

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json, serde_json::json!({"price": 12.0}));
    }

    #[test]
    fn test_create_completeness() {
        assert!(!ProductPayload::default().is_complete_for_create());
        assert!(ProductPayload {
            name: Some("Widget".into()),
            price: Some(10.0),
            ..ProductPayload::default()
        }
        .is_complete_for_create());
    }
}
