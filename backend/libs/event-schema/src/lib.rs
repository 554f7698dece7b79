use chrono::{DateTime, Utc};
/// Event Schema Registry for the catalog Kafka topics
///
/// This library defines versioned event envelopes so producers and consumers
/// agree on payload shape as the services evolve. Each envelope carries a
/// required `schema_version` field. The envelope is generic over the entity
/// payload: the product pipeline and the stock-adjustment pipeline share one
/// definition instead of duplicating it per entity type.
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod product;

pub use product::{ProductPayload, StockAdjustment};

/// Current schema version for all envelopes
pub const SCHEMA_VERSION: u32 = 1;

/// Errors raised when an envelope violates the shape contract.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum EnvelopeError {
    /// Create/update envelopes must carry an entity payload
    #[error("{0} envelope is missing its payload")]
    MissingPayload(CatalogAction),

    /// Delete envelopes carry only the entity id
    #[error("delete envelope must not carry a payload")]
    UnexpectedPayload,

    /// Schema version does not match what this consumer understands
    #[error("incompatible schema version {found} (expected {expected})")]
    IncompatibleVersion { expected: u32, found: u32 },
}

/// The mutation an envelope represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatalogAction {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for CatalogAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CatalogAction::Create => write!(f, "create"),
            CatalogAction::Update => write!(f, "update"),
            CatalogAction::Delete => write!(f, "delete"),
        }
    }
}

/// Wire representation of a single catalog mutation.
///
/// Immutable once published. `entity_id` doubles as the Kafka partition key,
/// which is what gives every entity an ordered event sub-stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope<T> {
    /// Unique event ID for idempotency and tracing
    pub event_id: Uuid,
    /// Entity this mutation targets (also the partition key)
    pub entity_id: Uuid,
    /// Mutation kind; determines the payload shape
    pub action: CatalogAction,
    /// Schema version for compatibility checking
    pub schema_version: u32,
    /// Event timestamp
    pub occurred_at: DateTime<Utc>,
    /// Source service that generated the event
    pub source: String,
    /// Entity payload; `None` for deletes
    pub payload: Option<T>,
}

impl<T> EventEnvelope<T> {
    /// Envelope for a create mutation carrying the full entity.
    pub fn create(source: impl Into<String>, entity_id: Uuid, payload: T) -> Self {
        Self::new(source, entity_id, CatalogAction::Create, Some(payload))
    }

    /// Envelope for an update mutation carrying the changed fields.
    pub fn update(source: impl Into<String>, entity_id: Uuid, payload: T) -> Self {
        Self::new(source, entity_id, CatalogAction::Update, Some(payload))
    }

    /// Envelope for a delete mutation; carries only the entity id.
    pub fn delete(source: impl Into<String>, entity_id: Uuid) -> Self {
        Self::new(source, entity_id, CatalogAction::Delete, None)
    }

    fn new(
        source: impl Into<String>,
        entity_id: Uuid,
        action: CatalogAction,
        payload: Option<T>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            entity_id,
            action,
            schema_version: SCHEMA_VERSION,
            occurred_at: Utc::now(),
            source: source.into(),
            payload,
        }
    }

    /// Check the action/payload shape invariant and the schema version.
    ///
    /// Create and update envelopes must carry a payload; delete envelopes
    /// must not. Consumers call this before applying so a malformed envelope
    /// is rejected deterministically.
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        if !is_compatible(SCHEMA_VERSION, self.schema_version) {
            return Err(EnvelopeError::IncompatibleVersion {
                expected: SCHEMA_VERSION,
                found: self.schema_version,
            });
        }

        match (self.action, self.payload.is_some()) {
            (CatalogAction::Delete, true) => Err(EnvelopeError::UnexpectedPayload),
            (CatalogAction::Create | CatalogAction::Update, false) => {
                Err(EnvelopeError::MissingPayload(self.action))
            }
            _ => Ok(()),
        }
    }

    /// Kafka partition key for this envelope.
    pub fn partition_key(&self) -> String {
        self.entity_id.to_string()
    }
}

pub fn is_compatible(current_version: u32, message_version: u32) -> bool {
    // For now, enforce exact version match
    current_version == message_version
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_envelope_shape() {
        let entity_id = Uuid::new_v4();
        let envelope = EventEnvelope::create(
            "product-service",
            entity_id,
            ProductPayload {
                name: Some("Widget".to_string()),
                price: Some(10.0),
                ..ProductPayload::default()
            },
        );

        assert_eq!(envelope.schema_version, SCHEMA_VERSION);
        assert_eq!(envelope.entity_id, entity_id);
        assert_eq!(envelope.action, CatalogAction::Create);
        assert!(envelope.validate().is_ok());
        assert_eq!(envelope.partition_key(), entity_id.to_string());
    }

    #[test]
    fn test_delete_envelope_carries_no_payload() {
        let envelope = EventEnvelope::<ProductPayload>::delete("product-service", Uuid::new_v4());
        assert!(envelope.payload.is_none());
        assert!(envelope.validate().is_ok());
    }

    #[test]
    fn test_delete_with_payload_is_rejected() {
        let mut envelope =
            EventEnvelope::<ProductPayload>::delete("product-service", Uuid::new_v4());
        envelope.payload = Some(ProductPayload::default());
        assert_eq!(envelope.validate(), Err(EnvelopeError::UnexpectedPayload));
    }

    #[test]
    fn test_update_without_payload_is_rejected() {
        let mut envelope = EventEnvelope::update(
            "product-service",
            Uuid::new_v4(),
            ProductPayload::default(),
        );
        envelope.payload = None;
        assert_eq!(
            envelope.validate(),
            Err(EnvelopeError::MissingPayload(CatalogAction::Update))
        );
    }

    #[test]
    fn test_incompatible_version_is_rejected() {
        let mut envelope = EventEnvelope::<ProductPayload>::delete("product-service", Uuid::new_v4());
        envelope.schema_version = SCHEMA_VERSION + 1;
        assert_eq!(
            envelope.validate(),
            Err(EnvelopeError::IncompatibleVersion {
                expected: SCHEMA_VERSION,
                found: SCHEMA_VERSION + 1,
            })
        );
    }

    #[test]
    fn test_envelope_roundtrips_through_json() {
        let envelope = EventEnvelope::update(
            "product-service",
            Uuid::new_v4(),
            ProductPayload {
                price: Some(12.0),
                ..ProductPayload::default()
            },
        );

        let bytes = serde_json::to_vec(&envelope).unwrap();
        let decoded: EventEnvelope<ProductPayload> = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(decoded.event_id, envelope.event_id);
        assert_eq!(decoded.action, CatalogAction::Update);
        assert_eq!(decoded.payload.unwrap().price, Some(12.0));
    }

    #[test]
    fn test_version_compatibility() {
        assert!(is_compatible(SCHEMA_VERSION, SCHEMA_VERSION));
        assert!(!is_compatible(1, 2));
    }
}
