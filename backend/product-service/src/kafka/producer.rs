//! Kafka producer for catalog event envelopes.
//!
//! The write path is fire-into-the-log: a handler serializes an envelope,
//! publishes it here, and answers 202 only after the broker acknowledges the
//! write. Nothing in this module touches the database.

use std::time::Duration;

use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::ClientConfig;
use serde::Serialize;
use tracing::{debug, info, warn};

use event_schema::EventEnvelope;

use crate::error::AppError;

/// Publisher with idempotency and full-acknowledgement guarantees.
pub struct EventPublisher {
    producer: FutureProducer,
    request_timeout: Duration,
}

impl EventPublisher {
    /// Create a new publisher.
    ///
    /// Configuration ensures:
    /// - `enable.idempotence = true`: prevents duplicate messages on producer retry
    /// - `acks = all`: the 202 the handler returns means every replica has the event
    /// - `max.in.flight.requests.per.connection = 5`: keeps ordering with idempotence
    pub fn new(broker_list: &str, request_timeout_ms: u64) -> Result<Self, AppError> {
        let producer = ClientConfig::new()
            .set("bootstrap.servers", broker_list)
            .set("message.timeout.ms", request_timeout_ms.to_string())
            .set("request.timeout.ms", request_timeout_ms.to_string())
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .set("max.in.flight.requests.per.connection", "5")
            .set("compression.type", "lz4")
            .set("linger.ms", "10")
            .create::<FutureProducer>()
            .map_err(|e| AppError::Internal(format!("Failed to create Kafka producer: {}", e)))?;

        info!(broker_list = %broker_list, "Kafka producer created with idempotence and acks=all");

        Ok(Self {
            producer,
            request_timeout: Duration::from_millis(request_timeout_ms),
        })
    }

    /// Publish one envelope and wait for broker acknowledgement.
    ///
    /// The entity id is the partition key, so every envelope for the same
    /// product lands on the same partition in publish order.
    pub async fn publish<T: Serialize>(
        &self,
        topic: &str,
        envelope: &EventEnvelope<T>,
    ) -> Result<(), AppError> {
        let payload = serde_json::to_vec(envelope)?;
        let key = envelope.partition_key();
        let event_id = envelope.event_id.to_string();
        let action = envelope.action.to_string();

        let headers = OwnedHeaders::new()
            .insert(Header {
                key: "event_id",
                value: Some(&event_id),
            })
            .insert(Header {
                key: "action",
                value: Some(&action),
            });

        let record = FutureRecord::to(topic)
            .payload(&payload)
            .key(&key)
            .headers(headers);

        match self.producer.send(record, self.request_timeout).await {
            Ok((partition, offset)) => {
                crate::metrics::inc_published(envelope.action);
                debug!(
                    topic = %topic,
                    partition,
                    offset,
                    event_id = %envelope.event_id,
                    entity_id = %envelope.entity_id,
                    action = %envelope.action,
                    "Envelope acknowledged by broker"
                );
                Ok(())
            }
            Err((err, _)) => {
                warn!(
                    topic = %topic,
                    event_id = %envelope.event_id,
                    error = %err,
                    "Kafka publish failed"
                );
                Err(AppError::PublishUnavailable(err.to_string()))
            }
        }
    }
}
