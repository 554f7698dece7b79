/// Kafka integration: the envelope publisher for the write path.
pub mod producer;

pub use producer::EventPublisher;
