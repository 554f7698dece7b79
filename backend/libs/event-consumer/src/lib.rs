//! # Generic Kafka Consumer Loop
//!
//! Machinery shared by every event pipeline in the catalog services: poll a
//! batch from a topic, apply each envelope in log order through an
//! [`EventApplier`], and commit offsets only after the whole batch applied.
//!
//! Guarantees:
//! - **At-least-once delivery**: offsets (Kafka and the mirror table) advance
//!   only after successful apply, so a crash replays from the last committed
//!   position. Appliers must therefore be idempotent.
//! - **Per-partition ordering**: messages are applied strictly in log order
//!   within a partition. No ordering is promised across partitions.
//! - **Poison isolation**: an envelope that fails deterministically is
//!   retried up to the policy bound, then written to the dead-letter sink so
//!   the partition keeps moving.
//! - **Cooperative shutdown**: the stop signal is observed at the top of each
//!   iteration, never mid-apply; an in-flight batch finishes (or fails
//!   cleanly) before the task exits.
//!
//! The batch/retry/dead-letter logic lives in [`BatchProcessor`], which has
//! no Kafka dependency and is exercised directly in tests; [`ConsumerLoop`]
//! wires it to an rdkafka `StreamConsumer`.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures::FutureExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::{Offset, TopicPartitionList};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

mod dead_letter;
mod error;
mod offset;
mod retry;

pub use dead_letter::{DeadLetterEntry, DeadLetterSink, SqlxDeadLetterSink};
pub use error::{ConsumeError, StateError, StateResult};
pub use offset::{OffsetStore, SqlxOffsetStore};
pub use retry::RetryPolicy;

/// A polled message, decoupled from rdkafka's borrowed types so appliers and
/// tests never touch the client library.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
}

impl RawEvent {
    fn position(&self) -> (String, i32, i64) {
        (self.topic.clone(), self.partition, self.offset)
    }
}

/// Applies one envelope to the canonical store.
///
/// Implementations must be deterministic and idempotent: the same event with
/// the same store state always produces the same result, and redelivery of an
/// already-applied event is a no-op success.
#[async_trait]
pub trait EventApplier: Send + Sync + 'static {
    /// Name used in logs and task naming.
    fn name(&self) -> &str;

    async fn apply(&self, event: &RawEvent) -> Result<(), ConsumeError>;
}

/// What the loop does with one apply result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Applied (or no-op); the batch may advance past it
    Applied,
    /// Not applied; withhold the commit and redeliver
    Retry,
    /// Retry budget exhausted on a deterministic failure; record and advance
    DeadLetter,
}

/// Classify one apply result against the retry budget already spent.
pub fn disposition(
    result: &Result<(), ConsumeError>,
    attempts: u32,
    policy: &RetryPolicy,
) -> Disposition {
    match result {
        Ok(()) => Disposition::Applied,
        Err(ConsumeError::Transient(_)) => Disposition::Retry,
        Err(ConsumeError::Permanent(_)) => {
            if policy.should_retry(attempts) {
                Disposition::Retry
            } else {
                Disposition::DeadLetter
            }
        }
    }
}

/// Result of applying one batch.
#[derive(Debug)]
pub enum BatchOutcome {
    /// Every envelope was applied or dead-lettered; commit the batch offsets.
    Committed { applied: usize, dead_lettered: usize },
    /// An envelope could not be applied; nothing is committed and the
    /// partition must be rewound to the first unapplied position.
    Halted {
        first_unapplied: usize,
        backoff: Duration,
    },
}

/// Ordered, retry-aware batch application. No Kafka dependency.
pub struct BatchProcessor<A: EventApplier> {
    applier: Arc<A>,
    dead_letters: Arc<dyn DeadLetterSink>,
    policy: RetryPolicy,
    // Retry budget spent per (topic, partition, offset); entries are dropped
    // once the message is applied or dead-lettered.
    attempts: HashMap<(String, i32, i64), u32>,
}

impl<A: EventApplier> BatchProcessor<A> {
    pub fn new(applier: Arc<A>, dead_letters: Arc<dyn DeadLetterSink>, policy: RetryPolicy) -> Self {
        Self {
            applier,
            dead_letters,
            policy,
            attempts: HashMap::new(),
        }
    }

    pub fn applier(&self) -> &Arc<A> {
        &self.applier
    }

    /// Apply a batch in log order.
    ///
    /// Stops at the first envelope that cannot be applied this round; every
    /// envelope before it stays uncommitted (redelivery re-applies them,
    /// which idempotence makes safe). Partial-batch commits are forbidden.
    pub async fn process(&mut self, batch: &[RawEvent]) -> BatchOutcome {
        let mut applied = 0usize;
        let mut dead_lettered = 0usize;

        for (idx, event) in batch.iter().enumerate() {
            let attempts = *self.attempts.get(&event.position()).unwrap_or(&0);

            // A panic inside apply must not take the loop down for other
            // entities; contain it and classify as transient.
            let result = match AssertUnwindSafe(self.applier.apply(event))
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(panic) => {
                    let msg = panic
                        .downcast_ref::<&str>()
                        .map(|s| (*s).to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "apply panicked".to_string());
                    error!(
                        applier = %self.applier.name(),
                        topic = %event.topic,
                        partition = event.partition,
                        offset = event.offset,
                        panic = %msg,
                        "Apply panicked; treating as transient failure"
                    );
                    Err(ConsumeError::Transient(msg))
                }
            };

            let failure = result
                .as_ref()
                .err()
                .map(|e| e.to_string())
                .unwrap_or_default();

            match disposition(&result, attempts, &self.policy) {
                Disposition::Applied => {
                    self.attempts.remove(&event.position());
                    applied += 1;
                }
                Disposition::Retry => {
                    self.attempts.insert(event.position(), attempts + 1);
                    warn!(
                        applier = %self.applier.name(),
                        topic = %event.topic,
                        partition = event.partition,
                        offset = event.offset,
                        attempts = attempts + 1,
                        error = %failure,
                        "Apply failed; withholding batch commit for redelivery"
                    );
                    return BatchOutcome::Halted {
                        first_unapplied: idx,
                        backoff: self.policy.get_backoff(attempts),
                    };
                }
                Disposition::DeadLetter => {
                    let entry =
                        DeadLetterEntry::from_event(event, failure.clone(), attempts as i32);
                    if let Err(sink_err) = self.dead_letters.record(&entry).await {
                        // The sink itself is unavailable; do not advance past
                        // the envelope or it would be lost.
                        error!(
                            applier = %self.applier.name(),
                            topic = %event.topic,
                            offset = event.offset,
                            error = %sink_err,
                            "Dead-letter sink unavailable; withholding commit"
                        );
                        return BatchOutcome::Halted {
                            first_unapplied: idx,
                            backoff: self.policy.get_backoff(attempts),
                        };
                    }
                    self.attempts.remove(&event.position());
                    dead_lettered += 1;
                }
            }
        }

        BatchOutcome::Committed {
            applied,
            dead_lettered,
        }
    }
}

/// Consumer loop configuration, one per topic.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub brokers: String,
    pub group_id: String,
    pub topic: String,
    pub batch_size: usize,
    pub poll_timeout: Duration,
    pub retry: RetryPolicy,
}

impl ConsumerConfig {
    pub fn new(brokers: impl Into<String>, group_id: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            brokers: brokers.into(),
            group_id: group_id.into(),
            topic: topic.into(),
            batch_size: 100,
            poll_timeout: Duration::from_millis(500),
            retry: RetryPolicy::default(),
        }
    }
}

/// Long-running consumer task for one topic.
///
/// State machine per iteration: Polling → Applying → Committing → Polling,
/// with Stopped reachable when the shutdown channel fires. The signal is
/// checked only between iterations so an in-flight batch always finishes
/// applying and committing (or fails cleanly) first.
pub struct ConsumerLoop<A: EventApplier> {
    config: ConsumerConfig,
    processor: BatchProcessor<A>,
    offsets: Arc<dyn OffsetStore>,
    shutdown: broadcast::Receiver<()>,
}

impl<A: EventApplier> ConsumerLoop<A> {
    pub fn new(
        config: ConsumerConfig,
        applier: Arc<A>,
        offsets: Arc<dyn OffsetStore>,
        dead_letters: Arc<dyn DeadLetterSink>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        let policy = config.retry.clone();
        Self {
            config,
            processor: BatchProcessor::new(applier, dead_letters, policy),
            offsets,
            shutdown,
        }
    }

    /// Run until the shutdown signal fires.
    pub async fn run(self) -> anyhow::Result<()> {
        // The select below needs the receiver and the poll to borrow
        // disjoint data, so take the struct apart up front.
        let Self {
            config,
            mut processor,
            offsets,
            mut shutdown,
        } = self;

        // Manual commits only: auto-commit could advance past an envelope
        // that has not been applied yet.
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.group_id)
            .set("auto.offset.reset", "earliest")
            .set("enable.auto.commit", "false")
            .set("session.timeout.ms", "30000")
            .set("heartbeat.interval.ms", "10000")
            .create()
            .context("Failed to create Kafka consumer")?;

        consumer
            .subscribe(&[config.topic.as_str()])
            .context("Failed to subscribe to topic")?;

        info!(
            applier = %processor.applier().name(),
            topic = %config.topic,
            group_id = %config.group_id,
            "Consumer loop started"
        );

        // Partitions whose stored offset has already been reconciled
        let mut reconciled: HashSet<(String, i32)> = HashSet::new();

        loop {
            let batch = tokio::select! {
                // Stop signal (or a dropped lifecycle owner) ends the loop
                // before the next poll, never mid-apply.
                _ = shutdown.recv() => break,
                batch = poll_batch(&config, &consumer) => batch,
            };

            let batch = match batch {
                Ok(batch) if batch.is_empty() => continue,
                Ok(batch) => batch,
                Err(e) => {
                    warn!(topic = %config.topic, error = %e, "Kafka poll error");
                    continue;
                }
            };

            let batch = reconcile_stored_offsets(
                &config,
                offsets.as_ref(),
                &mut reconciled,
                &consumer,
                batch,
            )
            .await;
            if batch.is_empty() {
                continue;
            }

            match processor.process(&batch).await {
                BatchOutcome::Committed {
                    applied,
                    dead_lettered,
                } => {
                    debug!(
                        topic = %config.topic,
                        applied = applied,
                        dead_lettered = dead_lettered,
                        "Batch applied; committing offsets"
                    );
                    commit_batch(&config, offsets.as_ref(), &consumer, &batch).await;
                }
                BatchOutcome::Halted {
                    first_unapplied,
                    backoff,
                } => {
                    rewind(&consumer, &batch[first_unapplied..]);
                    tokio::time::sleep(backoff).await;
                }
            }
        }

        info!(topic = %config.topic, "Consumer loop stopped");
        Ok(())
    }
}

/// Collect up to `batch_size` messages, returning whatever arrived when the
/// poll timeout elapses. A timeout with no messages is not an error; the
/// caller just polls again.
async fn poll_batch(
    config: &ConsumerConfig,
    consumer: &StreamConsumer,
) -> anyhow::Result<Vec<RawEvent>> {
    let mut batch = Vec::new();
    let deadline = tokio::time::sleep(config.poll_timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            msg = consumer.recv() => {
                match msg {
                    Ok(m) => {
                        batch.push(RawEvent {
                            topic: m.topic().to_string(),
                            partition: m.partition(),
                            offset: m.offset(),
                            key: m.key().map(|k| k.to_vec()),
                            payload: m.payload().map(|p| p.to_vec()).unwrap_or_default(),
                        });
                        if batch.len() >= config.batch_size {
                            break;
                        }
                    }
                    Err(e) => {
                        if batch.is_empty() {
                            return Err(e).context("Kafka recv failed");
                        }
                        warn!(error = %e, "Kafka recv error mid-batch; applying partial batch");
                        break;
                    }
                }
            }
        }
    }

    Ok(batch)
}

/// First time a partition shows up, compare its first delivered offset
/// against the mirror table. If Kafka's group state was lost (delivery
/// starts past the stored position), seek back to the stored offset and
/// drop the too-new messages; they will be redelivered in order. Delivery
/// at or before the stored position is left alone, since idempotent apply
/// absorbs the overlap.
async fn reconcile_stored_offsets(
    config: &ConsumerConfig,
    offsets: &dyn OffsetStore,
    reconciled: &mut HashSet<(String, i32)>,
    consumer: &StreamConsumer,
    batch: Vec<RawEvent>,
) -> Vec<RawEvent> {
    let mut keep = Vec::with_capacity(batch.len());

    for event in batch {
        if reconciled.insert((event.topic.clone(), event.partition)) {
            let stored = match offsets
                .load(&config.group_id, &event.topic, event.partition)
                .await
            {
                Ok(stored) => stored,
                Err(e) => {
                    warn!(
                        topic = %event.topic,
                        partition = event.partition,
                        error = %e,
                        "Offset store unavailable; trusting Kafka group offset"
                    );
                    None
                }
            };

            if let Some(last_applied) = stored {
                if event.offset > last_applied + 1 {
                    info!(
                        topic = %event.topic,
                        partition = event.partition,
                        delivered = event.offset,
                        stored = last_applied,
                        "Kafka offset ahead of durable offset; seeking back"
                    );
                    if let Err(e) = consumer.seek(
                        &event.topic,
                        event.partition,
                        Offset::Offset(last_applied + 1),
                        Duration::from_secs(5),
                    ) {
                        warn!(error = %e, "Seek to stored offset failed");
                    } else {
                        // Drop this message; it re-arrives after the seek.
                        continue;
                    }
                }
            }
        }
        keep.push(event);
    }

    keep
}

/// Commit the batch's high-water marks to Kafka and mirror them into the
/// offset store. Runs only after every envelope applied or dead-lettered.
async fn commit_batch(
    config: &ConsumerConfig,
    offsets: &dyn OffsetStore,
    consumer: &StreamConsumer,
    batch: &[RawEvent],
) {
    let mut high_water: HashMap<(String, i32), i64> = HashMap::new();
    for event in batch {
        let entry = high_water
            .entry((event.topic.clone(), event.partition))
            .or_insert(event.offset);
        if event.offset > *entry {
            *entry = event.offset;
        }
    }

    let mut tpl = TopicPartitionList::new();
    for ((topic, partition), offset) in &high_water {
        // Kafka commits point at the next offset to read.
        if let Err(e) = tpl.add_partition_offset(topic, *partition, Offset::Offset(offset + 1)) {
            warn!(error = %e, "Failed to build commit list");
        }
    }

    if let Err(e) = consumer.commit(&tpl, CommitMode::Sync) {
        // The durable mirror below still records progress; Kafka will
        // redeliver at most one batch, which idempotent apply absorbs.
        warn!(topic = %config.topic, error = %e, "Kafka offset commit failed");
    }

    for ((topic, partition), offset) in high_water {
        if let Err(e) = offsets
            .commit(&config.group_id, &topic, partition, offset)
            .await
        {
            warn!(
                topic = %topic,
                partition = partition,
                error = %e,
                "Durable offset commit failed"
            );
        }
    }
}

/// Rewind every partition in the unapplied remainder to its earliest
/// unapplied offset so the next poll redelivers from there.
fn rewind(consumer: &StreamConsumer, unapplied: &[RawEvent]) {
    let mut low_water: HashMap<(String, i32), i64> = HashMap::new();
    for event in unapplied {
        let entry = low_water
            .entry((event.topic.clone(), event.partition))
            .or_insert(event.offset);
        if event.offset < *entry {
            *entry = event.offset;
        }
    }

    for ((topic, partition), offset) in low_water {
        if let Err(e) = consumer.seek(
            &topic,
            partition,
            Offset::Offset(offset),
            Duration::from_secs(5),
        ) {
            warn!(
                topic = %topic,
                partition = partition,
                offset = offset,
                error = %e,
                "Seek after failed batch did not succeed; relying on group offset"
            );
        }
    }
}
