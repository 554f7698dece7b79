//! Lifecycle owner for the background consumer loops.
//!
//! One supervisor per process: it hands each loop a receiver on a shared
//! broadcast channel, tracks the tasks in a `JoinSet`, and on shutdown fires
//! the signal once and waits (bounded) for every loop to finish its in-flight
//! batch and exit. Loops observe the signal only between batches, so stopping
//! never abandons a half-applied batch.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use async_trait::async_trait;
use event_consumer::{
    ConsumerLoop, DeadLetterEntry, DeadLetterSink, EventApplier, StateResult,
};

use crate::metrics;

/// Dead-letter sink wrapper that counts recorded envelopes.
pub struct MeteredDeadLetterSink<S: DeadLetterSink> {
    inner: S,
}

impl<S: DeadLetterSink> MeteredDeadLetterSink<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<S: DeadLetterSink> DeadLetterSink for MeteredDeadLetterSink<S> {
    async fn record(&self, entry: &DeadLetterEntry) -> StateResult<()> {
        self.inner.record(entry).await?;
        metrics::inc_dead_lettered();
        Ok(())
    }
}

/// Owns the consumer tasks and the shutdown signal.
pub struct ConsumerSupervisor {
    shutdown_tx: broadcast::Sender<()>,
    tasks: JoinSet<(String, anyhow::Result<()>)>,
}

impl ConsumerSupervisor {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shutdown_tx,
            tasks: JoinSet::new(),
        }
    }

    /// Receiver for a loop constructed outside the supervisor.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Spawn one consumer loop as a supervised task.
    pub fn spawn<A: EventApplier>(&mut self, name: &str, consumer_loop: ConsumerLoop<A>) {
        let task_name = name.to_string();
        info!(consumer = %task_name, "Starting consumer loop");
        self.tasks
            .spawn(async move { (task_name, consumer_loop.run().await) });
    }

    /// Signal every loop to stop and wait up to `grace` for them to drain.
    ///
    /// Loops that have not exited by the deadline are aborted; at-least-once
    /// delivery means an aborted batch is simply redelivered on restart.
    pub async fn shutdown(mut self, grace: Duration) {
        info!("Stopping consumer loops");
        // Every receiver may already be gone if all loops crashed; that is
        // not an error worth surfacing during shutdown.
        let _ = self.shutdown_tx.send(());

        let drain = async {
            while let Some(joined) = self.tasks.join_next().await {
                match joined {
                    Ok((name, Ok(()))) => info!(consumer = %name, "Consumer loop drained"),
                    Ok((name, Err(e))) => {
                        error!(consumer = %name, error = %e, "Consumer loop exited with error")
                    }
                    Err(e) => error!(error = %e, "Consumer task panicked"),
                }
            }
        };

        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!(
                grace_ms = grace.as_millis() as u64,
                "Consumer loops did not drain in time; aborting remaining tasks"
            );
            self.tasks.shutdown().await;
        }
    }
}

impl Default for ConsumerSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    struct CountingSink {
        recorded: Mutex<u32>,
    }

    #[async_trait]
    impl DeadLetterSink for CountingSink {
        async fn record(&self, _entry: &DeadLetterEntry) -> StateResult<()> {
            *self.recorded.lock().await += 1;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_metered_sink_delegates() {
        let sink = MeteredDeadLetterSink::new(CountingSink {
            recorded: Mutex::new(0),
        });
        let entry = DeadLetterEntry {
            id: uuid::Uuid::new_v4(),
            topic: "catalog.product.events".to_string(),
            partition: 0,
            offset: 9,
            key: None,
            payload: b"bad".to_vec(),
            failure_reason: "unparseable".to_string(),
            retry_count: 3,
            failed_at: chrono::Utc::now(),
        };

        sink.record(&entry).await.unwrap();
        assert_eq!(*sink.inner.recorded.lock().await, 1);
    }

    #[tokio::test]
    async fn test_shutdown_with_no_tasks_returns_promptly() {
        let supervisor = ConsumerSupervisor::new();
        tokio::time::timeout(
            Duration::from_secs(1),
            supervisor.shutdown(Duration::from_millis(100)),
        )
        .await
        .expect("shutdown should not hang");
    }
}
