use actix_web::{HttpResponse, Responder};
use event_schema::CatalogAction;
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, TextEncoder};

use event_consumer::ConsumeError;

/// Handler that serialises Prometheus metrics in text format.
pub async fn metrics_handler() -> impl Responder {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => HttpResponse::Ok()
            .content_type(encoder.format_type())
            .body(buffer),
        Err(err) => HttpResponse::InternalServerError().body(err.to_string()),
    }
}

/// Initialize all counters by forcing lazy evaluation (call from main()).
pub fn initialize_metrics() {
    let _ = &*EVENTS_PUBLISHED_TOTAL;
    let _ = &*EVENTS_APPLIED_TOTAL;
    let _ = &*EVENTS_DEAD_LETTERED_TOTAL;
}

/// Counter for envelopes acknowledged by the broker, labelled by action
static EVENTS_PUBLISHED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "catalog_events_published_total",
            "Total catalog event envelopes acknowledged by the broker",
        ),
        &["action"],
    )
    .and_then(|c| {
        prometheus::default_registry().register(Box::new(c.clone()))?;
        Ok(c)
    })
    .unwrap_or_else(|e| {
        tracing::error!("failed to create events_published counter: {}", e);
        IntCounterVec::new(Opts::new("dummy_published", "dummy"), &["action"])
            .expect("dummy counter")
    })
});

/// Counter for apply attempts, labelled by action and outcome
static EVENTS_APPLIED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "catalog_events_applied_total",
            "Total catalog event apply attempts by outcome",
        ),
        &["action", "outcome"],
    )
    .and_then(|c| {
        prometheus::default_registry().register(Box::new(c.clone()))?;
        Ok(c)
    })
    .unwrap_or_else(|e| {
        tracing::error!("failed to create events_applied counter: {}", e);
        IntCounterVec::new(Opts::new("dummy_applied", "dummy"), &["action", "outcome"])
            .expect("dummy counter")
    })
});

/// Counter for envelopes routed to the dead-letter table
static EVENTS_DEAD_LETTERED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "catalog_events_dead_lettered_total",
        "Total catalog event envelopes routed to the dead-letter table",
    )
    .and_then(|c| {
        prometheus::default_registry().register(Box::new(c.clone()))?;
        Ok(c)
    })
    .unwrap_or_else(|e| {
        tracing::error!("failed to create dead_lettered counter: {}", e);
        IntCounter::new("dummy_dead_lettered", "dummy").expect("dummy counter")
    })
});

/// Record a broker-acknowledged publish
#[inline]
pub fn inc_published(action: CatalogAction) {
    EVENTS_PUBLISHED_TOTAL
        .with_label_values(&[&action.to_string()])
        .inc();
}

/// Record the outcome of one apply attempt
pub fn record_apply(action: CatalogAction, result: &Result<(), ConsumeError>) {
    let outcome = match result {
        Ok(()) => "applied",
        Err(ConsumeError::Transient(_)) => "failed_transient",
        Err(ConsumeError::Permanent(_)) => "failed_permanent",
    };
    EVENTS_APPLIED_TOTAL
        .with_label_values(&[&action.to_string(), outcome])
        .inc();
}

/// Record an envelope handed to the dead-letter sink
#[inline]
pub fn inc_dead_lettered() {
    EVENTS_DEAD_LETTERED_TOTAL.inc();
}
