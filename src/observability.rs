use std::net::SocketAddr;

use crate::model::ObjectType;

// ── Chunk loading ───────────────────────────────────────────────

/// Counter: chunk fetches started.
pub const CHUNKS_STARTED_TOTAL: &str = "rae_sync_chunks_started_total";

/// Counter: chunk fetches finished. Labels: outcome (loaded, retried, failed).
pub const CHUNKS_FINISHED_TOTAL: &str = "rae_sync_chunks_finished_total";

/// Histogram: chunk fetch-and-merge duration in seconds.
pub const CHUNK_DURATION_SECONDS: &str = "rae_sync_chunk_duration_seconds";

/// Gauge: chunk fetches in flight.
pub const CHUNKS_IN_FLIGHT: &str = "rae_sync_chunks_in_flight";

// ── Change feed ─────────────────────────────────────────────────

/// Counter: feed batches received.
pub const FEED_BATCHES_TOTAL: &str = "rae_sync_feed_batches_total";

/// Counter: change records applied. Labels: object.
pub const FEED_CHANGES_TOTAL: &str = "rae_sync_feed_changes_total";

/// Counter: change records that failed to apply. Labels: object.
pub const FEED_RECORD_ERRORS_TOTAL: &str = "rae_sync_feed_record_errors_total";

/// Counter: failed long-poll round trips.
pub const FEED_POLL_FAILURES_TOTAL: &str = "rae_sync_feed_poll_failures_total";

/// Gauge: last applied change number.
pub const FEED_CURSOR: &str = "rae_sync_feed_cursor";

// ── Writes ──────────────────────────────────────────────────────

/// Counter: optimistic writes sent.
pub const WRITES_TOTAL: &str = "rae_sync_writes_total";

/// Counter: optimistic writes rolled back after rejection.
pub const WRITE_ROLLBACKS_TOTAL: &str = "rae_sync_write_rollbacks_total";

// ── Cache ───────────────────────────────────────────────────────

/// Gauge: tasks held in the cache.
pub const CACHED_TASKS: &str = "rae_sync_cached_tasks";

/// Gauge: resource claims held in the cache.
pub const CACHED_CLAIMS: &str = "rae_sync_cached_claims";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus metrics exporter: {e}"),
    }
}

/// Map a feed object type to a short label for metrics.
pub fn object_label(object: ObjectType) -> &'static str {
    match object {
        ObjectType::Task => "task",
        ObjectType::ResourceClaim => "resource_claim",
        ObjectType::ResourceCapacity => "resource_capacity",
        ObjectType::ResourceAvailability => "resource_availability",
        ObjectType::LogEvent => "logevent",
        ObjectType::Other => "other",
    }
}
