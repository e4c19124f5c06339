use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "featured_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "featured_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "featured_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "featured_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "featured_connections_rejected_total";

/// Gauge: number of loaded tenants.
pub const TENANTS_ACTIVE: &str = "featured_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "featured_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (commits per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "featured_wal_flush_batch_size";

// ── Scheduler ───────────────────────────────────────────────────

/// Counter: façade operations. Labels: op (add, update, remove), outcome.
pub const SLOT_OPERATIONS_TOTAL: &str = "featured_slot_operations_total";

/// Counter: activations refused by the overlap ceiling.
pub const CAPACITY_REJECTIONS_TOTAL: &str = "featured_capacity_rejections_total";

/// Histogram: neighbors re-ranked by a single add or move.
pub const RANK_SHIFTS_PER_WRITE: &str = "featured_rank_shifts_per_write";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertSlot { .. } => "insert_slot",
        Command::UpdateSlot { .. } => "update_slot",
        Command::DeleteSlot { .. } => "delete_slot",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectFeatured { .. } => "select_featured",
    }
}
