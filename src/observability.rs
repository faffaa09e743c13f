use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "holdfast_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "holdfast_query_duration_seconds";

/// Counter: reserve calls. Labels: outcome (`ok` or an error kind).
pub const RESERVATIONS_TOTAL: &str = "holdfast_reservations_total";

/// Counter: release calls. Labels: outcome.
pub const RELEASES_TOTAL: &str = "holdfast_releases_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "holdfast_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "holdfast_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "holdfast_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "holdfast_tenants_active";

/// Histogram: time spent waiting for a row lock, in seconds.
pub const LOCK_WAIT_SECONDS: &str = "holdfast_lock_wait_seconds";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "holdfast_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "holdfast_wal_flush_batch_size";

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
        Command::InsertResource { .. } => "insert_resource",
        Command::InsertHolder { .. } => "insert_holder",
        Command::Reserve { .. } => "reserve",
        Command::Release { .. } => "release",
        Command::SelectResources { .. } => "select_resources",
        Command::SelectTopResource => "select_top_resource",
        Command::SelectClaims { .. } => "select_claims",
    }
}
