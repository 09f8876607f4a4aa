use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::wire::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: dispense requests finished. Labels: status.
pub const DISPENSE_REQUESTS_TOTAL: &str = "dispensd_dispense_requests_total";

/// Histogram: dispense request latency in seconds, device wait included.
pub const DISPENSE_DURATION_SECONDS: &str = "dispensd_dispense_duration_seconds";

/// Counter: unit cycle attempts. Labels: result (confirmed, ambiguous, failed).
pub const UNITS_TOTAL: &str = "dispensd_units_total";

/// Histogram: duration of a confirmed unit cycle in seconds.
pub const UNIT_CYCLE_DURATION_SECONDS: &str = "dispensd_unit_cycle_duration_seconds";

/// Counter: slots given up on mid-request.
pub const SLOTS_ABANDONED_TOTAL: &str = "dispensd_slots_abandoned_total";

/// Counter: units put back into stock.
pub const STOCK_RESTORED_TOTAL: &str = "dispensd_stock_restored_total";

/// Counter: optimistic allocation commits that lost a race.
pub const ALLOCATION_CONFLICTS_TOTAL: &str = "dispensd_allocation_conflicts_total";

/// Counter: control socket requests. Labels: op, status.
pub const CONTROL_REQUESTS_TOTAL: &str = "dispensd_control_requests_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: open control connections.
pub const CONNECTIONS_ACTIVE: &str = "dispensd_connections_active";

/// Counter: control connections accepted.
pub const CONNECTIONS_TOTAL: &str = "dispensd_connections_total";

/// Counter: control connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "dispensd_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "dispensd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "dispensd_wal_flush_batch_size";

/// Counter: WAL compactions completed.
pub const WAL_COMPACTIONS_TOTAL: &str = "dispensd_wal_compactions_total";

/// Install the Prometheus exporter on `port`. No-op if `port` is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short label for a control request.
pub fn op_label(req: &Request) -> &'static str {
    match req {
        Request::Dispense { .. } => "dispense",
        Request::Stock { .. } => "stock",
        Request::RemoveSlot { .. } => "remove_slot",
        Request::Slots { .. } => "slots",
        Request::Cancel => "cancel",
    }
}
