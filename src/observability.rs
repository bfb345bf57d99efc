use std::net::SocketAddr;

use crate::wire::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "dialyd_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "dialyd_request_duration_seconds";

/// Counter: bookings admitted and persisted.
pub const BOOKINGS_TOTAL: &str = "dialyd_bookings_total";

/// Counter: individual scheduling rules violated. Labels: rule.
pub const VALIDATION_FAILURES_TOTAL: &str = "dialyd_validation_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "dialyd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "dialyd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "dialyd_connections_rejected_total";

/// Counter: hello frames with a bad token.
pub const AUTH_FAILURES_TOTAL: &str = "dialyd_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "dialyd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "dialyd_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Map a Request variant to a short label for metrics.
pub fn op_label(req: &Request) -> &'static str {
    match req {
        Request::Hello { .. } => "hello",
        Request::AddRoom { .. } => "add_room",
        Request::UpdateRoom { .. } => "update_room",
        Request::DeactivateRoom { .. } => "deactivate_room",
        Request::ReactivateRoom { .. } => "reactivate_room",
        Request::AddStaff { .. } => "add_staff",
        Request::DeactivateStaff { .. } => "deactivate_staff",
        Request::Book { .. } => "book",
        Request::Edit { .. } => "edit",
        Request::Move { .. } => "move",
        Request::Start { .. } => "start",
        Request::Complete { .. } => "complete",
        Request::Cancel { .. } => "cancel",
        Request::NoShow { .. } => "no_show",
        Request::GetReservation { .. } => "get_reservation",
        Request::ListRooms => "list_rooms",
        Request::ListStaff => "list_staff",
        Request::Schedule { .. } => "schedule",
        Request::Listen { .. } => "listen",
        Request::Unlisten { .. } => "unlisten",
    }
}
