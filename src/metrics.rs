//! Prometheus metrics for dbctl.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`
//! with its own HTTP listener, defines metric name constants, and provides
//! small recording helpers so call sites stay one line.

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::OnceLock;

// -- Metric name constants ----------------------------------------------------

/// Role probes (counter). Labels: engine, role (`error` on failure).
pub const ROLE_PROBES_TOTAL: &str = "dbctl_role_probes_total";

/// Lock protocol operations (counter). Labels: engine, op, status.
pub const LOCK_OPERATIONS_TOTAL: &str = "dbctl_lock_operations_total";

/// Lease state transitions (counter). Labels: transition.
pub const LEASE_TRANSITIONS_TOTAL: &str = "dbctl_lease_transitions_total";

/// 1 while this member holds the leader lease, else 0 (gauge).
pub const IS_LEADER: &str = "dbctl_is_leader";

/// HA loop cycles (counter). Labels: status.
pub const HA_CYCLES_TOTAL: &str = "dbctl_ha_cycles_total";

// -- Global recorder installation ---------------------------------------------

static INSTALLED: OnceLock<SocketAddr> = OnceLock::new();

/// Install the global recorder and start the exporter listening on `addr`.
/// Idempotent: later calls return the address of the first install.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: &str) -> anyhow::Result<SocketAddr> {
    if let Some(existing) = INSTALLED.get() {
        return Ok(*existing);
    }
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid metrics address {addr:?}: {e}"))?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("failed to install Prometheus exporter: {e}"))?;
    describe_metrics();
    Ok(*INSTALLED.get_or_init(|| addr))
}

/// Register metric descriptions with the global recorder.
pub fn describe_metrics() {
    describe_counter!(ROLE_PROBES_TOTAL, "Replica role probes by detected role");
    describe_counter!(LOCK_OPERATIONS_TOTAL, "Lock and unlock requests by outcome");
    describe_counter!(LEASE_TRANSITIONS_TOTAL, "Leader lease transitions");
    describe_gauge!(IS_LEADER, "Whether this member holds the leader lease");
    describe_counter!(HA_CYCLES_TOTAL, "HA loop cycles by outcome");
}

// -- Recording helpers --------------------------------------------------------

fn status(ok: bool) -> &'static str {
    if ok {
        "ok"
    } else {
        "error"
    }
}

pub fn record_role_probe(engine: &'static str, role: &'static str) {
    counter!(ROLE_PROBES_TOTAL, "engine" => engine, "role" => role).increment(1);
}

pub fn record_lock_op(engine: &'static str, op: &'static str, ok: bool) {
    counter!(LOCK_OPERATIONS_TOTAL, "engine" => engine, "op" => op, "status" => status(ok))
        .increment(1);
}

/// `transition` is one of `acquired`, `renewed`, `lost`, `released`.
pub fn record_lease_transition(transition: &'static str) {
    counter!(LEASE_TRANSITIONS_TOTAL, "transition" => transition).increment(1);
}

pub fn set_leader(held: bool) {
    gauge!(IS_LEADER).set(if held { 1.0 } else { 0.0 });
}

pub fn record_ha_cycle(ok: bool) {
    counter!(HA_CYCLES_TOTAL, "status" => status(ok)).increment(1);
}
