use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter, IntCounterVec,
    IntGauge,
};
use std::sync::LazyLock;

// --- Connection Metrics ---

/// Total number of client connections accepted by the proxy listener.
///
/// Use it to monitor offered load and detect traffic spikes or drops.
/// Example query: `rate(proxy_connections_accepted_total[5m])`.
pub static ACCEPTED_CONNECTIONS: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "proxy_connections_accepted_total",
        "Total number of accepted client connections"
    )
    .unwrap()
});

/// Number of client connections currently being proxied.
///
/// Incremented after a backend is picked, decremented when the handler
/// releases it. Compare against backend capacity to spot saturation.
pub static ACTIVE_CONNECTIONS: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!(
        "proxy_connections_active",
        "Number of client connections currently proxied"
    )
    .unwrap()
});

/// Total number of connections dropped because no backend could be picked.
///
/// A non-zero rate means the alive snapshot was empty (or nothing had
/// positive weight under the weighted policy) at pick time.
/// Example query: `rate(proxy_pick_failures_total[5m])`.
pub static PICK_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "proxy_pick_failures_total",
        "Total connections dropped with no backend selected"
    )
    .unwrap()
});

/// Total number of failed backend dials per backend.
///
/// Dial failures do not flip liveness; a sustained rate here with a healthy
/// probe status points at a backend accepting probes but refusing real work.
/// Example query: `rate(proxy_dial_failures_total{backend="..."}[5m])`.
pub static DIAL_FAILURES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "proxy_dial_failures_total",
        "Total failed backend connection attempts per backend",
        &["backend"]
    )
    .unwrap()
});

/// Bytes copied from clients to each backend.
pub static BYTES_TO_BACKEND: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "proxy_bytes_to_backend_total",
        "Bytes copied from clients to each backend",
        &["backend"]
    )
    .unwrap()
});

/// Bytes copied from each backend back to clients.
pub static BYTES_FROM_BACKEND: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "proxy_bytes_from_backend_total",
        "Bytes copied from each backend back to clients",
        &["backend"]
    )
    .unwrap()
});

// --- Pool State Metrics ---

/// Total number of failed health probes per backend.
///
/// Example query: `rate(proxy_healthcheck_failed_total{backend="..."}[5m])`.
pub static HEALTHCHECK_FAILED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "proxy_healthcheck_failed_total",
        "Total number of failed health probes per backend",
        &["backend"]
    )
    .unwrap()
});

/// Number of pool backends currently marked alive.
///
/// Updated after each health round and after each discovery event.
/// Example query: `proxy_healthy_backends / proxy_total_backends`.
pub static HEALTHY_BACKENDS: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!("proxy_healthy_backends", "Number of backends currently alive").unwrap()
});

/// Total number of backends registered in the pool.
pub static TOTAL_BACKENDS: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!("proxy_total_backends", "Total number of registered backends").unwrap()
});

// --- Discovery Metrics ---

/// Total number of discovery events applied to the pool, by kind.
///
/// Example query: `rate(proxy_discovery_events_total{kind="add"}[5m])`.
pub static DISCOVERY_EVENTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "proxy_discovery_events_total",
        "Total discovery events applied to the pool",
        &["kind"]
    )
    .unwrap()
});
