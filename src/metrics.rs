// Prometheus metrics definitions for the agent host.

use std::sync::Once;

use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // ── Gauges ───────────────────────────────────────────────────────

    /// Current lifecycle state: 0 idle, 1 awaiting challenge, 2 in match, 3 draining.
    pub static ref LIFECYCLE_STATE: IntGauge =
        IntGauge::new("showdown_lifecycle_state", "Current lifecycle controller state").unwrap();

    /// Agent sessions currently connected (0 or 1).
    pub static ref ACTIVE_SESSIONS: IntGauge =
        IntGauge::new("showdown_active_sessions", "Agent sessions currently connected").unwrap();

    /// Invites waiting to be dispatched.
    pub static ref INVITE_QUEUE_DEPTH: IntGauge =
        IntGauge::new("showdown_invite_queue_depth", "Invites waiting to be dispatched").unwrap();

    /// Invite tasks currently running.
    pub static ref INVITE_WORKERS_ACTIVE: IntGauge =
        IntGauge::new("showdown_invite_workers_active", "Invite tasks currently running").unwrap();

    /// Live WebSocket connections.
    pub static ref CONNECTED_WEBSOCKETS: IntGauge =
        IntGauge::new("showdown_connected_websockets", "Live WebSocket connections").unwrap();

    // ── Counters ─────────────────────────────────────────────────────

    /// Activation attempts, by outcome (ok, failed, unavailable).
    pub static ref ACTIVATIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("showdown_activations_total", "Agent activation attempts"),
        &["outcome"],
    )
    .unwrap();

    /// Matches that ended, by outcome (finished, lost).
    pub static ref MATCHES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("showdown_matches_total", "Matches that ended"),
        &["outcome"],
    )
    .unwrap();

    pub static ref TEARDOWN_FAILURES_TOTAL: IntCounter = IntCounter::new(
        "showdown_teardown_failures_total",
        "Session teardowns that failed or timed out",
    )
    .unwrap();

    pub static ref ACCEPT_CANCEL_TIMEOUTS_TOTAL: IntCounter = IntCounter::new(
        "showdown_accept_cancel_timeouts_total",
        "Accept cancellations that were not acknowledged in time",
    )
    .unwrap();

    pub static ref INVARIANT_VIOLATIONS_TOTAL: IntCounter = IntCounter::new(
        "showdown_invariant_violations_total",
        "Unexpected concurrent matches and other invariant violations",
    )
    .unwrap();

    /// Invites, by outcome (queued, rejected, completed, not_picked_up, not_sent, failed, timed_out, lost, interrupted).
    pub static ref INVITES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("showdown_invites_total", "Battle invitations"),
        &["outcome"],
    )
    .unwrap();

    // ── Histograms ───────────────────────────────────────────────────

    /// Match duration in seconds as seen by the controller, by outcome.
    pub static ref MATCH_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new("showdown_match_duration_seconds", "Match duration in seconds")
            .buckets(vec![30.0, 60.0, 120.0, 300.0, 600.0, 900.0, 1800.0]),
        &["outcome"],
    )
    .unwrap();
}

static REGISTER: Once = Once::new();

/// Register all metrics with the custom registry. Safe to call more than once.
pub fn register_metrics() {
    REGISTER.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(LIFECYCLE_STATE.clone()),
            Box::new(ACTIVE_SESSIONS.clone()),
            Box::new(INVITE_QUEUE_DEPTH.clone()),
            Box::new(INVITE_WORKERS_ACTIVE.clone()),
            Box::new(CONNECTED_WEBSOCKETS.clone()),
            Box::new(ACTIVATIONS_TOTAL.clone()),
            Box::new(MATCHES_TOTAL.clone()),
            Box::new(TEARDOWN_FAILURES_TOTAL.clone()),
            Box::new(ACCEPT_CANCEL_TIMEOUTS_TOTAL.clone()),
            Box::new(INVARIANT_VIOLATIONS_TOTAL.clone()),
            Box::new(INVITES_TOTAL.clone()),
            Box::new(MATCH_DURATION_SECONDS.clone()),
        ];

        for c in collectors {
            if let Err(e) = REGISTRY.register(c) {
                tracing::error!("Failed to register metric: {e}");
            }
        }
    });
}

/// Serialize all registered metrics to the Prometheus text exposition format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {e}");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
