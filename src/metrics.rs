//! Process-wide counters (lock-free atomics) with Prometheus text exposition.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    // --- Traffic ---
    pub requests_total: AtomicU64,
    pub requests_success: AtomicU64,
    pub requests_error: AtomicU64,
    pub stream_requests_total: AtomicU64,

    // --- Rotation ---
    pub dispatch_attempts_total: AtomicU64,
    pub keys_deactivated_total: AtomicU64,
    pub ring_rebuilds_total: AtomicU64,

    // --- Latency (μs, updated via CAS) ---
    pub request_duration_us_sum: AtomicU64,
    pub request_duration_us_max: AtomicU64,
}

impl Metrics {
    const fn new() -> Self {
        Self {
            requests_total: AtomicU64::new(0),
            requests_success: AtomicU64::new(0),
            requests_error: AtomicU64::new(0),
            stream_requests_total: AtomicU64::new(0),
            dispatch_attempts_total: AtomicU64::new(0),
            keys_deactivated_total: AtomicU64::new(0),
            ring_rebuilds_total: AtomicU64::new(0),
            request_duration_us_sum: AtomicU64::new(0),
            request_duration_us_max: AtomicU64::new(0),
        }
    }

    pub fn record_request_duration(&self, start: Instant) {
        let us = start.elapsed().as_micros() as u64;
        self.request_duration_us_sum.fetch_add(us, Ordering::Relaxed);
        // CAS loop for max tracking
        let mut cur = self.request_duration_us_max.load(Ordering::Relaxed);
        while us > cur {
            match self.request_duration_us_max.compare_exchange_weak(
                cur,
                us,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Render in Prometheus text exposition format.
    pub fn render(
        &self,
        ring_keys: usize,
        active_keys: u64,
        inactive_keys: u64,
        revoked_keys: u64,
    ) -> String {
        let requests_total = self.requests_total.load(Ordering::Relaxed);
        let requests_success = self.requests_success.load(Ordering::Relaxed);
        let requests_error = self.requests_error.load(Ordering::Relaxed);
        let stream_requests = self.stream_requests_total.load(Ordering::Relaxed);
        let attempts = self.dispatch_attempts_total.load(Ordering::Relaxed);
        let deactivated = self.keys_deactivated_total.load(Ordering::Relaxed);
        let rebuilds = self.ring_rebuilds_total.load(Ordering::Relaxed);
        let dur_sum = self.request_duration_us_sum.load(Ordering::Relaxed);
        let dur_max = self.request_duration_us_max.swap(0, Ordering::Relaxed);

        // Convert μs to seconds for Prometheus conventions
        let dur_sum_s = dur_sum as f64 / 1_000_000.0;
        let dur_max_s = dur_max as f64 / 1_000_000.0;

        format!(
            "\
# HELP relay_requests_total Total proxied requests received.\n\
# TYPE relay_requests_total counter\n\
relay_requests_total {requests_total}\n\
# HELP relay_requests_success_total Requests answered with upstream 200.\n\
# TYPE relay_requests_success_total counter\n\
relay_requests_success_total {requests_success}\n\
# HELP relay_requests_error_total Requests that surfaced an error downstream.\n\
# TYPE relay_requests_error_total counter\n\
relay_requests_error_total {requests_error}\n\
# HELP relay_stream_requests_total Streaming chat-completion requests.\n\
# TYPE relay_stream_requests_total counter\n\
relay_stream_requests_total {stream_requests}\n\
# HELP relay_dispatch_attempts_total Upstream dispatch attempts, retries included.\n\
# TYPE relay_dispatch_attempts_total counter\n\
relay_dispatch_attempts_total {attempts}\n\
# HELP relay_keys_deactivated_total Keys taken out of rotation by dispatch classification.\n\
# TYPE relay_keys_deactivated_total counter\n\
relay_keys_deactivated_total {deactivated}\n\
# HELP relay_ring_rebuilds_total Active ring rebuilds.\n\
# TYPE relay_ring_rebuilds_total counter\n\
relay_ring_rebuilds_total {rebuilds}\n\
# HELP relay_request_duration_seconds_sum Total handler time (seconds).\n\
# TYPE relay_request_duration_seconds_sum counter\n\
relay_request_duration_seconds_sum {dur_sum_s:.6}\n\
# HELP relay_request_duration_seconds_max Max handler time since last scrape (seconds).\n\
# TYPE relay_request_duration_seconds_max gauge\n\
relay_request_duration_seconds_max {dur_max_s:.6}\n\
# HELP relay_ring_keys Keys in the current rotation ring snapshot.\n\
# TYPE relay_ring_keys gauge\n\
relay_ring_keys {ring_keys}\n\
# HELP relay_pool_active_keys Active keys in the pool.\n\
# TYPE relay_pool_active_keys gauge\n\
relay_pool_active_keys {active_keys}\n\
# HELP relay_pool_inactive_keys Inactive keys in the pool.\n\
# TYPE relay_pool_inactive_keys gauge\n\
relay_pool_inactive_keys {inactive_keys}\n\
# HELP relay_pool_revoked_keys Revoked keys in the pool.\n\
# TYPE relay_pool_revoked_keys gauge\n\
relay_pool_revoked_keys {revoked_keys}\n"
        )
    }
}
