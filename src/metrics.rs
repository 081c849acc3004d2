//! Driver counters
//!
//! Rendered in Prometheus text exposition format by [`DriverMetrics::render_prometheus`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug)]
pub struct DriverMetrics {
    pub requests: AtomicU64,
    pub request_errors: AtomicU64,
    pub retries: AtomicU64,
    pub less_busy_reroutes: AtomicU64,
    pub connections_opened: AtomicU64,
    pub connections_closed: AtomicU64,
    pub refill_failures: AtomicU64,
    pub topology_refreshes: AtomicU64,
    pub topology_refresh_failures: AtomicU64,
    pub events_received: AtomicU64,
    started: Instant,
}

impl Default for DriverMetrics {
    fn default() -> Self {
        Self {
            requests: AtomicU64::new(0),
            request_errors: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            less_busy_reroutes: AtomicU64::new(0),
            connections_opened: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            refill_failures: AtomicU64::new(0),
            topology_refreshes: AtomicU64::new(0),
            topology_refresh_failures: AtomicU64::new(0),
            events_received: AtomicU64::new(0),
            started: Instant::now(),
        }
    }
}

impl DriverMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    fn counters(&self) -> [(&'static str, &'static str, &AtomicU64); 10] {
        [
            ("requests_total", "Requests sent to the cluster", &self.requests),
            (
                "request_errors_total",
                "Requests that failed after all retries",
                &self.request_errors,
            ),
            ("retries_total", "Retry attempts taken", &self.retries),
            (
                "less_busy_reroutes_total",
                "Requests moved off a heavily loaded shard connection",
                &self.less_busy_reroutes,
            ),
            (
                "connections_opened_total",
                "Connections that completed the handshake",
                &self.connections_opened,
            ),
            (
                "connections_closed_total",
                "Connections that were closed",
                &self.connections_closed,
            ),
            (
                "refill_failures_total",
                "Failed attempts to open a pool connection",
                &self.refill_failures,
            ),
            (
                "topology_refreshes_total",
                "Completed topology refreshes",
                &self.topology_refreshes,
            ),
            (
                "topology_refresh_failures_total",
                "Failed topology refreshes",
                &self.topology_refresh_failures,
            ),
            (
                "events_received_total",
                "Server events received",
                &self.events_received,
            ),
        ]
    }

    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        for (name, help, counter) in self.counters() {
            output.push_str(&format!("# HELP cqlshard_{} {}\n", name, help));
            output.push_str(&format!("# TYPE cqlshard_{} counter\n", name));
            output.push_str(&format!(
                "cqlshard_{} {}\n\n",
                name,
                counter.load(Ordering::Relaxed)
            ));
        }

        let uptime_secs = self.started.elapsed().as_secs_f64();
        output.push_str("# HELP cqlshard_uptime_seconds Time since the driver was created\n");
        output.push_str("# TYPE cqlshard_uptime_seconds gauge\n");
        output.push_str(&format!("cqlshard_uptime_seconds {:.3}\n", uptime_secs));

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prometheus_format() {
        let metrics = DriverMetrics::new();
        DriverMetrics::incr(&metrics.requests);
        DriverMetrics::incr(&metrics.requests);
        DriverMetrics::incr(&metrics.less_busy_reroutes);

        let output = metrics.render_prometheus();
        assert!(output.contains("# HELP cqlshard_requests_total"));
        assert!(output.contains("# TYPE cqlshard_requests_total counter"));
        assert!(output.contains("cqlshard_requests_total 2\n"));
        assert!(output.contains("cqlshard_less_busy_reroutes_total 1\n"));
        assert!(output.contains("cqlshard_retries_total 0\n"));
        assert!(output.contains("# TYPE cqlshard_uptime_seconds gauge"));
    }

    #[test]
    fn test_counter_helpers() {
        let metrics = DriverMetrics::default();
        assert_eq!(DriverMetrics::get(&metrics.events_received), 0);
        DriverMetrics::incr(&metrics.events_received);
        assert_eq!(DriverMetrics::get(&metrics.events_received), 1);
    }
}
