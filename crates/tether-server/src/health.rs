//! `/health` endpoint body.

use std::time::Instant;

use serde::Serialize;

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` while serving.
    pub status: String,
    /// Seconds since start.
    pub uptime_secs: u64,
    /// Live connections.
    pub connections: usize,
    /// Messages awaiting acknowledgment.
    pub pending_deliveries: usize,
}

/// Build a health response from live counters.
pub fn health_check(start_time: Instant, connections: usize, pending: usize) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        pending_deliveries: pending,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_ok() {
        assert_eq!(health_check(Instant::now(), 0, 0).status, "ok");
    }

    #[test]
    fn uptime_counts_from_start() {
        let start = Instant::now()
            .checked_sub(std::time::Duration::from_secs(60))
            .unwrap();
        assert!(health_check(start, 0, 0).uptime_secs >= 59);
    }

    #[test]
    fn serializes_counters() {
        let json = serde_json::to_value(health_check(Instant::now(), 3, 7)).unwrap();
        assert_eq!(json["connections"], 3);
        assert_eq!(json["pending_deliveries"], 7);
        assert_eq!(json["status"], "ok");
    }
}
