use std::time::{Duration, Instant};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{
    SpoolStore,
    protocol::{deadline_after, round_secs},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Stalled,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Stalled => "stalled",
        }
    }
}

/// Thresholds used to classify heartbeat age.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatPolicy {
    /// Older than this is no longer healthy.
    pub max_age: Duration,
    /// Missing heartbeats are not treated as stalled until this long after the monitor started.
    pub startup_grace: Duration,
    /// At or beyond this age the remote side is considered stalled.
    pub fail_fast: Duration,
    /// Long calls can starve the heartbeat writer, so stale heartbeats during an active request
    /// only count as stalled when this is set.
    pub fail_fast_during_request: bool,
}

impl Default for HeartbeatPolicy {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(30),
            startup_grace: Duration::from_secs(8),
            fail_fast: Duration::from_secs(120),
            fail_fast_during_request: false,
        }
    }
}

impl HeartbeatPolicy {
    /// Pure classification. `age` is `None` when no heartbeat has been observed.
    pub fn classify(
        &self,
        age: Option<Duration>,
        request_active: bool,
        since_start: Duration,
    ) -> HealthStatus {
        let fail_fast = self.fail_fast.max(self.max_age);
        let tolerate_stale = request_active && !self.fail_fast_during_request;
        match age {
            None if since_start < self.startup_grace || tolerate_stale => HealthStatus::Degraded,
            None => HealthStatus::Stalled,
            Some(age) if age <= self.max_age => HealthStatus::Healthy,
            Some(age) if age < fail_fast || tolerate_stale => HealthStatus::Degraded,
            Some(_) => HealthStatus::Stalled,
        }
    }
}

/// One observation of the heartbeat marker.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct HeartbeatReading {
    #[serde(rename = "heartbeat_age_sec")]
    pub age_sec: Option<f64>,
    #[serde(rename = "health_status")]
    pub status: HealthStatus,
    pub request_active: bool,
}

impl HeartbeatReading {
    pub fn age(&self) -> Option<Duration> {
        self.age_sec.and_then(|s| Duration::try_from_secs_f64(s).ok())
    }

    /// Whether the marker itself is within `max_age`, regardless of any request in flight.
    pub fn is_fresh(&self, policy: &HeartbeatPolicy) -> bool {
        self.age().is_some_and(|age| age <= policy.max_age)
    }

    /// Human-readable fragment for timeout messages.
    pub fn describe(&self, policy: &HeartbeatPolicy) -> String {
        match self.age() {
            None => "heartbeat=missing".to_string(),
            Some(age) if age > policy.max_age => format!(
                "heartbeat_age={:.1}s (STALE - extension likely dead)",
                age.as_secs_f64()
            ),
            Some(age) => format!(
                "heartbeat_age={:.1}s (alive - handler may be stuck)",
                age.as_secs_f64()
            ),
        }
    }
}

/// Reads the heartbeat marker from the spool and classifies it.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    policy: HeartbeatPolicy,
    started: Instant,
}

impl HeartbeatMonitor {
    pub fn new(policy: HeartbeatPolicy) -> Self {
        Self {
            policy,
            started: Instant::now(),
        }
    }

    pub fn policy(&self) -> &HeartbeatPolicy {
        &self.policy
    }

    pub fn reading(&self, age: Option<Duration>, request_active: bool) -> HeartbeatReading {
        HeartbeatReading {
            age_sec: age.map(round_secs),
            status: self
                .policy
                .classify(age, request_active, self.started.elapsed()),
            request_active,
        }
    }

    pub fn observe(&self, store: &SpoolStore, request_active: bool) -> HeartbeatReading {
        self.reading(store.heartbeat_age(), request_active)
    }

    /// Waits up to `max_wait` for a heartbeat to appear. An existing heartbeat, fresh or stale,
    /// returns immediately.
    pub fn wait_for_heartbeat(
        &self,
        store: &SpoolStore,
        max_wait: Duration,
        poll: Duration,
    ) -> Option<Duration> {
        let deadline = deadline_after(Instant::now(), max_wait);
        loop {
            if let Some(age) = store.heartbeat_age() {
                return Some(age);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(poll);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: Duration = Duration::from_secs(1);

    fn policy() -> HeartbeatPolicy {
        HeartbeatPolicy {
            max_age: 30 * SEC,
            startup_grace: 8 * SEC,
            fail_fast: 120 * SEC,
            fail_fast_during_request: false,
        }
    }

    #[test]
    fn fresh_heartbeat_is_healthy() {
        let p = policy();
        assert_eq!(p.classify(Some(SEC), false, 100 * SEC), HealthStatus::Healthy);
        assert_eq!(p.classify(Some(30 * SEC), true, 100 * SEC), HealthStatus::Healthy);
    }

    #[test]
    fn between_max_age_and_fail_fast_is_degraded() {
        let p = policy();
        assert_eq!(p.classify(Some(31 * SEC), false, 100 * SEC), HealthStatus::Degraded);
        assert_eq!(p.classify(Some(119 * SEC), false, 100 * SEC), HealthStatus::Degraded);
    }

    #[test]
    fn crossing_fail_fast_without_request_stalls() {
        let p = policy();
        assert_eq!(p.classify(Some(120 * SEC), false, 500 * SEC), HealthStatus::Stalled);
        // Heartbeats resuming before the threshold bring it straight back.
        assert_eq!(p.classify(Some(SEC / 2), false, 500 * SEC), HealthStatus::Healthy);
    }

    #[test]
    fn active_request_keeps_stale_heartbeat_degraded() {
        let p = policy();
        assert_eq!(p.classify(Some(600 * SEC), true, 900 * SEC), HealthStatus::Degraded);

        let strict = HeartbeatPolicy {
            fail_fast_during_request: true,
            ..p
        };
        assert_eq!(
            strict.classify(Some(600 * SEC), true, 900 * SEC),
            HealthStatus::Stalled
        );
    }

    #[test]
    fn missing_heartbeat_respects_startup_grace() {
        let p = policy();
        assert_eq!(p.classify(None, false, 2 * SEC), HealthStatus::Degraded);
        assert_eq!(p.classify(None, false, 9 * SEC), HealthStatus::Stalled);
        assert_eq!(p.classify(None, true, 9 * SEC), HealthStatus::Degraded);
    }

    #[test]
    fn fail_fast_below_max_age_is_clamped() {
        let p = HeartbeatPolicy {
            fail_fast: SEC,
            ..policy()
        };
        assert_eq!(p.classify(Some(10 * SEC), false, 100 * SEC), HealthStatus::Healthy);
        assert_eq!(p.classify(Some(30 * SEC), false, 100 * SEC), HealthStatus::Healthy);
        assert_eq!(p.classify(Some(31 * SEC), false, 100 * SEC), HealthStatus::Stalled);
    }

    #[test]
    fn freshness_ignores_request_tolerance() {
        let p = policy();
        let monitor = HeartbeatMonitor::new(p);
        let stale = monitor.reading(Some(3600 * SEC), true);
        assert_eq!(stale.status, HealthStatus::Degraded);
        assert!(!stale.is_fresh(&p));
        assert!(monitor.reading(Some(2 * SEC), true).is_fresh(&p));
        assert!(!monitor.reading(None, true).is_fresh(&p));
    }

    #[test]
    fn describe_distinguishes_alive_from_dead() {
        let p = policy();
        let monitor = HeartbeatMonitor::new(p);
        assert!(
            monitor
                .reading(Some(SEC), true)
                .describe(&p)
                .contains("alive")
        );
        assert!(
            monitor
                .reading(Some(45 * SEC), true)
                .describe(&p)
                .contains("STALE")
        );
        assert_eq!(monitor.reading(None, false).describe(&p), "heartbeat=missing");
    }
}
