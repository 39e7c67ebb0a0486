use std::{
    collections::BTreeMap,
    env,
    path::{Path, PathBuf},
    time::Duration,
};

use thiserror::Error;

use crate::heartbeat::HeartbeatPolicy;

const ENV_PREFIX: &str = "RENDERDOG_BRIDGE_";

/// Methods that need a different budget than the default request timeout.
const DEFAULT_METHOD_TIMEOUTS: &[(&str, u64)] = &[
    // Keep open_capture conservative so a stalled load doesn't block clients for minutes.
    ("open_capture", 45),
    ("get_draw_calls", 240),
    ("get_pipeline_state", 240),
    ("get_texture_data", 240),
    ("get_buffer_contents", 240),
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}={value:?} is not a non-negative number of seconds")]
    InvalidDuration { var: String, value: String },
    #[error("{var}={value:?} is not a boolean (expected 1/0, true/false, yes/no, on/off)")]
    InvalidBool { var: String, value: String },
    #[error("{var}={value:?} is not a positive integer")]
    InvalidCount { var: String, value: String },
    #[error(
        "{var}={value:?} is not an overwrite policy (expected `replace`, `wait:<seconds>` or `fail`)"
    )]
    InvalidOverwritePolicy { var: String, value: String },
}

/// What a publisher does when the request slot still holds an unclaimed request.
///
/// The previous owner has always released the slot lock by then (it timed out, or its lock was
/// recovered as stale), so the leftover is orphaned work the remote side never picked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverwritePolicy {
    /// Replace the leftover immediately and count it as overwritten.
    Replace,
    /// Give the remote side this long to claim the leftover, then replace it.
    WaitForClaim(Duration),
    /// Leave the leftover in place and fail the new call.
    Fail,
}

impl OverwritePolicy {
    fn parse(var: &str, value: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidOverwritePolicy {
            var: var.to_string(),
            value: value.to_string(),
        };
        let lower = value.trim().to_ascii_lowercase();
        match lower.as_str() {
            "replace" => Ok(Self::Replace),
            "fail" => Ok(Self::Fail),
            "wait" => Ok(Self::WaitForClaim(Duration::from_secs(1))),
            other => {
                let secs = other.strip_prefix("wait:").ok_or_else(invalid)?;
                parse_secs(secs)
                    .map(Self::WaitForClaim)
                    .ok_or_else(invalid)
            }
        }
    }
}

/// Settings shared by the client bridge and the remote host.
///
/// Every field can be overridden through a `RENDERDOG_BRIDGE_*` environment variable; durations
/// are decimal seconds.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub spool_dir: PathBuf,
    pub request_timeout: Duration,
    pub method_timeouts: BTreeMap<String, Duration>,
    /// Clamp applied to every request budget. Off by default so long loads are not truncated.
    pub hard_timeout_cap: Option<Duration>,
    pub enqueue_timeout: Duration,
    pub diagnostics_timeout: Duration,
    pub heartbeat: HeartbeatPolicy,
    pub heartbeat_interval: Duration,
    /// Remote handler budget for requests that carry no timeout hint.
    pub max_processing_time: Duration,
    /// Bounds applied to a request's own timeout hint when deriving its handler budget.
    pub processing_floor: Duration,
    pub processing_ceiling: Duration,
    pub poll_interval: Duration,
    pub client_poll_interval: Duration,
    pub lock_stale_age: Duration,
    pub overwrite_policy: OverwritePolicy,
    pub recent_error_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            spool_dir: default_spool_dir(),
            request_timeout: Duration::from_secs(180),
            method_timeouts: DEFAULT_METHOD_TIMEOUTS
                .iter()
                .map(|(method, secs)| (method.to_string(), Duration::from_secs(*secs)))
                .collect(),
            hard_timeout_cap: None,
            enqueue_timeout: Duration::from_secs(30),
            diagnostics_timeout: Duration::from_secs(5),
            heartbeat: HeartbeatPolicy::default(),
            heartbeat_interval: Duration::from_secs(1),
            max_processing_time: Duration::from_secs(420),
            processing_floor: Duration::from_secs(30),
            processing_ceiling: Duration::from_secs(1800),
            poll_interval: Duration::from_millis(100),
            client_poll_interval: Duration::from_millis(50),
            lock_stale_age: Duration::from_secs(900),
            overwrite_policy: OverwritePolicy::Replace,
            recent_error_capacity: 32,
        }
    }
}

impl BridgeConfig {
    /// Defaults rooted at a specific spool directory.
    pub fn with_spool_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            spool_dir: dir.into(),
            ..Self::default()
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds a config from an arbitrary variable lookup (the process environment in
    /// production).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let vars = Vars { lookup: &lookup };
        let mut cfg = Self::default();

        if let Some(dir) = vars.get("DIR") {
            cfg.spool_dir = PathBuf::from(dir);
        }
        vars.duration("TIMEOUT", &mut cfg.request_timeout)?;
        let methods: Vec<String> = cfg.method_timeouts.keys().cloned().collect();
        for method in methods {
            let key = format!("TIMEOUT_{}", method.to_ascii_uppercase());
            if let Some(slot) = cfg.method_timeouts.get_mut(&method) {
                vars.duration(&key, slot)?;
            }
        }

        let mut cap = Duration::ZERO;
        vars.duration("HARD_TIMEOUT_CAP", &mut cap)?;
        cfg.hard_timeout_cap = (!cap.is_zero()).then_some(cap);

        vars.duration("ENQUEUE_TIMEOUT", &mut cfg.enqueue_timeout)?;
        vars.duration("DIAGNOSTICS_TIMEOUT", &mut cfg.diagnostics_timeout)?;
        vars.duration("HEARTBEAT_MAX_AGE", &mut cfg.heartbeat.max_age)?;
        vars.duration("HEARTBEAT_STARTUP_GRACE", &mut cfg.heartbeat.startup_grace)?;
        vars.duration("HEARTBEAT_FAIL_FAST", &mut cfg.heartbeat.fail_fast)?;
        vars.flag(
            "HEARTBEAT_FAIL_FAST_DURING_REQUEST",
            &mut cfg.heartbeat.fail_fast_during_request,
        )?;
        vars.duration("HEARTBEAT_INTERVAL", &mut cfg.heartbeat_interval)?;
        vars.duration("PROCESSING_TIMEOUT", &mut cfg.max_processing_time)?;
        vars.duration("PROCESSING_TIMEOUT_MIN", &mut cfg.processing_floor)?;
        vars.duration("PROCESSING_TIMEOUT_MAX", &mut cfg.processing_ceiling)?;
        vars.duration("POLL_INTERVAL", &mut cfg.poll_interval)?;
        vars.duration("CLIENT_POLL_INTERVAL", &mut cfg.client_poll_interval)?;
        vars.duration("LOCK_STALE_AGE", &mut cfg.lock_stale_age)?;

        if let Some(value) = vars.get("OVERWRITE_POLICY") {
            cfg.overwrite_policy = OverwritePolicy::parse(&vars.name("OVERWRITE_POLICY"), &value)?;
        }
        if let Some(value) = vars.get("RECENT_ERRORS") {
            cfg.recent_error_capacity = value
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| ConfigError::InvalidCount {
                    var: vars.name("RECENT_ERRORS"),
                    value,
                })?;
        }

        Ok(cfg)
    }

    /// Budget for one call of `method`, with the hard cap applied.
    pub fn timeout_for(&self, method: &str) -> Duration {
        let raw = self
            .method_timeouts
            .get(method)
            .copied()
            .unwrap_or(self.request_timeout);
        self.cap_timeout(raw)
    }

    /// Applies the hard cap, then keeps the budget below [`lock_hold_limit`](Self::lock_hold_limit)
    /// so a live caller's lock is never recovered as stale.
    pub fn cap_timeout(&self, timeout: Duration) -> Duration {
        let capped = match self.hard_timeout_cap {
            Some(cap) => timeout.min(cap),
            None => timeout,
        };
        capped.min(self.lock_hold_limit())
    }

    /// Longest a request may hold a slot lock: nine tenths of `lock_stale_age`, leaving headroom
    /// for the sweep and publish around the wait.
    pub fn lock_hold_limit(&self) -> Duration {
        self.lock_stale_age - self.lock_stale_age / 10
    }

    /// Remote handler budget for a request whose timeout hint is `hint` (zero means none).
    pub fn processing_budget(&self, hint: Duration) -> Duration {
        if hint.is_zero() {
            return self.max_processing_time;
        }
        let ceiling = self.processing_ceiling;
        hint.max(self.processing_floor.min(ceiling)).min(ceiling)
    }

    /// How long a caller may wait for the slot before giving up; never shorter than the request
    /// budget itself.
    pub fn enqueue_budget(&self, request_timeout: Duration) -> Duration {
        self.enqueue_timeout.max(request_timeout)
    }

    pub fn spool_dir(&self) -> &Path {
        &self.spool_dir
    }
}

pub fn default_spool_dir() -> PathBuf {
    env::temp_dir().join("renderdoc_mcp")
}

struct Vars<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Vars<'_> {
    fn name(&self, key: &str) -> String {
        format!("{ENV_PREFIX}{key}")
    }

    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(&self.name(key)).filter(|v| !v.trim().is_empty())
    }

    fn duration(&self, key: &str, slot: &mut Duration) -> Result<(), ConfigError> {
        if let Some(value) = self.get(key) {
            *slot = parse_secs(&value).ok_or_else(|| ConfigError::InvalidDuration {
                var: self.name(key),
                value,
            })?;
        }
        Ok(())
    }

    fn flag(&self, key: &str, slot: &mut bool) -> Result<(), ConfigError> {
        if let Some(value) = self.get(key) {
            *slot = match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(ConfigError::InvalidBool {
                        var: self.name(key),
                        value,
                    });
                }
            };
        }
        Ok(())
    }
}

fn parse_secs(value: &str) -> Option<Duration> {
    let secs: f64 = value.trim().parse().ok()?;
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(secs).ok()
}
