use std::{
    fmt,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Method answered by the remote poller itself rather than the executor.
pub const DIAGNOSTICS_METHOD: &str = "get_bridge_diagnostics";

/// Remote error codes carried in [`RemoteError::code`].
pub mod codes {
    /// Generic domain failure reported by an executor.
    pub const EXECUTION_FAILED: i64 = -32000;
    /// The remote side gave up after its maximum processing time.
    pub const PROCESSING_TIMEOUT: i64 = -32001;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    /// Executor panicked or the poller could not run it.
    pub const INTERNAL: i64 = -32603;
}

/// Correlation identifier shared by a request and its response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    #[serde(default)]
    pub args: Value,
    pub submitted_at: f64,
    pub timeout_ms: u64,
}

impl Request {
    pub fn new(method: impl Into<String>, args: Value, timeout: Duration) -> Self {
        Self {
            id: RequestId::new(),
            method: method.into(),
            args,
            submitted_at: unix_now(),
            timeout_ms: duration_millis(timeout),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Time since the requester stamped `submitted_at`.
    pub fn age(&self) -> Duration {
        age_since(self.submitted_at).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Result(Value),
    Error(RemoteError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: RequestId,
    #[serde(flatten)]
    pub outcome: Outcome,
    pub completed_at: f64,
    pub duration_ms: u64,
}

impl Response {
    pub fn new(id: RequestId, outcome: Outcome, duration: Duration) -> Self {
        Self {
            id,
            outcome,
            completed_at: unix_now(),
            duration_ms: duration_millis(duration),
        }
    }

    pub fn ok(id: RequestId, result: Value, duration: Duration) -> Self {
        Self::new(id, Outcome::Result(result), duration)
    }

    pub fn error(id: RequestId, error: RemoteError, duration: Duration) -> Self {
        Self::new(id, Outcome::Error(error), duration)
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, Outcome::Error(_))
    }
}

/// Structured failure reported by the remote side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RemoteError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

impl RemoteError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(codes::METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_PARAMS, message)
    }

    pub fn execution_failed(message: impl Into<String>) -> Self {
        Self::new(codes::EXECUTION_FAILED, message)
    }

    pub fn processing_timeout(budget: Duration) -> Self {
        Self::new(
            codes::PROCESSING_TIMEOUT,
            format!("Handler timed out after {:.0}s", budget.as_secs_f64()),
        )
    }

    pub fn is_processing_timeout(&self) -> bool {
        self.code == codes::PROCESSING_TIMEOUT
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Age of a unix timestamp; `None` for timestamps that are not finite.
pub fn age_since(timestamp: f64) -> Option<Duration> {
    if !timestamp.is_finite() {
        return None;
    }
    Duration::try_from_secs_f64((unix_now() - timestamp).max(0.0)).ok()
}

/// Roughly a century; stands in for "no deadline" when a budget does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// `start + budget`, saturating instead of panicking on overflow.
pub(crate) fn deadline_after(start: Instant, budget: Duration) -> Instant {
    start
        .checked_add(budget)
        .or_else(|| start.checked_add(FAR_FUTURE))
        .unwrap_or(start)
}

pub(crate) fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

pub(crate) fn round_secs(duration: Duration) -> f64 {
    (duration.as_secs_f64() * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn response_envelope_carries_result_or_error_key() {
        let ok = Response::ok(RequestId::from("a"), json!({"x": 1}), Duration::from_millis(5));
        let value = serde_json::to_value(&ok).unwrap();
        assert_eq!(value["id"], "a");
        assert_eq!(value["result"], json!({"x": 1}));
        assert!(value.get("error").is_none());

        let err = Response::error(
            RequestId::from("b"),
            RemoteError::method_not_found("nope"),
            Duration::ZERO,
        );
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["error"]["code"], codes::METHOD_NOT_FOUND);
        assert!(value.get("result").is_none());
    }

    #[test]
    fn response_parses_error_written_by_foreign_peer() {
        let raw = r#"{"id":"abc","error":{"code":-32000,"message":"boom"},"completed_at":1.5,"duration_ms":3}"#;
        let resp: Response = serde_json::from_str(raw).unwrap();
        assert_eq!(resp.id.as_str(), "abc");
        match resp.outcome {
            Outcome::Error(e) => {
                assert_eq!(e.code, codes::EXECUTION_FAILED);
                assert_eq!(e.context, None);
            }
            Outcome::Result(_) => panic!("expected error outcome"),
        }
    }

    #[test]
    fn request_ids_do_not_repeat() {
        let a = Request::new("ping", Value::Null, Duration::from_secs(1));
        let b = Request::new("ping", Value::Null, Duration::from_secs(1));
        assert_ne!(a.id, b.id);
        assert_eq!(a.timeout(), Duration::from_secs(1));
    }

    #[test]
    fn age_since_rejects_nan() {
        assert_eq!(age_since(f64::NAN), None);
        assert!(age_since(unix_now() + 10.0).unwrap() < Duration::from_millis(1));
        assert_eq!(age_since(-1e300), None);
    }

    #[test]
    fn deadline_after_saturates() {
        let now = Instant::now();
        assert_eq!(deadline_after(now, Duration::from_secs(2)), now + Duration::from_secs(2));
        let far = deadline_after(now, Duration::MAX);
        assert!(far > now + Duration::from_secs(365 * 24 * 60 * 60));
    }
}
