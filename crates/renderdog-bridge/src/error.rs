use std::{path::PathBuf, time::Duration};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use crate::{RemoteError, RequestId};

/// Stable identifiers for caller-visible errors and recent-error entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Timeout,
    StaleResponse,
    Overwritten,
    OverwriteRefused,
    RemoteProcessingTimeout,
    RemoteExecutionError,
    TransportUnavailable,
    Cancelled,
    LockRecovered,
    UnreadableMessage,
    PublishFailed,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Timeout => "timeout",
            ErrorCode::StaleResponse => "stale_response",
            ErrorCode::Overwritten => "overwritten",
            ErrorCode::OverwriteRefused => "overwrite_refused",
            ErrorCode::RemoteProcessingTimeout => "remote_processing_timeout",
            ErrorCode::RemoteExecutionError => "remote_execution_error",
            ErrorCode::TransportUnavailable => "transport_unavailable",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::LockRecovered => "lock_recovered",
            ErrorCode::UnreadableMessage => "unreadable_message",
            ErrorCode::PublishFailed => "publish_failed",
        }
    }
}

/// `{code, message, context?}` shape handed to upper layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("spool directory {0} does not exist; is the RenderDoc bridge extension running?")]
    MissingDir(PathBuf),
    #[error("failed to {op} {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode JSON for {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("unreadable message at {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("lock {path} is held by {holder}")]
    LockContended { path: PathBuf, holder: String },
}

impl SpoolError {
    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            op,
            path: path.into(),
            source,
        }
    }
}

/// Who gave up on a timed-out request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutOrigin {
    /// The caller's own budget ran out.
    Caller,
    /// The remote side exceeded its maximum processing time and said so.
    Remote,
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("request `{method}` timed out after {:.1}s ({detail})", .waited.as_secs_f64())]
    Timeout {
        method: String,
        request_id: Option<RequestId>,
        waited: Duration,
        origin: TimeoutOrigin,
        detail: String,
    },
    #[error("remote execution of `{method}` failed: {error}")]
    RemoteExecution { method: String, error: RemoteError },
    #[error("bridge transport unavailable: {reason}")]
    TransportUnavailable {
        reason: String,
        #[source]
        source: Option<SpoolError>,
    },
    #[error("request `{method}` was cancelled")]
    Cancelled { method: String },
}

impl BridgeError {
    pub(crate) fn unavailable(reason: impl Into<String>) -> Self {
        Self::TransportUnavailable {
            reason: reason.into(),
            source: None,
        }
    }

    pub(crate) fn spool(reason: impl Into<String>, source: SpoolError) -> Self {
        Self::TransportUnavailable {
            reason: reason.into(),
            source: Some(source),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            BridgeError::Timeout { .. } => ErrorCode::Timeout,
            BridgeError::RemoteExecution { .. } => ErrorCode::RemoteExecutionError,
            BridgeError::TransportUnavailable { .. } => ErrorCode::TransportUnavailable,
            BridgeError::Cancelled { .. } => ErrorCode::Cancelled,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, BridgeError::Timeout { .. })
    }

    pub fn info(&self) -> ErrorInfo {
        let context = match self {
            BridgeError::Timeout {
                method,
                request_id,
                waited,
                origin,
                detail,
            } => Some(json!({
                "method": method,
                "request_id": request_id,
                "waited_sec": waited.as_secs_f64(),
                "origin": origin,
                "detail": detail,
            })),
            BridgeError::RemoteExecution { method, error } => Some(json!({
                "method": method,
                "remote_code": error.code,
                "remote_context": error.context,
            })),
            BridgeError::TransportUnavailable {
                source: Some(source),
                ..
            } => Some(json!({ "cause": source.to_string() })),
            BridgeError::TransportUnavailable { source: None, .. } => None,
            BridgeError::Cancelled { method } => Some(json!({ "method": method })),
        };
        let message = match self {
            BridgeError::RemoteExecution { error, .. } => error.message.clone(),
            other => other.to_string(),
        };
        ErrorInfo {
            code: self.code(),
            message,
            context,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_execution_info_keeps_remote_message() {
        let err = BridgeError::RemoteExecution {
            method: "get_texture_info".into(),
            error: RemoteError::invalid_params("resource_id is required"),
        };
        let info = err.info();
        assert_eq!(info.code, ErrorCode::RemoteExecutionError);
        assert_eq!(info.message, "resource_id is required");
        assert_eq!(info.context.unwrap()["remote_code"], crate::codes::INVALID_PARAMS);
    }

    #[test]
    fn error_codes_serialize_as_snake_case() {
        for code in [
            ErrorCode::Timeout,
            ErrorCode::StaleResponse,
            ErrorCode::RemoteProcessingTimeout,
            ErrorCode::TransportUnavailable,
        ] {
            let value = serde_json::to_value(code).unwrap();
            assert_eq!(value, code.as_str());
        }
    }

    #[test]
    fn timeout_display_mentions_method_and_detail() {
        let err = BridgeError::Timeout {
            method: "open_capture".into(),
            request_id: None,
            waited: Duration::from_secs(45),
            origin: TimeoutOrigin::Caller,
            detail: "heartbeat_age=0.4s (alive - handler may be stuck)".into(),
        };
        let text = err.to_string();
        assert!(text.contains("open_capture"));
        assert!(text.contains("45.0s"));
        assert!(text.contains("handler may be stuck"));
    }
}
