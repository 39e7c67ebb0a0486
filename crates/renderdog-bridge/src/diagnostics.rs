use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{ErrorCode, ErrorInfo, HealthStatus, RequestId};

pub const SCHEMA_VERSION: &str = "bridge_diagnostics.v1";

fn default_true() -> bool {
    true
}

fn default_max_recent_errors() -> usize {
    16
}

/// Arguments of a diagnostics query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DiagnosticsQuery {
    #[serde(default = "default_true")]
    pub include_recent_errors: bool,
    #[serde(default = "default_max_recent_errors")]
    pub max_recent_errors: usize,
}

impl Default for DiagnosticsQuery {
    fn default() -> Self {
        Self {
            include_recent_errors: default_true(),
            max_recent_errors: default_max_recent_errors(),
        }
    }
}

/// Which side of the bridge produced a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Client,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct QueueStats {
    pub pending_count: u64,
    pub oldest_pending_age_sec: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ActiveRequestView {
    pub id: RequestId,
    pub method: String,
    pub elapsed_sec: f64,
    pub timeout_sec: f64,
    /// The caller gave up, but the remote side may still be working on it.
    pub abandoned: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Completed,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LastRequest {
    pub request_id: RequestId,
    pub method: String,
    pub status: RequestStatus,
    pub duration_sec: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub struct Counters {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub stale_responses: u64,
    pub overwritten: u64,
    pub lock_recoveries: u64,
    pub unreadable_messages: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RecentError {
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    pub code: ErrorCode,
    pub message: String,
}

/// Point-in-time view of one side of the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DiagnosticsSnapshot {
    pub schema_version: String,
    pub role: Role,
    pub uptime_sec: f64,
    pub heartbeat_age_sec: Option<f64>,
    pub health_status: HealthStatus,
    pub request_active: bool,
    pub queue: QueueStats,
    pub active_request: Option<ActiveRequestView>,
    pub counters: Counters,
    pub last_request: Option<LastRequest>,
    #[serde(default)]
    pub recent_errors: Vec<RecentError>,
}

/// How the remote half of a [`BridgeDiagnostics`] was obtained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum RemoteView {
    /// Answered by the running poller through the diagnostics slot.
    Live { snapshot: DiagnosticsSnapshot },
    /// The live query failed; this is whatever the remote side last persisted.
    Persisted {
        snapshot: Option<DiagnosticsSnapshot>,
        path: String,
        transport_error: ErrorInfo,
    },
}

impl RemoteView {
    pub fn snapshot(&self) -> Option<&DiagnosticsSnapshot> {
        match self {
            RemoteView::Live { snapshot } => Some(snapshot),
            RemoteView::Persisted { snapshot, .. } => snapshot.as_ref(),
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, RemoteView::Live { .. })
    }
}

/// Combined answer of `get_bridge_diagnostics`: the caller's own view plus the remote side's.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BridgeDiagnostics {
    pub schema_version: String,
    pub client: DiagnosticsSnapshot,
    pub remote: RemoteView,
}
