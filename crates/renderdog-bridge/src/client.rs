use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;

use crate::{
    BridgeConfig, BridgeError, ConfigError, ErrorCode, HealthStatus, HeartbeatMonitor,
    HeartbeatReading, OverwritePolicy, Outcome, Request, RequestId, Response, SpoolError,
    TimeoutOrigin,
    correlation::{AwaitOutcome, CancelHandle, CorrelationObserver},
    diagnostics::{BridgeDiagnostics, DiagnosticsQuery, DiagnosticsSnapshot, RemoteView, Role, SCHEMA_VERSION},
    protocol::{DIAGNOSTICS_METHOD, deadline_after},
    spool::{Leftover, PendingRequest, Slot, SlotLock, SpoolStore},
    tracker::LifecycleTracker,
};

/// Per-call overrides.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Replaces the configured budget for this call (the hard cap and lock staleness limit still
    /// apply).
    pub timeout: Option<Duration>,
    pub cancel: Option<CancelHandle>,
}

/// Caller side of the bridge.
///
/// Safe to share between threads; concurrent calls are serialized onto the single call slot.
/// Diagnostics queries use their own slot and never wait behind a call.
#[derive(Debug)]
pub struct ClientBridge {
    config: BridgeConfig,
    store: SpoolStore,
    tracker: LifecycleTracker,
    monitor: HeartbeatMonitor,
    call_slot: Mutex<()>,
    diagnostics_slot: Mutex<()>,
}

struct CallObserver<'a> {
    bridge: &'a ClientBridge,
    tracked: bool,
}

impl CorrelationObserver for CallObserver<'_> {
    fn stale_response(&self, expected: &RequestId, response: &Response) {
        if !self.tracked {
            return;
        }
        self.bridge.tracker.stale_response(
            Some(&response.id),
            format!("discarded response {} while awaiting {expected}", response.id),
        );
    }

    fn unreadable_response(&self, error: &SpoolError) {
        self.bridge.tracker.unreadable(error.to_string());
    }

    fn abort_reason(&self) -> Option<String> {
        if !self.tracked {
            return None;
        }
        let reading = self.bridge.monitor.observe(&self.bridge.store, true);
        (reading.status == HealthStatus::Stalled).then(|| {
            format!(
                "remote side stalled during request ({})",
                reading.describe(self.bridge.monitor.policy())
            )
        })
    }
}

impl ClientBridge {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            store: SpoolStore::new(config.spool_dir.clone()),
            tracker: LifecycleTracker::new(Role::Client, config.recent_error_capacity),
            monitor: HeartbeatMonitor::new(config.heartbeat),
            call_slot: Mutex::new(()),
            diagnostics_slot: Mutex::new(()),
            config,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self::new(BridgeConfig::from_env()?))
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn store(&self) -> &SpoolStore {
        &self.store
    }

    pub fn tracker(&self) -> &LifecycleTracker {
        &self.tracker
    }

    /// Calls `method` with the configured budget and returns its result payload.
    pub fn call(&self, method: &str, args: Value) -> Result<Value, BridgeError> {
        self.call_with(method, args, CallOptions::default())
    }

    pub fn call_with(
        &self,
        method: &str,
        args: Value,
        options: CallOptions,
    ) -> Result<Value, BridgeError> {
        let diagnostics = method == DIAGNOSTICS_METHOD;
        let timeout = match options.timeout {
            Some(t) => self.config.cap_timeout(t),
            None if diagnostics => self.config.cap_timeout(self.config.diagnostics_timeout),
            None => self.config.timeout_for(method),
        };
        if diagnostics {
            self.diagnostics_exchange(args, timeout, options.cancel.as_ref())
        } else {
            self.tracked_call(method, args, timeout, options.cancel.as_ref())
        }
    }

    fn tracked_call(
        &self,
        method: &str,
        args: Value,
        timeout: Duration,
        cancel: Option<&CancelHandle>,
    ) -> Result<Value, BridgeError> {
        self.preflight()?;

        let ticket = self.tracker.enqueue();
        let enqueue_budget = self.config.enqueue_budget(timeout);
        let enqueue_started = Instant::now();
        let Some(_slot) = self.call_slot.try_lock_for(enqueue_budget) else {
            return Err(self.enqueue_timeout(method, enqueue_started.elapsed(), "call slot busy"));
        };
        let _lock = self.acquire_lock(
            Slot::Call,
            method,
            deadline_after(enqueue_started, enqueue_budget),
        )?;
        drop(ticket);

        self.sweep_responses(Slot::Call)?;
        self.clear_request_slot(method)?;

        let request = Request::new(method, args, timeout);
        let pending = self.store.publish(Slot::Call, &request).map_err(|e| {
            self.tracker.record_error(
                Some(&request.id),
                Some(method),
                ErrorCode::PublishFailed,
                e.to_string(),
            );
            BridgeError::spool("failed to publish request", e)
        })?;
        self.tracker.submitted(&request);
        tracing::debug!(method, request_id = %request.id, "request published");

        let observer = CallObserver {
            bridge: self,
            tracked: true,
        };
        let outcome = self.store.await_response(
            &pending,
            timeout,
            self.config.client_poll_interval,
            cancel,
            &observer,
        );
        self.settle(&pending, outcome)
    }

    /// Maps the end of a wait onto tracker transitions and the caller-visible result.
    fn settle(
        &self,
        pending: &PendingRequest,
        outcome: Result<AwaitOutcome, SpoolError>,
    ) -> Result<Value, BridgeError> {
        let request = &pending.request;
        let id = &request.id;
        let method = request.method.as_str();
        let elapsed = pending.published.elapsed();

        match outcome {
            Ok(AwaitOutcome::Matched(response)) => match response.outcome {
                Outcome::Result(value) => {
                    self.tracker.completed(id, method, elapsed);
                    tracing::debug!(
                        method,
                        request_id = %id,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "request completed"
                    );
                    Ok(value)
                }
                Outcome::Error(error) if error.is_processing_timeout() => {
                    self.tracker.timed_out(
                        id,
                        method,
                        elapsed,
                        false,
                        ErrorCode::RemoteProcessingTimeout,
                        error.message.clone(),
                    );
                    Err(BridgeError::Timeout {
                        method: method.to_string(),
                        request_id: Some(id.clone()),
                        waited: elapsed,
                        origin: TimeoutOrigin::Remote,
                        detail: error.message,
                    })
                }
                Outcome::Error(error) => {
                    self.tracker.failed(
                        id,
                        method,
                        elapsed,
                        ErrorCode::RemoteExecutionError,
                        error.to_string(),
                    );
                    Err(BridgeError::RemoteExecution {
                        method: method.to_string(),
                        error,
                    })
                }
            },
            Ok(AwaitOutcome::TimedOut { waited }) => {
                let reading = self.monitor.observe(&self.store, true);
                let detail = reading.describe(self.monitor.policy());
                // Only a live heartbeat suggests the remote side may still be working on it.
                let keep_active = reading.is_fresh(self.monitor.policy());
                self.tracker.timed_out(
                    id,
                    method,
                    waited,
                    keep_active,
                    ErrorCode::Timeout,
                    format!("no response after {:.1}s ({detail})", waited.as_secs_f64()),
                );
                tracing::warn!(method, request_id = %id, %detail, "request timed out");
                Err(BridgeError::Timeout {
                    method: method.to_string(),
                    request_id: Some(id.clone()),
                    waited,
                    origin: TimeoutOrigin::Caller,
                    detail,
                })
            }
            Ok(AwaitOutcome::Cancelled) => {
                self.tracker
                    .failed(id, method, elapsed, ErrorCode::Cancelled, "cancelled by caller");
                Err(BridgeError::Cancelled {
                    method: method.to_string(),
                })
            }
            Ok(AwaitOutcome::Aborted(reason)) => {
                self.tracker.failed(
                    id,
                    method,
                    elapsed,
                    ErrorCode::TransportUnavailable,
                    reason.clone(),
                );
                Err(BridgeError::unavailable(reason))
            }
            Err(e) => {
                self.tracker.failed(
                    id,
                    method,
                    elapsed,
                    ErrorCode::TransportUnavailable,
                    e.to_string(),
                );
                Err(BridgeError::spool("failed while awaiting response", e))
            }
        }
    }

    /// The spool must exist and the remote heartbeat must not be missing or stalled.
    fn preflight(&self) -> Result<HeartbeatReading, BridgeError> {
        self.store
            .check_available()
            .map_err(|e| BridgeError::spool("spool directory unavailable", e))?;
        if self.store.heartbeat_age().is_none() {
            self.monitor.wait_for_heartbeat(
                &self.store,
                self.config.heartbeat.startup_grace,
                self.config.client_poll_interval,
            );
        }
        let reading = self.monitor.observe(&self.store, self.tracker.is_working());
        if reading.age_sec.is_none() {
            return Err(BridgeError::unavailable(format!(
                "no heartbeat in {}; is the RenderDoc bridge extension running?",
                self.store.dir().display()
            )));
        }
        if reading.status == HealthStatus::Stalled {
            return Err(BridgeError::unavailable(format!(
                "remote side is stalled: {}",
                reading.describe(self.monitor.policy())
            )));
        }
        Ok(reading)
    }

    fn enqueue_timeout(&self, method: &str, waited: Duration, detail: &str) -> BridgeError {
        self.tracker
            .record_error(None, Some(method), ErrorCode::Timeout, detail.to_string());
        BridgeError::Timeout {
            method: method.to_string(),
            request_id: None,
            waited,
            origin: TimeoutOrigin::Caller,
            detail: detail.to_string(),
        }
    }

    fn acquire_lock(
        &self,
        slot: Slot,
        method: &str,
        deadline: Instant,
    ) -> Result<SlotLock, BridgeError> {
        let started = Instant::now();
        match SlotLock::acquire(
            &self.store,
            slot,
            deadline,
            self.config.lock_stale_age,
            self.config.client_poll_interval,
        ) {
            Ok(lock) => {
                if let Some(holder) = lock.recovered_from() {
                    self.tracker
                        .lock_recovered(format!("recovered abandoned {slot:?} lock from {holder}"));
                }
                Ok(lock)
            }
            Err(SpoolError::LockContended { holder, .. }) => Err(self.enqueue_timeout(
                method,
                started.elapsed(),
                &format!("slot lock held by {holder}"),
            )),
            Err(e) => Err(BridgeError::spool("failed to take slot lock", e)),
        }
    }

    /// Consumes responses left over from earlier, abandoned calls.
    fn sweep_responses(&self, slot: Slot) -> Result<(), BridgeError> {
        loop {
            match self.store.take_response(slot) {
                Ok(Some(leftover)) => {
                    if slot == Slot::Call {
                        self.tracker.stale_response(
                            Some(&leftover.id),
                            format!("swept leftover response {}", leftover.id),
                        );
                    }
                }
                Ok(None) => return Ok(()),
                Err(e @ SpoolError::Corrupt { .. }) => self.tracker.unreadable(e.to_string()),
                Err(e) => return Err(BridgeError::spool("failed to sweep response slot", e)),
            }
        }
    }

    /// Applies the overwrite policy to an unclaimed request left in the call slot.
    fn clear_request_slot(&self, method: &str) -> Result<(), BridgeError> {
        if !self.store.has_pending_request(Slot::Call) {
            return Ok(());
        }
        match self.config.overwrite_policy {
            OverwritePolicy::Replace => {}
            OverwritePolicy::WaitForClaim(wait) => {
                let deadline = deadline_after(Instant::now(), wait);
                while self.store.has_pending_request(Slot::Call) && Instant::now() < deadline {
                    std::thread::sleep(self.config.client_poll_interval);
                }
            }
            OverwritePolicy::Fail => {
                let message = "call slot holds an unclaimed request and the overwrite policy is `fail`";
                self.tracker
                    .record_error(None, Some(method), ErrorCode::OverwriteRefused, message);
                return Err(BridgeError::unavailable(message));
            }
        }
        match self.store.withdraw_request(Slot::Call) {
            Ok(Leftover::Withdrawn(previous)) => {
                tracing::warn!(
                    method,
                    previous = previous.as_ref().map(|r| r.method.as_str()),
                    "replacing unclaimed request"
                );
                self.tracker.overwritten(previous.as_ref());
                Ok(())
            }
            Ok(Leftover::None) => Ok(()),
            Err(e) => Err(BridgeError::spool("failed to clear request slot", e)),
        }
    }

    /// Untracked exchange over the diagnostics slot pair.
    fn diagnostics_exchange(
        &self,
        args: Value,
        timeout: Duration,
        cancel: Option<&CancelHandle>,
    ) -> Result<Value, BridgeError> {
        let method = DIAGNOSTICS_METHOD;
        self.preflight()?;
        let started = Instant::now();
        let Some(_slot) = self.diagnostics_slot.try_lock_for(timeout) else {
            return Err(self.enqueue_timeout(method, started.elapsed(), "diagnostics slot busy"));
        };
        let _lock =
            self.acquire_lock(Slot::Diagnostics, method, deadline_after(started, timeout))?;
        self.sweep_responses(Slot::Diagnostics)?;
        if let Err(e) = self.store.withdraw_request(Slot::Diagnostics) {
            return Err(BridgeError::spool("failed to clear diagnostics slot", e));
        }

        let request = Request::new(method, args, timeout);
        let pending = self
            .store
            .publish(Slot::Diagnostics, &request)
            .map_err(|e| BridgeError::spool("failed to publish diagnostics request", e))?;
        let observer = CallObserver {
            bridge: self,
            tracked: false,
        };
        let outcome = self
            .store
            .await_response(&pending, timeout, self.config.client_poll_interval, cancel, &observer)
            .map_err(|e| BridgeError::spool("failed while awaiting diagnostics", e))?;
        match outcome {
            AwaitOutcome::Matched(Response {
                outcome: Outcome::Result(value),
                ..
            }) => Ok(value),
            AwaitOutcome::Matched(Response {
                outcome: Outcome::Error(error),
                ..
            }) => Err(BridgeError::RemoteExecution {
                method: method.to_string(),
                error,
            }),
            AwaitOutcome::TimedOut { waited } => {
                let reading = self.monitor.observe(&self.store, self.tracker.is_working());
                Err(self.enqueue_timeout(
                    method,
                    waited,
                    &format!("diagnostics unanswered ({})", reading.describe(self.monitor.policy())),
                ))
            }
            AwaitOutcome::Cancelled => Err(BridgeError::Cancelled {
                method: method.to_string(),
            }),
            AwaitOutcome::Aborted(reason) => Err(BridgeError::unavailable(reason)),
        }
    }

    /// This process's own view of the bridge.
    pub fn local_diagnostics(&self, query: &DiagnosticsQuery) -> DiagnosticsSnapshot {
        let reading = self.heartbeat();
        self.tracker
            .snapshot(reading, self.store.pending(Slot::Call), query)
    }

    pub fn heartbeat(&self) -> HeartbeatReading {
        self.monitor.observe(&self.store, self.tracker.is_working())
    }

    /// Local view plus the remote side's live snapshot, falling back to the last persisted
    /// snapshot when the live query fails.
    pub fn diagnostics(&self, query: &DiagnosticsQuery) -> BridgeDiagnostics {
        let client = self.local_diagnostics(query);
        let live = serde_json::to_value(query)
            .map_err(|e| BridgeError::unavailable(format!("failed to encode query: {e}")))
            .and_then(|args| self.call(DIAGNOSTICS_METHOD, args))
            .and_then(|value| {
                serde_json::from_value::<DiagnosticsSnapshot>(value).map_err(|e| {
                    BridgeError::unavailable(format!("undecodable diagnostics snapshot: {e}"))
                })
            });
        let remote = match live {
            Ok(snapshot) => RemoteView::Live { snapshot },
            Err(err) => {
                tracing::warn!(err = %err, "live diagnostics failed; using persisted snapshot");
                let snapshot = match self.store.read_snapshot() {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        tracing::debug!(err = %e, "persisted snapshot unreadable");
                        None
                    }
                };
                RemoteView::Persisted {
                    snapshot,
                    path: self.store.snapshot_path().display().to_string(),
                    transport_error: err.info(),
                }
            }
        };
        BridgeDiagnostics {
            schema_version: SCHEMA_VERSION.to_string(),
            client,
            remote,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn quick_config(dir: &std::path::Path) -> BridgeConfig {
        let mut cfg = BridgeConfig::with_spool_dir(dir);
        cfg.heartbeat.startup_grace = Duration::from_millis(50);
        cfg.client_poll_interval = Duration::from_millis(5);
        cfg.request_timeout = Duration::from_millis(100);
        cfg.enqueue_timeout = Duration::from_millis(100);
        cfg.diagnostics_timeout = Duration::from_millis(100);
        cfg
    }

    #[test]
    fn missing_spool_dir_is_transport_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = ClientBridge::new(quick_config(&dir.path().join("absent")));
        let err = bridge.call("ping", json!({})).unwrap_err();
        assert_eq!(err.code(), ErrorCode::TransportUnavailable);
    }

    #[test]
    fn missing_heartbeat_fails_after_grace() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = ClientBridge::new(quick_config(dir.path()));
        let err = bridge.call("ping", json!({})).unwrap_err();
        assert!(err.to_string().contains("no heartbeat"), "{err}");
        assert_eq!(bridge.tracker().counters().submitted, 0);
    }

    #[test]
    fn unanswered_call_times_out_and_leaves_request_behind() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = ClientBridge::new(quick_config(dir.path()));
        bridge.store().write_heartbeat().unwrap();

        let err = bridge.call("ping", json!({})).unwrap_err();
        assert!(err.is_timeout());
        assert!(err.to_string().contains("alive - handler may be stuck"), "{err}");
        let counters = bridge.tracker().counters();
        assert_eq!((counters.submitted, counters.timed_out), (1, 1));
        assert!(bridge.store().has_pending_request(Slot::Call));

        // The next call replaces the unclaimed leftover under the default policy.
        let _ = bridge.call("ping", json!({}));
        assert_eq!(bridge.tracker().counters().overwritten, 1);
    }

    fn write_aged_heartbeat(store: &SpoolStore, age: Duration) {
        let stamp = crate::unix_now() - age.as_secs_f64();
        std::fs::write(store.heartbeat_path(), format!("{stamp:.3}")).unwrap();
    }

    #[test]
    fn timeout_with_stale_heartbeat_clears_active_request() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = quick_config(dir.path());
        cfg.heartbeat.max_age = Duration::from_secs(1);
        let bridge = ClientBridge::new(cfg);
        // Degraded but not stalled, so the call is still attempted.
        write_aged_heartbeat(bridge.store(), Duration::from_secs(5));

        let err = bridge.call("ping", json!({})).unwrap_err();
        assert!(err.is_timeout());
        assert!(err.to_string().contains("STALE"), "{err}");

        let snap = bridge.local_diagnostics(&DiagnosticsQuery::default());
        assert!(snap.active_request.is_none());
        assert!(!snap.request_active);
        assert_eq!(snap.counters.timed_out, 1);
    }

    #[test]
    fn abandoned_request_does_not_mask_a_dead_remote() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = ClientBridge::new(quick_config(dir.path()));
        bridge.store().write_heartbeat().unwrap();

        let err = bridge.call("ping", json!({})).unwrap_err();
        assert!(err.is_timeout());
        let snap = bridge.local_diagnostics(&DiagnosticsQuery::default());
        assert!(snap.active_request.as_ref().unwrap().abandoned);
        assert!(!snap.request_active);

        write_aged_heartbeat(bridge.store(), Duration::from_secs(600));
        let reading = bridge.heartbeat();
        assert_eq!(reading.status, HealthStatus::Stalled);
        assert!(!reading.request_active);
        let snap = bridge.local_diagnostics(&DiagnosticsQuery::default());
        assert_eq!(snap.health_status, HealthStatus::Stalled);

        let err = bridge.call("ping", json!({})).unwrap_err();
        assert_eq!(err.code(), ErrorCode::TransportUnavailable);
        assert!(err.to_string().contains("stalled"), "{err}");
        assert_eq!(bridge.tracker().counters().submitted, 1);
    }

    #[test]
    fn unbounded_budgets_do_not_overflow_deadlines() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = quick_config(dir.path());
        cfg.enqueue_timeout = Duration::MAX;
        cfg.lock_stale_age = Duration::MAX;
        let bridge = ClientBridge::new(cfg);
        bridge.store().write_heartbeat().unwrap();

        let cancel = CancelHandle::new();
        let err = std::thread::scope(|scope| {
            let trigger = cancel.clone();
            scope.spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                trigger.cancel();
            });
            bridge
                .call_with(
                    "ping",
                    json!({}),
                    CallOptions {
                        timeout: Some(Duration::MAX),
                        cancel: Some(cancel.clone()),
                    },
                )
                .unwrap_err()
        });
        assert!(matches!(err, BridgeError::Cancelled { .. }), "{err}");
    }

    #[test]
    fn diagnostics_fall_back_to_persisted_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = ClientBridge::new(quick_config(dir.path()));
        let persisted = bridge.local_diagnostics(&DiagnosticsQuery::default());
        bridge.store().persist_snapshot(&persisted).unwrap();

        let report = bridge.diagnostics(&DiagnosticsQuery::default());
        match report.remote {
            RemoteView::Persisted {
                snapshot,
                transport_error,
                ..
            } => {
                let snapshot = snapshot.unwrap();
                assert_eq!(snapshot.role, Role::Client);
                assert_eq!(snapshot.counters, persisted.counters);
                assert_eq!(transport_error.code, ErrorCode::TransportUnavailable);
            }
            RemoteView::Live { .. } => panic!("no remote side is running"),
        }
        assert_eq!(report.client.role, Role::Client);
    }
}
