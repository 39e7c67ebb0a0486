use std::{
    collections::{BTreeMap, HashSet, VecDeque},
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use crate::{
    ErrorCode, HeartbeatReading, Request, RequestId,
    diagnostics::{
        ActiveRequestView, Counters, DiagnosticsQuery, DiagnosticsSnapshot, LastRequest,
        QueueStats, RecentError, RequestStatus, Role, SCHEMA_VERSION,
    },
    protocol::{round_secs, unix_now},
    spool::SlotQueue,
};

/// Terminal transitions remembered for deduplication.
const TERMINAL_MEMORY: usize = 2048;

#[derive(Debug, Clone)]
struct ActiveRequest {
    id: RequestId,
    method: String,
    started: Instant,
    timeout: Duration,
    abandoned: bool,
}

#[derive(Debug, Default)]
struct TrackerState {
    active: Option<ActiveRequest>,
    last: Option<LastRequest>,
    recent: VecDeque<RecentError>,
    waiters: BTreeMap<u64, Instant>,
    next_waiter: u64,
    terminal: HashSet<RequestId>,
    terminal_order: VecDeque<RequestId>,
}

impl TrackerState {
    /// `false` when `id` already reached a terminal state.
    fn mark_terminal(&mut self, id: &RequestId) -> bool {
        if !self.terminal.insert(id.clone()) {
            return false;
        }
        self.terminal_order.push_back(id.clone());
        while self.terminal_order.len() > TERMINAL_MEMORY {
            if let Some(old) = self.terminal_order.pop_front() {
                self.terminal.remove(&old);
            }
        }
        true
    }

    fn clear_active(&mut self, id: &RequestId) {
        if self.active.as_ref().is_some_and(|a| &a.id == id) {
            self.active = None;
        }
    }
}

#[derive(Debug, Default)]
struct AtomicCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    stale_responses: AtomicU64,
    overwritten: AtomicU64,
    lock_recoveries: AtomicU64,
    unreadable_messages: AtomicU64,
}

impl AtomicCounters {
    fn load(&self) -> Counters {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        Counters {
            submitted: get(&self.submitted),
            completed: get(&self.completed),
            failed: get(&self.failed),
            timed_out: get(&self.timed_out),
            stale_responses: get(&self.stale_responses),
            overwritten: get(&self.overwritten),
            lock_recoveries: get(&self.lock_recoveries),
            unreadable_messages: get(&self.unreadable_messages),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Counters, recent errors and the active request descriptor for one side of the bridge.
///
/// Counters are atomics. Everything else sits behind one mutex that is only held for field
/// updates, never across file I/O or while waiting on a peer, so a snapshot can always be taken
/// while a request is in flight.
#[derive(Debug)]
pub struct LifecycleTracker {
    role: Role,
    started: Instant,
    recent_capacity: usize,
    counters: AtomicCounters,
    state: Mutex<TrackerState>,
}

/// Marks one caller waiting for the call slot; dropping it leaves the queue.
#[must_use = "the caller leaves the queue when the ticket is dropped"]
pub struct QueueTicket<'a> {
    tracker: &'a LifecycleTracker,
    key: u64,
}

impl Drop for QueueTicket<'_> {
    fn drop(&mut self) {
        self.tracker.state.lock().waiters.remove(&self.key);
    }
}

impl LifecycleTracker {
    pub fn new(role: Role, recent_capacity: usize) -> Self {
        Self {
            role,
            started: Instant::now(),
            recent_capacity: recent_capacity.max(1),
            counters: AtomicCounters::default(),
            state: Mutex::new(TrackerState::default()),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn counters(&self) -> Counters {
        self.counters.load()
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active.is_some()
    }

    /// Like [`is_active`](Self::is_active), but a descriptor kept after a caller timeout does not
    /// count: nobody is waiting on it, so it must not excuse a stale heartbeat.
    pub fn is_working(&self) -> bool {
        self.state.lock().active.as_ref().is_some_and(|a| !a.abandoned)
    }

    pub fn active_id(&self) -> Option<RequestId> {
        self.state.lock().active.as_ref().map(|a| a.id.clone())
    }

    pub fn enqueue(&self) -> QueueTicket<'_> {
        let mut state = self.state.lock();
        let key = state.next_waiter;
        state.next_waiter += 1;
        state.waiters.insert(key, Instant::now());
        QueueTicket { tracker: self, key }
    }

    /// Records a published (client) or claimed (remote) request and makes it the active one.
    pub fn submitted(&self, request: &Request) {
        bump(&self.counters.submitted);
        self.state.lock().active = Some(ActiveRequest {
            id: request.id.clone(),
            method: request.method.clone(),
            started: Instant::now(),
            timeout: request.timeout(),
            abandoned: false,
        });
    }

    /// Returns `false` when `id` was already terminal and nothing was counted.
    pub fn completed(&self, id: &RequestId, method: &str, duration: Duration) -> bool {
        let mut state = self.state.lock();
        if !state.mark_terminal(id) {
            return false;
        }
        bump(&self.counters.completed);
        state.clear_active(id);
        state.last = Some(last_request(id, method, RequestStatus::Completed, duration));
        true
    }

    pub fn failed(
        &self,
        id: &RequestId,
        method: &str,
        duration: Duration,
        code: ErrorCode,
        message: impl Into<String>,
    ) -> bool {
        let message = message.into();
        let mut state = self.state.lock();
        if !state.mark_terminal(id) {
            return false;
        }
        bump(&self.counters.failed);
        state.clear_active(id);
        state.last = Some(last_request(id, method, RequestStatus::Failed, duration));
        self.push_error(&mut state, Some(id), Some(method), code, message);
        true
    }

    /// `keep_active` leaves the descriptor in place, marked abandoned, for a remote side that
    /// still looks alive and may yet finish the work.
    pub fn timed_out(
        &self,
        id: &RequestId,
        method: &str,
        waited: Duration,
        keep_active: bool,
        code: ErrorCode,
        message: impl Into<String>,
    ) -> bool {
        let message = message.into();
        let mut state = self.state.lock();
        if !state.mark_terminal(id) {
            return false;
        }
        bump(&self.counters.timed_out);
        if keep_active {
            if let Some(active) = state.active.as_mut().filter(|a| &a.id == id) {
                active.abandoned = true;
            }
        } else {
            state.clear_active(id);
        }
        state.last = Some(last_request(id, method, RequestStatus::TimedOut, waited));
        self.push_error(&mut state, Some(id), Some(method), code, message);
        true
    }

    /// A response or worker result that nobody is waiting for anymore.
    pub fn stale_response(&self, id: Option<&RequestId>, message: impl Into<String>) {
        bump(&self.counters.stale_responses);
        let mut state = self.state.lock();
        // The late answer proves an abandoned request is no longer running.
        if let Some(id) = id
            && state.active.as_ref().is_some_and(|a| a.abandoned && &a.id == id)
        {
            state.active = None;
        }
        self.push_error(&mut state, id, None, ErrorCode::StaleResponse, message.into());
    }

    pub fn overwritten(&self, request: Option<&Request>) {
        bump(&self.counters.overwritten);
        let message = match request {
            Some(r) => format!(
                "replaced unclaimed request `{}` ({:.1}s old)",
                r.method,
                r.age().as_secs_f64()
            ),
            None => "replaced unreadable unclaimed request".to_string(),
        };
        let mut state = self.state.lock();
        self.push_error(
            &mut state,
            request.map(|r| &r.id),
            request.map(|r| r.method.as_str()),
            ErrorCode::Overwritten,
            message,
        );
    }

    pub fn lock_recovered(&self, message: impl Into<String>) {
        bump(&self.counters.lock_recoveries);
        let mut state = self.state.lock();
        self.push_error(&mut state, None, None, ErrorCode::LockRecovered, message.into());
    }

    pub fn unreadable(&self, message: impl Into<String>) {
        bump(&self.counters.unreadable_messages);
        let mut state = self.state.lock();
        self.push_error(&mut state, None, None, ErrorCode::UnreadableMessage, message.into());
    }

    /// Appends to the recent-error ring without touching any counter.
    pub fn record_error(
        &self,
        id: Option<&RequestId>,
        method: Option<&str>,
        code: ErrorCode,
        message: impl Into<String>,
    ) {
        let mut state = self.state.lock();
        self.push_error(&mut state, id, method, code, message.into());
    }

    fn push_error(
        &self,
        state: &mut TrackerState,
        id: Option<&RequestId>,
        method: Option<&str>,
        code: ErrorCode,
        message: String,
    ) {
        while state.recent.len() >= self.recent_capacity {
            state.recent.pop_front();
        }
        state.recent.push_back(RecentError {
            timestamp: unix_now(),
            request_id: id.cloned(),
            method: method.map(str::to_string),
            code,
            message,
        });
    }

    /// Builds a snapshot. `spool` is the pending work visible in the spool itself; it is merged
    /// with callers waiting in-process for the slot.
    pub fn snapshot(
        &self,
        heartbeat: HeartbeatReading,
        spool: SlotQueue,
        query: &DiagnosticsQuery,
    ) -> DiagnosticsSnapshot {
        let counters = self.counters.load();
        let (active, last, recent, waiting, oldest_waiter) = {
            let state = self.state.lock();
            let recent: Vec<RecentError> = if query.include_recent_errors {
                let skip = state.recent.len().saturating_sub(query.max_recent_errors);
                state.recent.iter().skip(skip).cloned().collect()
            } else {
                Vec::new()
            };
            (
                state.active.clone(),
                state.last.clone(),
                recent,
                state.waiters.len() as u64,
                state.waiters.values().min().map(Instant::elapsed),
            )
        };

        let oldest = match (oldest_waiter, spool.oldest_pending_age) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };

        DiagnosticsSnapshot {
            schema_version: SCHEMA_VERSION.to_string(),
            role: self.role,
            uptime_sec: round_secs(self.started.elapsed()),
            heartbeat_age_sec: heartbeat.age_sec,
            health_status: heartbeat.status,
            request_active: heartbeat.request_active
                || active.as_ref().is_some_and(|a| !a.abandoned),
            queue: QueueStats {
                pending_count: waiting + spool.pending_count,
                oldest_pending_age_sec: oldest.map(round_secs),
            },
            active_request: active.map(|a| ActiveRequestView {
                id: a.id,
                method: a.method,
                elapsed_sec: round_secs(a.started.elapsed()),
                timeout_sec: round_secs(a.timeout),
                abandoned: a.abandoned,
            }),
            counters,
            last_request: last,
            recent_errors: recent,
        }
    }
}

fn last_request(
    id: &RequestId,
    method: &str,
    status: RequestStatus,
    duration: Duration,
) -> LastRequest {
    LastRequest {
        request_id: id.clone(),
        method: method.to_string(),
        status,
        duration_sec: round_secs(duration),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::HealthStatus;

    fn reading(active: bool) -> HeartbeatReading {
        HeartbeatReading {
            age_sec: Some(0.2),
            status: HealthStatus::Healthy,
            request_active: active,
        }
    }

    fn request(method: &str) -> Request {
        Request::new(method, json!({}), Duration::from_secs(10))
    }

    #[test]
    fn terminal_transitions_count_once() {
        let tracker = LifecycleTracker::new(Role::Client, 8);
        let req = request("ping");
        tracker.submitted(&req);
        assert!(tracker.is_working());
        assert!(tracker.completed(&req.id, "ping", Duration::from_millis(3)));
        assert!(!tracker.completed(&req.id, "ping", Duration::from_millis(3)));
        assert!(!tracker.failed(&req.id, "ping", Duration::ZERO, ErrorCode::Cancelled, "x"));

        let c = tracker.counters();
        assert_eq!((c.submitted, c.completed, c.failed), (1, 1, 0));
        assert!(!tracker.is_active());
    }

    #[test]
    fn timeout_can_keep_an_abandoned_descriptor() {
        let tracker = LifecycleTracker::new(Role::Client, 8);
        let req = request("open_capture");
        tracker.submitted(&req);
        tracker.timed_out(
            &req.id,
            &req.method,
            Duration::from_secs(45),
            true,
            ErrorCode::Timeout,
            "timed out",
        );
        assert!(tracker.is_active());
        assert!(!tracker.is_working());
        let snap = tracker.snapshot(reading(false), SlotQueue::default(), &DiagnosticsQuery::default());
        assert!(!snap.request_active);
        let active = snap.active_request.unwrap();
        assert!(active.abandoned);
        assert_eq!(snap.counters.timed_out, 1);
        assert_eq!(snap.last_request.unwrap().status, RequestStatus::TimedOut);

        // The late answer clears it.
        tracker.stale_response(Some(&req.id), "late response");
        assert!(!tracker.is_active());
        assert_eq!(tracker.counters().stale_responses, 1);
    }

    #[test]
    fn recent_errors_evict_oldest_first() {
        let tracker = LifecycleTracker::new(Role::Remote, 3);
        for i in 0..5 {
            tracker.record_error(None, None, ErrorCode::PublishFailed, format!("e{i}"));
        }
        let snap = tracker.snapshot(reading(false), SlotQueue::default(), &DiagnosticsQuery::default());
        let messages: Vec<_> = snap.recent_errors.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, ["e2", "e3", "e4"]);

        let limited = tracker.snapshot(
            reading(false),
            SlotQueue::default(),
            &DiagnosticsQuery {
                include_recent_errors: true,
                max_recent_errors: 1,
            },
        );
        assert_eq!(limited.recent_errors.len(), 1);
        assert_eq!(limited.recent_errors[0].message, "e4");

        let none = tracker.snapshot(
            reading(false),
            SlotQueue::default(),
            &DiagnosticsQuery {
                include_recent_errors: false,
                max_recent_errors: 16,
            },
        );
        assert!(none.recent_errors.is_empty());
    }

    #[test]
    fn queue_merges_waiters_and_spool() {
        let tracker = LifecycleTracker::new(Role::Client, 4);
        let first = tracker.enqueue();
        let _second = tracker.enqueue();
        let spool = SlotQueue {
            pending_count: 1,
            oldest_pending_age: Some(Duration::from_secs(3)),
        };
        let snap = tracker.snapshot(reading(false), spool, &DiagnosticsQuery::default());
        assert_eq!(snap.queue.pending_count, 3);
        assert!(snap.queue.oldest_pending_age_sec.unwrap() >= 3.0);

        drop(first);
        let snap = tracker.snapshot(reading(false), SlotQueue::default(), &DiagnosticsQuery::default());
        assert_eq!(snap.queue.pending_count, 1);
    }

    #[test]
    fn overwrite_and_lock_recovery_have_their_own_counters() {
        let tracker = LifecycleTracker::new(Role::Client, 4);
        tracker.overwritten(Some(&request("get_draw_calls")));
        tracker.lock_recovered("pid 12 (901.0s)");
        tracker.unreadable("bad json");
        let c = tracker.counters();
        assert_eq!((c.overwritten, c.lock_recoveries, c.unreadable_messages), (1, 1, 1));
        assert_eq!((c.failed, c.timed_out), (0, 0));
    }
}
