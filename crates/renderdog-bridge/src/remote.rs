use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        mpsc::{self, TryRecvError},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use serde_json::Value;

use crate::{
    BridgeConfig, ErrorCode, Executor, HeartbeatMonitor, Outcome, RemoteError, Request, Response,
    SpoolError, codes,
    diagnostics::{DiagnosticsQuery, DiagnosticsSnapshot, Role},
    executor::parse_args,
    protocol::{DIAGNOSTICS_METHOD, deadline_after},
    spool::{Slot, SpoolStore},
    tracker::LifecycleTracker,
};

/// State shared by the poll loop, the heartbeat writer and executor workers.
#[derive(Debug)]
struct RemoteContext {
    config: BridgeConfig,
    store: SpoolStore,
    tracker: LifecycleTracker,
    monitor: HeartbeatMonitor,
}

impl RemoteContext {
    fn new(config: BridgeConfig) -> Self {
        Self {
            store: SpoolStore::new(config.spool_dir.clone()),
            tracker: LifecycleTracker::new(Role::Remote, config.recent_error_capacity),
            monitor: HeartbeatMonitor::new(config.heartbeat),
            config,
        }
    }

    fn snapshot(&self, query: &DiagnosticsQuery) -> DiagnosticsSnapshot {
        let reading = self.monitor.observe(&self.store, self.tracker.is_active());
        self.tracker
            .snapshot(reading, self.store.pending(Slot::Call), query)
    }

    fn answer_diagnostics(&self, args: &Value) -> Result<Value, RemoteError> {
        let query: DiagnosticsQuery = parse_args(args)?;
        serde_json::to_value(self.snapshot(&query))
            .map_err(|e| RemoteError::new(codes::INTERNAL, format!("failed to encode snapshot: {e}")))
    }
}

/// A request handed to a worker thread.
#[derive(Debug)]
pub(crate) struct Execution {
    request: Request,
    started: Instant,
    budget: Duration,
    deadline: Instant,
    results: mpsc::Receiver<Result<Value, RemoteError>>,
}

impl Execution {
    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// `Idle -> Claimed -> Executing -> Completed | Failed -> Idle`
#[derive(Debug, Default)]
pub(crate) enum PollerState {
    #[default]
    Idle,
    Claimed(Request),
    Executing(Execution),
    Completed { method: String, response: Response },
    Failed { method: String, response: Response },
}

impl PollerState {
    fn name(&self) -> &'static str {
        match self {
            PollerState::Idle => "idle",
            PollerState::Claimed(_) => "claimed",
            PollerState::Executing(_) => "executing",
            PollerState::Completed { .. } => "completed",
            PollerState::Failed { .. } => "failed",
        }
    }
}

/// Remote-side loop body. Each [`tick`](Self::tick) answers a pending diagnostics query, then
/// advances the call state machine until it has to wait for something.
pub(crate) struct RemotePoller {
    ctx: Arc<RemoteContext>,
    executor: Arc<dyn Executor>,
    state: PollerState,
}

impl RemotePoller {
    fn new(ctx: Arc<RemoteContext>, executor: Arc<dyn Executor>) -> Self {
        Self {
            ctx,
            executor,
            state: PollerState::default(),
        }
    }

    fn tick(&mut self) {
        self.serve_diagnostics();
        while self.step() {}
    }

    fn serve_diagnostics(&self) {
        let store = &self.ctx.store;
        let request = match store.poll_for_request(Slot::Diagnostics) {
            Ok(Some(request)) => request,
            Ok(None) => return,
            Err(e) => {
                self.absorb_poll_error(e);
                return;
            }
        };
        let started = Instant::now();
        let response = if request.method == DIAGNOSTICS_METHOD {
            match self.ctx.answer_diagnostics(&request.args) {
                Ok(value) => Response::ok(request.id, value, started.elapsed()),
                Err(e) => Response::error(request.id, e, started.elapsed()),
            }
        } else {
            Response::error(
                request.id,
                RemoteError::method_not_found(&request.method),
                started.elapsed(),
            )
        };
        if let Err(e) = store.publish_response(Slot::Diagnostics, &response) {
            tracing::warn!(err = %e, "failed to publish diagnostics response");
            self.ctx.tracker.record_error(
                Some(&response.id),
                Some(DIAGNOSTICS_METHOD),
                ErrorCode::PublishFailed,
                e.to_string(),
            );
        }
    }

    fn absorb_poll_error(&self, err: SpoolError) {
        match err {
            SpoolError::Corrupt { .. } => {
                tracing::warn!(err = %err, "dropping unreadable request");
                self.ctx.tracker.unreadable(err.to_string());
            }
            other => {
                tracing::warn!(err = %other, "failed to poll spool");
                self.ctx
                    .tracker
                    .record_error(None, None, ErrorCode::TransportUnavailable, other.to_string());
            }
        }
    }

    /// Advances one transition. `false` means the machine is resting.
    fn step(&mut self) -> bool {
        let (next, moved) = match std::mem::take(&mut self.state) {
            PollerState::Idle => match self.ctx.store.poll_for_request(Slot::Call) {
                Ok(Some(request)) => (PollerState::Claimed(request), true),
                Ok(None) => (PollerState::Idle, false),
                Err(e) => {
                    self.absorb_poll_error(e);
                    (PollerState::Idle, false)
                }
            },
            PollerState::Claimed(request) => {
                // Active before execution begins so diagnostics see accurate elapsed time.
                self.ctx.tracker.submitted(&request);
                tracing::info!(method = %request.method, request_id = %request.id, "claimed");
                (self.begin(request), true)
            }
            PollerState::Executing(execution) => self.check(execution),
            PollerState::Completed { method, response } => {
                self.publish(&response);
                let duration = Duration::from_millis(response.duration_ms);
                self.ctx.tracker.completed(&response.id, &method, duration);
                tracing::info!(
                    method = %method,
                    request_id = %response.id,
                    elapsed_ms = response.duration_ms,
                    "ok"
                );
                (PollerState::Idle, true)
            }
            PollerState::Failed { method, response } => {
                self.publish(&response);
                let duration = Duration::from_millis(response.duration_ms);
                if let Outcome::Error(error) = &response.outcome {
                    tracing::warn!(method = %method, request_id = %response.id, err = %error, "failed");
                    if error.is_processing_timeout() {
                        self.ctx.tracker.timed_out(
                            &response.id,
                            &method,
                            duration,
                            false,
                            ErrorCode::RemoteProcessingTimeout,
                            error.message.clone(),
                        );
                    } else {
                        self.ctx.tracker.failed(
                            &response.id,
                            &method,
                            duration,
                            ErrorCode::RemoteExecutionError,
                            error.to_string(),
                        );
                    }
                }
                (PollerState::Idle, true)
            }
        };
        if moved {
            tracing::trace!(state = next.name(), "poller transition");
        }
        self.state = next;
        moved
    }

    fn begin(&self, request: Request) -> PollerState {
        let started = Instant::now();
        if request.method == DIAGNOSTICS_METHOD {
            let response = match self.ctx.answer_diagnostics(&request.args) {
                Ok(value) => Response::ok(request.id, value, started.elapsed()),
                Err(e) => Response::error(request.id, e, started.elapsed()),
            };
            return finished(request.method, response);
        }

        let (tx, rx) = mpsc::channel();
        let executor = Arc::clone(&self.executor);
        let ctx = Arc::clone(&self.ctx);
        let id = request.id.clone();
        let method = request.method.clone();
        let args = request.args.clone();
        let spawned = thread::Builder::new()
            .name(format!("bridge-worker-{method}"))
            .spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| executor.execute(&method, &args)))
                    .unwrap_or_else(|payload| {
                        Err(RemoteError::new(
                            codes::INTERNAL,
                            format!("handler panicked: {}", panic_message(payload.as_ref())),
                        ))
                    });
                if tx.send(result).is_err() {
                    tracing::warn!(method = %method, request_id = %id, "discarding late result");
                    ctx.tracker.stale_response(
                        Some(&id),
                        format!("late result for `{method}` discarded after processing timeout"),
                    );
                }
            });

        match spawned {
            Ok(_) => {
                let budget = self.ctx.config.processing_budget(request.timeout());
                PollerState::Executing(Execution {
                    deadline: deadline_after(started, budget),
                    budget,
                    started,
                    request,
                    results: rx,
                })
            }
            Err(e) => finished(
                request.method,
                Response::error(
                    request.id,
                    RemoteError::new(codes::INTERNAL, format!("failed to start worker: {e}")),
                    started.elapsed(),
                ),
            ),
        }
    }

    fn check(&self, execution: Execution) -> (PollerState, bool) {
        let result = match execution.results.try_recv() {
            Ok(result) => result,
            Err(TryRecvError::Empty) if Instant::now() < execution.deadline => {
                return (PollerState::Executing(execution), false);
            }
            Err(TryRecvError::Empty) => Err(RemoteError::processing_timeout(execution.budget)),
            Err(TryRecvError::Disconnected) => Err(RemoteError::new(
                codes::INTERNAL,
                "worker exited without a result",
            )),
        };
        let elapsed = execution.elapsed();
        // Dropping the receiver turns a timed-out worker's eventual send into a stale result.
        let Execution { request, .. } = execution;
        let response = match result {
            Ok(value) => Response::ok(request.id, value, elapsed),
            Err(error) => Response::error(request.id, error, elapsed),
        };
        (finished(request.method, response), true)
    }

    fn publish(&self, response: &Response) {
        if let Err(e) = self.ctx.store.publish_response(Slot::Call, response) {
            tracing::error!(request_id = %response.id, err = %e, "failed to publish response");
            self.ctx.tracker.record_error(
                Some(&response.id),
                None,
                ErrorCode::PublishFailed,
                e.to_string(),
            );
        }
    }
}

fn finished(method: String, response: Response) -> PollerState {
    if response.is_error() {
        PollerState::Failed { method, response }
    } else {
        PollerState::Completed { method, response }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[derive(Debug, Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl StopSignal {
    fn raise(&self) {
        *self.stopped.lock() = true;
        self.wake.notify_all();
    }

    /// Sleeps up to `timeout`; `true` once stop was raised.
    fn wait(&self, timeout: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if !*stopped {
            self.wake.wait_for(&mut stopped, timeout);
        }
        *stopped
    }
}

/// Remote side of the bridge: the poll loop plus the heartbeat writer, each on its own thread.
#[derive(Debug)]
pub struct RemoteHost {
    ctx: Arc<RemoteContext>,
    stop: Arc<StopSignal>,
    threads: Vec<JoinHandle<()>>,
}

impl RemoteHost {
    /// Prepares the spool (creating it and clearing leftovers from an earlier run), writes the
    /// first heartbeat and starts both threads.
    pub fn start(config: BridgeConfig, executor: impl Executor) -> Result<Self, SpoolError> {
        let ctx = Arc::new(RemoteContext::new(config));
        ctx.store.ensure_dir()?;
        let removed = ctx.store.clear_leftovers()?;
        ctx.store.write_heartbeat()?;
        tracing::info!(dir = %ctx.store.dir().display(), removed, "bridge host started");

        let mut host = Self {
            ctx: Arc::clone(&ctx),
            stop: Arc::new(StopSignal::default()),
            threads: Vec::new(),
        };

        let mut poller = RemotePoller::new(Arc::clone(&ctx), Arc::new(executor));
        let stop = Arc::clone(&host.stop);
        let poll_interval = ctx.config.poll_interval;
        host.spawn("bridge-poller", move || {
            loop {
                poller.tick();
                if stop.wait(poll_interval) {
                    break;
                }
            }
        })?;

        let heartbeat_ctx = Arc::clone(&ctx);
        let stop = Arc::clone(&host.stop);
        host.spawn("bridge-heartbeat", move || {
            let ctx = heartbeat_ctx;
            loop {
                if let Err(e) = ctx.store.write_heartbeat() {
                    tracing::warn!(err = %e, "failed to write heartbeat");
                }
                let snapshot = ctx.snapshot(&DiagnosticsQuery::default());
                if let Err(e) = ctx.store.persist_snapshot(&snapshot) {
                    tracing::debug!(err = %e, "failed to persist diagnostics");
                }
                if stop.wait(ctx.config.heartbeat_interval) {
                    break;
                }
            }
        })?;

        Ok(host)
    }

    fn spawn(&mut self, name: &str, body: impl FnOnce() + Send + 'static) -> Result<(), SpoolError> {
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(body)
            .map_err(|e| SpoolError::io("start host thread for", self.ctx.store.dir(), e))?;
        self.threads.push(handle);
        Ok(())
    }

    pub fn store(&self) -> &SpoolStore {
        &self.ctx.store
    }

    pub fn tracker(&self) -> &LifecycleTracker {
        &self.ctx.tracker
    }

    pub fn diagnostics(&self, query: &DiagnosticsQuery) -> DiagnosticsSnapshot {
        self.ctx.snapshot(query)
    }

    /// Stops both threads, removes the heartbeat and persists a final snapshot. Workers still
    /// executing are not waited for.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        self.stop.raise();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                tracing::error!("bridge host thread panicked");
            }
        }
        self.ctx.store.remove_heartbeat();
        let snapshot = self.ctx.snapshot(&DiagnosticsQuery::default());
        if let Err(e) = self.ctx.store.persist_snapshot(&snapshot) {
            tracing::debug!(err = %e, "failed to persist final diagnostics");
        }
        tracing::info!(dir = %self.ctx.store.dir().display(), "bridge host stopped");
    }
}

impl Drop for RemoteHost {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::MethodRouter;

    fn context(dir: &std::path::Path) -> Arc<RemoteContext> {
        let mut config = BridgeConfig::with_spool_dir(dir);
        config.max_processing_time = Duration::from_millis(40);
        config.processing_floor = Duration::ZERO;
        config.processing_ceiling = Duration::from_millis(40);
        Arc::new(RemoteContext::new(config))
    }

    fn router() -> MethodRouter {
        MethodRouter::new()
            .route("echo", |args| Ok(args.clone()))
            .route("slow", |_| {
                thread::sleep(Duration::from_millis(200));
                Ok(json!("late"))
            })
            .route("boom", |_| panic!("capture file truncated"))
    }

    fn submit(ctx: &RemoteContext, slot: Slot, method: &str, args: Value) -> Request {
        let request = Request::new(method, args, Duration::from_secs(1));
        ctx.store.publish(slot, &request).unwrap();
        request
    }

    /// Ticks until a response for `slot` shows up.
    fn run_until_response(poller: &mut RemotePoller, slot: Slot) -> Response {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            poller.tick();
            if let Some(resp) = poller.ctx.store.take_response(slot).unwrap() {
                return resp;
            }
            assert!(Instant::now() < deadline, "no response");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn echo_goes_through_every_state_back_to_idle() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let mut poller = RemotePoller::new(Arc::clone(&ctx), Arc::new(router()));
        assert_eq!(poller.state.name(), "idle");

        let req = submit(&ctx, Slot::Call, "echo", json!({"x": [1, 2]}));
        let resp = run_until_response(&mut poller, Slot::Call);
        assert_eq!(resp.id, req.id);
        assert_eq!(resp.outcome, Outcome::Result(json!({"x": [1, 2]})));
        assert_eq!(poller.state.name(), "idle");

        let c = ctx.tracker.counters();
        assert_eq!((c.submitted, c.completed), (1, 1));
        assert!(!ctx.tracker.is_active());
    }

    #[test]
    fn processing_timeout_answers_and_late_result_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let mut poller = RemotePoller::new(Arc::clone(&ctx), Arc::new(router()));

        submit(&ctx, Slot::Call, "slow", Value::Null);
        poller.tick();
        assert_eq!(poller.state.name(), "executing");
        assert!(ctx.tracker.is_active());

        let resp = run_until_response(&mut poller, Slot::Call);
        match resp.outcome {
            Outcome::Error(e) => assert_eq!(e.code, codes::PROCESSING_TIMEOUT),
            other => panic!("expected timeout error, got {other:?}"),
        }
        assert_eq!(ctx.tracker.counters().timed_out, 1);
        assert!(!ctx.tracker.is_active());

        thread::sleep(Duration::from_millis(300));
        assert_eq!(ctx.tracker.counters().stale_responses, 1);
    }

    #[test]
    fn processing_deadline_follows_request_hint() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let config = BridgeConfig {
            max_processing_time: Duration::from_secs(5),
            processing_ceiling: Duration::from_secs(5),
            ..ctx.config.clone()
        };
        let ctx = Arc::new(RemoteContext::new(config));
        let mut poller = RemotePoller::new(Arc::clone(&ctx), Arc::new(router()));

        // A short hint cuts the handler off long before the fallback budget.
        let hinted = Request::new("slow", Value::Null, Duration::from_millis(60));
        ctx.store.publish(Slot::Call, &hinted).unwrap();
        let resp = run_until_response(&mut poller, Slot::Call);
        assert_eq!(resp.id, hinted.id);
        assert!(matches!(resp.outcome, Outcome::Error(ref e) if e.is_processing_timeout()));

        // Without a hint the fallback budget applies and the handler finishes.
        let unhinted = Request::new("slow", Value::Null, Duration::ZERO);
        ctx.store.publish(Slot::Call, &unhinted).unwrap();
        let resp = run_until_response(&mut poller, Slot::Call);
        assert_eq!(resp.id, unhinted.id);
        assert_eq!(resp.outcome, Outcome::Result(json!("late")));
    }

    #[test]
    fn panics_and_unknown_methods_become_error_responses() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let mut poller = RemotePoller::new(Arc::clone(&ctx), Arc::new(router()));

        submit(&ctx, Slot::Call, "boom", Value::Null);
        let resp = run_until_response(&mut poller, Slot::Call);
        match resp.outcome {
            Outcome::Error(e) => {
                assert_eq!(e.code, codes::INTERNAL);
                assert!(e.message.contains("capture file truncated"));
            }
            other => panic!("expected error, got {other:?}"),
        }

        submit(&ctx, Slot::Call, "get_mesh_data", Value::Null);
        let resp = run_until_response(&mut poller, Slot::Call);
        assert!(matches!(resp.outcome, Outcome::Error(ref e) if e.code == codes::METHOD_NOT_FOUND));
        assert_eq!(ctx.tracker.counters().failed, 2);
    }

    #[test]
    fn diagnostics_slot_is_served_while_executing() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let config = BridgeConfig {
            max_processing_time: Duration::from_secs(5),
            processing_ceiling: Duration::from_secs(5),
            ..ctx.config.clone()
        };
        let ctx = Arc::new(RemoteContext::new(config));
        let mut poller = RemotePoller::new(Arc::clone(&ctx), Arc::new(router()));

        let slow = submit(&ctx, Slot::Call, "slow", Value::Null);
        poller.tick();
        submit(&ctx, Slot::Diagnostics, DIAGNOSTICS_METHOD, json!({}));
        poller.tick();
        assert_eq!(poller.state.name(), "executing");

        let resp = ctx.store.take_response(Slot::Diagnostics).unwrap().unwrap();
        let Outcome::Result(value) = resp.outcome else {
            panic!("diagnostics failed");
        };
        let snapshot: DiagnosticsSnapshot = serde_json::from_value(value).unwrap();
        assert_eq!(snapshot.role, Role::Remote);
        assert!(snapshot.request_active);
        assert_eq!(snapshot.active_request.unwrap().id, slow.id);
    }

    #[test]
    fn host_writes_heartbeat_and_cleans_up_on_stop() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("request.json"), b"{\"left\":\"over\"}").unwrap();
        let mut config = BridgeConfig::with_spool_dir(dir.path());
        config.heartbeat_interval = Duration::from_millis(20);
        let host = RemoteHost::start(config, router()).unwrap();
        assert!(!host.store().has_pending_request(Slot::Call));
        assert!(host.store().heartbeat_age().is_some());

        thread::sleep(Duration::from_millis(60));
        assert!(host.store().snapshot_path().exists());
        let store = host.store().clone();
        host.stop();
        assert_eq!(store.heartbeat_age(), None);
    }
}
