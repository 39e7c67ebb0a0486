use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use crate::{
    RequestId, Response, SpoolError,
    protocol::deadline_after,
    spool::{PendingRequest, SpoolStore},
};

/// Lets another thread abandon an in-progress wait.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AwaitOutcome {
    Matched(Response),
    TimedOut { waited: Duration },
    Cancelled,
    /// The observer asked to stop waiting, e.g. because the remote side stalled.
    Aborted(String),
}

/// Receives the conditions a wait absorbs instead of returning.
pub trait CorrelationObserver {
    /// A response for some other request was consumed and discarded.
    fn stale_response(&self, expected: &RequestId, response: &Response);

    fn unreadable_response(&self, error: &SpoolError);

    /// Checked on every poll; `Some` ends the wait with [`AwaitOutcome::Aborted`].
    fn abort_reason(&self) -> Option<String> {
        None
    }
}

impl SpoolStore {
    /// Waits for the response correlated with `pending`.
    ///
    /// Responses carrying any other id are consumed and handed to the observer, never returned.
    pub fn await_response(
        &self,
        pending: &PendingRequest,
        timeout: Duration,
        poll: Duration,
        cancel: Option<&CancelHandle>,
        observer: &dyn CorrelationObserver,
    ) -> Result<AwaitOutcome, SpoolError> {
        let expected = &pending.request.id;
        let deadline = deadline_after(pending.published, timeout);
        loop {
            match self.take_response(pending.slot) {
                Ok(Some(response)) if &response.id == expected => {
                    return Ok(AwaitOutcome::Matched(response));
                }
                Ok(Some(response)) => {
                    tracing::warn!(
                        expected = %expected,
                        got = %response.id,
                        "discarding stale response"
                    );
                    observer.stale_response(expected, &response);
                    continue;
                }
                Ok(None) => {}
                Err(err @ SpoolError::Corrupt { .. }) => {
                    tracing::warn!(err = %err, "discarding unreadable response");
                    observer.unreadable_response(&err);
                    continue;
                }
                Err(err) => return Err(err),
            }

            if cancel.is_some_and(CancelHandle::is_cancelled) {
                return Ok(AwaitOutcome::Cancelled);
            }
            if let Some(reason) = observer.abort_reason() {
                return Ok(AwaitOutcome::Aborted(reason));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(AwaitOutcome::TimedOut {
                    waited: now.duration_since(pending.published),
                });
            }
            std::thread::sleep(poll.min(deadline - now));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, time::Duration};

    use serde_json::json;

    use super::*;
    use crate::{Request, spool::Slot};

    #[derive(Default)]
    struct Seen {
        stale: RefCell<Vec<RequestId>>,
        unreadable: RefCell<usize>,
        abort: Option<String>,
    }

    impl CorrelationObserver for Seen {
        fn stale_response(&self, _expected: &RequestId, response: &Response) {
            self.stale.borrow_mut().push(response.id.clone());
        }

        fn unreadable_response(&self, _error: &SpoolError) {
            *self.unreadable.borrow_mut() += 1;
        }

        fn abort_reason(&self) -> Option<String> {
            self.abort.clone()
        }
    }

    fn setup() -> (tempfile::TempDir, SpoolStore, PendingRequest) {
        let dir = tempfile::tempdir().unwrap();
        let store = SpoolStore::new(dir.path());
        let req = Request::new("ping", json!({}), Duration::from_secs(1));
        let pending = store.publish(Slot::Call, &req).unwrap();
        (dir, store, pending)
    }

    const POLL: Duration = Duration::from_millis(5);

    #[test]
    fn mismatched_response_is_never_returned() {
        let (_dir, store, pending) = setup();
        let other = RequestId::new();
        store
            .publish_response(Slot::Call, &Response::ok(other.clone(), json!("old"), Duration::ZERO))
            .unwrap();

        let seen = Seen::default();
        let outcome = store
            .await_response(&pending, Duration::from_millis(40), POLL, None, &seen)
            .unwrap();
        assert!(matches!(outcome, AwaitOutcome::TimedOut { .. }));
        assert_eq!(*seen.stale.borrow(), vec![other]);
    }

    #[test]
    fn matching_response_is_returned() {
        let (_dir, store, pending) = setup();
        let id = pending.request.id.clone();
        let writer = store.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            writer
                .publish_response(Slot::Call, &Response::ok(id, json!({"pong": true}), Duration::ZERO))
                .unwrap();
        });
        let seen = Seen::default();
        let outcome = store
            .await_response(&pending, Duration::from_secs(2), POLL, None, &seen)
            .unwrap();
        handle.join().unwrap();
        match outcome {
            AwaitOutcome::Matched(resp) => assert_eq!(resp.id, pending.request.id),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(seen.stale.borrow().is_empty());
    }

    #[test]
    fn cancellation_and_abort_end_the_wait() {
        let (_dir, store, pending) = setup();
        let cancel = CancelHandle::new();
        cancel.cancel();
        let outcome = store
            .await_response(&pending, Duration::from_secs(5), POLL, Some(&cancel), &Seen::default())
            .unwrap();
        assert_eq!(outcome, AwaitOutcome::Cancelled);

        let aborting = Seen {
            abort: Some("remote stalled".into()),
            ..Seen::default()
        };
        let outcome = store
            .await_response(&pending, Duration::from_secs(5), POLL, None, &aborting)
            .unwrap();
        assert_eq!(outcome, AwaitOutcome::Aborted("remote stalled".into()));
    }

    #[test]
    fn unreadable_response_is_reported_and_skipped() {
        let (_dir, store, pending) = setup();
        std::fs::write(store.response_path(Slot::Call), b"{\"id\":").unwrap();
        let seen = Seen::default();
        let outcome = store
            .await_response(&pending, Duration::from_millis(30), POLL, None, &seen)
            .unwrap();
        assert!(matches!(outcome, AwaitOutcome::TimedOut { .. }));
        assert_eq!(*seen.unreadable.borrow(), 1);
    }
}
