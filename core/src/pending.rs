//! Anchor for one in-flight asynchronous call.
//!
//! # Design
//! A `PendingCall` outlives the individual transport attempts of a logical
//! call: a retry after re-authentication swaps in a new transport handle via
//! `rebind`, while descriptor, callback and user state stay put.
//!
//! Settlement is a single compare-and-set on `state`. Whichever of
//! `complete` and `cancel` wins the exchange takes the callback and user
//! state out of their slot and invokes the callback once, outside every lock;
//! the loser returns `false` and its result is dropped. Waiters are woken
//! through a `watch` channel after the callback has returned.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, TransportError};

const PENDING: u8 = 0;
const COMPLETED: u8 = 1;
const CANCELLED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionState {
    Pending,
    Completed,
    Cancelled,
}

impl CompletionState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            COMPLETED => CompletionState::Completed,
            CANCELLED => CompletionState::Cancelled,
            _ => CompletionState::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The application asked for cancellation.
    Requested,
    /// `wait` ran out of time.
    TimedOut,
}

/// What the callback receives.
#[derive(Debug)]
pub enum Outcome<R> {
    Completed(R),
    Cancelled(CancelReason),
}

pub type Callback<S, R> = Box<dyn FnOnce(Option<S>, Outcome<R>) + Send>;

struct Delivery<S, R> {
    callback: Option<Callback<S, R>>,
    user_state: Option<S>,
}

pub struct PendingCall<D, H, S, R> {
    id: Uuid,
    descriptor: D,
    handle: Mutex<Option<H>>,
    delivery: Mutex<Option<Delivery<S, R>>>,
    state: AtomicU8,
    settled: watch::Sender<CompletionState>,
}

impl<D, H, S, R> PendingCall<D, H, S, R> {
    /// Anchor a new call. `descriptor` and `handle` are required; a call
    /// without callback or user state is legal.
    pub fn create(
        descriptor: Option<D>,
        handle: Option<H>,
        callback: Option<Callback<S, R>>,
        user_state: Option<S>,
    ) -> Result<Arc<Self>> {
        let descriptor = descriptor.ok_or(TransportError::InvalidArgument("request descriptor"))?;
        let handle = handle.ok_or(TransportError::InvalidArgument("transport handle"))?;
        let (settled, _) = watch::channel(CompletionState::Pending);
        let call = Arc::new(Self {
            id: Uuid::new_v4(),
            descriptor,
            handle: Mutex::new(Some(handle)),
            delivery: Mutex::new(Some(Delivery { callback, user_state })),
            state: AtomicU8::new(PENDING),
            settled,
        });
        debug!(call_id = %call.id, "pending call created");
        Ok(call)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn descriptor(&self) -> &D {
        &self.descriptor
    }

    pub fn state(&self) -> CompletionState {
        CompletionState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn is_settled(&self) -> bool {
        self.state() != CompletionState::Pending
    }

    /// Run `f` against the current transport handle, if the call still holds one.
    pub fn with_handle<T>(&self, f: impl FnOnce(&H) -> T) -> Option<T> {
        let guard = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        guard.as_ref().map(f)
    }

    /// Swap in the transport handle of a retry. Returns the previous handle.
    pub fn rebind(&self, handle: H) -> Result<H> {
        let mut guard = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_settled() {
            return Err(TransportError::CallSettled);
        }
        let previous = guard.replace(handle).ok_or(TransportError::CallSettled)?;
        debug!(call_id = %self.id, "transport handle rebound");
        Ok(previous)
    }

    /// Pending → Completed. Returns `false` if the call was already settled.
    pub fn complete(&self, result: R) -> bool {
        self.settle(COMPLETED, Outcome::Completed(result))
    }

    /// Pending → Cancelled. Returns `false` if the call was already settled.
    pub fn cancel(&self) -> bool {
        self.cancel_with(CancelReason::Requested)
    }

    pub fn cancel_with(&self, reason: CancelReason) -> bool {
        self.settle(CANCELLED, Outcome::Cancelled(reason))
    }

    fn settle(&self, target: u8, outcome: Outcome<R>) -> bool {
        if self
            .state
            .compare_exchange(PENDING, target, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(call_id = %self.id, "call already settled, ignoring");
            return false;
        }
        let state = CompletionState::from_raw(target);
        let _notify = NotifyOnDrop {
            sender: &self.settled,
            state,
        };

        let released = self.handle.lock().unwrap_or_else(PoisonError::into_inner).take();
        drop(released);

        let delivery = self.delivery.lock().unwrap_or_else(PoisonError::into_inner).take();
        debug!(call_id = %self.id, ?state, "call settled");
        if let Some(Delivery {
            callback: Some(callback),
            user_state,
        }) = delivery
        {
            callback(user_state, outcome);
        }
        true
    }

    /// Suspend until the call settles.
    ///
    /// With a timeout, an expired wait cancels the call with
    /// `CancelReason::TimedOut`, so the callback still fires. Returns the
    /// final state, which may be `Completed` if completion won that race.
    pub async fn wait(&self, timeout: Option<Duration>) -> CompletionState {
        let mut rx = self.settled.subscribe();
        match timeout {
            None => {
                let _ = rx.wait_for(|s| *s != CompletionState::Pending).await;
            }
            Some(limit) => {
                let timed_out = tokio::time::timeout(
                    limit,
                    rx.wait_for(|s| *s != CompletionState::Pending),
                )
                .await
                .is_err();
                if timed_out && self.cancel_with(CancelReason::TimedOut) {
                    warn!(call_id = %self.id, ?limit, "call timed out");
                }
            }
        }
        self.state()
    }
}

impl<D: std::fmt::Debug, H, S, R> std::fmt::Debug for PendingCall<D, H, S, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("id", &self.id)
            .field("descriptor", &self.descriptor)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Wakes waiters even if the callback panics.
struct NotifyOnDrop<'a> {
    sender: &'a watch::Sender<CompletionState>,
    state: CompletionState,
}

impl Drop for NotifyOnDrop<'_> {
    fn drop(&mut self) {
        self.sender.send_replace(self.state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;

    type Call = PendingCall<&'static str, u32, String, String>;

    fn recording_callback(
        log: Arc<Mutex<Vec<(Option<String>, String)>>>,
    ) -> Callback<String, String> {
        Box::new(move |state: Option<String>, outcome: Outcome<String>| {
            let text = match outcome {
                Outcome::Completed(r) => format!("completed:{r}"),
                Outcome::Cancelled(reason) => format!("cancelled:{reason:?}"),
            };
            log.lock().unwrap().push((state, text));
        })
    }

    #[test]
    fn create_requires_descriptor_and_handle() {
        let err = Call::create(None, Some(1), None, None).unwrap_err();
        assert!(matches!(err, TransportError::InvalidArgument("request descriptor")));
        let err = Call::create(Some("GetItem"), None, None, None).unwrap_err();
        assert!(matches!(err, TransportError::InvalidArgument("transport handle")));
        let call = Call::create(Some("GetItem"), Some(1), None, None).unwrap();
        assert_eq!(call.state(), CompletionState::Pending);
        assert!(call.complete("ok".to_string()));
    }

    #[test]
    fn complete_fires_callback_once_with_user_state() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let call = Call::create(
            Some("GetItem"),
            Some(7),
            Some(recording_callback(Arc::clone(&log))),
            Some("ctx".to_string()),
        )
        .unwrap();

        assert!(call.complete("200".to_string()));
        assert!(!call.complete("again".to_string()));
        assert!(!call.cancel());

        let log = log.lock().unwrap();
        assert_eq!(*log, vec![(Some("ctx".to_string()), "completed:200".to_string())]);
        assert_eq!(call.state(), CompletionState::Completed);
    }

    #[test]
    fn cancel_after_complete_is_noop_and_vice_versa() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let callback = recording_callback(Arc::clone(&log));
        let call = Call::create(Some("Find"), Some(1), Some(callback), None).unwrap();
        assert!(call.cancel());
        assert!(!call.complete("late".to_string()));
        assert_eq!(call.state(), CompletionState::Cancelled);
        assert_eq!(log.lock().unwrap()[0].1, "cancelled:Requested");
    }

    #[test]
    fn rebind_only_while_pending() {
        let call = Call::create(Some("Find"), Some(1), None, None).unwrap();
        assert_eq!(call.rebind(2).unwrap(), 1);
        assert_eq!(call.with_handle(|h| *h), Some(2));
        call.complete("done".to_string());
        assert!(matches!(call.rebind(3), Err(TransportError::CallSettled)));
        assert_eq!(call.with_handle(|h| *h), None);
    }

    #[test]
    fn settlement_releases_handle() {
        let handle = Arc::new(());
        let call: Arc<PendingCall<&str, Arc<()>, (), ()>> =
            PendingCall::create(Some("Find"), Some(Arc::clone(&handle)), None, None).unwrap();
        assert_eq!(Arc::strong_count(&handle), 2);
        call.cancel();
        assert_eq!(Arc::strong_count(&handle), 1);
    }

    #[test]
    fn racing_complete_and_cancel_settle_exactly_once() {
        for _ in 0..200 {
            let fired = Arc::new(AtomicUsize::new(0));
            let winner = Arc::new(Mutex::new(None));
            let (fired_cb, winner_cb) = (Arc::clone(&fired), Arc::clone(&winner));
            let call = Call::create(
                Some("Find"),
                Some(1),
                Some(Box::new(move |_: Option<String>, outcome: Outcome<String>| {
                    fired_cb.fetch_add(1, Ordering::SeqCst);
                    *winner_cb.lock().unwrap() = Some(matches!(outcome, Outcome::Completed(_)));
                })),
                None,
            )
            .unwrap();

            let barrier = Barrier::new(2);
            let (completed, cancelled) = std::thread::scope(|s| {
                let a = s.spawn(|| {
                    barrier.wait();
                    call.complete("r".to_string())
                });
                let b = s.spawn(|| {
                    barrier.wait();
                    call.cancel()
                });
                (a.join().unwrap(), b.join().unwrap())
            });

            assert!(completed ^ cancelled);
            assert_eq!(fired.load(Ordering::SeqCst), 1);
            assert_eq!(*winner.lock().unwrap(), Some(completed));
            let expected = if completed {
                CompletionState::Completed
            } else {
                CompletionState::Cancelled
            };
            assert_eq!(call.state(), expected);
        }
    }

    #[tokio::test]
    async fn wait_times_out_into_cancellation() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let call = Call::create(
            Some("Find"),
            Some(1),
            Some(recording_callback(Arc::clone(&log))),
            Some("ctx".to_string()),
        )
        .unwrap();

        let state = call.wait(Some(Duration::from_millis(20))).await;
        assert_eq!(state, CompletionState::Cancelled);
        assert_eq!(
            *log.lock().unwrap(),
            vec![(Some("ctx".to_string()), "cancelled:TimedOut".to_string())]
        );
    }

    #[tokio::test]
    async fn wait_returns_when_completed_elsewhere() {
        let call = Call::create(Some("Find"), Some(1), None, None).unwrap();
        let remote = Arc::clone(&call);
        let worker = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            remote.complete("ok".to_string())
        });
        assert_eq!(call.wait(Some(Duration::from_secs(5))).await, CompletionState::Completed);
        assert!(worker.await.unwrap());
        // Already settled: returns immediately.
        assert_eq!(call.wait(None).await, CompletionState::Completed);
    }

    #[tokio::test]
    async fn cancel_wakes_waiter() {
        let call = Call::create(Some("Find"), Some(1), None, None).unwrap();
        let remote = Arc::clone(&call);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            remote.cancel();
        });
        assert_eq!(call.wait(None).await, CompletionState::Cancelled);
    }
}
