//! Bounded, FIFO admission of requests to the upstream.
//!
//! [`AdmissionController::acquire`] hands out at most `limit` [`Permit`]s at
//! a time. Callers beyond the limit wait in arrival order; dropping a permit
//! passes its slot straight to the longest waiter.
//!
//! The controller reports its running/waiting counts to the [`Recorder`]
//! while holding the same lock that guards slot ownership, so the gauges
//! never drift from the true state.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::recorder::{FinalizedRequest, Recorder, RequestStatus};
use crate::{HuginnError, Result};

/// Concurrency limiter shared by every request of one proxy instance.
///
/// Cloning is cheap and yields a handle to the same slot pool.
#[derive(Clone)]
pub struct AdmissionController {
    inner: Arc<Inner>,
}

struct Inner {
    limit: usize,
    recorder: Arc<Recorder>,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    running: usize,
    queue: VecDeque<Waiter>,
    next_id: u64,
}

struct Waiter {
    id: u64,
    enqueued: Instant,
    // Carries the instant the slot was granted.
    tx: oneshot::Sender<Instant>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Give a freed slot to the longest waiter, if any. Caller holds the lock
    /// and has already decremented `running`.
    fn hand_off(&self, state: &mut State) {
        while let Some(waiter) = state.queue.pop_front() {
            let now = Instant::now();
            // A waiter whose guard already ran is no longer queued, so a
            // failed send only means the receiver raced its own drop.
            if waiter.tx.send(now).is_err() {
                continue;
            }
            state.running += 1;
            let waited = now.saturating_duration_since(waiter.enqueued);
            self.recorder.on_request_admitted(waited);
            debug!(waited_ms = waited.as_millis() as u64, "request admitted after queueing");
            return;
        }
    }
}

impl AdmissionController {
    /// Create a controller allowing `limit` concurrent requests.
    ///
    /// A limit of zero could never admit anything and is rejected.
    pub fn new(recorder: Arc<Recorder>, limit: usize) -> Result<Self> {
        if limit == 0 {
            return Err(HuginnError::Configuration(
                "max_concurrent_requests must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            inner: Arc::new(Inner {
                limit,
                recorder,
                state: Mutex::new(State::default()),
            }),
        })
    }

    pub fn limit(&self) -> usize {
        self.inner.limit
    }

    /// Requests currently holding a slot.
    pub fn running(&self) -> usize {
        self.inner.lock().running
    }

    /// Requests suspended waiting for a slot.
    pub fn waiting(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn recorder(&self) -> &Arc<Recorder> {
        &self.inner.recorder
    }

    /// Acquire a slot, waiting in FIFO order if none is free.
    ///
    /// With `queue_timeout` set, gives up after that long and returns
    /// [`HuginnError::AdmissionTimeout`]; the request is then counted as
    /// `rejected`. Dropping the returned future while it waits removes the
    /// caller from the queue and counts it as `canceled`.
    pub async fn acquire(&self, queue_timeout: Option<Duration>) -> Result<Permit> {
        let arrival = Instant::now();
        let mut pending = {
            let mut state = self.inner.lock();
            if state.running < self.inner.limit && state.queue.is_empty() {
                state.running += 1;
                self.inner.recorder.on_request_started();
                return Ok(Permit::new(Arc::clone(&self.inner), arrival, arrival));
            }
            let id = state.next_id;
            state.next_id += 1;
            let (tx, rx) = oneshot::channel();
            state.queue.push_back(Waiter {
                id,
                enqueued: arrival,
                tx,
            });
            self.inner.recorder.on_request_queued();
            PendingAdmission {
                inner: Arc::clone(&self.inner),
                id,
                arrival,
                rx,
                armed: true,
            }
        };

        // A waiter leaves the queue only through a grant, which sends before
        // it drops the sender, or through `withdraw`, which returns above.
        // `pending` keeps the controller alive, so the receive cannot fail.
        let received = match queue_timeout {
            None => (&mut pending.rx).await.ok(),
            Some(limit) => match tokio::time::timeout(limit, &mut pending.rx).await {
                Ok(received) => received.ok(),
                Err(_) => {
                    if pending.withdraw(RequestStatus::Rejected) {
                        warn!(waited_ms = limit.as_millis() as u64, "queue timeout");
                        return Err(HuginnError::AdmissionTimeout { waited: limit });
                    }
                    // The slot was granted as the timer fired.
                    pending.rx.try_recv().ok()
                }
            },
        };
        let admitted_at = received.unwrap_or_else(Instant::now);

        pending.armed = false;
        Ok(Permit::new(Arc::clone(&self.inner), arrival, admitted_at))
    }
}

impl fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("AdmissionController")
            .field("limit", &self.inner.limit)
            .field("running", &state.running)
            .field("waiting", &state.queue.len())
            .finish()
    }
}

/// A caller's place in the wait queue. Dropping it while still queued
/// withdraws the caller as `canceled`.
struct PendingAdmission {
    inner: Arc<Inner>,
    id: u64,
    arrival: Instant,
    rx: oneshot::Receiver<Instant>,
    armed: bool,
}

impl PendingAdmission {
    /// Leave the queue with `status`. Returns false if the slot had already
    /// been granted, in which case nothing is recorded.
    fn withdraw(&mut self, status: RequestStatus) -> bool {
        let mut state = self.inner.lock();
        match state.queue.iter().position(|w| w.id == self.id) {
            Some(index) => {
                state.queue.remove(index);
                self.inner.recorder.on_queue_abandoned(status);
                self.armed = false;
                true
            }
            None => false,
        }
    }
}

impl Drop for PendingAdmission {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if self.withdraw(RequestStatus::Canceled) {
            debug!("request canceled while queued");
            return;
        }
        // Granted but never picked up: finalize the slot as canceled.
        let admitted_at = self.rx.try_recv().unwrap_or_else(|_| Instant::now());
        drop(Permit::new(Arc::clone(&self.inner), self.arrival, admitted_at));
    }
}

/// A held concurrency slot plus the lifecycle record of its request.
///
/// Dropping the permit finalizes the request with the [`Recorder`] exactly
/// once and releases the slot. The status starts as `canceled`, so a permit
/// dropped on an unplanned path (client disconnect, panic, aborted task)
/// still balances the running gauge.
pub struct Permit {
    inner: Arc<Inner>,
    arrival: Instant,
    admitted_at: Instant,
    status: RequestStatus,
    prompt_tokens: u64,
    completion_tokens: u64,
    first_token_seen: bool,
}

impl Permit {
    fn new(inner: Arc<Inner>, arrival: Instant, admitted_at: Instant) -> Self {
        Self {
            inner,
            arrival,
            admitted_at,
            status: RequestStatus::Canceled,
            prompt_tokens: 0,
            completion_tokens: 0,
            first_token_seen: false,
        }
    }

    /// When the request reached the controller.
    pub fn arrival(&self) -> Instant {
        self.arrival
    }

    /// When the slot was granted.
    pub fn admitted_at(&self) -> Instant {
        self.admitted_at
    }

    pub fn queue_duration(&self) -> Duration {
        self.admitted_at.saturating_duration_since(self.arrival)
    }

    pub fn status(&self) -> RequestStatus {
        self.status
    }

    /// Status the request will be finalized with.
    pub fn set_status(&mut self, status: RequestStatus) {
        self.status = status;
    }

    /// Token usage reported by the upstream. Later calls overwrite earlier ones.
    pub fn set_usage(&mut self, prompt_tokens: u64, completion_tokens: u64) {
        self.prompt_tokens = prompt_tokens;
        self.completion_tokens = completion_tokens;
    }

    pub fn usage(&self) -> (u64, u64) {
        (self.prompt_tokens, self.completion_tokens)
    }

    /// Record time-to-first-token. Only the first call observes anything;
    /// returns whether this call did.
    pub fn mark_first_token(&mut self) -> bool {
        if self.first_token_seen {
            return false;
        }
        self.first_token_seen = true;
        self.inner
            .recorder
            .on_first_token(self.admitted_at.elapsed());
        true
    }

    /// Finalize with `status` now.
    pub fn finish(mut self, status: RequestStatus) {
        self.status = status;
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        let now = Instant::now();
        let request = FinalizedRequest {
            status: self.status,
            inference_time: now.saturating_duration_since(self.admitted_at),
            e2e_latency: now.saturating_duration_since(self.arrival),
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
        };
        let mut state = self.inner.lock();
        self.inner.recorder.on_request_finalized(&request);
        state.running = state.running.saturating_sub(1);
        self.inner.hand_off(&mut state);
    }
}

impl fmt::Debug for Permit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Permit")
            .field("status", &self.status)
            .field("queue_duration", &self.queue_duration())
            .field("prompt_tokens", &self.prompt_tokens)
            .field("completion_tokens", &self.completion_tokens)
            .finish()
    }
}
