//! Single-slot event bus between HTTP callers and the polling worker.
//!
//! Two zero-capacity queues connect the two sides: the dispatch queue carries
//! an [`Event`] from a submitter to the worker's long-poll, the return queue
//! carries the matching [`Outcome`] back. A send only completes once the other
//! side has taken the value, and at most one event is in flight at a time.
//!
//! Every blocking operation takes a [`CancellationToken`] standing in for the
//! request that issued it. Dropping an operation's future is equivalent to
//! cancelling it.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{Mutex, OwnedMutexGuard, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// One invocation payload plus its correlation id.
#[derive(Debug, Clone)]
pub struct Event {
    id: Uuid,
    payload: Bytes,
}

impl Event {
    /// Create an event with a fresh random correlation id.
    pub fn new(payload: Bytes) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
        }
    }

    pub const fn id(&self) -> Uuid {
        self.id
    }

    pub const fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}

/// The worker's answer to an [`Event`].
#[derive(Debug, Clone)]
pub struct Outcome {
    id: Uuid,
    payload: Bytes,
    ok: bool,
}

impl Outcome {
    pub const fn new(id: Uuid, payload: Bytes, ok: bool) -> Self {
        Self { id, payload, ok }
    }

    pub const fn id(&self) -> Uuid {
        self.id
    }

    pub const fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// `false` when the worker reported the invocation as failed.
    pub const fn is_ok(&self) -> bool {
        self.ok
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}

/// What happened to a posted result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the submitter (or to the drain of a departed submitter).
    Delivered,
    /// No event with this id was in flight; the result was dropped.
    Discarded,
}

/// Errors from bus operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("Bus operation cancelled")]
    Cancelled,

    #[error("Event bus closed")]
    Closed,
}

/// Rendezvous bus shared by the HTTP handlers. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    dispatch_tx: flume::Sender<Event>,
    dispatch_rx: flume::Receiver<Event>,
    return_tx: flume::Sender<Outcome>,
    return_rx: flume::Receiver<Outcome>,
    /// Held by a submitter for its whole round trip.
    flight: Arc<Mutex<()>>,
    /// Correlation id of the event currently in flight.
    in_flight: watch::Sender<Option<Uuid>>,
    /// Number of `submit` calls that have not returned yet.
    active: watch::Sender<usize>,
    closed: CancellationToken,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (dispatch_tx, dispatch_rx) = flume::bounded(0);
        let (return_tx, return_rx) = flume::bounded(0);
        let (in_flight, _) = watch::channel(None);
        let (active, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                dispatch_tx,
                dispatch_rx,
                return_tx,
                return_rx,
                flight: Arc::new(Mutex::new(())),
                in_flight,
                active,
                closed: CancellationToken::new(),
            }),
        }
    }

    /// Submit a payload and wait for the worker's outcome.
    ///
    /// Waits first for any earlier round trip to finish, then for a worker to
    /// take the event, then for its outcome. If cancelled after the worker
    /// took the event, the outcome is still awaited in the background and
    /// discarded so that it can never reach a later submitter.
    pub async fn submit(
        &self,
        payload: Bytes,
        cancel: &CancellationToken,
    ) -> Result<Outcome, BusError> {
        let inner = &self.inner;
        let _active = ActiveSubmit::enter(&inner.active);
        let permit = tokio::select! {
            () = cancel.cancelled() => return Err(BusError::Cancelled),
            () = inner.closed.cancelled() => return Err(BusError::Closed),
            permit = Arc::clone(&inner.flight).lock_owned() => permit,
        };

        let event = Event::new(payload);
        let id = event.id;
        inner.in_flight.send_replace(Some(id));
        let mut flight = Flight {
            bus: self.clone(),
            id,
            permit: Some(permit),
            dispatched: false,
        };
        debug!(event_id = %id, bytes = event.payload.len(), "Event submitted");

        // A completed handoff must win over a simultaneous cancellation,
        // otherwise the worker holds an event nobody accounts for.
        tokio::select! {
            biased;
            sent = inner.dispatch_tx.send_async(event) => {
                sent.map_err(|_| BusError::Closed)?;
            }
            () = cancel.cancelled() => return Err(BusError::Cancelled),
            () = inner.closed.cancelled() => return Err(BusError::Closed),
        }
        flight.dispatched = true;
        debug!(event_id = %id, "Event handed to worker");

        let outcome = tokio::select! {
            biased;
            outcome = self.recv_outcome(id) => outcome?,
            () = cancel.cancelled() => return Err(BusError::Cancelled),
            () = inner.closed.cancelled() => return Err(BusError::Closed),
        };
        flight.complete();
        Ok(outcome)
    }

    /// Wait for the next event. A cancelled wait takes nothing off the bus.
    pub async fn await_next(&self, cancel: &CancellationToken) -> Result<Event, BusError> {
        tokio::select! {
            event = self.inner.dispatch_rx.recv_async() => event.map_err(|_| BusError::Closed),
            () = cancel.cancelled() => Err(BusError::Cancelled),
            () = self.inner.closed.cancelled() => Err(BusError::Closed),
        }
    }

    /// Hand a worker's outcome back to the waiting submitter.
    ///
    /// Results for an id that is not in flight are logged and discarded
    /// without blocking.
    pub async fn post_result(
        &self,
        id: Uuid,
        payload: Bytes,
        ok: bool,
        cancel: &CancellationToken,
    ) -> Result<Delivery, BusError> {
        if self.in_flight() != Some(id) {
            warn!(event_id = %id, ok, "Result posted for an event that is not in flight");
            return Ok(Delivery::Discarded);
        }

        // A second post for the same id has no submitter left to receive
        // it once the first one completes the round trip.
        let mut watcher = self.inner.in_flight.subscribe();
        let superseded = async move {
            let _ = watcher.wait_for(|current| *current != Some(id)).await;
        };

        let outcome = Outcome::new(id, payload, ok);
        tokio::select! {
            biased;
            sent = self.inner.return_tx.send_async(outcome) => {
                sent.map(|()| Delivery::Delivered).map_err(|_| BusError::Closed)
            }
            () = superseded => {
                warn!(event_id = %id, ok, "Result posted after the event completed");
                Ok(Delivery::Discarded)
            }
            () = cancel.cancelled() => Err(BusError::Cancelled),
            () = self.inner.closed.cancelled() => Err(BusError::Closed),
        }
    }

    /// Resolve once no submission is waiting and no event is in flight,
    /// including results still being drained for departed submitters.
    pub async fn wait_idle(&self) {
        let mut active = self.inner.active.subscribe();
        let mut in_flight = self.inner.in_flight.subscribe();
        loop {
            if *active.borrow_and_update() == 0 && in_flight.borrow_and_update().is_none() {
                return;
            }
            tokio::select! {
                _ = active.changed() => {}
                _ = in_flight.changed() => {}
            }
        }
    }

    /// Correlation id of the event currently in flight, if any.
    pub fn in_flight(&self) -> Option<Uuid> {
        *self.inner.in_flight.borrow()
    }

    /// Fail all pending and future operations with [`BusError::Closed`].
    pub fn close(&self) {
        self.inner.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    async fn recv_outcome(&self, id: Uuid) -> Result<Outcome, BusError> {
        loop {
            let outcome = self
                .inner
                .return_rx
                .recv_async()
                .await
                .map_err(|_| BusError::Closed)?;
            if outcome.id == id {
                return Ok(outcome);
            }
            warn!(
                expected = %id,
                received = %outcome.id,
                "Dropping stale result"
            );
        }
    }

    /// Wait out the result of an event whose submitter went away.
    async fn drain(self, id: Uuid, permit: OwnedMutexGuard<()>) {
        tokio::select! {
            outcome = self.recv_outcome(id) => {
                if let Ok(outcome) = outcome {
                    debug!(event_id = %id, ok = outcome.ok, "Discarded result of abandoned event");
                }
            }
            () = self.inner.closed.cancelled() => {}
        }
        self.inner.in_flight.send_replace(None);
        drop(permit);
    }
}

/// Counts a `submit` call from entry until it returns.
struct ActiveSubmit<'a>(&'a watch::Sender<usize>);

impl<'a> ActiveSubmit<'a> {
    fn enter(active: &'a watch::Sender<usize>) -> Self {
        active.send_modify(|n| *n += 1);
        Self(active)
    }
}

impl Drop for ActiveSubmit<'_> {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// One submitter's claim on the bus. Releases the slot on every exit path.
struct Flight {
    bus: EventBus,
    id: Uuid,
    permit: Option<OwnedMutexGuard<()>>,
    dispatched: bool,
}

impl Flight {
    fn complete(&mut self) {
        if let Some(permit) = self.permit.take() {
            self.bus.inner.in_flight.send_replace(None);
            drop(permit);
        }
    }
}

impl Drop for Flight {
    fn drop(&mut self) {
        let Some(permit) = self.permit.take() else {
            return;
        };
        if !self.dispatched {
            self.bus.inner.in_flight.send_replace(None);
            drop(permit);
            return;
        }

        warn!(event_id = %self.id, "Submitter left before the result arrived, draining");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(self.bus.clone().drain(self.id, permit));
            }
            Err(_) => {
                self.bus.inner.in_flight.send_replace(None);
                drop(permit);
            }
        }
    }
}
