//! RequestCoalescer (C6): single-flight map keyed by Cache Identity.
//!
//! Mirrors the in-flight bookkeeping the teacher crate's idempotency plugin builds
//! around `tokio::sync::Notify` (`plugins/idempotency.rs`'s `Entry::InFlight`), but
//! generalized to share a *streaming* body across waiters via [`crate::body::Tee`]
//! instead of buffering a response to replay verbatim. The in-flight table itself is
//! a [`BoundedLru`] (§4.9) rather than a bare `DashMap`, so entries age out under the
//! same bound as every other piece of shared state in the engine.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::body::Tee;
use crate::error::ConcurrencyError;
use crate::primitives::BoundedLru;
use crate::store::ArtifactMetadata;
use crate::telemetry::{Event, EventSink};

/// The outcome the owner eventually publishes to every waiter.
#[derive(Clone)]
pub enum Outcome {
    Success(Arc<ArtifactMetadata>),
    Error,
}

struct InFlight {
    tee: Tee,
    notify: Arc<Notify>,
    outcome: Mutex<Option<Outcome>>,
    arrival_time: Instant,
}

/// Handle returned to the request that became the owner of a CI's in-flight work.
pub struct Owned {
    ci: String,
    slot: Arc<InFlight>,
    table: Arc<BoundedLru<String, Arc<InFlight>>>,
    done: bool,
}

impl Owned {
    /// The tee the owner should feed as upstream bytes arrive.
    pub fn tee(&self) -> &Tee {
        &self.slot.tee
    }

    /// Publishes the final outcome to every current and future waiter, and removes
    /// the IFE from the table (§4.6: "owner MUST remove the IFE in a `finally`-style
    /// guarantee"). Must be called exactly once; [`Owned::drop`] enforces it for
    /// panic/early-return paths by publishing an error outcome if it wasn't.
    pub fn complete(mut self, outcome: Outcome) {
        self.publish(outcome);
        self.done = true;
    }

    fn publish(&self, outcome: Outcome) {
        *self.slot.outcome.lock() = Some(outcome);
        self.table.remove(&self.ci);
        self.slot.notify.notify_waiters();
    }
}

impl Drop for Owned {
    fn drop(&mut self) {
        if !self.done {
            // An owner that is dropped without calling `complete` (panic, early
            // return past a `?`) must still release waiters rather than let them
            // block until their bounded wait times out.
            self.publish(Outcome::Error);
        }
    }
}

/// Handle returned to a request that joined someone else's in-flight work.
pub struct Waiting {
    ci: String,
    slot: Arc<InFlight>,
    wait_timeout: Duration,
    sink: Arc<dyn EventSink>,
}

/// What a waiter observed after joining.
pub enum Joined {
    /// The owner finished (successfully or not) before the wait timed out.
    Completed(Outcome),
    /// A body stream tee to consume concurrently with the eventual [`Joined::Completed`]
    /// the caller polls for separately; see [`Waiting::subscribe`].
    TimedOut,
}

impl Waiting {
    /// A body stream identical to what the owner is producing, from this point
    /// forward (§4.6: "duplication to multiple waiters MUST use a stream-tee
    /// primitive").
    pub fn subscribe(&self) -> crate::body::CacheBody {
        self.slot.tee.subscribe()
    }

    /// Waits, bounded by `coalesce.wait_timeout_ms`, for the owner to complete. On
    /// timeout the caller is expected to proceed as an independent owner (§4.6).
    pub async fn join(self) -> Joined {
        if let Some(outcome) = self.slot.outcome.lock().clone() {
            return Joined::Completed(outcome);
        }
        match tokio::time::timeout(self.wait_timeout, self.slot.notify.notified()).await {
            Ok(()) => {
                let outcome = self.slot.outcome.lock().clone();
                match outcome {
                    Some(outcome) => Joined::Completed(outcome),
                    None => Joined::TimedOut,
                }
            }
            Err(_) => {
                let waited_ms = self.slot.arrival_time.elapsed().as_millis() as u64;
                self.sink.event(Event::CoalesceWaitTimeout {
                    ci: &self.ci,
                    waited_ms,
                });
                Joined::TimedOut
            }
        }
    }
}

/// Result of [`RequestCoalescer::acquire`].
pub enum Acquired {
    Owner(Owned),
    Waiter(Waiting),
}

/// The coalescer itself: single-flight semantics over a bounded in-flight table.
pub struct RequestCoalescer {
    table: Arc<BoundedLru<String, Arc<InFlight>>>,
    wait_timeout: Duration,
    tee_capacity: usize,
    sink: Arc<dyn EventSink>,
}

impl RequestCoalescer {
    pub fn new(
        max_entries: usize,
        entry_ttl: Duration,
        wait_timeout: Duration,
        tee_capacity: usize,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            table: Arc::new(BoundedLru::new(max_entries, entry_ttl)),
            wait_timeout,
            tee_capacity,
            sink,
        }
    }

    /// `acquire(CI)`: becomes owner if no in-flight work exists for `ci`, otherwise
    /// joins the existing owner as a waiter (§4.6).
    pub fn acquire(&self, ci: &str) -> Acquired {
        if let Some(slot) = self.table.get(&ci.to_string()) {
            self.sink.event(Event::CoalesceWaiter { ci });
            return Acquired::Waiter(Waiting {
                ci: ci.to_string(),
                slot,
                wait_timeout: self.wait_timeout,
                sink: self.sink.clone(),
            });
        }

        let slot = Arc::new(InFlight {
            tee: Tee::new(self.tee_capacity),
            notify: Arc::new(Notify::new()),
            outcome: Mutex::new(None),
            arrival_time: Instant::now(),
        });
        self.table.set(ci.to_string(), slot.clone());
        self.sink.event(Event::CoalesceOwner { ci });
        Acquired::Owner(Owned {
            ci: ci.to_string(),
            slot,
            table: self.table.clone(),
            done: false,
        })
    }

    /// Current in-flight entry count; used by tests asserting the `coalesce.max_entries`
    /// bound (§8 invariant 10).
    pub fn len(&self) -> usize {
        self.table.len()
    }
}

/// Converts a timed-out wait into the soft [`ConcurrencyError`] the orchestrator
/// treats as "reissue the work as an independent owner" (§7).
pub fn timeout_error(waited_ms: u64) -> ConcurrencyError {
    ConcurrencyError::WaitTimeout { waited_ms }
}
