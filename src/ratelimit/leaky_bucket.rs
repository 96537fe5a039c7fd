//! Leaky bucket.
//!
//! Submissions are queued up to a fixed capacity. A background scheduler
//! removes at most one item per process interval and hands it to a
//! dispatcher task, which runs it through the configured [`WorkHandler`] on
//! a pool of at most `max_in_flight` concurrent executions. Each result is
//! stored under the ticket returned by [`LeakyBucket::submit`] until the
//! first [`LeakyBucket::collect`] call takes it.
//!
//! Items are dispatched strictly in submission order, but executions may
//! finish in any order. Results that are never collected stay in the store.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, trace, warn};

use super::ticket::Ticket;
use crate::error::{RateKeeperError, Result};
use crate::schedule::{panic_message, PeriodicScheduler};

/// Default bound on concurrently running work items.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 4;

/// Executes the work behind a queued submission.
///
/// Any `Fn(Ticket, P) -> impl Future<Output = R>` closure is a handler.
#[async_trait]
pub trait WorkHandler<P, R>: Send + Sync + 'static
where
    P: Send + 'static,
    R: Send + 'static,
{
    /// Run one item and produce the result published under its ticket.
    async fn handle(&self, ticket: Ticket, payload: P) -> R;
}

#[async_trait]
impl<P, R, F, Fut> WorkHandler<P, R> for F
where
    P: Send + 'static,
    R: Send + 'static,
    F: Fn(Ticket, P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
{
    async fn handle(&self, ticket: Ticket, payload: P) -> R {
        (self)(ticket, payload).await
    }
}

/// Where a ticket currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    /// Waiting in the queue
    Queued,
    /// Drained and handed to the dispatcher, result not yet published
    InFlight,
    /// Result published and waiting to be collected
    Ready,
    /// Never issued, already collected, or its handler panicked
    Unknown,
}

struct WorkItem<P> {
    ticket: Ticket,
    payload: P,
}

struct WorkQueue<P> {
    capacity: usize,
    items: VecDeque<WorkItem<P>>,
}

/// Results keyed by ticket. A read removes the entry.
struct ResultStore<R> {
    results: Arc<DashMap<Ticket, R>>,
}

impl<R> Clone for ResultStore<R> {
    fn clone(&self) -> Self {
        Self {
            results: self.results.clone(),
        }
    }
}

impl<R> ResultStore<R> {
    fn new() -> Self {
        Self {
            results: Arc::new(DashMap::new()),
        }
    }

    fn publish(&self, ticket: Ticket, result: R) {
        self.results.insert(ticket, result);
    }

    fn take(&self, ticket: &Ticket) -> Option<R> {
        self.results.remove(ticket).map(|(_, result)| result)
    }

    fn contains(&self, ticket: &Ticket) -> bool {
        self.results.contains_key(ticket)
    }

    fn len(&self) -> usize {
        self.results.len()
    }
}

/// State shared between submitters and the drain schedule.
struct Intake<P> {
    queue: Mutex<WorkQueue<P>>,
    in_flight: Arc<DashSet<Ticket>>,
    dispatch_tx: mpsc::UnboundedSender<WorkItem<P>>,
}

impl<P> Intake<P> {
    fn drain(&self) -> Option<Ticket> {
        let next = {
            let mut queue = self.queue.lock();
            let next = queue.items.pop_front();
            if let Some(item) = &next {
                // Mark before releasing the lock so status never loses the ticket.
                self.in_flight.insert(item.ticket);
            }
            next
        };

        let Some(item) = next else {
            trace!("No queued requests to process");
            return None;
        };

        let ticket = item.ticket;
        if self.dispatch_tx.send(item).is_err() {
            self.in_flight.remove(&ticket);
            error!(%ticket, "Dispatcher is gone, dropping drained request");
            return None;
        }

        debug!(%ticket, "Drained request for processing");
        Some(ticket)
    }
}

/// Queues work and releases it at a fixed rate.
pub struct LeakyBucket<P, R> {
    process_interval: Duration,
    max_in_flight: usize,
    intake: Arc<Intake<P>>,
    results: ResultStore<R>,
    scheduler: PeriodicScheduler,
}

impl<P, R> LeakyBucket<P, R>
where
    P: Send + 'static,
    R: Send + Sync + 'static,
{
    /// Create a bucket with [`DEFAULT_MAX_IN_FLIGHT`] concurrent executions.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new<H>(queue_capacity: usize, process_interval: Duration, handler: H) -> Result<Self>
    where
        H: WorkHandler<P, R>,
    {
        Self::with_max_in_flight(queue_capacity, process_interval, DEFAULT_MAX_IN_FLIGHT, handler)
    }

    /// Create a bucket whose dispatcher runs at most `max_in_flight` items at once.
    pub fn with_max_in_flight<H>(
        queue_capacity: usize,
        process_interval: Duration,
        max_in_flight: usize,
        handler: H,
    ) -> Result<Self>
    where
        H: WorkHandler<P, R>,
    {
        if queue_capacity == 0 {
            return Err(RateKeeperError::Config(
                "leaky bucket queue capacity must be greater than zero".to_string(),
            ));
        }
        if max_in_flight == 0 {
            return Err(RateKeeperError::Config(
                "leaky bucket max_in_flight must be greater than zero".to_string(),
            ));
        }

        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let in_flight = Arc::new(DashSet::new());
        let intake = Arc::new(Intake {
            queue: Mutex::new(WorkQueue {
                capacity: queue_capacity,
                items: VecDeque::with_capacity(queue_capacity),
            }),
            in_flight: in_flight.clone(),
            dispatch_tx,
        });
        let results = ResultStore::new();

        let drainer = intake.clone();
        let scheduler =
            PeriodicScheduler::schedule("leaky_bucket_drain", process_interval, move || {
                drainer.drain();
            })?;

        tokio::spawn(dispatch(
            dispatch_rx,
            Arc::new(handler),
            results.clone(),
            in_flight,
            Arc::new(Semaphore::new(max_in_flight)),
        ));

        Ok(Self {
            process_interval,
            max_in_flight,
            intake,
            results,
            scheduler,
        })
    }
}

impl<P, R> LeakyBucket<P, R> {
    /// Queue `payload` for deferred processing.
    ///
    /// Returns the ticket to collect the result with, or `None` when the
    /// queue is full. A rejected submission leaves the queue unchanged.
    pub fn submit(&self, payload: P) -> Option<Ticket> {
        let queued = {
            let mut queue = self.intake.queue.lock();
            if queue.items.len() >= queue.capacity {
                None
            } else {
                let ticket = Ticket::new();
                queue.items.push_back(WorkItem { ticket, payload });
                Some((ticket, queue.items.len()))
            }
        };

        match queued {
            Some((ticket, depth)) => {
                info!(%ticket, depth, "Added request to the queue");
                Some(ticket)
            }
            None => {
                warn!("Queue is full");
                None
            }
        }
    }

    /// Take the result for `ticket`, if it has been published.
    ///
    /// `None` means the work has not finished yet or the result was already
    /// collected. A result is returned at most once.
    pub fn collect(&self, ticket: &Ticket) -> Option<R> {
        let result = self.results.take(ticket);
        if result.is_none() {
            debug!(%ticket, "No result present for ticket");
        }
        result
    }

    /// Dispatch the head of the queue, if any. The scheduler calls this
    /// once per process interval.
    pub fn drain(&self) -> Option<Ticket> {
        self.intake.drain()
    }

    pub fn status(&self, ticket: &Ticket) -> TicketStatus {
        // Check in lifecycle order; each transition adds the ticket to the
        // next stage before removing it from the previous one.
        if self
            .intake
            .queue
            .lock()
            .items
            .iter()
            .any(|item| item.ticket == *ticket)
        {
            TicketStatus::Queued
        } else if self.intake.in_flight.contains(ticket) {
            TicketStatus::InFlight
        } else if self.results.contains(ticket) {
            TicketStatus::Ready
        } else {
            TicketStatus::Unknown
        }
    }

    /// Number of items waiting in the queue.
    pub fn queue_len(&self) -> usize {
        self.intake.queue.lock().items.len()
    }

    pub fn queue_capacity(&self) -> usize {
        self.intake.queue.lock().capacity
    }

    /// Number of items drained but not yet finished.
    pub fn in_flight(&self) -> usize {
        self.intake.in_flight.len()
    }

    /// Number of published results nobody has collected yet.
    pub fn pending_results(&self) -> usize {
        self.results.len()
    }

    pub fn process_interval(&self) -> Duration {
        self.process_interval
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Stop draining. Queued items stay queued; in-flight items finish.
    pub fn shutdown(&self) {
        self.scheduler.cancel();
    }
}

async fn dispatch<P, R, H>(
    mut dispatch_rx: mpsc::UnboundedReceiver<WorkItem<P>>,
    handler: Arc<H>,
    results: ResultStore<R>,
    in_flight: Arc<DashSet<Ticket>>,
    permits: Arc<Semaphore>,
) where
    P: Send + 'static,
    R: Send + Sync + 'static,
    H: WorkHandler<P, R>,
{
    while let Some(WorkItem { ticket, payload }) = dispatch_rx.recv().await {
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };

        let handler = handler.clone();
        let results = results.clone();
        let in_flight = in_flight.clone();

        tokio::spawn(async move {
            trace!(%ticket, "Processing request");
            match AssertUnwindSafe(handler.handle(ticket, payload))
                .catch_unwind()
                .await
            {
                Ok(result) => {
                    results.publish(ticket, result);
                    debug!(%ticket, "Result published");
                }
                Err(panic) => {
                    error!(
                        %ticket,
                        reason = panic_message(panic.as_ref()),
                        "Work handler panicked, no result published"
                    );
                }
            }
            in_flight.remove(&ticket);
            drop(permit);
        });
    }

    debug!("Leaky bucket dispatcher stopped");
}
