//! Event bus with priority handlers and a bounded worker pool.
//!
//! Handlers subscribe per event type with a priority and a sync/async
//! flag. During a publish, sync handlers run inline in descending
//! priority order; async handlers are enqueued on the worker pool and
//! their results joined before the publish returns. A saturated queue
//! degrades to a fresh task after five seconds rather than dropping
//! work. Handler panics are contained and surfaced as errors.

use crate::error::{Error, Result};
use crate::event::{Event, EventHandler, EventType};
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

/// How long a publish waits for a worker slot before degrading to a
/// fresh task.
const ENQUEUE_TIMEOUT: Duration = Duration::from_secs(5);

/// Drain budget for workers during shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct HandlerEntry {
    handler: EventHandler,
    priority: i32,
    run_async: bool,
}

struct Job {
    event: Event,
    handler: EventHandler,
    done: oneshot::Sender<Result<()>>,
}

struct BusInner {
    subscribers: RwLock<HashMap<EventType, Vec<HandlerEntry>>>,
    queue: RwLock<Option<mpsc::Sender<Job>>>,
    receiver: Mutex<Option<mpsc::Receiver<Job>>>,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    worker_count: usize,
    stopped: AtomicBool,
}

/// The framework event bus.
///
/// Cheap to clone; all clones share the same subscriber table and
/// worker pool.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a bus with `worker_count` workers and a queue of ten jobs
    /// per worker. Workers start on [`EventBus::start`].
    pub fn new(worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        let (tx, rx) = mpsc::channel(worker_count * 10);
        Self {
            inner: Arc::new(BusInner {
                subscribers: RwLock::new(HashMap::new()),
                queue: RwLock::new(Some(tx)),
                receiver: Mutex::new(Some(rx)),
                workers: Mutex::new(Vec::new()),
                worker_count,
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Start the worker tasks.
    pub async fn start(&self) {
        let rx = self.inner.receiver.lock().await.take();
        let Some(rx) = rx else {
            return; // already started
        };
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = self.inner.workers.lock().await;
        for id in 0..self.inner.worker_count {
            let rx = rx.clone();
            workers.push(tokio::spawn(async move {
                debug!("event bus worker {id} started");
                loop {
                    let job = { rx.lock().await.recv().await };
                    match job {
                        Some(job) => {
                            let result = run_contained(job.handler, job.event).await;
                            let _ = job.done.send(result);
                        }
                        None => {
                            debug!("event bus worker {id} stopping");
                            break;
                        }
                    }
                }
            }));
        }
    }

    /// Subscribe a sync handler with default priority.
    pub fn subscribe(&self, event_type: EventType, handler: EventHandler) {
        self.subscribe_with_priority(event_type, handler, 0, false);
    }

    /// Subscribe an async handler (executed on the worker pool).
    pub fn subscribe_async(&self, event_type: EventType, handler: EventHandler) {
        self.subscribe_with_priority(event_type, handler, 0, true);
    }

    /// Subscribe with an explicit priority. Higher priorities run first;
    /// insertion order breaks ties.
    pub fn subscribe_with_priority(
        &self,
        event_type: EventType,
        handler: EventHandler,
        priority: i32,
        run_async: bool,
    ) {
        let mut subscribers = self.inner.subscribers.write().unwrap();
        let entries = subscribers.entry(event_type).or_default();
        entries.push(HandlerEntry {
            handler,
            priority,
            run_async,
        });
        // Stable sort keeps insertion order among equal priorities.
        entries.sort_by(|a, b| b.priority.cmp(&a.priority));
        debug!(
            "subscribed handler to {event_type} (priority: {priority}, async: {run_async})"
        );
    }

    /// Remove a handler registered for `event_type`. Handlers are matched
    /// by `Arc` pointer identity.
    pub fn unsubscribe(&self, event_type: EventType, handler: &EventHandler) {
        let mut subscribers = self.inner.subscribers.write().unwrap();
        if let Some(entries) = subscribers.get_mut(&event_type) {
            entries.retain(|e| !Arc::ptr_eq(&e.handler, handler));
        }
    }

    /// Publish an event to all subscribers of its type.
    ///
    /// Sync handlers run inline in priority order; async handlers run on
    /// the worker pool and are joined before this returns. Errors from
    /// all handlers are aggregated. A no-op after [`EventBus::stop`].
    pub async fn publish(&self, event: Event) -> Result<()> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Ok(());
        }

        let entries: Vec<HandlerEntry> = {
            let subscribers = self.inner.subscribers.read().unwrap();
            match subscribers.get(&event.event_type) {
                Some(entries) if !entries.is_empty() => entries.clone(),
                _ => {
                    debug!("no subscribers for event type: {}", event.event_type);
                    return Ok(());
                }
            }
        };

        debug!(
            "publishing event {} to {} subscribers",
            event.event_type,
            entries.len()
        );

        let mut errors: Vec<Error> = Vec::new();
        let mut pending: Vec<oneshot::Receiver<Result<()>>> = Vec::new();

        for entry in entries {
            if entry.run_async {
                let (done_tx, done_rx) = oneshot::channel();
                let job = Job {
                    event: event.clone(),
                    handler: entry.handler,
                    done: done_tx,
                };
                self.submit(job).await;
                pending.push(done_rx);
            } else if let Err(e) = run_contained(entry.handler, event.clone()).await {
                errors.push(e);
            }
        }

        for rx in pending {
            match rx.await {
                Ok(Err(e)) => errors.push(e),
                Ok(Ok(())) => {}
                // Worker dropped the sender mid-job; only happens during
                // shutdown, treat as a drain casualty.
                Err(_) => {}
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            let joined = errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            Err(Error::handler(joined))
        }
    }

    /// Publish without waiting for the result; errors are logged.
    pub fn publish_async(&self, event: Event) {
        let bus = self.clone();
        tokio::spawn(async move {
            if let Err(e) = bus.publish(event).await {
                warn!("error publishing event asynchronously: {e}");
            }
        });
    }

    /// Number of subscribers for an event type.
    pub fn subscriber_count(&self, event_type: EventType) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap()
            .get(&event_type)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    /// Subscriber counts for every event type that has any.
    pub fn all_subscribers(&self) -> HashMap<EventType, usize> {
        self.inner
            .subscribers
            .read()
            .unwrap()
            .iter()
            .map(|(t, v)| (*t, v.len()))
            .collect()
    }

    /// Stop the bus: close the queue, drain the workers within the
    /// budget, and clear all subscriptions. Publishes after this are
    /// no-ops.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("stopping event bus");

        // Dropping the sender lets workers drain the queue and exit.
        self.inner.queue.write().unwrap().take();

        let mut workers = self.inner.workers.lock().await;
        for handle in workers.drain(..) {
            if tokio::time::timeout(DRAIN_TIMEOUT, handle).await.is_err() {
                warn!("event bus worker did not drain within {DRAIN_TIMEOUT:?}");
            }
        }

        self.inner.subscribers.write().unwrap().clear();
        debug!("event bus stopped");
    }

    /// Submit work to the pool, degrading to a fresh task after the
    /// enqueue timeout or once the queue is closed. Work is never
    /// dropped.
    async fn submit(&self, job: Job) {
        let sender = self.inner.queue.read().unwrap().clone();
        let Some(sender) = sender else {
            spawn_direct(job);
            return;
        };
        match sender.send_timeout(job, ENQUEUE_TIMEOUT).await {
            Ok(()) => {}
            Err(mpsc::error::SendTimeoutError::Timeout(job)) => {
                warn!("worker pool full, executing work directly");
                spawn_direct(job);
            }
            Err(mpsc::error::SendTimeoutError::Closed(job)) => {
                spawn_direct(job);
            }
        }
    }
}

fn spawn_direct(job: Job) {
    tokio::spawn(async move {
        let result = run_contained(job.handler, job.event).await;
        let _ = job.done.send(result);
    });
}

/// Run a handler, converting a panic into an error so no worker dies.
async fn run_contained(handler: EventHandler, event: Event) -> Result<()> {
    let event_type = event.event_type;
    let outcome = AssertUnwindSafe(async move { handler(event).await })
        .catch_unwind()
        .await;
    match outcome {
        Ok(result) => result,
        Err(panic) => {
            let message = panic_message(&panic);
            warn!("handler panic for event {event_type}: {message}");
            Err(Error::handler_panic(message))
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
