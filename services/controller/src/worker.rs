//! Event-driven worker scheduling reconciliation passes.
//!
//! Passes for different services run concurrently up to a limit; passes for
//! the same service never overlap. Events that arrive while a pass is in
//! flight are coalesced into the latest one and run afterwards.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use vlb_id::ServiceKey;

use crate::reconciler::{PassOutcome, ServiceReconciler};
use crate::service::ServiceEvent;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Upper bound on concurrently running passes.
    pub max_concurrent_passes: usize,

    /// How long to wait for in-flight passes on shutdown.
    pub shutdown_timeout: Duration,

    /// Capacity of the event channel.
    pub channel_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_passes: 4,
            shutdown_timeout: Duration::from_secs(10),
            channel_capacity: 256,
        }
    }
}

/// Consumes service events and runs reconciliation passes.
pub struct ServiceWorker {
    reconciler: Arc<ServiceReconciler>,
    config: WorkerConfig,
    events_tx: mpsc::Sender<ServiceEvent>,
    events_rx: mpsc::Receiver<ServiceEvent>,

    /// Last known event per service; a retry replays it.
    latest: HashMap<ServiceKey, ServiceEvent>,
    /// Keys waiting for a pass, in arrival order.
    queue: VecDeque<ServiceKey>,
    queued: HashSet<ServiceKey>,
    in_flight: HashSet<ServiceKey>,
}

impl ServiceWorker {
    /// Create a worker and the sender used to feed it events.
    pub fn new(reconciler: Arc<ServiceReconciler>, config: WorkerConfig) -> (Self, mpsc::Sender<ServiceEvent>) {
        let (events_tx, events_rx) = mpsc::channel(config.channel_capacity.max(1));
        let worker = Self {
            reconciler,
            config,
            events_tx: events_tx.clone(),
            events_rx,
            latest: HashMap::new(),
            queue: VecDeque::new(),
            queued: HashSet::new(),
            in_flight: HashSet::new(),
        };
        (worker, events_tx)
    }

    /// Run until shutdown is signalled, then wait for in-flight passes.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            max_concurrent_passes = self.config.max_concurrent_passes,
            "Starting service worker"
        );

        let mut passes: JoinSet<(ServiceKey, PassOutcome)> = JoinSet::new();
        let mut timers: JoinSet<()> = JoinSet::new();

        loop {
            self.dispatch(&mut passes);

            tokio::select! {
                Some(event) = self.events_rx.recv() => {
                    self.enqueue(event);
                }
                Some(joined) = passes.join_next(), if !passes.is_empty() => {
                    match joined {
                        Ok((key, outcome)) => self.complete(key, outcome, &mut timers),
                        Err(e) => error!(error = %e, "reconcile task failed"),
                    }
                }
                Some(_) = timers.join_next(), if !timers.is_empty() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(in_flight = passes.len(), "Service worker shutting down");
                        break;
                    }
                }
            }
        }

        timers.abort_all();
        let drain = async { while passes.join_next().await.is_some() {} };
        if tokio::time::timeout(self.config.shutdown_timeout, drain).await.is_err() {
            warn!("in-flight passes did not finish before shutdown timeout");
            passes.abort_all();
        }
    }

    fn enqueue(&mut self, event: ServiceEvent) {
        let key = event.key().clone();
        match event {
            ServiceEvent::Retry(_) => {
                if !self.latest.contains_key(&key) {
                    debug!(service = %key, "retry for forgotten service; dropping");
                    return;
                }
            }
            event => {
                self.latest.insert(key.clone(), event);
            }
        }

        if self.queued.insert(key.clone()) {
            self.queue.push_back(key);
        }
    }

    fn dispatch(&mut self, passes: &mut JoinSet<(ServiceKey, PassOutcome)>) {
        let mut deferred = Vec::new();

        while passes.len() < self.config.max_concurrent_passes.max(1) {
            let Some(key) = self.queue.pop_front() else {
                break;
            };

            if self.in_flight.contains(&key) {
                deferred.push(key);
                continue;
            }

            self.queued.remove(&key);
            let Some(event) = self.latest.get(&key).cloned() else {
                continue;
            };

            self.in_flight.insert(key.clone());
            let reconciler = Arc::clone(&self.reconciler);
            passes.spawn(async move {
                let pass_key = key.clone();
                let outcome = match isolated(async move { reconciler.reconcile(&event).await }).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!(service = %pass_key, error = %e, "reconcile pass panicked");
                        PassOutcome::Requeue {
                            after: Duration::from_secs(30),
                            reason: format!("pass panicked: {e}"),
                        }
                    }
                };
                (key, outcome)
            });
        }

        for key in deferred.into_iter().rev() {
            self.queue.push_front(key);
        }
    }

    fn complete(&mut self, key: ServiceKey, outcome: PassOutcome, timers: &mut JoinSet<()>) {
        self.in_flight.remove(&key);

        match outcome {
            PassOutcome::Skipped => debug!(service = %key, "pass skipped"),
            PassOutcome::Converged { address } => {
                info!(service = %key, address = %address, "pass converged");
            }
            PassOutcome::Released => {
                info!(service = %key, "pass released service");
                if matches!(self.latest.get(&key), Some(ServiceEvent::Deleted(_))) && !self.queued.contains(&key) {
                    self.latest.remove(&key);
                }
            }
            PassOutcome::Requeue { after, reason } => {
                info!(service = %key, retry_in_ms = after.as_millis() as u64, reason = %reason, "pass requeued");
                let tx = self.events_tx.clone();
                timers.spawn(async move {
                    tokio::time::sleep(after).await;
                    let _ = tx.send(ServiceEvent::Retry(key)).await;
                });
            }
            PassOutcome::Failed { error } => {
                warn!(service = %key, error = %error, "pass failed; waiting for next change");
            }
        }
    }
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Run `fut` on its own task so a panic comes back as a `JoinError`.
/// Cancelling the caller cancels the task too.
async fn isolated<F>(fut: F) -> Result<F::Output, JoinError>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let mut task = AbortOnDrop(tokio::spawn(fut));
    (&mut task.0).await
}
