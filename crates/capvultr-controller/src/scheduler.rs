//! Work scheduler
//!
//! Drives a [`Reconciler`] from store watches:
//!
//! ```text
//!   watch(kind) ──┐
//!   watch(other) ─┼─ mapper ──▶ queue ──▶ worker task per key ──▶ reconcile
//!                 │               ▲                                   │
//!                 └───────────────┴──── requeue timer / backoff ◀─────┘
//! ```
//!
//! A key is never reconciled twice at the same time. Events that arrive
//! while a key is in flight mark it dirty and it runs once more after the
//! current call. Failed calls are retried with per-key exponential backoff,
//! which resets on the first success. Each key has at most one requeue
//! deadline: scheduling a new one supersedes the previous timer.

use crate::config::ControllerConfig;
use crate::error::ReconcileError;
use crate::mapper::Mapper;
use crate::store::{WatchEvent, WatchStream};
use async_trait::async_trait;
use capvultr_api::ObjectKey;
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// What the scheduler should do after a successful reconcile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    /// Run again after `duration` even if nothing changes
    pub fn requeue(duration: Duration) -> Self {
        Self {
            requeue_after: Some(duration),
        }
    }

    /// Wait for the next change event
    pub fn await_change() -> Self {
        Self {
            requeue_after: None,
        }
    }

    pub fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }
}

/// One reconcile loop over a single kind
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Kind of the reconciled objects, used for logging
    fn kind(&self) -> &'static str;

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError>;

    /// Every key that currently exists, used for the initial sync and resyncs
    async fn keys(&self) -> Result<Vec<ObjectKey>, ReconcileError>;
}

enum Trigger {
    Key(ObjectKey),
    Resync,
}

enum Outcome {
    Done(Action),
    Failed(String),
    TimedOut,
}

/// Queue bookkeeping, owned by the run loop
#[derive(Default)]
struct WorkQueue {
    pending: VecDeque<ObjectKey>,
    queued: HashSet<ObjectKey>,
    in_flight: HashSet<ObjectKey>,
    dirty: HashSet<ObjectKey>,
    failures: HashMap<ObjectKey, u32>,
    /// Generation of the live requeue timer per key
    deadlines: HashMap<ObjectKey, u64>,
    generation: u64,
}

impl WorkQueue {
    fn enqueue(&mut self, key: ObjectKey) {
        if self.in_flight.contains(&key) {
            self.dirty.insert(key);
        } else if self.queued.insert(key.clone()) {
            self.pending.push_back(key);
        }
    }

    fn next_ready(&mut self) -> Option<ObjectKey> {
        let key = self.pending.pop_front()?;
        self.queued.remove(&key);
        self.in_flight.insert(key.clone());
        Some(key)
    }

    /// Marks the key idle again, returning whether it was dirtied meanwhile
    fn finish(&mut self, key: &ObjectKey) -> bool {
        self.in_flight.remove(key);
        self.dirty.remove(key)
    }

    fn record_failure(&mut self, key: &ObjectKey) -> u32 {
        let failures = self.failures.entry(key.clone()).or_insert(0);
        *failures = failures.saturating_add(1);
        *failures
    }

    fn record_success(&mut self, key: &ObjectKey) {
        self.failures.remove(key);
    }

    /// Replaces any pending deadline for `key`, returning the new timer's generation
    fn schedule(&mut self, key: &ObjectKey) -> u64 {
        self.generation += 1;
        self.deadlines.insert(key.clone(), self.generation);
        self.generation
    }

    fn cancel_deadline(&mut self, key: &ObjectKey) {
        self.deadlines.remove(key);
    }

    /// Enqueues `key` unless the timer was superseded
    fn fire(&mut self, key: ObjectKey, generation: u64) -> bool {
        if self.deadlines.get(&key) != Some(&generation) {
            return false;
        }
        self.deadlines.remove(&key);
        self.enqueue(key);
        true
    }
}

/// Runs one reconciler against its watches until shut down
pub struct Controller<R: Reconciler> {
    reconciler: Arc<R>,
    config: ControllerConfig,
    sources: Vec<(WatchStream, Option<Arc<dyn Mapper>>)>,
}

impl<R: Reconciler> Controller<R> {
    pub fn new(reconciler: Arc<R>, config: ControllerConfig) -> Self {
        Self {
            reconciler,
            config,
            sources: Vec::new(),
        }
    }

    /// Watch the reconciled kind itself; event keys are enqueued as-is
    pub fn owns(mut self, stream: WatchStream) -> Self {
        self.sources.push((stream, None));
        self
    }

    /// Watch a related kind; each event is mapped to the keys it affects
    pub fn watches(mut self, stream: WatchStream, mapper: Arc<dyn Mapper>) -> Self {
        self.sources.push((stream, Some(mapper)));
        self
    }

    /// Processes events until `shutdown` resolves, then waits for in-flight
    /// reconciles to finish
    pub async fn run<F>(self, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        let Controller {
            reconciler,
            config,
            sources: watches,
        } = self;
        let kind = reconciler.kind();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut sources = JoinSet::new();
        for (stream, mapper) in watches {
            sources.spawn(forward_events(stream, mapper, tx.clone()));
        }
        // Initial sync
        let _ = tx.send(Trigger::Resync);
        drop(tx);

        let mut queue = WorkQueue::default();
        let mut workers: JoinSet<(ObjectKey, Outcome)> = JoinSet::new();
        let mut timers: JoinSet<(ObjectKey, u64)> = JoinSet::new();

        tracing::info!(kind, "Controller started");
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!(kind, "Shutdown requested");
                    break;
                }

                Some(trigger) = rx.recv() => match trigger {
                    Trigger::Key(key) => queue.enqueue(key),
                    Trigger::Resync => match reconciler.keys().await {
                        Ok(keys) => {
                            tracing::debug!(kind, count = keys.len(), "Resyncing");
                            keys.into_iter().for_each(|k| queue.enqueue(k));
                        }
                        Err(e) => tracing::error!(kind, error = %e, "Failed to list keys for resync"),
                    },
                },

                Some(fired) = timers.join_next(), if !timers.is_empty() => {
                    if let Ok((key, generation)) = fired {
                        queue.fire(key, generation);
                    }
                }

                Some(done) = workers.join_next(), if !workers.is_empty() => {
                    let Ok((key, outcome)) = done else {
                        continue;
                    };
                    let delay = complete(kind, &config, &mut queue, &key, outcome);
                    if queue.finish(&key) {
                        queue.enqueue(key.clone());
                    }
                    match delay {
                        Some(delay) => {
                            let generation = queue.schedule(&key);
                            timers.spawn(async move {
                                tokio::time::sleep(delay).await;
                                (key, generation)
                            });
                        }
                        None => queue.cancel_deadline(&key),
                    }
                }
            }

            while let Some(key) = queue.next_ready() {
                workers.spawn(run_one(
                    Arc::clone(&reconciler),
                    key,
                    config.reconcile_timeout,
                ));
            }
        }

        sources.shutdown().await;
        timers.shutdown().await;

        if !workers.is_empty() {
            tracing::info!(kind, in_flight = workers.len(), "Waiting for in-flight reconciles");
        }
        while workers.join_next().await.is_some() {}
        tracing::info!(kind, "Controller stopped");
    }
}

/// Applies a finished reconcile to the backoff state and returns when the key
/// should run again
fn complete(
    kind: &'static str,
    config: &ControllerConfig,
    queue: &mut WorkQueue,
    key: &ObjectKey,
    outcome: Outcome,
) -> Option<Duration> {
    match outcome {
        Outcome::Done(action) => {
            queue.record_success(key);
            tracing::debug!(kind, key = %key, requeue_after = ?action.requeue_after(), "Reconciled");
            action.requeue_after()
        }
        Outcome::Failed(error) => {
            let delay = config.backoff.delay_for(queue.record_failure(key));
            tracing::warn!(kind, key = %key, error = %error, retry_in = ?delay, "Reconcile failed");
            Some(delay)
        }
        Outcome::TimedOut => {
            let delay = config.backoff.delay_for(queue.record_failure(key));
            tracing::warn!(
                kind,
                key = %key,
                timeout = ?config.reconcile_timeout,
                retry_in = ?delay,
                "Reconcile timed out"
            );
            Some(delay)
        }
    }
}

async fn run_one<R: Reconciler>(
    reconciler: Arc<R>,
    key: ObjectKey,
    timeout: Duration,
) -> (ObjectKey, Outcome) {
    let task_key = key.clone();
    let handle = tokio::spawn(async move { reconciler.reconcile(&task_key).await });
    let abort = handle.abort_handle();

    let outcome = match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(Ok(action))) => Outcome::Done(action),
        Ok(Ok(Err(e))) => Outcome::Failed(e.to_string()),
        Ok(Err(join_error)) => Outcome::Failed(format!("reconcile task failed: {}", join_error)),
        Err(_) => {
            abort.abort();
            Outcome::TimedOut
        }
    };
    (key, outcome)
}

async fn forward_events(
    mut stream: WatchStream,
    mapper: Option<Arc<dyn Mapper>>,
    tx: mpsc::UnboundedSender<Trigger>,
) {
    while let Some(event) = stream.next().await {
        let triggers = match (event, &mapper) {
            (WatchEvent::Resync, _) => vec![Trigger::Resync],
            (WatchEvent::Changed(change), None) => vec![Trigger::Key(change.key)],
            (WatchEvent::Changed(change), Some(mapper)) => mapper
                .map(&change.key)
                .await
                .into_iter()
                .map(Trigger::Key)
                .collect(),
        };
        for trigger in triggers {
            if tx.send(trigger).is_err() {
                return;
            }
        }
    }
    tracing::debug!(kind = stream.kind(), "Watch closed");
}
