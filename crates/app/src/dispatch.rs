use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use serde_json::json;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use hookrelay_core::{
    Event, EventHandler, HandlerOutcome, LeasedEvent, RetryPolicy, StatusRegistry, Transition,
};
use hookrelay_storage::{Database, EventRepository, QueueError};
use hookrelay_util::DispatchConfig;

use crate::router::Clock;
use crate::tap::{StageEvent, StageKind, StageMetadata, TapHub};

/// Tuning for the dispatch worker pool.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub worker_count: usize,
    pub batch_size: u32,
    pub lease_timeout: Duration,
    pub handler_timeout: Duration,
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
}

impl From<&DispatchConfig> for DispatchSettings {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            worker_count: config.worker_count.max(1),
            batch_size: u32::try_from(config.batch_size.max(1)).unwrap_or(u32::MAX),
            lease_timeout: config.lease_timeout,
            handler_timeout: config.handler_timeout,
            poll_interval: config.poll_interval,
            retry: RetryPolicy::new(config.max_attempts, config.backoff_base, config.backoff_cap),
        }
    }
}

struct Shared<H> {
    events: EventRepository,
    handler: Arc<H>,
    settings: DispatchSettings,
    status: Arc<StatusRegistry>,
    tap: TapHub,
    signal: Arc<Notify>,
    clock: Clock,
}

/// Pool of workers that lease events from the queue and hand them to `H`.
pub struct DispatchPool<H> {
    database: Database,
    shared: Arc<Shared<H>>,
    instance_id: String,
}

impl<H: EventHandler> DispatchPool<H> {
    pub fn new(
        database: Database,
        handler: H,
        settings: DispatchSettings,
        status: Arc<StatusRegistry>,
        tap: TapHub,
        signal: Arc<Notify>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                events: database.events(),
                handler: Arc::new(handler),
                settings,
                status,
                tap,
                signal,
                clock: Arc::new(Utc::now),
            }),
            database,
            instance_id: Uuid::new_v4().to_string(),
        }
    }

    /// Starts the workers. Lease owners are named `<instance_id>/worker-<n>`.
    pub fn spawn(self) -> DispatchHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker_count = self.shared.settings.worker_count.max(1);

        let workers = (0..worker_count)
            .map(|n| {
                let worker = Worker {
                    id: format!("{}/worker-{n}", self.instance_id),
                    shared: Arc::clone(&self.shared),
                    shutdown: shutdown_rx.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        info!(
            stage = "dispatch",
            instance_id = %self.instance_id,
            workers = worker_count,
            batch_size = self.shared.settings.batch_size,
            "dispatch pool started"
        );

        DispatchHandle {
            shutdown: shutdown_tx,
            workers,
            database: self.database,
            instance_id: self.instance_id,
            clock: Arc::clone(&self.shared.clock),
        }
    }
}

/// Control handle for a running [`DispatchPool`].
pub struct DispatchHandle {
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    database: Database,
    instance_id: String,
    clock: Clock,
}

/// What happened to the workers during shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Workers that stopped within the grace period.
    pub drained: usize,
    /// Workers aborted in the middle of an attempt.
    pub aborted: usize,
    /// In-flight events returned to `Pending`.
    pub released: u64,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to release in-flight events")]
    Release(#[source] QueueError),
}

impl DispatchHandle {
    /// Stops leasing, lets running attempts finish within `grace`, then aborts
    /// the rest and returns their events to `Pending` without counting an attempt.
    pub async fn shutdown(self, grace: Duration) -> Result<ShutdownReport, DispatchError> {
        let _ = self.shutdown.send(true);
        let deadline = Instant::now() + grace;

        let mut drained = 0;
        let mut aborted = 0;
        for mut worker in self.workers {
            match timeout_at(deadline, &mut worker).await {
                Ok(Ok(())) => drained += 1,
                Ok(Err(err)) => {
                    error!(stage = "dispatch", error = %err, "dispatch worker terminated abnormally");
                    drained += 1;
                }
                Err(_) => {
                    worker.abort();
                    let _ = worker.await;
                    aborted += 1;
                }
            }
        }

        let released = self
            .database
            .events()
            .release_owned(&format!("{}/", self.instance_id), (self.clock)())
            .await
            .map_err(DispatchError::Release)?;

        info!(
            stage = "dispatch",
            instance_id = %self.instance_id,
            drained,
            aborted,
            released,
            "dispatch pool stopped"
        );

        Ok(ShutdownReport {
            drained,
            aborted,
            released,
        })
    }
}

struct Worker<H> {
    id: String,
    shared: Arc<Shared<H>>,
    shutdown: watch::Receiver<bool>,
}

// Aborts the handler task when the attempt is dropped, including when the
// worker itself is aborted during shutdown.
struct AbortOnDrop(JoinHandle<HandlerOutcome>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl<H: EventHandler> Worker<H> {
    async fn run(mut self) {
        debug!(stage = "dispatch", worker = %self.id, "worker started");

        loop {
            if self.stopping() {
                break;
            }

            let shared = Arc::clone(&self.shared);
            let now = (shared.clock)();
            let batch = shared
                .events
                .lease(&self.id, shared.settings.batch_size, shared.settings.lease_timeout, now)
                .await;

            match batch {
                Ok(batch) => {
                    if batch.reclaimed > 0 {
                        shared.status.record_leases_reclaimed(batch.reclaimed);
                        counter!("leases_reclaimed_total").increment(batch.reclaimed);
                        warn!(
                            stage = "dispatch",
                            worker = %self.id,
                            reclaimed = batch.reclaimed,
                            "expired leases returned to pending"
                        );
                    }

                    if batch.events.is_empty() {
                        if !self.idle().await {
                            break;
                        }
                        continue;
                    }

                    // Events left in the batch stay in flight and are released on shutdown.
                    for leased in batch.events {
                        if self.stopping() {
                            break;
                        }
                        self.process(leased).await;
                    }
                }
                Err(err) => {
                    error!(stage = "dispatch", worker = %self.id, error = %err, "failed to lease events");
                    if !self.idle().await {
                        break;
                    }
                }
            }
        }

        debug!(stage = "dispatch", worker = %self.id, "worker stopped");
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Waits for new work, the poll interval, or shutdown. Returns `false` to stop.
    async fn idle(&mut self) -> bool {
        let woke = tokio::select! {
            _ = self.shared.signal.notified() => true,
            _ = sleep(self.shared.settings.poll_interval) => true,
            changed = self.shutdown.changed() => changed.is_ok(),
        };
        woke && !self.stopping()
    }

    async fn process(&self, leased: LeasedEvent) {
        let shared = &self.shared;
        let LeasedEvent { event, lease } = leased;
        let attempt = event.attempt_count + 1;

        // The lease was taken for the whole batch; refresh it for this attempt.
        let lease = match shared
            .events
            .renew(&lease, shared.settings.lease_timeout, (shared.clock)())
            .await
        {
            Ok(lease) => lease,
            Err(err) => {
                self.lease_failed(&event.id, &err);
                return;
            }
        };

        let started = std::time::Instant::now();
        let outcome = self.invoke(event.clone()).await;
        let elapsed = started.elapsed();
        histogram!("dispatch_handler_seconds").record(elapsed.as_secs_f64());
        counter!("dispatch_attempts_total", "outcome" => outcome.metric_label()).increment(1);

        let now = (shared.clock)();
        let transition = shared.settings.retry.transition(event.attempt_count, &outcome, now);

        match shared.events.complete(&lease, &transition, now).await {
            Ok(updated) => {
                counter!("dispatch_transitions_total", "transition" => transition.metric_label())
                    .increment(1);
                shared.status.record_transition(&updated);
                gauge!("queue_depth").set(shared.status.queue_depth() as f64);
                self.report(&updated, &transition, attempt, elapsed);
            }
            Err(err) => self.lease_failed(&event.id, &err),
        }
    }

    async fn invoke(&self, event: Event) -> HandlerOutcome {
        let handler = Arc::clone(&self.shared.handler);
        let mut task = AbortOnDrop(tokio::spawn(async move { handler.handle(&event).await }));
        let limit = self.shared.settings.handler_timeout;

        match timeout(limit, &mut task.0).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) if err.is_panic() => {
                HandlerOutcome::RetryableFailure("handler panicked".to_string())
            }
            Ok(Err(_)) => HandlerOutcome::RetryableFailure("handler cancelled".to_string()),
            Err(_) => HandlerOutcome::RetryableFailure(format!(
                "handler timed out after {}ms",
                limit.as_millis()
            )),
        }
    }

    fn lease_failed(&self, event_id: &str, err: &QueueError) {
        match err {
            QueueError::LeaseLost { .. } => {
                counter!("dispatch_lease_lost_total").increment(1);
                warn!(
                    stage = "dispatch",
                    worker = %self.id,
                    %event_id,
                    "lease lost before the attempt was recorded"
                );
            }
            other => {
                error!(
                    stage = "dispatch",
                    worker = %self.id,
                    %event_id,
                    error = %other,
                    "failed to record attempt; lease will expire"
                );
            }
        }
    }

    fn report(&self, event: &Event, transition: &Transition, attempt: u32, elapsed: Duration) {
        match transition {
            Transition::Succeeded => info!(
                stage = "dispatch",
                worker = %self.id,
                event_id = %event.id,
                attempt,
                "event delivered"
            ),
            Transition::Retry { available_at, reason } => warn!(
                stage = "dispatch",
                worker = %self.id,
                event_id = %event.id,
                attempt,
                retry_at = %available_at.to_rfc3339(),
                %reason,
                "attempt failed; retry scheduled"
            ),
            Transition::DeadLetter { reason } => error!(
                stage = "dispatch",
                worker = %self.id,
                event_id = %event.id,
                attempt,
                %reason,
                "event dead-lettered"
            ),
        }

        self.shared.tap.publish(
            StageEvent::new(
                (self.shared.clock)(),
                StageKind::Dispatch,
                StageMetadata {
                    event_id: Some(event.id.clone()),
                    attempt: Some(attempt),
                    latency_ms: Some(elapsed.as_secs_f64() * 1_000.0),
                    worker: Some(self.id.clone()),
                    message: Some(transition.metric_label().to_string()),
                    ..StageMetadata::default()
                },
            )
            .with_output(json!({
                "state": event.state,
                "attempt_count": event.attempt_count,
                "available_at": format_time(event.available_at),
                "last_error": event.last_error,
            })),
        );
    }
}

fn format_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
