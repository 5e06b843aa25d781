use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use hookrelay_core::{DedupeStore, StatusRegistry};
use hookrelay_storage::{Database, QueueError};
use metrics::{counter, gauge, histogram};
use serde_json::json;
use sqlx::Error as SqlxError;
use thiserror::Error;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::router::Clock;
use crate::tap::{StageEvent, StageKind, StageMetadata, TapHub};

const BATCH_LIMIT: i64 = 1000;
const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

/// Background worker for lease reclamation, dedupe expiry, TTL deletion and
/// WAL checkpoints.
#[derive(Clone)]
pub struct MaintenanceWorker {
    database: Database,
    dedupe: Arc<dyn DedupeStore>,
    status: Arc<StatusRegistry>,
    tap: TapHub,
    retention: Duration,
    clock: Clock,
    interval: Duration,
}

impl MaintenanceWorker {
    /// Creates a worker with default clock and cadence.
    pub fn new(
        database: Database,
        dedupe: Arc<dyn DedupeStore>,
        status: Arc<StatusRegistry>,
        tap: TapHub,
        retention: Duration,
    ) -> Self {
        Self {
            database,
            dedupe,
            status,
            tap,
            retention,
            clock: Arc::new(Utc::now),
            interval: DEFAULT_INTERVAL,
        }
    }

    /// Overrides the clock used for expiry decisions.
    #[cfg(test)]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Runs the worker loop in the background.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop().await;
        })
    }

    async fn run_loop(self) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.run_once().await {
                error!(stage = "storage", error = %err, "maintenance run failed");
            }
        }
    }

    /// Executes one maintenance cycle.
    pub async fn run_once(&self) -> Result<(), MaintenanceError> {
        let now = (self.clock)();

        self.reclaim_leases(now).await?;
        self.sweep_dedupe(now);
        self.delete_succeeded(now).await?;
        self.refresh_depth().await?;
        self.run_checkpoint().await?;

        Ok(())
    }

    async fn reclaim_leases(&self, now: DateTime<Utc>) -> Result<(), MaintenanceError> {
        let reclaimed = self
            .database
            .events()
            .reclaim_expired(now)
            .await
            .map_err(MaintenanceError::Reclaim)?;

        if reclaimed > 0 {
            self.status.record_leases_reclaimed(reclaimed);
            counter!("leases_reclaimed_total").increment(reclaimed);
            warn!(stage = "storage", reclaimed, "expired leases returned to pending");
        }
        self.publish_storage_event("lease.reclaim", json!({ "reclaimed": reclaimed }));
        Ok(())
    }

    fn sweep_dedupe(&self, now: DateTime<Utc>) {
        let swept = self.dedupe.sweep(now);
        counter!("dedupe_swept_total").increment(swept as u64);
        debug!(
            stage = "storage",
            swept,
            remaining = self.dedupe.len(),
            "dedupe sweep completed"
        );
        self.publish_storage_event(
            "dedupe.sweep",
            json!({ "swept": swept, "remaining": self.dedupe.len() }),
        );
    }

    async fn delete_succeeded(&self, now: DateTime<Utc>) -> Result<(), MaintenanceError> {
        let retention = ChronoDuration::from_std(self.retention)
            .unwrap_or_else(|_| ChronoDuration::days(3));
        let threshold = now
            .checked_sub_signed(retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut deleted = 0u64;
        let mut busy = false;
        loop {
            match self
                .database
                .events()
                .delete_succeeded_older_than_batch(threshold, BATCH_LIMIT)
                .await
            {
                Ok(0) => break,
                Ok(batch_deleted) => {
                    deleted += batch_deleted;
                    counter!("db_ttl_deleted_total", "table" => "events").increment(batch_deleted);
                }
                Err(err) if is_sqlite_busy(&err) => {
                    busy = true;
                    counter!("db_busy_total", "op" => "ttl").increment(1);
                    warn!(stage = "storage", table = "events", error = %err, "ttl delete hit busy timeout");
                    break;
                }
                Err(err) => return Err(MaintenanceError::TtlDelete { source: err }),
            }
        }

        info!(
            stage = "storage",
            table = "events",
            deleted,
            busy,
            threshold = %threshold.to_rfc3339(),
            "succeeded events TTL sweep completed"
        );
        self.publish_storage_event(
            "ttl.events",
            json!({
                "table": "events",
                "deleted": deleted,
                "threshold": threshold.to_rfc3339(),
                "busy": busy,
            }),
        );
        Ok(())
    }

    // Corrects drift between the in-memory depth and the queue.
    async fn refresh_depth(&self) -> Result<(), MaintenanceError> {
        let counts = self
            .database
            .events()
            .count_by_state()
            .await
            .map_err(MaintenanceError::Depth)?;
        let depth = counts.queue_depth();
        self.status.set_queue_depth(depth);
        gauge!("queue_depth").set(depth as f64);
        self.publish_storage_event(
            "queue.depth",
            json!({
                "pending": counts.pending,
                "in_flight": counts.in_flight,
                "succeeded": counts.succeeded,
                "dead_lettered": counts.dead_lettered,
            }),
        );
        Ok(())
    }

    async fn run_checkpoint(&self) -> Result<(), MaintenanceError> {
        let start = std::time::Instant::now();

        match self.database.wal_checkpoint_truncate().await {
            Ok(stats) => {
                let duration = start.elapsed().as_secs_f64();
                histogram!("db_checkpoint_seconds").record(duration);
                let busy = stats.busy_frames > 0;
                if busy {
                    counter!("db_busy_total", "op" => "checkpoint").increment(1);
                    warn!(
                        stage = "storage",
                        busy_frames = stats.busy_frames,
                        log_frames = stats.log_frames,
                        checkpointed_frames = stats.checkpointed_frames,
                        duration_secs = duration,
                        "WAL checkpoint completed with busy frames"
                    );
                } else {
                    debug!(
                        stage = "storage",
                        log_frames = stats.log_frames,
                        checkpointed_frames = stats.checkpointed_frames,
                        duration_secs = duration,
                        "WAL checkpoint completed"
                    );
                }

                self.publish_storage_event(
                    "wal.checkpoint",
                    json!({
                        "busy_frames": stats.busy_frames,
                        "log_frames": stats.log_frames,
                        "checkpointed_frames": stats.checkpointed_frames,
                        "busy": busy,
                        "duration_secs": duration,
                    }),
                );
                Ok(())
            }
            Err(err) if is_sqlite_busy(&err) => {
                counter!("db_busy_total", "op" => "checkpoint").increment(1);
                warn!(stage = "storage", error = %err, "WAL checkpoint hit busy timeout");
                self.publish_storage_event(
                    "wal.checkpoint",
                    json!({
                        "busy": true,
                        "error": "database busy",
                    }),
                );
                Ok(())
            }
            Err(err) => Err(MaintenanceError::Checkpoint { source: err }),
        }
    }

    fn publish_storage_event(&self, message: &str, payload: serde_json::Value) {
        self.tap.publish(
            StageEvent::new(
                (self.clock)(),
                StageKind::Storage,
                StageMetadata {
                    message: Some(message.to_string()),
                    ..StageMetadata::default()
                },
            )
            .with_output(payload),
        );
    }
}

#[derive(Debug, Error)]
pub enum MaintenanceError {
    #[error("failed to reclaim expired leases")]
    Reclaim(#[source] QueueError),
    #[error("failed to delete expired succeeded events")]
    TtlDelete {
        #[source]
        source: SqlxError,
    },
    #[error("failed to count queued events")]
    Depth(#[source] QueueError),
    #[error("failed to run WAL checkpoint")]
    Checkpoint {
        #[source]
        source: SqlxError,
    },
}

fn is_sqlite_busy(err: &SqlxError) -> bool {
    match err {
        SqlxError::Database(db_err) => matches!(db_err.code().as_deref(), Some("5") | Some("6")),
        _ => false,
    }
}
