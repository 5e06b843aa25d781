use std::borrow::Cow;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    migrate::MigrateError,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    Row, SqlitePool,
};
use thiserror::Error;
use uuid::Uuid;

use hookrelay_core::types::{
    Event, EventHandle, EventState, EventSummary, Lease, LeasedEvent, StateCounts,
};
use hookrelay_core::Transition;

const EVENT_COLUMNS: &str = "seq, id, received_at, raw_payload, content_type, signature_valid, \
     attempt_count, state, available_at, lease_owner, lease_expires_at, last_error, updated_at";

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let options = connect_options(database_url)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(StorageError::Connect)?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns a handle to the durable event queue.
    pub fn events(&self) -> EventRepository {
        EventRepository {
            pool: self.pool.clone(),
        }
    }

    /// Runs `PRAGMA wal_checkpoint(TRUNCATE)` and reports the frame counters.
    pub async fn wal_checkpoint_truncate(&self) -> Result<CheckpointStats, sqlx::Error> {
        let row = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE);")
            .fetch_one(&self.pool)
            .await?;

        Ok(CheckpointStats {
            busy_frames: row.try_get(0)?,
            log_frames: row.try_get(1)?,
            checkpointed_frames: row.try_get(2)?,
        })
    }

    /// Closes every pooled connection. Subsequent queries fail with `PoolClosed`.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

// Pragmas go on the connect options so every pooled connection carries them.
fn connect_options(database_url: &str) -> Result<SqliteConnectOptions, StorageError> {
    let options = SqliteConnectOptions::from_str(database_url)
        .map_err(StorageError::Connect)?
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_millis(5000));
    Ok(options)
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Result of `PRAGMA wal_checkpoint`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointStats {
    pub busy_frames: i64,
    pub log_frames: i64,
    pub checkpointed_frames: i64,
}

/// Repository responsible for the `events` table.
///
/// Every state change is a single guarded statement (or transaction), so an
/// event is never observable in two states and a stale lease holder can never
/// overwrite the work of the worker that reclaimed it.
#[derive(Clone)]
pub struct EventRepository {
    pool: SqlitePool,
}

impl EventRepository {
    /// Durably records a verified event in `Pending`.
    ///
    /// An existing row with the same id yields [`EnqueueOutcome::Duplicate`].
    pub async fn enqueue(&self, record: NewEvent<'_>) -> Result<EnqueueOutcome, QueueError> {
        let received_at = to_rfc3339(record.received_at);
        let result = sqlx::query(
            "INSERT INTO events \
             (id, received_at, raw_payload, content_type, signature_valid, attempt_count, state, available_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, 0, 'pending', ?, ?) \
             RETURNING seq",
        )
        .bind(record.id.as_ref())
        .bind(&received_at)
        .bind(record.raw_payload)
        .bind(record.content_type)
        .bind(record.signature_valid)
        .bind(&received_at)
        .bind(&received_at)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => Ok(EnqueueOutcome::Inserted(EventHandle {
                id: record.id.into_owned(),
                seq: row.try_get("seq")?,
            })),
            Err(sqlx::Error::Database(db_err)) if db_err.code().as_deref() == Some("2067") => {
                Ok(EnqueueOutcome::Duplicate)
            }
            Err(err) => Err(QueueError::StorageUnavailable(err)),
        }
    }

    /// Claims up to `batch_size` available events for `owner`.
    ///
    /// Expired leases are returned to `Pending` first, without touching their
    /// attempt count, so a crashed worker's events are picked up again here.
    pub async fn lease(
        &self,
        owner: &str,
        batch_size: u32,
        lease_for: Duration,
        now: DateTime<Utc>,
    ) -> Result<LeaseBatch, QueueError> {
        let now_text = to_rfc3339(now);
        let expires_at = expiry(now, lease_for);
        let token = Uuid::new_v4().to_string();

        let mut tx = self.pool.begin().await?;

        let reclaimed = sqlx::query(
            "UPDATE events \
             SET state = 'pending', lease_owner = NULL, lease_token = NULL, lease_expires_at = NULL, updated_at = ? \
             WHERE state = 'in_flight' AND lease_expires_at <= ?",
        )
        .bind(&now_text)
        .bind(&now_text)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let sql = format!(
            "UPDATE events \
             SET state = 'in_flight', lease_owner = ?, lease_token = ?, lease_expires_at = ?, updated_at = ? \
             WHERE seq IN ( \
                 SELECT seq FROM events \
                  WHERE state = 'pending' AND available_at <= ? \
                  ORDER BY seq ASC \
                  LIMIT ? \
             ) \
             RETURNING {EVENT_COLUMNS}"
        );
        let mut rows = sqlx::query_as::<_, EventRow>(&sql)
            .bind(owner)
            .bind(&token)
            .bind(to_rfc3339(expires_at))
            .bind(&now_text)
            .bind(&now_text)
            .bind(i64::from(batch_size))
            .fetch_all(&mut *tx)
            .await?;

        tx.commit().await?;

        rows.sort_by_key(|row| row.seq);
        let events = rows
            .into_iter()
            .map(|row| {
                let event = row.into_domain()?;
                let lease = Lease {
                    event_id: event.id.clone(),
                    owner: owner.to_string(),
                    token: token.clone(),
                    expires_at: event.lease_expires_at.unwrap_or(expires_at),
                };
                Ok(LeasedEvent { event, lease })
            })
            .collect::<Result<Vec<_>, QueueError>>()?;

        Ok(LeaseBatch { reclaimed, events })
    }

    /// Extends a lease that is still held.
    pub async fn renew(
        &self,
        lease: &Lease,
        lease_for: Duration,
        now: DateTime<Utc>,
    ) -> Result<Lease, QueueError> {
        let expires_at = expiry(now, lease_for);
        let affected = sqlx::query(
            "UPDATE events SET lease_expires_at = ?, updated_at = ? \
             WHERE id = ? AND state = 'in_flight' AND lease_token = ?",
        )
        .bind(to_rfc3339(expires_at))
        .bind(to_rfc3339(now))
        .bind(&lease.event_id)
        .bind(&lease.token)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 0 {
            return Err(QueueError::LeaseLost {
                event_id: lease.event_id.clone(),
            });
        }

        Ok(Lease {
            expires_at,
            ..lease.clone()
        })
    }

    /// Applies the outcome of a handler attempt and clears the lease.
    ///
    /// Fails with [`QueueError::LeaseLost`] when the lease was reclaimed and
    /// possibly handed to another worker in the meantime.
    pub async fn complete(
        &self,
        lease: &Lease,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<Event, QueueError> {
        let target = transition.target_state();
        if !EventState::InFlight.can_transition_to(target) {
            return Err(QueueError::IllegalTransition {
                event_id: lease.event_id.clone(),
                from: EventState::InFlight,
                to: target,
            });
        }

        let available_at = match transition {
            Transition::Retry { available_at, .. } => Some(to_rfc3339(*available_at)),
            Transition::Succeeded | Transition::DeadLetter { .. } => None,
        };

        let sql = format!(
            "UPDATE events \
             SET state = ?, attempt_count = attempt_count + 1, available_at = COALESCE(?, available_at), \
                 lease_owner = NULL, lease_token = NULL, lease_expires_at = NULL, last_error = ?, updated_at = ? \
             WHERE id = ? AND state = 'in_flight' AND lease_token = ? \
             RETURNING {EVENT_COLUMNS}"
        );
        let row = sqlx::query_as::<_, EventRow>(&sql)
            .bind(target.as_str())
            .bind(available_at)
            .bind(transition.reason())
            .bind(to_rfc3339(now))
            .bind(&lease.event_id)
            .bind(&lease.token)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => row.into_domain(),
            None => Err(QueueError::LeaseLost {
                event_id: lease.event_id.clone(),
            }),
        }
    }

    /// Returns every expired in-flight event to `Pending`.
    pub async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<u64, QueueError> {
        let now_text = to_rfc3339(now);
        let affected = sqlx::query(
            "UPDATE events \
             SET state = 'pending', lease_owner = NULL, lease_token = NULL, lease_expires_at = NULL, updated_at = ? \
             WHERE state = 'in_flight' AND lease_expires_at <= ?",
        )
        .bind(&now_text)
        .bind(&now_text)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(affected)
    }

    /// Returns in-flight events whose owner starts with `owner_prefix` to `Pending`.
    ///
    /// Used on shutdown so aborted attempts become available immediately
    /// instead of waiting for their leases to run out.
    pub async fn release_owned(
        &self,
        owner_prefix: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, QueueError> {
        let affected = sqlx::query(
            "UPDATE events \
             SET state = 'pending', lease_owner = NULL, lease_token = NULL, lease_expires_at = NULL, updated_at = ? \
             WHERE state = 'in_flight' AND substr(lease_owner, 1, length(?)) = ?",
        )
        .bind(to_rfc3339(now))
        .bind(owner_prefix)
        .bind(owner_prefix)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(affected)
    }

    /// Loads a single event by id.
    pub async fn fetch(&self, event_id: &str) -> Result<Option<Event>, QueueError> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?");
        let row = sqlx::query_as::<_, EventRow>(&sql)
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(EventRow::into_domain).transpose()
    }

    /// Lists events newest first, optionally restricted to one state.
    pub async fn list(
        &self,
        state: Option<EventState>,
        limit: u32,
    ) -> Result<Vec<Event>, QueueError> {
        let rows = match state {
            Some(state) => {
                let sql = format!(
                    "SELECT {EVENT_COLUMNS} FROM events WHERE state = ? ORDER BY seq DESC LIMIT ?"
                );
                sqlx::query_as::<_, EventRow>(&sql)
                    .bind(state.as_str())
                    .bind(i64::from(limit))
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql = format!("SELECT {EVENT_COLUMNS} FROM events ORDER BY seq DESC LIMIT ?");
                sqlx::query_as::<_, EventRow>(&sql)
                    .bind(i64::from(limit))
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.into_iter().map(EventRow::into_domain).collect()
    }

    /// Most recently updated events, used to seed the status surface.
    pub async fn list_recent(&self, limit: u32) -> Result<Vec<EventSummary>, QueueError> {
        let rows = sqlx::query_as::<_, SummaryRow>(
            "SELECT id, state, attempt_count, updated_at, last_error FROM events \
             ORDER BY updated_at DESC, seq DESC LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SummaryRow::into_domain).collect()
    }

    /// Counts rows per stored state.
    pub async fn count_by_state(&self) -> Result<StateCounts, QueueError> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS count FROM events GROUP BY state")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = StateCounts::default();
        for row in rows {
            let state: String = row.try_get("state")?;
            let count: i64 = row.try_get("count")?;
            let count = u64::try_from(count).unwrap_or(0);
            match parse_state(&state, "count_by_state")? {
                EventState::Pending => counts.pending = count,
                EventState::InFlight => counts.in_flight = count,
                EventState::Succeeded => counts.succeeded = count,
                EventState::DeadLettered => counts.dead_lettered = count,
                EventState::Failed => {}
            }
        }

        Ok(counts)
    }

    /// Deletes up to `limit` succeeded rows last updated before `threshold`.
    pub async fn delete_succeeded_older_than_batch(
        &self,
        threshold: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM events WHERE seq IN ( \
                 SELECT seq FROM events \
                  WHERE state = 'succeeded' AND updated_at < ? \
                  ORDER BY seq ASC \
                  LIMIT ? \
             )",
        )
        .bind(to_rfc3339(threshold))
        .bind(limit)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

/// Parameters required to enqueue an event.
#[derive(Debug, Clone)]
pub struct NewEvent<'a> {
    pub id: Cow<'a, str>,
    pub received_at: DateTime<Utc>,
    pub raw_payload: &'a [u8],
    pub content_type: Option<&'a str>,
    pub signature_valid: bool,
}

/// Result of attempting to enqueue an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Inserted(EventHandle),
    Duplicate,
}

impl EnqueueOutcome {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate)
    }
}

/// Events claimed by one `lease` call.
#[derive(Debug, Clone)]
pub struct LeaseBatch {
    /// Expired leases returned to `Pending` before claiming.
    pub reclaimed: u64,
    pub events: Vec<LeasedEvent>,
}

/// Errors surfaced by the event queue.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue storage unavailable: {0}")]
    StorageUnavailable(#[source] sqlx::Error),
    #[error("lease for event {event_id} is no longer held")]
    LeaseLost { event_id: String },
    #[error("event {event_id} has a corrupt row: {reason}")]
    Corrupt { event_id: String, reason: String },
    #[error("event {event_id} cannot move from {from} to {to}")]
    IllegalTransition {
        event_id: String,
        from: EventState,
        to: EventState,
    },
}

impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        Self::StorageUnavailable(err)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    seq: i64,
    id: String,
    received_at: DateTime<Utc>,
    raw_payload: Vec<u8>,
    content_type: Option<String>,
    signature_valid: bool,
    attempt_count: i64,
    state: String,
    available_at: DateTime<Utc>,
    lease_owner: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    updated_at: DateTime<Utc>,
}

impl EventRow {
    fn into_domain(self) -> Result<Event, QueueError> {
        let state = parse_state(&self.state, &self.id)?;
        let attempt_count = parse_attempts(self.attempt_count, &self.id)?;
        Ok(Event {
            id: self.id,
            seq: self.seq,
            received_at: self.received_at,
            raw_payload: self.raw_payload,
            content_type: self.content_type,
            signature_valid: self.signature_valid,
            attempt_count,
            state,
            available_at: self.available_at,
            lease_owner: self.lease_owner,
            lease_expires_at: self.lease_expires_at,
            last_error: self.last_error,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SummaryRow {
    id: String,
    state: String,
    attempt_count: i64,
    updated_at: DateTime<Utc>,
    last_error: Option<String>,
}

impl SummaryRow {
    fn into_domain(self) -> Result<EventSummary, QueueError> {
        Ok(EventSummary {
            state: parse_state(&self.state, &self.id)?,
            attempt_count: parse_attempts(self.attempt_count, &self.id)?,
            at: self.updated_at,
            detail: self.last_error,
            id: self.id,
        })
    }
}

fn parse_state(value: &str, event_id: &str) -> Result<EventState, QueueError> {
    value.parse().map_err(|reason| QueueError::Corrupt {
        event_id: event_id.to_string(),
        reason,
    })
}

fn parse_attempts(value: i64, event_id: &str) -> Result<u32, QueueError> {
    u32::try_from(value).map_err(|_| QueueError::Corrupt {
        event_id: event_id.to_string(),
        reason: format!("attempt_count out of range: {value}"),
    })
}

fn expiry(now: DateTime<Utc>, lease_for: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(lease_for)
        .ok()
        .and_then(|lease_for| now.checked_add_signed(lease_for))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use tempfile::TempDir;

    const LEASE: Duration = Duration::from_secs(30);

    fn database_url(dir: &TempDir) -> String {
        format!("sqlite://{}?mode=rwc", dir.path().join("queue.db").display())
    }

    async fn setup_db() -> (Database, TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::connect(&database_url(&dir))
            .await
            .expect("connect");
        db.run_migrations().await.expect("migrations");
        (db, dir)
    }

    fn base() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .expect("timestamp")
            .with_timezone(&Utc)
    }

    fn secs(seconds: i64) -> chrono::Duration {
        chrono::Duration::seconds(seconds)
    }

    async fn enqueue(repo: &EventRepository, id: &str, at: DateTime<Utc>) -> EventHandle {
        let outcome = repo
            .enqueue(NewEvent {
                id: Cow::Borrowed(id),
                received_at: at,
                raw_payload: b"{\"id\":\"x\"}",
                content_type: Some("application/json"),
                signature_valid: true,
            })
            .await
            .expect("enqueue");
        match outcome {
            EnqueueOutcome::Inserted(handle) => handle,
            EnqueueOutcome::Duplicate => panic!("unexpected duplicate for {id}"),
        }
    }

    #[tokio::test]
    async fn enqueue_returns_duplicate_on_conflict() {
        let (db, _dir) = setup_db().await;
        let repo = db.events();

        let handle = enqueue(&repo, "evt-1", base()).await;
        assert_eq!(handle.id, "evt-1");

        let outcome = repo
            .enqueue(NewEvent {
                id: Cow::Borrowed("evt-1"),
                received_at: base() + secs(1),
                raw_payload: b"other",
                content_type: None,
                signature_valid: true,
            })
            .await
            .expect("duplicate should be ok");
        assert!(outcome.is_duplicate());

        let stored = repo.fetch("evt-1").await.expect("fetch").expect("row");
        assert_eq!(stored.raw_payload, b"{\"id\":\"x\"}".to_vec());
        assert_eq!(stored.state, EventState::Pending);
        assert_eq!(stored.attempt_count, 0);
        assert_eq!(stored.available_at, base());
    }

    #[tokio::test]
    async fn enqueued_events_survive_reopen() {
        let (db, dir) = setup_db().await;
        enqueue(&db.events(), "evt-durable", base()).await;
        db.close().await;
        drop(db);

        let reopened = Database::connect(&database_url(&dir))
            .await
            .expect("reconnect");
        reopened.run_migrations().await.expect("migrations");
        let event = reopened
            .events()
            .fetch("evt-durable")
            .await
            .expect("fetch")
            .expect("event survives restart");
        assert_eq!(event.state, EventState::Pending);
        assert_eq!(event.content_type.as_deref(), Some("application/json"));
        assert!(event.signature_valid);
    }

    #[tokio::test]
    async fn lease_is_fifo_and_exclusive() {
        let (db, _dir) = setup_db().await;
        let repo = db.events();
        for id in ["a", "b", "c"] {
            enqueue(&repo, id, base()).await;
        }

        let first = repo
            .lease("worker-1", 2, LEASE, base())
            .await
            .expect("lease");
        let ids: Vec<_> = first.events.iter().map(|e| e.event.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(first
            .events
            .iter()
            .all(|leased| leased.event.state == EventState::InFlight
                && leased.lease.expires_at == base() + secs(30)));

        let second = repo
            .lease("worker-2", 5, LEASE, base())
            .await
            .expect("lease");
        let ids: Vec<_> = second.events.iter().map(|e| e.event.id.as_str()).collect();
        assert_eq!(ids, vec!["c"]);

        let third = repo
            .lease("worker-3", 5, LEASE, base())
            .await
            .expect("lease");
        assert!(third.events.is_empty());
    }

    #[tokio::test]
    async fn concurrent_leases_never_share_an_event() {
        let (db, _dir) = setup_db().await;
        let repo = db.events();
        for idx in 0..20 {
            enqueue(&repo, &format!("evt-{idx}"), base()).await;
        }

        let mut tasks = Vec::new();
        for worker in 0..4 {
            let repo = db.events();
            tasks.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                loop {
                    let batch = repo
                        .lease(&format!("worker-{worker}"), 3, LEASE, base())
                        .await
                        .expect("lease");
                    if batch.events.is_empty() {
                        break;
                    }
                    claimed.extend(batch.events.into_iter().map(|leased| leased.event.id));
                }
                claimed
            }));
        }

        let mut seen = HashSet::new();
        let mut total = 0;
        for task in tasks {
            for id in task.await.expect("join") {
                total += 1;
                assert!(seen.insert(id.clone()), "{id} leased twice");
            }
        }
        assert_eq!(total, 20);
    }

    #[tokio::test]
    async fn retry_reschedules_with_incremented_attempts() {
        let (db, _dir) = setup_db().await;
        let repo = db.events();
        enqueue(&repo, "evt-retry", base()).await;

        let leased = repo
            .lease("worker-1", 1, LEASE, base())
            .await
            .expect("lease")
            .events
            .remove(0);
        let event = repo
            .complete(
                &leased.lease,
                &Transition::Retry {
                    available_at: base() + secs(10),
                    reason: "downstream 503".to_string(),
                },
                base() + secs(1),
            )
            .await
            .expect("complete");
        assert_eq!(event.state, EventState::Pending);
        assert_eq!(event.attempt_count, 1);
        assert_eq!(event.last_error.as_deref(), Some("downstream 503"));
        assert!(event.lease_owner.is_none());

        let early = repo
            .lease("worker-1", 1, LEASE, base() + secs(5))
            .await
            .expect("lease");
        assert!(early.events.is_empty());

        let later = repo
            .lease("worker-1", 1, LEASE, base() + secs(10))
            .await
            .expect("lease");
        assert_eq!(later.events.len(), 1);
        assert_eq!(later.events[0].event.attempt_count, 1);
    }

    #[tokio::test]
    async fn dead_lettered_events_are_terminal() {
        let (db, _dir) = setup_db().await;
        let repo = db.events();
        enqueue(&repo, "evt-dead", base()).await;

        let leased = repo
            .lease("worker-1", 1, LEASE, base())
            .await
            .expect("lease")
            .events
            .remove(0);
        let event = repo
            .complete(
                &leased.lease,
                &Transition::DeadLetter {
                    reason: "permanent failure: 400".to_string(),
                },
                base() + secs(1),
            )
            .await
            .expect("complete");
        assert_eq!(event.state, EventState::DeadLettered);
        assert_eq!(event.attempt_count, 1);

        let batch = repo
            .lease("worker-1", 1, LEASE, base() + secs(3600))
            .await
            .expect("lease");
        assert!(batch.events.is_empty());

        let err = repo
            .complete(&leased.lease, &Transition::Succeeded, base() + secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::LeaseLost { .. }));
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed_and_stale_completion_rejected() {
        let (db, _dir) = setup_db().await;
        let repo = db.events();
        enqueue(&repo, "evt-crash", base()).await;

        let stale = repo
            .lease("worker-crashed", 1, LEASE, base())
            .await
            .expect("lease")
            .events
            .remove(0);

        let not_yet = repo
            .lease("worker-2", 1, LEASE, base() + secs(29))
            .await
            .expect("lease");
        assert_eq!(not_yet.reclaimed, 0);
        assert!(not_yet.events.is_empty());

        let recovered = repo
            .lease("worker-2", 1, LEASE, base() + secs(30))
            .await
            .expect("lease");
        assert_eq!(recovered.reclaimed, 1);
        assert_eq!(recovered.events.len(), 1);
        let fresh = &recovered.events[0];
        assert_eq!(fresh.event.attempt_count, 0);
        assert_ne!(fresh.lease.token, stale.lease.token);

        let err = repo
            .complete(&stale.lease, &Transition::Succeeded, base() + secs(31))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::LeaseLost { ref event_id } if event_id == "evt-crash"));

        let done = repo
            .complete(&fresh.lease, &Transition::Succeeded, base() + secs(32))
            .await
            .expect("complete");
        assert_eq!(done.state, EventState::Succeeded);
        assert_eq!(done.attempt_count, 1);
        assert!(done.last_error.is_none());
    }

    #[tokio::test]
    async fn renew_extends_only_held_leases() {
        let (db, _dir) = setup_db().await;
        let repo = db.events();
        enqueue(&repo, "evt-renew", base()).await;

        let leased = repo
            .lease("worker-1", 1, LEASE, base())
            .await
            .expect("lease")
            .events
            .remove(0);
        let renewed = repo
            .renew(&leased.lease, LEASE, base() + secs(20))
            .await
            .expect("renew");
        assert_eq!(renewed.expires_at, base() + secs(50));

        let batch = repo
            .lease("worker-2", 1, LEASE, base() + secs(40))
            .await
            .expect("lease");
        assert!(batch.events.is_empty(), "renewed lease must not be reclaimed");

        let forged = Lease {
            token: "not-the-token".to_string(),
            ..renewed
        };
        let err = repo
            .renew(&forged, LEASE, base() + secs(41))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::LeaseLost { .. }));
    }

    #[tokio::test]
    async fn reclaim_and_release_return_events_to_pending() {
        let (db, _dir) = setup_db().await;
        let repo = db.events();
        for id in ["x", "y", "z"] {
            enqueue(&repo, id, base()).await;
        }
        repo.lease("node-a/worker-0", 1, LEASE, base())
            .await
            .expect("lease");
        repo.lease("node-a/worker-1", 1, LEASE, base())
            .await
            .expect("lease");
        repo.lease("node-b/worker-0", 1, LEASE, base())
            .await
            .expect("lease");

        let released = repo
            .release_owned("node-a/", base() + secs(1))
            .await
            .expect("release");
        assert_eq!(released, 2);

        let counts = repo.count_by_state().await.expect("counts");
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.in_flight, 1);

        let reclaimed = repo
            .reclaim_expired(base() + secs(60))
            .await
            .expect("reclaim");
        assert_eq!(reclaimed, 1);
        let counts = repo.count_by_state().await.expect("counts");
        assert_eq!(counts.pending, 3);
        assert_eq!(counts.queue_depth(), 3);

        let z = repo.fetch("z").await.expect("fetch").expect("row");
        assert_eq!(z.attempt_count, 0);
        assert!(z.lease_owner.is_none());
        assert!(z.lease_expires_at.is_none());
    }

    #[tokio::test]
    async fn list_filters_by_state_newest_first() {
        let (db, _dir) = setup_db().await;
        let repo = db.events();
        for id in ["one", "two", "three"] {
            enqueue(&repo, id, base()).await;
        }
        let leased = repo
            .lease("worker-1", 1, LEASE, base())
            .await
            .expect("lease")
            .events
            .remove(0);
        repo.complete(&leased.lease, &Transition::Succeeded, base() + secs(5))
            .await
            .expect("complete");

        let all = repo.list(None, 10).await.expect("list");
        let ids: Vec<_> = all.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["three", "two", "one"]);

        let pending = repo
            .list(Some(EventState::Pending), 1)
            .await
            .expect("list pending");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "three");

        let succeeded = repo
            .list(Some(EventState::Succeeded), 10)
            .await
            .expect("list succeeded");
        assert_eq!(succeeded.len(), 1);
        assert_eq!(succeeded[0].id, "one");

        let recent = repo.list_recent(2).await.expect("recent");
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, "one");
        assert_eq!(recent[0].state, EventState::Succeeded);
    }

    #[tokio::test]
    async fn deletes_only_old_succeeded_rows() {
        let (db, _dir) = setup_db().await;
        let repo = db.events();
        for id in ["old", "new", "pending"] {
            enqueue(&repo, id, base()).await;
        }
        let batch = repo
            .lease("worker-1", 2, LEASE, base())
            .await
            .expect("lease");
        repo.complete(&batch.events[0].lease, &Transition::Succeeded, base())
            .await
            .expect("complete old");
        repo.complete(
            &batch.events[1].lease,
            &Transition::Succeeded,
            base() + secs(7200),
        )
        .await
        .expect("complete new");

        let deleted = repo
            .delete_succeeded_older_than_batch(base() + secs(3600), 100)
            .await
            .expect("delete");
        assert_eq!(deleted, 1);
        assert!(repo.fetch("old").await.expect("fetch").is_none());
        assert!(repo.fetch("new").await.expect("fetch").is_some());
        assert!(repo.fetch("pending").await.expect("fetch").is_some());
    }

    #[tokio::test]
    async fn closed_pool_reports_storage_unavailable() {
        let (db, _dir) = setup_db().await;
        db.close().await;

        let err = db
            .events()
            .enqueue(NewEvent {
                id: Cow::Borrowed("evt-closed"),
                received_at: base(),
                raw_payload: b"{}",
                content_type: None,
                signature_valid: true,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::StorageUnavailable(_)));
    }

    #[tokio::test]
    async fn wal_checkpoint_reports_frames() {
        let (db, _dir) = setup_db().await;
        enqueue(&db.events(), "evt-wal", base()).await;

        let stats = db.wal_checkpoint_truncate().await.expect("checkpoint");
        assert_eq!(stats.busy_frames, 0);
        assert!(stats.log_frames >= 0);
    }
}
