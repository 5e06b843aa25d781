use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};

use hookrelay_core::{Event, EventState, EventSummary, StateCounts, StatusRegistry, StatusSnapshot};
use hookrelay_storage::{Database, QueueError};

use crate::problem::ProblemResponse;
use crate::router::AppState;
use crate::tap::{StageEvent, StageKind, StageMetadata};

const DEFAULT_LIST_LIMIT: u32 = 50;
const MAX_LIST_LIMIT: u32 = 500;

/// Seeds the registry from the persisted queue so counters survive restarts.
pub async fn restore_status(
    database: &Database,
    status: &StatusRegistry,
    recent_limit: usize,
) -> Result<StateCounts, QueueError> {
    let events = database.events();
    let counts = events.count_by_state().await?;
    let limit = u32::try_from(recent_limit).unwrap_or(u32::MAX);
    let recent = events.list_recent(limit).await?;
    status.restore(counts, recent);

    info!(
        stage = "status",
        pending = counts.pending,
        in_flight = counts.in_flight,
        succeeded = counts.succeeded,
        dead_lettered = counts.dead_lettered,
        "status registry restored from queue"
    );
    Ok(counts)
}

/// `GET /status`
pub async fn get_status(State(state): State<AppState>) -> Json<StatusSnapshot> {
    let snapshot = state.status().snapshot(state.now());
    state.tap().publish(
        StageEvent::new(state.now(), StageKind::Status, StageMetadata::default()).with_output(
            json!({
                "queue_depth": snapshot.queue_depth,
                "accepted": snapshot.accepted,
            }),
        ),
    );
    Json(snapshot)
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    limit: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct EventList {
    events: Vec<EventSummary>,
}

/// `GET /events?state=&limit=`: newest first.
pub async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<EventList>, ProblemResponse> {
    let filter = match query.state.as_deref().filter(|value| !value.is_empty()) {
        Some(raw) => Some(raw.parse::<EventState>().map_err(|err| {
            ProblemResponse::new(StatusCode::BAD_REQUEST, "invalid_state", err)
        })?),
        None => None,
    };
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);

    let events = state
        .storage()
        .events()
        .list(filter, limit)
        .await
        .map_err(storage_problem)?;

    Ok(Json(EventList {
        events: events.iter().map(Event::summary).collect(),
    }))
}

/// Full event as served by `GET /events/:id`.
#[derive(Debug, Serialize)]
pub struct EventView {
    id: String,
    seq: i64,
    state: EventState,
    attempt_count: u32,
    received_at: DateTime<Utc>,
    available_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content_type: Option<String>,
    signature_valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    lease_owner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    lease_expires_at: Option<DateTime<Utc>>,
    payload_base64: String,
}

impl From<Event> for EventView {
    fn from(event: Event) -> Self {
        Self {
            payload_base64: STANDARD.encode(&event.raw_payload),
            id: event.id,
            seq: event.seq,
            state: event.state,
            attempt_count: event.attempt_count,
            received_at: event.received_at,
            available_at: event.available_at,
            updated_at: event.updated_at,
            content_type: event.content_type,
            signature_valid: event.signature_valid,
            last_error: event.last_error,
            lease_owner: event.lease_owner,
            lease_expires_at: event.lease_expires_at,
        }
    }
}

/// `GET /events/:id`
pub async fn get_event(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> Result<Json<EventView>, ProblemResponse> {
    let event = state
        .storage()
        .events()
        .fetch(&event_id)
        .await
        .map_err(storage_problem)?
        .ok_or_else(|| {
            ProblemResponse::new(
                StatusCode::NOT_FOUND,
                "event_not_found",
                format!("no event with id {event_id}"),
            )
        })?;

    Ok(Json(EventView::from(event)))
}

fn storage_problem(err: QueueError) -> ProblemResponse {
    error!(stage = "status", error = %err, "failed to read events");
    ProblemResponse::new(
        StatusCode::SERVICE_UNAVAILABLE,
        "storage_unavailable",
        "event storage is unavailable",
    )
}
