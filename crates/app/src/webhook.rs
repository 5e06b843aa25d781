use std::{borrow::Cow, sync::Arc, time::Duration, time::Instant};

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, HeaderName, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use hookrelay_core::{
    resolve_event_id, signature, DedupeDecision, DedupeStore, SignatureAlgorithm,
};
use hookrelay_storage::{EnqueueOutcome, NewEvent};
use hookrelay_util::WebhookConfig;

use crate::problem::ProblemResponse;
use crate::router::AppState;
use crate::tap::{StageEvent, StageKind, StageMetadata, StagePayload};

const RETRY_AFTER_SECS: u64 = 5;

/// Resolved settings for the ingestion endpoint.
#[derive(Clone)]
pub struct IngressSettings {
    path: String,
    secret: Option<Arc<[u8]>>,
    signature_header: HeaderName,
    algorithm: SignatureAlgorithm,
    id_header: HeaderName,
    id_bucket: Duration,
}

impl IngressSettings {
    pub fn from_config(config: &WebhookConfig) -> Result<Self, IngressConfigError> {
        let algorithm = SignatureAlgorithm::from_name(&config.signature_algorithm)
            .ok_or_else(|| IngressConfigError::UnknownAlgorithm(config.signature_algorithm.clone()))?;
        Ok(Self {
            path: config.path.clone(),
            secret: config
                .secret
                .as_ref()
                .map(|secret| Arc::from(secret.clone().into_boxed_slice())),
            signature_header: header_name(&config.signature_header)?,
            algorithm,
            id_header: header_name(&config.id_header)?,
            id_bucket: config.id_bucket,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn has_secret(&self) -> bool {
        self.secret.as_ref().is_some_and(|secret| !secret.is_empty())
    }
}

fn header_name(value: &str) -> Result<HeaderName, IngressConfigError> {
    HeaderName::from_bytes(value.as_bytes())
        .map_err(|_| IngressConfigError::InvalidHeader(value.to_string()))
}

#[derive(Debug, Error)]
pub enum IngressConfigError {
    #[error("invalid header name '{0}'")]
    InvalidHeader(String),
    #[error("unsupported signature algorithm '{0}'")]
    UnknownAlgorithm(String),
}

#[derive(Debug, Serialize)]
struct IngestResponse {
    status: &'static str,
    event_id: String,
}

/// Outcome label shared by metrics, logs and the tap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IngestResult {
    Accepted,
    Duplicate,
    InvalidSignature,
    Malformed,
    Unavailable,
}

impl IngestResult {
    fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Duplicate => "duplicate",
            Self::InvalidSignature => "invalid_signature",
            Self::Malformed => "malformed",
            Self::Unavailable => "unavailable",
        }
    }
}

/// `POST {webhook_path}`: verify, deduplicate, persist, acknowledge.
///
/// The acknowledgement is only sent after the event is durable; handlers run
/// later on the dispatch pool.
pub async fn handle(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProblemResponse> {
    let start = Instant::now();
    let received_at = state.now();
    let settings = state.ingress();

    let provided = headers
        .get(&settings.signature_header)
        .and_then(|value| value.to_str().ok());
    if !signature::verify(
        &body,
        provided,
        settings.secret.as_deref(),
        settings.algorithm,
    ) {
        state.status().record_invalid_signature();
        warn!(
            stage = "ingress",
            size_bytes = body.len(),
            signature_present = provided.is_some(),
            "rejected webhook with invalid signature"
        );
        let ctx = TapPublish::new(&state, received_at, start, body.len());
        return Err(ctx.reject(
            IngestResult::InvalidSignature,
            ProblemResponse::new(
                StatusCode::UNAUTHORIZED,
                "invalid_signature",
                "signature verification failed",
            ),
        ));
    }

    let ctx = TapPublish::new(&state, received_at, start, body.len());
    if body.is_empty() {
        return Err(ctx.reject(
            IngestResult::Malformed,
            ProblemResponse::new(
                StatusCode::BAD_REQUEST,
                "empty_payload",
                "request body must not be empty",
            ),
        ));
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let payload = if is_json(content_type.as_deref()) {
        match serde_json::from_slice::<Value>(&body) {
            Ok(value) => Some(value),
            Err(err) => {
                return Err(ctx.reject(
                    IngestResult::Malformed,
                    ProblemResponse::new(
                        StatusCode::BAD_REQUEST,
                        "invalid_json",
                        format!("failed to parse payload: {err}"),
                    ),
                ));
            }
        }
    } else {
        serde_json::from_slice::<Value>(&body).ok()
    };

    let header_id = match headers.get(&settings.id_header) {
        Some(value) => match value.to_str() {
            Ok(value) => Some(value),
            Err(_) => {
                return Err(ctx.reject(
                    IngestResult::Malformed,
                    ProblemResponse::new(
                        StatusCode::BAD_REQUEST,
                        "invalid_event_id",
                        "event id header must be visible ASCII",
                    ),
                ));
            }
        },
        None => None,
    };
    let identity = resolve_event_id(
        header_id,
        payload.as_ref(),
        &body,
        received_at,
        settings.id_bucket,
    )
    .map_err(|err| {
        ctx.reject(
            IngestResult::Malformed,
            ProblemResponse::new(StatusCode::BAD_REQUEST, "invalid_event_id", err.to_string()),
        )
    })?;
    let event_id = identity.id;
    let ctx = ctx.with_event_id(&event_id);

    let claim = match state.dedupe().check_and_record(&event_id, received_at) {
        DedupeDecision::Fresh => DedupeClaim::new(state.dedupe().as_ref(), &event_id),
        DedupeDecision::Duplicate => {
            debug!(stage = "dedupe", %event_id, "duplicate delivery suppressed");
            return Ok(ctx.duplicate());
        }
        DedupeDecision::InProgress => {
            return confirm_in_progress(&state, &ctx, &event_id).await;
        }
    };

    let outcome = state
        .storage()
        .events()
        .enqueue(NewEvent {
            id: Cow::Borrowed(&event_id),
            received_at,
            raw_payload: &body,
            content_type: content_type.as_deref(),
            signature_valid: true,
        })
        .await;

    match outcome {
        Ok(EnqueueOutcome::Inserted(handle)) => {
            claim.commit();
            state.status().record_accepted(&event_id, received_at);
            state.notify_dispatch();
            info!(
                stage = "queue",
                %event_id,
                seq = handle.seq,
                id_source = identity.source.as_str(),
                size_bytes = body.len(),
                "event accepted"
            );
            ctx.queued(handle.seq);
            Ok(ctx.acknowledge(IngestResult::Accepted))
        }
        Ok(EnqueueOutcome::Duplicate) => {
            claim.commit();
            debug!(stage = "queue", %event_id, "event already queued");
            Ok(ctx.duplicate())
        }
        Err(err) => {
            drop(claim);
            error!(stage = "queue", %event_id, error = %err, "failed to enqueue event");
            Err(ctx.reject(IngestResult::Unavailable, storage_unavailable()))
        }
    }
}

/// Another request owns `event_id` and has not stored it yet. Only answer
/// duplicate once the row is visible; otherwise ask the sender to come back.
async fn confirm_in_progress(
    state: &AppState,
    ctx: &TapPublish<'_>,
    event_id: &str,
) -> Result<Response, ProblemResponse> {
    match state.storage().events().fetch(event_id).await {
        Ok(Some(_)) => {
            debug!(stage = "dedupe", %event_id, "duplicate of a stored event");
            Ok(ctx.duplicate())
        }
        Ok(None) => {
            debug!(stage = "dedupe", %event_id, "duplicate of an event still being stored");
            Err(ctx.reject(IngestResult::Unavailable, storage_unavailable()))
        }
        Err(err) => {
            error!(stage = "dedupe", %event_id, error = %err, "failed to confirm stored event");
            Err(ctx.reject(IngestResult::Unavailable, storage_unavailable()))
        }
    }
}

fn storage_unavailable() -> ProblemResponse {
    ProblemResponse::new(
        StatusCode::SERVICE_UNAVAILABLE,
        "storage_unavailable",
        "event could not be persisted; retry later",
    )
    .with_retry_after(RETRY_AFTER_SECS)
}

/// Ownership of a freshly recorded id. Dropping it without `commit` forgets
/// the id, which also covers a request cancelled mid-enqueue.
struct DedupeClaim<'a> {
    store: &'a dyn DedupeStore,
    event_id: &'a str,
    committed: bool,
}

impl<'a> DedupeClaim<'a> {
    fn new(store: &'a dyn DedupeStore, event_id: &'a str) -> Self {
        Self {
            store,
            event_id,
            committed: false,
        }
    }

    fn commit(mut self) {
        self.store.commit(self.event_id);
        self.committed = true;
    }
}

impl Drop for DedupeClaim<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.store.forget(self.event_id);
        }
    }
}

fn is_json(content_type: Option<&str>) -> bool {
    let Some(content_type) = content_type else {
        return false;
    };
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    essence == "application/json" || essence.ends_with("+json")
}

/// Per-request bookkeeping: metrics, tap event and response for one outcome.
struct TapPublish<'a> {
    state: &'a AppState,
    received_at: DateTime<Utc>,
    start: Instant,
    body_len: usize,
    event_id: Option<&'a str>,
}

impl<'a> TapPublish<'a> {
    fn new(state: &'a AppState, received_at: DateTime<Utc>, start: Instant, body_len: usize) -> Self {
        Self {
            state,
            received_at,
            start,
            body_len,
            event_id: None,
        }
    }

    fn with_event_id(self, event_id: &'a str) -> Self {
        Self {
            event_id: Some(event_id),
            ..self
        }
    }

    fn duplicate(&self) -> Response {
        self.state.status().record_duplicate();
        self.acknowledge(IngestResult::Duplicate)
    }

    fn acknowledge(&self, result: IngestResult) -> Response {
        self.finish(result, StatusCode::OK);
        let body = IngestResponse {
            status: result.as_str(),
            event_id: self.event_id.unwrap_or_default().to_string(),
        };
        (StatusCode::OK, Json(body)).into_response()
    }

    fn queued(&self, seq: i64) {
        let event = StageEvent::new(
            self.received_at,
            StageKind::Queue,
            StageMetadata {
                event_id: self.event_id.map(str::to_string),
                size_bytes: Some(self.body_len as u64),
                ..StageMetadata::default()
            },
        )
        .with_output(json!({ "seq": seq }));
        self.state.tap().publish(event);
    }

    fn reject(&self, result: IngestResult, problem: ProblemResponse) -> ProblemResponse {
        self.finish(result, problem.status());
        problem
    }

    fn finish(&self, result: IngestResult, status: StatusCode) {
        let elapsed = self.start.elapsed().as_secs_f64();
        counter!("webhook_requests_total", "result" => result.as_str()).increment(1);
        histogram!("webhook_ack_latency_seconds", "result" => result.as_str()).record(elapsed);

        let stage = match result {
            IngestResult::Duplicate => StageKind::Dedupe,
            _ => StageKind::Ingress,
        };
        let event = StageEvent::new(
            self.received_at,
            stage,
            StageMetadata {
                event_id: self.event_id.map(str::to_string),
                size_bytes: Some(self.body_len as u64),
                latency_ms: Some(elapsed * 1000.0),
                ..StageMetadata::default()
            },
        )
        .with_input(StagePayload::redacted())
        .with_output(json!({
            "status": status.as_u16(),
            "result": result.as_str(),
        }));
        self.state.tap().publish(event);
    }
}
