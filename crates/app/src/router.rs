use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{sse::Sse, IntoResponse},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use hookrelay_core::{DedupeStore, StatusRegistry};
use hookrelay_storage::Database;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use tokio::sync::Notify;

use crate::tap::{parse_stage_list, tap_keep_alive, tap_stream, TapFilter, TapHub};
use crate::webhook::IngressSettings;
use crate::{status, telemetry, webhook};

/// Source of the current time, injectable for tests.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    tap: TapHub,
    storage: Database,
    dedupe: Arc<dyn DedupeStore>,
    status: Arc<StatusRegistry>,
    ingress: Arc<IngressSettings>,
    dispatch_signal: Arc<Notify>,
    clock: Clock,
}

impl AppState {
    pub fn new(
        metrics: PrometheusHandle,
        tap: TapHub,
        storage: Database,
        dedupe: Arc<dyn DedupeStore>,
        status: Arc<StatusRegistry>,
        ingress: IngressSettings,
        dispatch_signal: Arc<Notify>,
    ) -> Self {
        Self {
            metrics,
            tap,
            storage,
            dedupe,
            status,
            ingress: Arc::new(ingress),
            dispatch_signal,
            clock: Arc::new(Utc::now),
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn tap(&self) -> &TapHub {
        &self.tap
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }

    pub fn dedupe(&self) -> &Arc<dyn DedupeStore> {
        &self.dedupe
    }

    pub fn status(&self) -> &Arc<StatusRegistry> {
        &self.status
    }

    pub fn ingress(&self) -> &IngressSettings {
        &self.ingress
    }

    /// Wakes one idle dispatch worker.
    pub fn notify_dispatch(&self) {
        self.dispatch_signal.notify_one();
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }
}

pub fn app_router(state: AppState) -> Router {
    let webhook_path = state.ingress().path().to_string();
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/status", get(status::get_status))
        .route("/events", get(status::list_events))
        .route("/events/:id", get(status::get_event))
        .route("/_debug/tap", get(debug_tap))
        .route(&webhook_path, post(webhook::handle))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::render_metrics(state.metrics());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

#[derive(Debug, Deserialize)]
struct TapQuery {
    #[serde(default)]
    s: Option<String>,
}

async fn debug_tap(
    State(state): State<AppState>,
    Query(query): Query<TapQuery>,
) -> Result<
    Sse<impl tokio_stream::Stream<Item = Result<axum::response::sse::Event, serde_json::Error>>>,
    (StatusCode, String),
> {
    let stages = parse_stage_list(query.s).map_err(|err| (StatusCode::BAD_REQUEST, err))?;
    let filter = TapFilter::from_stages(stages);
    let stream = tap_stream(state.tap().clone(), filter);

    Ok(Sse::new(stream).keep_alive(tap_keep_alive()))
}
