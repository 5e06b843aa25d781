use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::Instant;

use metrics::{describe_counter, describe_gauge, describe_histogram, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use thiserror::Error;
use tracing_subscriber::{
    fmt::{self as tracing_fmt, time::UtcTime},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter,
};

use hookrelay_util::{AppConfig, Environment};

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to initialize tracing: {0}")]
    Tracing(#[from] TryInitError),
    #[error("failed to initialize prometheus recorder: {0}")]
    Metrics(#[from] BuildError),
}

const BUILD_VERSION: &str = env!("CARGO_PKG_VERSION");

const COUNTERS: &[(&str, &str)] = &[
    ("webhook_requests_total", "Webhook requests handled, labelled by result"),
    ("dispatch_attempts_total", "Handler attempts, labelled by handler outcome"),
    ("dispatch_transitions_total", "Completed attempts, labelled by resulting transition"),
    ("dispatch_lease_lost_total", "Attempts whose lease was reclaimed before completion"),
    ("leases_reclaimed_total", "Expired leases returned to pending"),
    ("dedupe_swept_total", "Expired dedupe entries evicted by maintenance"),
    ("db_ttl_deleted_total", "Rows deleted by TTL sweeps, labelled by table"),
    ("db_busy_total", "SQLite busy conditions, labelled by operation"),
];

const GAUGES: &[(&str, &str)] = &[
    ("app_build_info", "Build metadata for the running binary"),
    ("app_uptime_seconds", "Seconds since the process started"),
    ("queue_depth", "Events waiting for a terminal state"),
];

const HISTOGRAMS: &[(&str, &str)] = &[
    ("webhook_ack_latency_seconds", "Seconds to acknowledge a webhook, labelled by result"),
    ("dispatch_handler_seconds", "Duration of downstream handler invocations in seconds"),
    ("db_checkpoint_seconds", "Duration of WAL checkpoint operations in seconds"),
];

static TRACING_INIT: OnceLock<()> = OnceLock::new();
static METRICS_HANDLE: Mutex<Option<PrometheusHandle>> = Mutex::new(None);
static START_TIME: OnceLock<Instant> = OnceLock::new();

fn build_git_sha() -> &'static str {
    option_env!("GIT_SHA").unwrap_or("unknown")
}

/// Installs the global subscriber: pretty output outside production, JSON lines in it.
pub fn init_tracing(config: &AppConfig) -> Result<(), TelemetryError> {
    if TRACING_INIT.get().is_some() {
        return Ok(());
    }

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = matches!(config.environment, Environment::Production);
    let pretty_layer = (!json).then(|| {
        tracing_fmt::layer()
            .with_target(false)
            .with_timer(UtcTime::rfc_3339())
            .pretty()
    });
    let json_layer = json.then(|| {
        tracing_fmt::layer()
            .with_target(false)
            .with_timer(UtcTime::rfc_3339())
            .json()
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(pretty_layer)
        .with(json_layer)
        .try_init()?;

    TRACING_INIT.set(()).ok();
    tracing::info!(
        stage = "telemetry",
        env = %config.environment.as_str(),
        version = BUILD_VERSION,
        git_sha = build_git_sha(),
        "tracing initialized"
    );
    Ok(())
}

/// Installs the Prometheus recorder once and returns its handle.
pub fn init_metrics() -> Result<PrometheusHandle, TelemetryError> {
    let mut slot = METRICS_HANDLE.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(handle) = slot.as_ref() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    describe_metrics();
    START_TIME.get_or_init(Instant::now);
    *slot = Some(handle.clone());
    Ok(handle)
}

fn describe_metrics() {
    for &(name, help) in COUNTERS {
        describe_counter!(name, help);
    }
    for &(name, help) in GAUGES {
        describe_gauge!(name, help);
    }
    for &(name, help) in HISTOGRAMS {
        describe_histogram!(name, help);
    }
}

/// Refreshes the process gauges and renders the exposition text.
pub fn render_metrics(handle: &PrometheusHandle) -> String {
    gauge!("app_build_info", "version" => BUILD_VERSION, "git" => build_git_sha()).set(1.0);
    let uptime = START_TIME
        .get()
        .map(|start| start.elapsed().as_secs_f64())
        .unwrap_or_default();
    gauge!("app_uptime_seconds").set(uptime);

    handle.render()
}
