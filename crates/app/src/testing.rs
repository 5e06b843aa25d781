//! Shared fixtures for handler and worker tests.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hookrelay_core::{signature, MemoryDedupeStore, SignatureAlgorithm, StatusRegistry};
use hookrelay_storage::Database;
use hookrelay_util::WebhookConfig;
use tempfile::TempDir;
use tokio::sync::Notify;

use crate::router::AppState;
use crate::tap::TapHub;
use crate::telemetry;
use crate::webhook::IngressSettings;

pub const SECRET: &[u8] = b"s3cr3t";

pub struct TestApp {
    pub state: AppState,
    pub database: Database,
    pub now: DateTime<Utc>,
    /// Dispatch wake-up shared with `state`.
    pub signal: Arc<Notify>,
    _dir: TempDir,
}

pub fn fixed_now() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).expect("timestamp")
}

/// Opens a migrated database in a fresh temporary directory.
pub async fn temp_database() -> (TempDir, Database) {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = format!("sqlite://{}/queue.db?mode=rwc", dir.path().display());
    let database = Database::connect(&url).await.expect("connect");
    database.run_migrations().await.expect("migrations");
    (dir, database)
}

pub async fn setup() -> TestApp {
    setup_with_secret(Some(SECRET)).await
}

pub async fn setup_with_secret(secret: Option<&[u8]>) -> TestApp {
    let metrics = telemetry::init_metrics().expect("metrics");
    let (dir, database) = temp_database().await;
    let now = fixed_now();

    let ingress = IngressSettings::from_config(&WebhookConfig {
        secret: secret.map(<[u8]>::to_vec),
        ..WebhookConfig::default()
    })
    .expect("ingress settings");

    let signal = Arc::new(Notify::new());
    let state = AppState::new(
        metrics,
        TapHub::new(),
        database.clone(),
        Arc::new(MemoryDedupeStore::new(Duration::from_secs(3_600))),
        Arc::new(StatusRegistry::new(50)),
        ingress,
        Arc::clone(&signal),
    )
    .with_clock(Arc::new(move || now));

    TestApp {
        state,
        database,
        now,
        signal,
        _dir: dir,
    }
}

/// Signature header value for `payload` under [`SECRET`].
pub fn sign(payload: &str) -> String {
    signature::sign(payload.as_bytes(), SECRET, SignatureAlgorithm::HmacSha256)
}
