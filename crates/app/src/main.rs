mod dispatch;
mod handler;
mod maintenance;
mod problem;
mod router;
mod status;
mod tap;
mod telemetry;
#[cfg(test)]
mod testing;
mod webhook;

use std::{net::SocketAddr, sync::Arc};

use hookrelay_core::{DedupeStore, MemoryDedupeStore, StatusRegistry};
use hookrelay_storage::Database;
use hookrelay_util::{load_env_file, AppConfig};
use tokio::sync::Notify;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let env_file = load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;
    if let Some(path) = env_file {
        info!(stage = "app", path = %path.display(), "loaded environment file");
    }

    let tap_hub = tap::TapHub::new();
    if config.environment.is_development() {
        tap_hub.spawn_heartbeat();
    }

    let ingress = webhook::IngressSettings::from_config(&config.webhook)?;
    if !ingress.has_secret() {
        warn!(
            stage = "ingress",
            "WEBHOOK_SECRET is not set; every webhook request will be rejected"
        );
    }

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;

    let status = Arc::new(StatusRegistry::new(config.status_recent_events));
    status::restore_status(&database, &status, config.status_recent_events).await?;

    let dedupe: Arc<dyn DedupeStore> = Arc::new(MemoryDedupeStore::new(config.webhook.dedupe_ttl));
    let dispatch_signal = Arc::new(Notify::new());

    let state = router::AppState::new(
        metrics,
        tap_hub.clone(),
        database.clone(),
        Arc::clone(&dedupe),
        Arc::clone(&status),
        ingress,
        Arc::clone(&dispatch_signal),
    );

    let downstream = handler::Downstream::from_config(&config)?;
    info!(stage = "dispatch", handler = downstream.name(), "downstream handler selected");
    let dispatch = dispatch::DispatchPool::new(
        database.clone(),
        downstream,
        dispatch::DispatchSettings::from(&config.dispatch),
        Arc::clone(&status),
        tap_hub.clone(),
        dispatch_signal,
    )
    .spawn();

    let maintenance = maintenance::MaintenanceWorker::new(
        database.clone(),
        dedupe,
        status,
        tap_hub,
        config.succeeded_retention,
    )
    .spawn();

    let addr: SocketAddr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let served = axum::serve(listener, router::app_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    info!(stage = "app", "HTTP server stopped; draining dispatch workers");
    let report = dispatch.shutdown(config.shutdown_grace).await;
    maintenance.abort();
    database.close().await;

    served?;
    let report = report?;
    info!(
        stage = "app",
        drained = report.drained,
        aborted = report.aborted,
        released = report.released,
        "shutdown complete"
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(stage = "app", error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(stage = "app", error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!(stage = "app", "shutdown signal received");
}
