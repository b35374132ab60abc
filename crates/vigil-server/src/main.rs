//! # Vigil Server
//!
//! Runs the describe scheduler, the compliance runner publisher, the
//! sweepers and the result consumers until SIGINT or SIGTERM.

use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use vigil_config::{AppConfig, ConfigLoader};
use vigil_core::telemetry::{init_telemetry, shutdown_telemetry};
use vigil_core::{HealthCheck, VigilError, VigilResult};
use vigil_repository::create_pool;
use vigil_server::app::build_runtime;
use vigil_server::di::{build_scheduler_module, SchedulerModuleExt};
use vigil_server::health::{run_checks, JobStoreHealth, WorkQueueHealth};
use vigil_server::startup::{print_banner, print_startup_info};

/// Time the loops get to finish their current iteration on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Application error: {}", e);
        eprintln!("vigil-server: {e}");
        std::process::exit(1);
    }
}

async fn run() -> VigilResult<()> {
    let config = ConfigLoader::from_default_location()?.get().await;

    init_telemetry(&config.telemetry.telemetry_config(&config.app.name))?;
    print_banner();
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    install_metrics_exporter(&config)?;

    let db_pool = create_pool(&config.database).await?;
    if config.database.run_migrations {
        vigil_repository::DatabasePoolInterface::run_migrations(db_pool.as_ref()).await?;
    }
    let redis_pool = Arc::new(vigil_queue::create_pool(&config.redis).await?);

    let module = build_scheduler_module(&db_pool, Arc::clone(&redis_pool), &config.queue);

    let checks: Vec<Box<dyn HealthCheck>> = vec![
        Box::new(JobStoreHealth::new(module.database_pool())),
        Box::new(WorkQueueHealth::new(module.work_queue())),
    ];
    let unhealthy = run_checks(&checks).await;
    if !unhealthy.is_empty() {
        return Err(VigilError::Configuration(format!(
            "unhealthy dependencies at startup: {}",
            unhealthy.join(", ")
        )));
    }

    let runtime = build_runtime(&config, &module, redis_pool)?;
    print_startup_info(runtime.instance_id(), &config);
    let handles = runtime.start().await?;

    shutdown_signal().await;
    runtime.stop();

    if tokio::time::timeout(SHUTDOWN_GRACE, futures::future::join_all(handles))
        .await
        .is_err()
    {
        warn!(grace_secs = SHUTDOWN_GRACE.as_secs(), "Scheduler loops did not stop in time");
    }

    module.database_pool().close().await;
    shutdown_telemetry();
    info!("Scheduler shutdown complete");
    Ok(())
}

fn install_metrics_exporter(config: &AppConfig) -> VigilResult<()> {
    let addr: SocketAddr = config.telemetry.metrics_addr.parse().map_err(|e| {
        VigilError::Configuration(format!(
            "invalid metrics address {}: {e}",
            config.telemetry.metrics_addr
        ))
    })?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| VigilError::internal(format!("Failed to install Prometheus exporter: {e}")))?;

    vigil_queue::register_metrics();
    vigil_scheduler::register_metrics();
    info!(%addr, "Prometheus exporter listening");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        () = terminate => {
            info!("Received terminate signal, initiating graceful shutdown...");
        }
    }
}
