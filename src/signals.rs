//! Signal handling: SIGTERM/SIGINT graceful shutdown, SIGHUP config reload.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tracing::{error, info, warn};

use crate::services::{ServiceManager, ServiceResult};
use crate::settings::SettingsCache;

/// Run the service manager until a service exits or a shutdown signal
/// arrives, then shut everything down and return the process exit code.
pub async fn handle_shutdown_signals(
    mut service_manager: ServiceManager,
    shutdown_timeout: Duration,
) -> ExitCode {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C signal handler");
        info!("received ctrl+c, gracefully shutting down...");
    };

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm_stream =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM signal handler");
        sigterm_stream.recv().await;
        info!("received SIGTERM, gracefully shutting down...");
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    let mut exit_code = ExitCode::SUCCESS;

    tokio::select! {
        (service_name, result) = service_manager.run() => {
            match result {
                ServiceResult::GracefulShutdown => {
                    info!(service = service_name, "service completed gracefully");
                }
                ServiceResult::NormalCompletion => {
                    warn!(service = service_name, "service completed unexpectedly");
                    exit_code = ExitCode::FAILURE;
                }
                ServiceResult::Error(e) => {
                    error!(service = service_name, error = ?e, "service failed");
                    exit_code = ExitCode::FAILURE;
                }
            }
            exit_code = graceful_shutdown(service_manager, shutdown_timeout, exit_code).await;
        }
        _ = ctrl_c => {
            exit_code = graceful_shutdown(service_manager, shutdown_timeout, ExitCode::SUCCESS).await;
        }
        _ = sigterm => {
            exit_code = graceful_shutdown(service_manager, shutdown_timeout, ExitCode::SUCCESS).await;
        }
    }

    info!(exit_code = ?exit_code, "application shutdown complete");
    exit_code
}

async fn graceful_shutdown(
    mut service_manager: ServiceManager,
    shutdown_timeout: Duration,
    current_exit_code: ExitCode,
) -> ExitCode {
    match service_manager.shutdown(shutdown_timeout).await {
        Ok(elapsed) => {
            info!(elapsed = ?elapsed, "graceful shutdown complete");
            current_exit_code
        }
        Err(pending_services) => {
            warn!(
                pending = ?pending_services,
                "graceful shutdown elapsed with {} service(s) pending",
                pending_services.len()
            );
            ExitCode::FAILURE
        }
    }
}

/// SIGHUP forces an immediate dynamic-config reload. The task runs for the
/// life of the process.
#[cfg(unix)]
pub fn spawn_sighup_reload(settings: Arc<SettingsCache>) {
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};
        let mut stream = match signal(SignalKind::hangup()) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "failed to install SIGHUP handler");
                return;
            }
        };
        while stream.recv().await.is_some() {
            info!("received SIGHUP, reloading dynamic configuration");
            if let Err(e) = settings.load().await {
                warn!(error = %e, "SIGHUP reload failed, keeping last snapshot");
            }
        }
    });
}

#[cfg(not(unix))]
pub fn spawn_sighup_reload(_settings: Arc<SettingsCache>) {}
