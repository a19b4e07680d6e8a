//! Service lifecycle: a common trait for long-running components and a
//! manager that runs them until the first exit, then shuts the rest down.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How a managed service ended.
#[derive(Debug)]
pub enum ServiceResult {
    GracefulShutdown,
    /// `run` returned `Ok` without being asked to stop.
    NormalCompletion,
    Error(anyhow::Error),
}

/// Common trait for all long-running services in the process.
#[async_trait::async_trait]
pub trait Service: Send + Sync {
    /// The name of the service for logging.
    fn name(&self) -> &'static str;

    /// Run the service's main work loop.
    async fn run(&mut self) -> Result<(), anyhow::Error>;

    /// Ask the service to stop; `run` should return shortly after.
    async fn shutdown(&mut self) -> Result<(), anyhow::Error>;
}

/// Drives one service's lifecycle: races its work loop against the shutdown
/// broadcast and reports how it ended.
async fn run_service(
    mut service: Box<dyn Service>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> ServiceResult {
    let name = service.name();
    info!(service = name, "service started");

    let work = async {
        match service.run().await {
            Ok(()) => {
                warn!(service = name, "service completed unexpectedly");
                ServiceResult::NormalCompletion
            }
            Err(e) => {
                error!(service = name, error = ?e, "service failed");
                ServiceResult::Error(e)
            }
        }
    };

    tokio::select! {
        result = work => result,
        _ = shutdown_rx.recv() => {
            let started = std::time::Instant::now();
            match service.shutdown().await {
                Ok(()) => {
                    debug!(service = name, elapsed = ?started.elapsed(), "service shutdown complete");
                    ServiceResult::GracefulShutdown
                }
                Err(e) => {
                    error!(service = name, error = ?e, "service shutdown failed");
                    ServiceResult::Error(e)
                }
            }
        }
    }
}

/// Owns the set of running services and their shutdown channel.
pub struct ServiceManager {
    registered: Vec<(String, Box<dyn Service>)>,
    running: HashMap<String, JoinHandle<ServiceResult>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Default for ServiceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceManager {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            registered: Vec::new(),
            running: HashMap::new(),
            shutdown_tx,
        }
    }

    /// Register a service to be managed (not yet spawned).
    pub fn register(&mut self, service: Box<dyn Service>) {
        self.registered.push((service.name().to_string(), service));
    }

    /// Spawn all registered services.
    pub fn spawn_all(&mut self) {
        let names: Vec<String> = self.registered.iter().map(|(n, _)| n.clone()).collect();
        for (name, service) in self.registered.drain(..) {
            let shutdown_rx = self.shutdown_tx.subscribe();
            let handle = tokio::spawn(run_service(service, shutdown_rx));
            self.running.insert(name, handle);
        }
        info!(services = ?names, "spawned {} services", names.len());
    }

    /// Wait until any service completes and return its name and result.
    pub async fn run(&mut self) -> (String, ServiceResult) {
        if self.running.is_empty() {
            return (
                "none".to_string(),
                ServiceResult::Error(anyhow::anyhow!("no services to run")),
            );
        }

        let (names, handles): (Vec<String>, Vec<JoinHandle<ServiceResult>>) =
            self.running.drain().unzip();

        let (result, index, rest) = futures::future::select_all(handles).await;
        for (name, handle) in names
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != index)
            .map(|(_, n)| n)
            .zip(rest)
        {
            self.running.insert(name.clone(), handle);
        }

        let name = names[index].clone();
        match result {
            Ok(result) => (name, result),
            Err(e) => {
                error!(service = name, error = ?e, "service task panicked");
                (
                    name,
                    ServiceResult::Error(anyhow::anyhow!("task panic: {e}")),
                )
            }
        }
    }

    /// Broadcast shutdown and wait for all remaining services.
    ///
    /// Returns elapsed time on success, or the names of services that did
    /// not stop within the timeout.
    pub async fn shutdown(&mut self, timeout: Duration) -> Result<Duration, Vec<String>> {
        let names: Vec<String> = self.running.keys().cloned().collect();
        info!(services = ?names, ?timeout, "shutting down {} services", names.len());

        let _ = self.shutdown_tx.send(());

        let started = std::time::Instant::now();
        let mut pending = Vec::new();

        for (name, handle) in self.running.drain() {
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(_)) => debug!(service = name, "service stopped"),
                Ok(Err(e)) => {
                    warn!(service = name, error = ?e, "service task failed during shutdown");
                    pending.push(name);
                }
                Err(_) => {
                    warn!(service = name, "service shutdown timed out");
                    pending.push(name);
                }
            }
        }

        let elapsed = started.elapsed();
        if pending.is_empty() {
            info!(elapsed = ?elapsed, "all services stopped");
            Ok(elapsed)
        } else {
            Err(pending)
        }
    }
}
