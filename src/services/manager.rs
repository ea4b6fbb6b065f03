use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::services::{Service, ServiceResult, run_service};

/// Owns the application's services and their lifecycle.
///
/// Services are registered, spawned as tasks, then awaited until the first
/// one exits (which is always unexpected outside of shutdown). Shutdown is
/// broadcast to all of them and bounded by a single shared timeout.
pub struct ServiceManager {
    registered: Vec<(String, Box<dyn Service>)>,
    running: HashMap<String, JoinHandle<ServiceResult>>,
    shutdown_tx: broadcast::Sender<()>,
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

    /// Register a service to be managed (not yet spawned)
    pub fn register_service(&mut self, name: &str, service: Box<dyn Service>) {
        self.registered.push((name.to_string(), service));
    }

    /// Spawn all registered services
    pub fn spawn_all(&mut self) {
        let names: Vec<_> = self.registered.iter().map(|(n, _)| n.clone()).collect();

        for (name, service) in self.registered.drain(..) {
            let shutdown_rx = self.shutdown_tx.subscribe();
            self.running
                .insert(name, tokio::spawn(run_service(service, shutdown_rx)));
        }

        info!(services = ?names, "spawned {} services", names.len());
    }

    /// Wait until the first service exits, returning its name and result.
    pub async fn run(&mut self) -> (String, ServiceResult) {
        if self.running.is_empty() {
            return (
                "none".to_string(),
                ServiceResult::Error(anyhow::anyhow!("No services to run")),
            );
        }

        let (names, handles): (Vec<_>, Vec<_>) = self.running.drain().unzip();
        let (result, index, remaining) = futures::future::select_all(handles).await;

        // Put the still-running services back for shutdown to find.
        for (offset, handle) in remaining.into_iter().enumerate() {
            let name_index = if offset < index { offset } else { offset + 1 };
            self.running.insert(names[name_index].clone(), handle);
        }

        let name = names[index].clone();
        match result {
            Ok(service_result) => (name, service_result),
            Err(e) => (
                name,
                ServiceResult::Error(anyhow::anyhow!("Task panic: {e}")),
            ),
        }
    }

    /// Shutdown all services gracefully with a shared timeout.
    ///
    /// Returns the elapsed duration on success, or the names of services
    /// that failed to stop in time.
    pub async fn shutdown(&mut self, timeout: Duration) -> Result<Duration, Vec<String>> {
        let names: Vec<_> = self.running.keys().cloned().collect();
        info!(
            services = ?names,
            timeout = format!("{:.2?}", timeout),
            "shutting down services"
        );

        let _ = self.shutdown_tx.send(());

        let start_time = std::time::Instant::now();
        let deadline = tokio::time::Instant::now() + timeout;
        let mut pending = Vec::new();

        for (name, handle) in self.running.drain() {
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(_)) => {
                    debug!(service = name, "service shutdown completed");
                }
                Ok(Err(e)) => {
                    warn!(service = name, error = ?e, "service shutdown failed");
                    pending.push(name);
                }
                Err(_) => {
                    warn!(service = name, "service shutdown timed out");
                    pending.push(name);
                }
            }
        }

        let elapsed = start_time.elapsed();
        if pending.is_empty() {
            info!(
                elapsed = format!("{:.2?}", elapsed),
                "services shutdown completed: {}",
                names.join(", ")
            );
            Ok(elapsed)
        } else {
            warn!(
                pending_services = ?pending,
                elapsed = format!("{:.2?}", elapsed),
                "shutdown elapsed with {} service(s) pending",
                pending.len()
            );
            Err(pending)
        }
    }
}

impl Default for ServiceManager {
    fn default() -> Self {
        Self::new()
    }
}
