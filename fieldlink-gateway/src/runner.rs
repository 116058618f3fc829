//! Task lifecycle for the gateway process.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Owns the gateway's long-running tasks and their shutdown signal.
///
/// Tasks receive a `watch::Receiver<bool>` from [`GatewayRunner::shutdown_signal`]
/// and stop once it turns `true`. Whatever is still running after the
/// grace period is aborted.
pub struct GatewayRunner {
    name: String,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    grace: Duration,
}

impl GatewayRunner {
    pub fn new(name: impl Into<String>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            name: name.into(),
            shutdown_tx,
            tasks: Vec::new(),
            grace: Duration::from_secs(5),
        }
    }

    /// Set how long tasks get to finish after shutdown is signalled.
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// A receiver that flips to `true` on shutdown.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Spawn a tracked task.
    pub fn spawn<F>(&mut self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.push(tokio::spawn(future));
    }

    /// Run until Ctrl+C or SIGTERM.
    pub async fn run(self) {
        self.run_until(wait_for_signal()).await
    }

    /// Run until `stop` completes, then shut the tasks down.
    pub async fn run_until<F>(self, stop: F)
    where
        F: Future<Output = ()>,
    {
        tracing::info!(gateway = %self.name, tasks = self.tasks.len(), "Gateway running");
        stop.await;
        self.shutdown().await;
    }

    async fn shutdown(self) {
        tracing::info!(gateway = %self.name, "Shutting down");
        self.shutdown_tx.send_replace(true);

        let deadline = tokio::time::Instant::now() + self.grace;
        for mut task in self.tasks {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                tracing::warn!("Task did not stop in time, aborting");
                task.abort();
            }
        }

        tracing::info!(gateway = %self.name, "Goodbye!");
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => tracing::info!("Received Ctrl+C"),
                    _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for SIGTERM");
                ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    ctrl_c().await;
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    tracing::info!("Received Ctrl+C");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_tasks_see_shutdown() {
        let mut runner = GatewayRunner::new("test");
        let stopped = Arc::new(AtomicBool::new(false));

        let mut shutdown = runner.shutdown_signal();
        let flag = stopped.clone();
        runner.spawn(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
            flag.store(true, Ordering::SeqCst);
        });

        runner.run_until(async {}).await;
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stragglers_are_aborted() {
        let mut runner = GatewayRunner::new("test").with_grace_period(Duration::from_secs(1));
        runner.spawn(std::future::pending());
        runner.spawn(async {});

        let started = tokio::time::Instant::now();
        runner.run_until(async {}).await;
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
