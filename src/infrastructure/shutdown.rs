//! Background Task Lifecycle
//!
//! Owns the periodic maintenance tasks (cache sweep, alert evaluation)
//! and coordinates their graceful shutdown.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Shutdown coordinator for background tasks.
///
/// Cloning is cheap; every clone observes and triggers the same shutdown.
#[derive(Clone)]
pub struct ShutdownController {
    /// Whether shutdown has been initiated
    shutdown_initiated: Arc<AtomicBool>,
    /// Broadcast channel for shutdown signal
    shutdown_tx: broadcast::Sender<()>,
    /// Handles of every task spawned through this controller
    tasks: Arc<Mutex<Vec<(String, JoinHandle<()>)>>>,
}

impl ShutdownController {
    /// Create a new shutdown controller.
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shutdown_initiated: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Subscribe to shutdown notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Initiate graceful shutdown.
    pub fn shutdown(&self) {
        if !self.shutdown_initiated.swap(true, Ordering::SeqCst) {
            tracing::info!("initiating graceful shutdown");
            let _ = self.shutdown_tx.send(());
        }
    }

    /// Check if shutdown has been initiated.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown_initiated.load(Ordering::SeqCst)
    }

    /// Number of spawned tasks that have not finished yet.
    pub fn running_tasks(&self) -> usize {
        self.tasks
            .lock()
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .count()
    }

    /// Run `tick` every `period` until shutdown is requested.
    ///
    /// The first tick fires one full period after spawning. Each tick runs
    /// as its own task; a tick that returns an error or panics is logged
    /// and the loop keeps going.
    pub fn spawn_periodic<F, Fut>(&self, name: impl Into<String>, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        let task_name = name.clone();
        // Subscribe before checking the flag so a concurrent shutdown is never missed
        let mut shutdown_rx = self.subscribe();
        let controller = self.clone();
        let period = period.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            if controller.is_shutdown() {
                return;
            }

            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;

            tracing::info!(task = %task_name, period_ms = period.as_millis() as u64, "periodic task started");

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = interval.tick() => {
                        match tokio::spawn(tick()).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                tracing::error!(task = %task_name, error = %e, "periodic task tick failed");
                            }
                            Err(e) if e.is_panic() => {
                                tracing::error!(task = %task_name, error = %e, "periodic task tick panicked");
                            }
                            Err(e) => {
                                tracing::warn!(task = %task_name, error = %e, "periodic task tick cancelled");
                            }
                        }
                    }
                }
            }

            tracing::info!(task = %task_name, "periodic task stopped");
        });

        self.tasks.lock().push((name, handle));
    }

    /// Wait for every spawned task to finish (with timeout).
    ///
    /// Returns false if some task was still running when the timeout hit.
    pub async fn join(&self, timeout: Duration) -> bool {
        let handles: Vec<(String, JoinHandle<()>)> = std::mem::take(&mut *self.tasks.lock());
        if handles.is_empty() {
            return true;
        }

        let drain = async {
            for (name, handle) in handles {
                if let Err(e) = handle.await {
                    tracing::error!(task = %name, error = %e, "periodic task aborted");
                }
            }
        };

        match tokio::time::timeout(timeout, drain).await {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!("drain timeout: background tasks still running");
                false
            }
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Install signal handlers for graceful shutdown.
///
/// Returns a future that completes when a shutdown signal is received.
#[cfg_attr(coverage_nightly, coverage(off))]
pub async fn shutdown_signal(controller: ShutdownController) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("received SIGTERM, initiating shutdown");
        }
    }

    controller.shutdown();
}
