//! Graceful shutdown coordination for the long-running background tasks.
//!
//! The health checker, discovery sources and the event applier all subscribe
//! to one watch channel; the manager broadcasts the signal, joins the tasks
//! up to a timeout, and aborts whatever is left. Task panics surface as
//! errors instead of being swallowed.

use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("a background task panicked during shutdown")]
    Panic(#[from] JoinError),
    #[error("graceful shutdown timed out after {0:?}")]
    Timeout(Duration),
}

/// Owns the background tasks and the shutdown signal they watch.
///
/// Dropping the manager aborts everything it spawned; the graceful path is
/// [`ShutdownManager::graceful_shutdown`].
pub struct ShutdownManager {
    tasks: JoinSet<()>,
    shutdown_tx: watch::Sender<()>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(());
        Self { tasks: JoinSet::new(), shutdown_tx }
    }

    /// Spawns a future onto the runtime under this manager's control.
    pub fn spawn_task<F>(&mut self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(task);
    }

    /// A receiver of the shutdown signal for a task to select on. The signal
    /// fires both on broadcast and when the manager goes away.
    pub fn subscribe(&self) -> watch::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Aborts every managed task without waiting. For the second Ctrl-C.
    pub fn abort_all(&mut self) {
        self.tasks.abort_all();
    }

    /// Broadcasts the shutdown signal and joins all tasks, up to `timeout`.
    ///
    /// Consumes the manager. Returns an error if a task panicked or if the
    /// timeout expired; in the latter case the stragglers are aborted before
    /// returning.
    pub async fn graceful_shutdown(self, timeout: Duration) -> Result<(), ShutdownError> {
        let Self { mut tasks, shutdown_tx } = self;

        info!(tasks = tasks.len(), "Broadcasting shutdown signal to background tasks");
        let _ = shutdown_tx.send(());
        drop(shutdown_tx);

        let join_all = async {
            while let Some(res) = tasks.join_next().await {
                res?;
            }
            Ok(())
        };

        match tokio::time::timeout(timeout, join_all).await {
            Ok(Ok(())) => {
                info!("All background tasks completed gracefully.");
                Ok(())
            }
            Ok(Err(e)) => {
                error!(error = %e, "A background task panicked during shutdown.");
                Err(ShutdownError::Panic(e))
            }
            Err(_) => {
                error!("Shutdown timeout of {:?} exceeded. Aborting remaining tasks.", timeout);
                tasks.abort_all();
                Err(ShutdownError::Timeout(timeout))
            }
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test]
    async fn signal_reaches_every_subscriber() {
        let mut manager = ShutdownManager::new();
        for _ in 0..3 {
            let mut rx = manager.subscribe();
            manager.spawn_task(async move {
                let _ = rx.changed().await;
            });
        }

        let res = manager.graceful_shutdown(Duration::from_secs(1)).await;
        assert!(res.is_ok());
    }

    #[tokio::test]
    async fn deaf_task_trips_the_timeout() {
        let mut manager = ShutdownManager::new();
        manager.spawn_task(async {
            sleep(Duration::from_secs(30)).await;
        });

        let res = manager.graceful_shutdown(Duration::from_millis(100)).await;
        assert!(matches!(res, Err(ShutdownError::Timeout(_))));
    }

    #[tokio::test]
    async fn task_panic_is_reported() {
        let mut manager = ShutdownManager::new();
        manager.spawn_task(async {
            panic!("boom");
        });

        let res = manager.graceful_shutdown(Duration::from_secs(1)).await;
        assert!(matches!(res, Err(ShutdownError::Panic(_))));
    }

    #[tokio::test]
    async fn shutdown_with_no_tasks_is_immediate() {
        let manager = ShutdownManager::new();
        assert!(manager.graceful_shutdown(Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn abort_all_cancels_without_signal() {
        let mut manager = ShutdownManager::new();
        manager.spawn_task(async {
            sleep(Duration::from_secs(30)).await;
        });

        manager.abort_all();
        let res = manager.tasks.join_next().await.unwrap();
        assert!(res.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn finished_tasks_do_not_block_shutdown() {
        let mut manager = ShutdownManager::new();
        manager.spawn_task(async {});
        sleep(Duration::from_millis(20)).await;

        assert!(manager.graceful_shutdown(Duration::from_secs(1)).await.is_ok());
    }
}
