//! This module contains the logic for the background health checking task.
//!
//! Every interval it probes every pool backend, alive or dead, with a bare
//! TCP connect. A backend comes back into rotation on a single successful
//! probe; it leaves rotation once its consecutive-failure count reaches the
//! retry threshold. The asymmetry biases the pool toward availability while
//! still damping flapping nodes.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::config::HealthCheckConfig;
use crate::metrics::{HEALTHCHECK_FAILED, HEALTHY_BACKENDS, TOTAL_BACKENDS};
use crate::pool::Pool;

/// The main background loop for periodic health checks.
///
/// Rounds never overlap: the ticker skips missed ticks, so a slow round
/// delays the next one instead of stacking probes. The loop also listens for
/// the shutdown signal to exit gracefully.
pub async fn health_check_loop(
    pool: Arc<Pool>,
    config: HealthCheckConfig,
    mut shutdown_rx: watch::Receiver<()>,
) {
    let mut ticker = interval(config.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(
        interval_sec = config.interval_sec,
        timeout_sec = config.timeout_sec,
        retries = config.retries,
        "Health checker started"
    );

    loop {
        tokio::select! {
            biased; // Prioritize the shutdown signal
            _ = shutdown_rx.changed() => {
                info!("Health checker received shutdown signal, exiting.");
                return;
            }
            _ = ticker.tick() => {
                probe_round(&pool, &config, shutdown_rx.clone()).await;
            }
        }
    }
}

/// Executes one round of probes against every backend in the pool.
///
/// Probes within a round run concurrently and are individually bounded by
/// the probe timeout. The shutdown signal aborts an in-flight round.
async fn probe_round(pool: &Arc<Pool>, config: &HealthCheckConfig, mut shutdown_rx: watch::Receiver<()>) {
    let backends = pool.all();
    let timeout = config.timeout();
    let retries = config.retries;

    let mut set = JoinSet::new();
    for backend in backends {
        set.spawn(probe_backend(backend, timeout, retries));
    }

    tokio::select! {
        biased;
        _ = shutdown_rx.changed() => {
            set.abort_all();
            return;
        }
        _ = async { while set.join_next().await.is_some() {} } => {}
    }

    TOTAL_BACKENDS.set(pool.len() as i64);
    HEALTHY_BACKENDS.set(pool.alive_count() as i64);
}

/// Probes one backend with a TCP connect and applies the state transition.
async fn probe_backend(backend: Arc<Backend>, timeout: Duration, retries: u32) {
    match tokio::time::timeout(timeout, TcpStream::connect(backend.address())).await {
        Ok(Ok(conn)) => {
            // The handshake is the whole probe; close straight away.
            drop(conn);
            backend.reset_failures();
            if !backend.is_alive() {
                backend.mark_alive();
                info!(backend = %backend.address(), "Backend recovered");
            }
        }
        _ => {
            HEALTHCHECK_FAILED.with_label_values(&[backend.address()]).inc();
            let failures = backend.add_failures();
            if failures >= retries {
                if backend.is_alive() {
                    warn!(
                        backend = %backend.address(),
                        failures = failures,
                        "Backend marked dead"
                    );
                }
                backend.mark_dead();
            } else {
                debug!(
                    backend = %backend.address(),
                    failures = failures,
                    "Backend probe failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn config(retries: u32) -> HealthCheckConfig {
        HealthCheckConfig { interval_sec: 1, timeout_sec: 1, retries }
    }

    /// A port that refuses connections: bind, read the port, drop.
    async fn refused_addr() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        addr
    }

    #[tokio::test]
    async fn failing_probes_cross_the_retry_threshold() {
        let pool = Arc::new(Pool::new());
        let addr = refused_addr().await;
        let backend = pool.add(&addr, 1).unwrap();
        let cfg = config(2);
        let (_shutdown_tx, shutdown_rx) = watch::channel(());

        // First failure: still alive, one strike.
        probe_round(&pool, &cfg, shutdown_rx.clone()).await;
        assert!(backend.is_alive());
        assert_eq!(backend.failures(), 1);

        // Second failure crosses retries=2.
        probe_round(&pool, &cfg, shutdown_rx).await;
        assert!(!backend.is_alive());
    }

    #[tokio::test]
    async fn one_successful_probe_revives_a_dead_backend() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let pool = Arc::new(Pool::new());
        let backend = pool.add(&addr, 1).unwrap();
        backend.mark_dead();
        backend.add_failures();

        // Accept and drop whatever the probe dials.
        tokio::spawn(async move {
            loop {
                let Ok((conn, _)) = listener.accept().await else { return };
                drop(conn);
            }
        });

        let (_shutdown_tx, shutdown_rx) = watch::channel(());
        probe_round(&pool, &config(2), shutdown_rx).await;
        assert!(backend.is_alive());
        assert_eq!(backend.failures(), 0);
    }

    #[tokio::test]
    async fn success_keeps_an_alive_backend_steady() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((conn, _)) = listener.accept().await else { return };
                drop(conn);
            }
        });

        let pool = Arc::new(Pool::new());
        let backend = pool.add(&addr, 1).unwrap();
        let successes_before = backend.successes();

        let (_shutdown_tx, shutdown_rx) = watch::channel(());
        probe_round(&pool, &config(2), shutdown_rx).await;
        assert!(backend.is_alive());
        // An already-alive backend is left alone apart from the failure
        // reset, so the success streak does not move.
        assert_eq!(backend.successes(), successes_before);
    }

    #[tokio::test]
    async fn dead_and_alive_backends_are_both_probed() {
        let pool = Arc::new(Pool::new());
        let dead_addr = refused_addr().await;
        let dead = pool.add(&dead_addr, 1).unwrap();
        dead.mark_dead();
        let failures_before = dead.failures();

        let (_shutdown_tx, shutdown_rx) = watch::channel(());
        probe_round(&pool, &config(10), shutdown_rx).await;
        // Still counted against the threshold even while dead.
        assert_eq!(dead.failures(), failures_before + 1);
    }

    #[tokio::test]
    async fn loop_exits_on_shutdown() {
        let pool = Arc::new(Pool::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(());

        let task = tokio::spawn(health_check_loop(pool, config(2), shutdown_rx));
        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }
}
