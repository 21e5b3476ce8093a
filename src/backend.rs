//! This module defines the core data structures for the load balancer.
//!
//! It contains the `Backend` struct, which tracks the identity, liveness and
//! load state of a single upstream endpoint, and the `BalancerError` enum for
//! the error conditions shared across the pool, the balancers and the admin
//! surface.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BalancerError {
    #[error("backend already registered: {0}")]
    DuplicateBackend(String),
    #[error("backend not found: {0}")]
    BackendNotFound(String),
    #[error("no alive backends")]
    NoAliveBackend,
    #[error("no backend with positive weight")]
    NoBackendSelected,
}

/// Timestamps of the most recent probe outcomes. Observability only; the
/// `alive` flag drives all fast-path decisions.
#[derive(Debug, Default)]
struct ProbeTimes {
    last_success: Option<Instant>,
    last_failed: Option<Instant>,
}

/// The state of a single upstream endpoint.
///
/// All mutating operations are safe under arbitrary concurrent readers: the
/// liveness flag and counters are atomics, the probe timestamps sit behind a
/// per-backend lock that is never held across I/O. A backend is shared via
/// `Arc` between the pool, the balancers and in-flight handlers; a handler
/// that still holds a reference after the pool removed the backend keeps
/// operating on valid state until it releases it.
#[derive(Debug)]
pub struct Backend {
    address: String,
    weight: AtomicI64,
    alive: AtomicBool,
    conn_count: AtomicI64,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
    probe_times: RwLock<ProbeTimes>,
}

impl Backend {
    /// Creates a backend that is considered alive until the health checker
    /// says otherwise.
    pub fn new(address: impl Into<String>, weight: i64) -> Self {
        Self {
            address: address.into(),
            weight: AtomicI64::new(weight),
            alive: AtomicBool::new(true),
            conn_count: AtomicI64::new(0),
            consecutive_failures: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
            probe_times: RwLock::new(ProbeTimes::default()),
        }
    }

    /// The `host:port` identity of this backend. Immutable for its lifetime.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Puts the backend back into rotation: zeroes the failure streak, extends
    /// the success streak and records the success time.
    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.consecutive_successes.fetch_add(1, Ordering::Relaxed);
        self.probe_times.write().last_success = Some(Instant::now());
    }

    /// Takes the backend out of rotation: zeroes the success streak, extends
    /// the failure streak and records the failure time.
    pub fn mark_dead(&self) {
        self.alive.store(false, Ordering::Release);
        self.consecutive_successes.store(0, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        self.probe_times.write().last_failed = Some(Instant::now());
    }

    pub fn inc_conn(&self) {
        self.conn_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn dec_conn(&self) {
        self.conn_count.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn conn_count(&self) -> i64 {
        self.conn_count.load(Ordering::Acquire)
    }

    /// Extends the failure streak and returns the new count.
    pub fn add_failures(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn reset_failures(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
    }

    pub fn failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// Extends the success streak and returns the new count.
    pub fn add_successes(&self) -> u32 {
        self.consecutive_successes.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn reset_successes(&self) {
        self.consecutive_successes.store(0, Ordering::Release);
    }

    pub fn successes(&self) -> u32 {
        self.consecutive_successes.load(Ordering::Acquire)
    }

    pub fn weight(&self) -> i64 {
        self.weight.load(Ordering::Acquire)
    }

    pub fn set_weight(&self, weight: i64) {
        self.weight.store(weight, Ordering::Release);
    }

    pub fn last_success(&self) -> Option<Instant> {
        self.probe_times.read().last_success
    }

    pub fn last_failed(&self) -> Option<Instant> {
        self.probe_times.read().last_failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn new_backend_is_alive_with_zero_counters() {
        let b = Backend::new("10.0.0.1:8080", 3);
        assert!(b.is_alive());
        assert_eq!(b.address(), "10.0.0.1:8080");
        assert_eq!(b.weight(), 3);
        assert_eq!(b.conn_count(), 0);
        assert_eq!(b.failures(), 0);
        assert_eq!(b.successes(), 0);
        assert!(b.last_success().is_none());
        assert!(b.last_failed().is_none());
    }

    #[test]
    fn mark_dead_then_alive_flips_streaks() {
        let b = Backend::new("10.0.0.1:8080", 1);

        b.mark_dead();
        assert!(!b.is_alive());
        assert_eq!(b.failures(), 1);
        assert_eq!(b.successes(), 0);
        assert!(b.last_failed().is_some());

        b.mark_alive();
        assert!(b.is_alive());
        assert_eq!(b.failures(), 0);
        assert_eq!(b.successes(), 1);
        assert!(b.last_success().is_some());
    }

    #[test]
    fn conn_count_pairs_up() {
        let b = Backend::new("10.0.0.1:8080", 1);
        b.inc_conn();
        b.inc_conn();
        assert_eq!(b.conn_count(), 2);
        b.dec_conn();
        b.dec_conn();
        assert_eq!(b.conn_count(), 0);
    }

    #[test]
    fn failure_streak_reports_new_count() {
        let b = Backend::new("10.0.0.1:8080", 1);
        assert_eq!(b.add_failures(), 1);
        assert_eq!(b.add_failures(), 2);
        b.reset_failures();
        assert_eq!(b.failures(), 0);
        assert_eq!(b.add_successes(), 1);
        b.reset_successes();
        assert_eq!(b.successes(), 0);
    }

    #[test]
    fn counters_survive_concurrent_hammering() {
        let b = Arc::new(Backend::new("10.0.0.1:8080", 1));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let b = Arc::clone(&b);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    b.inc_conn();
                    b.dec_conn();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(b.conn_count(), 0);
    }
}
