//! The authoritative registry of backend endpoints.
//!
//! The pool owns an insertion-ordered sequence plus an address index, both
//! behind a single reader-preferring lock. Structural mutations take the
//! exclusive lock; snapshots take the shared lock and copy out, so callers
//! iterate without holding the lock and never observe a half-updated
//! sequence.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::{Backend, BalancerError};

#[derive(Debug, Default)]
struct PoolInner {
    backends: Vec<Arc<Backend>>,
    index: HashMap<String, Arc<Backend>>,
}

#[derive(Debug, Default)]
pub struct Pool {
    inner: RwLock<PoolInner>,
}

impl Pool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new backend. Fails if the address is already present.
    pub fn add(&self, address: &str, weight: i64) -> Result<Arc<Backend>, BalancerError> {
        let mut inner = self.inner.write();
        if inner.index.contains_key(address) {
            return Err(BalancerError::DuplicateBackend(address.to_string()));
        }
        let backend = Arc::new(Backend::new(address, weight));
        inner.backends.push(Arc::clone(&backend));
        inner.index.insert(address.to_string(), Arc::clone(&backend));
        Ok(backend)
    }

    /// Removes a backend, returning whether one was present. Handlers already
    /// holding the backend keep their reference; only the pool forgets it.
    pub fn remove(&self, address: &str) -> bool {
        let mut inner = self.inner.write();
        if inner.index.remove(address).is_none() {
            return false;
        }
        inner.backends.retain(|b| b.address() != address);
        true
    }

    pub fn get(&self, address: &str) -> Result<Arc<Backend>, BalancerError> {
        self.inner
            .read()
            .index
            .get(address)
            .cloned()
            .ok_or_else(|| BalancerError::BackendNotFound(address.to_string()))
    }

    pub fn has(&self, address: &str) -> bool {
        self.inner.read().index.contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.inner.read().backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A copy of the full sequence in insertion order.
    pub fn all(&self) -> Vec<Arc<Backend>> {
        self.inner.read().backends.clone()
    }

    /// A point-in-time copy of the backends currently marked alive. A backend
    /// in the snapshot may be removed or marked dead before the caller uses
    /// it; handlers treat the resulting dial failure as a normal connection
    /// error.
    pub fn alive_snapshot(&self) -> Vec<Arc<Backend>> {
        self.inner.read().backends.iter().filter(|b| b.is_alive()).cloned().collect()
    }

    pub fn alive_count(&self) -> usize {
        self.inner.read().backends.iter().filter(|b| b.is_alive()).count()
    }

    pub fn update_weight(&self, address: &str, weight: i64) -> Result<(), BalancerError> {
        self.get(address)?.set_weight(weight);
        Ok(())
    }

    pub fn mark_alive(&self, address: &str) -> Result<(), BalancerError> {
        self.get(address)?.mark_alive();
        Ok(())
    }

    pub fn mark_dead(&self, address: &str) -> Result<(), BalancerError> {
        self.get(address)?.mark_dead();
        Ok(())
    }
}
