//! Backend selection strategies.
//!
//! The goal is to decouple the logic of *how* a backend is chosen from the
//! pool, which is responsible for managing state. Every strategy operates on
//! an alive snapshot copied out of the pool, so no pool lock is held during
//! selection. Every successful pick increments the chosen backend's
//! connection counter before returning; the caller owns the matching
//! decrement.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::backend::{Backend, BalancerError};
use crate::config::Algorithm;
use crate::pool::Pool;

/// A selection policy over the pool's alive snapshot.
///
/// `client_key` is the host portion of the client's peer address. Only the
/// IP-hash strategy consults it; the others ignore it.
pub trait Balancer: Send + Sync {
    fn pick(&self, client_key: &str) -> Result<Arc<Backend>, BalancerError>;
}

/// Builds the balancer selected by the configuration.
pub fn build(algorithm: Algorithm, pool: Arc<Pool>) -> Arc<dyn Balancer> {
    match algorithm {
        Algorithm::RoundRobin => Arc::new(RoundRobin::new(pool)),
        Algorithm::LeastConnections => Arc::new(LeastConnections::new(pool)),
        Algorithm::Weighted => Arc::new(Weighted::new(pool)),
        Algorithm::IpHash => Arc::new(IpHash::new(pool)),
    }
}

/// Cycles through the alive snapshot in insertion order.
pub struct RoundRobin {
    pool: Arc<Pool>,
    next: AtomicU64,
}

impl RoundRobin {
    pub fn new(pool: Arc<Pool>) -> Self {
        Self { pool, next: AtomicU64::new(0) }
    }
}

impl Balancer for RoundRobin {
    fn pick(&self, _client_key: &str) -> Result<Arc<Backend>, BalancerError> {
        let backends = self.pool.alive_snapshot();
        if backends.is_empty() {
            return Err(BalancerError::NoAliveBackend);
        }

        // The counter is monotonic; the modulus is taken against the snapshot
        // size at call time, so pool changes only shift the mapping.
        let next = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        let idx = ((next - 1) % backends.len() as u64) as usize;

        let selected = Arc::clone(&backends[idx]);
        selected.inc_conn();
        Ok(selected)
    }
}

/// Selects the alive backend with the fewest active connections.
///
/// The scan is not globally atomic; two concurrent picks may land on the same
/// backend when their snapshots agree on the minimum. That is acceptable for
/// a heuristic whose bar is "no worse than random in steady state".
pub struct LeastConnections {
    pool: Arc<Pool>,
}

impl LeastConnections {
    pub fn new(pool: Arc<Pool>) -> Self {
        Self { pool }
    }
}

impl Balancer for LeastConnections {
    fn pick(&self, _client_key: &str) -> Result<Arc<Backend>, BalancerError> {
        let backends = self.pool.alive_snapshot();
        let mut iter = backends.iter();
        let Some(first) = iter.next() else {
            return Err(BalancerError::NoAliveBackend);
        };

        let mut selected = first;
        let mut min_count = selected.conn_count();
        for b in iter {
            let count = b.conn_count();
            if count < min_count {
                selected = b;
                min_count = count;
            }
        }

        let selected = Arc::clone(selected);
        selected.inc_conn();
        Ok(selected)
    }
}

/// Selects the alive backend with the lowest load relative to its weight,
/// scoring each candidate as `(conn_count + 1) / weight`.
///
/// The `+1` biases toward idle backends without dividing by zero and puts a
/// newly added backend immediately in contention. Backends with non-positive
/// weight are skipped.
pub struct Weighted {
    pool: Arc<Pool>,
}

impl Weighted {
    pub fn new(pool: Arc<Pool>) -> Self {
        Self { pool }
    }
}

impl Balancer for Weighted {
    fn pick(&self, _client_key: &str) -> Result<Arc<Backend>, BalancerError> {
        let backends = self.pool.alive_snapshot();
        if backends.is_empty() {
            return Err(BalancerError::NoAliveBackend);
        }

        let mut selected: Option<&Arc<Backend>> = None;
        let mut min_score = f64::MAX;
        for b in &backends {
            let weight = b.weight();
            if weight <= 0 {
                continue;
            }

            let score = (b.conn_count() + 1) as f64 / weight as f64;
            if score < min_score {
                min_score = score;
                selected = Some(b);
            }
        }

        let selected = Arc::clone(selected.ok_or(BalancerError::NoBackendSelected)?);
        selected.inc_conn();
        Ok(selected)
    }
}

/// Highest Random Weight (rendezvous) hashing over the client key.
///
/// Each alive backend is scored with a 64-bit FNV-1a hash of the client key
/// concatenated with the backend address; the maximum score wins. The same
/// key keeps landing on the same backend, and adding or removing a backend
/// remaps only the keys whose maximum moved.
pub struct IpHash {
    pool: Arc<Pool>,
}

impl IpHash {
    pub fn new(pool: Arc<Pool>) -> Self {
        Self { pool }
    }
}

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1a over `key || address`, no separator.
fn hrw_hash(key: &str, address: &str) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in key.bytes().chain(address.bytes()) {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

impl Balancer for IpHash {
    fn pick(&self, client_key: &str) -> Result<Arc<Backend>, BalancerError> {
        let backends = self.pool.alive_snapshot();
        if backends.is_empty() {
            return Err(BalancerError::NoAliveBackend);
        }

        let mut selected: Option<&Arc<Backend>> = None;
        let mut max_score = 0u64;
        for b in &backends {
            let score = hrw_hash(client_key, b.address());
            if selected.is_none() || score > max_score {
                selected = Some(b);
                max_score = score;
            }
        }

        // Non-empty snapshot, so a candidate always exists.
        let selected = Arc::clone(selected.expect("non-empty snapshot"));
        selected.inc_conn();
        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_of(addresses: &[(&str, i64)]) -> Arc<Pool> {
        let pool = Arc::new(Pool::new());
        for (addr, weight) in addresses {
            pool.add(addr, *weight).unwrap();
        }
        pool
    }

    #[test]
    fn round_robin_cycles_in_insertion_order() {
        let pool = pool_of(&[("a:1", 1), ("b:1", 1), ("c:1", 1)]);
        let lb = RoundRobin::new(pool);

        let picked: Vec<String> =
            (0..6).map(|_| lb.pick("").unwrap().address().to_string()).collect();
        assert_eq!(picked, vec!["a:1", "b:1", "c:1", "a:1", "b:1", "c:1"]);
    }

    #[test]
    fn round_robin_visits_each_backend_equally() {
        let pool = pool_of(&[("a:1", 1), ("b:1", 1), ("c:1", 1), ("d:1", 1)]);
        let lb = RoundRobin::new(Arc::clone(&pool));

        for _ in 0..4 * 7 {
            let b = lb.pick("").unwrap();
            b.dec_conn();
        }
        for b in pool.all() {
            // dec_conn above undid the pick increments, so equal visitation
            // shows up as a zero balance per backend.
            assert_eq!(b.conn_count(), 0);
        }
    }

    #[test]
    fn round_robin_skips_dead_backends() {
        let pool = pool_of(&[("a:1", 1), ("b:1", 1), ("c:1", 1)]);
        pool.mark_dead("b:1").unwrap();
        let lb = RoundRobin::new(Arc::clone(&pool));

        for _ in 0..10 {
            assert_ne!(lb.pick("").unwrap().address(), "b:1");
        }
    }

    #[test]
    fn least_connections_prefers_idle() {
        let pool = pool_of(&[("a:1", 1), ("b:1", 1)]);
        let a = pool.get("a:1").unwrap();
        let b = pool.get("b:1").unwrap();
        for _ in 0..5 {
            a.inc_conn();
        }
        for _ in 0..2 {
            b.inc_conn();
        }

        let lb = LeastConnections::new(pool);

        // b sits at 2 connections against a's 5; it keeps winning until the
        // pick increments bring it level.
        for _ in 0..3 {
            assert_eq!(lb.pick("").unwrap().address(), "b:1");
        }
        assert_eq!(b.conn_count(), 5);
    }

    #[test]
    fn least_connections_ties_resolve_to_first_in_order() {
        let pool = pool_of(&[("a:1", 1), ("b:1", 1)]);
        let lb = LeastConnections::new(pool);
        assert_eq!(lb.pick("").unwrap().address(), "a:1");
    }

    #[test]
    fn weighted_biases_toward_heavy_backends() {
        let pool = pool_of(&[("a:1", 10), ("b:1", 2)]);
        let lb = Weighted::new(pool);

        // a scores (0+1)/10 = 0.1 against b's 0.5 and keeps winning while
        // its connection count climbs.
        for i in 0..5 {
            assert_eq!(lb.pick("").unwrap().address(), "a:1", "pick {}", i + 1);
        }
        // a now scores (5+1)/10 = 0.6; b's 0.5 finally wins.
        assert_eq!(lb.pick("").unwrap().address(), "b:1");
    }

    #[test]
    fn weighted_converges_to_weight_proportions() {
        let pool = pool_of(&[("a:1", 3), ("b:1", 1)]);
        let lb = Weighted::new(Arc::clone(&pool));

        for _ in 0..400 {
            lb.pick("").unwrap();
        }
        let a = pool.get("a:1").unwrap().conn_count();
        let b = pool.get("b:1").unwrap().conn_count();
        assert_eq!(a + b, 400);
        // 3:1 weights put a at three quarters of the load.
        assert!((a - 300).abs() <= 4, "a got {a} of 400");
    }

    #[test]
    fn weighted_skips_non_positive_weights() {
        let pool = pool_of(&[("a:1", 0), ("b:1", -5), ("c:1", 1)]);
        let lb = Weighted::new(pool);
        assert_eq!(lb.pick("").unwrap().address(), "c:1");
    }

    #[test]
    fn weighted_with_no_positive_weight_fails() {
        let pool = pool_of(&[("a:1", 0), ("b:1", 0)]);
        let lb = Weighted::new(pool);
        assert!(matches!(lb.pick(""), Err(BalancerError::NoBackendSelected)));
    }

    #[test]
    fn ip_hash_is_sticky_per_key() {
        let pool = pool_of(&[("a:1", 1), ("b:1", 1), ("c:1", 1)]);
        let lb = IpHash::new(pool);

        let first = lb.pick("192.168.1.1").unwrap().address().to_string();
        for _ in 0..100 {
            assert_eq!(lb.pick("192.168.1.1").unwrap().address(), first);
        }

        let other = lb.pick("192.168.1.2").unwrap();
        // Different keys may or may not collide; either way the pick is valid.
        assert!(["a:1", "b:1", "c:1"].contains(&other.address()));
    }

    #[test]
    fn ip_hash_remaps_minimally_on_pool_growth() {
        let pool = pool_of(&[("a:1", 1), ("b:1", 1), ("c:1", 1)]);
        let lb = IpHash::new(Arc::clone(&pool));

        let keys: Vec<String> = (0..200).map(|i| format!("10.1.{}.{}", i / 256, i % 256)).collect();
        let before: Vec<String> =
            keys.iter().map(|k| lb.pick(k).unwrap().address().to_string()).collect();

        pool.add("d:1", 1).unwrap();

        let mut moved = 0;
        for (key, old) in keys.iter().zip(&before) {
            let new = lb.pick(key).unwrap().address().to_string();
            if new != *old {
                // A key only ever moves to the new backend, never between
                // the survivors.
                assert_eq!(new, "d:1");
                moved += 1;
            }
        }
        // Expected share is 1/4 of the keys; allow generous slack for hash
        // noise.
        assert!(moved < keys.len() / 2, "{moved} of {} keys moved", keys.len());
    }

    #[test]
    fn every_pick_increments_the_connection_counter() {
        let pool = pool_of(&[("a:1", 1), ("b:1", 2)]);
        let balancers: Vec<Arc<dyn Balancer>> = vec![
            Arc::new(RoundRobin::new(Arc::clone(&pool))),
            Arc::new(LeastConnections::new(Arc::clone(&pool))),
            Arc::new(Weighted::new(Arc::clone(&pool))),
            Arc::new(IpHash::new(Arc::clone(&pool))),
        ];

        for lb in balancers {
            let before: i64 = pool.all().iter().map(|b| b.conn_count()).sum();
            let picked = lb.pick("172.16.0.9").unwrap();
            let after: i64 = pool.all().iter().map(|b| b.conn_count()).sum();
            assert_eq!(after, before + 1);
            assert!(picked.conn_count() > 0);
        }
    }

    #[test]
    fn all_strategies_fail_on_empty_alive_snapshot() {
        let pool = pool_of(&[("a:1", 1)]);
        pool.mark_dead("a:1").unwrap();

        assert!(matches!(
            RoundRobin::new(Arc::clone(&pool)).pick(""),
            Err(BalancerError::NoAliveBackend)
        ));
        assert!(matches!(
            LeastConnections::new(Arc::clone(&pool)).pick(""),
            Err(BalancerError::NoAliveBackend)
        ));
        assert!(matches!(
            Weighted::new(Arc::clone(&pool)).pick(""),
            Err(BalancerError::NoAliveBackend)
        ));
        assert!(matches!(
            IpHash::new(Arc::clone(&pool)).pick(""),
            Err(BalancerError::NoAliveBackend)
        ));
    }

    #[test]
    fn hrw_hash_matches_fnv1a_reference() {
        // FNV-1a 64 offset basis for empty input.
        assert_eq!(hrw_hash("", ""), 0xcbf2_9ce4_8422_2325);
        // Concatenation has no separator, so the split point is invisible.
        assert_eq!(hrw_hash("a", "b"), hrw_hash("ab", ""));
        assert_ne!(hrw_hash("key", "a:1"), hrw_hash("key", "b:1"));
    }
}
