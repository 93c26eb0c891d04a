//! Replay protection: the delivery registry and the in-flight set.
//!
//! Two concerns behind one module:
//!
//! - **Delivery registry**: a TTL-scoped "delivery seen" set. A claim is
//!   atomic - concurrent claimers for the same id observe exactly one
//!   [`Claim::Fresh`]. Expired entries are evicted lazily on each claim, and
//!   a hard cap bounds memory regardless of attack rate.
//! - **In-flight set**: per-ticket exclusion within this process. The
//!   release handle removes the entry on drop, so release runs on every
//!   exit path including cancellation.
//!
//! Both structures live behind a mutex and are injected into the
//! orchestrator rather than reached through globals, which keeps the
//! lock-before-claim ordering testable. Cross-instance exclusivity is not
//! provided; operators either pin a ticket to one instance or accept tag
//! races.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Hard cap on tracked delivery ids. With id strings of typical webhook
/// size this bounds the registry to a few megabytes.
pub const MAX_TRACKED_DELIVERIES: usize = 100_000;

/// Outcome of a delivery-id claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// First sighting within the TTL window; the caller proceeds.
    Fresh,
    /// Already claimed within the TTL window; the caller skips.
    Duplicate,
}

struct DeliveryState {
    expires_at_by_id: HashMap<String, Instant>,
}

/// TTL-scoped delivery-id registry (process-local, non-durable).
pub struct DeliveryRegistry {
    ttl: Duration,
    max_entries: usize,
    state: Mutex<DeliveryState>,
}

impl DeliveryRegistry {
    /// Creates a registry with the given TTL. A zero TTL disables
    /// deduplication: every claim is fresh.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self::with_capacity(ttl, MAX_TRACKED_DELIVERIES)
    }

    /// Creates a registry with an explicit entry cap (test hook).
    #[must_use]
    pub fn with_capacity(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries,
            state: Mutex::new(DeliveryState {
                expires_at_by_id: HashMap::new(),
            }),
        }
    }

    /// Atomically claims a delivery id at the given instant.
    ///
    /// Eviction of expired entries is amortised over claims: the entry for
    /// the claimed id is checked eagerly, the rest of the map is swept when
    /// it grows past the cap.
    pub fn claim(&self, delivery_id: &str, now: Instant) -> Claim {
        if self.ttl.is_zero() {
            return Claim::Fresh;
        }

        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if let Some(&expires_at) = state.expires_at_by_id.get(delivery_id) {
            if now < expires_at {
                return Claim::Duplicate;
            }
            state.expires_at_by_id.remove(delivery_id);
        }

        if state.expires_at_by_id.len() >= self.max_entries {
            state
                .expires_at_by_id
                .retain(|_, expires_at| now < *expires_at);
            if state.expires_at_by_id.len() >= self.max_entries {
                // Registry saturated with live entries. Treating the claim
                // as a duplicate fails closed: a skipped job can be
                // replayed, a poisoned registry cannot.
                tracing::warn!(
                    tracked = state.expires_at_by_id.len(),
                    max = self.max_entries,
                    "delivery registry full; rejecting new delivery id"
                );
                return Claim::Duplicate;
            }
        }

        state
            .expires_at_by_id
            .insert(delivery_id.to_owned(), now + self.ttl);
        Claim::Fresh
    }

    /// Number of tracked (possibly expired) entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .expires_at_by_id
            .len()
    }

    /// True when no entries are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-ticket in-flight exclusion for this process.
#[derive(Clone, Default)]
pub struct InFlightSet {
    tickets: Arc<Mutex<HashSet<u64>>>,
}

impl InFlightSet {
    /// Creates an empty in-flight set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Tries to mark a ticket as in flight.
    ///
    /// Returns a release guard on success, `None` when the ticket is
    /// already being processed. Release happens when the guard drops, which
    /// covers every exit path including cancellation of the job future.
    #[must_use]
    pub fn try_acquire(&self, ticket_id: u64) -> Option<InFlightGuard> {
        let mut tickets = self
            .tickets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if tickets.insert(ticket_id) {
            Some(InFlightGuard {
                tickets: Arc::clone(&self.tickets),
                ticket_id,
                released: false,
            })
        } else {
            None
        }
    }

    /// Whether the ticket is currently in flight.
    #[must_use]
    pub fn contains(&self, ticket_id: u64) -> bool {
        self.tickets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains(&ticket_id)
    }
}

/// Release handle for an in-flight ticket. Dropping it releases the lock;
/// calling [`InFlightGuard::release`] first is equivalent and idempotent.
pub struct InFlightGuard {
    tickets: Arc<Mutex<HashSet<u64>>>,
    ticket_id: u64,
    released: bool,
}

impl InFlightGuard {
    /// Releases the in-flight entry now. Safe to call more than once.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.tickets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&self.ticket_id);
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use super::*;

    #[test]
    fn second_claim_within_ttl_is_duplicate() {
        let registry = DeliveryRegistry::new(Duration::from_secs(60));
        let now = Instant::now();
        assert_eq!(registry.claim("d-1", now), Claim::Fresh);
        assert_eq!(registry.claim("d-1", now), Claim::Duplicate);
        assert_eq!(
            registry.claim("d-1", now + Duration::from_secs(59)),
            Claim::Duplicate
        );
    }

    #[test]
    fn claim_is_fresh_again_after_ttl() {
        let registry = DeliveryRegistry::new(Duration::from_secs(60));
        let now = Instant::now();
        assert_eq!(registry.claim("d-1", now), Claim::Fresh);
        assert_eq!(
            registry.claim("d-1", now + Duration::from_secs(60)),
            Claim::Fresh
        );
    }

    #[test]
    fn zero_ttl_disables_dedup() {
        let registry = DeliveryRegistry::new(Duration::ZERO);
        let now = Instant::now();
        assert_eq!(registry.claim("d-1", now), Claim::Fresh);
        assert_eq!(registry.claim("d-1", now), Claim::Fresh);
        assert!(registry.is_empty());
    }

    #[test]
    fn distinct_ids_are_independent() {
        let registry = DeliveryRegistry::new(Duration::from_secs(60));
        let now = Instant::now();
        assert_eq!(registry.claim("d-1", now), Claim::Fresh);
        assert_eq!(registry.claim("d-2", now), Claim::Fresh);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn full_registry_evicts_expired_then_fails_closed() {
        let registry = DeliveryRegistry::with_capacity(Duration::from_secs(10), 2);
        let now = Instant::now();
        assert_eq!(registry.claim("a", now), Claim::Fresh);
        assert_eq!(registry.claim("b", now), Claim::Fresh);

        // Saturated with live entries: new ids are rejected.
        assert_eq!(registry.claim("c", now), Claim::Duplicate);

        // After the TTL the sweep makes room again.
        assert_eq!(
            registry.claim("c", now + Duration::from_secs(10)),
            Claim::Fresh
        );
    }

    #[test]
    fn concurrent_claims_yield_exactly_one_fresh() {
        let registry = Arc::new(DeliveryRegistry::new(Duration::from_secs(60)));
        let fresh = Arc::new(AtomicUsize::new(0));
        let now = Instant::now();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let fresh = Arc::clone(&fresh);
                thread::spawn(move || {
                    if registry.claim("same-id", now) == Claim::Fresh {
                        fresh.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(fresh.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn in_flight_excludes_and_releases_on_drop() {
        let set = InFlightSet::new();

        let guard = set.try_acquire(42).expect("first acquire");
        assert!(set.contains(42));
        assert!(set.try_acquire(42).is_none());
        // Other tickets are unaffected.
        assert!(set.try_acquire(7).is_some());

        drop(guard);
        assert!(!set.contains(42));
        assert!(set.try_acquire(42).is_some());
    }

    #[test]
    fn in_flight_release_is_idempotent() {
        let set = InFlightSet::new();
        let mut guard = set.try_acquire(1).unwrap();
        guard.release();
        guard.release();
        assert!(!set.contains(1));
        drop(guard);
        assert!(set.try_acquire(1).is_some());
    }

    #[test]
    fn concurrent_acquire_yields_single_winner() {
        let set = InFlightSet::new();
        let winners = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(std::sync::Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let set = set.clone();
                let winners = Arc::clone(&winners);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    // All threads attempt at the same instant; nobody
                    // releases until every attempt has happened.
                    barrier.wait();
                    let guard = set.try_acquire(99);
                    if guard.is_some() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                    barrier.wait();
                    drop(guard);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
        assert!(!set.contains(99));
    }
}
