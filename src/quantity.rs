//! Serialisation of stock-quantity deltas.
//!
//! Three producers change a product's unsent quantity delta: order purchase,
//! manual stock edit and the reconciler's resend. The read-compute-write of
//! the delta and the decision whether to send happen under [`QuantityGuard`].
//! A request in flight is represented by a [`QuantityTicket`], which lives in
//! the request's completion and is released by the response handler (or on
//! drop). While a ticket is outstanding, producers only accumulate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
struct Outstanding {
    generation: u64,
    since: Instant,
}

type OutstandingMap = Arc<Mutex<HashMap<i64, Outstanding>>>;

fn locked(map: &OutstandingMap) -> std::sync::MutexGuard<'_, HashMap<i64, Outstanding>> {
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
pub struct QuantityLock {
    gate: AsyncMutex<()>,
    outstanding: OutstandingMap,
    next_generation: AtomicU64,
}

impl QuantityLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to the quantity deltas.
    pub async fn acquire(&self) -> QuantityGuard<'_> {
        QuantityGuard {
            _gate: self.gate.lock().await,
            lock: self,
        }
    }

    /// Number of products with a quantity request in flight.
    pub fn outstanding_count(&self) -> usize {
        locked(&self.outstanding).len()
    }
}

/// Exclusive access to the quantity deltas. Dropping it ends the critical
/// section; tickets taken under it stay outstanding.
pub struct QuantityGuard<'a> {
    _gate: AsyncMutexGuard<'a, ()>,
    lock: &'a QuantityLock,
}

impl QuantityGuard<'_> {
    pub fn is_outstanding(&self, product_id: i64) -> bool {
        locked(&self.lock.outstanding).contains_key(&product_id)
    }

    /// Mark a quantity request for `product_id` as outstanding. Returns
    /// `None` when one already is.
    pub fn hold(&self, product_id: i64) -> Option<QuantityTicket> {
        let mut map = locked(&self.lock.outstanding);
        if map.contains_key(&product_id) {
            return None;
        }
        let generation = self.lock.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        map.insert(
            product_id,
            Outstanding {
                generation,
                since: Instant::now(),
            },
        );
        debug!(product_id, generation, "quantity ticket taken");
        Some(QuantityTicket {
            product_id,
            generation,
            outstanding: Arc::clone(&self.lock.outstanding),
            released: false,
        })
    }

    /// Force-release tickets held longer than `max_age`. Returns the affected
    /// product ids so the caller can flag them for a resend.
    pub fn release_stale(&self, max_age: Duration) -> Vec<i64> {
        let mut map = locked(&self.lock.outstanding);
        let now = Instant::now();
        let stale: Vec<i64> = map
            .iter()
            .filter(|(_, o)| now.duration_since(o.since) >= max_age)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            map.remove(id);
            warn!(product_id = id, "quantity ticket force-released after {:?}", max_age);
        }
        stale
    }
}

/// An outstanding quantity request for one product.
///
/// Releasing a ticket that was already force-released does nothing, so a
/// late response can never release a newer request's ticket.
#[derive(Debug)]
pub struct QuantityTicket {
    product_id: i64,
    generation: u64,
    outstanding: OutstandingMap,
    released: bool,
}

impl QuantityTicket {
    pub fn product_id(&self) -> i64 {
        self.product_id
    }

    /// Whether this ticket is still the one registered for its product.
    pub fn is_current(&self) -> bool {
        !self.released
            && locked(&self.outstanding)
                .get(&self.product_id)
                .is_some_and(|o| o.generation == self.generation)
    }

    /// Restart the hold timer when the ticket is reused for a follow-up send.
    pub fn renew(&self) {
        if let Some(entry) = locked(&self.outstanding).get_mut(&self.product_id) {
            if entry.generation == self.generation {
                entry.since = Instant::now();
            }
        }
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let mut map = locked(&self.outstanding);
        if map
            .get(&self.product_id)
            .is_some_and(|o| o.generation == self.generation)
        {
            map.remove(&self.product_id);
            debug!(product_id = self.product_id, generation = self.generation, "quantity ticket released");
        }
    }
}

impl Drop for QuantityTicket {
    fn drop(&mut self) {
        self.release_inner();
    }
}
