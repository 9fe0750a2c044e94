//! Per-caller token buckets with bounded LRU eviction.
//!
//! Buckets are created lazily on first sight of an address. When the map is
//! full, the least recently seen caller is evicted; no other caller loses its
//! state. A recency index keeps eviction logarithmic in the number of
//! tracked callers. Idle callers are pruned separately by
//! [`ClientBuckets::prune_idle`].

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use super::bucket::{BucketOutcome, TokenBucket};

struct ClientSlot {
    bucket: TokenBucket,
    /// Recency rank; larger is more recent.
    touched: u64,
    last_seen: Instant,
}

struct ClientMap {
    slots: HashMap<IpAddr, ClientSlot>,
    /// Recency rank to caller; the first entry is the eviction candidate.
    order: BTreeMap<u64, IpAddr>,
    tick: u64,
}

/// Process-wide per-caller limiter map.
///
/// Uses a sync Mutex since every critical section is short and never awaits.
pub(crate) struct ClientBuckets {
    inner: Mutex<ClientMap>,
    rate: u32,
    burst: u32,
    capacity: usize,
    idle: Duration,
}

impl ClientBuckets {
    pub(crate) fn new(rate: u32, burst: u32, capacity: usize, idle: Duration) -> Self {
        Self {
            inner: Mutex::new(ClientMap {
                slots: HashMap::new(),
                order: BTreeMap::new(),
                tick: 0,
            }),
            rate,
            burst,
            capacity: capacity.max(1),
            idle,
        }
    }

    /// Take one token from `ip`'s bucket, creating it if needed.
    pub(crate) fn try_take(&self, ip: IpAddr) -> BucketOutcome {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        map.tick = map.tick.wrapping_add(1);
        let tick = map.tick;

        if !map.slots.contains_key(&ip) && map.slots.len() >= self.capacity {
            if let Some((_, addr)) = map.order.pop_first() {
                map.slots.remove(&addr);
                debug!(capacity = self.capacity, "evicted least recently seen client bucket");
            }
        }

        let ClientMap { slots, order, .. } = &mut *map;
        let slot = slots.entry(ip).or_insert_with(|| ClientSlot {
            bucket: TokenBucket::new(self.rate, self.burst),
            touched: tick,
            last_seen: Instant::now(),
        });
        order.remove(&slot.touched);
        order.insert(tick, ip);
        slot.touched = tick;
        slot.last_seen = Instant::now();
        slot.bucket.try_take()
    }

    /// Drop callers idle for at least the configured idle time.
    pub(crate) fn prune_idle(&self) -> usize {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let before = map.slots.len();
        let idle = self.idle;
        let ClientMap { slots, order, .. } = &mut *map;
        slots.retain(|_, slot| {
            let keep = slot.last_seen.elapsed() < idle;
            if !keep {
                order.remove(&slot.touched);
            }
            keep
        });
        before.saturating_sub(slots.len())
    }

    pub(crate) fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .slots
            .len()
    }

    pub(crate) fn limit(&self) -> u32 {
        self.burst.max(1)
    }
}
