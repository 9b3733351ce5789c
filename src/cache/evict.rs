//! Memory accounting and eviction.
//!
//! Every page lives in exactly one of four bags. The unevictable bag holds
//! pages that are loading, have waiters, or are mid-destruction; the two
//! evictable bags split clean (disk-backed) from not-yet-written pages;
//! the evicted bag holds pages whose buffer was released but whose block
//! token survives. Only disk-backed evictables can be evicted.

use std::sync::Arc;

use tracing::{debug, trace};

use super::arena::Arena;
use super::page::{PageIdx, PageSlot};

/// Process-wide hook notified of cache access activity so memory budget
/// can be redistributed across caches.
pub trait CacheBalancer: Send + Sync + 'static {
    fn notify_access(&self, bytes: u64);
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum BagKind {
    Unevictable,
    EvictableDiskBacked,
    EvictableUnbacked,
    Evicted,
}

struct EvictionBag {
    members: Vec<PageIdx>,
    size: u64,
}

impl EvictionBag {
    fn new() -> Self {
        Self {
            members: Vec::new(),
            size: 0,
        }
    }

    fn add(&mut self, pages: &mut Arena<PageSlot>, idx: PageIdx, kind: BagKind) {
        let pos = self.members.len();
        self.members.push(idx);
        let slot = pages.get_mut(idx).expect("bagging a dead page");
        slot.bag = kind;
        slot.bag_pos = pos;
        self.size += u64::from(slot.ser_buf_size);
    }

    fn remove(&mut self, pages: &mut Arena<PageSlot>, idx: PageIdx) {
        let (pos, size) = {
            let slot = pages.get(idx).expect("unbagging a dead page");
            (slot.bag_pos, slot.ser_buf_size)
        };
        debug_assert_eq!(self.members[pos], idx);
        self.members.swap_remove(pos);
        if pos < self.members.len() {
            let moved = self.members[pos];
            pages.get_mut(moved).expect("bag member dead").bag_pos = pos;
        }
        debug_assert!(u64::from(size) <= self.size);
        self.size -= u64::from(size);
    }

    fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

pub(crate) struct Evicter {
    unevictable: EvictionBag,
    evictable_disk_backed: EvictionBag,
    evictable_unbacked: EvictionBag,
    evicted: EvictionBag,
    memory_limit: u64,
    bytes_loaded: u64,
    access_counter: u64,
    sample: usize,
    rng: u64,
    balancer: Option<Arc<dyn CacheBalancer>>,
    pub(crate) evictions: u64,
}

impl Evicter {
    pub fn new(
        memory_limit: u64,
        sample: usize,
        balancer: Option<Arc<dyn CacheBalancer>>,
    ) -> Self {
        Self {
            unevictable: EvictionBag::new(),
            evictable_disk_backed: EvictionBag::new(),
            evictable_unbacked: EvictionBag::new(),
            evicted: EvictionBag::new(),
            memory_limit,
            bytes_loaded: 0,
            access_counter: 0,
            sample: sample.max(1),
            rng: 0x9E37_79B9_7F4A_7C15,
            balancer,
            evictions: 0,
        }
    }

    pub fn memory_limit(&self) -> u64 {
        self.memory_limit
    }

    pub fn bytes_loaded(&self) -> u64 {
        self.bytes_loaded
    }

    /// Sum of the bags that occupy memory; the evicted bag does not count.
    pub fn in_memory_size(&self) -> u64 {
        self.unevictable.size + self.evictable_disk_backed.size + self.evictable_unbacked.size
    }

    pub fn next_access_time(&mut self) -> u64 {
        self.access_counter += 1;
        self.access_counter
    }

    pub fn notify_access(&mut self, bytes: u64) {
        self.bytes_loaded += bytes;
        if let Some(balancer) = &self.balancer {
            balancer.notify_access(bytes);
        }
    }

    pub fn update_memory_limit(&mut self, pages: &mut Arena<PageSlot>, new_limit: u64) {
        self.bytes_loaded = 0;
        self.memory_limit = new_limit;
        debug!(limit = new_limit, "cache.evict.limit_update");
        self.evict_if_necessary(pages);
    }

    /// Target bag for a page given its current attributes.
    pub fn correct_category(slot: &PageSlot) -> BagKind {
        if slot.loading || !slot.waiters.is_empty() {
            BagKind::Unevictable
        } else if slot.buf.is_none() {
            BagKind::Evicted
        } else if slot.token.is_some() {
            BagKind::EvictableDiskBacked
        } else {
            BagKind::EvictableUnbacked
        }
    }

    fn bag_mut(&mut self, kind: BagKind) -> &mut EvictionBag {
        match kind {
            BagKind::Unevictable => &mut self.unevictable,
            BagKind::EvictableDiskBacked => &mut self.evictable_disk_backed,
            BagKind::EvictableUnbacked => &mut self.evictable_unbacked,
            BagKind::Evicted => &mut self.evicted,
        }
    }

    /// Registers a page that is being constructed asynchronously. Its size
    /// is still zero; `add_now_loaded_size` accounts for it once known.
    pub fn add_not_yet_loaded(&mut self, pages: &mut Arena<PageSlot>, idx: PageIdx) {
        self.unevictable.add(pages, idx, BagKind::Unevictable);
    }

    pub fn add_now_loaded_size(&mut self, pages: &mut Arena<PageSlot>, idx: PageIdx) {
        let size = {
            let slot = pages.get(idx).expect("loaded page dead");
            debug_assert_eq!(slot.bag, BagKind::Unevictable);
            u64::from(slot.ser_buf_size)
        };
        self.unevictable.size += size;
        self.evict_if_necessary(pages);
        self.notify_access(size);
    }

    pub fn add_to_evictable_unbacked(&mut self, pages: &mut Arena<PageSlot>, idx: PageIdx) {
        let size = u64::from(pages.get(idx).expect("fresh page dead").ser_buf_size);
        self.evictable_unbacked
            .add(pages, idx, BagKind::EvictableUnbacked);
        self.evict_if_necessary(pages);
        self.notify_access(size);
    }

    /// Re-bags a page after one of its eviction-relevant attributes
    /// changed (waiter added or removed, buffer or token installed or
    /// dropped, load started or finished).
    pub fn change_to_correct_bag(&mut self, pages: &mut Arena<PageSlot>, idx: PageIdx) {
        let (current, target) = {
            let slot = pages.get(idx).expect("rebagging a dead page");
            (slot.bag, Self::correct_category(slot))
        };
        if current == target {
            return;
        }
        self.bag_mut(current).remove(pages, idx);
        self.bag_mut(target).add(pages, idx, target);
        self.evict_if_necessary(pages);
    }

    /// Final removal on page destruction.
    pub fn remove_page(&mut self, pages: &mut Arena<PageSlot>, idx: PageIdx) {
        let bag = {
            let slot = pages.get(idx).expect("removing a dead page");
            assert!(slot.waiters.is_empty(), "destroying a page with waiters");
            debug_assert_eq!(slot.snapshot_refs, 0);
            slot.bag
        };
        self.bag_mut(bag).remove(pages, idx);
        self.evict_if_necessary(pages);
    }

    pub fn evict_if_necessary(&mut self, pages: &mut Arena<PageSlot>) {
        while self.in_memory_size() > self.memory_limit {
            let Some(victim) = self.pick_oldish(pages) else {
                break;
            };
            self.evictable_disk_backed.remove(pages, victim);
            let slot = pages.get_mut(victim).expect("eviction victim dead");
            debug_assert!(slot.token.is_some());
            slot.buf = None;
            trace!(page = ?victim, size = slot.ser_buf_size, "cache.evict.page");
            self.evicted.add(pages, victim, BagKind::Evicted);
            self.evictions += 1;
        }
    }

    /// Approximate-LRU selection: sample a few members of the disk-backed
    /// bag and take the least recently accessed one.
    fn pick_oldish(&mut self, pages: &Arena<PageSlot>) -> Option<PageIdx> {
        if self.evictable_disk_backed.is_empty() {
            return None;
        }
        let len = self.evictable_disk_backed.members.len();
        let mut best: Option<(PageIdx, u64)> = None;
        for _ in 0..self.sample.min(len) {
            let pos = (self.next_rand() % len as u64) as usize;
            let idx = self.evictable_disk_backed.members[pos];
            let access = pages.get(idx).expect("bag member dead").access_time;
            match best {
                Some((_, best_access)) if best_access <= access => {}
                _ => best = Some((idx, access)),
            }
        }
        best.map(|(idx, _)| idx)
    }

    fn next_rand(&mut self) -> u64 {
        // xorshift*; quality does not matter here, spread does.
        let mut x = self.rng;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.rng = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }
}
