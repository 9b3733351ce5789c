//! The page cache and transaction engine.
//!
//! All non-flush state lives in [`CacheCore`] behind one mutex: the page
//! arena, the per-block current pages with their acquirer queues, the
//! transaction graph, the eviction bags, and the free list. Queue pulsing
//! and bag moves never block; every wait happens outside the lock on a
//! one-shot signal. Serializer calls are funneled through a dedicated
//! thread, and flushes run on a background worker in causal order.

mod arena;
mod current;
mod evict;
mod flush;
mod free_list;
mod lease;
mod page;
mod tasks;
mod txn;

pub use evict::CacheBalancer;
pub use lease::{BlockLease, PageView, PageWriteGuard};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, info};

use crate::error::{CacheError, Result};
use crate::serializer::{IoAccount, Serializer};
use crate::types::BlockId;

use arena::Arena;
use current::{AcqSlot, CurrentPage};
use evict::Evicter;
use flush::FlushQueue;
use free_list::FreeList;
use page::PageSlot;
use tasks::{SerialThread, TaskSet};
use txn::{TxnIdx, TxnSlot};

/// Requested access for one block acquisition.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Access {
    Read,
    Write,
}

/// Construction-time cache configuration.
#[derive(Clone)]
pub struct CacheOptions {
    /// Memory budget in bytes for resident page buffers.
    pub memory_limit: u64,
    /// How many candidates the evicter samples per eviction.
    pub eviction_sample: usize,
    /// Priority of the I/O account used for block reads.
    pub read_io_priority: u32,
    /// Priority of the I/O account used for flush writes.
    pub write_io_priority: u32,
    /// Optional process-wide balancer notified of access activity.
    pub balancer: Option<Arc<dyn CacheBalancer>>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            memory_limit: 64 << 20,
            eviction_sample: 8,
            read_io_priority: 100,
            write_io_priority: 50,
            balancer: None,
        }
    }
}

impl fmt::Debug for CacheOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheOptions")
            .field("memory_limit", &self.memory_limit)
            .field("eviction_sample", &self.eviction_sample)
            .field("read_io_priority", &self.read_io_priority)
            .field("write_io_priority", &self.write_io_priority)
            .field("balancer", &self.balancer.is_some())
            .finish()
    }
}

/// Point-in-time snapshot of cache activity.
#[derive(Default, Clone, Debug)]
pub struct CacheStats {
    pub in_memory_size: u64,
    pub memory_limit: u64,
    /// Bytes loaded since the memory limit last changed.
    pub bytes_loaded: u64,
    pub pages_loaded: u64,
    pub pages_evicted: u64,
    pub txns_flushed: u64,
    pub blocks_written: u64,
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "in_memory={}/{} loaded={} pages={} evicted={} flushed={} written={}",
            self.in_memory_size,
            self.memory_limit,
            self.bytes_loaded,
            self.pages_loaded,
            self.pages_evicted,
            self.txns_flushed,
            self.blocks_written
        )
    }
}

#[derive(Default)]
pub(crate) struct StatCounters {
    pub pages_loaded: u64,
    pub txns_flushed: u64,
    pub blocks_written: u64,
}

/// Every piece of cache state mutated on the "cache thread"; guarded by
/// one mutex in [`Shared`].
pub(crate) struct CacheCore {
    pub(crate) pages: Arena<PageSlot>,
    pub(crate) currents: HashMap<BlockId, CurrentPage>,
    pub(crate) acqs: Arena<AcqSlot>,
    pub(crate) txns: Arena<TxnSlot>,
    pub(crate) evicter: Evicter,
    pub(crate) free_list: FreeList,
    pub(crate) stats: StatCounters,
    pub(crate) block_size: u32,
}

pub(crate) struct Shared {
    pub(crate) core: Mutex<CacheCore>,
    pub(crate) serializer: Arc<dyn Serializer>,
    pub(crate) serial: SerialThread,
    pub(crate) tasks: TaskSet,
    pub(crate) flush: FlushQueue,
    pub(crate) read_account: Arc<IoAccount>,
    pub(crate) write_account: Arc<IoAccount>,
}

/// The cache instance: owns the in-memory page versions of every block,
/// coordinates acquirers, and flushes transactions to the serializer.
pub struct PageCache {
    shared: Arc<Shared>,
}

impl PageCache {
    pub fn new(serializer: Arc<dyn Serializer>, options: CacheOptions) -> Result<PageCache> {
        let block_size = serializer.block_size();
        let serial = SerialThread::new();
        let init = {
            let serializer = Arc::clone(&serializer);
            let read_priority = options.read_io_priority;
            let write_priority = options.write_io_priority;
            serial.call(move || -> Result<(IoAccount, IoAccount, BlockId, Vec<BlockId>)> {
                let read_account = serializer.make_io_account(read_priority);
                let write_account = serializer.make_io_account(write_priority);
                let max = serializer.max_block_id();
                let mut deleted = Vec::new();
                for raw in 0..max.0 {
                    if serializer.get_delete_bit(BlockId(raw))? {
                        deleted.push(BlockId(raw));
                    }
                }
                Ok((read_account, write_account, max, deleted))
            })
        };
        let (read_account, write_account, max, deleted) = match init {
            Ok(init) => init,
            Err(err) => {
                serial.stop();
                return Err(err);
            }
        };
        info!(
            max_block_id = max.0,
            recycled = deleted.len(),
            limit = options.memory_limit,
            "cache.open"
        );
        let core = CacheCore {
            pages: Arena::new(),
            currents: HashMap::new(),
            acqs: Arena::new(),
            txns: Arena::new(),
            evicter: Evicter::new(
                options.memory_limit,
                options.eviction_sample,
                options.balancer.clone(),
            ),
            free_list: FreeList::new(max, deleted),
            stats: StatCounters::default(),
            block_size,
        };
        Ok(PageCache {
            shared: Arc::new(Shared {
                core: Mutex::new(core),
                serializer,
                serial,
                tasks: TaskSet::new(),
                flush: FlushQueue::new(),
                read_account: Arc::new(read_account),
                write_account: Arc::new(write_account),
            }),
        })
    }

    /// Opens a transaction with no explicit ordering constraints.
    pub fn begin(&self) -> Transaction {
        self.begin_with_preceders(&[])
    }

    /// Opens a transaction whose flush must come after every listed
    /// preceder's.
    pub fn begin_with_preceders(&self, preceders: &[&Transaction]) -> Transaction {
        let mut core = self.shared.core.lock();
        let idx = core.new_txn();
        for preceder in preceders {
            core.connect_preceder(idx, preceder.idx);
        }
        Transaction {
            shared: Arc::clone(&self.shared),
            idx,
            finished: false,
        }
    }

    pub fn block_size(&self) -> u32 {
        self.shared.core.lock().block_size
    }

    pub fn in_memory_size(&self) -> u64 {
        self.shared.core.lock().evicter.in_memory_size()
    }

    pub fn memory_limit(&self) -> u64 {
        self.shared.core.lock().evicter.memory_limit()
    }

    /// Balancer hook: installs a new memory budget and evicts down to it
    /// before returning.
    pub fn update_memory_limit(&self, bytes: u64) {
        let mut core = self.shared.core.lock();
        let CacheCore {
            ref mut evicter,
            ref mut pages,
            ..
        } = *core;
        evicter.update_memory_limit(pages, bytes);
    }

    pub fn stats(&self) -> CacheStats {
        let core = self.shared.core.lock();
        CacheStats {
            in_memory_size: core.evicter.in_memory_size(),
            memory_limit: core.evicter.memory_limit(),
            bytes_loaded: core.evicter.bytes_loaded(),
            pages_loaded: core.stats.pages_loaded,
            pages_evicted: core.evicter.evictions,
            txns_flushed: core.stats.txns_flushed,
            blocks_written: core.stats.blocks_written,
        }
    }
}

impl Drop for PageCache {
    fn drop(&mut self) {
        {
            let core = self.shared.core.lock();
            assert_eq!(
                core.txns.live(),
                0,
                "page cache dropped with live transactions"
            );
        }
        self.shared.tasks.drain();
        self.shared.serial.stop();
    }
}

/// One atomic flush unit.
///
/// Acquire blocks through the transaction, drop the leases, then commit
/// (or drop) the transaction; either way it waits for its flush to
/// complete. Lease lifetimes are nested inside the transaction's borrow,
/// so a transaction cannot announce readiness while acquirers live.
pub struct Transaction {
    pub(crate) shared: Arc<Shared>,
    pub(crate) idx: TxnIdx,
    finished: bool,
}

impl Transaction {
    /// Acquires an existing block for reading or writing.
    pub fn acquire(&self, block: BlockId, access: Access) -> BlockLease<'_> {
        let shared = &self.shared;
        let mut core = shared.core.lock();
        let acq = current::acquire_block(shared, &mut core, self.idx, block, access);
        let (read_sig, write_sig) = {
            let slot = core.acqs.get(acq).expect("fresh acquirer is dead");
            (Arc::clone(&slot.read_sig), Arc::clone(&slot.write_sig))
        };
        BlockLease::new(self, acq, block, read_sig, write_sig)
    }

    /// Allocates a block id and acquires it for writing; the block starts
    /// out as a blank page.
    pub fn create(&self) -> (BlockId, BlockLease<'_>) {
        let shared = &self.shared;
        let mut core = shared.core.lock();
        let (block, acq) = current::acquire_new_block(shared, &mut core, self.idx);
        let (read_sig, write_sig) = {
            let slot = core.acqs.get(acq).expect("fresh acquirer is dead");
            (Arc::clone(&slot.read_sig), Arc::clone(&slot.write_sig))
        };
        (block, BlockLease::new(self, acq, block, read_sig, write_sig))
    }

    /// Waits for this transaction's flush to complete and surfaces any
    /// serializer failure recorded during it.
    pub fn commit(mut self) -> Result<()> {
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        self.finished = true;
        let ready = {
            let mut core = self.shared.core.lock();
            core.announce_waiting_for_flush(self.idx)
        };
        if ready {
            flush::enqueue_ready(&self.shared, vec![self.idx]);
        }
        let flush_complete = {
            let core = self.shared.core.lock();
            Arc::clone(
                &core
                    .txns
                    .get(self.idx)
                    .expect("transaction slot is dead")
                    .flush_complete,
            )
        };
        flush_complete.wait();

        let mut core = self.shared.core.lock();
        let slot = core.txns.free(self.idx);
        match slot.flush_error {
            None => Ok(()),
            Some(message) => Err(CacheError::Serializer(message)),
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(err) = self.finish() {
                // There is no caller left to observe the failure.
                error!(error = %err, "cache.txn.flush_failed_on_drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializer::HeapSerializer;
    use tempfile::tempdir;

    fn small_cache(dir: &std::path::Path) -> PageCache {
        let heap = Arc::new(HeapSerializer::open(dir.join("heap.bin"), 128).unwrap());
        PageCache::new(heap, CacheOptions::default()).unwrap()
    }

    #[test]
    fn overwrite_gains_preceder_edge_to_last_modifier() {
        let dir = tempdir().unwrap();
        let cache = small_cache(dir.path());

        let t1 = cache.begin();
        let (block, mut lease) = t1.create();
        lease.write().unwrap().fill(1);
        drop(lease);

        // t1 has not flushed yet; t2 overwriting the same block must order
        // itself after t1.
        let t2 = cache.begin();
        let mut lease = t2.acquire(block, Access::Write);
        lease.write().unwrap().fill(2);
        drop(lease);

        {
            let core = cache.shared.core.lock();
            let t2_slot = core.txns.get(t2.idx).unwrap();
            assert_eq!(t2_slot.preceders.len(), 1);
            assert_eq!(t2_slot.preceders[0], t1.idx);
            let t1_slot = core.txns.get(t1.idx).unwrap();
            assert_eq!(t1_slot.subseqers, vec![t2.idx]);
        }

        t1.commit().unwrap();
        t2.commit().unwrap();
    }

    #[test]
    fn redirtying_a_block_adds_no_self_edge() {
        let dir = tempdir().unwrap();
        let cache = small_cache(dir.path());

        let txn = cache.begin();
        let (block, mut lease) = txn.create();
        lease.write().unwrap().fill(1);
        drop(lease);
        let mut lease = txn.acquire(block, Access::Write);
        lease.write().unwrap().fill(2);
        drop(lease);

        {
            let core = cache.shared.core.lock();
            let slot = core.txns.get(txn.idx).unwrap();
            assert!(slot.preceders.is_empty());
            assert_eq!(slot.snapshotted_dirtied.len(), 2);
        }
        txn.commit().unwrap();
    }

    #[test]
    fn explicit_preceders_are_deduplicated() {
        let dir = tempdir().unwrap();
        let cache = small_cache(dir.path());

        let t1 = cache.begin();
        let t2 = cache.begin_with_preceders(&[&t1, &t1]);
        {
            let core = cache.shared.core.lock();
            assert_eq!(core.txns.get(t2.idx).unwrap().preceders.len(), 1);
        }
        t1.commit().unwrap();
        t2.commit().unwrap();
    }
}
