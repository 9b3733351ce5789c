//! Per-block acquisition handles.
//!
//! A `BlockLease` is one task's hold on a block within a transaction. Read
//! access arrives in arrival order and is shared; write access is
//! exclusive. Views and write guards keep the underlying page registered
//! as a buffer waiter, which pins it in memory until the guard drops.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::RawRwLock;

use crate::error::{CacheError, Result};
use crate::signal::Signal;
use crate::types::{BlockId, Recency};

use super::current::{self, ensure_current_page, AcqBinding, AcqIdx};
use super::page::{copy_page_for_write, register_buf_waiter, PageIdx};
use super::txn::retire_acquirer;
use super::{Access, Shared, Transaction};

/// A transaction's hold on one block, for reading or writing.
///
/// Dropping the lease commits its effect into the transaction: a dirtied
/// block is snapshotted for flushing, a write-acquired but unmodified
/// block is recorded as touched.
pub struct BlockLease<'txn> {
    txn: &'txn Transaction,
    acq: AcqIdx,
    block: BlockId,
    read_sig: Arc<Signal>,
    write_sig: Arc<Signal>,
}

impl<'txn> BlockLease<'txn> {
    pub(crate) fn new(
        txn: &'txn Transaction,
        acq: AcqIdx,
        block: BlockId,
        read_sig: Arc<Signal>,
        write_sig: Arc<Signal>,
    ) -> Self {
        Self {
            txn,
            acq,
            block,
            read_sig,
            write_sig,
        }
    }

    pub fn block_id(&self) -> BlockId {
        self.block
    }

    /// Whether the block is marked deleted, as visible to this acquirer.
    /// Blocks until read access is granted.
    pub fn is_deleted(&self) -> bool {
        self.read_sig.wait();
        let core = self.txn.shared.core.lock();
        match core.acqs.get(self.acq).expect("lease acquirer dead").binding {
            AcqBinding::Detached(snapshot) => snapshot.is_none(),
            AcqBinding::Queued => core.current(self.block).is_deleted,
        }
    }

    /// Waits for read access and the page buffer, then returns a stable
    /// view of the block's bytes. Reading a deleted block is a caller bug.
    pub fn read(&self) -> Result<PageView> {
        self.read_sig.wait();
        let shared = &self.txn.shared;
        let sig = Arc::new(Signal::new());
        let page = {
            let mut core = shared.core.lock();
            let page = match core.acqs.get(self.acq).expect("lease acquirer dead").binding {
                AcqBinding::Detached(Some(page)) => page,
                AcqBinding::Detached(None) => panic!("reading a deleted block"),
                AcqBinding::Queued => {
                    assert!(
                        !core.current(self.block).is_deleted,
                        "reading a deleted block"
                    );
                    ensure_current_page(shared, &mut core, self.block)
                }
            };
            register_buf_waiter(shared, &mut core, page, &sig);
            page
        };
        sig.wait();

        let (cell, len) = {
            let mut core = shared.core.lock();
            if let Some(message) = core.page_failure(page) {
                core.remove_buf_waiter(page, &sig);
                return Err(CacheError::Serializer(message));
            }
            let slot = core.pages.get(page).expect("page died under a waiter");
            (
                slot.buf.clone().expect("buffer-ready page without buffer"),
                slot.ser_buf_size,
            )
        };
        let guard = cell.read_arc();
        Ok(PageView {
            guard,
            len,
            _hold: BufHold {
                shared: Arc::clone(shared),
                page,
                sig,
            },
        })
    }

    /// Waits for exclusive write access and the page buffer, then returns
    /// a mutable guard. Obtaining the guard dirties the block and drops
    /// its disk token; if older snapshotters still reference the current
    /// version, the block is first switched to a private copy.
    pub fn write(&mut self) -> Result<PageWriteGuard> {
        self.write_sig.wait();
        let shared = &self.txn.shared;
        let sig = Arc::new(Signal::new());
        let page = {
            let mut core = shared.core.lock();
            {
                let slot = core.acqs.get(self.acq).expect("lease acquirer dead");
                assert_eq!(slot.access, Access::Write, "write through a read lease");
                debug_assert!(matches!(slot.binding, AcqBinding::Queued));
            }
            assert!(
                !core.current(self.block).is_deleted,
                "writing a deleted block"
            );
            let mut page = ensure_current_page(shared, &mut core, self.block);
            let refs = core
                .pages
                .get(page)
                .expect("current page is dead")
                .snapshot_refs;
            if refs > 1 {
                // Snapshotters keep the old version; the block moves to a
                // private copy that this writer may mutate.
                let copy = copy_page_for_write(shared, &mut core, page);
                core.page_ref_inc(copy);
                core.current_mut(self.block).page = Some(copy);
                core.page_ref_dec(page);
                page = copy;
            }
            core.acqs
                .get_mut(self.acq)
                .expect("lease acquirer dead")
                .dirtied = true;
            register_buf_waiter(shared, &mut core, page, &sig);
            page
        };
        sig.wait();

        let (cell, len) = {
            let mut core = shared.core.lock();
            if let Some(message) = core.page_failure(page) {
                core.remove_buf_waiter(page, &sig);
                return Err(CacheError::Serializer(message));
            }
            core.page_reset_token(page);
            let slot = core.pages.get(page).expect("page died under a waiter");
            (
                slot.buf.clone().expect("buffer-ready page without buffer"),
                slot.ser_buf_size,
            )
        };
        let guard = cell.write_arc();
        Ok(PageWriteGuard {
            guard,
            len,
            _hold: BufHold {
                shared: Arc::clone(shared),
                page,
                sig,
            },
        })
    }

    /// Waits for exclusive access and marks the block deleted. Later read
    /// acquirers observe the deletion; a later writer resurrects the block
    /// with a blank page.
    pub fn mark_deleted(&mut self) {
        self.write_sig.wait();
        let mut core = self.txn.shared.core.lock();
        {
            let slot = core.acqs.get_mut(self.acq).expect("lease acquirer dead");
            assert_eq!(slot.access, Access::Write, "deleting through a read lease");
            slot.dirtied = true;
        }
        core.mark_deleted(self.block);
    }

    /// Downgrades a writer to a reader, letting queued acquirers advance.
    pub fn declare_readonly(&mut self) {
        let shared = &self.txn.shared;
        let mut core = shared.core.lock();
        current::declare_readonly(shared, &mut core, self.acq);
    }

    /// Detaches this reader from the queue with a stable snapshot of the
    /// block; later writers no longer affect what it reads.
    pub fn declare_snapshotted(&mut self) {
        let shared = &self.txn.shared;
        let mut core = shared.core.lock();
        current::declare_snapshotted(shared, &mut core, self.acq);
    }

    /// Attaches an opaque recency stamp forwarded to the serializer with
    /// this block's index update.
    pub fn set_recency(&mut self, recency: Recency) {
        let mut core = self.txn.shared.core.lock();
        core.acqs
            .get_mut(self.acq)
            .expect("lease acquirer dead")
            .recency = Some(recency);
    }
}

impl Drop for BlockLease<'_> {
    fn drop(&mut self) {
        let shared = &self.txn.shared;
        let mut core = shared.core.lock();
        retire_acquirer(shared, &mut core, self.acq);
    }
}

/// Keeps the page registered as a buffer waiter (and therefore resident)
/// for the lifetime of a view or write guard.
struct BufHold {
    shared: Arc<Shared>,
    page: PageIdx,
    sig: Arc<Signal>,
}

impl Drop for BufHold {
    fn drop(&mut self) {
        let mut core = self.shared.core.lock();
        core.remove_buf_waiter(self.page, &self.sig);
    }
}

/// Shared read view of one page's bytes.
///
/// The view pins its page in memory and keeps the bytes readable even if
/// the page is evicted or the block moves on to a newer version.
pub struct PageView {
    guard: ArcRwLockReadGuard<RawRwLock, Box<[u8]>>,
    len: u32,
    _hold: BufHold,
}

impl Deref for PageView {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard[..self.len as usize]
    }
}

/// Exclusive mutable access to one page's bytes.
pub struct PageWriteGuard {
    guard: ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>,
    len: u32,
    _hold: BufHold,
}

impl Deref for PageWriteGuard {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard[..self.len as usize]
    }
}

impl DerefMut for PageWriteGuard {
    fn deref_mut(&mut self) -> &mut [u8] {
        let len = self.len as usize;
        &mut self.guard[..len]
    }
}
