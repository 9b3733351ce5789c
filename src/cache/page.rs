//! In-memory page versions.
//!
//! A `PageSlot` is one version of one block's bytes. Several versions of
//! the same block can be alive at once: the current one owned by the
//! block's `CurrentPage`, plus older versions kept alive by snapshotted
//! readers and by transactions waiting to flush. A page is destroyed when
//! its last reference is dropped; asynchronous loaders detect destruction
//! through the arena generation check and abandon their work.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::serializer::BlockToken;
use crate::signal::Signal;
use crate::types::BlockId;

use super::arena::Idx;
use super::evict::BagKind;
use super::{CacheCore, Shared};

pub(crate) type BufCell = Arc<RwLock<Box<[u8]>>>;

pub(crate) struct PageSlot {
    /// Which block this version belongs to (diagnostics only).
    pub block: BlockId,
    pub buf: Option<BufCell>,
    /// Zero until the first buffer install.
    pub ser_buf_size: u32,
    pub token: Option<BlockToken>,
    /// An asynchronous construction is in flight.
    pub loading: bool,
    /// Sticky record of a failed load, handed to every waiter.
    pub load_failed: Option<String>,
    /// Buffer-ready signals of the acquirers using this exact version.
    pub waiters: Vec<Arc<Signal>>,
    pub snapshot_refs: u32,
    pub access_time: u64,
    pub bag: BagKind,
    pub bag_pos: usize,
}

pub(crate) type PageIdx = Idx<PageSlot>;

pub(crate) enum WaiterOutcome {
    /// Buffer (or failure) already present; the signal was pulsed.
    Ready,
    /// A load is in flight; the signal pulses when it finishes.
    Pending,
    /// The caller must start a re-load from the page's retained token.
    NeedsLoad(BlockToken),
}

impl PageSlot {
    fn empty(block: BlockId) -> Self {
        Self {
            block,
            buf: None,
            ser_buf_size: 0,
            token: None,
            loading: false,
            load_failed: None,
            waiters: Vec::new(),
            snapshot_refs: 0,
            access_time: 0,
            bag: BagKind::Unevictable,
            bag_pos: 0,
        }
    }
}

impl CacheCore {
    /// Creates a page whose buffer will arrive asynchronously.
    pub(crate) fn new_loading_page(&mut self, block: BlockId) -> PageIdx {
        let mut slot = PageSlot::empty(block);
        slot.loading = true;
        let idx = self.pages.alloc(slot);
        self.evicter.add_not_yet_loaded(&mut self.pages, idx);
        trace!(block = block.0, page = ?idx, "cache.page.new_loading");
        idx
    }

    /// Creates a page from an already materialized buffer.
    pub(crate) fn new_fresh_page(&mut self, block: BlockId, buf: Box<[u8]>) -> PageIdx {
        let mut slot = PageSlot::empty(block);
        slot.ser_buf_size = buf.len() as u32;
        slot.buf = Some(Arc::new(RwLock::new(buf)));
        let idx = self.pages.alloc(slot);
        self.evicter
            .add_to_evictable_unbacked(&mut self.pages, idx);
        trace!(block = block.0, page = ?idx, "cache.page.new_fresh");
        idx
    }

    pub(crate) fn page_ref_inc(&mut self, idx: PageIdx) {
        let slot = self.pages.get_mut(idx).expect("ref on a dead page");
        slot.snapshot_refs += 1;
    }

    /// Drops one reference; destroys the page when the count reaches zero.
    pub(crate) fn page_ref_dec(&mut self, idx: PageIdx) {
        let refs = {
            let slot = self.pages.get_mut(idx).expect("unref of a dead page");
            assert!(slot.snapshot_refs > 0, "reference count underflow");
            slot.snapshot_refs -= 1;
            slot.snapshot_refs
        };
        if refs == 0 {
            self.evicter.remove_page(&mut self.pages, idx);
            let slot = self.pages.free(idx);
            trace!(block = slot.block.0, page = ?idx, "cache.page.destroy");
        }
    }

    /// Drops the disk token when a holder obtains write access; the on-disk
    /// copy no longer matches the buffer about to be mutated.
    pub(crate) fn page_reset_token(&mut self, idx: PageIdx) {
        let slot = self.pages.get_mut(idx).expect("token reset on dead page");
        debug_assert!(
            !slot.waiters.is_empty(),
            "writer resetting a token must hold the buffer"
        );
        if slot.token.take().is_some() {
            self.evicter.change_to_correct_bag(&mut self.pages, idx);
        }
    }

    /// Registers a buffer-ready waiter on a page version.
    pub(crate) fn add_buf_waiter(&mut self, idx: PageIdx, sig: &Arc<Signal>) -> WaiterOutcome {
        let access = self.evicter.next_access_time();
        let slot = self.pages.get_mut(idx).expect("waiter on a dead page");
        slot.waiters.push(Arc::clone(sig));
        slot.access_time = access;
        let outcome = if slot.buf.is_some() || slot.load_failed.is_some() {
            sig.pulse();
            WaiterOutcome::Ready
        } else if slot.loading {
            WaiterOutcome::Pending
        } else {
            // Evicted page: the buffer is gone but the token survived.
            let token = slot
                .token
                .clone()
                .expect("bufferless page without token or load");
            slot.loading = true;
            WaiterOutcome::NeedsLoad(token)
        };
        self.evicter.change_to_correct_bag(&mut self.pages, idx);
        outcome
    }

    pub(crate) fn remove_buf_waiter(&mut self, idx: PageIdx, sig: &Arc<Signal>) {
        let slot = self.pages.get_mut(idx).expect("waiter removal on dead page");
        let pos = slot
            .waiters
            .iter()
            .position(|w| Arc::ptr_eq(w, sig))
            .expect("removing an unregistered waiter");
        slot.waiters.swap_remove(pos);
        self.evicter.change_to_correct_bag(&mut self.pages, idx);
    }

    /// Installs the result of an asynchronous load or copy.
    pub(crate) fn install_loaded(
        &mut self,
        idx: PageIdx,
        buf: Box<[u8]>,
        token: Option<BlockToken>,
    ) {
        let Some(slot) = self.pages.get_mut(idx) else {
            // Destroyed while loading; the loader simply drops its work.
            trace!(page = ?idx, "cache.page.load_abandoned");
            return;
        };
        debug_assert!(slot.loading);
        debug_assert!(slot.buf.is_none());
        // A re-load of an evicted page keeps its known size, which its bag
        // already accounts for; only a first load adds new bytes.
        let first_load = slot.ser_buf_size == 0;
        let size = buf.len() as u32;
        slot.ser_buf_size = size;
        slot.buf = Some(Arc::new(RwLock::new(buf)));
        slot.token = token;
        slot.loading = false;
        let waiters: Vec<Arc<Signal>> = slot.waiters.iter().map(Arc::clone).collect();
        self.stats.pages_loaded += 1;
        if first_load {
            self.evicter.add_now_loaded_size(&mut self.pages, idx);
        } else {
            self.evicter.evict_if_necessary(&mut self.pages);
            self.evicter.notify_access(u64::from(size));
        }
        if waiters.is_empty() {
            self.evicter.change_to_correct_bag(&mut self.pages, idx);
        } else {
            for waiter in waiters {
                waiter.pulse();
            }
        }
    }

    pub(crate) fn fail_load(&mut self, idx: PageIdx, message: String) {
        let Some(slot) = self.pages.get_mut(idx) else {
            return;
        };
        warn!(block = slot.block.0, error = %message, "cache.page.load_failed");
        slot.loading = false;
        slot.load_failed = Some(message);
        let waiters: Vec<Arc<Signal>> = slot.waiters.iter().map(Arc::clone).collect();
        for waiter in waiters {
            waiter.pulse();
        }
        self.evicter.change_to_correct_bag(&mut self.pages, idx);
    }

    /// Snapshot of a page's load failure, if any.
    pub(crate) fn page_failure(&self, idx: PageIdx) -> Option<String> {
        self.pages.get(idx).and_then(|slot| slot.load_failed.clone())
    }
}

/// Starts an asynchronous load of a page's bytes. With a token, reads the
/// retained on-disk version directly; without one, consults the index
/// first. The page slot is revalidated after the serializer round trip.
pub(crate) fn spawn_page_load(
    shared: &Arc<Shared>,
    page: PageIdx,
    block: BlockId,
    token: Option<BlockToken>,
) {
    debug!(block = block.0, reload = token.is_some(), "cache.page.load_start");
    let task_shared = Arc::clone(shared);
    shared.tasks.spawn(move || {
        let shared = task_shared;
        let serializer = Arc::clone(&shared.serializer);
        let account = Arc::clone(&shared.read_account);
        let result = shared
            .serial
            .call(move || -> Result<(Box<[u8]>, BlockToken)> {
                let token = match token {
                    Some(token) => token,
                    None => serializer.index_read(block)?,
                };
                let mut buf = serializer.alloc_buffer();
                serializer.block_read(&token, &mut buf, &account)?;
                Ok((buf, token))
            });
        let mut core = shared.core.lock();
        match result {
            Ok((buf, token)) => core.install_loaded(page, buf, Some(token)),
            Err(err) => core.fail_load(page, err.to_carried()),
        }
    });
}

/// Produces a copy of `copyee` for a writer that must not disturb the
/// snapshotters still reading it. The copy is synchronous when the source
/// buffer is resident, asynchronous (waiting on the source's buffer-ready)
/// otherwise.
pub(crate) fn copy_page_for_write(
    shared: &Arc<Shared>,
    core: &mut CacheCore,
    copyee: PageIdx,
) -> PageIdx {
    let block = core.pages.get(copyee).expect("copy of a dead page").block;
    let dst = core.new_loading_page(block);
    let resident = core
        .pages
        .get(copyee)
        .expect("copy of a dead page")
        .buf
        .clone();
    if let Some(cell) = resident {
        let bytes = cell.read().clone();
        core.install_loaded(dst, bytes, None);
        return dst;
    }

    // Source still materializing; keep it alive and wait for its buffer.
    core.page_ref_inc(copyee);
    let sig = Arc::new(Signal::new());
    register_buf_waiter(shared, core, copyee, &sig);
    let task_shared = Arc::clone(shared);
    shared.tasks.spawn(move || {
        sig.wait();
        let mut core = task_shared.core.lock();
        let outcome = core
            .pages
            .get(copyee)
            .map(|slot| (slot.buf.clone(), slot.load_failed.clone()));
        match outcome {
            Some((Some(cell), _)) => {
                let bytes = cell.read().clone();
                core.install_loaded(dst, bytes, None);
            }
            Some((None, failure)) => {
                let message = failure.unwrap_or_else(|| "copy source lost its buffer".into());
                core.fail_load(dst, message);
            }
            None => core.fail_load(dst, "copy source destroyed".into()),
        }
        if core.pages.contains(copyee) {
            core.remove_buf_waiter(copyee, &sig);
            core.page_ref_dec(copyee);
        }
    });
    dst
}

/// Registers a waiter and, when the page turns out to be evicted, starts
/// the re-load that will pulse it.
pub(crate) fn register_buf_waiter(
    shared: &Arc<Shared>,
    core: &mut CacheCore,
    page: PageIdx,
    sig: &Arc<Signal>,
) {
    match core.add_buf_waiter(page, sig) {
        WaiterOutcome::Ready | WaiterOutcome::Pending => {}
        WaiterOutcome::NeedsLoad(token) => {
            let block = core.pages.get(page).expect("waiter on dead page").block;
            spawn_page_load(shared, page, block, Some(token));
        }
    }
}
