//! Per-block acquirer ordering.
//!
//! Every block id has at most one `CurrentPage`, which owns the live page
//! version newly arriving acquirers see and the FIFO queue of acquirers.
//! Advancing the queue ("pulsing") happens entirely under the core lock:
//! consecutive readers are granted read access together, a writer waits
//! until it is alone at the head and then holds the block exclusively, and
//! a reader that declared itself snapshotted leaves the queue early with
//! its own reference to the version current at that moment.

use std::sync::Arc;

use tracing::trace;

use crate::signal::Signal;
use crate::types::{BlockId, Recency};

use super::arena::Idx;
use super::page::{spawn_page_load, PageIdx};
use super::txn::TxnIdx;
use super::{Access, CacheCore, Shared};

pub(crate) struct CurrentPage {
    pub page: Option<PageIdx>,
    pub is_deleted: bool,
    /// Transaction that most recently dirtied this block; threads the
    /// flush DAG.
    pub last_modifier: Option<TxnIdx>,
    pub queue: Vec<AcqIdx>,
    /// The deleted block's id has been handed back to the free list.
    pub id_released: bool,
}

impl CurrentPage {
    fn new() -> Self {
        Self {
            page: None,
            is_deleted: false,
            last_modifier: None,
            queue: Vec::new(),
            id_released: false,
        }
    }
}

/// Where an acquirer's reads resolve to.
#[derive(Copy, Clone)]
pub(crate) enum AcqBinding {
    /// Still in the queue; reads see the block's current page.
    Queued,
    /// Left the queue with an owned reference; `None` marks a snapshot of
    /// a deleted block.
    Detached(Option<PageIdx>),
}

pub(crate) struct AcqSlot {
    pub txn: TxnIdx,
    pub block: BlockId,
    pub access: Access,
    pub declared_snapshotted: bool,
    pub dirtied: bool,
    pub recency: Option<Recency>,
    pub read_sig: Arc<Signal>,
    pub write_sig: Arc<Signal>,
    pub binding: AcqBinding,
}

pub(crate) type AcqIdx = Idx<AcqSlot>;

impl CacheCore {
    pub(crate) fn current(&self, block: BlockId) -> &CurrentPage {
        self.currents.get(&block).expect("no current page for block")
    }

    pub(crate) fn current_mut(&mut self, block: BlockId) -> &mut CurrentPage {
        self.currents
            .get_mut(&block)
            .expect("no current page for block")
    }

    pub(crate) fn change_last_modifier(
        &mut self,
        block: BlockId,
        txn: TxnIdx,
    ) -> Option<TxnIdx> {
        self.current_mut(block).last_modifier.replace(txn)
    }

    pub(crate) fn clear_last_modifier(&mut self, block: BlockId, txn: TxnIdx) {
        let current = self.current_mut(block);
        debug_assert_eq!(current.last_modifier, Some(txn));
        current.last_modifier = None;
    }

    /// Marks the block deleted and drops the current page reference.
    pub(crate) fn mark_deleted(&mut self, block: BlockId) {
        let current = self.current_mut(block);
        assert!(!current.is_deleted, "block deleted twice");
        current.is_deleted = true;
        if let Some(page) = current.page.take() {
            self.page_ref_dec(page);
        }
        trace!(block = block.0, "cache.current.mark_deleted");
    }

    fn maybe_release_deleted_id(&mut self, block: BlockId) {
        let current = self.current_mut(block);
        if current.is_deleted && current.queue.is_empty() && !current.id_released {
            current.id_released = true;
            self.free_list.release(block);
            trace!(block = block.0, "cache.current.id_released");
        }
    }
}

/// Lazily materializes the current page of a block, starting a load from
/// the serializer when the block has never been touched in memory.
pub(crate) fn ensure_current_page(
    shared: &Arc<Shared>,
    core: &mut CacheCore,
    block: BlockId,
) -> PageIdx {
    let current = core.current(block);
    assert!(!current.is_deleted, "materializing a deleted block");
    if let Some(page) = current.page {
        return page;
    }
    let page = core.new_loading_page(block);
    core.page_ref_inc(page);
    core.current_mut(block).page = Some(page);
    spawn_page_load(shared, page, block, None);
    page
}

/// Appends an acquirer for an existing block id and pulses the queue.
pub(crate) fn acquire_block(
    shared: &Arc<Shared>,
    core: &mut CacheCore,
    txn: TxnIdx,
    block: BlockId,
    access: Access,
) -> AcqIdx {
    core.currents.entry(block).or_insert_with(CurrentPage::new);
    push_acquirer(shared, core, txn, block, access)
}

/// Allocates a fresh block id (possibly recycled) and appends a write
/// acquirer against its brand-new empty page.
pub(crate) fn acquire_new_block(
    shared: &Arc<Shared>,
    core: &mut CacheCore,
    txn: TxnIdx,
) -> (BlockId, AcqIdx) {
    let block = core.free_list.acquire();
    let buf = vec![0u8; core.block_size as usize].into_boxed_slice();
    if core.currents.contains_key(&block) {
        assert!(
            core.current(block).is_deleted,
            "free list produced a block id that is still live"
        );
        let page = core.new_fresh_page(block, buf);
        core.page_ref_inc(page);
        let current = core.current_mut(block);
        current.page = Some(page);
        current.is_deleted = false;
        current.id_released = false;
    } else {
        let page = core.new_fresh_page(block, buf);
        core.page_ref_inc(page);
        let mut current = CurrentPage::new();
        current.page = Some(page);
        core.currents.insert(block, current);
    }
    trace!(block = block.0, "cache.current.new_block");
    let acq = push_acquirer(shared, core, txn, block, Access::Write);
    (block, acq)
}

fn push_acquirer(
    shared: &Arc<Shared>,
    core: &mut CacheCore,
    txn: TxnIdx,
    block: BlockId,
    access: Access,
) -> AcqIdx {
    let acq = core.acqs.alloc(AcqSlot {
        txn,
        block,
        access,
        declared_snapshotted: false,
        dirtied: false,
        recency: None,
        read_sig: Arc::new(Signal::new()),
        write_sig: Arc::new(Signal::new()),
        binding: AcqBinding::Queued,
    });
    core.current_mut(block).queue.push(acq);
    core.txns
        .get_mut(txn)
        .expect("acquiring under a dead transaction")
        .live_acqs
        .push(acq);
    pulse_acquirers(shared, core, block, acq);
    acq
}

/// Removes a still-queued acquirer and advances its successor. Returns the
/// block id to the free list once a deleted block's queue empties.
pub(crate) fn remove_from_queue(
    shared: &Arc<Shared>,
    core: &mut CacheCore,
    block: BlockId,
    acq: AcqIdx,
) {
    let current = core.current_mut(block);
    let pos = current
        .queue
        .iter()
        .position(|queued| *queued == acq)
        .expect("removing an acquirer that is not queued");
    current.queue.remove(pos);
    let successor = current.queue.get(pos).copied();
    match successor {
        Some(next) => pulse_acquirers(shared, core, block, next),
        None => core.maybe_release_deleted_id(block),
    }
}

pub(crate) fn declare_readonly(shared: &Arc<Shared>, core: &mut CacheCore, acq: AcqIdx) {
    let (block, queued) = {
        let slot = core.acqs.get_mut(acq).expect("downgrade of a dead acquirer");
        slot.access = Access::Read;
        (slot.block, matches!(slot.binding, AcqBinding::Queued))
    };
    if queued {
        pulse_acquirers(shared, core, block, acq);
    }
}

pub(crate) fn declare_snapshotted(shared: &Arc<Shared>, core: &mut CacheCore, acq: AcqIdx) {
    let (block, queued) = {
        let slot = core.acqs.get_mut(acq).expect("snapshot of a dead acquirer");
        assert_eq!(
            slot.access,
            Access::Read,
            "only read acquirers can be snapshotted"
        );
        // Redeclaration is allowed and does nothing.
        if slot.declared_snapshotted {
            return;
        }
        slot.declared_snapshotted = true;
        (slot.block, matches!(slot.binding, AcqBinding::Queued))
    };
    if queued {
        pulse_acquirers(shared, core, block, acq);
    }
}

/// Advances the acquirer queue starting at `start`.
///
/// Grants are monotone: read signals pulse in arrival order, writers pulse
/// their write signal only when alone at the head, and a snapshotted
/// reader is detached with a reference to the page version current at this
/// instant. The walk stops at the first writer that is not at the head.
pub(crate) fn pulse_acquirers(
    shared: &Arc<Shared>,
    core: &mut CacheCore,
    block: BlockId,
    start: AcqIdx,
) {
    let Some(mut pos) = core
        .current(block)
        .queue
        .iter()
        .position(|queued| *queued == start)
    else {
        return;
    };

    // Nothing to do while a predecessor still gates us.
    if pos > 0 {
        let prev = core.current(block).queue[pos - 1];
        let prev_slot = core.acqs.get(prev).expect("queued acquirer is dead");
        let prev_grants = prev_slot.access == Access::Read && prev_slot.read_sig.is_pulsed();
        if !prev_grants {
            return;
        }
    }
    // Avoid re-walking chains that were already granted.
    {
        let slot = core.acqs.get(start).expect("pulsing a dead acquirer");
        if slot.access == Access::Read
            && slot.read_sig.is_pulsed()
            && !slot.declared_snapshotted
        {
            return;
        }
    }

    loop {
        let Some(&cur) = core.current(block).queue.get(pos) else {
            break;
        };
        let (access, snapshotted, read_sig, write_sig) = {
            let slot = core.acqs.get(cur).expect("queued acquirer is dead");
            (
                slot.access,
                slot.declared_snapshotted,
                Arc::clone(&slot.read_sig),
                Arc::clone(&slot.write_sig),
            )
        };
        // The predecessor (if any) holds read access, so the current
        // acquirer may read as well.
        read_sig.pulse();

        match access {
            Access::Read => {
                if snapshotted {
                    let snapshot = if core.current(block).is_deleted {
                        None
                    } else {
                        Some(ensure_current_page(shared, core, block))
                    };
                    if let Some(page) = snapshot {
                        core.page_ref_inc(page);
                    }
                    let slot = core.acqs.get_mut(cur).expect("queued acquirer is dead");
                    slot.binding = AcqBinding::Detached(snapshot);
                    core.current_mut(block).queue.remove(pos);
                    core.maybe_release_deleted_id(block);
                    trace!(block = block.0, "cache.current.snapshot_detached");
                    // The successor slid into `pos`; keep walking there.
                } else {
                    pos += 1;
                }
            }
            Access::Write => {
                if pos == 0 {
                    if core.current(block).is_deleted {
                        // Write acquisition of a deleted block resurrects
                        // it with a blank full-size page.
                        if core.current(block).id_released {
                            core.free_list.steal(block);
                        }
                        let buf = vec![0u8; core.block_size as usize].into_boxed_slice();
                        let page = core.new_fresh_page(block, buf);
                        core.page_ref_inc(page);
                        let current = core.current_mut(block);
                        current.page = Some(page);
                        current.is_deleted = false;
                        current.id_released = false;
                        trace!(block = block.0, "cache.current.resurrected");
                    }
                    write_sig.pulse();
                }
                // Later acquirers stay blocked behind the writer.
                break;
            }
        }
    }
}
