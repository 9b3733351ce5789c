//! Transaction state and the flush DAG.
//!
//! A transaction is the atomic flush unit: the set of blocks its acquirers
//! dirtied or touched, plus preceder/subsequent edges to other
//! transactions. Edges are created when a transaction dirties a block that
//! another not-yet-flushed transaction modified last, or explicitly at
//! construction. A transaction flushes only once its preceder set is
//! empty; completing a flush removes it from its subsequents' preceder
//! sets, which may make them flushable in turn.

use std::sync::Arc;

use tracing::trace;

use crate::signal::Signal;
use crate::types::{BlockId, Recency};

use super::arena::Idx;
use super::current::{
    declare_readonly, declare_snapshotted, remove_from_queue, AcqBinding, AcqIdx,
};
use super::page::PageIdx;
use super::{Access, CacheCore, Shared};

/// One dirtied block carried by a transaction into its flush: the owned
/// page snapshot (`None` when the block was deleted) and the caller's
/// recency stamp.
pub(crate) struct DirtiedPage {
    pub block: BlockId,
    pub page: Option<PageIdx>,
    pub recency: Option<Recency>,
}

pub(crate) struct TxnSlot {
    pub live_acqs: Vec<AcqIdx>,
    pub snapshotted_dirtied: Vec<DirtiedPage>,
    pub touched: Vec<(BlockId, Option<Recency>)>,
    pub preceders: Vec<TxnIdx>,
    pub subseqers: Vec<TxnIdx>,
    /// Blocks whose current page this transaction modified last.
    pub pages_modified_last: Vec<BlockId>,
    pub began_waiting_for_flush: bool,
    pub flush_complete: Arc<Signal>,
    pub flush_error: Option<String>,
}

pub(crate) type TxnIdx = Idx<TxnSlot>;

impl CacheCore {
    pub(crate) fn new_txn(&mut self) -> TxnIdx {
        self.txns.alloc(TxnSlot {
            live_acqs: Vec::new(),
            snapshotted_dirtied: Vec::new(),
            touched: Vec::new(),
            preceders: Vec::new(),
            subseqers: Vec::new(),
            pages_modified_last: Vec::new(),
            began_waiting_for_flush: false,
            flush_complete: Arc::new(Signal::new()),
            flush_error: None,
        })
    }

    /// Adds a preceder edge unless the preceder already finished flushing.
    /// Edges are deduplicated; self-edges are a caller bug.
    pub(crate) fn connect_preceder(&mut self, txn: TxnIdx, preceder: TxnIdx) {
        assert_ne!(txn, preceder, "transaction cannot precede itself");
        let preceder_slot = self
            .txns
            .get(preceder)
            .expect("preceder transaction is dead");
        if preceder_slot.flush_complete.is_pulsed() {
            return;
        }
        let slot = self.txns.get_mut(txn).expect("transaction is dead");
        if slot.preceders.contains(&preceder) {
            return;
        }
        slot.preceders.push(preceder);
        self.txns
            .get_mut(preceder)
            .expect("preceder transaction is dead")
            .subseqers
            .push(txn);
        trace!(txn = ?txn, preceder = ?preceder, "cache.txn.preceder_added");
    }

    pub(crate) fn remove_preceder(&mut self, txn: TxnIdx, preceder: TxnIdx) {
        let slot = self.txns.get_mut(txn).expect("transaction is dead");
        let pos = slot
            .preceders
            .iter()
            .position(|p| *p == preceder)
            .expect("removing an absent preceder");
        slot.preceders.remove(pos);
    }

    /// Marks the transaction ready to flush; returns whether it can be
    /// scheduled immediately.
    pub(crate) fn announce_waiting_for_flush(&mut self, txn: TxnIdx) -> bool {
        let slot = self.txns.get_mut(txn).expect("transaction is dead");
        assert!(
            slot.live_acqs.is_empty(),
            "transaction announced flush with live acquirers"
        );
        assert!(!slot.began_waiting_for_flush, "flush announced twice");
        slot.began_waiting_for_flush = true;
        slot.preceders.is_empty()
    }
}

/// Retires an acquirer on destruction: records what it did to its block
/// into the transaction, wires the flush DAG through the block's last
/// modifier, and releases the acquirer's place in the queue.
pub(crate) fn retire_acquirer(shared: &Arc<Shared>, core: &mut CacheCore, acq: AcqIdx) {
    let (txn, block, access, dirtied, recency, read_pulsed, write_pulsed) = {
        let slot = core.acqs.get(acq).expect("retiring a dead acquirer");
        (
            slot.txn,
            slot.block,
            slot.access,
            slot.dirtied,
            slot.recency,
            slot.read_sig.is_pulsed(),
            slot.write_sig.is_pulsed(),
        )
    };

    {
        let slot = core.txns.get_mut(txn).expect("transaction is dead");
        let pos = slot
            .live_acqs
            .iter()
            .position(|live| *live == acq)
            .expect("acquirer missing from its transaction");
        slot.live_acqs.remove(pos);
    }

    // An acquirer that never obtained any access cannot have dirtied or
    // touched its block.
    if read_pulsed && access == Access::Write {
        if dirtied {
            debug_assert!(write_pulsed, "dirtied without exclusive access");
            let previous = core.change_last_modifier(block, txn);
            if previous != Some(txn) {
                {
                    let slot = core.txns.get_mut(txn).expect("transaction is dead");
                    debug_assert!(!slot.pages_modified_last.contains(&block));
                    slot.pages_modified_last.push(block);
                }
                if let Some(previous) = previous {
                    let prev_slot = core
                        .txns
                        .get_mut(previous)
                        .expect("last modifier transaction is dead");
                    let pos = prev_slot
                        .pages_modified_last
                        .iter()
                        .position(|b| *b == block)
                        .expect("last modifier lost its block record");
                    prev_slot.pages_modified_last.remove(pos);
                    core.connect_preceder(txn, previous);
                }
            }

            // Downgrade and snapshot so this transaction walks away owning
            // the exact version it wrote.
            declare_readonly(shared, core, acq);
            declare_snapshotted(shared, core, acq);
            let slot = core.acqs.get_mut(acq).expect("retiring a dead acquirer");
            let binding =
                std::mem::replace(&mut slot.binding, AcqBinding::Detached(None));
            let AcqBinding::Detached(snapshot) = binding else {
                unreachable!("snapshotted acquirer still queued");
            };
            core.txns
                .get_mut(txn)
                .expect("transaction is dead")
                .snapshotted_dirtied
                .push(DirtiedPage {
                    block,
                    page: snapshot,
                    recency,
                });
        } else {
            core.txns
                .get_mut(txn)
                .expect("transaction is dead")
                .touched
                .push((block, recency));
        }
    }

    let slot = core.acqs.get_mut(acq).expect("retiring a dead acquirer");
    let binding = std::mem::replace(&mut slot.binding, AcqBinding::Queued);
    match binding {
        AcqBinding::Queued => remove_from_queue(shared, core, block, acq),
        AcqBinding::Detached(Some(page)) => core.page_ref_dec(page),
        AcqBinding::Detached(None) => {}
    }
    core.acqs.free(acq);
}
