//! Background transaction flushing.
//!
//! Ready transactions queue here and a worker thread (spawned on demand,
//! exiting when the queue drains) flushes them one at a time: snapshot the
//! partition under the core lock, run the serializer round trip off-lock
//! on the serializer thread, then install tokens, advance the DAG, and
//! pulse flush-complete. Because preceder edges are only removed after a
//! flush's index write returns, a transaction's index write always returns
//! before any of its subsequents' begin.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::error::Result;
use crate::serializer::{BlockToken, BlockWrite, IndexOp, PageImage};
use crate::signal::Signal;
use crate::types::{BlockId, Recency};

use super::page::PageIdx;
use super::txn::TxnIdx;
use super::{CacheCore, Shared};

struct FlushState {
    pending: VecDeque<TxnIdx>,
    worker_running: bool,
}

pub(crate) struct FlushQueue {
    state: Mutex<FlushState>,
}

impl FlushQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FlushState {
                pending: VecDeque::new(),
                worker_running: false,
            }),
        }
    }
}

/// Queues transactions whose preceder set just became empty. Must not be
/// called with the core lock held.
pub(crate) fn enqueue_ready(shared: &Arc<Shared>, ready: Vec<TxnIdx>) {
    if ready.is_empty() {
        return;
    }
    let mut state = shared.flush.state.lock();
    state.pending.extend(ready);
    if !state.worker_running {
        state.worker_running = true;
        let worker_shared = Arc::clone(shared);
        shared.tasks.spawn(move || worker_loop(worker_shared));
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let next = {
            let mut state = shared.flush.state.lock();
            match state.pending.pop_front() {
                Some(txn) => Some(txn),
                None => {
                    state.worker_running = false;
                    None
                }
            }
        };
        match next {
            Some(txn) => flush_txn(&shared, txn),
            None => break,
        }
    }
}

fn flush_txn(shared: &Arc<Shared>, txn: TxnIdx) {
    // Partition the transaction's output under the core lock.
    let mut index_ops: Vec<IndexOp> = Vec::new();
    let mut writes: Vec<BlockWrite> = Vec::new();
    let mut ancillary: Vec<(BlockId, Option<Recency>)> = Vec::new();
    let mut written_pages: Vec<PageIdx> = Vec::new();
    {
        let core = shared.core.lock();
        let slot = core.txns.get(txn).expect("flushing a dead transaction");
        for dirtied in &slot.snapshotted_dirtied {
            match dirtied.page {
                None => index_ops.push(IndexOp::Delete { id: dirtied.block }),
                Some(page) => {
                    let page_slot = core.pages.get(page).expect("dirty page is dead");
                    if let Some(token) = &page_slot.token {
                        // Still clean on disk; only the index entry moves.
                        index_ops.push(IndexOp::InstallToken {
                            id: dirtied.block,
                            token: token.clone(),
                            recency: dirtied.recency.unwrap_or(Recency::NONE),
                        });
                    } else {
                        // A dirtied page cannot still be loading: the
                        // writer held its buffer, and losing the buffer
                        // would have installed a token.
                        assert!(!page_slot.loading);
                        let cell = page_slot
                            .buf
                            .clone()
                            .expect("dirty page without buffer or token");
                        writes.push(BlockWrite {
                            id: dirtied.block,
                            image: PageImage::new(cell, page_slot.ser_buf_size),
                        });
                        ancillary.push((dirtied.block, dirtied.recency));
                        written_pages.push(page);
                    }
                }
            }
        }
        for (block, recency) in &slot.touched {
            index_ops.push(IndexOp::TouchRecency {
                id: *block,
                recency: recency.unwrap_or(Recency::NONE),
            });
        }
    }

    // Serializer round trip, off the core lock. Read-only transactions
    // skip it entirely.
    let result: Result<Vec<BlockToken>> = if writes.is_empty() && index_ops.is_empty() {
        trace!(txn = ?txn, "cache.flush.empty");
        Ok(Vec::new())
    } else {
        debug!(
            txn = ?txn,
            new_writes = writes.len(),
            index_ops = index_ops.len(),
            "cache.flush.begin"
        );
        let serializer = Arc::clone(&shared.serializer);
        let account = Arc::clone(&shared.write_account);
        shared.serial.call(move || -> Result<Vec<BlockToken>> {
            let releasable = Signal::new();
            let tokens = serializer.block_writes(&writes, &account, &releasable)?;
            assert_eq!(tokens.len(), writes.len());
            releasable.wait();
            let mut ops = index_ops;
            for (token, (block, recency)) in tokens.iter().zip(&ancillary) {
                ops.push(IndexOp::InstallToken {
                    id: *block,
                    token: token.clone(),
                    recency: recency.unwrap_or(Recency::NONE),
                });
            }
            serializer.index_write(&ops, &account)?;
            Ok(tokens)
        })
    };

    // Install tokens, advance the DAG, release the transaction's pages.
    let ready = {
        let mut core = shared.core.lock();
        match result {
            Ok(tokens) => {
                for (page, token) in written_pages.iter().zip(tokens) {
                    let installed = match core.pages.get_mut(*page) {
                        Some(slot) => {
                            debug_assert!(slot.token.is_none());
                            slot.token = Some(token);
                            true
                        }
                        None => false,
                    };
                    if installed {
                        let CacheCore {
                            ref mut evicter,
                            ref mut pages,
                            ..
                        } = *core;
                        evicter.change_to_correct_bag(pages, *page);
                    }
                }
                core.stats.blocks_written += written_pages.len() as u64;
            }
            Err(err) => {
                error!(txn = ?txn, error = %err, "cache.flush.failed");
                core.txns
                    .get_mut(txn)
                    .expect("flushing a dead transaction")
                    .flush_error = Some(err.to_carried());
            }
        }

        let dirtied = std::mem::take(
            &mut core
                .txns
                .get_mut(txn)
                .expect("flushing a dead transaction")
                .snapshotted_dirtied,
        );
        for entry in dirtied {
            if let Some(page) = entry.page {
                core.page_ref_dec(page);
            }
        }
        core.txns.get_mut(txn).unwrap().touched.clear();

        let modified = std::mem::take(&mut core.txns.get_mut(txn).unwrap().pages_modified_last);
        for block in modified {
            core.clear_last_modifier(block, txn);
        }

        let subseqers = std::mem::take(&mut core.txns.get_mut(txn).unwrap().subseqers);
        let mut ready = Vec::new();
        for subseqer in subseqers {
            core.remove_preceder(subseqer, txn);
            let slot = core.txns.get(subseqer).expect("subsequent is dead");
            if slot.began_waiting_for_flush && slot.preceders.is_empty() {
                ready.push(subseqer);
            }
        }

        core.stats.txns_flushed += 1;
        core.txns.get(txn).unwrap().flush_complete.pulse();
        debug!(txn = ?txn, unblocked = ready.len(), "cache.flush.complete");
        ready
    };

    enqueue_ready(shared, ready);
}
