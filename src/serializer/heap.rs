//! File-backed reference serializer.
//!
//! Blocks are appended to a heap file and addressed by `BlockToken`s; the
//! block index (token per id, delete bits, recency stamps) is kept in
//! memory and mutated only through atomic `index_write` batches. This is
//! the store the integration tests and benchmarks run against; a real
//! deployment substitutes its own `Serializer`.

use std::path::Path;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{CacheError, Result};
use crate::io::RandomFile;
use crate::signal::Signal;
use crate::types::{BlockId, Recency};

use super::{BlockToken, BlockWrite, IndexOp, IoAccount, Serializer};

struct IndexSlot {
    token: Option<BlockToken>,
    delete_bit: bool,
    recency: Recency,
}

impl IndexSlot {
    fn empty() -> Self {
        Self {
            token: None,
            delete_bit: false,
            recency: Recency::NONE,
        }
    }
}

struct HeapState {
    index: Vec<IndexSlot>,
    tail: u64,
    index_batches: Vec<Vec<IndexOp>>,
}

/// Append-only heap file with an in-memory block index.
pub struct HeapSerializer {
    file: RandomFile,
    block_size: u32,
    state: Mutex<HeapState>,
}

impl HeapSerializer {
    pub fn open(path: impl AsRef<Path>, block_size: u32) -> Result<Self> {
        if block_size == 0 {
            return Err(CacheError::Invalid("block size must be non-zero"));
        }
        let file = RandomFile::open(path)?;
        let tail = file.len()?;
        Ok(Self {
            file,
            block_size,
            state: Mutex::new(HeapState {
                index: Vec::new(),
                tail,
                index_batches: Vec::new(),
            }),
        })
    }

    /// Every `index_write` batch applied so far, oldest first.
    ///
    /// Introspection hook used by tests and tooling to observe flush
    /// ordering; the serializer itself never reads it back.
    pub fn index_batches(&self) -> Vec<Vec<IndexOp>> {
        self.state.lock().index_batches.clone()
    }

    fn slot_mut(index: &mut Vec<IndexSlot>, id: BlockId) -> &mut IndexSlot {
        let needed = id.0 as usize + 1;
        if index.len() < needed {
            index.resize_with(needed, IndexSlot::empty);
        }
        &mut index[id.0 as usize]
    }
}

impl Serializer for HeapSerializer {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn max_block_id(&self) -> BlockId {
        BlockId(self.state.lock().index.len() as u64)
    }

    fn get_delete_bit(&self, id: BlockId) -> Result<bool> {
        let state = self.state.lock();
        Ok(state
            .index
            .get(id.0 as usize)
            .map(|slot| slot.delete_bit)
            .unwrap_or(false))
    }

    fn index_read(&self, id: BlockId) -> Result<BlockToken> {
        let state = self.state.lock();
        let slot = state
            .index
            .get(id.0 as usize)
            .ok_or(CacheError::Invalid("block id not present in index"))?;
        if slot.delete_bit {
            return Err(CacheError::Invalid("block id is marked deleted"));
        }
        slot.token
            .clone()
            .ok_or(CacheError::Corruption("index slot has no token"))
    }

    fn block_read(&self, token: &BlockToken, buf: &mut [u8], account: &IoAccount) -> Result<()> {
        if buf.len() < token.len() as usize {
            return Err(CacheError::Invalid("read buffer smaller than block"));
        }
        trace!(
            offset = token.offset(),
            len = token.len(),
            priority = account.priority(),
            "heap.block_read"
        );
        self.file.read_at(token.offset(), &mut buf[..token.len() as usize])
    }

    fn block_writes(
        &self,
        writes: &[BlockWrite],
        account: &IoAccount,
        releasable: &Signal,
    ) -> Result<Vec<BlockToken>> {
        let mut state = self.state.lock();
        let mut tokens = Vec::with_capacity(writes.len());
        for write in writes {
            let offset = state.tail;
            let guard = write.image.read();
            let len = write.image.len();
            self.file.write_at(offset, &guard[..len as usize])?;
            state.tail += u64::from(len);
            tokens.push(BlockToken::new(offset, len));
        }
        self.file.sync_all()?;
        // The bytes have been copied into the heap file; submitted buffers
        // may be reused from here on.
        releasable.pulse();
        debug!(
            blocks = writes.len(),
            priority = account.priority(),
            tail = state.tail,
            "heap.block_writes"
        );
        Ok(tokens)
    }

    fn index_write(&self, ops: &[IndexOp], account: &IoAccount) -> Result<()> {
        let mut state = self.state.lock();
        for op in ops {
            match op {
                IndexOp::InstallToken { id, token, recency } => {
                    let slot = Self::slot_mut(&mut state.index, *id);
                    slot.token = Some(token.clone());
                    slot.delete_bit = false;
                    slot.recency = *recency;
                }
                IndexOp::Delete { id } => {
                    let slot = Self::slot_mut(&mut state.index, *id);
                    slot.token = None;
                    slot.delete_bit = true;
                }
                IndexOp::TouchRecency { id, recency } => {
                    let slot = Self::slot_mut(&mut state.index, *id);
                    slot.recency = *recency;
                }
            }
        }
        debug!(
            ops = ops.len(),
            priority = account.priority(),
            "heap.index_write"
        );
        state.index_batches.push(ops.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::RwLock;
    use std::sync::Arc;
    use tempfile::tempdir;

    use crate::serializer::PageImage;

    fn image_from(bytes: &[u8]) -> PageImage {
        let cell = Arc::new(RwLock::new(bytes.to_vec().into_boxed_slice()));
        PageImage::new(cell, bytes.len() as u32)
    }

    #[test]
    fn write_then_index_then_read() -> Result<()> {
        let dir = tempdir().unwrap();
        let heap = HeapSerializer::open(dir.path().join("heap.bin"), 64)?;
        let account = heap.make_io_account(0);

        let payload = vec![7u8; 64];
        let releasable = Signal::new();
        let tokens = heap.block_writes(
            &[BlockWrite {
                id: BlockId(0),
                image: image_from(&payload),
            }],
            &account,
            &releasable,
        )?;
        assert!(releasable.is_pulsed());
        heap.index_write(
            &[IndexOp::InstallToken {
                id: BlockId(0),
                token: tokens[0].clone(),
                recency: Recency::NONE,
            }],
            &account,
        )?;

        let token = heap.index_read(BlockId(0))?;
        let mut buf = vec![0u8; 64];
        heap.block_read(&token, &mut buf, &account)?;
        assert_eq!(buf, payload);
        assert_eq!(heap.max_block_id(), BlockId(1));
        Ok(())
    }

    #[test]
    fn delete_bit_round_trip() -> Result<()> {
        let dir = tempdir().unwrap();
        let heap = HeapSerializer::open(dir.path().join("heap.bin"), 32)?;
        let account = heap.make_io_account(0);

        let releasable = Signal::new();
        let tokens = heap.block_writes(
            &[BlockWrite {
                id: BlockId(3),
                image: image_from(&[1u8; 32]),
            }],
            &account,
            &releasable,
        )?;
        heap.index_write(
            &[IndexOp::InstallToken {
                id: BlockId(3),
                token: tokens[0].clone(),
                recency: Recency(9),
            }],
            &account,
        )?;
        assert!(!heap.get_delete_bit(BlockId(3))?);

        heap.index_write(&[IndexOp::Delete { id: BlockId(3) }], &account)?;
        assert!(heap.get_delete_bit(BlockId(3))?);
        assert!(heap.index_read(BlockId(3)).is_err());
        Ok(())
    }

    #[test]
    fn index_batches_record_call_order() -> Result<()> {
        let dir = tempdir().unwrap();
        let heap = HeapSerializer::open(dir.path().join("heap.bin"), 16)?;
        let account = heap.make_io_account(0);

        heap.index_write(
            &[IndexOp::TouchRecency {
                id: BlockId(1),
                recency: Recency(1),
            }],
            &account,
        )?;
        heap.index_write(&[IndexOp::Delete { id: BlockId(1) }], &account)?;

        let batches = heap.index_batches();
        assert_eq!(batches.len(), 2);
        assert!(matches!(batches[0][0], IndexOp::TouchRecency { .. }));
        assert!(matches!(batches[1][0], IndexOp::Delete { .. }));
        Ok(())
    }
}
