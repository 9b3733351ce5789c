//! Contract between the page cache and the durable block store.
//!
//! The cache consumes this interface only; it has no on-disk format of its
//! own beyond the block-id/token correspondence the serializer maintains.

mod heap;

pub use heap::HeapSerializer;

use std::sync::Arc;

use parking_lot::lock_api::ArcRwLockReadGuard;
use parking_lot::{RawRwLock, RwLock};

use crate::error::Result;
use crate::signal::Signal;
use crate::types::{BlockId, Recency};

/// Handle to the on-disk storage of one version of one block.
///
/// Tokens are reference counted; the serializer keeps the referenced bytes
/// readable for as long as any clone of the token is alive.
#[derive(Clone)]
pub struct BlockToken {
    location: Arc<TokenLocation>,
}

struct TokenLocation {
    offset: u64,
    len: u32,
}

impl BlockToken {
    pub fn new(offset: u64, len: u32) -> Self {
        Self {
            location: Arc::new(TokenLocation { offset, len }),
        }
    }

    pub fn offset(&self) -> u64 {
        self.location.offset
    }

    pub fn len(&self) -> u32 {
        self.location.len
    }

    pub fn is_empty(&self) -> bool {
        self.location.len == 0
    }
}

impl std::fmt::Debug for BlockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockToken")
            .field("offset", &self.location.offset)
            .field("len", &self.location.len)
            .finish()
    }
}

/// Throttling handle for a class of I/O issued by one consumer.
///
/// Accounts are created on the serializer's home thread and passed back on
/// every read or write call.
#[derive(Clone, Debug)]
pub struct IoAccount {
    priority: u32,
}

impl IoAccount {
    pub fn new(priority: u32) -> Self {
        Self { priority }
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }
}

/// Stable read-only view of a page buffer handed to `block_writes`.
///
/// The cell is shared with the cache; the flush path guarantees nothing
/// writes the buffer while the serializer reads it.
#[derive(Clone)]
pub struct PageImage {
    cell: Arc<RwLock<Box<[u8]>>>,
    len: u32,
}

impl PageImage {
    pub(crate) fn new(cell: Arc<RwLock<Box<[u8]>>>, len: u32) -> Self {
        Self { cell, len }
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Locks the underlying cell for reading; slice the guard to `len`.
    pub fn read(&self) -> ArcRwLockReadGuard<RawRwLock, Box<[u8]>> {
        self.cell.read_arc()
    }
}

/// One block image submitted in a batch write.
pub struct BlockWrite {
    pub id: BlockId,
    pub image: PageImage,
}

/// One atomic update to the serializer's block index.
#[derive(Clone, Debug)]
pub enum IndexOp {
    /// Point `id` at freshly written storage.
    InstallToken {
        id: BlockId,
        token: BlockToken,
        recency: Recency,
    },
    /// Mark `id` deleted; its id may be recycled afterwards.
    Delete { id: BlockId },
    /// Update only the recency stamp of `id`.
    TouchRecency { id: BlockId, recency: Recency },
}

impl IndexOp {
    pub fn block_id(&self) -> BlockId {
        match self {
            IndexOp::InstallToken { id, .. }
            | IndexOp::Delete { id }
            | IndexOp::TouchRecency { id, .. } => *id,
        }
    }
}

/// Durable block store the cache flushes into.
///
/// Implementations are assumed fatal on unrecoverable I/O failure; the
/// cache performs no retries. All calls are made from the cache's
/// serializer thread, one at a time.
pub trait Serializer: Send + Sync + 'static {
    /// Fixed size of every block buffer.
    fn block_size(&self) -> u32;

    /// One past the highest block id ever written.
    fn max_block_id(&self) -> BlockId;

    /// Whether `id` is currently marked deleted in the index.
    fn get_delete_bit(&self, id: BlockId) -> Result<bool>;

    /// Looks up the current token for a block.
    fn index_read(&self, id: BlockId) -> Result<BlockToken>;

    /// Fills `buf` with the bytes the token refers to.
    fn block_read(&self, token: &BlockToken, buf: &mut [u8], account: &IoAccount) -> Result<()>;

    /// Writes a batch of block images and returns one token per image, in
    /// order. `releasable` is pulsed once the submitted buffers may be
    /// mutated or freed again.
    fn block_writes(
        &self,
        writes: &[BlockWrite],
        account: &IoAccount,
        releasable: &Signal,
    ) -> Result<Vec<BlockToken>>;

    /// Applies a batch of index updates atomically.
    fn index_write(&self, ops: &[IndexOp], account: &IoAccount) -> Result<()>;

    fn make_io_account(&self, priority: u32) -> IoAccount {
        IoAccount::new(priority)
    }

    /// Allocates a zeroed buffer of the serializer's block size.
    fn alloc_buffer(&self) -> Box<[u8]> {
        vec![0u8; self.block_size() as usize].into_boxed_slice()
    }
}
