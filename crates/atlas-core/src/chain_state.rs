//! Block storage interface and in-memory implementation.
//!
//! The chain is an append-only sequence keyed by index with a single tip.
//! [`ChainStore::append`] performs the linkage checks from
//! [`validate_successor`](crate::validation::validate_successor); consensus
//! and ledger validation happen before a block reaches the store.

use std::collections::HashMap;

use crate::error::BlockError;
use crate::genesis::genesis_block;
use crate::types::{Block, Hash256};
use crate::validation::validate_successor;

/// Append-only block storage.
///
/// Not thread-safe; callers wrap it in a `RwLock`.
pub trait ChainStore: Send + Sync {
    /// Append `block` on top of the current tip.
    ///
    /// # Errors
    ///
    /// Returns a [`BlockError`] if the block does not extend the tip.
    fn append(&mut self, block: Block) -> Result<(), BlockError>;

    /// The current tip. A store always holds at least the genesis block.
    fn tip(&self) -> &Block;

    /// Index of the tip.
    fn height(&self) -> u64 {
        self.tip().index
    }

    fn get_by_index(&self, index: u64) -> Option<&Block>;

    fn get_by_hash(&self, hash: &Hash256) -> Option<&Block>;

    /// Blocks in `from..=to`, clipped to the stored range.
    fn range(&self, from: u64, to: u64) -> Vec<Block>;
}

/// In-memory [`ChainStore`].
#[derive(Debug, Clone)]
pub struct MemoryChainStore {
    blocks: Vec<Block>,
    by_hash: HashMap<Hash256, usize>,
}

impl MemoryChainStore {
    /// A store holding only the genesis block.
    pub fn new() -> Self {
        Self::with_genesis(genesis_block())
    }

    /// A store rooted at a caller-supplied block 0.
    pub fn with_genesis(genesis: Block) -> Self {
        let mut by_hash = HashMap::new();
        by_hash.insert(genesis.hash, 0);
        Self {
            blocks: vec![genesis],
            by_hash,
        }
    }

    /// Number of stored blocks, genesis included.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl Default for MemoryChainStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainStore for MemoryChainStore {
    fn append(&mut self, block: Block) -> Result<(), BlockError> {
        validate_successor(&block, self.tip())?;
        self.by_hash.insert(block.hash, self.blocks.len());
        self.blocks.push(block);
        Ok(())
    }

    fn tip(&self) -> &Block {
        // Constructors always seed block 0, so the vector is never empty.
        &self.blocks[self.blocks.len() - 1]
    }

    fn get_by_index(&self, index: u64) -> Option<&Block> {
        usize::try_from(index).ok().and_then(|i| self.blocks.get(i))
    }

    fn get_by_hash(&self, hash: &Hash256) -> Option<&Block> {
        self.by_hash.get(hash).map(|&i| &self.blocks[i])
    }

    fn range(&self, from: u64, to: u64) -> Vec<Block> {
        if from > to {
            return Vec::new();
        }
        (from..=to.min(self.height()))
            .filter_map(|i| self.get_by_index(i).cloned())
            .collect()
    }
}
