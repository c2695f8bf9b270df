//! Storage backends for the chain.
//!
//! The [`Store`] trait is the persistence contract the engine is generic
//! over. It groups several global namespaces (blocks, transactions,
//! per-block state deltas, the staging pool, the canonical-chain pointer)
//! with per-chain namespaces (the ordered block index, per-address state
//! references, per-address nonce counters).
//!
//! Concrete implementations:
//!
//! - an in-memory store ([`mem::InMemoryStore`]) suitable for tests,
//! - a RocksDB-backed store ([`rocksdb::RocksDbStore`]) for persistent
//!   nodes.
//!
//! Contract notes: missing-key lookups are `Ok(None)`/empty, not errors;
//! every method is atomic on its own; iteration methods return owned
//! snapshots so no lock outlives the call.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::action::{AccountState, Action};
use crate::types::{Address, Block, HashDigest, Transaction, TxId};

pub mod mem;
pub mod rocksdb;

pub use mem::InMemoryStore;
pub use self::rocksdb::{RocksDbConfig, RocksDbStore};

/// Per-block state delta: the post-block record of every address the
/// block's actions touched, and only those.
pub type BlockStates = BTreeMap<Address, AccountState>;

/// Identifier of one chain's namespaces inside a store.
///
/// Created by `fork`, destroyed when `swap` retires the losing chain.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct ChainId(Uuid);

impl ChainId {
    /// Allocates a fresh chain identifier.
    pub fn random() -> Self {
        ChainId(Uuid::new_v4())
    }

    /// Returns the underlying 16 bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Reconstructs an identifier from its 16 bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        ChainId(Uuid::from_bytes(bytes))
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Storage-level error type.
#[derive(Clone, Debug, PartialEq)]
pub enum StoreError {
    /// Underlying engine failure (I/O, database error).
    Backend(String),
    /// Required column family was not found.
    MissingColumnFamily(&'static str),
    /// A record could not be encoded or decoded.
    Codec(String),
    /// Structurally impossible data was found on disk.
    Corrupted(&'static str),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Backend(msg) => write!(f, "storage backend error: {msg}"),
            StoreError::MissingColumnFamily(name) => {
                write!(f, "missing column family: {name}")
            }
            StoreError::Codec(msg) => write!(f, "codec error: {msg}"),
            StoreError::Corrupted(what) => write!(f, "corrupted store: {what}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Persistence contract required by the engine.
///
/// All methods take `&self`: implementations are internally synchronized,
/// and the engine's reader/writer lock provides the single-writer
/// discipline over compound operations. One store is shared by a chain
/// and all of its forks.
pub trait Store<A: Action>: Send + Sync {
    // ------------------------------------------------------------------
    // Blocks (global)
    // ------------------------------------------------------------------

    /// Persists a block under its hash. Idempotent.
    fn put_block(&self, block: &Block<A>) -> Result<(), StoreError>;

    /// Fetches a block by hash, if present.
    fn get_block(&self, hash: &HashDigest) -> Result<Option<Block<A>>, StoreError>;

    /// Removes a block; returns whether it existed. Only orphaned blocks
    /// may be deleted.
    fn delete_block(&self, hash: &HashDigest) -> Result<bool, StoreError>;

    /// Hashes of every stored block, in no particular order.
    fn block_hashes(&self) -> Result<Vec<HashDigest>, StoreError>;

    // ------------------------------------------------------------------
    // Transactions (global)
    // ------------------------------------------------------------------

    /// Persists a transaction under its id. Idempotent.
    fn put_transaction(&self, tx: &Transaction<A>) -> Result<(), StoreError>;

    /// Fetches a transaction by id, if present.
    fn get_transaction(&self, id: &TxId) -> Result<Option<Transaction<A>>, StoreError>;

    /// Removes a transaction; returns whether it existed.
    fn delete_transaction(&self, id: &TxId) -> Result<bool, StoreError>;

    // ------------------------------------------------------------------
    // Per-block state deltas (global)
    // ------------------------------------------------------------------

    /// Persists the delta of every address a block touched.
    fn set_block_states(&self, hash: &HashDigest, states: &BlockStates) -> Result<(), StoreError>;

    /// Fetches a block's state delta, if it was ever persisted.
    fn get_block_states(&self, hash: &HashDigest) -> Result<Option<BlockStates>, StoreError>;

    // ------------------------------------------------------------------
    // Staging pool (global)
    // ------------------------------------------------------------------

    /// Adds transaction ids to the staging pool; the flag records whether
    /// the transaction should be broadcast to peers.
    fn stage_transaction_ids(&self, ids: &BTreeMap<TxId, bool>) -> Result<(), StoreError>;

    /// Removes transaction ids from the staging pool. Unknown ids are
    /// ignored.
    fn unstage_transaction_ids(&self, ids: &BTreeSet<TxId>) -> Result<(), StoreError>;

    /// Ids currently staged, optionally only those flagged for broadcast.
    fn staged_transaction_ids(&self, to_broadcast_only: bool) -> Result<Vec<TxId>, StoreError>;

    // ------------------------------------------------------------------
    // Canonical pointer (global)
    // ------------------------------------------------------------------

    /// The chain currently designated canonical, if any.
    fn canonical_chain_id(&self) -> Result<Option<ChainId>, StoreError>;

    /// Designates a chain canonical.
    fn set_canonical_chain_id(&self, id: &ChainId) -> Result<(), StoreError>;

    // ------------------------------------------------------------------
    // Chain index (per chain)
    // ------------------------------------------------------------------

    /// Number of blocks in the chain's index.
    fn count_index(&self, chain: &ChainId) -> Result<u64, StoreError>;

    /// Hash at position `offset`; negative offsets count back from the
    /// tip (`-1` is the tip). Out of range is `Ok(None)`.
    fn index_block_hash(&self, chain: &ChainId, offset: i64)
    -> Result<Option<HashDigest>, StoreError>;

    /// Appends a hash to the chain's index and returns the new length.
    fn append_index(&self, chain: &ChainId, hash: &HashDigest) -> Result<u64, StoreError>;

    /// Hashes from position `offset`, at most `limit` of them.
    fn iterate_index(
        &self,
        chain: &ChainId,
        offset: u64,
        limit: Option<u64>,
    ) -> Result<Vec<HashDigest>, StoreError>;

    // ------------------------------------------------------------------
    // State references (per chain)
    // ------------------------------------------------------------------

    /// Records that `block` (at `block_index`) updated the state of every
    /// address in `addresses`.
    fn store_state_reference(
        &self,
        chain: &ChainId,
        addresses: &BTreeSet<Address>,
        block_hash: &HashDigest,
        block_index: u64,
    ) -> Result<(), StoreError>;

    /// The greatest reference for `address` whose index is at most
    /// `max_index`, if any.
    fn lookup_state_reference(
        &self,
        chain: &ChainId,
        address: &Address,
        max_index: u64,
    ) -> Result<Option<(HashDigest, u64)>, StoreError>;

    /// References for `address` in descending index order, bounded to
    /// `lowest..=highest` and at most `limit` entries.
    fn iterate_state_references(
        &self,
        chain: &ChainId,
        address: &Address,
        highest: Option<u64>,
        lowest: Option<u64>,
        limit: Option<usize>,
    ) -> Result<Vec<(HashDigest, u64)>, StoreError>;

    /// Every reference list in the chain, keyed by address and in
    /// ascending index order, bounded to `lowest..=highest`.
    fn list_all_state_references(
        &self,
        chain: &ChainId,
        lowest: Option<u64>,
        highest: Option<u64>,
    ) -> Result<BTreeMap<Address, Vec<HashDigest>>, StoreError>;

    /// Copies `src`'s reference lists into `dst`, keeping only references
    /// at or below `branch_index` for addresses in `strip` and every
    /// reference for the rest.
    fn fork_state_references(
        &self,
        src: &ChainId,
        dst: &ChainId,
        branch_index: u64,
        strip: &BTreeSet<Address>,
    ) -> Result<(), StoreError>;

    // ------------------------------------------------------------------
    // Nonce counters (per chain)
    // ------------------------------------------------------------------

    /// Count of confirmed transactions signed by `signer` in this chain.
    fn get_tx_nonce(&self, chain: &ChainId, signer: &Address) -> Result<u64, StoreError>;

    /// Increases `signer`'s confirmed-transaction count by `delta`.
    fn increase_tx_nonce(
        &self,
        chain: &ChainId,
        signer: &Address,
        delta: u64,
    ) -> Result<(), StoreError>;

    /// Every nonce counter in the chain.
    fn list_tx_nonces(&self, chain: &ChainId) -> Result<BTreeMap<Address, u64>, StoreError>;

    // ------------------------------------------------------------------
    // Chain lifecycle
    // ------------------------------------------------------------------

    /// Removes every per-chain namespace of `chain`.
    fn delete_chain_id(&self, chain: &ChainId) -> Result<(), StoreError>;
}

/// Resolves a possibly negative index offset against a length.
pub(crate) fn resolve_offset(count: u64, offset: i64) -> Option<u64> {
    if offset >= 0 {
        let offset = offset as u64;
        (offset < count).then_some(offset)
    } else {
        let back = offset.unsigned_abs();
        count.checked_sub(back)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_id_roundtrips_through_bytes() {
        let id = ChainId::random();
        assert_eq!(ChainId::from_bytes(*id.as_bytes()), id);
    }

    #[test]
    fn negative_offsets_count_back_from_the_tip() {
        assert_eq!(resolve_offset(5, -1), Some(4));
        assert_eq!(resolve_offset(5, -5), Some(0));
        assert_eq!(resolve_offset(5, -6), None);
        assert_eq!(resolve_offset(5, 0), Some(0));
        assert_eq!(resolve_offset(5, 4), Some(4));
        assert_eq!(resolve_offset(5, 5), None);
        assert_eq!(resolve_offset(0, -1), None);
        assert_eq!(resolve_offset(0, 0), None);
    }
}
