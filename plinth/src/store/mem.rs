//! In-memory store.
//!
//! Keeps every namespace in maps behind a single `parking_lot::RwLock`.
//! Useful for unit tests, benchmarks, and small devnets; implements the
//! full [`Store`] contract including forks and chain deletion.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use parking_lot::RwLock;

use crate::action::Action;
use crate::types::{Address, Block, HashDigest, Transaction, TxId};

use super::{BlockStates, ChainId, Store, StoreError, resolve_offset};

struct MemInner<A> {
    blocks: HashMap<HashDigest, Block<A>>,
    txs: HashMap<TxId, Transaction<A>>,
    block_states: HashMap<HashDigest, BlockStates>,
    staged: BTreeMap<TxId, bool>,
    canonical: Option<ChainId>,
    indexes: HashMap<ChainId, Vec<HashDigest>>,
    refs: HashMap<ChainId, BTreeMap<Address, Vec<(HashDigest, u64)>>>,
    nonces: HashMap<ChainId, BTreeMap<Address, u64>>,
}

/// In-memory implementation of [`Store`].
pub struct InMemoryStore<A> {
    inner: RwLock<MemInner<A>>,
}

impl<A> InMemoryStore<A> {
    /// Creates a new, empty in-memory store.
    pub fn new() -> Self {
        InMemoryStore {
            inner: RwLock::new(MemInner {
                blocks: HashMap::new(),
                txs: HashMap::new(),
                block_states: HashMap::new(),
                staged: BTreeMap::new(),
                canonical: None,
                indexes: HashMap::new(),
                refs: HashMap::new(),
                nonces: HashMap::new(),
            }),
        }
    }
}

impl<A> Default for InMemoryStore<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Action> Store<A> for InMemoryStore<A> {
    fn put_block(&self, block: &Block<A>) -> Result<(), StoreError> {
        self.inner.write().blocks.insert(block.hash(), block.clone());
        Ok(())
    }

    fn get_block(&self, hash: &HashDigest) -> Result<Option<Block<A>>, StoreError> {
        Ok(self.inner.read().blocks.get(hash).cloned())
    }

    fn delete_block(&self, hash: &HashDigest) -> Result<bool, StoreError> {
        Ok(self.inner.write().blocks.remove(hash).is_some())
    }

    fn block_hashes(&self) -> Result<Vec<HashDigest>, StoreError> {
        Ok(self.inner.read().blocks.keys().copied().collect())
    }

    fn put_transaction(&self, tx: &Transaction<A>) -> Result<(), StoreError> {
        self.inner.write().txs.insert(tx.id(), tx.clone());
        Ok(())
    }

    fn get_transaction(&self, id: &TxId) -> Result<Option<Transaction<A>>, StoreError> {
        Ok(self.inner.read().txs.get(id).cloned())
    }

    fn delete_transaction(&self, id: &TxId) -> Result<bool, StoreError> {
        Ok(self.inner.write().txs.remove(id).is_some())
    }

    fn set_block_states(&self, hash: &HashDigest, states: &BlockStates) -> Result<(), StoreError> {
        self.inner
            .write()
            .block_states
            .insert(*hash, states.clone());
        Ok(())
    }

    fn get_block_states(&self, hash: &HashDigest) -> Result<Option<BlockStates>, StoreError> {
        Ok(self.inner.read().block_states.get(hash).cloned())
    }

    fn stage_transaction_ids(&self, ids: &BTreeMap<TxId, bool>) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        for (id, broadcast) in ids {
            inner.staged.insert(*id, *broadcast);
        }
        Ok(())
    }

    fn unstage_transaction_ids(&self, ids: &BTreeSet<TxId>) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        for id in ids {
            inner.staged.remove(id);
        }
        Ok(())
    }

    fn staged_transaction_ids(&self, to_broadcast_only: bool) -> Result<Vec<TxId>, StoreError> {
        Ok(self
            .inner
            .read()
            .staged
            .iter()
            .filter(|(_, broadcast)| !to_broadcast_only || **broadcast)
            .map(|(id, _)| *id)
            .collect())
    }

    fn canonical_chain_id(&self) -> Result<Option<ChainId>, StoreError> {
        Ok(self.inner.read().canonical)
    }

    fn set_canonical_chain_id(&self, id: &ChainId) -> Result<(), StoreError> {
        self.inner.write().canonical = Some(*id);
        Ok(())
    }

    fn count_index(&self, chain: &ChainId) -> Result<u64, StoreError> {
        Ok(self
            .inner
            .read()
            .indexes
            .get(chain)
            .map(|index| index.len() as u64)
            .unwrap_or(0))
    }

    fn index_block_hash(
        &self,
        chain: &ChainId,
        offset: i64,
    ) -> Result<Option<HashDigest>, StoreError> {
        let inner = self.inner.read();
        let Some(index) = inner.indexes.get(chain) else {
            return Ok(None);
        };
        let Some(position) = resolve_offset(index.len() as u64, offset) else {
            return Ok(None);
        };
        Ok(index.get(position as usize).copied())
    }

    fn append_index(&self, chain: &ChainId, hash: &HashDigest) -> Result<u64, StoreError> {
        let mut inner = self.inner.write();
        let index = inner.indexes.entry(*chain).or_default();
        index.push(*hash);
        Ok(index.len() as u64)
    }

    fn iterate_index(
        &self,
        chain: &ChainId,
        offset: u64,
        limit: Option<u64>,
    ) -> Result<Vec<HashDigest>, StoreError> {
        let inner = self.inner.read();
        let Some(index) = inner.indexes.get(chain) else {
            return Ok(Vec::new());
        };
        let start = (offset as usize).min(index.len());
        let end = match limit {
            Some(limit) => (start + limit as usize).min(index.len()),
            None => index.len(),
        };
        Ok(index[start..end].to_vec())
    }

    fn store_state_reference(
        &self,
        chain: &ChainId,
        addresses: &BTreeSet<Address>,
        block_hash: &HashDigest,
        block_index: u64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let refs = inner.refs.entry(*chain).or_default();
        for address in addresses {
            let list = refs.entry(*address).or_default();
            let position = list.partition_point(|(_, index)| *index < block_index);
            // Writing the same (block, index) twice is a no-op.
            if list.get(position).map(|(_, index)| *index) == Some(block_index) {
                continue;
            }
            list.insert(position, (*block_hash, block_index));
        }
        Ok(())
    }

    fn lookup_state_reference(
        &self,
        chain: &ChainId,
        address: &Address,
        max_index: u64,
    ) -> Result<Option<(HashDigest, u64)>, StoreError> {
        let inner = self.inner.read();
        let found = inner
            .refs
            .get(chain)
            .and_then(|refs| refs.get(address))
            .and_then(|list| {
                list.iter()
                    .rev()
                    .find(|(_, index)| *index <= max_index)
                    .copied()
            });
        Ok(found)
    }

    fn iterate_state_references(
        &self,
        chain: &ChainId,
        address: &Address,
        highest: Option<u64>,
        lowest: Option<u64>,
        limit: Option<usize>,
    ) -> Result<Vec<(HashDigest, u64)>, StoreError> {
        let inner = self.inner.read();
        let Some(list) = inner.refs.get(chain).and_then(|refs| refs.get(address)) else {
            return Ok(Vec::new());
        };
        let highest = highest.unwrap_or(u64::MAX);
        let lowest = lowest.unwrap_or(0);
        let mut out: Vec<(HashDigest, u64)> = list
            .iter()
            .rev()
            .filter(|(_, index)| *index <= highest && *index >= lowest)
            .copied()
            .collect();
        if let Some(limit) = limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    fn list_all_state_references(
        &self,
        chain: &ChainId,
        lowest: Option<u64>,
        highest: Option<u64>,
    ) -> Result<BTreeMap<Address, Vec<HashDigest>>, StoreError> {
        let inner = self.inner.read();
        let Some(refs) = inner.refs.get(chain) else {
            return Ok(BTreeMap::new());
        };
        let lowest = lowest.unwrap_or(0);
        let highest = highest.unwrap_or(u64::MAX);
        let mut out = BTreeMap::new();
        for (address, list) in refs {
            let hashes: Vec<HashDigest> = list
                .iter()
                .filter(|(_, index)| *index >= lowest && *index <= highest)
                .map(|(hash, _)| *hash)
                .collect();
            if !hashes.is_empty() {
                out.insert(*address, hashes);
            }
        }
        Ok(out)
    }

    fn fork_state_references(
        &self,
        src: &ChainId,
        dst: &ChainId,
        branch_index: u64,
        strip: &BTreeSet<Address>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let forked: BTreeMap<Address, Vec<(HashDigest, u64)>> = inner
            .refs
            .get(src)
            .map(|refs| {
                refs.iter()
                    .filter_map(|(address, list)| {
                        let kept: Vec<(HashDigest, u64)> = list
                            .iter()
                            .filter(|(_, index)| {
                                !strip.contains(address) || *index <= branch_index
                            })
                            .copied()
                            .collect();
                        (!kept.is_empty()).then_some((*address, kept))
                    })
                    .collect()
            })
            .unwrap_or_default();
        inner.refs.insert(*dst, forked);
        Ok(())
    }

    fn get_tx_nonce(&self, chain: &ChainId, signer: &Address) -> Result<u64, StoreError> {
        Ok(self
            .inner
            .read()
            .nonces
            .get(chain)
            .and_then(|nonces| nonces.get(signer))
            .copied()
            .unwrap_or(0))
    }

    fn increase_tx_nonce(
        &self,
        chain: &ChainId,
        signer: &Address,
        delta: u64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let counter = inner
            .nonces
            .entry(*chain)
            .or_default()
            .entry(*signer)
            .or_insert(0);
        *counter += delta;
        Ok(())
    }

    fn list_tx_nonces(&self, chain: &ChainId) -> Result<BTreeMap<Address, u64>, StoreError> {
        Ok(self.inner.read().nonces.get(chain).cloned().unwrap_or_default())
    }

    fn delete_chain_id(&self, chain: &ChainId) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner.indexes.remove(chain);
        inner.refs.remove(chain);
        inner.nonces.remove(chain);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionContext, AccountState};
    use crate::error::ActionError;
    use crate::types::Nonce;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Clone, Debug, Serialize, Deserialize)]
    struct Noop;

    impl Action for Noop {
        fn execute(&self, _ctx: &mut ActionContext<'_>) -> Result<(), ActionError> {
            Ok(())
        }
    }

    fn addr(byte: u8) -> Address {
        Address([byte; crate::types::ADDRESS_LEN])
    }

    fn digest(byte: u8) -> HashDigest {
        HashDigest([byte; crate::types::DIGEST_LEN])
    }

    fn dummy_block(index: u64) -> Block<Noop> {
        Block::new(
            index,
            0,
            Nonce::default(),
            None,
            (index > 0).then(|| digest(index as u8 - 1)),
            1_700_000_000 + index,
            Vec::new(),
        )
    }

    #[test]
    fn put_and_get_block_roundtrip() {
        let store = InMemoryStore::new();
        let block = dummy_block(0);
        let hash = block.hash();

        store.put_block(&block).unwrap();
        let fetched = store.get_block(&hash).unwrap().expect("block is present");
        assert_eq!(fetched.hash(), hash);

        assert!(store.delete_block(&hash).unwrap());
        assert!(!store.delete_block(&hash).unwrap());
        assert!(store.get_block(&hash).unwrap().is_none());
    }

    #[test]
    fn index_supports_negative_offsets() {
        let store: InMemoryStore<Noop> = InMemoryStore::new();
        let chain = ChainId::random();

        assert_eq!(store.append_index(&chain, &digest(0)).unwrap(), 1);
        assert_eq!(store.append_index(&chain, &digest(1)).unwrap(), 2);
        assert_eq!(store.append_index(&chain, &digest(2)).unwrap(), 3);

        assert_eq!(store.count_index(&chain).unwrap(), 3);
        assert_eq!(store.index_block_hash(&chain, 0).unwrap(), Some(digest(0)));
        assert_eq!(store.index_block_hash(&chain, -1).unwrap(), Some(digest(2)));
        assert_eq!(store.index_block_hash(&chain, -3).unwrap(), Some(digest(0)));
        assert_eq!(store.index_block_hash(&chain, 3).unwrap(), None);
        assert_eq!(store.index_block_hash(&chain, -4).unwrap(), None);

        assert_eq!(
            store.iterate_index(&chain, 1, Some(1)).unwrap(),
            vec![digest(1)]
        );
        assert_eq!(
            store.iterate_index(&chain, 0, None).unwrap(),
            vec![digest(0), digest(1), digest(2)]
        );
    }

    #[test]
    fn staging_honours_broadcast_flags() {
        let store: InMemoryStore<Noop> = InMemoryStore::new();
        let quiet = TxId([1; 32]);
        let loud = TxId([2; 32]);

        store
            .stage_transaction_ids(&BTreeMap::from([(quiet, false), (loud, true)]))
            .unwrap();

        assert_eq!(store.staged_transaction_ids(false).unwrap().len(), 2);
        assert_eq!(store.staged_transaction_ids(true).unwrap(), vec![loud]);

        store
            .unstage_transaction_ids(&BTreeSet::from([loud]))
            .unwrap();
        assert_eq!(store.staged_transaction_ids(false).unwrap(), vec![quiet]);
    }

    #[test]
    fn state_reference_lookup_returns_greatest_at_or_below_pivot() {
        let store: InMemoryStore<Noop> = InMemoryStore::new();
        let chain = ChainId::random();
        let a = addr(1);

        for index in [1u64, 4, 9] {
            store
                .store_state_reference(
                    &chain,
                    &BTreeSet::from([a]),
                    &digest(index as u8),
                    index,
                )
                .unwrap();
        }

        assert_eq!(
            store.lookup_state_reference(&chain, &a, 9).unwrap(),
            Some((digest(9), 9))
        );
        assert_eq!(
            store.lookup_state_reference(&chain, &a, 8).unwrap(),
            Some((digest(4), 4))
        );
        assert_eq!(store.lookup_state_reference(&chain, &a, 0).unwrap(), None);

        let descending = store
            .iterate_state_references(&chain, &a, Some(8), Some(1), None)
            .unwrap();
        assert_eq!(descending, vec![(digest(4), 4), (digest(1), 1)]);

        let limited = store
            .iterate_state_references(&chain, &a, None, None, Some(1))
            .unwrap();
        assert_eq!(limited, vec![(digest(9), 9)]);
    }

    #[test]
    fn fork_strips_references_above_the_branch_for_stripped_addresses() {
        let store: InMemoryStore<Noop> = InMemoryStore::new();
        let src = ChainId::random();
        let dst = ChainId::random();
        let stripped = addr(1);
        let kept = addr(2);

        for index in [1u64, 3, 6] {
            store
                .store_state_reference(
                    &src,
                    &BTreeSet::from([stripped]),
                    &digest(index as u8),
                    index,
                )
                .unwrap();
        }
        store
            .store_state_reference(&src, &BTreeSet::from([kept]), &digest(2), 2)
            .unwrap();

        store
            .fork_state_references(&src, &dst, 3, &BTreeSet::from([stripped]))
            .unwrap();

        let forked = store
            .iterate_state_references(&dst, &stripped, None, None, None)
            .unwrap();
        assert_eq!(forked, vec![(digest(3), 3), (digest(1), 1)]);

        let untouched = store
            .iterate_state_references(&dst, &kept, None, None, None)
            .unwrap();
        assert_eq!(untouched, vec![(digest(2), 2)]);
    }

    #[test]
    fn nonce_counters_accumulate_per_chain() {
        let store: InMemoryStore<Noop> = InMemoryStore::new();
        let chain = ChainId::random();
        let other = ChainId::random();
        let signer = addr(5);

        assert_eq!(store.get_tx_nonce(&chain, &signer).unwrap(), 0);
        store.increase_tx_nonce(&chain, &signer, 2).unwrap();
        store.increase_tx_nonce(&chain, &signer, 1).unwrap();

        assert_eq!(store.get_tx_nonce(&chain, &signer).unwrap(), 3);
        assert_eq!(store.get_tx_nonce(&other, &signer).unwrap(), 0);
        assert_eq!(
            store.list_tx_nonces(&chain).unwrap(),
            BTreeMap::from([(signer, 3)])
        );
    }

    #[test]
    fn deleting_a_chain_removes_only_its_namespaces() {
        let store: InMemoryStore<Noop> = InMemoryStore::new();
        let doomed = ChainId::random();
        let survivor = ChainId::random();

        store.append_index(&doomed, &digest(0)).unwrap();
        store.append_index(&survivor, &digest(0)).unwrap();
        store.increase_tx_nonce(&doomed, &addr(1), 1).unwrap();
        store
            .store_state_reference(&doomed, &BTreeSet::from([addr(1)]), &digest(0), 0)
            .unwrap();

        store.delete_chain_id(&doomed).unwrap();

        assert_eq!(store.count_index(&doomed).unwrap(), 0);
        assert_eq!(store.get_tx_nonce(&doomed, &addr(1)).unwrap(), 0);
        assert_eq!(store.count_index(&survivor).unwrap(), 1);
    }

    #[test]
    fn block_states_roundtrip() {
        let store: InMemoryStore<Noop> = InMemoryStore::new();
        let hash = digest(1);
        let states: BlockStates =
            BTreeMap::from([(addr(1), AccountState::with_value(json!("s")))]);

        assert_eq!(store.get_block_states(&hash).unwrap(), None);
        store.set_block_states(&hash, &states).unwrap();
        assert_eq!(store.get_block_states(&hash).unwrap(), Some(states));
    }

    #[test]
    fn canonical_pointer_roundtrip() {
        let store: InMemoryStore<Noop> = InMemoryStore::new();
        assert_eq!(store.canonical_chain_id().unwrap(), None);

        let id = ChainId::random();
        store.set_canonical_chain_id(&id).unwrap();
        assert_eq!(store.canonical_chain_id().unwrap(), Some(id));
    }
}
