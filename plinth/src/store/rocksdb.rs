//! RocksDB-backed store.
//!
//! Persists every namespace in a RocksDB instance with dedicated column
//! families:
//!
//! - `"blocks"`: block hash (32 bytes) -> encoded block,
//! - `"txs"`:    transaction id (32 bytes) -> encoded transaction,
//! - `"states"`: block hash -> encoded per-block state delta,
//! - `"stage"`:  transaction id -> broadcast flag byte,
//! - `"index"`:  chain id (16 bytes) ++ big-endian block index -> block hash,
//! - `"refs"`:   chain id ++ address (20 bytes) ++ big-endian block index -> block hash,
//! - `"nonces"`: chain id ++ address -> big-endian counter,
//! - `"meta"`:   the canonical-chain pointer and per-chain index lengths.
//!
//! Keys that combine an address with a block index encode the index
//! big-endian, so RocksDB's byte-wise key order equals numeric order and
//! range scans walk references in index order.

use std::collections::{BTreeMap, BTreeSet};
use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;

use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options, WriteBatch,
};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::action::Action;
use crate::types::{ADDRESS_LEN, Address, Block, DIGEST_LEN, HashDigest, Transaction, TxId};

use super::{BlockStates, ChainId, Store, StoreError, resolve_offset};

const CF_BLOCKS: &str = "blocks";
const CF_TXS: &str = "txs";
const CF_STATES: &str = "states";
const CF_STAGE: &str = "stage";
const CF_INDEX: &str = "index";
const CF_REFS: &str = "refs";
const CF_NONCES: &str = "nonces";
const CF_META: &str = "meta";

const META_CANONICAL: &[u8] = b"canonical";
const META_LEN_PREFIX: &[u8] = b"len:";

const CHAIN_KEY_LEN: usize = 16;

/// Configuration for [`RocksDbStore`].
#[derive(Clone, Debug)]
pub struct RocksDbConfig {
    /// Filesystem path to the RocksDB database directory.
    pub path: String,
    /// Whether to create the database and missing column families if they
    /// do not yet exist.
    pub create_if_missing: bool,
}

impl Default for RocksDbConfig {
    fn default() -> Self {
        Self {
            path: "data/plinth-db".to_string(),
            create_if_missing: true,
        }
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// RocksDB-backed implementation of [`Store`].
pub struct RocksDbStore<A> {
    db: DB,
    _action: PhantomData<fn() -> A>,
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(value).map_err(|e| StoreError::Codec(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Codec(e.to_string()))
}

fn parse_be64(bytes: &[u8]) -> Result<u64, StoreError> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StoreError::Corrupted("big-endian counter length"))?;
    Ok(u64::from_be_bytes(arr))
}

fn parse_digest(bytes: &[u8]) -> Result<HashDigest, StoreError> {
    let arr: [u8; DIGEST_LEN] = bytes
        .try_into()
        .map_err(|_| StoreError::Corrupted("digest length"))?;
    Ok(HashDigest(arr))
}

fn index_key(chain: &ChainId, index: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(CHAIN_KEY_LEN + 8);
    key.extend_from_slice(chain.as_bytes());
    key.extend_from_slice(&index.to_be_bytes());
    key
}

fn ref_prefix(chain: &ChainId, address: &Address) -> Vec<u8> {
    let mut key = Vec::with_capacity(CHAIN_KEY_LEN + ADDRESS_LEN);
    key.extend_from_slice(chain.as_bytes());
    key.extend_from_slice(address.as_bytes());
    key
}

fn ref_key(chain: &ChainId, address: &Address, index: u64) -> Vec<u8> {
    let mut key = ref_prefix(chain, address);
    key.extend_from_slice(&index.to_be_bytes());
    key
}

fn nonce_key(chain: &ChainId, address: &Address) -> Vec<u8> {
    ref_prefix(chain, address)
}

fn len_key(chain: &ChainId) -> Vec<u8> {
    let mut key = Vec::with_capacity(META_LEN_PREFIX.len() + CHAIN_KEY_LEN);
    key.extend_from_slice(META_LEN_PREFIX);
    key.extend_from_slice(chain.as_bytes());
    key
}

impl<A> RocksDbStore<A> {
    /// Opens (or creates) a RocksDB-backed store at the given path.
    pub fn open(cfg: &RocksDbConfig) -> Result<Self, StoreError> {
        let path = Path::new(&cfg.path);

        let mut opts = Options::default();
        opts.create_if_missing(cfg.create_if_missing);
        opts.create_missing_column_families(cfg.create_if_missing);

        let cfs = vec![
            ColumnFamilyDescriptor::new("default", Options::default()),
            ColumnFamilyDescriptor::new(CF_BLOCKS, Options::default()),
            ColumnFamilyDescriptor::new(CF_TXS, Options::default()),
            ColumnFamilyDescriptor::new(CF_STATES, Options::default()),
            ColumnFamilyDescriptor::new(CF_STAGE, Options::default()),
            ColumnFamilyDescriptor::new(CF_INDEX, Options::default()),
            ColumnFamilyDescriptor::new(CF_REFS, Options::default()),
            ColumnFamilyDescriptor::new(CF_NONCES, Options::default()),
            ColumnFamilyDescriptor::new(CF_META, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&opts, path, cfs)?;

        Ok(Self {
            db,
            _action: PhantomData,
        })
    }

    fn cf(&self, name: &'static str) -> Result<Arc<BoundColumnFamily<'_>>, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or(StoreError::MissingColumnFamily(name))
    }

    /// Collects every `(key, value)` pair under `prefix` in key order.
    fn scan_prefix(
        &self,
        cf_name: &'static str,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let cf = self.cf(cf_name)?;
        let mut out = Vec::new();
        for item in self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key.to_vec(), value.to_vec()));
        }
        Ok(out)
    }

    fn read_index_len(&self, chain: &ChainId) -> Result<u64, StoreError> {
        let cf = self.cf(CF_META)?;
        match self.db.get_cf(&cf, len_key(chain))? {
            None => Ok(0),
            Some(bytes) => parse_be64(&bytes),
        }
    }
}

impl<A: Action> Store<A> for RocksDbStore<A> {
    fn put_block(&self, block: &Block<A>) -> Result<(), StoreError> {
        let cf = self.cf(CF_BLOCKS)?;
        self.db
            .put_cf(&cf, block.hash().as_bytes(), encode(block)?)?;
        Ok(())
    }

    fn get_block(&self, hash: &HashDigest) -> Result<Option<Block<A>>, StoreError> {
        let cf = self.cf(CF_BLOCKS)?;
        match self.db.get_cf(&cf, hash.as_bytes())? {
            None => Ok(None),
            Some(bytes) => Ok(Some(decode(&bytes)?)),
        }
    }

    fn delete_block(&self, hash: &HashDigest) -> Result<bool, StoreError> {
        let cf = self.cf(CF_BLOCKS)?;
        let existed = self.db.get_cf(&cf, hash.as_bytes())?.is_some();
        if existed {
            self.db.delete_cf(&cf, hash.as_bytes())?;
        }
        Ok(existed)
    }

    fn block_hashes(&self) -> Result<Vec<HashDigest>, StoreError> {
        let mut out = Vec::new();
        for (key, _) in self.scan_prefix(CF_BLOCKS, &[])? {
            out.push(parse_digest(&key)?);
        }
        Ok(out)
    }

    fn put_transaction(&self, tx: &Transaction<A>) -> Result<(), StoreError> {
        let cf = self.cf(CF_TXS)?;
        self.db.put_cf(&cf, tx.id().as_bytes(), encode(tx)?)?;
        Ok(())
    }

    fn get_transaction(&self, id: &TxId) -> Result<Option<Transaction<A>>, StoreError> {
        let cf = self.cf(CF_TXS)?;
        match self.db.get_cf(&cf, id.as_bytes())? {
            None => Ok(None),
            Some(bytes) => Ok(Some(decode(&bytes)?)),
        }
    }

    fn delete_transaction(&self, id: &TxId) -> Result<bool, StoreError> {
        let cf = self.cf(CF_TXS)?;
        let existed = self.db.get_cf(&cf, id.as_bytes())?.is_some();
        if existed {
            self.db.delete_cf(&cf, id.as_bytes())?;
        }
        Ok(existed)
    }

    fn set_block_states(&self, hash: &HashDigest, states: &BlockStates) -> Result<(), StoreError> {
        let cf = self.cf(CF_STATES)?;
        self.db.put_cf(&cf, hash.as_bytes(), encode(states)?)?;
        Ok(())
    }

    fn get_block_states(&self, hash: &HashDigest) -> Result<Option<BlockStates>, StoreError> {
        let cf = self.cf(CF_STATES)?;
        match self.db.get_cf(&cf, hash.as_bytes())? {
            None => Ok(None),
            Some(bytes) => Ok(Some(decode(&bytes)?)),
        }
    }

    fn stage_transaction_ids(&self, ids: &BTreeMap<TxId, bool>) -> Result<(), StoreError> {
        let cf = self.cf(CF_STAGE)?;
        let mut batch = WriteBatch::default();
        for (id, broadcast) in ids {
            batch.put_cf(&cf, id.as_bytes(), [u8::from(*broadcast)]);
        }
        self.db.write(batch)?;
        Ok(())
    }

    fn unstage_transaction_ids(&self, ids: &BTreeSet<TxId>) -> Result<(), StoreError> {
        let cf = self.cf(CF_STAGE)?;
        let mut batch = WriteBatch::default();
        for id in ids {
            batch.delete_cf(&cf, id.as_bytes());
        }
        self.db.write(batch)?;
        Ok(())
    }

    fn staged_transaction_ids(&self, to_broadcast_only: bool) -> Result<Vec<TxId>, StoreError> {
        let mut out = Vec::new();
        for (key, value) in self.scan_prefix(CF_STAGE, &[])? {
            if to_broadcast_only && value.first() != Some(&1) {
                continue;
            }
            let arr: [u8; DIGEST_LEN] = key
                .as_slice()
                .try_into()
                .map_err(|_| StoreError::Corrupted("staged transaction id length"))?;
            out.push(TxId(arr));
        }
        Ok(out)
    }

    fn canonical_chain_id(&self) -> Result<Option<ChainId>, StoreError> {
        let cf = self.cf(CF_META)?;
        match self.db.get_cf(&cf, META_CANONICAL)? {
            None => Ok(None),
            Some(bytes) => {
                let arr: [u8; CHAIN_KEY_LEN] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StoreError::Corrupted("canonical chain id length"))?;
                Ok(Some(ChainId::from_bytes(arr)))
            }
        }
    }

    fn set_canonical_chain_id(&self, id: &ChainId) -> Result<(), StoreError> {
        let cf = self.cf(CF_META)?;
        self.db.put_cf(&cf, META_CANONICAL, id.as_bytes())?;
        Ok(())
    }

    fn count_index(&self, chain: &ChainId) -> Result<u64, StoreError> {
        self.read_index_len(chain)
    }

    fn index_block_hash(
        &self,
        chain: &ChainId,
        offset: i64,
    ) -> Result<Option<HashDigest>, StoreError> {
        let count = self.read_index_len(chain)?;
        let Some(position) = resolve_offset(count, offset) else {
            return Ok(None);
        };
        let cf = self.cf(CF_INDEX)?;
        match self.db.get_cf(&cf, index_key(chain, position))? {
            None => Ok(None),
            Some(bytes) => Ok(Some(parse_digest(&bytes)?)),
        }
    }

    fn append_index(&self, chain: &ChainId, hash: &HashDigest) -> Result<u64, StoreError> {
        let count = self.read_index_len(chain)?;
        let cf_index = self.cf(CF_INDEX)?;
        let cf_meta = self.cf(CF_META)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_index, index_key(chain, count), hash.as_bytes());
        batch.put_cf(&cf_meta, len_key(chain), (count + 1).to_be_bytes());
        self.db.write(batch)?;
        Ok(count + 1)
    }

    fn iterate_index(
        &self,
        chain: &ChainId,
        offset: u64,
        limit: Option<u64>,
    ) -> Result<Vec<HashDigest>, StoreError> {
        let count = self.read_index_len(chain)?;
        let end = match limit {
            Some(limit) => offset.saturating_add(limit).min(count),
            None => count,
        };
        let cf = self.cf(CF_INDEX)?;
        let mut out = Vec::new();
        for position in offset..end {
            match self.db.get_cf(&cf, index_key(chain, position))? {
                Some(bytes) => out.push(parse_digest(&bytes)?),
                None => return Err(StoreError::Corrupted("chain index has a gap")),
            }
        }
        Ok(out)
    }

    fn store_state_reference(
        &self,
        chain: &ChainId,
        addresses: &BTreeSet<Address>,
        block_hash: &HashDigest,
        block_index: u64,
    ) -> Result<(), StoreError> {
        let cf = self.cf(CF_REFS)?;
        let mut batch = WriteBatch::default();
        for address in addresses {
            batch.put_cf(
                &cf,
                ref_key(chain, address, block_index),
                block_hash.as_bytes(),
            );
        }
        self.db.write(batch)?;
        Ok(())
    }

    fn lookup_state_reference(
        &self,
        chain: &ChainId,
        address: &Address,
        max_index: u64,
    ) -> Result<Option<(HashDigest, u64)>, StoreError> {
        let cf = self.cf(CF_REFS)?;
        let prefix = ref_prefix(chain, address);
        let seek = ref_key(chain, address, max_index);
        // Reverse iteration from the pivot key lands on the greatest key
        // at or below it; the prefix check rejects neighbours from other
        // addresses or chains.
        let mut iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&seek, Direction::Reverse));
        match iter.next() {
            None => Ok(None),
            Some(item) => {
                let (key, value) = item?;
                if !key.starts_with(&prefix) {
                    return Ok(None);
                }
                let index = parse_be64(&key[prefix.len()..])?;
                Ok(Some((parse_digest(&value)?, index)))
            }
        }
    }

    fn iterate_state_references(
        &self,
        chain: &ChainId,
        address: &Address,
        highest: Option<u64>,
        lowest: Option<u64>,
        limit: Option<usize>,
    ) -> Result<Vec<(HashDigest, u64)>, StoreError> {
        let prefix = ref_prefix(chain, address);
        let highest = highest.unwrap_or(u64::MAX);
        let lowest = lowest.unwrap_or(0);
        let mut out = Vec::new();
        for (key, value) in self.scan_prefix(CF_REFS, &prefix)? {
            let index = parse_be64(&key[prefix.len()..])?;
            if index >= lowest && index <= highest {
                out.push((parse_digest(&value)?, index));
            }
        }
        out.reverse();
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
        let prefix = chain.as_bytes().to_vec();
        let lowest = lowest.unwrap_or(0);
        let highest = highest.unwrap_or(u64::MAX);
        let mut out: BTreeMap<Address, Vec<HashDigest>> = BTreeMap::new();
        for (key, value) in self.scan_prefix(CF_REFS, &prefix)? {
            if key.len() != CHAIN_KEY_LEN + ADDRESS_LEN + 8 {
                return Err(StoreError::Corrupted("state reference key length"));
            }
            let mut address = [0u8; ADDRESS_LEN];
            address.copy_from_slice(&key[CHAIN_KEY_LEN..CHAIN_KEY_LEN + ADDRESS_LEN]);
            let index = parse_be64(&key[CHAIN_KEY_LEN + ADDRESS_LEN..])?;
            if index >= lowest && index <= highest {
                out.entry(Address(address))
                    .or_default()
                    .push(parse_digest(&value)?);
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
        let cf = self.cf(CF_REFS)?;
        let prefix = src.as_bytes().to_vec();
        let mut batch = WriteBatch::default();
        for (key, value) in self.scan_prefix(CF_REFS, &prefix)? {
            if key.len() != CHAIN_KEY_LEN + ADDRESS_LEN + 8 {
                return Err(StoreError::Corrupted("state reference key length"));
            }
            let mut address = [0u8; ADDRESS_LEN];
            address.copy_from_slice(&key[CHAIN_KEY_LEN..CHAIN_KEY_LEN + ADDRESS_LEN]);
            let index = parse_be64(&key[CHAIN_KEY_LEN + ADDRESS_LEN..])?;
            if strip.contains(&Address(address)) && index > branch_index {
                continue;
            }
            let mut dst_key = dst.as_bytes().to_vec();
            dst_key.extend_from_slice(&key[CHAIN_KEY_LEN..]);
            batch.put_cf(&cf, dst_key, value);
        }
        self.db.write(batch)?;
        Ok(())
    }

    fn get_tx_nonce(&self, chain: &ChainId, signer: &Address) -> Result<u64, StoreError> {
        let cf = self.cf(CF_NONCES)?;
        match self.db.get_cf(&cf, nonce_key(chain, signer))? {
            None => Ok(0),
            Some(bytes) => parse_be64(&bytes),
        }
    }

    fn increase_tx_nonce(
        &self,
        chain: &ChainId,
        signer: &Address,
        delta: u64,
    ) -> Result<(), StoreError> {
        let current = self.get_tx_nonce(chain, signer)?;
        let cf = self.cf(CF_NONCES)?;
        self.db.put_cf(
            &cf,
            nonce_key(chain, signer),
            (current + delta).to_be_bytes(),
        )?;
        Ok(())
    }

    fn list_tx_nonces(&self, chain: &ChainId) -> Result<BTreeMap<Address, u64>, StoreError> {
        let prefix = chain.as_bytes().to_vec();
        let mut out = BTreeMap::new();
        for (key, value) in self.scan_prefix(CF_NONCES, &prefix)? {
            if key.len() != CHAIN_KEY_LEN + ADDRESS_LEN {
                return Err(StoreError::Corrupted("nonce key length"));
            }
            let mut address = [0u8; ADDRESS_LEN];
            address.copy_from_slice(&key[CHAIN_KEY_LEN..]);
            out.insert(Address(address), parse_be64(&value)?);
        }
        Ok(out)
    }

    fn delete_chain_id(&self, chain: &ChainId) -> Result<(), StoreError> {
        let prefix = chain.as_bytes().to_vec();
        let mut batch = WriteBatch::default();
        for (cf_name, key_prefix) in [
            (CF_INDEX, prefix.clone()),
            (CF_REFS, prefix.clone()),
            (CF_NONCES, prefix.clone()),
        ] {
            let cf = self.cf(cf_name)?;
            for (key, _) in self.scan_prefix(cf_name, &key_prefix)? {
                batch.delete_cf(&cf, key);
            }
        }
        let cf_meta = self.cf(CF_META)?;
        batch.delete_cf(&cf_meta, len_key(chain));
        self.db.write(batch)?;
        Ok(())
    }
}
