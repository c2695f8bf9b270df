//! Block types, hashing, mining, and evaluation.
//!
//! A block commits to its transactions through a canonical **bincode 2**
//! serialization (`bincode::serde::encode_to_vec` with an explicit
//! `standard()` config) hashed with SHA-256. The same canonical encoding is
//! used everywhere block bytes are needed, so the proof-of-work search, the
//! stored hash, and validation all agree on one format.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::action::{AccountState, Action, ActionContext, ActionEvaluation, evaluation_seed};
use crate::error::{ActionError, BlockError, ChainError, TxError};

use super::{Address, Cancel, HashDigest, Nonce, Transaction, TxId};

/// How many nonce candidates are tried between cancellation polls.
const CANCEL_POLL_INTERVAL: u64 = 1024;

/// Structural ceiling on how far a block timestamp may sit in the future.
/// Policies tighten this; it exists so a wildly wrong clock is rejected
/// even under a permissive policy.
const MAX_CLOCK_DRIFT_SECS: u64 = 900;

/// Immutable record of one position in the chain.
///
/// Fields are private because `hash` commits to all of them; blocks are
/// built through [`Block::new`] or [`Block::mine`] and read through the
/// accessor methods.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Block<A> {
    index: u64,
    difficulty: u64,
    nonce: Nonce,
    miner: Option<Address>,
    previous_hash: Option<HashDigest>,
    timestamp: u64,
    transactions: Vec<Transaction<A>>,
    hash: HashDigest,
}

/// The fields covered by the hash, serialized in declaration order.
#[derive(Serialize)]
struct HashingPayload<'a, A> {
    index: u64,
    difficulty: u64,
    nonce: &'a Nonce,
    miner: &'a Option<Address>,
    previous_hash: &'a Option<HashDigest>,
    timestamp: u64,
    transactions: &'a [Transaction<A>],
}

fn hash_parts<A: Action>(
    index: u64,
    difficulty: u64,
    nonce: &Nonce,
    miner: &Option<Address>,
    previous_hash: &Option<HashDigest>,
    timestamp: u64,
    transactions: &[Transaction<A>],
) -> HashDigest {
    let payload = HashingPayload {
        index,
        difficulty,
        nonce,
        miner,
        previous_hash,
        timestamp,
        transactions,
    };
    let cfg = bincode::config::standard();
    let bytes = bincode::serde::encode_to_vec(&payload, cfg)
        .expect("block fields should always be serializable with bincode 2 + serde");
    HashDigest::compute(&bytes)
}

/// Orders transactions canonically: ascending by signer, then by nonce.
///
/// Keeping each signer's transactions in nonce order makes the declared
/// order always satisfy the contiguous-nonce rule checked on append.
fn sort_canonical<A>(transactions: &mut [Transaction<A>]) {
    transactions.sort_by(|a, b| (a.signer, a.nonce).cmp(&(b.signer, b.nonce)));
}

impl<A: Action> Block<A> {
    /// Builds a block from parts, canonicalizing the transaction order and
    /// computing the hash.
    ///
    /// The result is not necessarily valid: the hash only satisfies the
    /// given difficulty if `nonce` happens to be a witness for it. Use
    /// [`Block::mine`] to search for one.
    pub fn new(
        index: u64,
        difficulty: u64,
        nonce: Nonce,
        miner: Option<Address>,
        previous_hash: Option<HashDigest>,
        timestamp: u64,
        mut transactions: Vec<Transaction<A>>,
    ) -> Self {
        sort_canonical(&mut transactions);
        let hash = hash_parts(
            index,
            difficulty,
            &nonce,
            &miner,
            &previous_hash,
            timestamp,
            &transactions,
        );
        Block {
            index,
            difficulty,
            nonce,
            miner,
            previous_hash,
            timestamp,
            transactions,
            hash,
        }
    }

    /// Searches for a nonce satisfying `difficulty`, starting the counter
    /// walk at a random offset.
    pub fn mine(
        index: u64,
        difficulty: u64,
        miner: Option<Address>,
        previous_hash: Option<HashDigest>,
        timestamp: u64,
        transactions: Vec<Transaction<A>>,
        cancel: &Cancel,
    ) -> Result<Self, ChainError> {
        Self::mine_with_seed(
            index,
            difficulty,
            miner,
            previous_hash,
            timestamp,
            transactions,
            rand::random(),
            cancel,
        )
    }

    /// Searches for a nonce satisfying `difficulty`, walking an 8-byte
    /// little-endian counter from `seed`.
    ///
    /// Deterministic: identical inputs and seed find the identical nonce.
    /// The cancellation flag is polled every [`CANCEL_POLL_INTERVAL`]
    /// candidates.
    #[allow(clippy::too_many_arguments)]
    pub fn mine_with_seed(
        index: u64,
        difficulty: u64,
        miner: Option<Address>,
        previous_hash: Option<HashDigest>,
        timestamp: u64,
        mut transactions: Vec<Transaction<A>>,
        seed: u64,
        cancel: &Cancel,
    ) -> Result<Self, ChainError> {
        sort_canonical(&mut transactions);
        let mut counter = seed;
        let mut attempts: u64 = 0;
        loop {
            if attempts % CANCEL_POLL_INTERVAL == 0 && cancel.is_canceled() {
                return Err(ChainError::Canceled);
            }
            let nonce = Nonce(counter.to_le_bytes().to_vec());
            let hash = hash_parts(
                index,
                difficulty,
                &nonce,
                &miner,
                &previous_hash,
                timestamp,
                &transactions,
            );
            if hash.satisfies(difficulty) {
                trace!(index, attempts, %hash, "found proof-of-work witness");
                return Ok(Block {
                    index,
                    difficulty,
                    nonce,
                    miner,
                    previous_hash,
                    timestamp,
                    transactions,
                    hash,
                });
            }
            counter = counter.wrapping_add(1);
            attempts += 1;
        }
    }

    /// Monotonic position of this block; genesis is zero.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Difficulty the hash satisfies.
    pub fn difficulty(&self) -> u64 {
        self.difficulty
    }

    /// Proof-of-work witness.
    pub fn nonce(&self) -> &Nonce {
        &self.nonce
    }

    /// Address credited with mining this block, when it was mined.
    pub fn miner(&self) -> Option<Address> {
        self.miner
    }

    /// Hash of the preceding block; `None` only for genesis.
    pub fn previous_hash(&self) -> Option<HashDigest> {
        self.previous_hash
    }

    /// Wall-clock creation time, in seconds since the Unix epoch.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Transactions in canonical order.
    pub fn transactions(&self) -> &[Transaction<A>] {
        &self.transactions
    }

    /// Ids of the contained transactions, in canonical order.
    pub fn transaction_ids(&self) -> Vec<TxId> {
        self.transactions.iter().map(Transaction::id).collect()
    }

    /// The block's identity.
    pub fn hash(&self) -> HashDigest {
        self.hash
    }

    /// Returns the canonical byte representation of this block.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let cfg = bincode::config::standard();
        bincode::serde::encode_to_vec(self, cfg)
            .expect("block should always be serializable with bincode 2 + serde")
    }

    /// Recomputes the hash from the block contents.
    pub fn compute_hash(&self) -> HashDigest {
        hash_parts(
            self.index,
            self.difficulty,
            &self.nonce,
            &self.miner,
            &self.previous_hash,
            self.timestamp,
            &self.transactions,
        )
    }

    /// Checks block-local invariants.
    ///
    /// Covers the stored hash, the Hashcash rule, the genesis/non-genesis
    /// previous-hash shape, a coarse future-timestamp ceiling, every
    /// transaction's signature, and per-signer nonce contiguity within
    /// this block. Whether the nonce run starts at the signer's confirmed
    /// count is a chain-level question checked on append.
    pub fn validate(&self, now: u64) -> Result<(), ChainError> {
        if self.compute_hash() != self.hash || !self.hash.satisfies(self.difficulty) {
            return Err(BlockError::InvalidHash {
                hash: self.hash,
                difficulty: self.difficulty,
            }
            .into());
        }
        if self.difficulty > 0 && self.nonce.as_bytes().is_empty() {
            return Err(BlockError::InvalidNonce.into());
        }
        match (self.index, self.previous_hash) {
            (0, Some(_)) => {
                return Err(BlockError::InvalidPreviousHash {
                    expected: None,
                    actual: self.previous_hash,
                }
                .into());
            }
            (i, None) if i > 0 => {
                return Err(BlockError::InvalidPreviousHash {
                    expected: self.previous_hash,
                    actual: None,
                }
                .into());
            }
            _ => {}
        }
        let limit = now.saturating_add(MAX_CLOCK_DRIFT_SECS);
        if self.timestamp > limit {
            return Err(BlockError::InvalidTimestamp {
                timestamp: self.timestamp,
                limit,
            }
            .into());
        }
        let mut last_nonce: BTreeMap<Address, u64> = BTreeMap::new();
        for tx in &self.transactions {
            tx.verify()?;
            if let Some(last) = last_nonce.get(&tx.signer) {
                if tx.nonce != last + 1 {
                    return Err(TxError::InvalidTxNonce {
                        signer: tx.signer,
                        expected: last + 1,
                        actual: tx.nonce,
                    }
                    .into());
                }
            }
            last_nonce.insert(tx.signer, tx.nonce);
        }
        Ok(())
    }

    /// Evaluates every action in this block, in canonical order, against
    /// `state_getter` (the chain state as of the previous block).
    ///
    /// The output delta of each action feeds the next, across transaction
    /// boundaries. When `block_action` is given it runs last, signed by
    /// the miner, and its outputs merge into the block delta like any
    /// other action's.
    ///
    /// A failing action yields an evaluation carrying the error and no
    /// output; evaluation continues with the following action. A failure
    /// to *read* state aborts evaluation entirely.
    pub fn evaluate<F>(
        &self,
        block_action: Option<&A>,
        state_getter: &F,
    ) -> Result<Vec<ActionEvaluation<A>>, ChainError>
    where
        F: Fn(&Address) -> Result<Option<AccountState>, ChainError>,
    {
        let mut accumulated: BTreeMap<Address, AccountState> = BTreeMap::new();
        let mut evaluations = Vec::new();
        let mut offset: u64 = 0;
        for tx in &self.transactions {
            let tx_id = tx.id();
            for action in &tx.actions {
                let evaluation = self.evaluate_one(
                    action,
                    tx.signer,
                    Some(tx_id),
                    offset,
                    &accumulated,
                    state_getter,
                )?;
                for (address, state) in &evaluation.output_states {
                    accumulated.insert(*address, state.clone());
                }
                evaluations.push(evaluation);
                offset += 1;
            }
        }
        if let Some(action) = block_action {
            let signer = self.miner.unwrap_or_default();
            let evaluation =
                self.evaluate_one(action, signer, None, offset, &accumulated, state_getter)?;
            for (address, state) in &evaluation.output_states {
                accumulated.insert(*address, state.clone());
            }
            evaluations.push(evaluation);
        }
        Ok(evaluations)
    }

    fn evaluate_one<F>(
        &self,
        action: &A,
        signer: Address,
        tx_id: Option<TxId>,
        offset: u64,
        accumulated: &BTreeMap<Address, AccountState>,
        state_getter: &F,
    ) -> Result<ActionEvaluation<A>, ChainError>
    where
        F: Fn(&Address) -> Result<Option<AccountState>, ChainError>,
    {
        let lookup = |address: &Address| -> Result<Option<AccountState>, ChainError> {
            match accumulated.get(address) {
                Some(state) => Ok(Some(state.clone())),
                None => state_getter(address),
            }
        };
        let seed = evaluation_seed(&self.hash, offset);
        let mut ctx = ActionContext::new(signer, self.miner, self.index, false, seed, &lookup);
        match action.execute(&mut ctx) {
            Ok(()) => Ok(ActionEvaluation {
                action: action.clone(),
                tx_id,
                signer,
                miner: self.miner,
                block_index: self.index,
                output_states: ctx.into_updates(),
                error: None,
            }),
            // Engine failures smuggled through action code abort evaluation.
            Err(ActionError::State(inner)) => Err(*inner),
            Err(err) => Ok(ActionEvaluation {
                action: action.clone(),
                tx_id,
                signer,
                miner: self.miner,
                block_index: self.index,
                output_states: BTreeMap::new(),
                error: Some(err),
            }),
        }
    }
}
