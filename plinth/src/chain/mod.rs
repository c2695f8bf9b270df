//! The blockchain engine.
//!
//! [`BlockChain`] wires together a [`Store`], a [`BlockPolicy`], and a set
//! of render subscribers. It owns the canonical ordered chain of blocks,
//! evaluates user actions to derive per-address state, indexes every state
//! change so historical state stays reachable, and performs chain
//! reorganisation through [`fork`](BlockChain::fork) and
//! [`swap`](BlockChain::swap).
//!
//! Locking: one reader/writer lock (`parking_lot`, with upgradable reads)
//! guards the chain identity and serializes compound store operations, and
//! a plain mutex serializes transaction creation so consecutive nonces go
//! to the same signer without gaps. Internal helpers take the chain id
//! explicitly, so no code path ever re-acquires a lock it already holds.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock, RwLockUpgradableReadGuard};
use tracing::{debug, info};

use crate::action::{AccountState, Action, ActionContext, ActionEvaluation};
use crate::error::{BlockError, ChainError, TxError};
use crate::metrics::ChainMetrics;
use crate::policy::BlockPolicy;
use crate::render::ActionRenderer;
use crate::store::{BlockStates, ChainId, Store, StoreError};
use crate::types::{Address, Block, Cancel, HashDigest, PrivateKey, Transaction, TxId};

pub mod locator;

pub use locator::BlockLocator;

/// Default number of densely sampled entries in a block locator.
pub const LOCATOR_THRESHOLD: u64 = 10;

/// The engine: one chain's canonical view over a shared store.
///
/// Generic over:
///
/// - `A`: the user action type,
/// - `S`: the storage backend implementing [`Store`],
/// - `P`: the consensus policy implementing [`BlockPolicy`].
///
/// Forked siblings share the same `Arc<S>` and policy; each instance has
/// its own identity and locks.
pub struct BlockChain<A: Action, S, P> {
    store: Arc<S>,
    policy: Arc<P>,
    renderers: Vec<Arc<dyn ActionRenderer<A>>>,
    metrics: Option<Arc<ChainMetrics>>,
    id: RwLock<ChainId>,
    tx_lock: Mutex<()>,
}

impl<A, S, P> BlockChain<A, S, P>
where
    A: Action,
    S: Store<A>,
    P: BlockPolicy<A>,
{
    /// Opens the canonical chain in `store`, creating one if the store has
    /// never held a chain.
    pub fn new(store: Arc<S>, policy: Arc<P>) -> Result<Self, ChainError> {
        let id = match store.canonical_chain_id()? {
            Some(id) => id,
            None => {
                let id = ChainId::random();
                store.set_canonical_chain_id(&id)?;
                info!(%id, "initialised canonical chain");
                id
            }
        };
        Ok(BlockChain {
            store,
            policy,
            renderers: Vec::new(),
            metrics: None,
            id: RwLock::new(id),
            tx_lock: Mutex::new(()),
        })
    }

    /// Subscribes a renderer to render/unrender notifications.
    pub fn add_renderer(&mut self, renderer: Arc<dyn ActionRenderer<A>>) {
        self.renderers.push(renderer);
    }

    /// Attaches a metrics handle the engine will record into.
    pub fn with_metrics(mut self, metrics: Arc<ChainMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// This chain's identity in the store.
    pub fn id(&self) -> ChainId {
        *self.id.read()
    }

    /// The shared store backing this chain.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// The consensus policy.
    pub fn policy(&self) -> &Arc<P> {
        &self.policy
    }

    /// Number of blocks in this chain.
    pub fn count(&self) -> Result<u64, ChainError> {
        let guard = self.id.read();
        Ok(self.store.count_index(&guard)?)
    }

    /// The highest-index block, if the chain is not empty.
    pub fn tip(&self) -> Result<Option<Block<A>>, ChainError> {
        let guard = self.id.read();
        self.tip_block_at(&guard)
    }

    /// Fetches a block from the shared store by hash.
    ///
    /// The block is not necessarily part of this chain; see
    /// [`contains_block`](BlockChain::contains_block).
    pub fn get_block(&self, hash: &HashDigest) -> Result<Option<Block<A>>, ChainError> {
        Ok(self.store.get_block(hash)?)
    }

    /// Whether `hash` sits in this chain's index.
    pub fn contains_block(&self, hash: &HashDigest) -> Result<bool, ChainError> {
        let guard = self.id.read();
        self.contains_block_at(&guard, hash)
    }

    // ------------------------------------------------------------------
    // Append
    // ------------------------------------------------------------------

    /// Validates `block` as the next block, persists it, and evaluates and
    /// renders its actions.
    pub fn append(&self, block: &Block<A>, now: u64) -> Result<(), ChainError> {
        self.append_with(block, now, true, true)
    }

    /// [`append`](BlockChain::append) with evaluation and rendering
    /// toggles. Skipping evaluation leaves a state hole that
    /// [`get_states`](BlockChain::get_states) can later recover with
    /// `complete = true`.
    pub fn append_with(
        &self,
        block: &Block<A>,
        now: u64,
        evaluate_actions: bool,
        render_actions: bool,
    ) -> Result<(), ChainError> {
        let started = Instant::now();
        let guard = self.id.upgradable_read();
        let id = *guard;

        let tip = self.tip_block_at(&id)?;
        let expected_index = tip.as_ref().map(|b| b.index() + 1).unwrap_or(0);
        if block.index() != expected_index {
            return Err(BlockError::InvalidIndex {
                expected: expected_index,
                actual: block.index(),
            }
            .into());
        }
        let expected_previous = tip.as_ref().map(Block::hash);
        if block.previous_hash() != expected_previous {
            return Err(BlockError::InvalidPreviousHash {
                expected: expected_previous,
                actual: block.previous_hash(),
            }
            .into());
        }
        let parent = self.parent_of_tip_at(&id)?;
        let expected_difficulty = self
            .policy
            .next_block_difficulty(tip.as_ref(), parent.as_ref());
        if block.difficulty() != expected_difficulty {
            return Err(BlockError::InvalidDifficulty {
                expected: expected_difficulty,
                actual: block.difficulty(),
            }
            .into());
        }
        block.validate(now)?;
        self.policy.validate_next_block(tip.as_ref(), block, now)?;

        // Per-signer nonces must continue each signer's confirmed run,
        // counting transactions from the same signer earlier in the block.
        let mut per_signer: BTreeMap<Address, u64> = BTreeMap::new();
        for tx in block.transactions() {
            let base = self.store.get_tx_nonce(&id, &tx.signer)?;
            let offset = per_signer.get(&tx.signer).copied().unwrap_or(0);
            let expected = base + offset;
            if tx.nonce != expected {
                return Err(TxError::InvalidTxNonce {
                    signer: tx.signer,
                    expected,
                    actual: tx.nonce,
                }
                .into());
            }
            *per_signer.entry(tx.signer).or_insert(0) += 1;
        }

        {
            let _write = RwLockUpgradableReadGuard::upgrade(guard);
            self.store.put_block(block)?;
            for tx in block.transactions() {
                self.store.put_transaction(tx)?;
            }
            self.store.append_index(&id, &block.hash())?;
            for (signer, count) in &per_signer {
                self.store.increase_tx_nonce(&id, signer, *count)?;
            }
            let mined: BTreeSet<TxId> = block.transaction_ids().into_iter().collect();
            self.store.unstage_transaction_ids(&mined)?;
        }
        self.update_staged_gauge()?;

        if evaluate_actions {
            self.execute_actions(block, render_actions)?;
        }

        if let Some(metrics) = &self.metrics {
            metrics.blocks_appended.inc();
            metrics.append_seconds.observe(started.elapsed().as_secs_f64());
        }
        info!(
            index = block.index(),
            hash = %block.hash(),
            txs = block.transactions().len(),
            "appended block"
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Evaluation
    // ------------------------------------------------------------------

    /// Evaluates `block`'s actions, persisting states and references on
    /// the first execution and firing render callbacks when `render` is
    /// set.
    ///
    /// Idempotent with respect to state: when states for the block already
    /// exist, evaluation is replayed only to feed renderers, and nothing
    /// is written again.
    pub fn execute_actions(&self, block: &Block<A>, render: bool) -> Result<(), ChainError> {
        let guard = self.id.read();
        let id = *guard;
        self.execute_actions_at(&id, block, render)
    }

    fn execute_actions_at(
        &self,
        id: &ChainId,
        block: &Block<A>,
        render: bool,
    ) -> Result<(), ChainError> {
        let started = Instant::now();
        let first_run = self.store.get_block_states(&block.hash())?.is_none();
        if !first_run && !render {
            return Ok(());
        }

        let evaluations = self.evaluate_block(id, block)?;

        if first_run {
            // Later actions override earlier ones; the final post-block
            // record per address is authoritative.
            let mut states: BlockStates = BTreeMap::new();
            for evaluation in &evaluations {
                for (address, state) in &evaluation.output_states {
                    states.insert(*address, state.clone());
                }
            }
            let updated: BTreeSet<Address> = states.keys().copied().collect();
            self.store.set_block_states(&block.hash(), &states)?;
            self.store
                .store_state_reference(id, &updated, &block.hash(), block.index())?;
            debug!(
                index = block.index(),
                updated = updated.len(),
                "persisted block states"
            );
        }

        if render {
            for evaluation in &evaluations {
                match &evaluation.error {
                    None => {
                        for renderer in &self.renderers {
                            renderer.render(evaluation);
                        }
                    }
                    Some(error) => {
                        for renderer in &self.renderers {
                            renderer.render_error(evaluation, error);
                        }
                    }
                }
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics
                .evaluate_seconds
                .observe(started.elapsed().as_secs_f64());
        }
        Ok(())
    }

    /// Replays the deterministic evaluation of `block` against the chain
    /// state as of its previous block.
    fn evaluate_block(
        &self,
        id: &ChainId,
        block: &Block<A>,
    ) -> Result<Vec<ActionEvaluation<A>>, ChainError> {
        let previous_index = block.index().checked_sub(1);
        let getter = |address: &Address| -> Result<Option<AccountState>, ChainError> {
            match previous_index {
                None => Ok(None),
                Some(max_index) => self.lookup_state_by_index(id, address, max_index),
            }
        };
        let block_action = self.policy.block_action();
        block.evaluate(block_action.as_ref(), &getter)
    }

    fn lookup_state_by_index(
        &self,
        id: &ChainId,
        address: &Address,
        max_index: u64,
    ) -> Result<Option<AccountState>, ChainError> {
        let Some((ref_hash, _)) = self.store.lookup_state_reference(id, address, max_index)?
        else {
            return Ok(None);
        };
        let states = self
            .store
            .get_block_states(&ref_hash)?
            .ok_or(ChainError::IncompleteBlockStates(ref_hash))?;
        Ok(states.get(address).cloned())
    }

    // ------------------------------------------------------------------
    // State queries
    // ------------------------------------------------------------------

    /// The state record of one address; see
    /// [`get_states`](BlockChain::get_states).
    pub fn get_state(
        &self,
        address: &Address,
        offset: Option<&HashDigest>,
        complete: bool,
    ) -> Result<Option<AccountState>, ChainError> {
        Ok(self.get_states(&[*address], offset, complete)?.remove(address))
    }

    /// Resolves the state of `addresses` as of the block `offset` (the tip
    /// when `None`), using the state-reference index to locate the most
    /// recent delta per address.
    ///
    /// A block whose states were never persisted surfaces as
    /// [`ChainError::IncompleteBlockStates`]; passing `complete = true`
    /// instead re-executes every unexecuted block from genesis upward and
    /// retries.
    pub fn get_states(
        &self,
        addresses: &[Address],
        offset: Option<&HashDigest>,
        complete: bool,
    ) -> Result<BTreeMap<Address, AccountState>, ChainError> {
        let guard = self.id.read();
        let id = *guard;

        let offset_index = match offset {
            Some(hash) => {
                if !self.contains_block_at(&id, hash)? {
                    return Err(ChainError::UnknownBlock(*hash));
                }
                self.store
                    .get_block(hash)?
                    .ok_or(ChainError::UnknownBlock(*hash))?
                    .index()
            }
            None => match self.store.count_index(&id)? {
                0 => return Ok(BTreeMap::new()),
                count => count - 1,
            },
        };

        let mut groups: BTreeMap<HashDigest, Vec<Address>> = BTreeMap::new();
        for address in addresses {
            if let Some((hash, _)) =
                self.store.lookup_state_reference(&id, address, offset_index)?
            {
                groups.entry(hash).or_default().push(*address);
            }
        }

        let mut out = BTreeMap::new();
        for (hash, group) in groups {
            let states = match self.store.get_block_states(&hash)? {
                Some(states) => states,
                None if complete => {
                    self.complete_states_at(&id)?;
                    self.store
                        .get_block_states(&hash)?
                        .ok_or(ChainError::IncompleteBlockStates(hash))?
                }
                None => return Err(ChainError::IncompleteBlockStates(hash)),
            };
            for address in group {
                if let Some(state) = states.get(&address) {
                    out.insert(address, state.clone());
                }
            }
        }
        Ok(out)
    }

    /// Walks the chain from genesis and executes every block whose states
    /// are missing, without rendering.
    fn complete_states_at(&self, id: &ChainId) -> Result<(), ChainError> {
        let count = self.store.count_index(id)?;
        for position in 0..count {
            let hash = self
                .store
                .index_block_hash(id, position as i64)?
                .ok_or(ChainError::Store(StoreError::Corrupted("chain index has a gap")))?;
            if self.store.get_block_states(&hash)?.is_none() {
                let block = self
                    .store
                    .get_block(&hash)?
                    .ok_or(ChainError::UnknownBlock(hash))?;
                debug!(index = position, %hash, "re-executing block to recover missing states");
                self.execute_actions_at(id, &block, false)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Staging
    // ------------------------------------------------------------------

    /// Persists and stages transactions for inclusion in a future block.
    /// The flag records whether each transaction should be broadcast.
    pub fn stage_transactions(&self, txs: &[(Transaction<A>, bool)]) -> Result<(), ChainError> {
        {
            let _guard = self.id.write();
            let mut ids: BTreeMap<TxId, bool> = BTreeMap::new();
            for (tx, broadcast) in txs {
                self.store.put_transaction(tx)?;
                ids.insert(tx.id(), *broadcast);
            }
            self.store.stage_transaction_ids(&ids)?;
        }
        self.update_staged_gauge()
    }

    /// Removes transactions from the staging pool.
    pub fn unstage_transactions(&self, ids: &BTreeSet<TxId>) -> Result<(), ChainError> {
        {
            let _guard = self.id.write();
            self.store.unstage_transaction_ids(ids)?;
        }
        self.update_staged_gauge()
    }

    /// The staged transactions, optionally only those flagged for
    /// broadcast.
    pub fn staged_transactions(
        &self,
        to_broadcast_only: bool,
    ) -> Result<Vec<Transaction<A>>, ChainError> {
        let _guard = self.id.read();
        let mut out = Vec::new();
        for id in self.store.staged_transaction_ids(to_broadcast_only)? {
            if let Some(tx) = self.store.get_transaction(&id)? {
                out.push(tx);
            }
        }
        Ok(out)
    }

    fn update_staged_gauge(&self) -> Result<(), ChainError> {
        if let Some(metrics) = &self.metrics {
            metrics
                .staged_transactions
                .set(self.store.staged_transaction_ids(false)?.len() as i64);
        }
        Ok(())
    }

    /// The nonce the signer's next transaction should carry: the confirmed
    /// count extended by the longest contiguous run of staged nonces.
    pub fn get_next_tx_nonce(&self, signer: &Address) -> Result<u64, ChainError> {
        let guard = self.id.read();
        self.next_tx_nonce_at(&guard, signer)
    }

    fn next_tx_nonce_at(&self, id: &ChainId, signer: &Address) -> Result<u64, ChainError> {
        let mut next = self.store.get_tx_nonce(id, signer)?;
        let mut staged: BTreeSet<u64> = BTreeSet::new();
        for tx_id in self.store.staged_transaction_ids(false)? {
            if let Some(tx) = self.store.get_transaction(&tx_id)? {
                if tx.signer == *signer {
                    staged.insert(tx.nonce);
                }
            }
        }
        while staged.contains(&next) {
            next += 1;
        }
        Ok(next)
    }

    /// Builds, signs, and stages a transaction with the signer's next
    /// contiguous nonce.
    ///
    /// Serialized by the transaction lock so two concurrent calls for the
    /// same signer cannot race to the same nonce. Actions are rehearsed
    /// against current chain state to derive the updated-address set; a
    /// non-empty `updated_addresses` must cover everything the rehearsal
    /// touches.
    pub fn make_transaction(
        &self,
        private_key: &PrivateKey,
        actions: Vec<A>,
        updated_addresses: BTreeSet<Address>,
        timestamp: u64,
    ) -> Result<Transaction<A>, ChainError> {
        let _tx_guard = self.tx_lock.lock();
        let signer = private_key.to_address();

        let rehearsed = self.rehearse(&signer, &actions)?;
        let updated_addresses = if updated_addresses.is_empty() {
            rehearsed
        } else {
            let undeclared: Vec<Address> =
                rehearsed.difference(&updated_addresses).copied().collect();
            if !undeclared.is_empty() {
                return Err(TxError::InvalidUpdatedAddresses { undeclared }.into());
            }
            updated_addresses
        };

        let nonce = self.get_next_tx_nonce(&signer)?;
        let tx = Transaction::new(private_key, nonce, updated_addresses, timestamp, actions);
        self.stage_transactions(&[(tx.clone(), true)])?;
        debug!(id = %tx.id(), %signer, nonce, "staged local transaction");
        Ok(tx)
    }

    /// Dry-runs `actions` against current chain state and reports the
    /// addresses they touch. Rehearsal writes are discarded.
    fn rehearse(&self, signer: &Address, actions: &[A]) -> Result<BTreeSet<Address>, ChainError> {
        let guard = self.id.read();
        let id = *guard;
        let count = self.store.count_index(&id)?;
        let tip_index = count.checked_sub(1);

        let getter = |address: &Address| -> Result<Option<AccountState>, ChainError> {
            match tip_index {
                None => Ok(None),
                Some(max_index) => self.lookup_state_by_index(&id, address, max_index),
            }
        };

        let mut accumulated: BTreeMap<Address, AccountState> = BTreeMap::new();
        let mut touched: BTreeSet<Address> = BTreeSet::new();
        for action in actions {
            let (result, updates) = {
                let lookup = |address: &Address| -> Result<Option<AccountState>, ChainError> {
                    match accumulated.get(address) {
                        Some(state) => Ok(Some(state.clone())),
                        None => getter(address),
                    }
                };
                let mut ctx = ActionContext::new(*signer, None, count, true, [0u8; 32], &lookup);
                let result = action.execute(&mut ctx);
                (result, ctx.into_updates())
            };
            result.map_err(ChainError::from)?;
            for (address, state) in updates {
                touched.insert(address);
                accumulated.insert(address, state);
            }
        }
        Ok(touched)
    }

    // ------------------------------------------------------------------
    // Mining
    // ------------------------------------------------------------------

    /// Assembles the next block out of contiguously staged transactions,
    /// mines it, and appends it.
    pub fn mine_block(
        &self,
        miner: Address,
        now: u64,
        cancel: &Cancel,
    ) -> Result<Block<A>, ChainError> {
        let (index, previous_hash, difficulty, transactions) = {
            let guard = self.id.read();
            let id = *guard;
            let tip = self.tip_block_at(&id)?;
            let parent = self.parent_of_tip_at(&id)?;
            let index = self.store.count_index(&id)?;
            let previous_hash = tip.as_ref().map(Block::hash);
            let difficulty = self
                .policy
                .next_block_difficulty(tip.as_ref(), parent.as_ref());
            let transactions = self.gather_staged_at(&id)?;
            (index, previous_hash, difficulty, transactions)
        };

        let block = Block::mine(
            index,
            difficulty,
            Some(miner),
            previous_hash,
            now,
            transactions,
            cancel,
        )?;
        self.append(&block, now)?;
        if let Some(metrics) = &self.metrics {
            metrics.blocks_mined.inc();
        }
        Ok(block)
    }

    /// Staged transactions whose nonces are contiguous with each signer's
    /// confirmed run. Stale nonces are skipped; a gap stops the signer's
    /// run at the hole.
    fn gather_staged_at(&self, id: &ChainId) -> Result<Vec<Transaction<A>>, ChainError> {
        let mut by_signer: BTreeMap<Address, BTreeMap<u64, Transaction<A>>> = BTreeMap::new();
        for tx_id in self.store.staged_transaction_ids(false)? {
            if let Some(tx) = self.store.get_transaction(&tx_id)? {
                by_signer
                    .entry(tx.signer)
                    .or_default()
                    .entry(tx.nonce)
                    .or_insert(tx);
            }
        }
        let mut picked = Vec::new();
        for (signer, txs) in by_signer {
            let mut expected = self.store.get_tx_nonce(id, &signer)?;
            for (nonce, tx) in txs {
                if nonce < expected {
                    continue;
                }
                if nonce != expected {
                    break;
                }
                picked.push(tx);
                expected += 1;
            }
        }
        Ok(picked)
    }

    // ------------------------------------------------------------------
    // Fork and swap
    // ------------------------------------------------------------------

    /// Creates a sibling chain sharing this chain's prefix up to and
    /// including `branch_hash`.
    ///
    /// State references are copied with everything above the branch point
    /// stripped, and nonce counters are rolled back by the number of
    /// transactions each signer had in the stripped blocks. The sibling
    /// carries no renderers; nothing is rendered until a
    /// [`swap`](BlockChain::swap).
    ///
    /// Cancellation is polled per copied block; a cancelled fork leaves no
    /// namespaces behind.
    pub fn fork(&self, branch_hash: &HashDigest, cancel: &Cancel) -> Result<Self, ChainError> {
        let guard = self.id.read();
        let id = *guard;

        let branch_block = self
            .store
            .get_block(branch_hash)?
            .ok_or(ChainError::UnknownBlock(*branch_hash))?;
        if !self.contains_block_at(&id, branch_hash)? {
            return Err(ChainError::UnknownBlock(*branch_hash));
        }
        let branch_index = branch_block.index();

        let new_id = ChainId::random();
        if let Err(e) = self.fork_into(&id, &new_id, branch_index, cancel) {
            // Leave nothing behind for the unborn chain.
            let _ = self.store.delete_chain_id(&new_id);
            return Err(e);
        }

        info!(%id, fork = %new_id, branch = %branch_hash, "forked chain");
        Ok(BlockChain {
            store: Arc::clone(&self.store),
            policy: Arc::clone(&self.policy),
            renderers: Vec::new(),
            metrics: self.metrics.clone(),
            id: RwLock::new(new_id),
            tx_lock: Mutex::new(()),
        })
    }

    fn fork_into(
        &self,
        id: &ChainId,
        new_id: &ChainId,
        branch_index: u64,
        cancel: &Cancel,
    ) -> Result<(), ChainError> {
        for hash in self.store.iterate_index(id, 0, Some(branch_index + 1))? {
            if cancel.is_canceled() {
                return Err(ChainError::Canceled);
            }
            self.store.append_index(new_id, &hash)?;
        }

        // Addresses whose state changed above the branch lose those
        // references in the fork.
        let stripped: BTreeSet<Address> = self
            .store
            .list_all_state_references(id, Some(branch_index + 1), None)?
            .into_keys()
            .collect();
        self.store
            .fork_state_references(id, new_id, branch_index, &stripped)?;

        let count = self.store.count_index(id)?;
        let mut dropped: BTreeMap<Address, u64> = BTreeMap::new();
        for position in (branch_index + 1)..count {
            if cancel.is_canceled() {
                return Err(ChainError::Canceled);
            }
            let hash = self
                .store
                .index_block_hash(id, position as i64)?
                .ok_or(ChainError::Store(StoreError::Corrupted("chain index has a gap")))?;
            let block = self
                .store
                .get_block(&hash)?
                .ok_or(ChainError::UnknownBlock(hash))?;
            for tx in block.transactions() {
                *dropped.entry(tx.signer).or_insert(0) += 1;
            }
        }
        for (signer, nonce) in self.store.list_tx_nonces(id)? {
            let removed = dropped.get(&signer).copied().unwrap_or(0);
            let value = nonce
                .checked_sub(removed)
                .ok_or(ChainError::NonceUnderflow(signer))?;
            if value > 0 {
                self.store.increase_tx_nonce(new_id, &signer, value)?;
            }
        }
        Ok(())
    }

    /// Atomically replaces this chain's identity with `other`'s.
    ///
    /// With `render = true`, actions above the topmost common block are
    /// unrendered from this chain in reverse canonical order before the
    /// identity swap, and the new chain's actions above the branch point
    /// are rendered in canonical order afterwards. The retired identity's
    /// namespaces are deleted.
    ///
    /// Cancellation is honoured per block only while unrendering; once the
    /// identity has been rewritten the swap always runs to completion.
    pub fn swap(&self, other: &Self, render: bool, cancel: &Cancel) -> Result<(), ChainError> {
        let other_id = other.id();
        let mut branch_index: Option<u64> = None;

        if render {
            let guard = self.id.read();
            let id = *guard;
            branch_index = self.topmost_common_index(&id, &other_id)?;
            let count = self.store.count_index(&id)?;
            let start = branch_index.map(|i| i + 1).unwrap_or(0);
            for position in (start..count).rev() {
                if cancel.is_canceled() {
                    return Err(ChainError::Canceled);
                }
                let hash = self
                    .store
                    .index_block_hash(&id, position as i64)?
                    .ok_or(ChainError::Store(StoreError::Corrupted("chain index has a gap")))?;
                let block = self
                    .store
                    .get_block(&hash)?
                    .ok_or(ChainError::UnknownBlock(hash))?;
                let evaluations = self.evaluate_block(&id, &block)?;
                for evaluation in evaluations.iter().rev() {
                    match &evaluation.error {
                        None => {
                            for renderer in &self.renderers {
                                renderer.unrender(evaluation);
                            }
                        }
                        Some(error) => {
                            for renderer in &self.renderers {
                                renderer.unrender_error(evaluation, error);
                            }
                        }
                    }
                }
            }
        }

        {
            let mut guard = self.id.write();
            let old = *guard;
            if old != other_id {
                self.store.set_canonical_chain_id(&other_id)?;
                self.store.delete_chain_id(&old)?;
                *guard = other_id;
                info!(%old, new = %other_id, "swapped canonical chain");
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics.chain_swaps.inc();
        }

        if render {
            let guard = self.id.read();
            let id = *guard;
            let count = self.store.count_index(&id)?;
            let start = branch_index.map(|i| i + 1).unwrap_or(0);
            for position in start..count {
                let hash = self
                    .store
                    .index_block_hash(&id, position as i64)?
                    .ok_or(ChainError::Store(StoreError::Corrupted("chain index has a gap")))?;
                let block = self
                    .store
                    .get_block(&hash)?
                    .ok_or(ChainError::UnknownBlock(hash))?;
                self.execute_actions_at(&id, &block, true)?;
            }
        }

        Ok(())
    }

    /// Index of the highest block the two chains share, walking backward
    /// in lockstep from the shorter tip.
    fn topmost_common_index(&self, a: &ChainId, b: &ChainId) -> Result<Option<u64>, ChainError> {
        let len = self.store.count_index(a)?.min(self.store.count_index(b)?);
        for position in (0..len).rev() {
            let ha = self.store.index_block_hash(a, position as i64)?;
            let hb = self.store.index_block_hash(b, position as i64)?;
            if ha.is_some() && ha == hb {
                return Ok(Some(position));
            }
        }
        Ok(None)
    }

    // ------------------------------------------------------------------
    // Locators
    // ------------------------------------------------------------------

    /// Samples this chain's hashes tip-first: dense for the first
    /// `threshold` entries, then with geometrically growing stride down to
    /// genesis.
    pub fn block_locator(&self, threshold: u64) -> Result<BlockLocator, ChainError> {
        let guard = self.id.read();
        let id = *guard;
        let count = self.store.count_index(&id)?;
        if count == 0 {
            return Ok(BlockLocator::default());
        }
        let mut hashes = Vec::new();
        for position in locator::sample_indexes(count - 1, threshold) {
            let hash = self
                .store
                .index_block_hash(&id, position as i64)?
                .ok_or(ChainError::Store(StoreError::Corrupted("chain index has a gap")))?;
            hashes.push(hash);
        }
        Ok(BlockLocator::new(hashes))
    }

    /// The first locator entry that sits in this chain, falling back to
    /// this chain's genesis.
    pub fn find_branch_point(
        &self,
        locator: &BlockLocator,
    ) -> Result<Option<HashDigest>, ChainError> {
        let guard = self.id.read();
        let id = *guard;
        for hash in locator {
            if self.contains_block_at(&id, hash)? {
                return Ok(Some(*hash));
            }
        }
        Ok(self.store.index_block_hash(&id, 0)?)
    }

    /// Up to `count` hashes of this chain starting at the branch point the
    /// locator resolves to (inclusive), ending early once `stop` has been
    /// emitted.
    pub fn find_next_hashes(
        &self,
        locator: &BlockLocator,
        stop: Option<&HashDigest>,
        count: usize,
    ) -> Result<Vec<HashDigest>, ChainError> {
        let Some(branch_point) = self.find_branch_point(locator)? else {
            return Ok(Vec::new());
        };
        let guard = self.id.read();
        let id = *guard;
        let branch_block = self
            .store
            .get_block(&branch_point)?
            .ok_or(ChainError::UnknownBlock(branch_point))?;
        let total = self.store.count_index(&id)?;
        let mut out = Vec::new();
        for position in branch_block.index()..total {
            if out.len() >= count {
                break;
            }
            let hash = self
                .store
                .index_block_hash(&id, position as i64)?
                .ok_or(ChainError::Store(StoreError::Corrupted("chain index has a gap")))?;
            out.push(hash);
            if stop == Some(&hash) {
                break;
            }
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Guard-scoped helpers (callers hold the chain lock)
    // ------------------------------------------------------------------

    fn tip_block_at(&self, id: &ChainId) -> Result<Option<Block<A>>, ChainError> {
        match self.store.index_block_hash(id, -1)? {
            None => Ok(None),
            Some(hash) => Ok(Some(
                self.store
                    .get_block(&hash)?
                    .ok_or(ChainError::UnknownBlock(hash))?,
            )),
        }
    }

    fn parent_of_tip_at(&self, id: &ChainId) -> Result<Option<Block<A>>, ChainError> {
        match self.store.index_block_hash(id, -2)? {
            None => Ok(None),
            Some(hash) => Ok(Some(
                self.store
                    .get_block(&hash)?
                    .ok_or(ChainError::UnknownBlock(hash))?,
            )),
        }
    }

    fn contains_block_at(&self, id: &ChainId, hash: &HashDigest) -> Result<bool, ChainError> {
        match self.store.get_block(hash)? {
            None => Ok(false),
            Some(block) => {
                Ok(self.store.index_block_hash(id, block.index() as i64)? == Some(*hash))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ActionError;
    use crate::policy::{NullPolicy, PolicyConfig, ProofOfWorkPolicy};
    use crate::store::InMemoryStore;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    const NOW: u64 = 1_700_000_000;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    enum TestAction {
        Set { address: Address, value: String },
        Mint { to: Address, amount: u64 },
        Fail,
    }

    impl Action for TestAction {
        fn execute(&self, ctx: &mut ActionContext<'_>) -> Result<(), ActionError> {
            match self {
                TestAction::Set { address, value } => {
                    ctx.states.set_state(*address, json!(value))
                }
                TestAction::Mint { to, amount } => {
                    ctx.states.mint_asset(*to, "GOLD", *amount)
                }
                TestAction::Fail => Err(ActionError::Failed("deliberate".into())),
            }
        }
    }

    fn label(action: &TestAction) -> String {
        match action {
            TestAction::Set { value, .. } => value.clone(),
            TestAction::Mint { amount, .. } => format!("mint-{amount}"),
            TestAction::Fail => "fail".to_string(),
        }
    }

    #[derive(Default)]
    struct RecordingRenderer {
        events: Mutex<Vec<(String, u64, String)>>,
    }

    impl RecordingRenderer {
        fn drain(&self) -> Vec<(String, u64, String)> {
            std::mem::take(&mut *self.events.lock())
        }
    }

    impl ActionRenderer<TestAction> for RecordingRenderer {
        fn render(&self, evaluation: &ActionEvaluation<TestAction>) {
            self.events.lock().push((
                "render".into(),
                evaluation.block_index,
                label(&evaluation.action),
            ));
        }

        fn unrender(&self, evaluation: &ActionEvaluation<TestAction>) {
            self.events.lock().push((
                "unrender".into(),
                evaluation.block_index,
                label(&evaluation.action),
            ));
        }

        fn render_error(&self, evaluation: &ActionEvaluation<TestAction>, _error: &ActionError) {
            self.events.lock().push((
                "render_error".into(),
                evaluation.block_index,
                label(&evaluation.action),
            ));
        }

        fn unrender_error(&self, evaluation: &ActionEvaluation<TestAction>, _error: &ActionError) {
            self.events.lock().push((
                "unrender_error".into(),
                evaluation.block_index,
                label(&evaluation.action),
            ));
        }
    }

    type TestChain = BlockChain<TestAction, InMemoryStore<TestAction>, NullPolicy>;

    fn new_chain() -> TestChain {
        BlockChain::new(Arc::new(InMemoryStore::new()), Arc::new(NullPolicy)).expect("open chain")
    }

    fn chain_with_renderer() -> (TestChain, Arc<RecordingRenderer>) {
        let mut chain = new_chain();
        let renderer = Arc::new(RecordingRenderer::default());
        chain.add_renderer(renderer.clone());
        (chain, renderer)
    }

    fn dummy_key(byte: u8) -> PrivateKey {
        PrivateKey::from_bytes(&[byte; 32]).expect("nonzero scalar is a valid key")
    }

    fn miner() -> Address {
        Address([0xaa; crate::types::ADDRESS_LEN])
    }

    fn hash_at(chain: &TestChain, index: i64) -> HashDigest {
        chain
            .store()
            .index_block_hash(&chain.id(), index)
            .expect("index read")
            .expect("index in range")
    }

    fn state_value(chain: &TestChain, address: &Address) -> Option<serde_json::Value> {
        chain
            .get_state(address, None, false)
            .expect("state query")
            .and_then(|state| state.value)
    }

    #[test]
    fn empty_chain_has_no_tip_and_empty_state() {
        let chain = new_chain();
        assert_eq!(chain.count().unwrap(), 0);
        assert!(chain.tip().unwrap().is_none());
        assert!(
            chain
                .get_states(&[miner()], None, false)
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn mining_an_empty_pool_yields_an_empty_genesis() {
        let chain = new_chain();
        let block = chain
            .mine_block(miner(), NOW, &Cancel::new())
            .expect("mine genesis");

        assert_eq!(block.index(), 0);
        assert_eq!(block.difficulty(), 0);
        assert!(block.transactions().is_empty());
        assert_eq!(chain.count().unwrap(), 1);
        assert_eq!(chain.tip().unwrap().expect("tip exists").hash(), block.hash());
    }

    #[test]
    fn two_block_chain_tracks_state_history() {
        let chain = new_chain();
        let key = dummy_key(1);
        let signer = key.to_address();

        chain
            .make_transaction(
                &key,
                vec![TestAction::Set { address: signer, value: "A".into() }],
                BTreeSet::new(),
                NOW,
            )
            .expect("stage tx1");
        let first = chain.mine_block(miner(), NOW, &Cancel::new()).expect("mine");

        chain
            .make_transaction(
                &key,
                vec![TestAction::Set { address: signer, value: "B".into() }],
                BTreeSet::new(),
                NOW + 1,
            )
            .expect("stage tx2");
        chain
            .mine_block(miner(), NOW + 1, &Cancel::new())
            .expect("mine");

        assert_eq!(state_value(&chain, &signer), Some(json!("B")));
        let historical = chain
            .get_state(&signer, Some(&first.hash()), false)
            .unwrap()
            .expect("historical state exists");
        assert_eq!(historical.value, Some(json!("A")));
        assert_eq!(chain.get_next_tx_nonce(&signer).unwrap(), 2);
    }

    #[test]
    fn append_rejects_gapped_tx_nonce_and_leaves_chain_unchanged() {
        let chain = new_chain();
        let key = dummy_key(2);
        let signer = key.to_address();

        let gapped = Transaction::new(
            &key,
            1,
            BTreeSet::new(),
            NOW,
            vec![TestAction::Set { address: signer, value: "X".into() }],
        );
        let block = Block::mine(
            0,
            0,
            Some(miner()),
            None,
            NOW,
            vec![gapped],
            &Cancel::new(),
        )
        .expect("mine candidate");

        let err = chain.append(&block, NOW).unwrap_err();
        assert_eq!(
            err,
            ChainError::Tx(TxError::InvalidTxNonce {
                signer,
                expected: 0,
                actual: 1,
            })
        );
        assert_eq!(chain.count().unwrap(), 0);
    }

    #[test]
    fn incomplete_states_surface_and_recover() {
        let chain = new_chain();
        let key = dummy_key(3);
        let signer = key.to_address();

        let tx = Transaction::new(
            &key,
            0,
            BTreeSet::from([signer]),
            NOW,
            vec![TestAction::Set { address: signer, value: "A".into() }],
        );
        let block = Block::mine(
            0,
            0,
            Some(miner()),
            None,
            NOW,
            vec![tx],
            &Cancel::new(),
        )
        .expect("mine candidate");

        // Append without evaluation, then graft the reference the way
        // state-sync does: the index knows the address changed here, but
        // the delta itself was never persisted.
        chain
            .append_with(&block, NOW, false, false)
            .expect("append without evaluation");
        chain
            .store()
            .store_state_reference(
                &chain.id(),
                &BTreeSet::from([signer]),
                &block.hash(),
                block.index(),
            )
            .expect("graft reference");

        let err = chain.get_states(&[signer], None, false).unwrap_err();
        assert_eq!(err, ChainError::IncompleteBlockStates(block.hash()));

        let recovered = chain
            .get_states(&[signer], None, true)
            .expect("recovery fills the hole");
        assert_eq!(recovered[&signer].value, Some(json!("A")));

        // Once recovered, the plain query works too.
        assert_eq!(state_value(&chain, &signer), Some(json!("A")));
    }

    #[test]
    fn fork_and_swap_unrender_and_render_in_order() {
        let (chain, renderer) = chain_with_renderer();
        let key = dummy_key(4);
        let signer = key.to_address();

        chain.mine_block(miner(), NOW, &Cancel::new()).expect("genesis");
        for i in 1..=5u64 {
            chain
                .make_transaction(
                    &key,
                    vec![TestAction::Set { address: signer, value: format!("v{i}") }],
                    BTreeSet::new(),
                    NOW + i,
                )
                .expect("stage");
            chain
                .mine_block(miner(), NOW + i, &Cancel::new())
                .expect("mine");
        }
        assert_eq!(chain.count().unwrap(), 6);

        let branch_hash = hash_at(&chain, 3);
        let fork = chain.fork(&branch_hash, &Cancel::new()).expect("fork at block 3");
        assert_eq!(fork.count().unwrap(), 4);

        let alt_key = dummy_key(5);
        for i in 4..=6u64 {
            fork.make_transaction(
                &alt_key,
                vec![TestAction::Set { address: signer, value: format!("w{i}") }],
                BTreeSet::new(),
                NOW + 10 + i,
            )
            .expect("stage on fork");
            fork.mine_block(miner(), NOW + 10 + i, &Cancel::new())
                .expect("mine on fork");
        }
        assert_eq!(fork.count().unwrap(), 7);

        let old_id = chain.id();
        renderer.drain();

        chain.swap(&fork, true, &Cancel::new()).expect("swap");

        let events = renderer.drain();
        assert_eq!(
            events,
            vec![
                ("unrender".into(), 5, "v5".into()),
                ("unrender".into(), 4, "v4".into()),
                ("render".into(), 4, "w4".into()),
                ("render".into(), 5, "w5".into()),
                ("render".into(), 6, "w6".into()),
            ]
        );

        assert_eq!(chain.id(), fork.id());
        assert_eq!(
            chain.store().canonical_chain_id().unwrap(),
            Some(fork.id())
        );
        assert_eq!(chain.count().unwrap(), 7);
        assert_eq!(state_value(&chain, &signer), Some(json!("w6")));
        // The retired identity's namespaces are gone.
        assert_eq!(chain.store().count_index(&old_id).unwrap(), 0);
        // v1..v3 survive on the new chain; v4, v5 were stripped.
        assert_eq!(chain.get_next_tx_nonce(&signer).unwrap(), 3);
        assert_eq!(chain.get_next_tx_nonce(&alt_key.to_address()).unwrap(), 3);
    }

    #[test]
    fn swap_without_render_is_silent() {
        let (chain, renderer) = chain_with_renderer();
        let key = dummy_key(6);
        let signer = key.to_address();

        chain.mine_block(miner(), NOW, &Cancel::new()).expect("genesis");
        chain
            .make_transaction(
                &key,
                vec![TestAction::Set { address: signer, value: "old".into() }],
                BTreeSet::new(),
                NOW + 1,
            )
            .expect("stage");
        chain
            .mine_block(miner(), NOW + 1, &Cancel::new())
            .expect("mine");

        let fork = chain.fork(&hash_at(&chain, 0), &Cancel::new()).expect("fork at genesis");
        fork.make_transaction(
            &dummy_key(7),
            vec![TestAction::Set { address: signer, value: "new".into() }],
            BTreeSet::new(),
            NOW + 2,
        )
        .expect("stage on fork");
        fork.mine_block(miner(), NOW + 2, &Cancel::new())
            .expect("mine on fork");

        renderer.drain();
        chain.swap(&fork, false, &Cancel::new()).expect("swap silently");

        assert!(renderer.drain().is_empty());
        assert_eq!(state_value(&chain, &signer), Some(json!("new")));
    }

    #[test]
    fn fork_of_unknown_block_is_rejected() {
        let chain = new_chain();
        chain.mine_block(miner(), NOW, &Cancel::new()).expect("genesis");

        let unknown = HashDigest::compute(b"nowhere");
        assert_eq!(
            chain.fork(&unknown, &Cancel::new()).unwrap_err(),
            ChainError::UnknownBlock(unknown)
        );
    }

    #[test]
    fn cancelled_fork_leaves_no_namespaces_behind() {
        let chain = new_chain();
        for i in 0..3u64 {
            chain
                .mine_block(miner(), NOW + i, &Cancel::new())
                .expect("mine");
        }

        let cancel = Cancel::new();
        cancel.cancel();
        let err = chain.fork(&hash_at(&chain, 2), &cancel).unwrap_err();
        assert_eq!(err, ChainError::Canceled);

        // The canonical chain is untouched and nothing extra was written:
        // only the canonical identity has an index in the store.
        assert_eq!(chain.count().unwrap(), 3);
    }

    #[test]
    fn gapped_staged_transactions_are_not_mined() {
        let chain = new_chain();
        let key = dummy_key(8);
        let signer = key.to_address();

        let contiguous = Transaction::new(
            &key,
            0,
            BTreeSet::new(),
            NOW,
            vec![TestAction::Set { address: signer, value: "ok".into() }],
        );
        let gapped = Transaction::new(
            &key,
            2,
            BTreeSet::new(),
            NOW,
            vec![TestAction::Set { address: signer, value: "hole".into() }],
        );
        chain
            .stage_transactions(&[(contiguous.clone(), true), (gapped.clone(), false)])
            .expect("stage");

        let block = chain
            .mine_block(miner(), NOW, &Cancel::new())
            .expect("mine");

        let mined: Vec<TxId> = block.transaction_ids();
        assert_eq!(mined, vec![contiguous.id()]);
        // The gapped transaction stays staged for a future contiguous run.
        let staged: Vec<TxId> = chain
            .staged_transactions(false)
            .unwrap()
            .iter()
            .map(Transaction::id)
            .collect();
        assert_eq!(staged, vec![gapped.id()]);
    }

    #[test]
    fn next_nonce_extends_over_staged_run() {
        let chain = new_chain();
        let key = dummy_key(9);
        let signer = key.to_address();

        assert_eq!(chain.get_next_tx_nonce(&signer).unwrap(), 0);
        for i in 0..3u64 {
            chain
                .make_transaction(
                    &key,
                    vec![TestAction::Set { address: signer, value: format!("{i}") }],
                    BTreeSet::new(),
                    NOW,
                )
                .expect("stage");
        }
        assert_eq!(chain.get_next_tx_nonce(&signer).unwrap(), 3);

        chain.mine_block(miner(), NOW, &Cancel::new()).expect("mine");
        assert_eq!(chain.get_next_tx_nonce(&signer).unwrap(), 3);
    }

    #[test]
    fn concurrent_staging_and_mining_respects_nonce_contiguity() {
        let chain = Arc::new(new_chain());
        let keys = [dummy_key(10), dummy_key(11)];
        let per_signer = 5u64;

        std::thread::scope(|scope| {
            for key in &keys {
                let chain = Arc::clone(&chain);
                scope.spawn(move || {
                    let signer = key.to_address();
                    for i in 0..per_signer {
                        chain
                            .make_transaction(
                                key,
                                vec![TestAction::Set {
                                    address: signer,
                                    value: format!("{i}"),
                                }],
                                BTreeSet::new(),
                                NOW,
                            )
                            .expect("stage concurrently");
                    }
                });
            }
            let chain = Arc::clone(&chain);
            scope.spawn(move || {
                for _ in 0..20 {
                    chain
                        .mine_block(miner(), NOW, &Cancel::new())
                        .expect("mine concurrently");
                }
            });
        });

        // Drain whatever is left in the pool.
        while !chain.staged_transactions(false).unwrap().is_empty() {
            chain.mine_block(miner(), NOW, &Cancel::new()).expect("drain");
        }

        // Replay the chain and check each signer's nonces arrive in order
        // without gaps.
        let mut seen: BTreeMap<Address, u64> = BTreeMap::new();
        for position in 0..chain.count().unwrap() {
            let block = chain
                .get_block(&hash_at(&chain, position as i64))
                .unwrap()
                .expect("block exists");
            for tx in block.transactions() {
                let expected = seen.get(&tx.signer).copied().unwrap_or(0);
                assert_eq!(tx.nonce, expected, "nonce gap for {}", tx.signer);
                seen.insert(tx.signer, expected + 1);
            }
        }
        for key in &keys {
            assert_eq!(seen[&key.to_address()], per_signer);
        }
    }

    #[test]
    fn failed_actions_route_to_render_error_without_blocking_append() {
        let (chain, renderer) = chain_with_renderer();
        let key = dummy_key(12);

        let tx = Transaction::new(
            &key,
            0,
            BTreeSet::new(),
            NOW,
            vec![TestAction::Fail],
        );
        chain.stage_transactions(&[(tx, true)]).expect("stage");
        chain.mine_block(miner(), NOW, &Cancel::new()).expect("mine");

        let events = renderer.drain();
        assert_eq!(events, vec![("render_error".into(), 0, "fail".into())]);
        assert_eq!(chain.count().unwrap(), 1);
    }

    #[test]
    fn mint_actions_move_balances_through_the_chain() {
        let chain = new_chain();
        let key = dummy_key(13);
        let holder = key.to_address();

        chain
            .make_transaction(
                &key,
                vec![TestAction::Mint { to: holder, amount: 25 }],
                BTreeSet::new(),
                NOW,
            )
            .expect("stage");
        chain.mine_block(miner(), NOW, &Cancel::new()).expect("mine");

        let state = chain
            .get_state(&holder, None, false)
            .unwrap()
            .expect("holder has state");
        assert_eq!(state.balance("GOLD"), 25);
        assert_eq!(state.value, None);
    }

    #[test]
    fn declared_updated_addresses_must_cover_rehearsal() {
        let chain = new_chain();
        let key = dummy_key(14);
        let signer = key.to_address();
        let elsewhere = Address([0x77; crate::types::ADDRESS_LEN]);

        let err = chain
            .make_transaction(
                &key,
                vec![TestAction::Set { address: elsewhere, value: "x".into() }],
                BTreeSet::from([signer]),
                NOW,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            ChainError::Tx(TxError::InvalidUpdatedAddresses { .. })
        ));
    }

    #[test]
    fn locator_finds_the_branch_point_between_siblings() {
        let chain = new_chain();
        for i in 0..12u64 {
            chain
                .mine_block(miner(), NOW + i, &Cancel::new())
                .expect("mine");
        }

        let fork = chain.fork(&hash_at(&chain, 7), &Cancel::new()).expect("fork at 7");
        let alt_key = dummy_key(15);
        for i in 0..2u64 {
            fork.make_transaction(
                &alt_key,
                vec![TestAction::Set {
                    address: alt_key.to_address(),
                    value: format!("{i}"),
                }],
                BTreeSet::new(),
                NOW + 20 + i,
            )
            .expect("stage on fork");
            fork.mine_block(miner(), NOW + 20 + i, &Cancel::new())
                .expect("mine on fork");
        }

        let locator = chain.block_locator(LOCATOR_THRESHOLD).expect("locator");
        assert_eq!(locator.hashes()[0], hash_at(&chain, 11));

        let branch = fork
            .find_branch_point(&locator)
            .unwrap()
            .expect("branch point found");
        assert_eq!(branch, hash_at(&chain, 7));

        let next = fork
            .find_next_hashes(&locator, None, 10)
            .expect("next hashes");
        assert_eq!(next[0], branch);
        assert_eq!(next.len(), 3);
        assert_eq!(*next.last().unwrap(), hash_at(&fork, -1));
    }

    #[test]
    fn locator_of_an_empty_chain_is_empty() {
        let chain = new_chain();
        let locator = chain.block_locator(LOCATOR_THRESHOLD).expect("locator");
        assert!(locator.is_empty());
        assert_eq!(chain.find_branch_point(&locator).unwrap(), None);
    }

    fn pow_policy() -> ProofOfWorkPolicy<TestAction> {
        ProofOfWorkPolicy::from_config(PolicyConfig {
            block_interval_secs: 10,
            min_difficulty: 16,
            difficulty_bound_divisor: 128,
            max_future_drift_secs: 900,
        })
    }

    #[test]
    fn proof_of_work_chain_mines_with_policy_difficulties() {
        let chain: BlockChain<TestAction, _, _> =
            BlockChain::new(Arc::new(InMemoryStore::new()), Arc::new(pow_policy()))
                .expect("open chain");

        let genesis = chain
            .mine_block(miner(), NOW, &Cancel::new())
            .expect("genesis");
        assert_eq!(genesis.difficulty(), 0);

        let first = chain
            .mine_block(miner(), NOW + 5, &Cancel::new())
            .expect("block 1");
        assert_eq!(first.difficulty(), 16);
        assert!(first.hash().satisfies(16));

        // The 5 s gap beats the 10 s target, so difficulty steps up by
        // max(16 / 128, 1) = 1.
        let second = chain
            .mine_block(miner(), NOW + 10, &Cancel::new())
            .expect("block 2");
        assert_eq!(second.difficulty(), 17);
    }

    #[test]
    fn policy_block_action_runs_after_every_block() {
        let policy = pow_policy().with_block_action(TestAction::Mint {
            to: miner(),
            amount: 5,
        });
        let chain: BlockChain<TestAction, _, _> =
            BlockChain::new(Arc::new(InMemoryStore::new()), Arc::new(policy))
                .expect("open chain");

        chain.mine_block(miner(), NOW, &Cancel::new()).expect("genesis");
        chain
            .mine_block(miner(), NOW + 1, &Cancel::new())
            .expect("block 1");

        let state = chain
            .get_state(&miner(), None, false)
            .unwrap()
            .expect("miner accrued rewards");
        assert_eq!(state.balance("GOLD"), 10);
    }

    #[test]
    fn metrics_record_appends_and_swaps() {
        let registry = crate::metrics::MetricsRegistry::new().expect("metrics");
        let chain: TestChain =
            BlockChain::new(Arc::new(InMemoryStore::new()), Arc::new(NullPolicy))
                .expect("open chain")
                .with_metrics(registry.chain_handle());

        chain.mine_block(miner(), NOW, &Cancel::new()).expect("mine");
        let fork = chain.fork(&hash_at(&chain, 0), &Cancel::new()).expect("fork");
        fork.mine_block(miner(), NOW + 1, &Cancel::new()).expect("mine fork");
        chain.swap(&fork, false, &Cancel::new()).expect("swap");

        let text = registry.gather_text();
        assert!(text.contains("chain_blocks_appended_total"));
        assert!(text.contains("chain_swaps_total"));
    }
}
