//! Embeddable blockchain engine.
//!
//! This crate provides the core building blocks for a peer-to-peer ledger
//! whose semantics are supplied by user-defined actions:
//!
//! - strongly-typed domain types (`types`),
//! - the user-action seam and state deltas (`action`),
//! - the chain engine with fork/swap reorganisation (`chain`),
//! - pluggable consensus policy (`policy`),
//! - render subscriptions (`render`),
//! - storage backends behind one contract (`store`),
//! - Prometheus-based metrics (`metrics`),
//! - and a top-level configuration (`config`).
//!
//! Network transports, peer discovery, and wire formats live in higher
//! layers; this crate is the in-process engine they drive.

pub mod action;
pub mod chain;
pub mod config;
pub mod error;
pub mod metrics;
pub mod policy;
pub mod render;
pub mod store;
pub mod types;

// Re-export top-level configuration types.
pub use config::ChainConfig;

// Re-export the engine and its collaborators.
pub use chain::{BlockChain, BlockLocator, LOCATOR_THRESHOLD};
pub use policy::{BlockPolicy, NullPolicy, PolicyConfig, ProofOfWorkPolicy};
pub use render::{ActionRenderer, NullRenderer};

// Re-export the action seam.
pub use action::{AccountState, AccountStateDelta, Action, ActionContext, ActionEvaluation};

// Re-export storage backends and the store contract.
pub use store::{
    BlockStates, ChainId, InMemoryStore, RocksDbConfig, RocksDbStore, Store, StoreError,
};

// Re-export metrics registry and chain metrics.
pub use metrics::{ChainMetrics, MetricsRegistry};

// Re-export errors and domain types at the crate root for convenience.
pub use error::{ActionError, BlockError, ChainError, TxError};
pub use types::{
    Address, Block, Cancel, HashDigest, Nonce, PrivateKey, PublicKey, Signature, Transaction, TxId,
};

/// Type alias for the default persistent store backend.
pub type DefaultStore<A> = RocksDbStore<A>;

/// Type alias for the default consensus policy.
pub type DefaultPolicy<A> = ProofOfWorkPolicy<A>;

/// Type alias for the default engine stack: RocksDB storage under the
/// proof-of-work policy.
pub type DefaultBlockChain<A> = BlockChain<A, DefaultStore<A>, DefaultPolicy<A>>;

impl<A: Action> DefaultBlockChain<A> {
    /// Opens (or creates) a persistent chain from a [`ChainConfig`].
    pub fn open(config: &ChainConfig) -> Result<Self, ChainError> {
        let store = std::sync::Arc::new(RocksDbStore::open(&config.storage)?);
        let policy = std::sync::Arc::new(ProofOfWorkPolicy::from_config(config.policy.clone()));
        BlockChain::new(store, policy)
    }
}
