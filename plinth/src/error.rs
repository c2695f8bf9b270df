use std::fmt;

use crate::store::StoreError;
use crate::types::{Address, HashDigest};

/// Error type returned when a block fails validation.
#[derive(Clone, Debug, PartialEq)]
pub enum BlockError {
    /// The stored hash does not match the block contents, or the hash does
    /// not satisfy the block's difficulty.
    InvalidHash { hash: HashDigest, difficulty: u64 },
    /// The block's difficulty differs from what the policy prescribes.
    InvalidDifficulty { expected: u64, actual: u64 },
    /// The block's index does not continue the chain.
    InvalidIndex { expected: u64, actual: u64 },
    /// The block's previous-hash pointer does not reference the current tip.
    InvalidPreviousHash {
        expected: Option<HashDigest>,
        actual: Option<HashDigest>,
    },
    /// The block's timestamp is outside the allowed window.
    InvalidTimestamp { timestamp: u64, limit: u64 },
    /// The proof-of-work nonce is malformed or missing.
    InvalidNonce,
}

/// Error type returned when a transaction fails validation.
#[derive(Clone, Debug, PartialEq)]
pub enum TxError {
    /// The signature does not verify against the transaction contents.
    InvalidSignature { signer: Address },
    /// The signer address does not match the attached public key.
    InvalidPublicKey { expected: Address, actual: Address },
    /// The transaction's nonce does not continue the signer's confirmed run.
    InvalidTxNonce {
        signer: Address,
        expected: u64,
        actual: u64,
    },
    /// The declared updated-address set does not cover the addresses the
    /// actions actually touch.
    InvalidUpdatedAddresses { undeclared: Vec<Address> },
    /// Raw key material could not be interpreted.
    InvalidKeyMaterial(String),
}

/// Failure raised by user action code during evaluation.
///
/// Evaluation failures are recorded in the block's evaluations and routed
/// to `render_error`/`unrender_error`; they never roll back the chain.
/// The [`ActionError::State`] variant is the exception: it wraps an engine
/// failure encountered while reading previous state and aborts evaluation.
#[derive(Clone, Debug, PartialEq)]
pub enum ActionError {
    /// An asset operation would overdraw a balance.
    InsufficientBalance {
        address: Address,
        currency: String,
        balance: u64,
        amount: u64,
    },
    /// A balance would exceed the representable range.
    BalanceOverflow { address: Address, currency: String },
    /// Free-form failure signalled by action code.
    Failed(String),
    /// State for an address could not be read from the store.
    State(Box<ChainError>),
}

/// High-level errors surfaced by the blockchain engine.
#[derive(Clone, Debug, PartialEq)]
pub enum ChainError {
    /// A block failed validation.
    Block(BlockError),
    /// A transaction failed validation.
    Tx(TxError),
    /// The persistent store failed.
    Store(StoreError),
    /// An action failed outside normal evaluation (e.g. during rehearsal).
    Action(ActionError),
    /// States for the given block were never persisted; retry with
    /// `complete = true` to re-execute missing blocks.
    IncompleteBlockStates(HashDigest),
    /// A referenced block is not present in this chain.
    UnknownBlock(HashDigest),
    /// A nonce counter would go negative while forking.
    NonceUnderflow(Address),
    /// The operation was cancelled cooperatively.
    Canceled,
}

impl From<BlockError> for ChainError {
    fn from(e: BlockError) -> Self {
        ChainError::Block(e)
    }
}

impl From<TxError> for ChainError {
    fn from(e: TxError) -> Self {
        ChainError::Tx(e)
    }
}

impl From<StoreError> for ChainError {
    fn from(e: StoreError) -> Self {
        ChainError::Store(e)
    }
}

impl From<ActionError> for ChainError {
    fn from(e: ActionError) -> Self {
        match e {
            // Unwrap engine failures smuggled through action code.
            ActionError::State(inner) => *inner,
            other => ChainError::Action(other),
        }
    }
}

impl fmt::Display for BlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockError::InvalidHash { hash, difficulty } => {
                write!(f, "hash {hash} does not satisfy difficulty {difficulty}")
            }
            BlockError::InvalidDifficulty { expected, actual } => {
                write!(f, "difficulty {actual} differs from expected {expected}")
            }
            BlockError::InvalidIndex { expected, actual } => {
                write!(f, "index {actual} differs from expected {expected}")
            }
            BlockError::InvalidPreviousHash { expected, actual } => {
                write!(
                    f,
                    "previous hash {} differs from expected {}",
                    fmt_opt_hash(actual),
                    fmt_opt_hash(expected)
                )
            }
            BlockError::InvalidTimestamp { timestamp, limit } => {
                write!(f, "timestamp {timestamp} is outside the allowed bound {limit}")
            }
            BlockError::InvalidNonce => write!(f, "proof-of-work nonce is invalid"),
        }
    }
}

fn fmt_opt_hash(h: &Option<HashDigest>) -> String {
    match h {
        Some(h) => h.to_string(),
        None => "(none)".to_string(),
    }
}

impl fmt::Display for TxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxError::InvalidSignature { signer } => {
                write!(f, "signature by {signer} does not verify")
            }
            TxError::InvalidPublicKey { expected, actual } => {
                write!(f, "public key derives {actual}, transaction claims {expected}")
            }
            TxError::InvalidTxNonce {
                signer,
                expected,
                actual,
            } => {
                write!(f, "nonce {actual} from {signer} differs from expected {expected}")
            }
            TxError::InvalidUpdatedAddresses { undeclared } => {
                write!(f, "{} touched address(es) not declared", undeclared.len())
            }
            TxError::InvalidKeyMaterial(msg) => write!(f, "invalid key material: {msg}"),
        }
    }
}

impl fmt::Display for ActionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionError::InsufficientBalance {
                address,
                currency,
                balance,
                amount,
            } => {
                write!(
                    f,
                    "cannot move {amount} {currency} from {address}: balance is {balance}"
                )
            }
            ActionError::BalanceOverflow { address, currency } => {
                write!(f, "{currency} balance of {address} would overflow")
            }
            ActionError::Failed(msg) => write!(f, "action failed: {msg}"),
            ActionError::State(inner) => write!(f, "state unavailable: {inner}"),
        }
    }
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainError::Block(e) => write!(f, "invalid block: {e}"),
            ChainError::Tx(e) => write!(f, "invalid transaction: {e}"),
            ChainError::Store(e) => write!(f, "store error: {e}"),
            ChainError::Action(e) => write!(f, "{e}"),
            ChainError::IncompleteBlockStates(hash) => {
                write!(f, "states for block {hash} were never persisted")
            }
            ChainError::UnknownBlock(hash) => write!(f, "block {hash} is not in this chain"),
            ChainError::NonceUnderflow(address) => {
                write!(f, "nonce counter for {address} would go negative")
            }
            ChainError::Canceled => write!(f, "operation cancelled"),
        }
    }
}

impl std::error::Error for BlockError {}
impl std::error::Error for TxError {}
impl std::error::Error for ActionError {}
impl std::error::Error for ChainError {}
