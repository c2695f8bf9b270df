//! Pluggable consensus policy.
//!
//! A [`BlockPolicy`] decides the difficulty of the next block, applies
//! policy-specific validation on top of the engine's structural checks,
//! and may supply an implicit action that runs after every block's
//! transactions (e.g. a mining reward).

use serde::{Deserialize, Serialize};

use crate::action::Action;
use crate::error::{BlockError, ChainError};
use crate::types::Block;

/// Abstraction over consensus policy rules.
///
/// The engine consults the policy with the current tip and, where the
/// difficulty algorithm needs it, the tip's parent; policies never reach
/// back into the engine, which keeps the two free of reference cycles.
pub trait BlockPolicy<A: Action>: Send + Sync {
    /// An implicit action appended after each block's transactions,
    /// executed as the miner. `None` disables the mechanism.
    fn block_action(&self) -> Option<A> {
        None
    }

    /// Difficulty the next block must carry, given the current tip and
    /// the tip's parent.
    fn next_block_difficulty(&self, tip: Option<&Block<A>>, parent: Option<&Block<A>>) -> u64;

    /// Policy-specific validation of a candidate for the next block.
    ///
    /// Runs after the engine's structural checks (index, previous hash,
    /// difficulty, hash integrity, transaction signatures).
    fn validate_next_block(
        &self,
        tip: Option<&Block<A>>,
        candidate: &Block<A>,
        now: u64,
    ) -> Result<(), ChainError>;

    /// Validates a contiguous run of blocks, e.g. one received from a peer.
    ///
    /// The default walks the slice pairwise: block-local validation,
    /// linkage, difficulty (where enough context exists inside the slice),
    /// and [`validate_next_block`](BlockPolicy::validate_next_block).
    fn validate_blocks(&self, blocks: &[Block<A>], now: u64) -> Result<(), ChainError> {
        let mut tip: Option<&Block<A>> = None;
        let mut parent: Option<&Block<A>> = None;
        for block in blocks {
            block.validate(now)?;
            if let Some(tip_block) = tip {
                if block.index() != tip_block.index() + 1 {
                    return Err(BlockError::InvalidIndex {
                        expected: tip_block.index() + 1,
                        actual: block.index(),
                    }
                    .into());
                }
                if block.previous_hash() != Some(tip_block.hash()) {
                    return Err(BlockError::InvalidPreviousHash {
                        expected: Some(tip_block.hash()),
                        actual: block.previous_hash(),
                    }
                    .into());
                }
                // The difficulty algorithm needs the tip's parent; inside a
                // slice that context only exists from the second pair on,
                // or when the tip is the genesis block.
                if parent.is_some() || tip_block.index() == 0 {
                    let expected = self.next_block_difficulty(tip, parent);
                    if block.difficulty() != expected {
                        return Err(BlockError::InvalidDifficulty {
                            expected,
                            actual: block.difficulty(),
                        }
                        .into());
                    }
                }
            }
            self.validate_next_block(tip, block, now)?;
            parent = tip;
            tip = Some(block);
        }
        Ok(())
    }
}

/// Tuning knobs for [`ProofOfWorkPolicy`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Target seconds between consecutive blocks.
    pub block_interval_secs: u64,
    /// Floor for the difficulty of every mined (non-genesis) block.
    pub min_difficulty: u64,
    /// Divisor for the per-block difficulty adjustment step.
    pub difficulty_bound_divisor: u64,
    /// How far into the future a block timestamp may sit.
    pub max_future_drift_secs: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            block_interval_secs: 10,
            min_difficulty: 1024,
            difficulty_bound_divisor: 128,
            max_future_drift_secs: 900,
        }
    }
}

/// Interval-targeting Hashcash policy.
///
/// Difficulty moves by `tip.difficulty / difficulty_bound_divisor` per
/// block: up when the last inter-block gap was shorter than the target
/// interval, down otherwise, never below `min_difficulty`. Genesis carries
/// difficulty zero.
#[derive(Clone, Debug)]
pub struct ProofOfWorkPolicy<A> {
    config: PolicyConfig,
    block_action: Option<A>,
}

impl<A: Action> ProofOfWorkPolicy<A> {
    /// Constructs a policy from a [`PolicyConfig`].
    pub fn from_config(config: PolicyConfig) -> Self {
        Self {
            config,
            block_action: None,
        }
    }

    /// Attaches an implicit block action (e.g. a mining reward).
    pub fn with_block_action(mut self, action: A) -> Self {
        self.block_action = Some(action);
        self
    }
}

impl<A: Action> Default for ProofOfWorkPolicy<A> {
    fn default() -> Self {
        Self::from_config(PolicyConfig::default())
    }
}

impl<A: Action> BlockPolicy<A> for ProofOfWorkPolicy<A> {
    fn block_action(&self) -> Option<A> {
        self.block_action.clone()
    }

    fn next_block_difficulty(&self, tip: Option<&Block<A>>, parent: Option<&Block<A>>) -> u64 {
        let Some(tip) = tip else {
            // Genesis is not mined.
            return 0;
        };
        let Some(parent) = parent else {
            return self.config.min_difficulty.max(1);
        };
        let gap = tip.timestamp().saturating_sub(parent.timestamp());
        let step = (tip.difficulty() / self.config.difficulty_bound_divisor).max(1);
        let next = if gap < self.config.block_interval_secs {
            tip.difficulty().saturating_add(step)
        } else {
            tip.difficulty().saturating_sub(step)
        };
        next.max(self.config.min_difficulty)
    }

    fn validate_next_block(
        &self,
        tip: Option<&Block<A>>,
        candidate: &Block<A>,
        now: u64,
    ) -> Result<(), ChainError> {
        let limit = now.saturating_add(self.config.max_future_drift_secs);
        if candidate.timestamp() > limit {
            return Err(BlockError::InvalidTimestamp {
                timestamp: candidate.timestamp(),
                limit,
            }
            .into());
        }
        if let Some(tip) = tip {
            if candidate.timestamp() < tip.timestamp() {
                return Err(BlockError::InvalidTimestamp {
                    timestamp: candidate.timestamp(),
                    limit: tip.timestamp(),
                }
                .into());
            }
        }
        Ok(())
    }
}

/// A policy without rules: difficulty zero, everything accepted.
///
/// Useful for tests and for isolating engine logic.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullPolicy;

impl<A: Action> BlockPolicy<A> for NullPolicy {
    fn next_block_difficulty(&self, _tip: Option<&Block<A>>, _parent: Option<&Block<A>>) -> u64 {
        0
    }

    fn validate_next_block(
        &self,
        _tip: Option<&Block<A>>,
        _candidate: &Block<A>,
        _now: u64,
    ) -> Result<(), ChainError> {
        Ok(())
    }
}
