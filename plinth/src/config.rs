//! Top-level configuration.
//!
//! Aggregates the sub-configs an embedding application needs to wire up a
//! persistent chain: storage (RocksDB path and creation flags) and the
//! proof-of-work policy tuning. Higher layers can construct this from
//! defaults, config files, or environment variables as needed.

use crate::policy::PolicyConfig;
use crate::store::RocksDbConfig;

/// Configuration for a persistent chain.
#[derive(Clone, Debug, Default)]
pub struct ChainConfig {
    /// RocksDB storage backend settings.
    pub storage: RocksDbConfig,
    /// Proof-of-work policy tuning.
    pub policy: PolicyConfig,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DefaultBlockChain;
    use crate::action::{Action, ActionContext};
    use crate::error::ActionError;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[test]
    fn defaults_are_consistent() {
        let cfg = ChainConfig::default();
        assert!(cfg.storage.create_if_missing);
        assert!(cfg.policy.min_difficulty > 0);
        assert!(cfg.policy.difficulty_bound_divisor > 0);
    }

    #[derive(Clone, Debug, Serialize, Deserialize)]
    struct Noop;

    impl Action for Noop {
        fn execute(&self, _ctx: &mut ActionContext<'_>) -> Result<(), ActionError> {
            Ok(())
        }
    }

    #[test]
    fn default_chain_opens_from_config() {
        let tmp = TempDir::new().expect("create temp dir");
        let cfg = ChainConfig {
            storage: RocksDbConfig {
                path: tmp.path().to_string_lossy().to_string(),
                create_if_missing: true,
            },
            ..ChainConfig::default()
        };

        let chain = DefaultBlockChain::<Noop>::open(&cfg).expect("open chain");
        assert_eq!(chain.count().expect("count"), 0);

        // Reopening resumes the same canonical identity.
        let id = chain.id();
        drop(chain);
        let reopened = DefaultBlockChain::<Noop>::open(&cfg).expect("reopen chain");
        assert_eq!(reopened.id(), id);
    }
}
