//! Prometheus metrics for the engine.
//!
//! Defines a [`MetricsRegistry`] owning a Prometheus registry and a set of
//! strongly-typed chain metrics. The library exposes no HTTP surface;
//! embedders scrape via [`MetricsRegistry::gather_text`] or register the
//! metrics into their own exporter.
//!
//! Typical usage:
//!
//! ```ignore
//! let registry = Arc::new(MetricsRegistry::new()?);
//! let chain = BlockChain::new(store, policy)?.with_metrics(registry.chain_handle());
//! ```

use std::sync::Arc;

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder,
};
use tracing::warn;

/// Chain-related Prometheus metrics.
///
/// These are registered into a [`Registry`] and updated by the engine
/// when a handle is attached via `BlockChain::with_metrics`.
#[derive(Clone)]
pub struct ChainMetrics {
    /// Total number of blocks appended to the canonical chain.
    pub blocks_appended: IntCounter,
    /// Total number of blocks mined locally.
    pub blocks_mined: IntCounter,
    /// Total number of canonical-chain swaps.
    pub chain_swaps: IntCounter,
    /// Number of transactions currently in the staging pool.
    pub staged_transactions: IntGauge,
    /// Latency of a full append (validation + writes), in seconds.
    pub append_seconds: Histogram,
    /// Latency of evaluating one block's actions, in seconds.
    pub evaluate_seconds: Histogram,
}

impl ChainMetrics {
    /// Registers chain metrics into the given `Registry`.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let blocks_appended = IntCounter::with_opts(Opts::new(
            "chain_blocks_appended_total",
            "Total number of blocks appended to the canonical chain",
        ))?;
        registry.register(Box::new(blocks_appended.clone()))?;

        let blocks_mined = IntCounter::with_opts(Opts::new(
            "chain_blocks_mined_total",
            "Total number of blocks mined locally",
        ))?;
        registry.register(Box::new(blocks_mined.clone()))?;

        let chain_swaps = IntCounter::with_opts(Opts::new(
            "chain_swaps_total",
            "Total number of canonical-chain swaps",
        ))?;
        registry.register(Box::new(chain_swaps.clone()))?;

        let staged_transactions = IntGauge::with_opts(Opts::new(
            "chain_staged_transactions",
            "Number of transactions currently in the staging pool",
        ))?;
        registry.register(Box::new(staged_transactions.clone()))?;

        let append_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "chain_append_seconds",
                "Time to validate and persist one block in seconds",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
            ]),
        )?;
        registry.register(Box::new(append_seconds.clone()))?;

        let evaluate_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "chain_evaluate_seconds",
                "Time to evaluate one block's actions in seconds",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
            ]),
        )?;
        registry.register(Box::new(evaluate_seconds.clone()))?;

        Ok(Self {
            blocks_appended,
            blocks_mined,
            chain_swaps,
            staged_transactions,
            append_seconds,
            evaluate_seconds,
        })
    }
}

/// Wrapper around a Prometheus registry and the chain metrics.
///
/// The main handle to pass around in an embedding application; wrap it in
/// an [`Arc`] to share across threads.
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Registry,
    chain: Arc<ChainMetrics>,
}

impl MetricsRegistry {
    /// Creates a new `MetricsRegistry` with a fresh underlying `Registry`
    /// and registers the chain metrics.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("plinth".to_string()), None)?;
        let chain = Arc::new(ChainMetrics::register(&registry)?);
        Ok(Self { registry, chain })
    }

    /// The chain metrics handle, for `BlockChain::with_metrics`.
    pub fn chain_handle(&self) -> Arc<ChainMetrics> {
        Arc::clone(&self.chain)
    }

    /// Encodes all metrics in this registry into the Prometheus text format.
    pub fn gather_text(&self) -> String {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            warn!("failed to encode Prometheus metrics: {e}");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
