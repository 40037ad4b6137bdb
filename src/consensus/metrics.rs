use metrics::{Counter, Gauge};
use metrics_derive::Metrics;

/// Metrics for a [`ConsensusPoller`](super::ConsensusPoller).
#[derive(Metrics, Clone)]
#[metrics(scope = "proxyd.consensus")]
pub struct ConsensusMetrics {
    /// Elected latest block.
    pub latest: Gauge,
    /// Elected safe block.
    pub safe: Gauge,
    /// Elected finalized block.
    pub finalized: Gauge,
    /// Backends in the consensus group.
    pub group_size: Gauge,
    /// Number of backend bans.
    pub bans: Counter,
    /// Number of detected reorgs.
    pub reorgs: Counter,
}
