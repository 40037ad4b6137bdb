//! Consensus tracking for backend groups.
//!
//! The [`ConsensusPoller`] polls every backend of a group for its chain heads and periodically
//! elects the subset of backends that agree on a common `latest` block. The result is published as
//! an immutable [`ConsensusSnapshot`] that request handlers read without locking.
//!
//! Backends that misbehave are banned for a while:
//! - reporting block height zero too often,
//! - reporting heads that go backwards or contradict each other,
//! - failing too many requests.
//!
//! Backends that are merely behind (syncing, few peers, stale) are left out of the election
//! without being banned.

use crate::{
    backend::Backend,
    config::BackendGroupConfig,
    constants::RECENT_BLOCK_HASHES,
    error::BackendError,
    window::SlidingWindow,
};
use alloy::primitives::{B256, U64};
use arc_swap::ArcSwap;
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

mod metrics;
pub use self::metrics::ConsensusMetrics;

mod state;
pub use state::*;

/// A consensus change delivered to listeners.
#[derive(Debug, Clone)]
pub struct ConsensusUpdate {
    /// The newly published snapshot.
    pub snapshot: Arc<ConsensusSnapshot>,
    /// Whether the elected chain was reorganized.
    pub reorg: bool,
}

/// Callback invoked after every election.
pub type ConsensusListener = Arc<dyn Fn(&ConsensusUpdate) + Send + Sync>;

/// Consensus settings of a backend group.
#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    /// How long a ban lasts.
    pub ban_period: Duration,
    /// Age after which a backend's state is too old to elect.
    pub max_update_threshold: Duration,
    /// Blocks a candidate may lag behind the highest candidate.
    pub max_block_lag: Option<u64>,
    /// Minimum peer count of a candidate.
    pub min_peer_count: u64,
    /// Interval between polls and elections.
    pub poll_interval: Duration,
}

impl From<&BackendGroupConfig> for ConsensusConfig {
    fn from(config: &BackendGroupConfig) -> Self {
        Self {
            ban_period: config.consensus_ban_period,
            max_update_threshold: config.consensus_max_update_threshold,
            max_block_lag: config.consensus_max_block_lag,
            min_peer_count: config.consensus_min_peer_count,
            poll_interval: config.consensus_poll_interval,
        }
    }
}

/// Polls the backends of a group and elects a consensus view of the chain.
#[derive(Clone)]
pub struct ConsensusPoller {
    inner: Arc<PollerInner>,
}

struct PollerInner {
    group: String,
    /// Primaries followed by fallbacks.
    backends: Vec<Arc<Backend>>,
    primaries: usize,
    states: Vec<Mutex<BackendState>>,
    snapshot: ArcSwap<ConsensusSnapshot>,
    /// Serializes elections so that there is a single writer of the snapshot.
    election: tokio::sync::Mutex<()>,
    fallback_mode: AtomicBool,
    listeners: RwLock<Vec<ConsensusListener>>,
    config: ConsensusConfig,
    cancel: CancellationToken,
    metrics: ConsensusMetrics,
}

impl std::fmt::Debug for ConsensusPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsensusPoller")
            .field("group", &self.inner.group)
            .field("snapshot", &self.inner.snapshot.load())
            .finish_non_exhaustive()
    }
}

impl ConsensusPoller {
    /// Creates a poller over `backends`, of which the first `primaries` are primaries and the rest
    /// fallbacks.
    pub fn new(
        group: impl Into<String>,
        backends: Vec<Arc<Backend>>,
        primaries: usize,
        config: ConsensusConfig,
        cancel: CancellationToken,
    ) -> Self {
        let group = group.into();
        let states = backends
            .iter()
            .map(|backend| {
                Mutex::new(BackendState::new(SlidingWindow::with_length(
                    backend.config().block_height_zero_window_length,
                )))
            })
            .collect();
        Self {
            inner: Arc::new(PollerInner {
                metrics: ConsensusMetrics::new_with_labels(&[("group", group.clone())]),
                group,
                primaries: primaries.min(backends.len()),
                backends,
                states,
                snapshot: ArcSwap::from_pointee(ConsensusSnapshot::default()),
                election: tokio::sync::Mutex::new(()),
                fallback_mode: AtomicBool::new(false),
                listeners: RwLock::new(Vec::new()),
                config,
                cancel,
            }),
        }
    }

    /// Returns the current snapshot.
    pub fn snapshot(&self) -> Arc<ConsensusSnapshot> {
        self.inner.snapshot.load_full()
    }

    /// Registers a callback invoked after every election.
    pub fn add_listener(&self, listener: ConsensusListener) {
        self.inner.listeners.write().push(listener);
    }

    /// Whether the group is currently served by its fallbacks.
    pub fn in_fallback_mode(&self) -> bool {
        self.inner.fallback_mode.load(Ordering::Acquire)
    }

    /// Whether the backend at `index` is banned.
    pub fn is_banned(&self, index: usize) -> bool {
        self.inner.states[index].lock().is_banned(Instant::now())
    }

    /// Spawns the poll and election loops. They stop when the cancellation token fires.
    pub fn start(&self) {
        for index in 0..self.inner.backends.len() {
            let this = self.clone();
            tokio::spawn(async move { this.poll_loop(index).await });
        }
        let this = self.clone();
        tokio::spawn(async move { this.election_loop().await });
        info!(
            group = %self.inner.group,
            backends = self.inner.backends.len(),
            "Started consensus poller"
        );
    }

    async fn poll_loop(&self, index: usize) {
        let mut interval = tokio::time::interval(self.inner.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            if index >= self.inner.primaries && !self.in_fallback_mode() {
                continue;
            }
            self.poll_backend(index).await;
        }
    }

    async fn election_loop(&self) {
        let mut interval = tokio::time::interval(self.inner.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            self.elect().await;
        }
        debug!(group = %self.inner.group, "Stopped consensus poller");
    }

    /// Polls one backend and records what it reports.
    ///
    /// Failures leave the previous state in place.
    pub async fn poll_backend(&self, index: usize) {
        if self.is_banned(index) {
            trace!(backend = %self.inner.backends[index].name(), "Skipping banned backend");
            return;
        }
        let backend = &self.inner.backends[index];

        let latest = match fetch_block(backend, "latest").await {
            Ok(latest) => latest,
            Err(err) => {
                warn!(backend = %backend.name(), %err, "Failed to poll latest block");
                return;
            }
        };
        if latest.number.is_zero() {
            self.observe_zero_height(index);
            return;
        }

        let (safe, finalized) =
            tokio::join!(fetch_block(backend, "safe"), fetch_block(backend, "finalized"));
        let (safe, finalized) = match (safe, finalized) {
            (Ok(safe), Ok(finalized)) => (safe.number.to::<u64>(), finalized.number.to::<u64>()),
            (Err(err), _) | (_, Err(err)) => {
                warn!(backend = %backend.name(), %err, "Failed to poll safe and finalized blocks");
                return;
            }
        };

        let peer_count = if backend.config().consensus_skip_peer_count {
            None
        } else {
            match backend.call::<U64>("net_peerCount", ()).await {
                Ok(count) => Some(count.to::<u64>()),
                Err(err) => {
                    warn!(backend = %backend.name(), %err, "Failed to poll peer count");
                    return;
                }
            }
        };

        let in_sync = match backend.call::<serde_json::Value>("eth_syncing", ()).await {
            Ok(syncing) => syncing == serde_json::Value::Bool(false),
            Err(err) => {
                warn!(backend = %backend.name(), %err, "Failed to poll sync status");
                return;
            }
        };

        self.observe(index, Observation { latest, safe, finalized, peer_count, in_sync });
    }

    /// Records a successful poll.
    pub fn observe(&self, index: usize, observation: Observation) {
        let backend = &self.inner.backends[index];
        let mut state = self.inner.states[index].lock();
        if state.is_inconsistent(&observation) {
            warn!(
                backend = %backend.name(),
                latest = %observation.latest.number,
                safe = observation.safe,
                finalized = observation.finalized,
                prev_safe = state.safe,
                prev_finalized = state.finalized,
                "Backend reported inconsistent block tags, banning"
            );
            drop(state);
            self.ban(index);
            return;
        }
        state.apply(observation, Instant::now());
        drop(state);

        let receipts_target =
            backend.config().consensus_receipts_target.clone().unwrap_or_default();
        ::metrics::gauge!(
            "proxyd_backend_latest_block",
            "backend" => backend.name().to_string(),
            "receipts_target" => receipts_target
        )
        .set(observation.latest.number.to::<u64>() as f64);

        if !backend.is_healthy() {
            warn!(backend = %backend.name(), "Backend is unhealthy, banning");
            self.ban(index);
        }
    }

    /// Records a poll that returned block height zero.
    pub fn observe_zero_height(&self, index: usize) {
        let backend = &self.inner.backends[index];
        let state = self.inner.states[index].lock();
        state.zero_heights.incr();
        let count = state.zero_heights.count() as usize;
        drop(state);

        debug!(backend = %backend.name(), count, "Backend reported block height zero");
        if count > backend.config().block_height_zero_threshold {
            warn!(
                backend = %backend.name(),
                count,
                "Backend reported block height zero too often, banning"
            );
            self.ban(index);
        }
    }

    /// Bans a backend and removes it from the published consensus group right away.
    pub fn ban(&self, index: usize) {
        let until = Instant::now() + self.inner.config.ban_period;
        self.inner.states[index].lock().ban(until);
        self.inner.metrics.bans.increment(1);
        self.inner.snapshot.rcu(|snapshot| {
            let mut snapshot = ConsensusSnapshot::clone(snapshot);
            snapshot.group.retain(|member| *member != index);
            snapshot
        });
    }

    /// Whether the backend at `index` may take part in an election at `now`.
    fn is_candidate(&self, index: usize, now: Instant) -> bool {
        let backend = &self.inner.backends[index];
        let state = self.inner.states[index].lock();
        let Some(last_update) = state.last_update else { return false };
        if state.is_banned(now) || state.latest == 0 {
            return false;
        }
        if backend.config().consensus_forced_candidate {
            return true;
        }

        let config = &self.inner.config;
        let enough_peers = backend.config().consensus_skip_peer_count
            || state.peer_count.is_some_and(|count| count >= config.min_peer_count);
        let fresh = now.saturating_duration_since(last_update) <= config.max_update_threshold;
        enough_peers && state.in_sync && fresh
    }

    fn candidates(&self, range: std::ops::Range<usize>, now: Instant) -> Vec<usize> {
        range.filter(|index| self.is_candidate(*index, now)).collect()
    }

    /// Hash of `block` according to the backend at `index`.
    async fn hash_at(&self, index: usize, block: u64) -> Option<B256> {
        {
            let state = self.inner.states[index].lock();
            if let Some(hash) = state.recent_hashes.get(&block) {
                return Some(*hash);
            }
        }
        let backend = &self.inner.backends[index];
        match fetch_block(backend, &format!("{block:#x}")).await {
            Ok(info) => {
                self.inner.states[index].lock().remember_hash(block, info.hash);
                Some(info.hash)
            }
            Err(err) => {
                debug!(backend = %backend.name(), block, %err, "Failed to fetch block hash");
                None
            }
        }
    }

    /// Runs one election and publishes the result.
    pub async fn elect(&self) {
        let _election = self.inner.election.lock().await;
        let now = Instant::now();
        let prev = self.snapshot();
        let total = self.inner.backends.len();
        let primaries = self.inner.primaries;

        let mut candidates = self.candidates(0..primaries, now);
        if candidates.is_empty() && primaries < total {
            if !self.inner.fallback_mode.swap(true, Ordering::AcqRel) {
                warn!(group = %self.inner.group, "No primary is eligible, entering fallback mode");
                join_all((primaries..total).map(|index| self.poll_backend(index))).await;
            }
            candidates = self.candidates(primaries..total, now);
        } else if !candidates.is_empty() && self.inner.fallback_mode.swap(false, Ordering::AcqRel) {
            info!(group = %self.inner.group, "Primaries recovered, leaving fallback mode");
            for index in primaries..total {
                self.inner.states[index].lock().reset();
            }
        }

        if candidates.is_empty() {
            warn!(group = %self.inner.group, "No backend is eligible for consensus");
            let snapshot =
                ConsensusSnapshot { group: Vec::new(), ..ConsensusSnapshot::clone(&prev) };
            self.publish(snapshot, false);
            return;
        }

        let latest_of = |index: usize| self.inner.states[index].lock().latest;
        if let Some(lag) = self.inner.config.max_block_lag {
            let highest =
                candidates.iter().map(|index| latest_of(*index)).max().unwrap_or_default();
            candidates.retain(|index| latest_of(*index) + lag >= highest);
        }
        let proposed = candidates.iter().map(|index| latest_of(*index)).min().unwrap_or_default();

        let mut block = proposed;
        let mut disagreed_at = None;
        let (agreed_block, agreed_hash, survivors) = loop {
            let hashes = join_all(candidates.iter().map(|index| self.hash_at(*index, block))).await;
            if let Some((hash, survivors)) = self.plurality(&candidates, &hashes) {
                break (block, hash, survivors);
            }
            disagreed_at = Some(block);
            if block == 0 || block - 1 < prev.finalized || proposed - block >= RECENT_BLOCK_HASHES {
                warn!(
                    group = %self.inner.group,
                    proposed,
                    block,
                    "Backends do not agree on any recent block"
                );
                return;
            }
            block -= 1;
        };

        let reorg = disagreed_at.is_some_and(|block| block <= prev.latest)
            || (agreed_block == prev.latest
                && prev.latest_hash.is_some_and(|hash| hash != agreed_hash));

        let (latest, latest_hash) = if reorg || agreed_block >= prev.latest {
            (agreed_block, Some(agreed_hash))
        } else {
            (prev.latest, prev.latest_hash)
        };

        let (safe, finalized) = {
            let states: Vec<_> =
                survivors.iter().map(|index| self.inner.states[*index].lock()).collect();
            (
                states.iter().map(|state| state.safe).min().unwrap_or_default(),
                states.iter().map(|state| state.finalized).min().unwrap_or_default(),
            )
        };
        let safe = safe.max(prev.safe).min(latest);
        let finalized = finalized.max(prev.finalized).min(safe);

        if reorg {
            warn!(
                group = %self.inner.group,
                prev_latest = prev.latest,
                latest,
                "Consensus detected a reorg"
            );
            self.inner.metrics.reorgs.increment(1);
        }

        self.publish(
            ConsensusSnapshot { latest, latest_hash, safe, finalized, group: survivors },
            reorg,
        );
    }

    /// Finds the unique most common hash and the candidates that agree with it.
    ///
    /// A single answering candidate is its own plurality; otherwise at least two must agree.
    /// Forced candidates always survive.
    fn plurality(
        &self,
        candidates: &[usize],
        hashes: &[Option<B256>],
    ) -> Option<(B256, Vec<usize>)> {
        // candidates that failed to report a hash take no part in the vote
        let mut counts: HashMap<B256, usize> = HashMap::new();
        for hash in hashes.iter().flatten() {
            *counts.entry(*hash).or_default() += 1;
        }
        let answered = hashes.iter().flatten().count();
        let top = counts.values().copied().max()?;
        let mut leaders = counts.iter().filter(|(_, count)| **count == top);
        let (hash, _) = leaders.next()?;
        if leaders.next().is_some() || (top < 2 && answered > 1) {
            return None;
        }

        let survivors = candidates
            .iter()
            .zip(hashes)
            .filter(|(index, candidate_hash)| {
                **candidate_hash == Some(*hash)
                    || self.inner.backends[**index].config().consensus_forced_candidate
            })
            .map(|(index, _)| *index)
            .collect::<Vec<_>>();
        if survivors.len() < candidates.len() {
            debug!(
                group = %self.inner.group,
                excluded = candidates.len() - survivors.len(),
                "Excluding backends that disagree with the consensus hash"
            );
        }
        Some((*hash, survivors))
    }

    fn publish(&self, snapshot: ConsensusSnapshot, reorg: bool) {
        // a ban landing while the election ran must not be undone by it
        self.inner.snapshot.rcu(|_| {
            let mut snapshot = snapshot.clone();
            snapshot.group.retain(|index| !self.is_banned(*index));
            snapshot
        });
        let snapshot = self.snapshot();

        let metrics = &self.inner.metrics;
        metrics.latest.set(snapshot.latest as f64);
        metrics.safe.set(snapshot.safe as f64);
        metrics.finalized.set(snapshot.finalized as f64);
        metrics.group_size.set(snapshot.group.len() as f64);

        trace!(
            group = %self.inner.group,
            latest = snapshot.latest,
            safe = snapshot.safe,
            finalized = snapshot.finalized,
            members = snapshot.group.len(),
            "Published consensus"
        );

        let update = ConsensusUpdate { snapshot, reorg };
        for listener in self.inner.listeners.read().iter() {
            listener(&update);
        }
    }
}

async fn fetch_block(backend: &Backend, tag: &str) -> Result<BlockInfo, BackendError> {
    backend
        .call::<Option<BlockInfo>>("eth_getBlockByNumber", (tag, false))
        .await?
        .ok_or_else(|| BackendError::BadResponse(format!("block {tag} not found")))
}
