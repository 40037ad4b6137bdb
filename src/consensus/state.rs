use crate::{constants::RECENT_BLOCK_HASHES, window::SlidingWindow};
use alloy::primitives::{B256, U64};
use serde::Deserialize;
use std::{collections::BTreeMap, time::Instant};

/// The part of a block header the poller cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockInfo {
    /// Block number.
    pub number: U64,
    /// Block hash.
    pub hash: B256,
    /// Hash of the parent block.
    pub parent_hash: B256,
}

/// One successful poll of a backend.
#[derive(Debug, Clone, Copy)]
pub struct Observation {
    /// The `latest` block.
    pub latest: BlockInfo,
    /// The `safe` block number.
    pub safe: u64,
    /// The `finalized` block number.
    pub finalized: u64,
    /// Peer count, unless peer counts are skipped for this backend.
    pub peer_count: Option<u64>,
    /// Whether the backend reported it is not syncing.
    pub in_sync: bool,
}

/// What the poller knows about one backend.
#[derive(Debug)]
pub struct BackendState {
    /// Latest block number.
    pub latest: u64,
    /// Hash of the latest block.
    pub latest_hash: Option<B256>,
    /// Safe block number.
    pub safe: u64,
    /// Finalized block number.
    pub finalized: u64,
    /// Hashes of recently observed blocks.
    pub recent_hashes: BTreeMap<u64, B256>,
    /// Last reported peer count.
    pub peer_count: Option<u64>,
    /// Whether the backend is done syncing.
    pub in_sync: bool,
    /// When the last poll succeeded. `None` until the first one does.
    pub last_update: Option<Instant>,
    /// Zero-height observations.
    pub zero_heights: SlidingWindow,
    /// End of the current ban, if any.
    pub banned_until: Option<Instant>,
}

impl BackendState {
    /// Creates an empty state counting zero heights over the given window.
    pub fn new(zero_heights: SlidingWindow) -> Self {
        Self {
            latest: 0,
            latest_hash: None,
            safe: 0,
            finalized: 0,
            recent_hashes: BTreeMap::new(),
            peer_count: None,
            in_sync: false,
            last_update: None,
            zero_heights,
            banned_until: None,
        }
    }

    /// Whether the backend is banned at `now`.
    pub fn is_banned(&self, now: Instant) -> bool {
        self.banned_until.is_some_and(|until| now < until)
    }

    /// Whether an observation contradicts itself or what the backend reported before.
    pub fn is_inconsistent(&self, observation: &Observation) -> bool {
        let latest = observation.latest.number.to::<u64>();
        latest < observation.safe
            || observation.safe < observation.finalized
            || observation.safe < self.safe
            || observation.finalized < self.finalized
    }

    /// Records an observation.
    pub fn apply(&mut self, observation: Observation, now: Instant) {
        let latest = observation.latest.number.to::<u64>();
        self.latest = latest;
        self.latest_hash = Some(observation.latest.hash);
        self.safe = observation.safe;
        self.finalized = observation.finalized;
        self.peer_count = observation.peer_count;
        self.in_sync = observation.in_sync;
        self.last_update = Some(now);
        self.follow_head(observation.latest);
    }

    /// Keeps the remembered hashes on the chain ending at `head`.
    ///
    /// Hashes survive when `head` is a block already known or the child of the previous one.
    /// Any other head may sit on a different chain, so everything remembered is dropped and
    /// refetched on demand.
    fn follow_head(&mut self, head: BlockInfo) {
        let number = head.number.to::<u64>();
        if self.recent_hashes.get(&number) == Some(&head.hash) {
            self.recent_hashes.split_off(&(number + 1));
        } else if number > 0 && self.recent_hashes.get(&(number - 1)) == Some(&head.parent_hash) {
            self.recent_hashes.split_off(&number);
        } else {
            self.recent_hashes.clear();
        }
        self.remember_hash(number, head.hash);
    }

    /// Remembers the hash of a block, keeping only the most recent ones.
    ///
    /// A hash that replaces a different one at the same height also drops everything above it.
    pub fn remember_hash(&mut self, number: u64, hash: B256) {
        if self.recent_hashes.get(&number).is_some_and(|known| *known != hash) {
            self.recent_hashes.split_off(&number);
        }
        self.recent_hashes.insert(number, hash);
        while self.recent_hashes.len() as u64 > RECENT_BLOCK_HASHES {
            self.recent_hashes.pop_first();
        }
    }

    /// Bans the backend until `until` and forgets its chain state, so that it starts over once
    /// the ban lapses.
    pub fn ban(&mut self, until: Instant) {
        self.banned_until = Some(until);
        self.latest = 0;
        self.latest_hash = None;
        self.safe = 0;
        self.finalized = 0;
        self.recent_hashes.clear();
        self.last_update = None;
    }

    /// Forgets everything but the zero-height window, used when a fallback stops being needed.
    pub fn reset(&mut self) {
        self.latest = 0;
        self.latest_hash = None;
        self.safe = 0;
        self.finalized = 0;
        self.recent_hashes.clear();
        self.peer_count = None;
        self.in_sync = false;
        self.last_update = None;
    }
}

/// The consensus view of a backend group, published atomically.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsensusSnapshot {
    /// Elected latest block.
    pub latest: u64,
    /// Hash of the elected latest block.
    pub latest_hash: Option<B256>,
    /// Elected safe block.
    pub safe: u64,
    /// Elected finalized block.
    pub finalized: u64,
    /// Indices of the backends that may serve traffic.
    pub group: Vec<usize>,
}

impl ConsensusSnapshot {
    /// Whether the backend at `index` is part of the consensus group.
    pub fn contains(&self, index: usize) -> bool {
        self.group.contains(&index)
    }

    /// Whether an election has produced a head yet.
    pub const fn has_head(&self) -> bool {
        self.latest > 0
    }
}
