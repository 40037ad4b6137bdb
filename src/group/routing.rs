use crate::{backend::Backend, config::RoutingStrategy};
use rand::Rng;
use std::{
    hash::{DefaultHasher, Hash, Hasher},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

/// Orders the candidates of a backend group.
#[derive(Debug)]
pub(crate) struct Router {
    strategy: RoutingStrategy,
    next: AtomicUsize,
}

impl Router {
    pub(crate) const fn new(strategy: RoutingStrategy) -> Self {
        Self { strategy, next: AtomicUsize::new(0) }
    }

    /// Reorders `candidates`, indices into `backends`, for a request with the given routing key.
    pub(crate) fn order(&self, candidates: &mut [usize], backends: &[Arc<Backend>], key: &str) {
        if candidates.len() < 2 {
            return;
        }
        match self.strategy {
            RoutingStrategy::RoundRobin => {
                let start = self.next.fetch_add(1, Ordering::Relaxed) % candidates.len();
                candidates.rotate_left(start);
            }
            RoutingStrategy::Weighted => {
                weighted_shuffle(candidates, |index| backends[index].config().weight)
            }
            RoutingStrategy::ConsistentHash => {
                candidates.sort_by_cached_key(|index| {
                    std::cmp::Reverse(rendezvous(key, backends[*index].name()))
                });
            }
        }
    }
}

/// Shuffles so that each position is drawn with probability proportional to the weight among the
/// candidates not placed yet. Zero weights end up last, in their original order.
fn weighted_shuffle(candidates: &mut [usize], weight: impl Fn(usize) -> u32) {
    let mut rng = rand::rng();
    for pos in 0..candidates.len() {
        let total: u64 = candidates[pos..].iter().map(|index| weight(*index) as u64).sum();
        if total == 0 {
            return;
        }
        let mut pick = rng.random_range(0..total);
        for offset in pos..candidates.len() {
            let weight = weight(candidates[offset]) as u64;
            if pick < weight {
                candidates.swap(pos, offset);
                break;
            }
            pick -= weight;
        }
    }
}

/// Highest random weight of a backend for a key.
fn rendezvous(key: &str, backend: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    backend.hash(&mut hasher);
    hasher.finish()
}
