//! Client selection.

use rand::{seq::SliceRandom, SeedableRng};
use rand_chacha::ChaCha20Rng;

use crate::common::{ClientId, RoundId};

/// A strategy to pick the clients which train in a round.
pub trait Selector: Send + Sync + 'static {
    /// Selects `count` distinct clients out of the `candidates` for the given round.
    fn select(&mut self, round_id: RoundId, candidates: &[ClientId], count: usize) -> Vec<ClientId>;
}

/// Selects clients uniformly at random without replacement.
///
/// The selection of a round only depends on the seed and the round id.
#[derive(Debug, Clone)]
pub struct RandomSelector {
    seed: u64,
}

impl RandomSelector {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }
}

impl Selector for RandomSelector {
    fn select(&mut self, round_id: RoundId, candidates: &[ClientId], count: usize) -> Vec<ClientId> {
        let mut rng = ChaCha20Rng::seed_from_u64(self.seed);
        rng.set_stream(round_id);
        let mut selected: Vec<ClientId> = candidates
            .choose_multiple(&mut rng, count)
            .copied()
            .collect();
        selected.sort_unstable();
        selected
    }
}

/// Gets the number of clients to select: `round(fraction * clients)`, but at least one.
pub fn selection_count(fraction: f64, clients: usize) -> usize {
    ((fraction * clients as f64).round() as usize).max(1).min(clients)
}
