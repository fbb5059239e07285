use async_trait::async_trait;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use tracing::{debug, info};

use crate::{
    common::RoundId,
    settings::TrainingSettings,
    state_machine::{
        coordinator::{RoundParameters, TrainingTask},
        phases::{Phase, PhaseError, PhaseName, PhaseState, Shared, Train},
        selector::selection_count,
        StateMachine,
    },
};

/// The generator streams of the epoch draws, disjoint from the selection streams.
const EPOCH_STREAMS: u64 = 1 << 63;

/// The select state.
#[derive(Debug)]
pub struct Select;

#[async_trait]
impl Phase for PhaseState<Select> {
    const NAME: PhaseName = PhaseName::Select;

    async fn process(&mut self) -> Result<(), PhaseError> {
        let round_id = self.shared.round_id();
        let experiment = self.shared.state.experiment;

        let candidates = self.shared.partitions.client_ids();
        let count = selection_count(experiment.clients_per_round, candidates.len());
        let selected = self.shared.selector.select(round_id, &candidates, count);
        info!("selected {} of {} clients", selected.len(), candidates.len());

        let epochs = local_epochs(
            &self.shared.state.training,
            experiment.seed,
            round_id,
            selected.len(),
        );
        let tasks = selected
            .into_iter()
            .zip(epochs)
            .map(|(client_id, local_epochs)| TrainingTask {
                client_id,
                local_epochs,
            })
            .collect::<Vec<_>>();
        for task in tasks.iter() {
            debug!("{} trains for {} epoch(s)", task.client_id, task.local_epochs);
        }

        self.shared.state.round_params = RoundParameters { tasks };
        Ok(())
    }

    fn broadcast(&mut self) {
        info!("broadcasting new round parameters");
        let params = self.shared.state.round_params.clone();
        self.shared.events.broadcast_params(params);
    }

    fn next(self) -> StateMachine {
        PhaseState::<Train>::new(self.shared).into()
    }
}

impl PhaseState<Select> {
    /// Creates a new select state.
    pub fn new(mut shared: Shared) -> Self {
        // The round id must be correct when the phase event is emitted, so it is updated when
        // the select state is instantiated.
        shared.set_round_id(shared.round_id() + 1);
        debug!("new round ID = {}", shared.round_id());
        Self {
            private: Select,
            shared,
        }
    }
}

/// Draws the local epochs of the selected clients for a round.
///
/// Without variable local epochs every client trains for `local_epochs`, otherwise the epochs are
/// drawn uniformly from `var_min_epochs..=var_max_epochs`, determined by the seed and the round.
fn local_epochs(
    training: &TrainingSettings,
    seed: u64,
    round_id: RoundId,
    clients: usize,
) -> Vec<u32> {
    if !training.var_local_epochs {
        return vec![training.local_epochs; clients];
    }
    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    rng.set_stream(EPOCH_STREAMS | round_id);
    (0..clients)
        .map(|_| rng.gen_range(training.var_min_epochs..=training.var_max_epochs))
        .collect()
}
