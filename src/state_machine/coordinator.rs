//! Coordinator state and round parameter types.

use serde::Serialize;

use crate::{
    common::{ClientId, RoundId},
    settings::{ExperimentSettings, OptimizerSettings, TrainingSettings},
};

/// The training assignment of a selected client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct TrainingTask {
    /// The selected client.
    pub client_id: ClientId,
    /// The number of local epochs the client trains for in this round.
    pub local_epochs: u32,
}

/// The round parameters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RoundParameters {
    /// The training assignments of the selected clients, in ascending client order.
    pub tasks: Vec<TrainingTask>,
}

/// The coordinator state.
#[derive(Clone, Debug)]
pub struct CoordinatorState {
    /// Internal ID used to identify a round
    pub round_id: RoundId,
    /// The round parameters.
    pub round_params: RoundParameters,
    /// The experiment settings.
    pub experiment: ExperimentSettings,
    /// The local training settings.
    pub training: TrainingSettings,
    /// The local optimizer settings handed to every client.
    pub optimizer: OptimizerSettings,
}

impl CoordinatorState {
    pub fn new(
        experiment: ExperimentSettings,
        training: TrainingSettings,
        optimizer: OptimizerSettings,
    ) -> Self {
        Self {
            round_id: 0,
            round_params: RoundParameters::default(),
            experiment,
            training,
            optimizer,
        }
    }

    /// Checks whether the current round is the last one.
    pub fn is_last_round(&self) -> bool {
        self.round_id >= self.experiment.num_rounds
    }
}
