use async_trait::async_trait;
use thiserror::Error;
use tracing::error;

use crate::{
    aggregator::AggregationError,
    common::ClientId,
    state_machine::{
        phases::{Phase, PhaseName, PhaseState, Shared, Shutdown},
        RoundFailed,
        StateMachine,
    },
    trainer::{EvaluationError, TrainingError},
};

/// Errors which can occur during the execution of the [`StateMachine`].
#[derive(Error, Debug)]
pub enum PhaseError {
    #[error("{0} has no partition")]
    UnknownClient(ClientId),
    #[error("training of {client_id} failed: {source}")]
    Training {
        client_id: ClientId,
        source: TrainingError,
    },
    #[error("the training task of {client_id} did not complete: {reason}")]
    ClientTask { client_id: ClientId, reason: String },
    #[error("aggregate phase failed: {0}")]
    Aggregation(#[from] AggregationError),
    #[error("evaluate phase failed: {0}")]
    Evaluation(#[from] EvaluationError),
}

/// The failure state.
#[derive(Debug)]
pub struct Failure {
    error: PhaseError,
}

#[async_trait]
impl Phase for PhaseState<Failure> {
    const NAME: PhaseName = PhaseName::Failure;

    async fn process(&mut self) -> Result<(), PhaseError> {
        error!(
            "round {} failed: {}",
            self.shared.round_id(),
            self.private.error
        );
        Ok(())
    }

    /// Shuts down with the failure. The last published global model stays valid.
    fn next(self) -> StateMachine {
        let failure = RoundFailed {
            round_id: self.shared.round_id(),
            error: self.private.error,
        };
        PhaseState::<Shutdown>::new(self.shared, Some(failure)).into()
    }
}

impl PhaseState<Failure> {
    /// Creates a new failure state.
    pub fn new(shared: Shared, error: PhaseError) -> Self {
        Self {
            private: Failure { error },
            shared,
        }
    }
}
