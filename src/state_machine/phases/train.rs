use async_trait::async_trait;
use futures::future;
use tracing::{info, warn};

use crate::{
    common::ClientId,
    state_machine::{
        phases::{Aggregate, Phase, PhaseError, PhaseName, PhaseState, Shared},
        StateMachine,
    },
    trainer::LocalOutcome,
};

/// The train state.
#[derive(Debug)]
pub struct Train {
    /// The outcomes of the clients which trained successfully, in client order.
    outcomes: Vec<(ClientId, LocalOutcome)>,
    /// The number of clients whose training failed.
    failures: usize,
}

#[async_trait]
impl Phase for PhaseState<Train> {
    const NAME: PhaseName = PhaseName::Train;

    /// Trains all selected clients concurrently and waits for every one of them.
    ///
    /// Failed clients fail the phase, unless failures are accepted in which case they are
    /// excluded from the round.
    async fn process(&mut self) -> Result<(), PhaseError> {
        let model = self.shared.global_model();
        let optimizer = self.shared.state.optimizer;
        let accept_failures = self.shared.state.experiment.accept_failures;

        let mut clients = Vec::new();
        let mut handles = Vec::new();
        for task in self.shared.state.round_params.tasks.iter() {
            let partition = self
                .shared
                .partitions
                .get(task.client_id)
                .cloned()
                .ok_or(PhaseError::UnknownClient(task.client_id))?;
            let trainer = self.shared.trainer.clone();
            let model = model.clone();
            let local_epochs = task.local_epochs;

            clients.push(task.client_id);
            handles.push(tokio::spawn(async move {
                trainer
                    .train_locally(model, partition, local_epochs, optimizer)
                    .await
            }));
        }
        info!("training {} clients", handles.len());

        let results = future::join_all(handles).await;
        for (client_id, result) in clients.into_iter().zip(results) {
            let outcome = match result {
                Ok(Ok(outcome)) => Ok(outcome),
                Ok(Err(source)) => Err(PhaseError::Training { client_id, source }),
                Err(err) => Err(PhaseError::ClientTask {
                    client_id,
                    reason: err.to_string(),
                }),
            };
            match outcome {
                Ok(outcome) => self.private.outcomes.push((client_id, outcome)),
                Err(err) if accept_failures => {
                    warn!("excluding a failed client: {}", err);
                    self.private.failures += 1;
                }
                Err(err) => return Err(err),
            }
        }

        info!(
            "{} clients trained, {} failed",
            self.private.outcomes.len(),
            self.private.failures
        );
        Ok(())
    }

    fn next(self) -> StateMachine {
        let Train { outcomes, failures } = self.private;
        PhaseState::<Aggregate>::new(self.shared, outcomes, failures).into()
    }
}

impl PhaseState<Train> {
    /// Creates a new train state.
    pub fn new(shared: Shared) -> Self {
        Self {
            private: Train {
                outcomes: Vec::new(),
                failures: 0,
            },
            shared,
        }
    }
}
