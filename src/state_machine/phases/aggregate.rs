use async_trait::async_trait;
use tracing::{debug, info};

use crate::{
    aggregator::AggregationSummary,
    common::ClientId,
    state_machine::{
        history::{weighted_average, RoundSummary},
        phases::{Evaluate, Phase, PhaseError, PhaseName, PhaseState, Shared},
        StateMachine,
    },
    trainer::{LocalOutcome, Metrics},
};

/// The aggregate state.
#[derive(Debug)]
pub struct Aggregate {
    outcomes: Vec<(ClientId, LocalOutcome)>,
    /// The summary of the round, completed by the aggregation.
    summary: RoundSummary,
}

#[async_trait]
impl Phase for PhaseState<Aggregate> {
    const NAME: PhaseName = PhaseName::Aggregate;

    /// Aggregates the client outcomes into the global model, weighting each client by the ratio
    /// of its partition.
    async fn process(&mut self) -> Result<(), PhaseError> {
        let outcomes = std::mem::take(&mut self.private.outcomes);
        self.private.summary.train = weighted_average(
            &outcomes
                .iter()
                .map(|(_, outcome)| {
                    let metrics = Metrics {
                        loss: outcome.loss,
                        accuracy: outcome.accuracy,
                    };
                    (outcome.num_examples, metrics)
                })
                .collect::<Vec<_>>(),
        );

        let shared = &mut self.shared;
        let updates = outcomes
            .into_iter()
            .map(|(client_id, outcome)| {
                let data_weight = shared
                    .partitions
                    .get(client_id)
                    .ok_or(PhaseError::UnknownClient(client_id))?
                    .ratio();
                debug!(
                    "{}: {} local steps, data weight {:.4}",
                    client_id, outcome.local_steps, data_weight
                );
                Ok(shared
                    .aggregator
                    .update(client_id, outcome.delta, outcome.local_steps, data_weight))
            })
            .collect::<Result<Vec<_>, PhaseError>>()?;

        self.private.summary.aggregation = shared.aggregator.apply(&mut shared.global, updates)?;
        info!(
            "global model updated with {} client update(s)",
            self.private.summary.aggregation.accepted
        );
        Ok(())
    }

    fn broadcast(&mut self) {
        info!("broadcasting the new global model");
        let model = self.shared.global_model();
        self.shared.events.broadcast_model(model);
    }

    fn next(self) -> StateMachine {
        PhaseState::<Evaluate>::new(self.shared, self.private.summary).into()
    }
}

impl PhaseState<Aggregate> {
    /// Creates a new aggregate state.
    pub fn new(shared: Shared, outcomes: Vec<(ClientId, LocalOutcome)>, failures: usize) -> Self {
        let summary = RoundSummary {
            round_id: shared.round_id(),
            selected: outcomes.len() + failures,
            failures,
            aggregation: AggregationSummary::default(),
            train: None,
            test: None,
        };
        Self {
            private: Aggregate { outcomes, summary },
            shared,
        }
    }
}
