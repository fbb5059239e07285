use async_trait::async_trait;
use tracing::{debug, info};

use crate::state_machine::{
    history::RoundSummary,
    phases::{Phase, PhaseError, PhaseName, PhaseState, Select, Shared, Shutdown},
    StateMachine,
};

/// The evaluate state.
#[derive(Debug)]
pub struct Evaluate {
    summary: RoundSummary,
}

#[async_trait]
impl Phase for PhaseState<Evaluate> {
    const NAME: PhaseName = PhaseName::Evaluate;

    /// Evaluates the new global model, if an evaluator is configured, and records the round.
    async fn process(&mut self) -> Result<(), PhaseError> {
        if let Some(evaluator) = self.shared.evaluator.clone() {
            let metrics = evaluator.evaluate(self.shared.global_model()).await?;
            info!(
                "centralized evaluation: loss {:.4}, accuracy {:.4}",
                metrics.loss, metrics.accuracy
            );
            self.private.summary.test = Some(metrics);
        } else {
            debug!("no evaluator configured");
        }

        if let Some(train) = self.private.summary.train {
            info!(
                "client training: loss {:.4}, accuracy {:.4}",
                train.loss, train.accuracy
            );
        }
        self.shared.history.push(self.private.summary.clone());
        Ok(())
    }

    fn next(self) -> StateMachine {
        if self.shared.state.is_last_round() {
            info!("completed all {} rounds", self.shared.state.experiment.num_rounds);
            PhaseState::<Shutdown>::new(self.shared, None).into()
        } else {
            PhaseState::<Select>::new(self.shared).into()
        }
    }
}

impl PhaseState<Evaluate> {
    /// Creates a new evaluate state.
    pub fn new(shared: Shared, summary: RoundSummary) -> Self {
        Self {
            private: Evaluate { summary },
            shared,
        }
    }
}
