use tracing::{error_span, info};
use tracing_futures::Instrument;

use crate::state_machine::{
    history::History,
    phases::{PhaseName, PhaseState, Shared},
    RoundFailed,
};

/// The shutdown state.
#[derive(Debug)]
pub struct Shutdown {
    /// The failure which ended the experiment early, if any.
    failure: Option<RoundFailed>,
}

impl PhaseState<Shutdown> {
    /// Creates a new shutdown state.
    pub fn new(shared: Shared, failure: Option<RoundFailed>) -> Self {
        Self {
            private: Shutdown { failure },
            shared,
        }
    }

    /// Shuts the state machine down and hands out the history of the completed rounds.
    ///
    /// # Errors
    /// Fails with the round failure which ended the experiment early.
    pub async fn shutdown(mut self) -> Result<History, RoundFailed> {
        let round_id = self.shared.round_id();
        let span = error_span!("run_phase", phase = %PhaseName::Shutdown, round_id);

        async move {
            self.shared.events.broadcast_phase(PhaseName::Shutdown);
            info!(
                "shutting down after {} completed round(s)",
                self.shared.history.len()
            );
            match self.private.failure {
                Some(failure) => Err(failure),
                None => Ok(self.shared.history),
            }
        }
        .instrument(span)
        .await
    }
}
