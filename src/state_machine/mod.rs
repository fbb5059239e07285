//! The state machine that drives the federated rounds of an experiment.
//!
//! # Overview
//!
//! Every round runs the phases `Select`, `Train`, `Aggregate` and `Evaluate` in order. After the
//! last round the [`StateMachine`] moves to `Shutdown`. A phase which fails moves the
//! [`StateMachine`] to `Failure` and from there to `Shutdown`, which ends the experiment with a
//! [`RoundFailed`] error. The global model published before the failure stays valid.
//!
//! # Phase states
//!
//! **Select**
//!
//! Publishes [`PhaseName::Select`], increments the `round id` by `1`, selects the participating
//! clients, draws their local epochs and publishes the [`RoundParameters`].
//!
//! **Train**
//!
//! Publishes [`PhaseName::Train`] and trains every selected client concurrently on its partition,
//! starting from the same snapshot of the global model. The phase waits for all clients.
//!
//! **Aggregate**
//!
//! Publishes [`PhaseName::Aggregate`], combines the client updates with [`FedNova`] and publishes
//! the new global model.
//!
//! **Evaluate**
//!
//! Publishes [`PhaseName::Evaluate`], evaluates the new global model if an evaluator is
//! configured and records the [`RoundSummary`].
//!
//! **Failure**
//!
//! Publishes [`PhaseName::Failure`] and logs the [`PhaseError`].
//!
//! **Shutdown**
//!
//! Publishes [`PhaseName::Shutdown`] and hands out the [`History`] of the experiment.
//!
//! # Events
//!
//! The [`EventSubscriber`] hands out [`EventListener`]s for the phase, the round parameters and
//! the global model. Each listener only yields the latest event.
//!
//! [`RoundParameters`]: crate::state_machine::coordinator::RoundParameters
//! [`FedNova`]: crate::aggregator::FedNova
//! [`RoundSummary`]: crate::state_machine::history::RoundSummary
//! [`History`]: crate::state_machine::history::History
//! [`EventSubscriber`]: crate::state_machine::events::EventSubscriber
//! [`EventListener`]: crate::state_machine::events::EventListener

pub mod coordinator;
pub mod events;
pub mod history;
pub mod initializer;
pub mod phases;
pub mod selector;

#[cfg(test)]
mod tests;

use derive_more::From;
use thiserror::Error;

use self::{
    history::History,
    phases::{
        Aggregate,
        Evaluate,
        Failure,
        Phase,
        PhaseError,
        PhaseName,
        PhaseState,
        Select,
        Shutdown,
        Train,
    },
};
use crate::common::RoundId;

/// The error with which an experiment ends when one of its rounds fails.
#[derive(Debug, Error)]
#[error("round {round_id} failed: {error}")]
pub struct RoundFailed {
    /// The failed round.
    pub round_id: RoundId,
    /// The cause of the failure.
    pub error: PhaseError,
}

/// The state machine with all its states.
#[derive(From)]
pub enum StateMachine {
    Select(PhaseState<Select>),
    Train(PhaseState<Train>),
    Aggregate(PhaseState<Aggregate>),
    Evaluate(PhaseState<Evaluate>),
    Failure(PhaseState<Failure>),
    Shutdown(PhaseState<Shutdown>),
}

impl StateMachine {
    /// Moves the [`StateMachine`] to the next state and consumes the current one.
    ///
    /// The state [`Shutdown`] is final and returned as is.
    pub async fn next(self) -> Self {
        match self {
            StateMachine::Select(state) => state.run_phase().await,
            StateMachine::Train(state) => state.run_phase().await,
            StateMachine::Aggregate(state) => state.run_phase().await,
            StateMachine::Evaluate(state) => state.run_phase().await,
            StateMachine::Failure(state) => state.run_phase().await,
            StateMachine::Shutdown(state) => StateMachine::Shutdown(state),
        }
    }

    /// Returns the name of the current phase.
    pub fn phase(&self) -> PhaseName {
        match self {
            StateMachine::Select(_) => PhaseState::<Select>::NAME,
            StateMachine::Train(_) => PhaseState::<Train>::NAME,
            StateMachine::Aggregate(_) => PhaseState::<Aggregate>::NAME,
            StateMachine::Evaluate(_) => PhaseState::<Evaluate>::NAME,
            StateMachine::Failure(_) => PhaseState::<Failure>::NAME,
            StateMachine::Shutdown(_) => PhaseName::Shutdown,
        }
    }

    /// Runs the state machine until it shuts down.
    ///
    /// # Errors
    /// Fails with the first round which failed.
    pub async fn run(mut self) -> Result<History, RoundFailed> {
        loop {
            self = match self {
                StateMachine::Shutdown(state) => return state.shutdown().await,
                state => state.next().await,
            };
        }
    }
}
