use std::{fmt, sync::Arc};

use async_trait::async_trait;
use derive_more::Display;
use tracing::{error_span, info, warn};
use tracing_futures::Instrument;

use crate::{
    aggregator::{FedNova, GlobalState},
    common::RoundId,
    model::Model,
    partition::Partitions,
    state_machine::{
        coordinator::CoordinatorState,
        events::EventPublisher,
        history::History,
        phases::{Failure, PhaseError},
        selector::Selector,
        StateMachine,
    },
    trainer::{Evaluator, LocalTrainer},
};

/// The name of the current phase.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum PhaseName {
    #[display(fmt = "Select")]
    Select,
    #[display(fmt = "Train")]
    Train,
    #[display(fmt = "Aggregate")]
    Aggregate,
    #[display(fmt = "Evaluate")]
    Evaluate,
    #[display(fmt = "Failure")]
    Failure,
    #[display(fmt = "Shutdown")]
    Shutdown,
}

/// A trait that must be implemented by a state in order to move to a next state.
///
/// See the [module level documentation] for more details.
///
/// [module level documentation]: crate::state_machine
#[async_trait]
pub trait Phase {
    /// The name of the current phase.
    const NAME: PhaseName;

    /// Performs the tasks of this phase.
    async fn process(&mut self) -> Result<(), PhaseError>;

    /// Broadcasts data of this phase (nothing by default).
    fn broadcast(&mut self) {}

    /// Moves from this phase to the next phase.
    fn next(self) -> StateMachine;
}

/// A struct that contains the coordinator state and the collaborators that are shared and
/// accessible by all `PhaseState`s.
pub struct Shared {
    /// The coordinator state.
    pub(in crate::state_machine) state: CoordinatorState,
    /// The event publisher.
    pub(in crate::state_machine) events: EventPublisher,
    /// The client partitions, indexed by client id.
    pub(in crate::state_machine) partitions: Partitions,
    /// The client selection strategy.
    pub(in crate::state_machine) selector: Box<dyn Selector>,
    /// The local training substrate.
    pub(in crate::state_machine) trainer: Arc<dyn LocalTrainer>,
    /// The optional centralized evaluation.
    pub(in crate::state_machine) evaluator: Option<Arc<dyn Evaluator>>,
    /// The aggregation strategy.
    pub(in crate::state_machine) aggregator: FedNova,
    /// The global model and server momentum.
    pub(in crate::state_machine) global: GlobalState,
    /// The summaries of the completed rounds.
    pub(in crate::state_machine) history: History,
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("state", &self.state)
            .field("events", &self.events)
            .field("partitions", &self.partitions.len())
            .field("aggregator", &self.aggregator)
            .field("rounds", &self.global.rounds())
            .finish()
    }
}

impl Shared {
    /// Creates a new shared state.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        coordinator_state: CoordinatorState,
        publisher: EventPublisher,
        partitions: Partitions,
        selector: Box<dyn Selector>,
        trainer: Arc<dyn LocalTrainer>,
        evaluator: Option<Arc<dyn Evaluator>>,
        aggregator: FedNova,
        global: GlobalState,
    ) -> Self {
        Self {
            state: coordinator_state,
            events: publisher,
            partitions,
            selector,
            trainer,
            evaluator,
            aggregator,
            global,
            history: History::default(),
        }
    }

    /// Sets the round ID to the given value.
    pub fn set_round_id(&mut self, id: RoundId) {
        self.state.round_id = id;
        self.events.set_round_id(id);
    }

    /// Returns the current round ID.
    pub fn round_id(&self) -> RoundId {
        self.state.round_id
    }

    /// Returns a snapshot of the current global model.
    pub fn global_model(&self) -> Arc<Model> {
        Arc::new(self.global.model().clone())
    }
}

/// The state corresponding to a phase of a federated round.
///
/// This contains the state-dependent `private` state and the state-independent `shared` state
/// which is shared across state transitions.
pub struct PhaseState<S> {
    /// The private state.
    pub(in crate::state_machine) private: S,
    /// The shared coordinator state and collaborators.
    pub(in crate::state_machine) shared: Shared,
}

impl<S> PhaseState<S>
where
    S: Send,
    Self: Phase,
{
    /// Runs the current phase to completion.
    ///
    /// 1. Performs the phase tasks.
    /// 2. Broadcasts the phase data.
    /// 3. Transitions to the next phase.
    pub async fn run_phase(mut self) -> StateMachine {
        let phase = Self::NAME;
        let round_id = self.shared.round_id();
        let span = error_span!("run_phase", phase = %phase, round_id);

        async move {
            info!("starting phase");
            self.shared.events.broadcast_phase(phase);

            if let Err(err) = self.process().await {
                warn!("failed to perform the phase tasks");
                return self.into_failure_state(err);
            }
            info!("phase ran successfully");

            self.broadcast();

            info!("transitioning to the next phase");
            self.next()
        }
        .instrument(span)
        .await
    }
}

impl<S> PhaseState<S> {
    fn into_failure_state(self, err: PhaseError) -> StateMachine {
        PhaseState::<Failure>::new(self.shared, err).into()
    }
}
