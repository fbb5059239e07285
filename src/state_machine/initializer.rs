use std::sync::Arc;

use tracing::debug;

use crate::{
    aggregator::{FedNova, GlobalState},
    common::ConfigurationError,
    model::Model,
    partition::Partitions,
    settings::{ExperimentSettings, OptimizerSettings, TrainingSettings},
    state_machine::{
        coordinator::CoordinatorState,
        events::{EventPublisher, EventSubscriber},
        phases::{PhaseName, PhaseState, Select, Shared},
        selector::{RandomSelector, Selector},
        StateMachine,
    },
    trainer::{Evaluator, LocalTrainer},
};

type StateMachineInitializationResult<T> = Result<T, ConfigurationError>;

/// The state machine initializer that initializes a new state machine.
pub struct StateMachineInitializer {
    experiment: ExperimentSettings,
    training: TrainingSettings,
    optimizer: OptimizerSettings,

    partitions: Partitions,
    model: Model,
    trainer: Arc<dyn LocalTrainer>,
    evaluator: Option<Arc<dyn Evaluator>>,
    selector: Option<Box<dyn Selector>>,
}

impl StateMachineInitializer {
    /// Creates a new [`StateMachineInitializer`].
    ///
    /// Clients are selected with a [`RandomSelector`] seeded with the experiment seed, unless
    /// another selector is given.
    pub fn new(
        experiment: ExperimentSettings,
        training: TrainingSettings,
        optimizer: OptimizerSettings,
        partitions: Partitions,
        model: Model,
        trainer: Arc<dyn LocalTrainer>,
    ) -> Self {
        Self {
            experiment,
            training,
            optimizer,
            partitions,
            model,
            trainer,
            evaluator: None,
            selector: None,
        }
    }

    /// Evaluates the global model with `evaluator` after every round.
    pub fn with_evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    /// Selects the clients of every round with `selector`.
    pub fn with_selector(mut self, selector: Box<dyn Selector>) -> Self {
        self.selector = Some(selector);
        self
    }

    /// Initializes a new [`StateMachine`] which starts with the first round.
    ///
    /// # Errors
    /// Fails if the aggregation parameters are invalid or if the number of partitions doesn't
    /// match the number of clients.
    pub fn init(self) -> StateMachineInitializationResult<(StateMachine, EventSubscriber)> {
        let aggregator = FedNova::new(self.optimizer.into())?;
        if self.experiment.num_clients == 0 {
            return Err(ConfigurationError::NoClients);
        }
        if self.partitions.len() != self.experiment.num_clients {
            return Err(ConfigurationError::ClientCountMismatch {
                expected: self.experiment.num_clients,
                actual: self.partitions.len(),
            });
        }

        let coordinator_state = CoordinatorState::new(self.experiment, self.training, self.optimizer);
        debug!("initializing the state machine: {:?}", coordinator_state);
        let (event_publisher, event_subscriber) = EventPublisher::init(
            coordinator_state.round_id,
            coordinator_state.round_params.clone(),
            PhaseName::Select,
            Arc::new(self.model.clone()),
        );

        let selector: Box<dyn Selector> = match self.selector {
            Some(selector) => selector,
            None => Box::new(RandomSelector::new(self.experiment.seed)),
        };
        let shared = Shared::new(
            coordinator_state,
            event_publisher,
            self.partitions,
            selector,
            self.trainer,
            self.evaluator,
            aggregator,
            GlobalState::new(self.model),
        );

        let state_machine = StateMachine::from(PhaseState::<Select>::new(shared));
        Ok((state_machine, event_subscriber))
    }
}
