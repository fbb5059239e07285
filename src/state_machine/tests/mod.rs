pub mod utils;

use std::sync::Arc;

use self::utils::*;
use crate::{
    aggregator::AggregationError,
    common::{ClientId, ConfigurationError},
    settings::{ExperimentSettings, OptimizerSettings, TrainingSettings},
    state_machine::{
        initializer::StateMachineInitializer,
        phases::{Aggregate, PhaseError, PhaseName, PhaseState},
        selector::Selector,
        StateMachine,
    },
    trainer::{EvaluationError, LocalOutcome, MockEvaluator},
};

impl StateMachine {
    pub fn is_select(&self) -> bool {
        matches!(self, StateMachine::Select(_))
    }

    pub fn is_train(&self) -> bool {
        matches!(self, StateMachine::Train(_))
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self, StateMachine::Aggregate(_))
    }

    pub fn is_evaluate(&self) -> bool {
        matches!(self, StateMachine::Evaluate(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, StateMachine::Failure(_))
    }

    pub fn is_shutdown(&self) -> bool {
        matches!(self, StateMachine::Shutdown(_))
    }
}

#[tokio::test]
async fn test_synthetic_experiment() {
    enable_logging();
    let experiment = experiment();
    let (state_machine, events) = synthetic_state_machine(experiment);
    let models = events.model_listener();

    let history = state_machine.run().await.unwrap();

    assert_eq!(history.len() as u64, experiment.num_rounds);
    for (round, summary) in history.rounds().iter().enumerate() {
        assert_eq!(summary.round_id, round as u64 + 1);
        assert_eq!(summary.selected, experiment.num_clients);
        assert_eq!(summary.failures, 0);
        assert_eq!(summary.aggregation.accepted, experiment.num_clients);
        assert!(summary.aggregation.tau_eff > 0.0);
        assert!(summary.train.is_some());
    }

    // the zero model has a squared error of 0.5 on every sample
    let test = history.last().unwrap().test.unwrap();
    assert!(test.loss < 0.5);
    assert!(test.accuracy > 0.25);

    assert_eq!(models.get_latest().round_id, experiment.num_rounds);
    assert_eq!(
        events.phase_listener().get_latest().event,
        PhaseName::Shutdown
    );
}

#[tokio::test]
async fn test_synthetic_experiment_is_reproducible() {
    let experiment = ExperimentSettings {
        num_rounds: 2,
        ..experiment()
    };
    let (first, _events) = synthetic_state_machine(experiment);
    let (second, _events) = synthetic_state_machine(experiment);
    assert_eq!(first.run().await.unwrap(), second.run().await.unwrap());
}

#[tokio::test]
async fn test_phase_order() {
    let experiment = ExperimentSettings {
        num_rounds: 2,
        ..experiment()
    };
    let (mut state_machine, events) = mock_state_machine(
        experiment,
        OptimizerSettings::default(),
        mock_trainer(0.1, 2, vec![]),
    );
    let phases = events.phase_listener();

    for round_id in 1..=2 {
        assert!(state_machine.is_select());
        state_machine = state_machine.next().await;
        assert_eq!(phases.get_latest().event, PhaseName::Select);
        assert_eq!(phases.get_latest().round_id, round_id);
        assert!(state_machine.is_train());
        state_machine = state_machine.next().await;
        assert!(state_machine.is_aggregate());
        state_machine = state_machine.next().await;
        assert!(state_machine.is_evaluate());
        state_machine = state_machine.next().await;
        assert_eq!(phases.get_latest().event, PhaseName::Evaluate);
    }
    assert!(state_machine.is_shutdown());
    assert_eq!(state_machine.phase(), PhaseName::Shutdown);

    // shutdown is final
    state_machine = state_machine.next().await;
    assert!(state_machine.is_shutdown());
    let history = state_machine.run().await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(phases.get_latest().event, PhaseName::Shutdown);
}

#[tokio::test]
async fn test_uniform_clients_move_the_model_by_their_delta() {
    // a_i = tau = 2 for every client, so every round moves the model by exactly delta
    let (state_machine, events) = mock_state_machine(
        experiment(),
        OptimizerSettings::default(),
        mock_trainer(0.1, 2, vec![]),
    );
    let models = events.model_listener();

    let history = state_machine.run().await.unwrap();

    assert_eq!(history.len(), 3);
    for summary in history.rounds() {
        assert!((summary.aggregation.tau_eff - 2.0).abs() < 1e-9);
        assert!(summary.test.is_none());
        let train = summary.train.unwrap();
        assert!((train.loss - 1.0).abs() < 1e-9);
    }
    let latest = models.get_latest();
    assert_eq!(latest.round_id, 3);
    assert!((scalar(&latest.event) - 0.7).abs() < 1e-5);
}

#[tokio::test]
async fn test_variable_epochs_with_server_momentum() {
    // one step per epoch and a delta of 0.1 per epoch give delta_i / a_i = 0.1 for every client
    let experiment = ExperimentSettings {
        num_rounds: 2,
        ..experiment()
    };
    let training = TrainingSettings {
        var_local_epochs: true,
        ..training()
    };
    let optimizer = OptimizerSettings {
        gmf: 0.5,
        ..OptimizerSettings::default()
    };
    let (mut state_machine, events) =
        mock_state_machine_with_training(experiment, training, optimizer, epoch_trainer(0.1));
    let params = events.params_listener();

    let mut mean_epochs = Vec::new();
    for _ in 0..2 {
        state_machine = state_machine.next().await;
        let tasks = params.get_latest().event.tasks;
        assert_eq!(tasks.len(), 4);
        assert!(tasks.iter().all(|task| (2..=5).contains(&task.local_epochs)));
        let epochs: u32 = tasks.iter().map(|task| task.local_epochs).sum();
        mean_epochs.push(f64::from(epochs) / tasks.len() as f64);
        for _ in 0..3 {
            state_machine = state_machine.next().await;
        }
    }
    let models = events.model_listener();
    let history = state_machine.run().await.unwrap();

    // equal partitions make tau_eff the mean number of local epochs
    for (summary, mean) in history.rounds().iter().zip(&mean_epochs) {
        assert!((summary.aggregation.tau_eff - mean).abs() < 1e-9);
    }
    // v_1 = 0.1, v_2 = 0.5 * 0.1 + 0.1
    let expected = 1.0 - mean_epochs[0] * 0.1 - mean_epochs[1] * 0.15;
    let latest = models.get_latest();
    assert_eq!(latest.round_id, 2);
    assert!((f64::from(scalar(&latest.event)) - expected).abs() < 1e-5);
}

#[tokio::test]
async fn test_outcome_of_unknown_client_fails_the_round() {
    let (state_machine, events) = mock_state_machine(
        experiment(),
        OptimizerSettings::default(),
        mock_trainer(0.1, 2, vec![]),
    );
    let models = events.model_listener();

    let shared = match state_machine.next().await {
        StateMachine::Train(state) => state.shared,
        state => panic!("unexpected phase {}", state.phase()),
    };
    let outcome = LocalOutcome {
        delta: scalar_model(0.1),
        local_steps: 2,
        num_examples: 10,
        loss: 1.0,
        accuracy: 0.5,
    };
    let state_machine = StateMachine::from(PhaseState::<Aggregate>::new(
        shared,
        vec![(ClientId::new(99), outcome)],
        0,
    ));

    let failure = state_machine.run().await.unwrap_err();
    assert_eq!(failure.round_id, 1);
    assert!(matches!(
        failure.error,
        PhaseError::UnknownClient(client_id) if client_id == ClientId::new(99)
    ));
    assert_eq!(models.get_latest().round_id, 0);
}

#[tokio::test]
async fn test_round_parameters() {
    let experiment = ExperimentSettings {
        num_clients: 10,
        num_rounds: 1,
        clients_per_round: 0.3,
        ..experiment()
    };
    let (mut state_machine, events) = mock_state_machine(
        experiment,
        OptimizerSettings::default(),
        mock_trainer(0.1, 2, vec![]),
    );
    let params = events.params_listener();

    state_machine = state_machine.next().await;
    assert!(state_machine.is_train());
    let latest = params.get_latest();
    assert_eq!(latest.round_id, 1);
    assert_eq!(latest.event.tasks.len(), 3);
    assert!(latest
        .event
        .tasks
        .iter()
        .all(|task| task.local_epochs == training().local_epochs));
    assert!(latest
        .event
        .tasks
        .windows(2)
        .all(|pair| pair[0].client_id < pair[1].client_id));

    let history = state_machine.run().await.unwrap();
    assert_eq!(history.rounds()[0].selected, 3);
    assert_eq!(history.rounds()[0].aggregation.accepted, 3);
}

#[tokio::test]
async fn test_failed_client_fails_the_round() {
    let (state_machine, events) = mock_state_machine(
        experiment(),
        OptimizerSettings::default(),
        mock_trainer(0.1, 2, vec![ClientId::new(1)]),
    );
    let models = events.model_listener();

    let failure = state_machine.run().await.unwrap_err();

    assert_eq!(failure.round_id, 1);
    assert!(matches!(
        failure.error,
        PhaseError::Training { client_id, .. } if client_id == ClientId::new(1)
    ));
    // the initial model is still the latest one
    let latest = models.get_latest();
    assert_eq!(latest.round_id, 0);
    assert!((scalar(&latest.event) - 1.0).abs() < f32::EPSILON);
    assert_eq!(
        events.phase_listener().get_latest().event,
        PhaseName::Shutdown
    );
}

#[tokio::test]
async fn test_failure_state() {
    let (mut state_machine, events) = mock_state_machine(
        experiment(),
        OptimizerSettings::default(),
        mock_trainer(0.1, 2, vec![ClientId::new(0)]),
    );

    state_machine = state_machine.next().await;
    state_machine = state_machine.next().await;
    assert!(state_machine.is_failure());
    assert_eq!(events.phase_listener().get_latest().event, PhaseName::Train);

    state_machine = state_machine.next().await;
    assert!(state_machine.is_shutdown());
    assert_eq!(
        events.phase_listener().get_latest().event,
        PhaseName::Failure
    );
}

#[tokio::test]
async fn test_accepted_failures_are_excluded() {
    let experiment = ExperimentSettings {
        accept_failures: true,
        ..experiment()
    };
    let (state_machine, events) = mock_state_machine(
        experiment,
        OptimizerSettings::default(),
        mock_trainer(0.1, 2, vec![ClientId::new(1)]),
    );
    let models = events.model_listener();

    let history = state_machine.run().await.unwrap();

    for summary in history.rounds() {
        assert_eq!(summary.selected, 4);
        assert_eq!(summary.failures, 1);
        assert_eq!(summary.aggregation.accepted, 3);
    }
    assert!((scalar(&models.get_latest().event) - 0.7).abs() < 1e-5);
}

#[tokio::test]
async fn test_no_valid_updates_fails_the_round() {
    let (state_machine, events) = mock_state_machine(
        experiment(),
        OptimizerSettings::default(),
        mock_trainer(0.1, 0, vec![]),
    );
    let models = events.model_listener();

    let failure = state_machine.run().await.unwrap_err();

    assert_eq!(failure.round_id, 1);
    assert!(matches!(
        failure.error,
        PhaseError::Aggregation(AggregationError::NoValidUpdates { excluded: 4 })
    ));
    assert_eq!(models.get_latest().round_id, 0);
}

#[tokio::test]
async fn test_all_clients_failing() {
    let experiment = ExperimentSettings {
        accept_failures: true,
        ..experiment()
    };
    let failing = (0..experiment.num_clients).map(ClientId::new).collect();
    let (state_machine, _events) = mock_state_machine(
        experiment,
        OptimizerSettings::default(),
        mock_trainer(0.1, 2, failing),
    );

    let failure = state_machine.run().await.unwrap_err();
    assert!(matches!(
        failure.error,
        PhaseError::Aggregation(AggregationError::NoValidUpdates { excluded: 0 })
    ));
}

#[tokio::test]
async fn test_failed_evaluation_fails_the_round() {
    let mut evaluator = MockEvaluator::new();
    evaluator
        .expect_evaluate()
        .returning(|_| Err(EvaluationError::Failed("unavailable".into())));
    let experiment = experiment();
    let (state_machine, events) = StateMachineInitializer::new(
        experiment,
        training(),
        OptimizerSettings::default(),
        iid_partitions(experiment.num_clients),
        scalar_model(1.0),
        Arc::new(mock_trainer(0.1, 2, vec![])),
    )
    .with_evaluator(Arc::new(evaluator))
    .init()
    .unwrap();
    let models = events.model_listener();

    let failure = state_machine.run().await.unwrap_err();

    assert_eq!(failure.round_id, 1);
    assert!(matches!(failure.error, PhaseError::Evaluation(_)));
    // the aggregated model was already published
    assert_eq!(models.get_latest().round_id, 1);
}

struct FirstClients;

impl Selector for FirstClients {
    fn select(&mut self, _: u64, candidates: &[ClientId], count: usize) -> Vec<ClientId> {
        candidates[..count].to_vec()
    }
}

#[tokio::test]
async fn test_custom_selector() {
    let experiment = ExperimentSettings {
        num_clients: 4,
        num_rounds: 1,
        clients_per_round: 0.5,
        ..experiment()
    };
    let (state_machine, events) = StateMachineInitializer::new(
        experiment,
        training(),
        OptimizerSettings::default(),
        iid_partitions(experiment.num_clients),
        scalar_model(1.0),
        Arc::new(mock_trainer(0.1, 2, vec![])),
    )
    .with_selector(Box::new(FirstClients))
    .init()
    .unwrap();
    let params = events.params_listener();

    state_machine.run().await.unwrap();

    let selected: Vec<ClientId> = params
        .get_latest()
        .event
        .tasks
        .iter()
        .map(|task| task.client_id)
        .collect();
    assert_eq!(selected, vec![ClientId::new(0), ClientId::new(1)]);
}

#[test]
fn test_initializer_rejects_partition_mismatch() {
    let experiment = experiment();
    let result = StateMachineInitializer::new(
        experiment,
        training(),
        optimizer(),
        iid_partitions(experiment.num_clients + 1),
        scalar_model(1.0),
        Arc::new(mock_trainer(0.1, 2, vec![])),
    )
    .init();
    assert!(matches!(
        result,
        Err(ConfigurationError::ClientCountMismatch {
            expected: 4,
            actual: 5
        })
    ));
}

#[test]
fn test_initializer_rejects_invalid_optimizer() {
    let experiment = experiment();
    let result = StateMachineInitializer::new(
        experiment,
        training(),
        OptimizerSettings {
            lr: 0.0,
            ..optimizer()
        },
        iid_partitions(experiment.num_clients),
        scalar_model(1.0),
        Arc::new(mock_trainer(0.1, 2, vec![])),
    )
    .init();
    assert!(matches!(
        result,
        Err(ConfigurationError::InvalidAggregationParameter { name: "lr", .. })
    ));
}
