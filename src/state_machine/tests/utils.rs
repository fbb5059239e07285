//! State machine test utilities.

use std::sync::Arc;

use tracing_subscriber::*;

use crate::{
    common::ClientId,
    model::{Model, Tensor},
    partition::{partition, uniform_sizes, Dataset, PartitionSettings, Partitions},
    settings::{ExperimentSettings, OptimizerSettings, SimulationSettings, TrainingSettings},
    simulation::{initial_model, SyntheticData, SyntheticEvaluator, SyntheticTrainer},
    state_machine::{
        events::EventSubscriber,
        initializer::StateMachineInitializer,
        StateMachine,
    },
    trainer::{LocalOutcome, LocalTrainer, MockLocalTrainer, TrainingError},
};

pub fn enable_logging() {
    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(true)
        .try_init();
}

pub fn experiment() -> ExperimentSettings {
    ExperimentSettings::default()
}

pub fn training() -> TrainingSettings {
    TrainingSettings::default()
}

pub fn optimizer() -> OptimizerSettings {
    OptimizerSettings {
        momentum: 0.5,
        ..OptimizerSettings::default()
    }
}

/// A synthetic task with one non-IID partition per client.
pub fn synthetic_task(experiment: &ExperimentSettings) -> (SyntheticData, Partitions, Model) {
    let simulation = SimulationSettings::default();
    let data = SyntheticData::generate(&simulation, experiment.seed);
    let settings = PartitionSettings {
        non_iid: true,
        alpha: 0.5,
        seed: experiment.seed,
        ..PartitionSettings::default()
    };
    let partitions = partition(
        &data.dataset(),
        &uniform_sizes(experiment.num_clients),
        &settings,
    )
    .unwrap();
    (data, partitions, initial_model(&simulation))
}

/// Initializes a state machine which trains and evaluates on the synthetic task.
pub fn synthetic_state_machine(experiment: ExperimentSettings) -> (StateMachine, EventSubscriber) {
    let (data, partitions, model) = synthetic_task(&experiment);
    let trainer = SyntheticTrainer::new(data.train(), training().batch_size, experiment.seed);
    StateMachineInitializer::new(
        experiment,
        training(),
        optimizer(),
        partitions,
        model,
        Arc::new(trainer),
    )
    .with_evaluator(Arc::new(SyntheticEvaluator::new(data.test())))
    .init()
    .unwrap()
}

/// Equal IID partitions of 40 samples over 4 classes.
pub fn iid_partitions(clients: usize) -> Partitions {
    let dataset = Dataset::from_labels((0..40).map(|i| i % 4).collect());
    partition(&dataset, &uniform_sizes(clients), &PartitionSettings::default()).unwrap()
}

/// A one-parameter model.
pub fn scalar_model(value: f32) -> Model {
    vec![Tensor::new(vec![1], vec![value]).unwrap()].into()
}

/// A trainer whose clients all report the same delta after `local_steps` steps, except for the
/// `failing` clients.
pub fn mock_trainer(delta: f32, local_steps: u64, failing: Vec<ClientId>) -> MockLocalTrainer {
    let mut trainer = MockLocalTrainer::new();
    trainer
        .expect_train_locally()
        .returning(move |_, partition, _, _| {
            let client_id = partition.client_id();
            if failing.contains(&client_id) {
                return Err(TrainingError::EmptyPartition(client_id));
            }
            Ok(LocalOutcome {
                delta: scalar_model(delta),
                local_steps,
                num_examples: partition.len(),
                loss: 1.0,
                accuracy: 0.5,
            })
        });
    trainer
}

/// A trainer which takes one step per local epoch and reports a delta of `per_epoch` per epoch.
pub fn epoch_trainer(per_epoch: f32) -> MockLocalTrainer {
    let mut trainer = MockLocalTrainer::new();
    trainer
        .expect_train_locally()
        .returning(move |_, partition, local_epochs, _| {
            Ok(LocalOutcome {
                delta: scalar_model(per_epoch * local_epochs as f32),
                local_steps: u64::from(local_epochs),
                num_examples: partition.len(),
                loss: 1.0,
                accuracy: 0.5,
            })
        });
    trainer
}

/// Initializes a state machine over [`iid_partitions`] and a [`scalar_model`] of `1.0`.
pub fn mock_state_machine<T>(
    experiment: ExperimentSettings,
    optimizer: OptimizerSettings,
    trainer: T,
) -> (StateMachine, EventSubscriber)
where
    T: LocalTrainer,
{
    mock_state_machine_with_training(experiment, training(), optimizer, trainer)
}

/// Like [`mock_state_machine`], with custom training settings.
pub fn mock_state_machine_with_training<T>(
    experiment: ExperimentSettings,
    training: TrainingSettings,
    optimizer: OptimizerSettings,
    trainer: T,
) -> (StateMachine, EventSubscriber)
where
    T: LocalTrainer,
{
    StateMachineInitializer::new(
        experiment,
        training,
        optimizer,
        iid_partitions(experiment.num_clients),
        scalar_model(1.0),
        Arc::new(trainer),
    )
    .init()
    .unwrap()
}

/// Gets the single parameter of a [`scalar_model`].
pub fn scalar(model: &Model) -> f32 {
    model.iter().next().unwrap().values()[0]
}
