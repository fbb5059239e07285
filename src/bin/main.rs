use std::{path::PathBuf, process, sync::Arc};

use anyhow::Context;
use fednova::{
    partition::{partition, uniform_sizes},
    settings::Settings,
    simulation::{initial_model, SyntheticData, SyntheticEvaluator, SyntheticTrainer},
    state_machine::initializer::StateMachineInitializer,
};
use structopt::StructOpt;
use tracing::{debug, info};
use tracing_subscriber::*;

#[derive(Debug, StructOpt)]
#[structopt(name = "FedNova")]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, parse(from_os_str))]
    config_path: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::from_args();

    let settings = Settings::new(opt.config_path).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });
    let partition_settings = settings.partition_settings();
    let Settings {
        experiment,
        training,
        optimizer,
        simulation,
        log,
        ..
    } = settings;

    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(log.filter)
        .with_ansi(true)
        .init();

    let data = SyntheticData::generate(&simulation, experiment.seed);
    let dataset = data.dataset();
    let partitions = partition(
        &dataset,
        &uniform_sizes(experiment.num_clients),
        &partition_settings,
    )
    .context("failed to partition the training set")?;
    for client_id in partitions.client_ids() {
        debug!(
            "{}: class histogram {:?}",
            client_id,
            partitions.class_histogram(client_id, &dataset)
        );
    }
    let mean_entropy = partitions
        .client_ids()
        .into_iter()
        .map(|client_id| partitions.class_entropy(client_id, &dataset))
        .sum::<f64>()
        / partitions.len() as f64;
    info!(
        "partitioned {} samples among {} clients, mean class entropy {:.3}",
        dataset.len(),
        partitions.len(),
        mean_entropy
    );

    let trainer = SyntheticTrainer::new(data.train(), training.batch_size, experiment.seed);
    let evaluator = SyntheticEvaluator::new(data.test());
    let (state_machine, _event_subscriber) = StateMachineInitializer::new(
        experiment,
        training,
        optimizer,
        partitions,
        initial_model(&simulation),
        Arc::new(trainer),
    )
    .with_evaluator(Arc::new(evaluator))
    .init()
    .context("failed to initialize the state machine")?;

    let history = state_machine.run().await?;
    if let Some(test) = history.last().and_then(|summary| summary.test) {
        info!(
            "final global model: loss {:.4}, accuracy {:.4}",
            test.loss, test.accuracy
        );
    }
    println!("{}", serde_json::to_string_pretty(&history)?);
    Ok(())
}
