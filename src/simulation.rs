//! A synthetic classification task.
//!
//! Samples are drawn around seeded class prototypes with standard normal noise. The model is a
//! linear classifier (weights `[classes, features]` and bias `[classes]`) fitted by least squares
//! on one-hot targets, trained locally with minibatch SGD including momentum, weight decay and the
//! FedProx proximal term. Everything is derived from seeds, so whole experiments are reproducible.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use rand::{seq::SliceRandom, Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rand_distr::StandardNormal;
use tokio::{sync::Mutex, task};
use tracing::debug;

use crate::{
    common::ClientId,
    model::{Model, Tensor},
    partition::{Dataset, Label, Partition},
    settings::{OptimizerSettings, SimulationSettings},
    trainer::{EvaluationError, Evaluator, LocalOutcome, LocalTrainer, Metrics, TrainingError},
};

/// The scale of the class prototypes relative to the sample noise.
const PROTOTYPE_SCALE: f64 = 1.5;

#[derive(Debug, Clone, PartialEq)]
/// Labeled feature vectors, stored row-major.
pub struct Samples {
    features: Vec<f32>,
    labels: Vec<Label>,
    num_features: usize,
    num_classes: usize,
}

#[allow(clippy::len_without_is_empty)]
impl Samples {
    fn draw(prototypes: &[Vec<f64>], count: usize, rng: &mut ChaCha20Rng) -> Self {
        let num_classes = prototypes.len();
        let num_features = prototypes.first().map_or(0, Vec::len);
        let norm = (num_features.max(1) as f64).sqrt();

        let mut features = Vec::with_capacity(count * num_features);
        let mut labels = Vec::with_capacity(count);
        for _ in 0..count {
            let label = rng.gen_range(0..num_classes);
            for &center in prototypes[label].iter() {
                let noise: f64 = rng.sample(StandardNormal);
                features.push(((center + noise) / norm) as f32);
            }
            labels.push(label as Label);
        }

        Self {
            features,
            labels,
            num_features,
            num_classes,
        }
    }

    /// Gets the number of samples.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    pub fn num_features(&self) -> usize {
        self.num_features
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn sample(&self, index: usize) -> (&[f32], usize) {
        let start = index * self.num_features;
        (
            &self.features[start..start + self.num_features],
            self.labels[index] as usize,
        )
    }
}

#[derive(Debug, Clone)]
/// A training set, to be partitioned among the clients, and a held-out test set.
pub struct SyntheticData {
    train: Arc<Samples>,
    test: Arc<Samples>,
}

impl SyntheticData {
    /// Generates the task. The test set has a quarter of the training set's size, but at least one
    /// sample per class.
    pub fn generate(settings: &SimulationSettings, seed: u64) -> Self {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        let prototypes: Vec<Vec<f64>> = (0..settings.num_classes)
            .map(|_| {
                (0..settings.num_features)
                    .map(|_| PROTOTYPE_SCALE * rng.sample::<f64, _>(StandardNormal))
                    .collect()
            })
            .collect();

        let train = Samples::draw(&prototypes, settings.num_samples, &mut rng);
        let test_size = (settings.num_samples / 4).max(settings.num_classes);
        let test = Samples::draw(&prototypes, test_size, &mut rng);
        Self {
            train: Arc::new(train),
            test: Arc::new(test),
        }
    }

    /// Gets the partitionable index set of the training samples.
    pub fn dataset(&self) -> Dataset {
        Dataset::from_labels(self.train.labels.clone())
    }

    pub fn train(&self) -> Arc<Samples> {
        self.train.clone()
    }

    pub fn test(&self) -> Arc<Samples> {
        self.test.clone()
    }
}

/// Creates the initial global model of the task, all parameters zero.
pub fn initial_model(settings: &SimulationSettings) -> Model {
    vec![
        Tensor::zeros(vec![settings.num_classes, settings.num_features]),
        Tensor::zeros(vec![settings.num_classes]),
    ]
    .into()
}

/// The parameters of the linear classifier, flattened as weights followed by bias.
struct Linear<'a> {
    samples: &'a Samples,
    params: Vec<f64>,
}

impl<'a> Linear<'a> {
    fn from_model(model: &Model, samples: &'a Samples) -> Option<Self> {
        let (classes, features) = (samples.num_classes, samples.num_features);
        if model.len() != 2
            || model[0].shape() != [classes, features]
            || model[1].shape() != [classes]
        {
            return None;
        }
        let params = model
            .iter()
            .flat_map(|tensor| tensor.values().iter().map(|v| f64::from(*v)))
            .collect();
        Some(Self { samples, params })
    }

    /// Writes the parameters into a copy of `layout`.
    fn to_model(&self, layout: &Model) -> Model {
        let mut model = layout.clone();
        let mut params = self.params.iter();
        for tensor in model.iter_mut() {
            for (value, param) in tensor.values_mut().iter_mut().zip(&mut params) {
                *value = *param as f32;
            }
        }
        model
    }

    fn scores(&self, x: &[f32]) -> Vec<f64> {
        let features = self.samples.num_features;
        let (weights, bias) = self.params.split_at(self.samples.num_classes * features);
        weights
            .chunks(features)
            .zip(bias)
            .map(|(row, b)| {
                row.iter()
                    .zip(x)
                    .map(|(w, x)| w * f64::from(*x))
                    .sum::<f64>()
                    + b
            })
            .collect()
    }

    /// Computes the mean squared error gradient over the `batch`.
    fn gradient(&self, batch: &[usize]) -> Vec<f64> {
        let features = self.samples.num_features;
        let offset = self.samples.num_classes * features;
        let scale = 1.0 / batch.len() as f64;

        let mut grad = vec![0.0; self.params.len()];
        for &index in batch {
            let (x, label) = self.samples.sample(index);
            for (class, score) in self.scores(x).into_iter().enumerate() {
                let residual = scale * (score - if class == label { 1.0 } else { 0.0 });
                let row = &mut grad[class * features..(class + 1) * features];
                for (g, x) in row.iter_mut().zip(x) {
                    *g += residual * f64::from(*x);
                }
                grad[offset + class] += residual;
            }
        }
        grad
    }

    fn metrics(&self, indices: impl ExactSizeIterator<Item = usize>) -> Metrics {
        let count = indices.len().max(1) as f64;
        let (mut loss, mut correct) = (0.0, 0usize);
        for index in indices {
            let (x, label) = self.samples.sample(index);
            let scores = self.scores(x);
            loss += scores
                .iter()
                .enumerate()
                .map(|(class, s)| {
                    let r = s - if class == label { 1.0 } else { 0.0 };
                    0.5 * r * r
                })
                .sum::<f64>();
            let predicted = scores
                .iter()
                .enumerate()
                .fold((0, f64::NEG_INFINITY), |best, (class, &s)| {
                    if s > best.1 {
                        (class, s)
                    } else {
                        best
                    }
                })
                .0;
            if predicted == label {
                correct += 1;
            }
        }
        Metrics {
            loss: loss / count,
            accuracy: correct as f64 / count,
        }
    }
}

/// Runs minibatch SGD over the `indices` for `epochs` epochs. Incomplete last batches are kept.
fn train(
    samples: &Samples,
    model: &Model,
    indices: &[usize],
    epochs: u32,
    batch_size: usize,
    optimizer: OptimizerSettings,
    rng: &mut ChaCha20Rng,
) -> Result<LocalOutcome, TrainingError> {
    let mut linear = Linear::from_model(model, samples).ok_or(TrainingError::IncompatibleModel)?;
    let initial = linear.params.clone();
    let mut buf = vec![0.0; initial.len()];
    let mut order = indices.to_vec();
    let mut local_steps = 0;

    for _ in 0..epochs {
        order.shuffle(rng);
        for batch in order.chunks(batch_size.max(1)) {
            let grad = linear.gradient(batch);
            let params = linear.params.iter_mut().zip(&initial);
            for ((param, w0), (g, b)) in params.zip(grad.into_iter().zip(&mut buf)) {
                // weight decay and the proximal term pulling towards the global model
                let d = g + optimizer.weight_decay * *param + optimizer.mu * (*param - w0);
                *b = optimizer.momentum * *b + d;
                *param -= optimizer.lr * *b;
            }
            local_steps += 1;
        }
    }

    if linear.params.iter().any(|p| !p.is_finite()) {
        return Err(TrainingError::Diverged);
    }
    let Metrics { loss, accuracy } = linear.metrics(indices.iter().copied());
    let trained = linear.to_model(model);
    Ok(LocalOutcome {
        delta: model.difference(&trained)?,
        local_steps,
        num_examples: indices.len(),
        loss,
        accuracy,
    })
}

/// Trains clients on their partitions of the synthetic training set.
///
/// Every call draws its minibatch order from a generator seeded by the experiment seed, the
/// client and the number of previous calls for that client.
pub struct SyntheticTrainer {
    samples: Arc<Samples>,
    batch_size: usize,
    seed: u64,
    calls: Mutex<HashMap<ClientId, u64>>,
}

impl SyntheticTrainer {
    pub fn new(samples: Arc<Samples>, batch_size: usize, seed: u64) -> Self {
        Self {
            samples,
            batch_size,
            seed,
            calls: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl LocalTrainer for SyntheticTrainer {
    async fn train_locally(
        &self,
        model: Arc<Model>,
        partition: Arc<Partition>,
        local_epochs: u32,
        optimizer: OptimizerSettings,
    ) -> Result<LocalOutcome, TrainingError> {
        let client_id = partition.client_id();
        if partition.indices().is_empty() {
            return Err(TrainingError::EmptyPartition(client_id));
        }

        let call = {
            let mut calls = self.calls.lock().await;
            let count = calls.entry(client_id).or_insert(0);
            *count += 1;
            *count
        };
        let mut rng = ChaCha20Rng::seed_from_u64(self.seed.wrapping_add(call));
        rng.set_stream(client_id.index() as u64);

        let samples = self.samples.clone();
        let batch_size = self.batch_size;
        let outcome = task::spawn_blocking(move || {
            train(
                &samples,
                &model,
                partition.indices(),
                local_epochs,
                batch_size,
                optimizer,
                &mut rng,
            )
        })
        .await
        .map_err(|err| TrainingError::Failed(err.to_string()))??;

        debug!(
            "{} trained {} steps on {} examples: loss {:.4}, accuracy {:.3}",
            client_id, outcome.local_steps, outcome.num_examples, outcome.loss, outcome.accuracy
        );
        Ok(outcome)
    }
}

/// Evaluates global models on the synthetic test set.
pub struct SyntheticEvaluator {
    samples: Arc<Samples>,
}

impl SyntheticEvaluator {
    pub fn new(samples: Arc<Samples>) -> Self {
        Self { samples }
    }
}

#[async_trait]
impl Evaluator for SyntheticEvaluator {
    async fn evaluate(&self, model: Arc<Model>) -> Result<Metrics, EvaluationError> {
        let linear =
            Linear::from_model(&model, &self.samples).ok_or(EvaluationError::IncompatibleModel)?;
        Ok(linear.metrics(0..self.samples.len()))
    }
}
