//! The local training and evaluation seams.
//!
//! The round driver is agnostic of the learning task: it hands a snapshot of the global model and
//! a client's partition to a [`LocalTrainer`] and the new global model to an [`Evaluator`]. The
//! [`simulation`] module provides implementations over a synthetic task.
//!
//! [`simulation`]: crate::simulation

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    common::ClientId,
    model::{LayoutMismatch, Model},
    partition::Partition,
    settings::OptimizerSettings,
};

#[derive(Debug, Error)]
/// Errors related to the local training of a client.
pub enum TrainingError {
    #[error("the partition of {0} is empty")]
    EmptyPartition(ClientId),

    #[error("the global model doesn't fit the local task")]
    IncompatibleModel,

    #[error("the local model diverged")]
    Diverged,

    #[error(transparent)]
    Layout(#[from] LayoutMismatch),

    #[error("local training failed: {0}")]
    Failed(String),
}

#[derive(Debug, Error)]
/// Errors related to the evaluation of a global model.
pub enum EvaluationError {
    #[error("the global model doesn't fit the evaluation task")]
    IncompatibleModel,

    #[error("evaluation failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
/// The outcome of one client's local training.
pub struct LocalOutcome {
    /// The parameter change, old minus new.
    pub delta: Model,
    /// The number of optimizer steps taken.
    pub local_steps: u64,
    /// The number of local training examples.
    pub num_examples: usize,
    /// The training loss of the locally trained model.
    pub loss: f64,
    /// The training accuracy of the locally trained model.
    pub accuracy: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
/// A loss and an accuracy.
pub struct Metrics {
    pub loss: f64,
    pub accuracy: f64,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
/// Local training of a client on its partition.
pub trait LocalTrainer: Send + Sync + 'static {
    /// Trains a copy of the global `model` on the `partition` for `local_epochs` epochs with the
    /// given local optimizer.
    async fn train_locally(
        &self,
        model: Arc<Model>,
        partition: Arc<Partition>,
        local_epochs: u32,
        optimizer: OptimizerSettings,
    ) -> Result<LocalOutcome, TrainingError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
/// Centralized evaluation of a global model.
pub trait Evaluator: Send + Sync + 'static {
    async fn evaluate(&self, model: Arc<Model>) -> Result<Metrics, EvaluationError>;
}
