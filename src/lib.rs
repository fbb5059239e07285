//! # FedNova: normalized averaging for heterogeneous federated training
//!
//! In federated learning, clients often take very different numbers of local optimizer steps
//! within the same round, because their datasets differ in size or because they train for a
//! different number of epochs. Plainly averaging their updates then biases the global model
//! towards the objectives of the clients which trained the most.
//!
//! FedNova removes this inconsistency: every client update is normalized by the accumulated
//! step count of its local optimizer before averaging, and the average is rescaled by the
//! effective number of local steps of the round.
//!
//! This crate provides a complete experiment harness:
//! - the [`partition`] module splits a labelled dataset among the clients, either IID or with
//!   class-wise Dirichlet skew,
//! - the [`aggregator`] module implements the FedNova aggregation with optional server momentum,
//! - the [`state_machine`] module drives the federated rounds: client selection, concurrent local
//!   training, aggregation and evaluation,
//! - the [`trainer`] module defines the local training and evaluation seams, which the
//!   [`simulation`] module implements over a synthetic classification task.
//!
//! Experiments are configured via the [`settings`] module.

pub mod aggregator;
pub mod common;
pub mod model;
pub mod partition;
pub mod settings;
pub mod simulation;
pub mod state_machine;
pub mod trainer;
