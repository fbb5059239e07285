//! The FedNova aggregator.
//!
//! Clients perform heterogeneous numbers of local steps, so plainly averaging their updates
//! weights the objectives of the busier clients more. [`FedNova`] first normalizes every update by
//! the accumulated step size `a_i` of its local trajectory, averages the normalized updates by data
//! weight and rescales the average by the effective number of steps
//! `tau_eff = sum_i w_i * a_i`. An optional server momentum (`gmf`) accumulates the averaged
//! normalized updates across rounds.
//!
//! The aggregator is a pure function of the previous [`GlobalState`] and the round's
//! [`ClientUpdate`]s; [`FedNova::apply()`] commits the result only if the aggregation succeeded.

mod normalization;
mod update;

pub use self::{
    normalization::normalization_coeff,
    update::{ClientUpdate, InvalidUpdate},
};

use std::collections::HashSet;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    common::{ClientId, ConfigurationError},
    model::Model,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
/// Errors related to the aggregation of a round.
pub enum AggregationError {
    #[error("no valid client update to aggregate ({excluded} excluded)")]
    NoValidUpdates { excluded: usize },
}

#[derive(Debug, Clone, Copy, PartialEq)]
/// The hyper-parameters of the aggregator.
///
/// `lr`, `momentum` and `prox_mu` describe the local optimizer of the clients and determine the
/// normalization coefficients; `gmf` is the server momentum factor.
pub struct AggregationSettings {
    pub lr: f64,
    pub momentum: f64,
    pub prox_mu: f64,
    pub gmf: f64,
}

#[derive(Debug, Clone, PartialEq)]
/// The server momentum buffer, one `f64` vector per model tensor.
pub struct MomentumBuffer(Vec<Vec<f64>>);

impl MomentumBuffer {
    /// Creates a zero buffer for the layout of `model`.
    pub fn zeros_like(model: &Model) -> Self {
        Self(model.iter().map(|t| vec![0.0; t.len()]).collect())
    }

    pub fn values(&self) -> &[Vec<f64>] {
        &self.0
    }

    /// Checks whether the buffer holds only zeros.
    pub fn is_zero(&self) -> bool {
        self.0.iter().flatten().all(|v| *v == 0.0)
    }

    /// Updates the buffer in place as `v = gmf * v + update`.
    fn accumulate(&mut self, gmf: f64, update: &[Vec<f64>]) {
        for (buf, upd) in self.0.iter_mut().zip(update) {
            for (v, u) in buf.iter_mut().zip(upd) {
                *v = gmf * *v + u;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
/// The global model, the server momentum buffer and the number of aggregated rounds.
pub struct GlobalState {
    model: Model,
    momentum: MomentumBuffer,
    rounds: u64,
}

impl GlobalState {
    /// Creates the initial state for the `model` with a zero momentum buffer.
    pub fn new(model: Model) -> Self {
        Self {
            momentum: MomentumBuffer::zeros_like(&model),
            model,
            rounds: 0,
        }
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn momentum(&self) -> &MomentumBuffer {
        &self.momentum
    }

    /// Gets the number of rounds aggregated into this state.
    pub fn rounds(&self) -> u64 {
        self.rounds
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
/// A summary of one aggregation.
pub struct AggregationSummary {
    /// The number of updates which entered the average.
    pub accepted: usize,
    /// The number of invalid updates which were excluded.
    pub excluded: usize,
    /// The effective number of local steps `sum_i w_i * a_i`.
    pub tau_eff: f64,
}

#[derive(Debug, Clone)]
/// The FedNova normalized averaging strategy.
pub struct FedNova {
    settings: AggregationSettings,
}

impl FedNova {
    /// Creates an aggregator.
    ///
    /// # Errors
    /// Fails unless `lr > 0`, `0 <= momentum < 1`, `prox_mu >= 0` and `0 <= gmf < 1`.
    pub fn new(settings: AggregationSettings) -> Result<Self, ConfigurationError> {
        let AggregationSettings {
            lr,
            momentum,
            prox_mu,
            gmf,
        } = settings;
        let invalid = |name: &'static str, value: f64| -> Result<Self, ConfigurationError> {
            Err(ConfigurationError::InvalidAggregationParameter { name, value })
        };

        if !(lr.is_finite() && lr > 0.0) {
            return invalid("lr", lr);
        }
        if !(0.0..1.0).contains(&momentum) {
            return invalid("momentum", momentum);
        }
        if !(prox_mu.is_finite() && prox_mu >= 0.0) {
            return invalid("prox_mu", prox_mu);
        }
        if !(0.0..1.0).contains(&gmf) {
            return invalid("gmf", gmf);
        }
        Ok(Self { settings })
    }

    /// Computes `a_i` for `local_steps` steps of the clients' local optimizer.
    pub fn normalization_coeff(&self, local_steps: u64) -> f64 {
        let AggregationSettings {
            lr,
            momentum,
            prox_mu,
            ..
        } = self.settings;
        normalization_coeff(local_steps, lr, momentum, prox_mu)
    }

    /// Creates the update record of a client.
    pub fn update(
        &self,
        client_id: ClientId,
        delta: Model,
        local_steps: u64,
        data_weight: f64,
    ) -> ClientUpdate {
        ClientUpdate {
            client_id,
            delta,
            local_steps,
            normalization_coeff: self.normalization_coeff(local_steps),
            data_weight,
        }
    }

    /// Aggregates the `updates` of a round into the next global state.
    ///
    /// Invalid updates are excluded and logged. The previous `state` is only read.
    ///
    /// # Errors
    /// Fails if no valid update remains or the data weights of the valid updates sum to zero.
    pub fn aggregate(
        &self,
        state: &GlobalState,
        updates: Vec<ClientUpdate>,
    ) -> Result<(GlobalState, AggregationSummary), AggregationError> {
        let (valid, excluded) = self.filter_valid(state.model(), updates);

        let total_weight: f64 = valid.iter().map(|(update, _)| update.data_weight).sum();
        if valid.is_empty() || !(total_weight > 0.0 && total_weight.is_finite()) {
            warn!(
                "no valid update to aggregate: {} accepted with total weight {}, {} excluded",
                valid.len(),
                total_weight,
                excluded
            );
            return Err(AggregationError::NoValidUpdates { excluded });
        }

        // g_bar = sum_i w_i * delta_i / a_i
        let mut averaged = MomentumBuffer::zeros_like(state.model()).0;
        let mut tau_eff = 0.0;
        for (update, coeff) in valid.iter() {
            let weight = update.data_weight / total_weight;
            tau_eff += weight * coeff;
            let scale = weight / coeff;
            for (acc, tensor) in averaged.iter_mut().zip(update.delta.iter()) {
                for (a, d) in acc.iter_mut().zip(tensor.values()) {
                    *a += scale * f64::from(*d);
                }
            }
        }

        let mut next = state.clone();
        let direction = if self.settings.gmf > 0.0 {
            next.momentum.accumulate(self.settings.gmf, &averaged);
            &next.momentum.0
        } else {
            &averaged
        };
        for (tensor, dir) in next.model.iter_mut().zip(direction) {
            for (param, d) in tensor.values_mut().iter_mut().zip(dir) {
                *param = (f64::from(*param) - tau_eff * d) as f32;
            }
        }
        next.rounds += 1;

        let summary = AggregationSummary {
            accepted: valid.len(),
            excluded,
            tau_eff,
        };
        info!(
            "aggregated {} update(s), {} excluded, tau_eff = {:.4}",
            summary.accepted, summary.excluded, summary.tau_eff
        );
        Ok((next, summary))
    }

    /// Aggregates the `updates` of a round and commits the result to `state`.
    ///
    /// # Errors
    /// Fails as [`aggregate()`] does, in which case `state` is left untouched.
    ///
    /// [`aggregate()`]: FedNova::aggregate
    pub fn apply(
        &self,
        state: &mut GlobalState,
        updates: Vec<ClientUpdate>,
    ) -> Result<AggregationSummary, AggregationError> {
        let (next, summary) = self.aggregate(state, updates)?;
        *state = next;
        Ok(summary)
    }

    /// Splits off the invalid updates and pairs the valid ones with their recomputed `a_i`.
    fn filter_valid(
        &self,
        model: &Model,
        updates: Vec<ClientUpdate>,
    ) -> (Vec<(ClientUpdate, f64)>, usize) {
        let mut seen = HashSet::new();
        let mut valid = Vec::with_capacity(updates.len());
        let mut excluded = 0;

        for update in updates {
            let checked = update.validate(model).and_then(|_| {
                let coeff = self.normalization_coeff(update.local_steps);
                if !(coeff.is_finite() && coeff > 0.0) {
                    return Err(InvalidUpdate::DegenerateCoefficient(coeff));
                }
                if seen.contains(&update.client_id) {
                    return Err(InvalidUpdate::Duplicate);
                }
                Ok(coeff)
            });
            match checked {
                Ok(coeff) => {
                    if (coeff - update.normalization_coeff).abs() > 1e-9 * coeff {
                        debug!(
                            "{} reported a_i = {}, using {}",
                            update.client_id, update.normalization_coeff, coeff
                        );
                    }
                    seen.insert(update.client_id);
                    valid.push((update, coeff));
                }
                Err(err) => {
                    warn!("excluding the update of {}: {}", update.client_id, err);
                    excluded += 1;
                }
            }
        }

        (valid, excluded)
    }
}
