//! Client update records.

use thiserror::Error;

use crate::{common::ClientId, model::Model};

#[derive(Debug, Clone, PartialEq)]
/// The result of one client's local training in a round, as consumed by the aggregator.
pub struct ClientUpdate {
    /// The client which trained.
    pub client_id: ClientId,
    /// The parameter change per tensor, old minus new.
    pub delta: Model,
    /// The number of local optimizer steps `tau_i`.
    pub local_steps: u64,
    /// The normalization coefficient `a_i` reported with the update. The aggregator recomputes it
    /// from `local_steps` and its own optimizer settings.
    pub normalization_coeff: f64,
    /// The relative data weight of the client, usually its partition ratio.
    pub data_weight: f64,
}

#[derive(Debug, Error, Clone, PartialEq)]
/// Reasons for excluding a client update from an aggregation.
pub enum InvalidUpdate {
    #[error("the client did not perform any local steps")]
    NoLocalSteps,

    #[error("the data weight {0} is negative or not finite")]
    InvalidWeight(f64),

    #[error("the delta doesn't match the tensor layout of the global model")]
    LayoutMismatch,

    #[error("the delta contains non-finite values")]
    NonFiniteDelta,

    #[error("the normalization coefficient {0} is not positive and finite")]
    DegenerateCoefficient(f64),

    #[error("an update of this client was already accepted in this round")]
    Duplicate,
}

impl ClientUpdate {
    /// Checks the update against the layout of the global `model`.
    ///
    /// Duplicates and the normalization coefficient are checked by the aggregator.
    pub fn validate(&self, model: &Model) -> Result<(), InvalidUpdate> {
        if self.local_steps == 0 {
            return Err(InvalidUpdate::NoLocalSteps);
        }
        if !self.data_weight.is_finite() || self.data_weight < 0.0 {
            return Err(InvalidUpdate::InvalidWeight(self.data_weight));
        }
        if !self.delta.has_same_layout(model) {
            return Err(InvalidUpdate::LayoutMismatch);
        }
        if !self.delta.is_finite() {
            return Err(InvalidUpdate::NonFiniteDelta);
        }
        Ok(())
    }
}
