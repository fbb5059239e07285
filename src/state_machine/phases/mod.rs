//! This module provides the `PhaseStates` of the [`StateMachine`].
//!
//! [`StateMachine`]: crate::state_machine::StateMachine

mod aggregate;
mod evaluate;
mod failure;
mod phase;
mod select;
mod shutdown;
mod train;

pub use self::{
    aggregate::Aggregate,
    evaluate::Evaluate,
    failure::{Failure, PhaseError},
    phase::{Phase, PhaseName, PhaseState, Shared},
    select::Select,
    shutdown::Shutdown,
    train::Train,
};
