//! This module provides the [`StateMachine`]'s `Events`, `EventSubscriber` and `EventPublisher`
//! types.
//!
//! [`StateMachine`]: crate::state_machine::StateMachine

use std::sync::Arc;

use tokio::sync::watch;

use crate::{
    common::RoundId,
    model::Model,
    state_machine::{coordinator::RoundParameters, phases::PhaseName},
};

/// An event emitted by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event<E> {
    /// Metadata that associates this event to the round in which it is
    /// emitted.
    pub round_id: RoundId,
    /// The event itself
    pub event: E,
}

/// A newly published global model.
pub type ModelEvent = Arc<Model>;

/// A convenience type to emit any coordinator event.
#[derive(Debug)]
pub struct EventPublisher {
    /// Round ID that is attached to all the events.
    round_id: RoundId,
    params_tx: EventBroadcaster<RoundParameters>,
    phase_tx: EventBroadcaster<PhaseName>,
    model_tx: EventBroadcaster<ModelEvent>,
}

/// The `EventSubscriber` hands out `EventListener`s for any
/// coordinator event.
#[derive(Debug)]
pub struct EventSubscriber {
    params_rx: EventListener<RoundParameters>,
    phase_rx: EventListener<PhaseName>,
    model_rx: EventListener<ModelEvent>,
}

impl EventPublisher {
    /// Initialize a new event publisher with the given initial events.
    pub fn init(
        round_id: RoundId,
        params: RoundParameters,
        phase: PhaseName,
        model: ModelEvent,
    ) -> (Self, EventSubscriber) {
        let (params_tx, params_rx) = watch::channel::<Event<RoundParameters>>(Event {
            round_id,
            event: params,
        });

        let (phase_tx, phase_rx) = watch::channel::<Event<PhaseName>>(Event {
            round_id,
            event: phase,
        });

        let (model_tx, model_rx) = watch::channel::<Event<ModelEvent>>(Event {
            round_id,
            event: model,
        });

        let publisher = EventPublisher {
            round_id,
            params_tx: params_tx.into(),
            phase_tx: phase_tx.into(),
            model_tx: model_tx.into(),
        };

        let subscriber = EventSubscriber {
            params_rx: params_rx.into(),
            phase_rx: phase_rx.into(),
            model_rx: model_rx.into(),
        };

        (publisher, subscriber)
    }

    /// Set the round ID that is attached to the events the publisher broadcasts.
    pub fn set_round_id(&mut self, id: RoundId) {
        self.round_id = id;
    }

    fn event<T>(&self, event: T) -> Event<T> {
        Event {
            round_id: self.round_id,
            event,
        }
    }

    /// Emit a round parameters event
    pub fn broadcast_params(&mut self, params: RoundParameters) {
        self.params_tx.broadcast(self.event(params));
    }

    /// Emit a phase event
    pub fn broadcast_phase(&mut self, phase: PhaseName) {
        self.phase_tx.broadcast(self.event(phase));
    }

    /// Emit a model event
    pub fn broadcast_model(&mut self, model: ModelEvent) {
        self.model_tx.broadcast(self.event(model));
    }
}

impl EventSubscriber {
    /// Get a listener for round parameters events
    pub fn params_listener(&self) -> EventListener<RoundParameters> {
        self.params_rx.clone()
    }

    /// Get a listener for new phase events
    pub fn phase_listener(&self) -> EventListener<PhaseName> {
        self.phase_rx.clone()
    }

    /// Get a listener for new model events
    pub fn model_listener(&self) -> EventListener<ModelEvent> {
        self.model_rx.clone()
    }
}

/// A listener for coordinator events. It can be used to either
/// retrieve the latest `Event<E>` emitted by the coordinator (with
/// `EventListener::get_latest`) or to wait for the next event (with
/// `EventListener::next_event`).
#[derive(Debug, Clone)]
pub struct EventListener<E>(watch::Receiver<Event<E>>);

impl<E> From<watch::Receiver<Event<E>>> for EventListener<E> {
    fn from(receiver: watch::Receiver<Event<E>>) -> Self {
        EventListener(receiver)
    }
}

impl<E> EventListener<E>
where
    E: Clone,
{
    pub fn get_latest(&self) -> Event<E> {
        self.0.borrow().clone()
    }

    /// Waits for an event which this listener has not seen yet. Returns `None` once the publisher
    /// has been dropped.
    pub async fn next_event(&mut self) -> Option<Event<E>> {
        self.0.changed().await.ok()?;
        Some(self.0.borrow().clone())
    }
}

/// A channel to send `Event<E>` to all the `EventListener<E>`.
#[derive(Debug)]
pub struct EventBroadcaster<E>(watch::Sender<Event<E>>);

impl<E> EventBroadcaster<E> {
    /// Send `event` to all the `EventListener<E>`
    fn broadcast(&self, event: Event<E>) {
        // We don't care whether there's a listener or not
        let _ = self.0.send(event);
    }
}

impl<E> From<watch::Sender<Event<E>>> for EventBroadcaster<E> {
    fn from(sender: watch::Sender<Event<E>>) -> Self {
        Self(sender)
    }
}
