//! Lossy fan-out event bus
//!
//! Every subscriber owns a small bounded queue. Publishing never waits: when
//! a subscriber's queue is full the event is dropped for that subscriber only.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use strum::{AsRefStr, Display};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::domain::{FailureKind, FlexibilitySignal, SignalKind};

/// Queue depth of each subscription
pub const SUBSCRIBER_BUFFER: usize = 8;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BusError {
    #[error("event bus closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StrategyStep {
    LpAttempt,
    LpFailure,
    SmartFallback,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchEvent {
    /// A signal entered dispatch; always precedes its acks
    Signal {
        signal: FlexibilitySignal,
        eligible: usize,
    },
    /// Final state of one vehicle's order
    Ack {
        vehicle_id: String,
        power_kw: f64,
        acknowledged: bool,
        error: Option<FailureKind>,
        latency_ms: f64,
    },
    /// LP-first path progress
    Strategy {
        step: StrategyStep,
        signal_kind: SignalKind,
        detail: Option<String>,
    },
}

/// Receiving end handed out by [`EventBus::subscribe`]
#[derive(Debug)]
pub struct Subscription<E> {
    pub id: u64,
    pub receiver: mpsc::Receiver<E>,
}

impl<E> Subscription<E> {
    pub async fn recv(&mut self) -> Option<E> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<E> {
        self.receiver.try_recv().ok()
    }
}

struct BusState<E> {
    next_id: u64,
    closed: bool,
    subscribers: HashMap<u64, mpsc::Sender<E>>,
}

pub struct EventBus<E> {
    state: Mutex<BusState<E>>,
}

impl<E: Clone + Send> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Clone + Send> EventBus<E> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BusState {
                next_id: 0,
                closed: false,
                subscribers: HashMap::new(),
            }),
        }
    }

    /// New subscription. On a closed bus the receiver is already finished.
    pub fn subscribe(&self) -> Subscription<E> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        if !state.closed {
            state.subscribers.insert(id, tx);
        }
        Subscription { id, receiver: rx }
    }

    /// Drop a subscription's sender, ending its stream. Unknown ids and
    /// repeated calls are ignored.
    pub fn unsubscribe(&self, id: u64) {
        self.state.lock().subscribers.remove(&id);
    }

    /// Deliver to every subscriber that has room
    pub fn publish(&self, event: E) -> Result<(), BusError> {
        let state = self.state.lock();
        if state.closed {
            return Err(BusError::Closed);
        }
        for (id, tx) in &state.subscribers {
            if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(event.clone()) {
                tracing::debug!(subscriber = id, "event dropped, subscriber full");
            }
        }
        Ok(())
    }

    /// End all subscriptions and reject further publishes
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.subscribers.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fan_out_in_order() {
        let bus = EventBus::<u32>::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish(1).unwrap();
        bus.publish(2).unwrap();
        assert_eq!(a.recv().await, Some(1));
        assert_eq!(a.recv().await, Some(2));
        assert_eq!(b.recv().await, Some(1));
        assert_eq!(b.recv().await, Some(2));
    }

    #[tokio::test]
    async fn test_full_subscriber_drops_without_blocking_others() {
        let bus = EventBus::<usize>::new();
        let mut slow = bus.subscribe();
        let mut fast = bus.subscribe();
        for i in 0..SUBSCRIBER_BUFFER + 4 {
            bus.publish(i).unwrap();
            assert_eq!(fast.recv().await, Some(i));
        }
        let mut received = 0;
        while slow.try_recv().is_some() {
            received += 1;
        }
        assert_eq!(received, SUBSCRIBER_BUFFER);
    }

    #[tokio::test]
    async fn test_unsubscribe_closes_stream_once() {
        let bus = EventBus::<u8>::new();
        let mut sub = bus.subscribe();
        bus.publish(7).unwrap();
        bus.unsubscribe(sub.id);
        bus.unsubscribe(sub.id);
        assert_eq!(sub.recv().await, Some(7));
        assert_eq!(sub.recv().await, None);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_close_rejects_publish_and_tolerates_unsubscribe() {
        let bus = EventBus::<u8>::new();
        let mut sub = bus.subscribe();
        bus.close();
        assert_eq!(bus.publish(1), Err(BusError::Closed));
        bus.unsubscribe(sub.id);
        assert_eq!(sub.recv().await, None);

        let mut late = bus.subscribe();
        assert_eq!(late.recv().await, None);
    }

    #[test]
    fn test_strategy_step_names() {
        assert_eq!(StrategyStep::LpAttempt.as_ref(), "lp_attempt");
        assert_eq!(StrategyStep::SmartFallback.to_string(), "smart_fallback");
    }
}
