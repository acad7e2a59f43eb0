//! Event bus for variable store notifications
//!
//! The store's notifier task publishes `variable_created`,
//! `variable_changed` and `variable_removed` events here; the rule engine
//! subscribes to the whole stream so it sees every variable's events in
//! publish order. Publishing never blocks: a slow subscriber observes
//! `RecvError::Lagged` and can spot the gap through [`Event::seq`].

use dashmap::DashMap;
use hub_core::{Context, Event, EventData, EventType};
use serde::{de::DeserializeOwned, Serialize};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::{trace, warn};

type RawEvent = Event<serde_json::Value>;

/// Buffered events per subscriber before it starts lagging
pub const DEFAULT_CAPACITY: usize = 1024;

pub struct EventBus {
    /// Every event, in publish order
    stream: broadcast::Sender<RawEvent>,
    /// Per-kind channels, created on first subscription
    by_kind: DashMap<EventType, broadcast::Sender<RawEvent>>,
    /// Last sequence number handed out
    seq: AtomicU64,
    capacity: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (stream, _) = broadcast::channel(capacity);
        Self {
            stream,
            by_kind: DashMap::new(),
            seq: AtomicU64::new(0),
            capacity,
        }
    }

    /// Every event regardless of kind
    pub fn subscribe_all(&self) -> broadcast::Receiver<RawEvent> {
        self.stream.subscribe()
    }

    /// Events of one kind only
    pub fn subscribe(&self, kind: impl Into<EventType>) -> broadcast::Receiver<RawEvent> {
        let kind = kind.into();
        trace!(%kind, "Subscribing");
        self.by_kind
            .entry(kind)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Events of `T`'s kind with the payload decoded
    pub fn subscribe_typed<T: EventData + DeserializeOwned>(&self) -> TypedReceiver<T> {
        TypedReceiver {
            rx: self.subscribe(T::kind()),
            _data: PhantomData,
        }
    }

    /// Stamp the event with the next sequence number and publish it
    ///
    /// Returns the sequence number. Having no subscribers is fine.
    pub fn fire(&self, mut event: RawEvent) -> u64 {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        event.seq = seq;
        trace!(kind = %event.event_type, seq, "Firing event");

        if let Some(tx) = self.by_kind.get(&event.event_type) {
            let _ = tx.send(event.clone());
        }
        let _ = self.stream.send(event);
        seq
    }

    /// Publish a typed payload; `None` if it could not be encoded
    pub fn fire_typed<T: EventData + Serialize>(&self, data: T, context: Context) -> Option<u64> {
        match Event::typed(data, context).map_data(|d| serde_json::to_value(&d)) {
            Ok(event) => Some(self.fire(event)),
            Err(e) => {
                warn!(error = %e, "Event payload not serializable");
                None
            }
        }
    }

    /// Sequence number of the most recent event, 0 before the first
    pub fn last_seq(&self) -> u64 {
        self.seq.load(Ordering::Relaxed)
    }

    /// Kinds that have a dedicated channel
    pub fn kind_count(&self) -> usize {
        self.by_kind.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver that decodes payloads into `T`, skipping ones that don't parse
pub struct TypedReceiver<T> {
    rx: broadcast::Receiver<RawEvent>,
    _data: PhantomData<T>,
}

impl<T: EventData + DeserializeOwned> TypedReceiver<T> {
    pub async fn recv(&mut self) -> Result<Event<T>, broadcast::error::RecvError> {
        loop {
            if let Ok(event) = self.rx.recv().await?.map_data(serde_json::from_value) {
                return Ok(event);
            }
        }
    }

    pub fn try_recv(&mut self) -> Result<Event<T>, broadcast::error::TryRecvError> {
        loop {
            if let Ok(event) = self.rx.try_recv()?.map_data(serde_json::from_value) {
                return Ok(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_core::events::VariableChangedData;
    use hub_core::Value;
    use serde_json::json;

    #[tokio::test]
    async fn test_subscribe_and_fire() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(EventType::VariableChanged);

        let seq = bus.fire(Event::new(EventType::VariableChanged, json!({"name": "cpu"}), Context::new()));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type, EventType::VariableChanged);
        assert_eq!(received.data["name"], "cpu");
        assert_eq!(received.seq, seq);
        assert_eq!(bus.last_seq(), 1);
    }

    #[tokio::test]
    async fn test_stream_preserves_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_all();

        let ctx = Context::new();
        bus.fire(Event::new("variable_created", json!({"n": 1}), ctx.clone()));
        bus.fire(Event::new("variable_changed", json!({"n": 2}), ctx.clone()));
        bus.fire(Event::new("variable_removed", json!({"n": 3}), ctx));

        for n in 1..=3u64 {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.data["n"], n);
            assert_eq!(event.seq, n);
        }
    }

    #[tokio::test]
    async fn test_typed_subscription() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_typed::<VariableChangedData>();

        bus.fire_typed(
            VariableChangedData {
                name: "cpu_usage".into(),
                old_value: Value::Int(10),
                new_value: Value::Int(95),
                source_id: Some("rest1".into()),
            },
            Context::for_source("rest1"),
        );

        let received = rx.recv().await.unwrap();
        assert_eq!(received.data.name, "cpu_usage");
        assert_eq!(received.data.new_value, Value::Int(95));
        assert!(received.context.is_source("rest1"));
    }

    #[test]
    fn test_kinds_are_separate() {
        let bus = EventBus::new();
        let mut created = bus.subscribe(EventType::VariableCreated);
        let mut removed = bus.subscribe(EventType::VariableRemoved);

        bus.fire(Event::new(EventType::VariableCreated, json!({}), Context::new()));

        tokio_test::assert_ok!(created.try_recv());
        tokio_test::assert_err!(removed.try_recv());
        assert_eq!(bus.kind_count(), 2);
    }

    #[test]
    fn test_lagging_subscriber_sees_gap() {
        let bus = EventBus::with_capacity(2);
        let mut rx = bus.subscribe_all();
        for n in 0..4 {
            bus.fire(Event::new("variable_changed", json!({"n": n}), Context::new()));
        }
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Lagged(2))
        ));
        assert_eq!(rx.try_recv().unwrap().seq, 3);
    }
}
