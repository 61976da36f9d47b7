use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use tracing::{debug, warn};
use wave_types::UpdateSet;

use crate::error::{BrokerError, BrokerResult};
use crate::event::{SubscriptionRequest, WaveEvent};

/// Delivery seam between the broker and whatever owns the routes.
pub trait EventSink: Send + Sync {
    /// Hand `event` to `route_id`.
    ///
    /// Must not block. A route that is gone or cannot keep up simply misses
    /// the event.
    fn deliver(&self, route_id: &str, event: &WaveEvent);
}

/// Configuration for the [`EventBroker`].
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// Events retained per event name for history replay.
    pub history_capacity: usize,
    /// Event names with retained history. Publishing a new name past this
    /// evicts the name written least recently.
    pub history_names: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            history_capacity: 128,
            history_names: 256,
        }
    }
}

struct HistoryRing {
    events: VecDeque<WaveEvent>,
    last_write: u64,
}

/// Per-name history rings, bounded in both directions.
#[derive(Default)]
struct History {
    rings: HashMap<String, HistoryRing>,
    clock: u64,
}

impl History {
    fn record(&mut self, event: &WaveEvent, capacity: usize, max_names: usize) {
        self.clock += 1;
        if !self.rings.contains_key(&event.event) {
            while self.rings.len() >= max_names {
                let Some(oldest) = self
                    .rings
                    .iter()
                    .min_by_key(|(_, ring)| ring.last_write)
                    .map(|(name, _)| name.clone())
                else {
                    break;
                };
                debug!(event = %oldest, "history evicted");
                self.rings.remove(&oldest);
            }
        }
        let ring = self
            .rings
            .entry(event.event.clone())
            .or_insert_with(|| HistoryRing {
                events: VecDeque::new(),
                last_write: 0,
            });
        ring.last_write = self.clock;
        while ring.events.len() >= capacity {
            ring.events.pop_front();
        }
        ring.events.push_back(event.clone());
    }
}

/// route id -> event name -> subscription
type SubscriptionTable = HashMap<String, HashMap<String, SubscriptionRequest>>;

/// In-memory publish/subscribe hub.
///
/// The subscription table is read on every publish and written only on
/// (un)subscribe. A publish lock keeps each published batch contiguous for
/// every subscriber.
pub struct EventBroker {
    subscriptions: RwLock<SubscriptionTable>,
    history: Mutex<History>,
    sink: RwLock<Option<Weak<dyn EventSink>>>,
    publish_lock: Mutex<()>,
    config: BrokerConfig,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl EventBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            history: Mutex::new(History::default()),
            sink: RwLock::new(None),
            publish_lock: Mutex::new(()),
            config,
        }
    }

    /// Attach the delivery sink. Held weakly so the sink's owner can hold
    /// the broker without a cycle.
    pub fn set_sink(&self, sink: &Arc<dyn EventSink>) {
        *self.sink.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::downgrade(sink));
    }

    fn current_sink(&self) -> Option<Arc<dyn EventSink>> {
        self.sink
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }

    /// Publish one event. Returns the number of routes it was handed to.
    pub fn publish(&self, event: WaveEvent) -> BrokerResult<usize> {
        if event.event.is_empty() {
            return Err(BrokerError::EmptyEventName);
        }
        let _guard = lock(&self.publish_lock);
        Ok(self.publish_locked(&event))
    }

    /// Publish one `waveobj:update` event per entry, scoped to the entry's
    /// ORef, as one contiguous batch. Returns the number of events published.
    pub fn send_update_events(&self, updates: &UpdateSet) -> usize {
        if updates.is_empty() {
            return 0;
        }
        let _guard = lock(&self.publish_lock);
        let mut published = 0;
        for entry in updates {
            match WaveEvent::for_update(entry) {
                Ok(event) => {
                    self.publish_locked(&event);
                    published += 1;
                }
                Err(e) => warn!(oref = %entry.oref(), error = %e, "dropping unencodable update"),
            }
        }
        debug!(count = published, "update events sent");
        published
    }

    fn publish_locked(&self, event: &WaveEvent) -> usize {
        self.record_history(event);

        let targets = self.matching_routes(event);
        if targets.is_empty() {
            return 0;
        }
        let Some(sink) = self.current_sink() else {
            debug!(event = %event.event, "no sink attached, event not delivered");
            return 0;
        };
        for route_id in &targets {
            sink.deliver(route_id, event);
        }
        targets.len()
    }

    fn record_history(&self, event: &WaveEvent) {
        let capacity = self.config.history_capacity;
        if capacity == 0 || self.config.history_names == 0 {
            return;
        }
        lock(&self.history).record(event, capacity, self.config.history_names);
    }

    fn matching_routes(&self, event: &WaveEvent) -> Vec<String> {
        let table = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut routes: Vec<String> = table
            .iter()
            .filter(|(_, subs)| subs.values().any(|s| s.matches(event)))
            .map(|(route, _)| route.clone())
            .collect();
        routes.sort();
        routes
    }

    /// Add or replace the route's subscription for `request.event`.
    pub fn subscribe(&self, route_id: &str, request: SubscriptionRequest) -> BrokerResult<()> {
        if route_id.is_empty() {
            return Err(BrokerError::EmptyRouteId);
        }
        request.validate()?;
        debug!(route = route_id, event = %request.event, scopes = ?request.scopes, "subscribe");
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(route_id.to_string())
            .or_default()
            .insert(request.event.clone(), request);
        Ok(())
    }

    /// Drop the route's subscription for one event name.
    pub fn unsubscribe(&self, route_id: &str, event: &str) -> bool {
        let mut table = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(subs) = table.get_mut(route_id) else {
            return false;
        };
        let removed = subs.remove(event).is_some();
        if subs.is_empty() {
            table.remove(route_id);
        }
        removed
    }

    /// Drop every subscription held by the route. Returns how many went.
    pub fn unsubscribe_all(&self, route_id: &str) -> usize {
        let removed = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(route_id)
            .map(|subs| subs.len())
            .unwrap_or(0);
        if removed > 0 {
            debug!(route = route_id, removed, "subscriptions cleared");
        }
        removed
    }

    /// Recent events named `event`, most recent first.
    ///
    /// An empty `scope` matches every event; otherwise `scope` is applied as
    /// a subscription scope pattern.
    pub fn read_event_history(&self, event: &str, scope: &str, max_items: usize) -> Vec<WaveEvent> {
        let history = lock(&self.history);
        let Some(ring) = history.rings.get(event) else {
            return Vec::new();
        };
        ring.events
            .iter()
            .rev()
            .filter(|e| scope.is_empty() || e.has_scope(scope))
            .take(max_items)
            .cloned()
            .collect()
    }

    /// Number of routes holding at least one subscription.
    pub fn subscriber_count(&self) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn subscriptions_for(&self, route_id: &str) -> Vec<SubscriptionRequest> {
        let table = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut subs: Vec<_> = table
            .get(route_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        subs.sort_by(|a, b| a.event.cmp(&b.event));
        subs
    }

    pub fn history_len(&self, event: &str) -> usize {
        lock(&self.history)
            .rings
            .get(event)
            .map(|ring| ring.events.len())
            .unwrap_or(0)
    }

    /// Event names that currently have retained history.
    pub fn history_names(&self) -> usize {
        lock(&self.history).rings.len()
    }
}

impl Default for EventBroker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

impl std::fmt::Debug for EventBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBroker")
            .field("subscribers", &self.subscriber_count())
            .field("history_capacity", &self.config.history_capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::events;
    use wave_types::{Block, UpdateEntry, WaveObj};

    #[derive(Default)]
    struct RecordingSink {
        delivered: Mutex<Vec<(String, WaveEvent)>>,
    }

    impl RecordingSink {
        fn for_route(&self, route: &str) -> Vec<WaveEvent> {
            lock(&self.delivered)
                .iter()
                .filter(|(r, _)| r == route)
                .map(|(_, e)| e.clone())
                .collect()
        }
    }

    impl EventSink for RecordingSink {
        fn deliver(&self, route_id: &str, event: &WaveEvent) {
            lock(&self.delivered).push((route_id.to_string(), event.clone()));
        }
    }

    fn broker_with_sink() -> (EventBroker, Arc<RecordingSink>) {
        let broker = EventBroker::default();
        let sink = Arc::new(RecordingSink::default());
        let dyn_sink: Arc<dyn EventSink> = sink.clone();
        broker.set_sink(&dyn_sink);
        (broker, sink)
    }

    fn block_update(oid: &str, version: i64) -> UpdateEntry {
        UpdateEntry::update(WaveObj::Block(Block {
            oid: oid.into(),
            version,
            ..Default::default()
        }))
    }

    // -----------------------------------------------------------------------
    // Fan-out
    // -----------------------------------------------------------------------

    #[test]
    fn scoped_delivery() {
        let (broker, sink) = broker_with_sink();
        broker
            .subscribe("r1", SubscriptionRequest::new("blockfile").with_scope("block:B1"))
            .unwrap();
        broker
            .subscribe("r2", SubscriptionRequest::new("blockfile").with_scope("block:*"))
            .unwrap();

        broker
            .publish(WaveEvent::new("blockfile").with_scope("block:B1"))
            .unwrap();
        broker
            .publish(WaveEvent::new("blockfile").with_scope("block:B2"))
            .unwrap();
        broker
            .publish(WaveEvent::new("blockfile").with_scope("tab:T1"))
            .unwrap();

        let r1 = sink.for_route("r1");
        assert_eq!(r1.len(), 1);
        assert_eq!(r1[0].scopes, vec!["block:B1".to_string()]);
        assert_eq!(sink.for_route("r2").len(), 2);
    }

    #[test]
    fn multi_scope_event_reaches_each_route_once() {
        let (broker, sink) = broker_with_sink();
        broker
            .subscribe("r1", SubscriptionRequest::new(events::BLOCK_CLOSE).with_scope("tab:T1"))
            .unwrap();
        let delivered = broker
            .publish(
                WaveEvent::new(events::BLOCK_CLOSE)
                    .with_scope("tab:T1")
                    .with_scope("block:B1"),
            )
            .unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(sink.for_route("r1").len(), 1);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let (broker, sink) = broker_with_sink();
        broker
            .subscribe("r1", SubscriptionRequest::new("a").all_scopes())
            .unwrap();
        broker
            .subscribe("r1", SubscriptionRequest::new("b").all_scopes())
            .unwrap();
        assert!(broker.unsubscribe("r1", "a"));
        assert!(!broker.unsubscribe("r1", "a"));
        broker.publish(WaveEvent::new("a")).unwrap();
        broker.publish(WaveEvent::new("b")).unwrap();
        assert_eq!(sink.for_route("r1").len(), 1);

        assert_eq!(broker.unsubscribe_all("r1"), 1);
        assert_eq!(broker.subscriber_count(), 0);
        broker.publish(WaveEvent::new("b")).unwrap();
        assert_eq!(sink.for_route("r1").len(), 1);
    }

    #[test]
    fn publish_without_sink_is_harmless() {
        let broker = EventBroker::default();
        broker
            .subscribe("r1", SubscriptionRequest::new("a").all_scopes())
            .unwrap();
        assert_eq!(broker.publish(WaveEvent::new("a")).unwrap(), 0);
        assert_eq!(broker.history_len("a"), 1);

        let sink: Arc<dyn EventSink> = Arc::new(RecordingSink::default());
        broker.set_sink(&sink);
        drop(sink);
        assert_eq!(broker.publish(WaveEvent::new("a")).unwrap(), 0);
    }

    #[test]
    fn publish_rejects_empty_name() {
        let broker = EventBroker::default();
        assert_eq!(
            broker.publish(WaveEvent::new("")),
            Err(BrokerError::EmptyEventName)
        );
        assert_eq!(
            broker.subscribe("", SubscriptionRequest::new("a")),
            Err(BrokerError::EmptyRouteId)
        );
    }

    #[test]
    fn update_events_one_per_entry() {
        let (broker, sink) = broker_with_sink();
        broker
            .subscribe(
                "r1",
                SubscriptionRequest::new(events::WAVEOBJ_UPDATE).with_scope("block:b1"),
            )
            .unwrap();
        let updates: UpdateSet = vec![
            block_update("b1", 1),
            block_update("b2", 1),
            block_update("b1", 2),
        ]
        .into_iter()
        .collect();
        assert_eq!(broker.send_update_events(&updates), 3);

        let got = sink.for_route("r1");
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].data["obj"]["version"], 1);
        assert_eq!(got[1].data["obj"]["version"], 2);
    }

    #[test]
    fn concurrent_batches_stay_contiguous() {
        let (broker, sink) = broker_with_sink();
        let broker = Arc::new(broker);
        broker
            .subscribe(
                "r1",
                SubscriptionRequest::new(events::WAVEOBJ_UPDATE).with_scope("block:b1"),
            )
            .unwrap();

        let handles: Vec<_> = (0..8)
            .map(|batch| {
                let broker = broker.clone();
                std::thread::spawn(move || {
                    let updates: UpdateSet = (0..5)
                        .map(|i| block_update("b1", batch * 10 + i))
                        .collect();
                    broker.send_update_events(&updates);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let versions: Vec<i64> = sink
            .for_route("r1")
            .iter()
            .map(|e| e.data["obj"]["version"].as_i64().unwrap())
            .collect();
        assert_eq!(versions.len(), 40);
        for chunk in versions.chunks(5) {
            let batch = chunk[0] / 10;
            assert!(chunk.iter().all(|v| v / 10 == batch), "interleaved: {chunk:?}");
        }
    }

    // -----------------------------------------------------------------------
    // History
    // -----------------------------------------------------------------------

    #[test]
    fn history_round_trip() {
        let broker = EventBroker::default();
        let ev = WaveEvent::new("connchange")
            .with_scope("conn:local")
            .with_data(serde_json::json!({"status": "connected"}));
        broker.publish(ev.clone()).unwrap();
        assert_eq!(broker.read_event_history("connchange", "conn:local", 1), vec![ev]);
    }

    #[test]
    fn history_is_bounded_and_newest_first() {
        let broker = EventBroker::new(BrokerConfig {
            history_capacity: 3,
            ..BrokerConfig::default()
        });
        for i in 0..5 {
            broker
                .publish(
                    WaveEvent::new("tick")
                        .with_scope(if i % 2 == 0 { "block:even" } else { "block:odd" })
                        .with_data(serde_json::json!(i)),
                )
                .unwrap();
        }
        assert_eq!(broker.history_len("tick"), 3);

        let all: Vec<_> = broker
            .read_event_history("tick", "", 10)
            .into_iter()
            .map(|e| e.data)
            .collect();
        assert_eq!(all, vec![serde_json::json!(4), serde_json::json!(3), serde_json::json!(2)]);

        let even = broker.read_event_history("tick", "block:even", 10);
        assert_eq!(even.len(), 2);
        assert_eq!(broker.read_event_history("tick", "block:*", 1).len(), 1);
        assert!(broker.read_event_history("other", "", 10).is_empty());
    }

    #[test]
    fn distinct_event_names_do_not_grow_history_without_bound() {
        let broker = EventBroker::new(BrokerConfig {
            history_capacity: 4,
            history_names: 16,
        });
        broker.publish(WaveEvent::new("keep").with_scope("conn:local")).unwrap();
        for i in 0..1000 {
            broker.publish(WaveEvent::new(format!("noise:{i}"))).unwrap();
            // keep stays the most recently written name
            if i % 8 == 0 {
                broker.publish(WaveEvent::new("keep").with_scope("conn:local")).unwrap();
            }
        }
        assert_eq!(broker.history_names(), 16);
        assert_eq!(broker.history_len("keep"), 4);
        assert_eq!(broker.history_len("noise:999"), 1);
        assert_eq!(broker.history_len("noise:0"), 0);
    }
}
