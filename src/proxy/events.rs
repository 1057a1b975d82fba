use std::sync::Mutex;

use bytes::Bytes;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::protocol::types::{
    ClientId, Event, Eventgroup, EventRegistration, EventType, Instance, Reliability, Service,
    ANY_EVENT,
};

/// Per-event state of the application's own (outbound) subscription.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SubscriptionState {
    NotSubscribed,
    Subscribing,
    Subscribed,
    SubscribeFailed,
}

#[derive(Debug)]
struct EventEntry {
    event_type: EventType,
    #[allow(dead_code)]
    reliability: Reliability,
    is_provided: bool,
    eventgroups: FxHashSet<Eventgroup>,
    /// most recent payload, kept for fields only and replayed to late
    /// subscribers
    payload: Option<Bytes>,
    /// subscribers per eventgroup; ROUTING_CLIENT stands in for the set of
    /// remote subscribers behind the host
    subscribers: FxHashMap<Eventgroup, FxHashSet<ClientId>>,
    subscription_state: SubscriptionState,
}

impl EventEntry {
    fn is_field(&self) -> bool {
        self.event_type == EventType::Field
    }
}

/// The shared event registry: event metadata, the field payload cache and
/// subscriber bookkeeping, keyed by (service, instance, notifier).
pub(crate) struct EventRegistry {
    entries: Mutex<FxHashMap<(Service, Instance), FxHashMap<Event, EventEntry>>>,
}

impl EventRegistry {
    pub fn new() -> EventRegistry {
        EventRegistry {
            entries: Mutex::new(FxHashMap::default()),
        }
    }

    /// Creates or refines an event. A placeholder created by an early
    /// notification is upgraded in place once the real registration arrives.
    pub fn register(&self, registration: &EventRegistration) {
        let mut entries = self.entries.lock().unwrap();
        let events = entries
            .entry((registration.service, registration.instance))
            .or_default();
        match events.get_mut(&registration.notifier) {
            Some(entry) => {
                if registration.event_type != EventType::Unknown {
                    entry.event_type = registration.event_type;
                }
                entry.is_provided |= registration.is_provided;
                entry
                    .eventgroups
                    .extend(registration.eventgroups.iter().copied());
            }
            None => {
                events.insert(
                    registration.notifier,
                    EventEntry {
                        event_type: registration.event_type,
                        reliability: registration.reliability,
                        is_provided: registration.is_provided,
                        eventgroups: registration.eventgroups.iter().copied().collect(),
                        payload: None,
                        subscribers: FxHashMap::default(),
                        subscription_state: SubscriptionState::NotSubscribed,
                    },
                );
            }
        }
    }

    pub fn unregister(&self, service: Service, instance: Instance, notifier: Event, is_provided: bool) {
        let mut entries = self.entries.lock().unwrap();
        let mut service_is_empty = false;
        if let Some(events) = entries.get_mut(&(service, instance)) {
            if let Some(entry) = events.get_mut(&notifier) {
                if is_provided {
                    entry.is_provided = false;
                    entry.payload = None;
                }
                if !entry.is_provided && entry.subscribers.values().all(|s| s.is_empty()) {
                    events.remove(&notifier);
                }
            }
            service_is_empty = events.is_empty();
        }
        if service_is_empty {
            entries.remove(&(service, instance));
        }
    }

    pub fn is_field(&self, service: Service, instance: Instance, event: Event) -> bool {
        self.entries
            .lock()
            .unwrap()
            .get(&(service, instance))
            .and_then(|events| events.get(&event))
            .map(|e| e.is_field())
            .unwrap_or(false)
    }

    /// Caches the payload of an inbound notification. An event nobody asked
    /// for yet gets a placeholder entry so the value is there once somebody
    /// does.
    pub fn cache_payload(&self, service: Service, instance: Instance, event: Event, payload: Bytes) {
        let mut entries = self.entries.lock().unwrap();
        let events = entries.entry((service, instance)).or_default();
        let entry = events.entry(event).or_insert_with(|| EventEntry {
            event_type: EventType::Unknown,
            reliability: Reliability::Unknown,
            is_provided: false,
            eventgroups: FxHashSet::default(),
            payload: None,
            subscribers: FxHashMap::default(),
            subscription_state: SubscriptionState::NotSubscribed,
        });
        if entry.event_type == EventType::Field || entry.event_type == EventType::Unknown {
            entry.payload = Some(payload);
        }
    }

    /// Cached field payloads of an eventgroup, for the initial notification
    /// of a fresh remote subscriber.
    pub fn cached_payloads(
        &self,
        service: Service,
        instance: Instance,
        eventgroup: Eventgroup,
        exclude: &FxHashSet<Event>,
    ) -> Vec<(Event, Bytes)> {
        let entries = self.entries.lock().unwrap();
        let Some(events) = entries.get(&(service, instance)) else {
            return Vec::new();
        };
        let mut payloads: Vec<(Event, Bytes)> = events
            .iter()
            .filter(|(event, entry)| {
                entry.eventgroups.contains(&eventgroup)
                    && entry.is_field()
                    && !exclude.contains(*event)
            })
            .filter_map(|(event, entry)| entry.payload.clone().map(|p| (*event, p)))
            .collect();
        payloads.sort_by_key(|(event, _)| *event);
        payloads
    }

    /// Drops cached payloads of a service that went away, so stale values
    /// are never served to a later subscriber.
    pub fn unset_payloads(&self, service: Service, instance: Instance) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(events) = entries.get_mut(&(service, instance)) {
            for entry in events.values_mut() {
                entry.payload = None;
            }
        }
    }

    pub fn eventgroup_events(
        &self,
        service: Service,
        instance: Instance,
        eventgroup: Eventgroup,
    ) -> Vec<Event> {
        let entries = self.entries.lock().unwrap();
        let Some(events) = entries.get(&(service, instance)) else {
            return Vec::new();
        };
        let mut result: Vec<Event> = events
            .iter()
            .filter(|(_, entry)| entry.eventgroups.contains(&eventgroup))
            .map(|(event, _)| *event)
            .collect();
        result.sort_unstable();
        result
    }

    /// Adds `client` as subscriber of `event` (or of the whole eventgroup for
    /// ANY_EVENT). Returns whether anything new was inserted plus the events
    /// that already had this subscriber.
    pub fn add_subscriber(
        &self,
        service: Service,
        instance: Instance,
        eventgroup: Eventgroup,
        event: Event,
        client: ClientId,
    ) -> (bool, FxHashSet<Event>) {
        let mut entries = self.entries.lock().unwrap();
        let mut inserted = false;
        let mut already_subscribed = FxHashSet::default();
        let Some(events) = entries.get_mut(&(service, instance)) else {
            return (false, already_subscribed);
        };
        for (id, entry) in events.iter_mut() {
            if !entry.eventgroups.contains(&eventgroup) {
                continue;
            }
            if event != ANY_EVENT && *id != event {
                continue;
            }
            if entry.subscribers.entry(eventgroup).or_default().insert(client) {
                inserted = true;
            } else {
                already_subscribed.insert(*id);
            }
        }
        (inserted, already_subscribed)
    }

    /// Removes `client` from `event` (or the whole eventgroup for ANY_EVENT).
    pub fn remove_subscriber(
        &self,
        service: Service,
        instance: Instance,
        eventgroup: Eventgroup,
        event: Event,
        client: ClientId,
    ) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(events) = entries.get_mut(&(service, instance)) {
            for (id, entry) in events.iter_mut() {
                if event != ANY_EVENT && *id != event {
                    continue;
                }
                if let Some(subscribers) = entry.subscribers.get_mut(&eventgroup) {
                    subscribers.remove(&client);
                }
            }
        }
    }

    /// All subscribers of `event` across its eventgroups.
    pub fn subscribers_of(
        &self,
        service: Service,
        instance: Instance,
        event: Event,
    ) -> FxHashSet<ClientId> {
        let entries = self.entries.lock().unwrap();
        let mut subscribers = FxHashSet::default();
        if let Some(entry) = entries.get(&(service, instance)).and_then(|e| e.get(&event)) {
            for per_group in entry.subscribers.values() {
                subscribers.extend(per_group.iter().copied());
            }
        }
        subscribers
    }

    pub fn set_subscription_state(
        &self,
        service: Service,
        instance: Instance,
        eventgroup: Eventgroup,
        event: Event,
        state: SubscriptionState,
    ) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(events) = entries.get_mut(&(service, instance)) {
            for (id, entry) in events.iter_mut() {
                let selected = if event == ANY_EVENT {
                    entry.eventgroups.contains(&eventgroup)
                } else {
                    *id == event
                };
                if selected {
                    entry.subscription_state = state;
                }
            }
        }
    }

    #[cfg(test)]
    pub fn subscription_state(
        &self,
        service: Service,
        instance: Instance,
        event: Event,
    ) -> Option<SubscriptionState> {
        self.entries
            .lock()
            .unwrap()
            .get(&(service, instance))
            .and_then(|events| events.get(&event))
            .map(|e| e.subscription_state)
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeSet;

    use super::*;

    fn field_registration(notifier: u16, eventgroup: u16, provided: bool) -> EventRegistration {
        EventRegistration {
            service: 0x1111,
            instance: 0x2222,
            notifier,
            event_type: EventType::Field,
            reliability: Reliability::Unreliable,
            is_provided: provided,
            is_cyclic: false,
            eventgroups: BTreeSet::from_iter([eventgroup]),
        }
    }

    #[test]
    fn test_cache_and_unset_payload() {
        let registry = EventRegistry::new();
        registry.register(&field_registration(0xAAAA, 0x10, true));

        registry.cache_payload(0x1111, 0x2222, 0xAAAA, Bytes::from_static(&[1, 2]));
        let cached = registry.cached_payloads(0x1111, 0x2222, 0x10, &FxHashSet::default());
        assert_eq!(cached, vec![(0xAAAA, Bytes::from_static(&[1, 2]))]);

        registry.unset_payloads(0x1111, 0x2222);
        assert!(registry
            .cached_payloads(0x1111, 0x2222, 0x10, &FxHashSet::default())
            .is_empty());
    }

    #[test]
    fn test_placeholder_upgraded_by_registration() {
        let registry = EventRegistry::new();
        // early notification for an unknown event creates a placeholder
        registry.cache_payload(0x1111, 0x2222, 0xAAAA, Bytes::from_static(&[9]));
        assert!(!registry.is_field(0x1111, 0x2222, 0xAAAA));

        registry.register(&field_registration(0xAAAA, 0x10, false));
        assert!(registry.is_field(0x1111, 0x2222, 0xAAAA));
        // the early payload survives the upgrade
        let cached = registry.cached_payloads(0x1111, 0x2222, 0x10, &FxHashSet::default());
        assert_eq!(cached.len(), 1);
    }

    #[test]
    fn test_any_event_subscriber_fanout() {
        let registry = EventRegistry::new();
        registry.register(&field_registration(0xAAAA, 0x10, true));
        registry.register(&field_registration(0xAAAB, 0x10, true));

        let (inserted, already) =
            registry.add_subscriber(0x1111, 0x2222, 0x10, ANY_EVENT, 0x4444);
        assert!(inserted);
        assert!(already.is_empty());

        // second subscribe of the same client reports both events as known
        let (inserted, already) =
            registry.add_subscriber(0x1111, 0x2222, 0x10, ANY_EVENT, 0x4444);
        assert!(!inserted);
        assert_eq!(already.len(), 2);

        assert_eq!(
            registry.subscribers_of(0x1111, 0x2222, 0xAAAA),
            FxHashSet::from_iter([0x4444])
        );

        registry.remove_subscriber(0x1111, 0x2222, 0x10, ANY_EVENT, 0x4444);
        assert!(registry.subscribers_of(0x1111, 0x2222, 0xAAAA).is_empty());
    }
}
