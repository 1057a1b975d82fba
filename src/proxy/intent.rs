use std::collections::BTreeSet;
use std::sync::Mutex;

use rustc_hash::FxHashMap;

use crate::protocol::types::{
    ClientId, Event, Eventgroup, EventRegistration, Filter, Instance, Major, Service,
    ServiceVersion, ANY_EVENT, ANY_EVENTGROUP,
};
use crate::proxy::security::SecClient;

/// One subscription the application wants, kept until it is withdrawn so it
/// can be replayed whenever the service (re)appears.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub struct SubscriptionIntent {
    pub service: Service,
    pub instance: Instance,
    pub eventgroup: Eventgroup,
    pub major: Major,
    pub event: Event,
    pub filter: Option<Filter>,
    pub sec_client: SecClient,
}

/// Canonical record of everything the application has asked for. The network
/// may forget (routing host restarts); this registry does not. Ordered sets
/// keep replay deterministic.
///
/// Every mutation is idempotent with respect to network effects: the `bool`
/// returns tell the caller whether this call was the first transition into
/// the set, and only a first transition may cause a send.
pub(crate) struct IntentRegistry {
    offers: Mutex<BTreeSet<ServiceVersion>>,
    requests: Mutex<BTreeSet<ServiceVersion>>,
    debounced_requests: Mutex<BTreeSet<ServiceVersion>>,
    event_registrations: Mutex<BTreeSet<EventRegistration>>,
    subscriptions: Mutex<BTreeSet<SubscriptionIntent>>,
    incoming_subscriptions: Mutex<FxHashMap<ClientId, BTreeSet<SubscriptionIntent>>>,
}

impl IntentRegistry {
    pub fn new() -> IntentRegistry {
        IntentRegistry {
            offers: Mutex::new(BTreeSet::new()),
            requests: Mutex::new(BTreeSet::new()),
            debounced_requests: Mutex::new(BTreeSet::new()),
            event_registrations: Mutex::new(BTreeSet::new()),
            subscriptions: Mutex::new(BTreeSet::new()),
            incoming_subscriptions: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn insert_offer(&self, offer: ServiceVersion) -> bool {
        self.offers.lock().unwrap().insert(offer)
    }

    pub fn remove_offer(&self, service: Service, instance: Instance) {
        self.offers
            .lock()
            .unwrap()
            .retain(|o| !(o.service == service && o.instance == instance));
    }

    pub fn has_offer(&self, service: Service, instance: Instance) -> bool {
        self.offers
            .lock()
            .unwrap()
            .iter()
            .any(|o| o.service == service && o.instance == instance)
    }

    pub fn offers(&self) -> Vec<ServiceVersion> {
        self.offers.lock().unwrap().iter().copied().collect()
    }

    pub fn insert_request(&self, request: ServiceVersion) -> bool {
        self.requests.lock().unwrap().insert(request)
    }

    pub fn has_request(&self, request: &ServiceVersion) -> bool {
        self.requests.lock().unwrap().contains(request)
    }

    pub fn merge_requests(&self, requests: impl IntoIterator<Item = ServiceVersion>) {
        self.requests.lock().unwrap().extend(requests);
    }

    pub fn remove_request(&self, service: Service, instance: Instance) {
        self.requests
            .lock()
            .unwrap()
            .retain(|r| !(r.service == service && r.instance == instance));
    }

    pub fn requests(&self) -> BTreeSet<ServiceVersion> {
        self.requests.lock().unwrap().clone()
    }

    pub fn insert_debounced_request(&self, request: ServiceVersion) -> bool {
        self.debounced_requests.lock().unwrap().insert(request)
    }

    /// Removes a not-yet-flushed request; true when it was still pending.
    pub fn remove_debounced_request(&self, service: Service, instance: Instance) -> bool {
        let mut debounced = self.debounced_requests.lock().unwrap();
        let before = debounced.len();
        debounced.retain(|r| !(r.service == service && r.instance == instance));
        debounced.len() != before
    }

    pub fn take_debounced_requests(&self) -> BTreeSet<ServiceVersion> {
        std::mem::take(&mut *self.debounced_requests.lock().unwrap())
    }

    pub fn has_debounced_requests(&self) -> bool {
        !self.debounced_requests.lock().unwrap().is_empty()
    }

    /// Records event-level intent; true when this registration is new.
    ///
    /// With the `compat` feature, a selective-event registration supersedes
    /// an earlier plain-event one for the same notifier and provider side:
    /// the latest registration wins, at most one event type remains per
    /// (service, instance, notifier, provider).
    pub fn insert_event_registration(&self, registration: EventRegistration) -> bool {
        let mut registrations = self.event_registrations.lock().unwrap();
        if registrations.contains(&registration) {
            return false;
        }

        #[cfg(feature = "compat")]
        {
            use crate::protocol::types::EventType;
            if registration.event_type == EventType::SelectiveEvent {
                let superseded: Vec<EventRegistration> = registrations
                    .iter()
                    .filter(|r| {
                        r.service == registration.service
                            && r.instance == registration.instance
                            && r.notifier == registration.notifier
                            && r.is_provided == registration.is_provided
                            && r.event_type == EventType::Event
                    })
                    .cloned()
                    .collect();
                for r in superseded {
                    registrations.remove(&r);
                }
            }
        }

        registrations.insert(registration)
    }

    pub fn remove_event_registration(
        &self,
        service: Service,
        instance: Instance,
        notifier: Event,
        is_provided: bool,
    ) {
        let mut registrations = self.event_registrations.lock().unwrap();
        let found = registrations
            .iter()
            .find(|r| {
                r.service == service
                    && r.instance == instance
                    && r.notifier == notifier
                    && r.is_provided == is_provided
            })
            .cloned();
        if let Some(r) = found {
            registrations.remove(&r);
        }
    }

    pub fn provided_event_registrations(&self) -> Vec<EventRegistration> {
        self.event_registrations
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.is_provided)
            .cloned()
            .collect()
    }

    pub fn insert_subscription(&self, subscription: SubscriptionIntent) -> bool {
        self.subscriptions.lock().unwrap().insert(subscription)
    }

    /// Removes pending subscriptions matching the key; `ANY_EVENTGROUP` and
    /// `ANY_EVENT` act as wildcards.
    pub fn remove_subscriptions(
        &self,
        service: Service,
        instance: Instance,
        eventgroup: Eventgroup,
        event: Event,
    ) {
        self.subscriptions.lock().unwrap().retain(|s| {
            !(s.service == service
                && s.instance == instance
                && (eventgroup == ANY_EVENTGROUP || s.eventgroup == eventgroup)
                && (event == ANY_EVENT || s.event == event))
        });
    }

    pub fn subscriptions_for(&self, service: Service, instance: Instance) -> Vec<SubscriptionIntent> {
        self.subscriptions
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.service == service && s.instance == instance)
            .cloned()
            .collect()
    }

    /// Parks a subscription from a peer whose client id the routing host has
    /// not announced yet.
    pub fn park_incoming_subscription(&self, client: ClientId, subscription: SubscriptionIntent) {
        self.incoming_subscriptions
            .lock()
            .unwrap()
            .entry(client)
            .or_default()
            .insert(subscription);
    }

    /// Hands out and forgets the parked subscriptions of every client in
    /// `known`, in one batch per routing-info frame.
    pub fn take_incoming_subscriptions(
        &self,
        known: &[ClientId],
    ) -> Vec<(ClientId, SubscriptionIntent)> {
        let mut incoming = self.incoming_subscriptions.lock().unwrap();
        let mut actions = Vec::new();
        for client in known {
            if let Some(parked) = incoming.remove(client) {
                for subscription in parked {
                    actions.push((*client, subscription));
                }
            }
        }
        actions
    }

    pub fn has_incoming_subscriptions(&self) -> bool {
        !self.incoming_subscriptions.lock().unwrap().is_empty()
    }
}
