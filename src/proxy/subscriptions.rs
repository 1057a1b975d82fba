//! The subscription engine: outbound subscribe/unsubscribe with replay
//! intent, the inbound accept/reject flow for local and remote subscribers,
//! ack/nack fan-out and remote-subscriber counting.

use std::sync::Arc;

use rustc_hash::FxHashSet;
use tracing::{error, info, warn};

use crate::protocol::command::{SubscribeData, SubscriptionReplyData, UnsubscribeData};
use crate::protocol::someip;
use crate::protocol::types::{
    ClientId, Event, Eventgroup, Filter, Instance, Major, Service, ANY_EVENT, ANY_MAJOR,
    PENDING_SUBSCRIPTION_ID, ROUTING_CLIENT,
};
use crate::protocol::{Command, CommandId, CommandKind};
use crate::proxy::events::SubscriptionState;
use crate::proxy::host::{SUBSCRIPTION_OK, SUBSCRIPTION_REJECTED};
use crate::proxy::intent::SubscriptionIntent;
use crate::proxy::proxy::{RoutingProxy, SendTarget};
use crate::proxy::security::SecClient;
use crate::proxy::state::RegistrationState;
use crate::transport::FrameOrigin;

impl RoutingProxy {
    /// Subscribes the application to an eventgroup (or a single event of it).
    /// If the target service is not there yet, or the proxy is not yet
    /// registered, the intent is recorded and replayed once both hold.
    pub async fn subscribe(
        &self,
        service: Service,
        instance: Instance,
        eventgroup: Eventgroup,
        major: Major,
        event: Event,
        filter: Option<Filter>,
    ) {
        let _registration = self.registration_lock.lock().await;
        if self.state.get() == RegistrationState::Registered
            && self.is_available(service, instance, major)
        {
            self.send_subscribe(service, instance, eventgroup, major, event, filter)
                .await;
        }
        self.intent.insert_subscription(SubscriptionIntent {
            service,
            instance,
            eventgroup,
            major,
            event,
            filter,
            sec_client: self.config().own_sec_client,
        });
        self.events.set_subscription_state(
            service,
            instance,
            eventgroup,
            event,
            SubscriptionState::Subscribing,
        );
    }

    pub(crate) async fn send_subscribe(
        &self,
        service: Service,
        instance: Instance,
        eventgroup: Eventgroup,
        major: Major,
        event: Event,
        filter: Option<Filter>,
    ) {
        let own = self.config().own_sec_client;
        if event == ANY_EVENT {
            if !self.is_subscribe_to_any_event_allowed(&own, service, instance, eventgroup) {
                warn!(
                    client = self.client(),
                    service, instance, eventgroup,
                    "not allowed to subscribe to any event of the eventgroup, skipping subscribe"
                );
                return;
            }
        } else if !self
            .policy_manager()
            .is_client_allowed_to_access_member(&own, service, instance, event)
        {
            warn!(
                client = self.client(),
                service, instance, event,
                "not allowed to subscribe to the event, skipping subscribe"
            );
            return;
        }

        let frame = Command::new(
            self.client(),
            CommandKind::Subscribe(SubscribeData {
                service,
                instance,
                eventgroup,
                major,
                event,
                pending_id: PENDING_SUBSCRIPTION_ID,
                filter,
            }),
        )
        .to_frame();

        let provider = self.find_local_client(service, instance);
        if provider != ROUTING_CLIENT {
            match self.endpoints.find_or_create_local(provider).await {
                Some(peer) => {
                    peer.send(&frame).await;
                }
                None => {
                    error!(
                        client = self.client(),
                        service, instance, event,
                        "no target available to send subscription"
                    );
                }
            }
        } else {
            self.send_via_sender(&frame).await;
        }
    }

    /// ANY_EVENT subscriptions are gated at eventgroup level: every known
    /// event of the group must be accessible.
    fn is_subscribe_to_any_event_allowed(
        &self,
        sec_client: &SecClient,
        service: Service,
        instance: Instance,
        eventgroup: Eventgroup,
    ) -> bool {
        self.events
            .eventgroup_events(service, instance, eventgroup)
            .iter()
            .all(|event| {
                self.policy_manager()
                    .is_client_allowed_to_access_member(sec_client, service, instance, *event)
            })
    }

    pub async fn unsubscribe(
        &self,
        service: Service,
        instance: Instance,
        eventgroup: Eventgroup,
        event: Event,
    ) {
        self.intent
            .remove_subscriptions(service, instance, eventgroup, event);

        let _registration = self.registration_lock.lock().await;
        if self.state.get() != RegistrationState::Registered {
            return;
        }

        let frame = Command::new(
            self.client(),
            CommandKind::Unsubscribe(UnsubscribeData {
                service,
                instance,
                eventgroup,
                major: ANY_MAJOR,
                event,
                pending_id: PENDING_SUBSCRIPTION_ID,
            }),
        )
        .to_frame();

        let provider = self.find_local_client(service, instance);
        let target = if provider != ROUTING_CLIENT {
            self.endpoints.find_local(provider).await
        } else {
            None
        };
        match target {
            Some(peer) => {
                peer.send(&frame).await;
            }
            None => {
                self.send_via_sender(&frame).await;
            }
        }
    }

    /// Replays recorded subscriptions for a service that just became
    /// available, with the major version the routing host announced.
    pub(crate) async fn send_pending_subscriptions(
        &self,
        service: Service,
        instance: Instance,
        major: Major,
    ) {
        for subscription in self.intent.subscriptions_for(service, instance) {
            self.send_subscribe(
                subscription.service,
                subscription.instance,
                subscription.eventgroup,
                major,
                subscription.event,
                subscription.filter,
            )
            .await;
        }
    }

    // --- inbound subscribe / unsubscribe --------------------------------------

    pub(crate) async fn on_inbound_subscribe(
        self: &Arc<Self>,
        client: ClientId,
        data: SubscribeData,
        origin: &FrameOrigin,
        is_from_routing: bool,
    ) {
        if data.pending_id != PENDING_SUBSCRIPTION_ID {
            // a remote subscriber, relayed by the routing host
            if self.intent.has_offer(data.service, data.instance) {
                let env = self.environment(client);
                let accepted = self
                    .application_host()
                    .on_subscription(
                        data.service,
                        data.instance,
                        data.eventgroup,
                        client,
                        origin.sec_client.as_ref(),
                        &env,
                        true,
                    )
                    .await;
                if accepted {
                    self.accept_remote_subscribe(client, &data).await;
                } else {
                    self.reject_remote_subscribe(client, &data).await;
                }
            } else {
                self.reject_remote_subscribe(client, &data).await;
            }
            return;
        }

        // a local peer subscribing directly
        if self.is_client_known(client) {
            if !is_from_routing {
                let Some(sec_client) = origin.sec_client.as_ref() else {
                    warn!(client, "local subscription without security info");
                    return;
                };
                if data.event == ANY_EVENT {
                    if !self.is_subscribe_to_any_event_allowed(
                        sec_client,
                        data.service,
                        data.instance,
                        data.eventgroup,
                    ) {
                        warn!(
                            client,
                            service = data.service,
                            instance = data.instance,
                            eventgroup = data.eventgroup,
                            "subscribe to any event violates the security policy, skipping"
                        );
                        return;
                    }
                } else if !self.policy_manager().is_client_allowed_to_access_member(
                    sec_client,
                    data.service,
                    data.instance,
                    data.event,
                ) {
                    warn!(
                        client,
                        service = data.service,
                        instance = data.instance,
                        event = data.event,
                        "subscribe violates the security policy, skipping"
                    );
                    return;
                }
            } else if !self.config().remote_access_allowed {
                warn!(
                    client,
                    service = data.service,
                    instance = data.instance,
                    event = data.event,
                    "routing manager is not allowed to subscribe here, skipping"
                );
                return;
            }

            self.endpoints.find_or_create_local(client).await;
            let subscription = SubscriptionIntent {
                service: data.service,
                instance: data.instance,
                eventgroup: data.eventgroup,
                major: data.major,
                event: data.event,
                filter: data.filter,
                sec_client: origin
                    .sec_client
                    .unwrap_or(self.config().own_sec_client),
            };
            self.process_incoming_subscription(client, subscription).await;
        } else {
            // not yet announced by the routing host: park until it is
            match origin.sec_client {
                Some(sec_client) => {
                    self.intent.park_incoming_subscription(
                        client,
                        SubscriptionIntent {
                            service: data.service,
                            instance: data.instance,
                            eventgroup: data.eventgroup,
                            major: data.major,
                            event: data.event,
                            filter: data.filter,
                            sec_client,
                        },
                    );
                }
                None => warn!(client, "local subscription without security info"),
            }
        }

        info!(
            client,
            service = data.service,
            instance = data.instance,
            eventgroup = data.eventgroup,
            event = data.event,
            major = data.major,
            "subscribe"
        );
    }

    /// Accept/reject flow for a local peer whose client id is known, also
    /// run for parked subscriptions once their peer appears in routing info.
    pub(crate) async fn process_incoming_subscription(
        &self,
        client: ClientId,
        subscription: SubscriptionIntent,
    ) {
        if !self.intent.has_offer(subscription.service, subscription.instance) {
            self.send_subscribe_nack(
                client,
                subscription.service,
                subscription.instance,
                subscription.eventgroup,
                subscription.event,
                PENDING_SUBSCRIPTION_ID,
            )
            .await;
            return;
        }

        let env = self.environment(client);
        let accepted = self
            .application_host()
            .on_subscription(
                subscription.service,
                subscription.instance,
                subscription.eventgroup,
                client,
                Some(&subscription.sec_client),
                &env,
                true,
            )
            .await;

        if accepted {
            self.send_subscribe_ack(
                client,
                subscription.service,
                subscription.instance,
                subscription.eventgroup,
                subscription.event,
                PENDING_SUBSCRIPTION_ID,
            )
            .await;
            self.events.add_subscriber(
                subscription.service,
                subscription.instance,
                subscription.eventgroup,
                subscription.event,
                client,
            );
        } else {
            self.send_subscribe_nack(
                client,
                subscription.service,
                subscription.instance,
                subscription.eventgroup,
                subscription.event,
                PENDING_SUBSCRIPTION_ID,
            )
            .await;
        }
    }

    /// The continuation of an accepted remote subscription: acknowledge,
    /// record the host as subscriber, bring the newcomer up to date with
    /// cached field values, and count it.
    async fn accept_remote_subscribe(&self, client: ClientId, data: &SubscribeData) {
        self.send_subscribe_ack(
            client,
            data.service,
            data.instance,
            data.eventgroup,
            data.event,
            data.pending_id,
        )
        .await;

        let (inserted, already_subscribed) = self.events.add_subscriber(
            data.service,
            data.instance,
            data.eventgroup,
            data.event,
            ROUTING_CLIENT,
        );
        if inserted {
            self.notify_remote_initially(
                data.service,
                data.instance,
                data.eventgroup,
                &already_subscribed,
            )
            .await;
        }
        let count =
            self.remote_subscriber_count(data.service, data.instance, data.eventgroup, true);
        info!(
            client,
            service = data.service,
            instance = data.instance,
            eventgroup = data.eventgroup,
            event = data.event,
            count,
            "remote subscription accepted"
        );
    }

    async fn reject_remote_subscribe(&self, client: ClientId, data: &SubscribeData) {
        self.send_subscribe_nack(
            client,
            data.service,
            data.instance,
            data.eventgroup,
            data.event,
            data.pending_id,
        )
        .await;
        info!(
            client,
            service = data.service,
            instance = data.instance,
            eventgroup = data.eventgroup,
            event = data.event,
            "remote subscription not accepted"
        );
    }

    /// A fresh remote subscriber receives the current value of every field
    /// in the eventgroup it was not already subscribed to.
    async fn notify_remote_initially(
        &self,
        service: Service,
        instance: Instance,
        eventgroup: Eventgroup,
        exclude: &FxHashSet<Event>,
    ) {
        let major = self
            .intent
            .offers()
            .iter()
            .find(|o| o.service == service && o.instance == instance)
            .map(|o| o.major)
            .unwrap_or(0);

        for (event, payload) in self
            .events
            .cached_payloads(service, instance, eventgroup, exclude)
        {
            let message = someip::build_notification(service, instance, event, major, &payload);
            self.send_local(
                SendTarget::Host,
                ROUTING_CLIENT,
                &message,
                instance,
                false,
                CommandId::Notify,
                0,
            )
            .await;
        }
    }

    pub(crate) async fn on_inbound_unsubscribe(
        &self,
        client: ClientId,
        data: UnsubscribeData,
        origin: &FrameOrigin,
        is_expire: bool,
    ) {
        let env = self.environment(client);
        // the application only learns about the withdrawal, it has no veto
        let _ = self
            .application_host()
            .on_subscription(
                data.service,
                data.instance,
                data.eventgroup,
                client,
                origin.sec_client.as_ref(),
                &env,
                false,
            )
            .await;

        let mut remote_count = 0;
        if data.pending_id == PENDING_SUBSCRIPTION_ID {
            // local subscriber withdraws
            self.events.remove_subscriber(
                data.service,
                data.instance,
                data.eventgroup,
                data.event,
                client,
            );
        } else {
            // remote subscribers: the local subscription goes only when the
            // last one is gone
            remote_count =
                self.remote_subscriber_count(data.service, data.instance, data.eventgroup, false);
            if remote_count == 0 {
                self.events.remove_subscriber(
                    data.service,
                    data.instance,
                    data.eventgroup,
                    data.event,
                    ROUTING_CLIENT,
                );
            }
            if !is_expire {
                self.send_unsubscribe_ack(
                    data.service,
                    data.instance,
                    data.eventgroup,
                    data.pending_id,
                )
                .await;
            }
        }

        info!(
            client,
            service = data.service,
            instance = data.instance,
            eventgroup = data.eventgroup,
            event = data.event,
            remote = data.pending_id != PENDING_SUBSCRIPTION_ID,
            remote_count,
            expired = is_expire,
            "unsubscribe"
        );
    }

    // --- acks and nacks -------------------------------------------------------

    pub(crate) async fn on_subscribe_ack(&self, reply: SubscriptionReplyData) {
        self.events.set_subscription_state(
            reply.service,
            reply.instance,
            reply.eventgroup,
            reply.event,
            SubscriptionState::Subscribed,
        );
        if reply.event == ANY_EVENT {
            for event in
                self.events
                    .eventgroup_events(reply.service, reply.instance, reply.eventgroup)
            {
                self.application_host()
                    .on_subscription_status(
                        reply.service,
                        reply.instance,
                        reply.eventgroup,
                        event,
                        SUBSCRIPTION_OK,
                    )
                    .await;
            }
        } else {
            self.application_host()
                .on_subscription_status(
                    reply.service,
                    reply.instance,
                    reply.eventgroup,
                    reply.event,
                    SUBSCRIPTION_OK,
                )
                .await;
        }
    }

    pub(crate) async fn on_subscribe_nack(&self, reply: SubscriptionReplyData) {
        self.events.set_subscription_state(
            reply.service,
            reply.instance,
            reply.eventgroup,
            reply.event,
            SubscriptionState::SubscribeFailed,
        );
        if reply.event == ANY_EVENT {
            for event in
                self.events
                    .eventgroup_events(reply.service, reply.instance, reply.eventgroup)
            {
                self.application_host()
                    .on_subscription_status(
                        reply.service,
                        reply.instance,
                        reply.eventgroup,
                        event,
                        SUBSCRIPTION_REJECTED,
                    )
                    .await;
            }
        } else {
            self.application_host()
                .on_subscription_status(
                    reply.service,
                    reply.instance,
                    reply.eventgroup,
                    reply.event,
                    SUBSCRIPTION_REJECTED,
                )
                .await;
        }
    }

    async fn send_subscribe_ack(
        &self,
        subscriber: ClientId,
        service: Service,
        instance: Instance,
        eventgroup: Eventgroup,
        event: Event,
        pending_id: u32,
    ) {
        let frame = Command::new(
            self.client(),
            CommandKind::SubscribeAck(SubscriptionReplyData {
                service,
                instance,
                eventgroup,
                subscriber,
                event,
                pending_id,
            }),
        )
        .to_frame();
        self.send_subscription_reply(subscriber, pending_id, frame).await;
    }

    async fn send_subscribe_nack(
        &self,
        subscriber: ClientId,
        service: Service,
        instance: Instance,
        eventgroup: Eventgroup,
        event: Event,
        pending_id: u32,
    ) {
        let frame = Command::new(
            self.client(),
            CommandKind::SubscribeNack(SubscriptionReplyData {
                service,
                instance,
                eventgroup,
                subscriber,
                event,
                pending_id,
            }),
        )
        .to_frame();
        self.send_subscription_reply(subscriber, pending_id, frame).await;
    }

    /// Local subscribers get their verdict directly, everything else goes
    /// through the routing host.
    async fn send_subscription_reply(
        &self,
        subscriber: ClientId,
        pending_id: u32,
        frame: bytes::BytesMut,
    ) {
        if subscriber != ROUTING_CLIENT && pending_id == PENDING_SUBSCRIPTION_ID {
            if let Some(peer) = self.endpoints.find_local(subscriber).await {
                if peer.send(&frame).await {
                    return;
                }
            }
        }
        self.send_via_sender(&frame).await;
    }

    async fn send_unsubscribe_ack(
        &self,
        service: Service,
        instance: Instance,
        eventgroup: Eventgroup,
        pending_id: u32,
    ) {
        let frame = Command::new(
            self.client(),
            CommandKind::UnsubscribeAck {
                service,
                instance,
                eventgroup,
                pending_id,
            },
        )
        .to_frame();
        self.send_via_sender(&frame).await;
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use crate::protocol::someip::{build_notification, MessageView};
    use crate::protocol::types::{
        EventType, Reliability, RoutingEntry, RoutingEntryType, ServiceVersion,
    };
    use crate::test_util::{
        complete_registration, expect_assign, test_config, AllowAllPolicy, FakeRoutingHost,
        HostEvent, RecordingHost,
    };

    use super::*;

    fn proxy_with_host() -> (Arc<RoutingProxy>, Arc<RecordingHost>) {
        let app = RecordingHost::new();
        let proxy = crate::proxy::proxy::RoutingProxy::new(
            Arc::new(test_config()),
            app.clone(),
            Arc::new(AllowAllPolicy),
        );
        (proxy, app)
    }

    fn host_origin() -> FrameOrigin {
        FrameOrigin {
            bound_client: ROUTING_CLIENT,
            sec_client: Some(SecClient::Uds { uid: 0, gid: 0 }),
            remote: None,
        }
    }

    fn peer_origin(bound_client: ClientId) -> FrameOrigin {
        FrameOrigin {
            bound_client,
            sec_client: Some(SecClient::Uds { uid: 1000, gid: 1000 }),
            remote: None,
        }
    }

    async fn register_consumer_event(
        proxy: &Arc<RoutingProxy>,
        service: Service,
        instance: Instance,
        event: Event,
        eventgroup: Eventgroup,
    ) {
        proxy
            .register_event(
                service,
                instance,
                event,
                BTreeSet::from_iter([eventgroup]),
                EventType::Field,
                Reliability::Unreliable,
                Duration::ZERO,
                false,
            )
            .await;
    }

    #[tokio::test]
    async fn test_subscribe_records_intent_and_tracks_state() {
        let (proxy, app) = proxy_with_host();
        register_consumer_event(&proxy, 0x1111, 0x2222, 0x8001, 0x10).await;

        proxy.subscribe(0x1111, 0x2222, 0x10, 1, 0x8001, None).await;
        assert_eq!(
            proxy.events.subscription_state(0x1111, 0x2222, 0x8001),
            Some(crate::proxy::events::SubscriptionState::Subscribing)
        );

        let ack = Command::new(
            ROUTING_CLIENT,
            CommandKind::SubscribeAck(SubscriptionReplyData {
                service: 0x1111,
                instance: 0x2222,
                eventgroup: 0x10,
                subscriber: 0,
                event: 0x8001,
                pending_id: PENDING_SUBSCRIPTION_ID,
            }),
        )
        .to_frame();
        proxy.handle_frame(&ack, &host_origin()).await;

        assert_eq!(
            proxy.events.subscription_state(0x1111, 0x2222, 0x8001),
            Some(crate::proxy::events::SubscriptionState::Subscribed)
        );
        assert!(app.events().contains(&HostEvent::SubscriptionStatus(
            0x1111,
            0x2222,
            0x10,
            0x8001,
            crate::proxy::host::SUBSCRIPTION_OK
        )));
    }

    #[tokio::test]
    async fn test_nack_fans_out_over_the_eventgroup() {
        let (proxy, app) = proxy_with_host();
        register_consumer_event(&proxy, 0x1111, 0x2222, 0x8001, 0x10).await;
        register_consumer_event(&proxy, 0x1111, 0x2222, 0x8002, 0x10).await;

        proxy.subscribe(0x1111, 0x2222, 0x10, 1, ANY_EVENT, None).await;

        let nack = Command::new(
            ROUTING_CLIENT,
            CommandKind::SubscribeNack(SubscriptionReplyData {
                service: 0x1111,
                instance: 0x2222,
                eventgroup: 0x10,
                subscriber: 0,
                event: ANY_EVENT,
                pending_id: PENDING_SUBSCRIPTION_ID,
            }),
        )
        .to_frame();
        proxy.handle_frame(&nack, &host_origin()).await;

        let statuses: Vec<_> = app
            .events()
            .into_iter()
            .filter(|e| {
                matches!(
                    e,
                    HostEvent::SubscriptionStatus(
                        _,
                        _,
                        _,
                        _,
                        crate::proxy::host::SUBSCRIPTION_REJECTED
                    )
                )
            })
            .collect();
        assert_eq!(statuses.len(), 2);
        assert_eq!(
            proxy.events.subscription_state(0x1111, 0x2222, 0x8001),
            Some(crate::proxy::events::SubscriptionState::SubscribeFailed)
        );
    }

    #[tokio::test]
    async fn test_parked_subscription_replayed_exactly_once() {
        let (proxy, app) = proxy_with_host();
        proxy.offer_service(0x1111, 0x2222, 1, 0).await;

        // a subscribe from a peer the routing host has not announced yet
        let subscribe = Command::new(
            0x4444,
            CommandKind::Subscribe(SubscribeData {
                service: 0x1111,
                instance: 0x2222,
                eventgroup: 0x10,
                major: 1,
                event: 0x8001,
                pending_id: PENDING_SUBSCRIPTION_ID,
                filter: None,
            }),
        )
        .to_frame();
        proxy.handle_frame(&subscribe, &peer_origin(0x4444)).await;
        assert!(app.events().iter().all(|e| !matches!(e, HostEvent::Subscription(..))));

        // the peer becomes known through routing info
        let announce = Command::new(
            ROUTING_CLIENT,
            CommandKind::RoutingInfo {
                entries: vec![RoutingEntry {
                    entry_type: RoutingEntryType::AddServiceInstance,
                    client: 0x4444,
                    address: None,
                    services: vec![ServiceVersion {
                        service: 0x7777,
                        instance: 1,
                        major: 1,
                        minor: 0,
                    }],
                }],
            },
        )
        .to_frame();
        proxy.handle_frame(&announce, &host_origin()).await;

        let subscriptions = |events: Vec<HostEvent>| {
            events
                .into_iter()
                .filter(|e| matches!(e, HostEvent::Subscription(0x1111, 0x2222, 0x10, 0x4444, true)))
                .count()
        };
        assert_eq!(subscriptions(app.events()), 1);

        // a second routing-info pass must not replay it again
        proxy.handle_frame(&announce, &host_origin()).await;
        assert_eq!(subscriptions(app.events()), 1);
    }

    #[tokio::test]
    async fn test_rejected_incoming_subscription_adds_no_subscriber() {
        let (proxy, app) = proxy_with_host();
        proxy.offer_service(0x1111, 0x2222, 1, 0).await;
        app.accept_subscriptions.store(false, Ordering::Relaxed);

        let subscribe = Command::new(
            0x7777,
            CommandKind::Subscribe(SubscribeData {
                service: 0x1111,
                instance: 0x2222,
                eventgroup: 0x10,
                major: 1,
                event: ANY_EVENT,
                pending_id: 7,
            filter: None,
            }),
        )
        .to_frame();
        proxy.handle_frame(&subscribe, &host_origin()).await;

        assert!(app.events().contains(&HostEvent::Subscription(0x1111, 0x2222, 0x10, 0x7777, true)));
        // nothing was counted for the rejected subscriber
        assert_eq!(proxy.remote_subscriber_count(0x1111, 0x2222, 0x10, false), 0);
    }

    /// Registered provider of a field event 0xAAAA in eventgroup 0x10 with a
    /// published value, plus the host link to script subscribers with.
    async fn registered_field_provider() -> (
        Arc<RoutingProxy>,
        Arc<RecordingHost>,
        FakeRoutingHost,
        crate::test_util::HostLink,
    ) {
        let config = Arc::new(test_config());
        let fake_host = FakeRoutingHost::bind(&config);
        let app = RecordingHost::new();
        let proxy = crate::proxy::proxy::RoutingProxy::new(
            config,
            app.clone(),
            Arc::new(AllowAllPolicy),
        );

        proxy.offer_service(0x1111, 0x2222, 1, 0).await;
        proxy
            .register_event(
                0x1111,
                0x2222,
                0xAAAA,
                BTreeSet::from_iter([0x10]),
                EventType::Field,
                Reliability::Unreliable,
                Duration::ZERO,
                true,
            )
            .await;

        proxy.start().await.unwrap();
        let mut link = fake_host.accept().await;
        expect_assign(&mut link).await;
        complete_registration(&mut link).await;
        // replay of the offer and the provided event registration
        assert!(matches!(link.recv().await.kind, CommandKind::OfferService(_)));
        assert!(matches!(link.recv().await.kind, CommandKind::RegisterEvent { .. }));
        assert!(
            app.wait_for_state(
                crate::proxy::host::ApplicationState::Registered,
                Duration::from_secs(5)
            )
            .await
        );

        // publish the current field value; nobody subscribed, stays local
        let notification = build_notification(0x1111, 0x2222, 0xAAAA, 1, &[0x01, 0x02]);
        assert!(!proxy.send(ROUTING_CLIENT, &notification, 0x2222, false, 0).await);

        (proxy, app, fake_host, link)
    }

    #[tokio::test]
    async fn test_remote_subscribe_acks_then_notifies_initially() {
        let (proxy, app, _fake_host, mut link) = registered_field_provider().await;

        link.send_as(
            0x7777,
            CommandKind::Subscribe(SubscribeData {
                service: 0x1111,
                instance: 0x2222,
                eventgroup: 0x10,
                major: 1,
                event: ANY_EVENT,
                pending_id: 7,
                filter: None,
            }),
        )
        .await;

        // the ack must precede the initial notification
        match link.recv().await.kind {
            CommandKind::SubscribeAck(reply) => {
                assert_eq!(reply.subscriber, 0x7777);
                assert_eq!(reply.pending_id, 7);
            }
            other => panic!("expected SubscribeAck, got {:?}", other.id()),
        }
        let notify = link.recv().await;
        assert_eq!(notify.client, ROUTING_CLIENT);
        match notify.kind {
            CommandKind::Notify(data) => {
                assert_eq!(data.instance, 0x2222);
                let view = MessageView::new(&data.message).unwrap();
                assert_eq!(view.method(), 0xAAAA);
                assert_eq!(view.payload(), &[0x01, 0x02]);
            }
            other => panic!("expected Notify, got {:?}", other.id()),
        }

        assert!(app.events().contains(&HostEvent::Subscription(0x1111, 0x2222, 0x10, 0x7777, true)));

        // with a remote subscriber present, notifications now reach the host
        let notification = build_notification(0x1111, 0x2222, 0xAAAA, 1, &[0x03]);
        assert!(proxy.send(ROUTING_CLIENT, &notification, 0x2222, false, 0).await);
        assert!(matches!(link.recv().await.kind, CommandKind::Notify(_)));
    }

    #[tokio::test]
    async fn test_remote_unsubscribe_releases_at_count_zero() {
        let (proxy, _app, _fake_host, mut link) = registered_field_provider().await;

        link.send_as(
            0x7777,
            CommandKind::Subscribe(SubscribeData {
                service: 0x1111,
                instance: 0x2222,
                eventgroup: 0x10,
                major: 1,
                event: ANY_EVENT,
                pending_id: 7,
                filter: None,
            }),
        )
        .await;
        assert!(matches!(link.recv().await.kind, CommandKind::SubscribeAck(_)));
        assert!(matches!(link.recv().await.kind, CommandKind::Notify(_)));

        link.send_as(
            0x7777,
            CommandKind::Unsubscribe(UnsubscribeData {
                service: 0x1111,
                instance: 0x2222,
                eventgroup: 0x10,
                major: ANY_MAJOR,
                event: ANY_EVENT,
                pending_id: 7,
            }),
        )
        .await;

        match link.recv().await.kind {
            CommandKind::UnsubscribeAck { pending_id, .. } => assert_eq!(pending_id, 7),
            other => panic!("expected UnsubscribeAck, got {:?}", other.id()),
        }

        // the last remote subscriber is gone: notifications stay local again
        let notification = build_notification(0x1111, 0x2222, 0xAAAA, 1, &[0x04]);
        assert!(!proxy.send(ROUTING_CLIENT, &notification, 0x2222, false, 0).await);
        link.recv_none(Duration::from_millis(200)).await;
    }
}
