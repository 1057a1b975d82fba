use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::protocol::someip;
use crate::protocol::someip::MessageView;
use crate::protocol::types::{
    ClientId, Event, Eventgroup, EventRegistration, EventType, Instance, Major, Minor,
    OfferType, Reliability, Service, ServiceVersion, ANY_EVENT, ANY_EVENTGROUP, ANY_MAJOR,
    ROUTING_CLIENT, UNSET_CLIENT,
};
use crate::protocol::{Command, CommandId, CommandKind};
use crate::proxy::config::ProxyConfig;
use crate::proxy::events::EventRegistry;
use crate::proxy::host::{ApplicationHost, ApplicationState};
use crate::proxy::intent::IntentRegistry;
use crate::proxy::security::PolicyManager;
use crate::proxy::state::{RegistrationState, StateTracker};
use crate::transport::endpoints::LocalEndpoint;
use crate::transport::{
    ConnectTarget, EndpointManager, FrameHandler, FrameOrigin, ProxyReceiver, RoutingConnection,
};

/// bounded wait after ASSIGN_CLIENT and after REGISTER_APPLICATION
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Default)]
struct ServiceTable {
    /// (service, instance) -> (major, minor, owning client)
    entries: FxHashMap<(Service, Instance), (Major, Minor, ClientId)>,
    /// previous owners of services that were deleted
    history: FxHashMap<(Service, Instance), FxHashSet<ClientId>>,
}

struct KeepaliveState {
    active: bool,
    is_alive: bool,
    generation: u64,
}

struct DebounceState {
    running: bool,
    generation: u64,
}

pub(crate) enum SendTarget {
    Peer(Arc<LocalEndpoint>),
    Host,
}

/// The client-side routing proxy: registers the application with the routing
/// host, keeps the canonical record of its intent, routes messages, and
/// replays everything after a routing-host crash.
///
/// Lock order, outermost first: `stop_lock`, `registration_lock`, the intent
/// sets, `sender`, `receiver`, `known_clients`, `remote_subscriber_counts`,
/// `keepalive`. No path may take an earlier lock while holding a later one,
/// and no application-host callback runs under `registration_lock`.
pub struct RoutingProxy {
    config: Arc<ProxyConfig>,
    host: Arc<dyn ApplicationHost>,
    policy: Arc<dyn PolicyManager>,

    client: AtomicU16,
    is_started: AtomicBool,
    is_connected: AtomicBool,

    pub(crate) state: StateTracker,
    stop_lock: Mutex<()>,
    pub(crate) registration_lock: Mutex<()>,

    pub(crate) intent: IntentRegistry,
    pub(crate) events: EventRegistry,

    sender: Mutex<Option<Arc<RoutingConnection>>>,
    receiver: Mutex<Option<Arc<ProxyReceiver>>>,
    pub(crate) endpoints: EndpointManager,

    known_clients: std::sync::Mutex<FxHashMap<ClientId, String>>,
    local_services: std::sync::Mutex<ServiceTable>,
    remote_subscriber_counts: std::sync::Mutex<FxHashMap<(Service, Instance, Eventgroup), u32>>,

    keepalive: std::sync::Mutex<KeepaliveState>,
    registration_timer: std::sync::Mutex<u64>,
    debounce: std::sync::Mutex<DebounceState>,
}

impl RoutingProxy {
    pub fn new(
        config: Arc<ProxyConfig>,
        host: Arc<dyn ApplicationHost>,
        policy: Arc<dyn PolicyManager>,
    ) -> Arc<RoutingProxy> {
        let endpoints = EndpointManager::new(config.clone());
        Arc::new(RoutingProxy {
            config,
            host,
            policy,
            client: AtomicU16::new(UNSET_CLIENT),
            is_started: AtomicBool::new(false),
            is_connected: AtomicBool::new(false),
            state: StateTracker::new(),
            stop_lock: Mutex::new(()),
            registration_lock: Mutex::new(()),
            intent: IntentRegistry::new(),
            events: EventRegistry::new(),
            sender: Mutex::new(None),
            receiver: Mutex::new(None),
            endpoints,
            known_clients: std::sync::Mutex::new(FxHashMap::default()),
            local_services: std::sync::Mutex::new(ServiceTable::default()),
            remote_subscriber_counts: std::sync::Mutex::new(FxHashMap::default()),
            keepalive: std::sync::Mutex::new(KeepaliveState {
                active: false,
                is_alive: false,
                generation: 0,
            }),
            registration_timer: std::sync::Mutex::new(0),
            debounce: std::sync::Mutex::new(DebounceState {
                running: false,
                generation: 0,
            }),
        })
    }

    pub fn client(&self) -> ClientId {
        self.client.load(Ordering::Acquire)
    }

    pub fn state(&self) -> RegistrationState {
        self.state.get()
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub(crate) fn application_host(&self) -> &Arc<dyn ApplicationHost> {
        &self.host
    }

    pub(crate) fn policy_manager(&self) -> &Arc<dyn PolicyManager> {
        &self.policy
    }

    fn handler(self: &Arc<Self>) -> Arc<dyn FrameHandler> {
        Arc::new(ProxyHandler {
            proxy: Arc::downgrade(self),
        })
    }

    fn sender_target(&self) -> ConnectTarget {
        if self.config.local_routing {
            ConnectTarget::Unix(self.config.rendezvous_path(self.config.routing_host_id))
        } else {
            ConnectTarget::Tcp(std::net::SocketAddr::new(
                self.config.routing_host_address,
                self.config.routing_host_port,
            ))
        }
    }

    /// Connects to the routing host and starts the assignment handshake. For
    /// non-local routing the peer server is bound here; with local routing it
    /// can only be bound once a client id is assigned, since the rendezvous
    /// path embeds it.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        self.is_started.store(true, Ordering::Release);

        if !self.config.local_routing {
            let mut receiver = self.receiver.lock().await;
            if receiver.is_none() {
                let bound = ProxyReceiver::bind_net(
                    std::net::SocketAddr::new(
                        std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
                        0,
                    ),
                    self.config.max_message_size,
                )
                .await?;
                bound.start(self.handler());
                *receiver = Some(bound);
            }
        }

        let mut sender = self.sender.lock().await;
        if sender.is_none() {
            let connection = RoutingConnection::new(
                self.sender_target(),
                self.config.routing_host_id,
                self.config.max_message_size,
            );
            connection.start(self.handler());
            *sender = Some(connection);
        }
        Ok(())
    }

    /// Deregisters and tears the transport down. Waits bounded intervals for
    /// an in-flight registration to settle and for the host to confirm the
    /// deregistration; afterwards no further frame leaves this proxy.
    pub async fn stop(&self) {
        if self.state.get() == RegistrationState::Registering {
            self.cancel_registration_watchdog();
        }
        self.cancel_keepalive();

        let timeout = self.config.shutdown_timeout;
        if self.state.get() == RegistrationState::Registering
            && !self
                .state
                .wait_to_leave(RegistrationState::Registering, timeout)
                .await
        {
            warn!(client = self.client(), "registering timeout on stop");
        }

        if self.state.get() == RegistrationState::Registered {
            self.deregister_application().await;
            if !self
                .state
                .wait_to_leave(RegistrationState::Registered, timeout)
                .await
            {
                warn!(client = self.client(), "couldn't deregister application - timeout");
            }
        }
        self.is_started.store(false, Ordering::Release);

        {
            let mut debounce = self.debounce.lock().unwrap();
            debounce.generation += 1;
            debounce.running = false;
        }

        {
            let mut receiver = self.receiver.lock().await;
            if let Some(r) = receiver.take() {
                r.stop();
            }
        }
        {
            let mut sender = self.sender.lock().await;
            if let Some(s) = sender.take() {
                s.stop().await;
            }
        }

        for client in self.endpoints.connected_clients().await {
            if client != ROUTING_CLIENT {
                self.endpoints.remove_local(client).await;
            }
        }
    }

    // --- connection lifecycle -------------------------------------------------

    pub(crate) async fn on_sender_connect(self: &Arc<Self>) {
        self.is_connected.store(true, Ordering::Release);
        {
            let sender = self.sender.lock().await;
            if let Some(s) = sender.as_ref() {
                self.host.set_sec_client_port(s.local_port());
            }
        }
        self.assign_client().await;
    }

    pub(crate) async fn on_sender_disconnect(&self) {
        self.is_connected.store(false, Ordering::Release);
        self.cancel_keepalive();
        warn!(client = self.client(), "lost routing host, resetting to deregistered");
        self.state.set(RegistrationState::Deregistered);
        self.host.on_state(ApplicationState::Deregistered).await;
    }

    async fn assign_client(self: &Arc<Self>) {
        if self.state.get() != RegistrationState::Deregistered {
            warn!(
                client = self.client(),
                state = ?self.state.get(),
                "ignoring client assignment outside deregistered state"
            );
            return;
        }
        info!(client = self.client(), name = %self.host.name(), "requesting client assignment");

        let frame = Command::new(
            self.client(),
            CommandKind::AssignClient {
                name: self.host.name(),
            },
        )
        .to_frame();

        if !self.is_connected.load(Ordering::Acquire) {
            warn!("not connected, ignoring client assignment");
            return;
        }
        {
            let sender = self.sender.lock().await;
            let Some(sender) = sender.as_ref() else {
                warn!("sender not initialized, ignoring client assignment");
                return;
            };
            self.state.set(RegistrationState::Assigning);
            sender.send(&frame).await;
        }
        self.arm_registration_watchdog();
    }

    pub(crate) async fn on_client_assign_ack(self: &Arc<Self>, assigned: ClientId) {
        if self.state.get() != RegistrationState::Assigning {
            warn!(
                client = self.client(),
                assigned, "received a client identifier outside assignment, ignoring"
            );
            return;
        }
        if assigned == UNSET_CLIENT {
            error!(name = %self.host.name(), "routing host answered with an unset client id");
            return;
        }

        self.state.set(RegistrationState::Assigned);
        self.cancel_registration_watchdog();
        self.client.store(assigned, Ordering::Release);
        self.host.set_client(assigned);

        if !self.is_started.load(Ordering::Acquire) {
            warn!(client = assigned, "not started, discarding assignment");
            return;
        }

        if self.init_receiver().await {
            info!(
                client = assigned,
                name = %self.host.name(),
                "connected to routing host, registering"
            );
            self.register_application().await;
        } else {
            warn!(client = assigned, "receiver not started, restarting");
            self.state.set(RegistrationState::Deregistered);
            self.host.set_client(UNSET_CLIENT);
            let sender = self.sender.lock().await;
            if let Some(s) = sender.as_ref() {
                s.restart().await;
            }
        }
    }

    /// Binds the peer server once the client id is known. Non-local receivers
    /// are already bound at `start`, their port does not depend on the id.
    async fn init_receiver(self: &Arc<Self>) -> bool {
        let client = self.client();
        self.policy
            .store_client_to_sec_client_mapping(client, &self.config.own_sec_client);

        let mut receiver = self.receiver.lock().await;
        if receiver.is_some() {
            return true;
        }
        if !self.config.local_routing {
            return false;
        }
        match ProxyReceiver::bind_local(
            self.config.rendezvous_path(client),
            self.config.max_message_size,
        ) {
            Ok(bound) => {
                bound.start(self.handler());
                *receiver = Some(bound);
                true
            }
            Err(e) => {
                error!(client, "binding rendezvous socket failed: {}", e);
                false
            }
        }
    }

    async fn register_application(self: &Arc<Self>) {
        let port = {
            let receiver = self.receiver.lock().await;
            match receiver.as_ref() {
                Some(r) => r.local_port(),
                None => {
                    error!("cannot register, local server endpoint does not exist");
                    return;
                }
            }
        };
        if self.config.local_routing {
            info!(
                client = self.client(),
                network = %self.config.network,
                "registering to routing manager"
            );
        } else {
            info!(
                client = self.client(),
                address = %self.config.routing_host_address,
                port = self.config.routing_host_port,
                "registering to routing manager"
            );
        }

        let register = Command::new(self.client(), CommandKind::RegisterApplication { port })
            .to_frame();
        let config_frame = Command::new(
            self.client(),
            CommandKind::Config {
                entries: BTreeMap::from_iter([(
                    "hostname".to_string(),
                    self.config.hostname.clone(),
                )]),
            },
        )
        .to_frame();

        if !self.is_connected.load(Ordering::Acquire) {
            return;
        }
        {
            let sender = self.sender.lock().await;
            let Some(sender) = sender.as_ref() else {
                return;
            };
            self.state.set(RegistrationState::Registering);
            // registration and hostname announcement must not be interleaved
            sender.send_many(&[&register, &config_frame]).await;
        }
        self.arm_registration_watchdog();
    }

    pub(crate) async fn deregister_application(&self) {
        let frame = Command::new(self.client(), CommandKind::DeregisterApplication).to_frame();
        if self.is_connected.load(Ordering::Acquire) {
            self.send_via_sender(&frame).await;
        }
    }

    pub(crate) async fn send_registered_ack(&self) -> bool {
        let frame = Command::new(self.client(), CommandKind::RegisteredAck).to_frame();
        if !self.send_via_sender(&frame).await {
            error!(client = self.client(), "failed sending registered ack");
            return false;
        }
        true
    }

    /// Replays the application's whole intent: offers first, then requests,
    /// then provided event registrations. Runs on every transition into
    /// `Registered`, before the application host learns about it.
    pub(crate) async fn send_pending_commands(&self) -> bool {
        for offer in self.intent.offers() {
            if !self.send_offer_service(offer).await {
                return false;
            }
        }
        if !self.send_request_services(&self.intent.requests()).await {
            return false;
        }
        self.send_pending_event_registrations().await
    }

    // --- offers, requests, events --------------------------------------------

    pub async fn offer_service(
        &self,
        service: Service,
        instance: Instance,
        major: Major,
        minor: Minor,
    ) {
        let offer = ServiceVersion {
            service,
            instance,
            major,
            minor,
        };
        let _registration = self.registration_lock.lock().await;
        let is_first = self.intent.insert_offer(offer);
        if is_first && self.state.get() == RegistrationState::Registered {
            self.send_offer_service(offer).await;
        }
    }

    async fn send_offer_service(&self, offer: ServiceVersion) -> bool {
        let frame = Command::new(self.client(), CommandKind::OfferService(offer)).to_frame();
        if self.send_via_sender(&frame).await {
            true
        } else {
            error!(
                client = self.client(),
                service = offer.service,
                instance = offer.instance,
                "failure offering service"
            );
            false
        }
    }

    pub async fn stop_offer_service(
        &self,
        service: Service,
        instance: Instance,
        major: Major,
        minor: Minor,
    ) {
        {
            // no placeholder event may be created while the offer is torn down
            let _stop = self.stop_lock.lock().await;
            self.clear_remote_subscriber_count(service, instance);
            self.events.unset_payloads(service, instance);
        }

        let _registration = self.registration_lock.lock().await;
        if self.state.get() == RegistrationState::Registered {
            let frame = Command::new(
                self.client(),
                CommandKind::StopOfferService(ServiceVersion {
                    service,
                    instance,
                    major,
                    minor,
                }),
            )
            .to_frame();
            self.send_via_sender(&frame).await;
        }
        self.intent.remove_offer(service, instance);
    }

    pub async fn request_service(
        self: &Arc<Self>,
        service: Service,
        instance: Instance,
        major: Major,
        minor: Minor,
    ) {
        let request = ServiceVersion {
            service,
            instance,
            major,
            minor,
        };
        if self.config.request_debounce_time.is_zero() {
            let _registration = self.registration_lock.lock().await;
            let is_first = self.intent.insert_request(request);
            if is_first && self.state.get() == RegistrationState::Registered {
                self.send_request_services(&BTreeSet::from_iter([request]))
                    .await;
            }
        } else {
            if self.intent.has_request(&request) {
                return;
            }
            if self.intent.insert_debounced_request(request) {
                self.start_debounce_timer();
            }
        }
    }

    pub async fn release_service(&self, service: Service, instance: Instance) {
        self.intent
            .remove_subscriptions(service, instance, ANY_EVENTGROUP, ANY_EVENT);
        let was_pending = self.intent.remove_debounced_request(service, instance);

        let _registration = self.registration_lock.lock().await;
        if !was_pending && self.state.get() == RegistrationState::Registered {
            let frame = Command::new(
                self.client(),
                CommandKind::ReleaseService { service, instance },
            )
            .to_frame();
            self.send_via_sender(&frame).await;
        }
        self.intent.remove_request(service, instance);
    }

    pub(crate) async fn send_request_services(&self, requests: &BTreeSet<ServiceVersion>) -> bool {
        if requests.is_empty() {
            return true;
        }
        let frame = Command::new(
            self.client(),
            CommandKind::RequestService {
                services: requests.clone(),
            },
        )
        .to_frame();
        if self.send_via_sender(&frame).await {
            true
        } else {
            error!(client = self.client(), "failed to send requested services");
            false
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn register_event(
        &self,
        service: Service,
        instance: Instance,
        notifier: Event,
        eventgroups: BTreeSet<Eventgroup>,
        event_type: EventType,
        reliability: Reliability,
        cycle: Duration,
        is_provided: bool,
    ) {
        let registration = EventRegistration {
            service,
            instance,
            notifier,
            event_type,
            reliability,
            is_provided,
            is_cyclic: !cycle.is_zero(),
            eventgroups,
        };

        let is_first = self.intent.insert_event_registration(registration.clone());
        if is_first || is_provided {
            self.events.register(&registration);
        }

        let _registration_lock = self.registration_lock.lock().await;
        if is_first && self.state.get() == RegistrationState::Registered {
            self.send_register_event(&registration).await;
        }
    }

    pub(crate) async fn send_register_event(&self, registration: &EventRegistration) {
        let frame = Command::new(
            self.client(),
            CommandKind::RegisterEvent {
                registrations: vec![registration.clone()],
            },
        )
        .to_frame();
        self.send_via_sender(&frame).await;

        if registration.is_provided {
            info!(
                client = self.client(),
                service = registration.service,
                instance = registration.instance,
                notifier = registration.notifier,
                "registered provided event"
            );
        }
    }

    /// One batched REGISTER_EVENT for the registrations the host must know
    /// again after a reconnect. Consumer-side registrations were announced
    /// once on first registration and are not replayed.
    async fn send_pending_event_registrations(&self) -> bool {
        let provided = self.intent.provided_event_registrations();
        if provided.is_empty() {
            return true;
        }
        let frame = Command::new(
            self.client(),
            CommandKind::RegisterEvent {
                registrations: provided,
            },
        )
        .to_frame();
        if self.send_via_sender(&frame).await {
            true
        } else {
            error!(client = self.client(), "failed to send pending event registrations");
            false
        }
    }

    pub(crate) async fn resend_provided_event_registrations(&self) {
        for registration in self.intent.provided_event_registrations() {
            self.send_register_event(&registration).await;
        }
    }

    pub(crate) async fn send_resend_provided_events_response(&self, remote_offer_id: u32) {
        let frame = Command::new(
            self.client(),
            CommandKind::ResendProvidedEvents { remote_offer_id },
        )
        .to_frame();
        self.send_via_sender(&frame).await;
    }

    pub async fn unregister_event(
        &self,
        service: Service,
        instance: Instance,
        notifier: Event,
        is_provided: bool,
    ) {
        self.events
            .unregister(service, instance, notifier, is_provided);

        let _registration = self.registration_lock.lock().await;
        if self.state.get() == RegistrationState::Registered {
            let frame = Command::new(
                self.client(),
                CommandKind::UnregisterEvent {
                    service,
                    instance,
                    notifier,
                    is_provided,
                },
            )
            .to_frame();
            self.send_via_sender(&frame).await;
        }
        self.intent
            .remove_event_registration(service, instance, notifier, is_provided);
    }

    pub async fn send_get_offered_services_info(&self, client: ClientId, offer_type: OfferType) {
        let frame = Command::new(client, CommandKind::OfferedServicesRequest { offer_type })
            .to_frame();
        self.send_via_sender(&frame).await;
    }

    // --- outbound application payloads (the send path) -----------------------

    /// Routes one application message. Requests go to the provider directly
    /// when it is a known local peer, responses to their target client, and
    /// notifications fan out to local subscribers before the host decides
    /// whether remote ones need a copy.
    pub async fn send(
        &self,
        client: ClientId,
        data: &[u8],
        instance: Instance,
        reliable: bool,
        status: u8,
    ) -> bool {
        if self.state.get() != RegistrationState::Registered {
            return false;
        }
        let Some(view) = MessageView::new(data) else {
            error!(
                client = self.client(),
                size = data.len(),
                "message too short to route"
            );
            return false;
        };

        let message_type = view.message_type();
        let mut target: Option<Arc<LocalEndpoint>> = None;
        let mut has_remote_subscribers = false;

        if someip::is_request(message_type) {
            let provider = self.find_local_client(view.service(), instance);
            if provider != ROUTING_CLIENT && self.is_client_known(provider) {
                target = self.endpoints.find_or_create_local(provider).await;
            }
        } else if !someip::is_notification(message_type) {
            let target_client = view.client();
            if target_client != ROUTING_CLIENT && self.is_client_known(target_client) {
                target = self.endpoints.find_or_create_local(target_client).await;
            }
        } else if client == ROUTING_CLIENT {
            // broadcast notification: local subscribers are served in-process
            has_remote_subscribers = self
                .send_local_notification(data, instance, reliable, status)
                .await;
        } else {
            // notify_one
            if let Some(peer) = self.endpoints.find_local(client).await {
                return self
                    .send_local(
                        SendTarget::Peer(peer),
                        self.client(),
                        data,
                        instance,
                        reliable,
                        CommandId::Send,
                        status,
                    )
                    .await;
            }
        }

        let target = match target {
            Some(peer) => SendTarget::Peer(peer),
            None => SendTarget::Host,
        };

        let mut send = true;
        let mut command = CommandId::Send;
        if someip::is_notification(message_type) {
            if client != ROUTING_CLIENT {
                command = CommandId::NotifyOne;
            } else {
                command = CommandId::Notify;
                // the host only needs a copy for remote subscribers
                send = has_remote_subscribers;
            }
        }
        if !send {
            return false;
        }

        let envelope_client = if command == CommandId::NotifyOne {
            client
        } else {
            self.client()
        };
        self.send_local(target, envelope_client, data, instance, reliable, command, status)
            .await
    }

    /// Wraps a raw SOME/IP message into the given command and delivers it. A
    /// failing peer endpoint is detached and the frame falls back to the host.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn send_local(
        &self,
        target: SendTarget,
        envelope_client: ClientId,
        data: &[u8],
        instance: Instance,
        reliable: bool,
        command: CommandId,
        status: u8,
    ) -> bool {
        let send_data = crate::protocol::command::SendData {
            instance,
            reliable,
            status,
            message: bytes::Bytes::copy_from_slice(data),
        };
        let kind = match command {
            CommandId::Notify => CommandKind::Notify(send_data),
            CommandId::NotifyOne => CommandKind::NotifyOne(send_data),
            _ => CommandKind::Send(send_data),
        };
        let frame = Command::new(envelope_client, kind).to_frame();

        match target {
            SendTarget::Peer(peer) => {
                if peer.send(&frame).await {
                    true
                } else {
                    let peer_client = peer.client();
                    self.handle_client_error(peer_client).await;
                    self.send_via_sender(&frame).await
                }
            }
            SendTarget::Host => self.send_via_sender(&frame).await,
        }
    }

    /// Delivers a broadcast notification to every local subscriber directly.
    /// Returns whether remote subscribers exist, i.e. whether the host needs
    /// a copy on the wire.
    async fn send_local_notification(
        &self,
        data: &[u8],
        instance: Instance,
        reliable: bool,
        status: u8,
    ) -> bool {
        let view = MessageView::new(data).expect("length checked by caller");

        if self.events.is_field(view.service(), instance, view.method()) {
            let payload = bytes::Bytes::copy_from_slice(view.payload());
            self.events
                .cache_payload(view.service(), instance, view.method(), payload);
        }

        let subscribers = self
            .events
            .subscribers_of(view.service(), instance, view.method());

        let mut has_remote_subscribers = false;
        for subscriber in subscribers {
            if subscriber == ROUTING_CLIENT {
                has_remote_subscribers = true;
                continue;
            }
            if let Some(peer) = self.endpoints.find_local(subscriber).await {
                self.send_local(
                    SendTarget::Peer(peer),
                    self.client(),
                    data,
                    instance,
                    reliable,
                    CommandId::Send,
                    status,
                )
                .await;
            }
        }
        has_remote_subscribers
    }

    pub(crate) async fn restart_sender(&self) {
        let sender = self.sender.lock().await;
        if let Some(s) = sender.as_ref() {
            s.restart().await;
        }
    }

    pub(crate) async fn send_via_sender(&self, frame: &[u8]) -> bool {
        let sender = self.sender.lock().await;
        match sender.as_ref() {
            Some(s) => s.send(frame).await,
            None => false,
        }
    }

    // --- keepalive ------------------------------------------------------------

    pub(crate) fn start_keepalive(self: &Arc<Self>) {
        let generation = {
            let mut keepalive = self.keepalive.lock().unwrap();
            if keepalive.active || !self.config.keepalive_enabled {
                return;
            }
            info!(
                "keepalive enabled, interval {} ms",
                self.config.keepalive_time.as_millis()
            );
            keepalive.active = true;
            keepalive.is_alive = true;
            keepalive.generation += 1;
            keepalive.generation
        };

        let weak = Arc::downgrade(self);
        let interval = self.config.keepalive_time;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(proxy) = weak.upgrade() else {
                    return;
                };
                let send_probe = {
                    let mut keepalive = proxy.keepalive.lock().unwrap();
                    if !keepalive.active || keepalive.generation != generation {
                        return;
                    }
                    if keepalive.is_alive {
                        keepalive.is_alive = false;
                        true
                    } else {
                        false
                    }
                };
                // sending under the keepalive lock would invert the lock order
                if send_probe {
                    proxy.ping_host().await;
                } else {
                    warn!(
                        client = proxy.client(),
                        "no keepalive confirmation from routing host"
                    );
                    proxy.handle_client_error(ROUTING_CLIENT).await;
                    return;
                }
            }
        });
    }

    pub(crate) fn cancel_keepalive(&self) {
        let mut keepalive = self.keepalive.lock().unwrap();
        if keepalive.active {
            debug!("cancelling keepalive");
            keepalive.active = false;
            keepalive.generation += 1;
        }
    }

    pub(crate) async fn ping_host(&self) {
        let frame = Command::new(self.client(), CommandKind::Ping).to_frame();
        self.send_via_sender(&frame).await;
    }

    pub(crate) async fn send_pong(&self) {
        let frame = Command::new(self.client(), CommandKind::Pong).to_frame();
        if self.is_connected.load(Ordering::Acquire) {
            self.send_via_sender(&frame).await;
        }
    }

    pub(crate) fn on_pong(&self, client: ClientId) {
        if client == ROUTING_CLIENT {
            self.keepalive.lock().unwrap().is_alive = true;
        }
    }

    // --- registration watchdog ------------------------------------------------

    fn arm_registration_watchdog(self: &Arc<Self>) {
        let generation = {
            let mut timer = self.registration_timer.lock().unwrap();
            *timer += 1;
            *timer
        };
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(REGISTRATION_TIMEOUT).await;
            let Some(proxy) = weak.upgrade() else {
                return;
            };
            if *proxy.registration_timer.lock().unwrap() != generation {
                return;
            }
            proxy.on_registration_timeout().await;
        });
    }

    pub(crate) fn cancel_registration_watchdog(&self) {
        *self.registration_timer.lock().unwrap() += 1;
    }

    async fn on_registration_timeout(&self) {
        if self.state.get() == RegistrationState::Registered {
            info!(
                client = self.client(),
                "not retrying registration, already registered"
            );
            return;
        }
        warn!(client = self.client(), "registration timeout, trying again");
        self.state.set(RegistrationState::Deregistered);
        let sender = self.sender.lock().await;
        if let Some(s) = sender.as_ref() {
            s.restart().await;
        }
    }

    // --- request debouncing ---------------------------------------------------

    fn start_debounce_timer(self: &Arc<Self>) {
        let generation = {
            let mut debounce = self.debounce.lock().unwrap();
            if debounce.running {
                return;
            }
            debounce.running = true;
            debounce.generation += 1;
            debounce.generation
        };

        let weak = Arc::downgrade(self);
        let window = self.config.request_debounce_time;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(window).await;
                let Some(proxy) = weak.upgrade() else {
                    return;
                };
                if proxy.debounce.lock().unwrap().generation != generation {
                    return;
                }

                {
                    let _registration = proxy.registration_lock.lock().await;
                    if proxy.state.get() != RegistrationState::Registered {
                        // defer the flush until registration completes
                        continue;
                    }
                    let batch = proxy.intent.take_debounced_requests();
                    if !batch.is_empty() {
                        proxy.send_request_services(&batch).await;
                        proxy.intent.merge_requests(batch);
                    }
                }

                let pending_left = proxy.intent.has_debounced_requests();
                let mut debounce = proxy.debounce.lock().unwrap();
                if debounce.generation != generation {
                    return;
                }
                if !pending_left {
                    debounce.running = false;
                    return;
                }
                // requests raced in while flushing, run another window
            }
        });
    }

    // --- peer failures and reconnect ------------------------------------------

    /// A broken peer endpoint is detached and its services re-requested; a
    /// broken routing host triggers a full reconnect cycle.
    pub(crate) async fn handle_client_error(&self, client: ClientId) {
        if client != ROUTING_CLIENT {
            info!(
                client = self.client(),
                peer = client,
                "handling error of peer client, not reconnecting"
            );
            let mut services_to_request = BTreeSet::new();
            if self.state.get() == RegistrationState::Registered {
                services_to_request = self.services_owned_by(client);
            }

            {
                let receiver = self.receiver.lock().await;
                if let Some(r) = receiver.as_ref() {
                    r.disconnect_from(client);
                }
            }
            self.endpoints.remove_local(client).await;

            if self.state.get() == RegistrationState::Registered {
                self.send_request_services(&services_to_request).await;
            }
        } else {
            info!(
                client = self.client(),
                "handling error of routing host, will reconnect"
            );
            if self.is_started.load(Ordering::Acquire) {
                self.cancel_keepalive();
                self.reconnect().await;
            }
        }
    }

    async fn reconnect(&self) {
        self.host.on_state(ApplicationState::Deregistered).await;
        self.state.set(RegistrationState::Deregistered);

        for client in self.endpoints.connected_clients().await {
            if client != ROUTING_CLIENT {
                self.endpoints.remove_local(client).await;
            }
        }

        info!(client = self.client(), "reconnecting to routing manager");

        if !self
            .policy
            .check_credentials(self.client(), &self.config.own_sec_client)
        {
            error!(
                client = self.client(),
                "credential check failed, not allowed to use the server endpoint"
            );
            let sender = self.sender.lock().await;
            if let Some(s) = sender.as_ref() {
                s.stop().await;
            }
            return;
        }

        let sender = self.sender.lock().await;
        if let Some(s) = sender.as_ref() {
            s.restart().await;
        }
    }

    // --- known clients, service table, remote subscriber counts ---------------

    pub(crate) fn add_known_client(&self, client: ClientId, hostname: &str) {
        let mut known = self.known_clients.lock().unwrap();
        match known.get(&client) {
            Some(existing) if hostname.is_empty() && !existing.is_empty() => {}
            _ => {
                known.insert(client, hostname.to_string());
            }
        }
    }

    pub(crate) fn remove_known_client(&self, client: ClientId) {
        self.known_clients.lock().unwrap().remove(&client);
    }

    pub(crate) fn is_client_known(&self, client: ClientId) -> bool {
        self.known_clients.lock().unwrap().contains_key(&client)
    }

    pub(crate) fn known_clients(&self) -> Vec<ClientId> {
        self.known_clients.lock().unwrap().keys().copied().collect()
    }

    /// Hostname of another application, as shared via CONFIG.
    pub fn environment(&self, client: ClientId) -> String {
        self.known_clients
            .lock()
            .unwrap()
            .get(&client)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn insert_local_service(
        &self,
        service: Service,
        instance: Instance,
        major: Major,
        minor: Minor,
        owner: ClientId,
    ) {
        self.local_services
            .lock()
            .unwrap()
            .entries
            .insert((service, instance), (major, minor, owner));
    }

    /// Removes the owner mapping, remembering the previous owner in the
    /// history table.
    pub(crate) fn remove_local_service(&self, service: Service, instance: Instance, owner: ClientId) {
        let mut table = self.local_services.lock().unwrap();
        table.entries.remove(&(service, instance));
        table
            .history
            .entry((service, instance))
            .or_default()
            .insert(owner);
    }

    pub(crate) fn find_local_client(&self, service: Service, instance: Instance) -> ClientId {
        self.local_services
            .lock()
            .unwrap()
            .entries
            .get(&(service, instance))
            .map(|(_, _, client)| *client)
            .unwrap_or(ROUTING_CLIENT)
    }

    pub(crate) fn is_available(&self, service: Service, instance: Instance, major: Major) -> bool {
        self.local_services
            .lock()
            .unwrap()
            .entries
            .get(&(service, instance))
            .map(|(available_major, _, _)| major == ANY_MAJOR || *available_major == major)
            .unwrap_or(false)
    }

    pub(crate) fn services_owned_by(&self, client: ClientId) -> BTreeSet<ServiceVersion> {
        self.local_services
            .lock()
            .unwrap()
            .entries
            .iter()
            .filter(|(_, (_, _, owner))| *owner == client)
            .map(|((service, instance), (major, minor, _))| ServiceVersion {
                service: *service,
                instance: *instance,
                major: *major,
                minor: *minor,
            })
            .collect()
    }

    /// Adjusts the remote subscriber count of an eventgroup and returns the
    /// new value. Incrementing creates the entry, decrementing an absent one
    /// stays at zero.
    pub(crate) fn remote_subscriber_count(
        &self,
        service: Service,
        instance: Instance,
        eventgroup: Eventgroup,
        increment: bool,
    ) -> u32 {
        let mut counts = self.remote_subscriber_counts.lock().unwrap();
        match counts.get_mut(&(service, instance, eventgroup)) {
            Some(count) => {
                if increment {
                    *count += 1;
                } else if *count > 0 {
                    *count -= 1;
                }
                *count
            }
            None => {
                if increment {
                    counts.insert((service, instance, eventgroup), 1);
                    1
                } else {
                    0
                }
            }
        }
    }

    pub(crate) fn clear_remote_subscriber_count(&self, service: Service, instance: Instance) {
        self.remote_subscriber_counts
            .lock()
            .unwrap()
            .retain(|(s, i, _), _| !(*s == service && *i == instance));
    }

    pub(crate) fn take_remote_subscriptions(&self) -> Vec<(Service, Instance, Eventgroup)> {
        let mut counts = self.remote_subscriber_counts.lock().unwrap();
        let keys = counts.keys().copied().collect();
        counts.clear();
        keys
    }

    /// Does the frame come from the routing host itself? With security
    /// enabled this is decided by the transport-vouched identity: the bound
    /// client on local channels, the host's address and client port (command
    /// port + 1) on network channels. Without security the envelope client is
    /// all there is.
    pub(crate) fn is_from_routing(&self, command_client: ClientId, origin: &FrameOrigin) -> bool {
        if self.config.security_enabled {
            if self.config.local_routing {
                origin.bound_client == self.config.routing_host_id
            } else {
                match origin.remote {
                    Some(remote) => {
                        remote.ip() == self.config.routing_host_address
                            && remote.port() == self.config.routing_host_port + 1
                    }
                    None => false,
                }
            }
        } else {
            command_client == self.config.routing_host_id
        }
    }
}

/// Transport-facing side of the proxy. Holds only a weak reference: the
/// proxy owns the transport, the transport must not keep the proxy alive.
pub(crate) struct ProxyHandler {
    proxy: Weak<RoutingProxy>,
}

#[async_trait::async_trait]
impl FrameHandler for ProxyHandler {
    async fn on_connect(&self) {
        if let Some(proxy) = self.proxy.upgrade() {
            proxy.on_sender_connect().await;
        }
    }

    async fn on_disconnect(&self) {
        if let Some(proxy) = self.proxy.upgrade() {
            proxy.on_sender_disconnect().await;
        }
    }

    async fn on_frame(&self, frame: &[u8], origin: &FrameOrigin) {
        if let Some(proxy) = self.proxy.upgrade() {
            proxy.handle_frame(frame, origin).await;
        }
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::protocol::types::{RoutingEntry, RoutingEntryType};
    use crate::proxy::config::ProxyConfig;
    use crate::test_util::{
        complete_registration, expect_assign, test_config, AllowAllPolicy, FakeRoutingHost,
        RecordingHost,
    };

    use super::*;

    const SVC: ServiceVersion = ServiceVersion {
        service: 0x1111,
        instance: 0x2222,
        major: 1,
        minor: 0,
    };

    fn build(config: ProxyConfig) -> (Arc<RoutingProxy>, Arc<RecordingHost>, FakeRoutingHost) {
        let config = Arc::new(config);
        let fake_host = FakeRoutingHost::bind(&config);
        let app = RecordingHost::new();
        let proxy = RoutingProxy::new(config, app.clone(), Arc::new(AllowAllPolicy));
        (proxy, app, fake_host)
    }

    #[tokio::test]
    async fn test_assign_register_offer() {
        let (proxy, app, fake_host) = build(test_config());

        // declared before the proxy is even started, replayed at the commit
        proxy.offer_service(SVC.service, SVC.instance, SVC.major, SVC.minor).await;

        proxy.start().await.unwrap();
        let mut link = fake_host.accept().await;
        expect_assign(&mut link).await;
        complete_registration(&mut link).await;

        let offer = link.recv().await;
        assert_eq!(offer.client, 0x1234);
        assert_eq!(offer.kind, CommandKind::OfferService(SVC));

        assert!(app.wait_for_state(ApplicationState::Registered, Duration::from_secs(5)).await);
        assert_eq!(proxy.state(), RegistrationState::Registered);
        assert_eq!(proxy.client(), 0x1234);
        assert_eq!(*app.client.lock().unwrap(), 0x1234);

        // repeating the offer causes no second emission in this epoch
        proxy.offer_service(SVC.service, SVC.instance, SVC.major, SVC.minor).await;
        link.recv_none(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_request_debounce_flushes_one_batch() {
        let mut config = test_config();
        config.request_debounce_time = Duration::from_millis(100);
        let (proxy, _app, fake_host) = build(config);

        proxy.start().await.unwrap();
        let mut link = fake_host.accept().await;
        expect_assign(&mut link).await;
        complete_registration(&mut link).await;

        proxy.request_service(0xA, 1, 1, 0).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        proxy.request_service(0xB, 1, 1, 0).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        proxy.release_service(0xA, 1).await;

        match link.recv().await.kind {
            CommandKind::RequestService { services } => {
                let b = ServiceVersion { service: 0xB, instance: 1, major: 1, minor: 0 };
                assert_eq!(services, BTreeSet::from_iter([b]));
            }
            other => panic!("expected RequestService, got {:?}", other.id()),
        }
        // no separate emission for the released request
        link.recv_none(Duration::from_millis(150)).await;
    }

    #[tokio::test]
    async fn test_reconnect_replays_intent() {
        let (proxy, app, fake_host) = build(test_config());
        proxy.offer_service(SVC.service, SVC.instance, SVC.major, SVC.minor).await;

        proxy.start().await.unwrap();
        let mut link = fake_host.accept().await;
        expect_assign(&mut link).await;
        complete_registration(&mut link).await;
        assert_eq!(link.recv().await.kind, CommandKind::OfferService(SVC));
        assert!(app.wait_for_state(ApplicationState::Registered, Duration::from_secs(5)).await);

        proxy.request_service(0xA, 1, 1, 0).await;
        assert!(matches!(link.recv().await.kind, CommandKind::RequestService { .. }));

        proxy
            .register_event(
                SVC.service,
                SVC.instance,
                0xAAAA,
                BTreeSet::from_iter([0x10]),
                EventType::Field,
                Reliability::Unreliable,
                Duration::ZERO,
                true,
            )
            .await;
        assert!(matches!(link.recv().await.kind, CommandKind::RegisterEvent { .. }));

        // consumer-side registration: announced once, not replayed
        proxy
            .register_event(
                0x7777,
                1,
                0x8001,
                BTreeSet::from_iter([0x20]),
                EventType::Event,
                Reliability::Unreliable,
                Duration::ZERO,
                false,
            )
            .await;
        assert!(matches!(link.recv().await.kind, CommandKind::RegisterEvent { .. }));

        assert!(app.wait_for_state(ApplicationState::Registered, Duration::from_secs(5)).await);

        // the routing host dies
        drop(link);
        assert!(app.wait_for_state(ApplicationState::Deregistered, Duration::from_secs(5)).await);

        // reconnect: full cycle, then offers, requests, provided events
        let mut link = fake_host.accept().await;
        expect_assign(&mut link).await;
        complete_registration(&mut link).await;

        assert_eq!(link.recv().await.kind, CommandKind::OfferService(SVC));
        match link.recv().await.kind {
            CommandKind::RequestService { services } => {
                assert_eq!(services.len(), 1);
                assert_eq!(services.iter().next().unwrap().service, 0xA);
            }
            other => panic!("expected RequestService, got {:?}", other.id()),
        }
        match link.recv().await.kind {
            CommandKind::RegisterEvent { registrations } => {
                assert_eq!(registrations.len(), 1);
                assert_eq!(registrations[0].notifier, 0xAAAA);
                assert!(registrations[0].is_provided);
            }
            other => panic!("expected RegisterEvent, got {:?}", other.id()),
        }

        assert!(app.wait_for_state(ApplicationState::Registered, Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_keepalive_loss_triggers_reconnect() {
        let mut config = test_config();
        config.keepalive_enabled = true;
        config.keepalive_time = Duration::from_millis(100);
        let (proxy, app, fake_host) = build(config);

        proxy.start().await.unwrap();
        let mut link = fake_host.accept().await;
        expect_assign(&mut link).await;
        complete_registration(&mut link).await;

        match link.recv().await.kind {
            CommandKind::Ping => {}
            other => panic!("expected Ping, got {:?}", other.id()),
        }

        // no pong: after one more interval the proxy reconnects
        let mut link = fake_host.accept().await;
        expect_assign(&mut link).await;
        assert!(app.states().contains(&ApplicationState::Deregistered));
    }

    #[tokio::test]
    async fn test_pong_keeps_the_connection() {
        let mut config = test_config();
        config.keepalive_enabled = true;
        config.keepalive_time = Duration::from_millis(100);
        let (proxy, _app, fake_host) = build(config);

        proxy.start().await.unwrap();
        let mut link = fake_host.accept().await;
        expect_assign(&mut link).await;
        complete_registration(&mut link).await;

        for _ in 0..3 {
            match link.recv().await.kind {
                CommandKind::Ping => link.send(CommandKind::Pong).await,
                other => panic!("expected Ping, got {:?}", other.id()),
            }
        }
        assert_eq!(proxy.state(), RegistrationState::Registered);
    }

    #[tokio::test]
    async fn test_stop_deregisters_and_removes_rendezvous() {
        let config = test_config();
        let rendezvous = config.rendezvous_path(0x1234);
        let (proxy, _app, fake_host) = build(config);

        proxy.start().await.unwrap();
        let mut link = fake_host.accept().await;
        expect_assign(&mut link).await;
        complete_registration(&mut link).await;
        assert!(rendezvous.exists());

        let stopping = {
            let proxy = proxy.clone();
            tokio::spawn(async move { proxy.stop().await })
        };

        match link.recv().await.kind {
            CommandKind::DeregisterApplication => {}
            other => panic!("expected DeregisterApplication, got {:?}", other.id()),
        }
        link.send(CommandKind::RoutingInfo {
            entries: vec![RoutingEntry {
                entry_type: RoutingEntryType::DeleteClient,
                client: 0x1234,
                address: None,
                services: vec![],
            }],
        })
        .await;

        stopping.await.unwrap();
        assert_eq!(proxy.state(), RegistrationState::Deregistered);
        assert!(!rendezvous.exists());
    }

    #[tokio::test]
    async fn test_assign_watchdog_restarts_the_sender() {
        let (proxy, _app, fake_host) = build(test_config());

        proxy.start().await.unwrap();
        let mut link = fake_host.accept().await;
        expect_assign(&mut link).await;

        // stay silent; the watchdog tears the connection down and retries
        let mut link = fake_host.accept().await;
        expect_assign(&mut link).await;
    }

    #[tokio::test]
    async fn test_unset_client_ack_does_not_advance() {
        let (proxy, _app, fake_host) = build(test_config());

        proxy.start().await.unwrap();
        let mut link = fake_host.accept().await;
        expect_assign(&mut link).await;

        link.send(CommandKind::AssignClientAck { assigned: UNSET_CLIENT }).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(proxy.state(), RegistrationState::Assigning);
        link.recv_none(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_readd_of_self_while_registered_is_a_noop() {
        let (proxy, _app, fake_host) = build(test_config());

        proxy.start().await.unwrap();
        let mut link = fake_host.accept().await;
        expect_assign(&mut link).await;
        complete_registration(&mut link).await;

        link.send(CommandKind::RoutingInfo {
            entries: vec![RoutingEntry {
                entry_type: RoutingEntryType::AddClient,
                client: 0x1234,
                address: None,
                services: vec![],
            }],
        })
        .await;

        link.recv_none(Duration::from_millis(200)).await;
        assert_eq!(proxy.state(), RegistrationState::Registered);
    }
}
