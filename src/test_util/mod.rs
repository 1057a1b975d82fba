//! Shared helpers for the crate's tests: a recording application host, canned
//! policy managers, and a scriptable stand-in for the routing host speaking
//! the real protocol over a real rendezvous socket.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::protocol::types::{
    ClientId, Event, Eventgroup, Instance, Major, Method, Minor, RoutingEntry, RoutingEntryType,
    Service, ROUTING_CLIENT,
};
use crate::protocol::{Command, CommandKind};
use crate::proxy::config::ProxyConfig;
use crate::proxy::host::{ApplicationHost, ApplicationState, AvailabilityState, DeliveredMessage};
use crate::proxy::security::{PolicyManager, SecClient};

static TEST_DIR_COUNTER: AtomicU32 = AtomicU32::new(0);

/// A fresh config rooted in a unique temp directory per test.
pub(crate) fn test_config() -> ProxyConfig {
    let unique = TEST_DIR_COUNTER.fetch_add(1, Ordering::Relaxed);
    let base = std::env::temp_dir().join(format!(
        "someip-routing-test-{}-{}",
        std::process::id(),
        unique
    ));
    std::fs::create_dir_all(&base).unwrap();

    let mut config = ProxyConfig::new("testnet");
    config.hostname = "node".to_string();
    config.base_path = base;
    config.request_debounce_time = Duration::ZERO;
    config
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum HostEvent {
    State(ApplicationState),
    Availability(Service, Instance, AvailabilityState),
    Subscription(Service, Instance, Eventgroup, ClientId, bool),
    SubscriptionStatus(Service, Instance, Eventgroup, Event, u8),
    OfferedServices(Vec<(Service, Instance)>),
}

/// Application host that records every callback for later assertions.
pub(crate) struct RecordingHost {
    pub client: Mutex<ClientId>,
    pub events: Mutex<Vec<HostEvent>>,
    pub messages: Mutex<Vec<DeliveredMessage>>,
    pub accept_subscriptions: AtomicBool,
}

impl RecordingHost {
    pub fn new() -> Arc<RecordingHost> {
        Arc::new(RecordingHost {
            client: Mutex::new(0),
            events: Mutex::new(Vec::new()),
            messages: Mutex::new(Vec::new()),
            accept_subscriptions: AtomicBool::new(true),
        })
    }

    pub fn events(&self) -> Vec<HostEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn states(&self) -> Vec<ApplicationState> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                HostEvent::State(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    pub async fn wait_for_state(&self, expected: ApplicationState, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.states().last() == Some(&expected) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait::async_trait]
impl ApplicationHost for RecordingHost {
    fn name(&self) -> String {
        "test_app".to_string()
    }

    fn set_client(&self, client: ClientId) {
        *self.client.lock().unwrap() = client;
    }

    fn set_sec_client_port(&self, _port: u16) {}

    async fn on_state(&self, state: ApplicationState) {
        self.events.lock().unwrap().push(HostEvent::State(state));
    }

    async fn on_message(&self, message: DeliveredMessage) {
        self.messages.lock().unwrap().push(message);
    }

    async fn on_availability(
        &self,
        service: Service,
        instance: Instance,
        state: AvailabilityState,
        _major: Major,
        _minor: Minor,
    ) {
        self.events
            .lock()
            .unwrap()
            .push(HostEvent::Availability(service, instance, state));
    }

    async fn on_subscription(
        &self,
        service: Service,
        instance: Instance,
        eventgroup: Eventgroup,
        client: ClientId,
        _sec_client: Option<&SecClient>,
        _env: &str,
        entered: bool,
    ) -> bool {
        self.events.lock().unwrap().push(HostEvent::Subscription(
            service, instance, eventgroup, client, entered,
        ));
        self.accept_subscriptions.load(Ordering::Relaxed)
    }

    async fn on_subscription_status(
        &self,
        service: Service,
        instance: Instance,
        eventgroup: Eventgroup,
        event: Event,
        status: u8,
    ) {
        self.events.lock().unwrap().push(HostEvent::SubscriptionStatus(
            service, instance, eventgroup, event, status,
        ));
    }

    async fn on_offered_services_info(&self, services: Vec<(Service, Instance)>) {
        self.events
            .lock()
            .unwrap()
            .push(HostEvent::OfferedServices(services));
    }
}

/// Policy manager that says yes to everything.
pub(crate) struct AllowAllPolicy;

impl PolicyManager for AllowAllPolicy {
    fn check_credentials(&self, _client: ClientId, _sec_client: &SecClient) -> bool {
        true
    }
    fn is_client_allowed_to_access_member(
        &self,
        _sec_client: &SecClient,
        _service: Service,
        _instance: Instance,
        _member: Method,
    ) -> bool {
        true
    }
    fn is_client_allowed_to_offer(
        &self,
        _sec_client: &SecClient,
        _service: Service,
        _instance: Instance,
    ) -> bool {
        true
    }
    fn is_policy_update_allowed(&self, _uid: u32, _policy: &Bytes) -> bool {
        true
    }
    fn is_policy_removal_allowed(&self, _uid: u32) -> bool {
        true
    }
    fn update_security_policy(&self, _uid: u32, _gid: u32, _policy: Bytes) {}
    fn remove_security_policy(&self, _uid: u32, _gid: u32) {}
    fn add_security_credentials(&self, _uid: u32, _gid: u32, _routed_by: ClientId) {}
    fn store_client_to_sec_client_mapping(&self, _client: ClientId, _sec_client: &SecClient) {}
    fn remove_client_to_sec_client_mapping(&self, _client: ClientId) {}
}

/// Policy manager denying access to one specific member.
pub(crate) struct DenyMemberPolicy {
    pub denied: (Service, Instance, Method),
}

impl PolicyManager for DenyMemberPolicy {
    fn check_credentials(&self, _client: ClientId, _sec_client: &SecClient) -> bool {
        true
    }
    fn is_client_allowed_to_access_member(
        &self,
        _sec_client: &SecClient,
        service: Service,
        instance: Instance,
        member: Method,
    ) -> bool {
        (service, instance, member) != self.denied
    }
    fn is_client_allowed_to_offer(
        &self,
        _sec_client: &SecClient,
        _service: Service,
        _instance: Instance,
    ) -> bool {
        true
    }
    fn is_policy_update_allowed(&self, _uid: u32, _policy: &Bytes) -> bool {
        true
    }
    fn is_policy_removal_allowed(&self, _uid: u32) -> bool {
        true
    }
    fn update_security_policy(&self, _uid: u32, _gid: u32, _policy: Bytes) {}
    fn remove_security_policy(&self, _uid: u32, _gid: u32) {}
    fn add_security_credentials(&self, _uid: u32, _gid: u32, _routed_by: ClientId) {}
    fn store_client_to_sec_client_mapping(&self, _client: ClientId, _sec_client: &SecClient) {}
    fn remove_client_to_sec_client_mapping(&self, _client: ClientId) {}
}

/// The routing-host side of one proxy connection, speaking the real wire
/// protocol. Tests script it step by step.
pub(crate) struct HostLink {
    stream: UnixStream,
}

impl HostLink {
    /// Reads the next command, failing the test after five seconds.
    pub async fn recv(&mut self) -> Command {
        tokio::time::timeout(Duration::from_secs(5), self.read_command())
            .await
            .expect("timed out waiting for a command from the proxy")
    }

    async fn read_command(&mut self) -> Command {
        let mut header = [0u8; 7];
        self.stream.read_exact(&mut header).await.expect("read header");
        let payload_size =
            u32::from_le_bytes([header[3], header[4], header[5], header[6]]) as usize;
        let mut frame = vec![0u8; 7 + payload_size];
        frame[..7].copy_from_slice(&header);
        self.stream
            .read_exact(&mut frame[7..])
            .await
            .expect("read payload");
        Command::deser(&frame).expect("deserialize command")
    }

    pub async fn send(&mut self, kind: CommandKind) {
        self.send_as(ROUTING_CLIENT, kind).await;
    }

    /// Sends with an arbitrary envelope client, e.g. to relay a remote
    /// subscriber's command the way the routing host would.
    pub async fn send_as(&mut self, client: ClientId, kind: CommandKind) {
        let frame = Command::new(client, kind).to_frame();
        self.stream.write_all(&frame).await.expect("send command");
    }

    /// Asserts that nothing arrives from the proxy for `window`.
    pub async fn recv_none(&mut self, window: Duration) {
        if let Ok(command) = tokio::time::timeout(window, self.read_command()).await {
            panic!("expected silence from the proxy, got {:?}", command);
        }
    }
}

/// Fails the test unless the next command is the proxy's ASSIGN_CLIENT.
pub(crate) async fn expect_assign(link: &mut HostLink) {
    match link.recv().await.kind {
        CommandKind::AssignClient { name } => assert_eq!(name, "test_app"),
        other => panic!("expected AssignClient, got {:?}", other.id()),
    }
}

/// Drives the handshake from ASSIGN_CLIENT_ACK through REGISTERED_ACK,
/// assigning client 0x1234.
pub(crate) async fn complete_registration(link: &mut HostLink) {
    link.send(CommandKind::AssignClientAck { assigned: 0x1234 }).await;

    let register = link.recv().await;
    assert_eq!(register.client, 0x1234);
    assert!(matches!(register.kind, CommandKind::RegisterApplication { .. }));

    match link.recv().await.kind {
        CommandKind::Config { entries } => {
            assert_eq!(entries.get("hostname").map(String::as_str), Some("node"));
        }
        other => panic!("expected Config, got {:?}", other.id()),
    }

    link.send(CommandKind::RoutingInfo {
        entries: vec![RoutingEntry {
            entry_type: RoutingEntryType::AddClient,
            client: 0x1234,
            address: None,
            services: vec![],
        }],
    })
    .await;

    match link.recv().await.kind {
        CommandKind::RegisteredAck => {}
        other => panic!("expected RegisteredAck, got {:?}", other.id()),
    }
}

/// Binds the routing host's rendezvous socket for `config` and accepts proxy
/// connections.
pub(crate) struct FakeRoutingHost {
    listener: tokio::net::UnixListener,
    pub socket_path: PathBuf,
}

impl FakeRoutingHost {
    pub fn bind(config: &ProxyConfig) -> FakeRoutingHost {
        let socket_path = config.rendezvous_path(config.routing_host_id);
        std::fs::create_dir_all(socket_path.parent().unwrap()).unwrap();
        let listener = tokio::net::UnixListener::bind(&socket_path).expect("bind host socket");
        FakeRoutingHost {
            listener,
            socket_path,
        }
    }

    pub async fn accept(&self) -> HostLink {
        let (stream, _) = tokio::time::timeout(Duration::from_secs(5), self.listener.accept())
            .await
            .expect("timed out waiting for the proxy to connect")
            .expect("accept");
        HostLink { stream }
    }
}
