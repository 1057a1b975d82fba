use bytes::Bytes;

use crate::protocol::types::{
    ClientId, Event, Eventgroup, Instance, Major, Minor, Service,
};
use crate::proxy::security::SecClient;

/// Registration state as visible to the application.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ApplicationState {
    Registered,
    Deregistered,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AvailabilityState {
    Available,
    Unavailable,
}

/// Subscription verdicts forwarded to `on_subscription_status`, with the
/// SOME/IP return codes they travel as.
pub const SUBSCRIPTION_OK: u8 = 0x00;
pub const SUBSCRIPTION_REJECTED: u8 = 0x07;

/// An application payload handed up by the dispatcher: the raw SOME/IP
/// message plus the delivery metadata of its command envelope.
#[derive(Debug, Clone)]
pub struct DeliveredMessage {
    pub instance: Instance,
    pub reliable: bool,
    pub status: u8,
    pub message: Bytes,
    pub sec_client: Option<SecClient>,
    /// hostname of the sending application, if it shared one
    pub env: String,
}

/// The application side of the proxy. All callbacks run on the proxy's
/// worker tasks; implementations must not block the thread and must not
/// panic — a panicking host callback would take down dispatch for its
/// connection.
#[async_trait::async_trait]
pub trait ApplicationHost: Send + Sync {
    fn name(&self) -> String;

    /// The assigned client id, reported right after ASSIGN_CLIENT_ACK.
    fn set_client(&self, client: ClientId);

    /// Local port of the channel to the routing host, for credential checks.
    fn set_sec_client_port(&self, port: u16);

    async fn on_state(&self, state: ApplicationState);

    async fn on_message(&self, message: DeliveredMessage);

    async fn on_availability(
        &self,
        service: Service,
        instance: Instance,
        state: AvailabilityState,
        major: Major,
        minor: Minor,
    );

    /// Asks the application whether to accept a subscription (`entered` true)
    /// or informs it of a withdrawal (`entered` false, return value ignored).
    #[allow(clippy::too_many_arguments)]
    async fn on_subscription(
        &self,
        service: Service,
        instance: Instance,
        eventgroup: Eventgroup,
        client: ClientId,
        sec_client: Option<&SecClient>,
        env: &str,
        entered: bool,
    ) -> bool;

    async fn on_subscription_status(
        &self,
        service: Service,
        instance: Instance,
        eventgroup: Eventgroup,
        event: Event,
        status: u8,
    );

    async fn on_offered_services_info(&self, services: Vec<(Service, Instance)>);
}
