//! Inbound command dispatch: one closed match over the command taxonomy,
//! with the security gate applied before anything takes effect.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{error, info, trace, warn};

use crate::protocol::command::SendData;
use crate::protocol::someip::{self, MessageView, HEADER_SIZE};
use crate::protocol::types::{
    ClientId, Instance, Method, RoutingEntry, RoutingEntryType, Service, ANY_EVENT,
    ROUTING_CLIENT,
};
use crate::protocol::{Command, CommandKind};
use crate::proxy::host::{ApplicationState, AvailabilityState, DeliveredMessage};
use crate::proxy::proxy::RoutingProxy;
use crate::proxy::state::RegistrationState;
use crate::transport::FrameOrigin;

impl RoutingProxy {
    pub(crate) async fn handle_frame(self: &Arc<Self>, raw: &[u8], origin: &FrameOrigin) {
        let command = match Command::deser(raw) {
            Ok(command) => command,
            Err(e) => {
                error!(client = self.client(), "discarding frame: {}", e);
                return;
            }
        };

        let is_from_routing = self.is_from_routing(command.client, origin);

        if self.config().security_enabled
            && self.config().local_routing
            && !is_from_routing
            && origin.bound_client != command.client
        {
            warn!(
                client = self.client(),
                command = ?command.kind.id(),
                envelope_client = command.client,
                bound_client = origin.bound_client,
                "command does not match the bound client, skipping"
            );
            return;
        }

        match command.kind {
            CommandKind::Send(data) => {
                self.on_send(command.client, data, origin, is_from_routing).await;
            }
            CommandKind::AssignClientAck { assigned } => {
                self.on_client_assign_ack(assigned).await;
            }
            CommandKind::RoutingInfo { entries } => {
                if !self.config().security_enabled || is_from_routing {
                    self.on_routing_info(entries).await;
                } else {
                    warn!(
                        client = self.client(),
                        "received routing info from a client that is not the routing manager, skipping"
                    );
                }
            }
            CommandKind::Ping => {
                self.send_pong().await;
                trace!(client = self.client(), "ping");
            }
            CommandKind::Pong => {
                self.on_pong(command.client);
            }
            CommandKind::Subscribe(data) => {
                self.on_inbound_subscribe(command.client, data, origin, is_from_routing)
                    .await;
            }
            CommandKind::Unsubscribe(data) => {
                self.on_inbound_unsubscribe(command.client, data, origin, false).await;
            }
            CommandKind::Expire(data) => {
                self.on_inbound_unsubscribe(command.client, data, origin, true).await;
            }
            CommandKind::SubscribeAck(reply) => {
                info!(
                    client = command.client,
                    service = reply.service,
                    instance = reply.instance,
                    eventgroup = reply.eventgroup,
                    event = reply.event,
                    "subscribe ack"
                );
                self.on_subscribe_ack(reply).await;
            }
            CommandKind::SubscribeNack(reply) => {
                info!(
                    client = command.client,
                    service = reply.service,
                    instance = reply.instance,
                    eventgroup = reply.eventgroup,
                    event = reply.event,
                    "subscribe nack"
                );
                self.on_subscribe_nack(reply).await;
            }
            CommandKind::UnsubscribeAck { .. } => {
                // bookkeeping of the host side, nothing to do here
            }
            CommandKind::OfferedServicesResponse { services } => {
                if !self.config().security_enabled || is_from_routing {
                    let info = services
                        .iter()
                        .map(|s| (s.service, s.instance))
                        .collect::<Vec<_>>();
                    self.application_host().on_offered_services_info(info).await;
                } else {
                    warn!(
                        client = self.client(),
                        "received offered services info from a client that is not the routing manager, skipping"
                    );
                }
            }
            CommandKind::ResendProvidedEvents { remote_offer_id } => {
                if is_from_routing {
                    self.resend_provided_event_registrations().await;
                    self.send_resend_provided_events_response(remote_offer_id).await;
                    info!(client = command.client, "resend provided events");
                } else {
                    warn!(
                        client = self.client(),
                        "resend provided events not from the routing manager, skipping"
                    );
                }
            }
            CommandKind::Suspend => {
                if is_from_routing {
                    self.on_suspend().await;
                }
            }
            CommandKind::UpdateSecurityPolicy { update_id, policy } => {
                if !self.config().security_enabled || is_from_routing {
                    if self
                        .policy_manager()
                        .is_policy_update_allowed(policy.uid, &policy.data)
                    {
                        self.policy_manager()
                            .update_security_policy(policy.uid, policy.gid, policy.data);
                        let response = Command::new(
                            self.client(),
                            CommandKind::UpdateSecurityPolicyResponse { update_id },
                        )
                        .to_frame();
                        self.send_via_sender(&response).await;
                    }
                } else {
                    warn!(
                        client = self.client(),
                        "security policy update not from the routing manager, skipping"
                    );
                }
            }
            CommandKind::RemoveSecurityPolicy {
                update_id,
                uid,
                gid,
            } => {
                if !self.config().security_enabled || is_from_routing {
                    if self.policy_manager().is_policy_removal_allowed(uid) {
                        self.policy_manager().remove_security_policy(uid, gid);
                        let response = Command::new(
                            self.client(),
                            CommandKind::RemoveSecurityPolicyResponse { update_id },
                        )
                        .to_frame();
                        self.send_via_sender(&response).await;
                    }
                } else {
                    warn!(
                        client = self.client(),
                        "security policy removal not from the routing manager, skipping"
                    );
                }
            }
            CommandKind::DistributeSecurityPolicies { policies } => {
                if !self.config().security_enabled || is_from_routing {
                    for policy in policies {
                        if self
                            .policy_manager()
                            .is_policy_update_allowed(policy.uid, &policy.data)
                        {
                            self.policy_manager()
                                .update_security_policy(policy.uid, policy.gid, policy.data);
                        }
                    }
                } else {
                    warn!(
                        client = self.client(),
                        "security policy distribution not from the routing manager, skipping"
                    );
                }
            }
            CommandKind::UpdateSecurityCredentials { credentials } => {
                if !self.config().security_enabled || is_from_routing {
                    for (uid, gid) in credentials {
                        self.policy_manager()
                            .add_security_credentials(uid, gid, self.client());
                    }
                } else {
                    warn!(
                        client = self.client(),
                        "security credential update not from the routing manager, skipping"
                    );
                }
            }
            CommandKind::Config { entries } => {
                if let Some(hostname) = entries.get("hostname") {
                    self.add_known_client(command.client, hostname);
                }
            }
            other => {
                trace!(
                    client = self.client(),
                    command = ?other.id(),
                    "ignoring inbound command"
                );
            }
        }
    }

    /// SEND carries an application payload: request, response or
    /// notification. Everything that is not vouched for by the security gate
    /// is dropped with a warning and never reaches the application.
    async fn on_send(
        &self,
        _envelope_client: ClientId,
        data: SendData,
        origin: &FrameOrigin,
        is_from_routing: bool,
    ) {
        let Some(view) = MessageView::new(&data.message) else {
            error!(
                client = self.client(),
                "dropping message too short for a SOME/IP header"
            );
            return;
        };
        let service = view.service();
        let method = view.method();
        let message_type = view.message_type();
        let instance = data.instance;

        if !is_from_routing {
            let Some(sec_client) = origin.sec_client.as_ref() else {
                warn!(
                    client = self.client(),
                    "dropping peer message without security identity"
                );
                return;
            };

            if someip::is_request(message_type) {
                if self.config().security_enabled
                    && self.config().local_routing
                    && view.client() != origin.bound_client
                {
                    warn!(
                        client = self.client(),
                        sender = view.client(),
                        bound_client = origin.bound_client,
                        service,
                        instance,
                        method,
                        "request does not match the bound client, skipping"
                    );
                    return;
                }
                if !self
                    .policy_manager()
                    .is_client_allowed_to_access_member(sec_client, service, instance, method)
                {
                    warn!(
                        client = view.client(),
                        service, instance, method,
                        "client is not allowed to send a request, skipping"
                    );
                    return;
                }
            } else {
                // response or notification: the sender must be offering
                if !self
                    .policy_manager()
                    .is_client_allowed_to_offer(sec_client, service, instance)
                {
                    warn!(
                        client = self.client(),
                        sender = origin.bound_client,
                        service, instance, method,
                        "sender does not offer the service, skipping"
                    );
                    return;
                }
                if someip::is_notification(message_type) {
                    if !self.policy_manager().is_client_allowed_to_access_member(
                        &self.config().own_sec_client,
                        service,
                        instance,
                        method,
                    ) {
                        warn!(
                            client = self.client(),
                            sender = origin.bound_client,
                            service, instance, method,
                            "not allowed to receive this notification, skipping"
                        );
                        return;
                    }
                    self.cache_event_payload(service, instance, method, &data.message);
                }
            }
        } else {
            if !self.config().remote_access_allowed {
                warn!(
                    client = self.client(),
                    service, instance, method,
                    "remote clients are not allowed to communicate with this application, skipping"
                );
                return;
            }
            if someip::is_notification(message_type) {
                if !self.policy_manager().is_client_allowed_to_access_member(
                    &self.config().own_sec_client,
                    service,
                    instance,
                    method,
                ) {
                    warn!(
                        client = self.client(),
                        service, instance, method,
                        "not allowed to receive remote notifications for this event, skipping"
                    );
                    return;
                }
                self.cache_event_payload(service, instance, method, &data.message);
            }
        }

        let env = self.environment(origin.bound_client);
        self.application_host()
            .on_message(DeliveredMessage {
                instance,
                reliable: data.reliable,
                status: data.status,
                message: data.message,
                sec_client: origin.sec_client,
                env,
            })
            .await;
    }

    fn cache_event_payload(
        &self,
        service: Service,
        instance: Instance,
        event: Method,
        message: &Bytes,
    ) {
        let payload = if message.len() > HEADER_SIZE {
            message.slice(HEADER_SIZE..)
        } else {
            Bytes::new()
        };
        self.events.cache_payload(service, instance, event, payload);
    }

    pub(crate) async fn on_routing_info(self: &Arc<Self>, entries: Vec<RoutingEntry>) {
        for entry in entries {
            match entry.entry_type {
                RoutingEntryType::AddClient => {
                    if let Some(addr) = entry.address {
                        self.endpoints.add_guest(entry.client, addr);
                        self.add_known_client(entry.client, "");
                    }
                    if entry.client == self.client() {
                        self.on_self_added().await;
                    }
                }
                RoutingEntryType::DeleteClient => {
                    self.remove_known_client(entry.client);
                    if entry.client == self.client() {
                        self.policy_manager()
                            .remove_client_to_sec_client_mapping(entry.client);
                        info!(
                            client = entry.client,
                            name = %self.application_host().name(),
                            "application is deregistered"
                        );
                        self.application_host()
                            .on_state(ApplicationState::Deregistered)
                            .await;
                        self.state.set(RegistrationState::Deregistered);
                    } else if entry.client != ROUTING_CLIENT {
                        self.endpoints.remove_local(entry.client).await;
                    }
                }
                RoutingEntryType::AddServiceInstance => {
                    if let Some(addr) = entry.address {
                        self.endpoints.add_guest(entry.client, addr);
                    }
                    // a yet-unknown offering client must still be usable; the
                    // entry is overwritten once the client connects
                    self.add_known_client(entry.client, "");

                    for sv in &entry.services {
                        self.insert_local_service(
                            sv.service, sv.instance, sv.major, sv.minor, entry.client,
                        );
                        self.send_pending_subscriptions(sv.service, sv.instance, sv.major)
                            .await;
                        self.application_host()
                            .on_availability(
                                sv.service,
                                sv.instance,
                                AvailabilityState::Available,
                                sv.major,
                                sv.minor,
                            )
                            .await;
                        info!(
                            client = self.client(),
                            service = sv.service,
                            instance = sv.instance,
                            major = sv.major,
                            minor = sv.minor,
                            "service available"
                        );
                    }
                }
                RoutingEntryType::DeleteServiceInstance => {
                    for sv in &entry.services {
                        self.remove_local_service(sv.service, sv.instance, entry.client);
                        self.on_stop_offer_service(sv.service, sv.instance);
                        self.application_host()
                            .on_availability(
                                sv.service,
                                sv.instance,
                                AvailabilityState::Unavailable,
                                sv.major,
                                sv.minor,
                            )
                            .await;
                        info!(
                            client = self.client(),
                            service = sv.service,
                            instance = sv.instance,
                            major = sv.major,
                            minor = sv.minor,
                            "service unavailable"
                        );
                    }
                }
            }
        }

        // peers that just became known may have subscriptions parked
        if self.intent.has_incoming_subscriptions() {
            let known = self.known_clients();
            for (client, subscription) in self.intent.take_incoming_subscriptions(&known) {
                self.endpoints.find_or_create_local(client).await;
                self.process_incoming_subscription(client, subscription).await;
            }
        }
    }

    /// A deleted service must not serve stale field values to the next
    /// subscriber.
    fn on_stop_offer_service(&self, service: Service, instance: Instance) {
        self.events.unset_payloads(service, instance);
    }

    /// ADD_CLIENT for our own id: the routing host confirms the registration.
    /// The transition into `Registered` is the commit point; acknowledgment
    /// and the full intent replay either all succeed or the cycle restarts.
    async fn on_self_added(self: &Arc<Self>) {
        if !self
            .policy_manager()
            .check_credentials(self.client(), &self.config().own_sec_client)
        {
            error!(
                client = self.client(),
                "credential check failed, not allowed to use the server endpoint"
            );
            self.deregister_application().await;
            self.application_host()
                .on_state(ApplicationState::Deregistered)
                .await;
            return;
        }

        let registration = self.registration_lock.lock().await;
        match self.state.get() {
            RegistrationState::Registering => {
                if self.send_registered_ack().await && self.send_pending_commands().await {
                    info!(
                        client = self.client(),
                        name = %self.application_host().name(),
                        "application is registered"
                    );
                    self.state.set(RegistrationState::Registered);
                    self.cancel_registration_watchdog();
                    self.start_keepalive();
                    drop(registration);
                    self.application_host()
                        .on_state(ApplicationState::Registered)
                        .await;
                } else {
                    error!(
                        client = self.client(),
                        name = %self.application_host().name(),
                        "failure registering client"
                    );
                    self.state.set(RegistrationState::Deregistered);
                    drop(registration);
                    self.restart_sender().await;
                }
            }
            RegistrationState::Registered => {
                info!(
                    client = self.client(),
                    name = %self.application_host().name(),
                    "application is already registered"
                );
            }
            _ => {}
        }
    }

    /// SUSPEND: the routing host cleans up remote subscriber state, e.g.
    /// before the node sleeps. Every remote subscription is withdrawn.
    pub(crate) async fn on_suspend(&self) {
        info!(client = self.client(), "suspending remote subscriptions");
        for (service, instance, eventgroup) in self.take_remote_subscriptions() {
            self.events
                .remove_subscriber(service, instance, eventgroup, ANY_EVENT, ROUTING_CLIENT);
        }
    }
}
