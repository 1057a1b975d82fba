use std::collections::{BTreeMap, BTreeSet};

use anyhow::anyhow;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::protocol::types::{
    ser_service_set, try_deser_service_set, ClientId, Event, Eventgroup, EventRegistration,
    Filter, Instance, Major, OfferType, RoutingEntry, Service, ServiceVersion,
    COMMAND_HEADER_SIZE,
};
use crate::util::buf::{put_bool, put_string, try_get_bool, try_get_string};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum CommandId {
    AssignClient = 0x00,
    AssignClientAck = 0x01,
    RegisterApplication = 0x02,
    DeregisterApplication = 0x03,
    RegisteredAck = 0x04,
    Ping = 0x05,
    Pong = 0x06,
    OfferService = 0x10,
    StopOfferService = 0x11,
    RequestService = 0x12,
    ReleaseService = 0x13,
    RegisterEvent = 0x14,
    UnregisterEvent = 0x15,
    Subscribe = 0x16,
    Unsubscribe = 0x17,
    SubscribeAck = 0x18,
    SubscribeNack = 0x19,
    UnsubscribeAck = 0x1A,
    Expire = 0x1B,
    Send = 0x20,
    Notify = 0x21,
    NotifyOne = 0x22,
    RoutingInfo = 0x30,
    Config = 0x31,
    OfferedServicesRequest = 0x32,
    OfferedServicesResponse = 0x33,
    ResendProvidedEvents = 0x34,
    Suspend = 0x35,
    UpdateSecurityPolicy = 0x40,
    UpdateSecurityPolicyResponse = 0x41,
    RemoveSecurityPolicy = 0x42,
    RemoveSecurityPolicyResponse = 0x43,
    DistributeSecurityPolicies = 0x44,
    UpdateSecurityCredentials = 0x45,
}

/// Subscription request payload. `pending_id` is [PENDING_SUBSCRIPTION_ID]
/// for locally-originated subscribes; anything else marks a remote subscriber
/// relayed by the routing host.
///
/// [PENDING_SUBSCRIPTION_ID]: crate::protocol::types::PENDING_SUBSCRIPTION_ID
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SubscribeData {
    pub service: Service,
    pub instance: Instance,
    pub eventgroup: Eventgroup,
    pub major: Major,
    pub event: Event,
    pub pending_id: u32,
    pub filter: Option<Filter>,
}

impl SubscribeData {
    fn ser(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.service);
        buf.put_u16_le(self.instance);
        buf.put_u16_le(self.eventgroup);
        buf.put_u8(self.major);
        buf.put_u16_le(self.event);
        buf.put_u32_le(self.pending_id);
        Filter::ser_opt(&self.filter, buf);
    }

    fn try_deser(buf: &mut impl Buf) -> anyhow::Result<SubscribeData> {
        Ok(SubscribeData {
            service: buf.try_get_u16_le()?,
            instance: buf.try_get_u16_le()?,
            eventgroup: buf.try_get_u16_le()?,
            major: buf.try_get_u8()?,
            event: buf.try_get_u16_le()?,
            pending_id: buf.try_get_u32_le()?,
            filter: Filter::try_deser_opt(buf)?,
        })
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct UnsubscribeData {
    pub service: Service,
    pub instance: Instance,
    pub eventgroup: Eventgroup,
    pub major: Major,
    pub event: Event,
    pub pending_id: u32,
}

impl UnsubscribeData {
    fn ser(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.service);
        buf.put_u16_le(self.instance);
        buf.put_u16_le(self.eventgroup);
        buf.put_u8(self.major);
        buf.put_u16_le(self.event);
        buf.put_u32_le(self.pending_id);
    }

    fn try_deser(buf: &mut impl Buf) -> anyhow::Result<UnsubscribeData> {
        Ok(UnsubscribeData {
            service: buf.try_get_u16_le()?,
            instance: buf.try_get_u16_le()?,
            eventgroup: buf.try_get_u16_le()?,
            major: buf.try_get_u8()?,
            event: buf.try_get_u16_le()?,
            pending_id: buf.try_get_u32_le()?,
        })
    }
}

/// SUBSCRIBE_ACK / SUBSCRIBE_NACK payload. `subscriber` is the client the
/// verdict is for, `client` of the envelope is the provider answering.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct SubscriptionReplyData {
    pub service: Service,
    pub instance: Instance,
    pub eventgroup: Eventgroup,
    pub subscriber: ClientId,
    pub event: Event,
    pub pending_id: u32,
}

impl SubscriptionReplyData {
    fn ser(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.service);
        buf.put_u16_le(self.instance);
        buf.put_u16_le(self.eventgroup);
        buf.put_u16_le(self.subscriber);
        buf.put_u16_le(self.event);
        buf.put_u32_le(self.pending_id);
    }

    fn try_deser(buf: &mut impl Buf) -> anyhow::Result<SubscriptionReplyData> {
        Ok(SubscriptionReplyData {
            service: buf.try_get_u16_le()?,
            instance: buf.try_get_u16_le()?,
            eventgroup: buf.try_get_u16_le()?,
            subscriber: buf.try_get_u16_le()?,
            event: buf.try_get_u16_le()?,
            pending_id: buf.try_get_u32_le()?,
        })
    }
}

/// Application payload envelope shared by SEND, NOTIFY and NOTIFY_ONE.
/// `message` is the raw SOME/IP message, header included.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SendData {
    pub instance: Instance,
    pub reliable: bool,
    pub status: u8,
    pub message: Bytes,
}

impl SendData {
    fn ser(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.instance);
        put_bool(buf, self.reliable);
        buf.put_u8(self.status);
        buf.put_slice(&self.message);
    }

    fn try_deser(buf: &mut impl Buf) -> anyhow::Result<SendData> {
        let instance = buf.try_get_u16_le()?;
        let reliable = try_get_bool(buf)?;
        let status = buf.try_get_u8()?;
        Ok(SendData {
            instance,
            reliable,
            status,
            message: buf.copy_to_bytes(buf.remaining()),
        })
    }
}

/// An opaque security policy as distributed by the routing host. Rule parsing
/// belongs to the policy manager; the proxy only routes the blob.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PolicyBlob {
    pub uid: u32,
    pub gid: u32,
    pub data: Bytes,
}

impl PolicyBlob {
    fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.uid);
        buf.put_u32_le(self.gid);
        buf.put_usize_varint(self.data.len());
        buf.put_slice(&self.data);
    }

    fn try_deser(buf: &mut impl Buf) -> anyhow::Result<PolicyBlob> {
        let uid = buf.try_get_u32_le()?;
        let gid = buf.try_get_u32_le()?;
        let len = buf.try_get_usize_varint()?;
        if buf.remaining() < len {
            return Err(anyhow!("policy blob of {} bytes exceeds payload", len));
        }
        Ok(PolicyBlob {
            uid,
            gid,
            data: buf.copy_to_bytes(len),
        })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum CommandKind {
    AssignClient { name: String },
    AssignClientAck { assigned: ClientId },
    RegisterApplication { port: u16 },
    DeregisterApplication,
    RegisteredAck,
    Ping,
    Pong,
    OfferService(ServiceVersion),
    StopOfferService(ServiceVersion),
    RequestService { services: BTreeSet<ServiceVersion> },
    ReleaseService { service: Service, instance: Instance },
    RegisterEvent { registrations: Vec<EventRegistration> },
    UnregisterEvent { service: Service, instance: Instance, notifier: Event, is_provided: bool },
    Subscribe(SubscribeData),
    Unsubscribe(UnsubscribeData),
    SubscribeAck(SubscriptionReplyData),
    SubscribeNack(SubscriptionReplyData),
    UnsubscribeAck { service: Service, instance: Instance, eventgroup: Eventgroup, pending_id: u32 },
    Expire(UnsubscribeData),
    Send(SendData),
    Notify(SendData),
    NotifyOne(SendData),
    RoutingInfo { entries: Vec<RoutingEntry> },
    Config { entries: BTreeMap<String, String> },
    OfferedServicesRequest { offer_type: OfferType },
    OfferedServicesResponse { services: Vec<ServiceVersion> },
    ResendProvidedEvents { remote_offer_id: u32 },
    Suspend,
    UpdateSecurityPolicy { update_id: u32, policy: PolicyBlob },
    UpdateSecurityPolicyResponse { update_id: u32 },
    RemoveSecurityPolicy { update_id: u32, uid: u32, gid: u32 },
    RemoveSecurityPolicyResponse { update_id: u32 },
    DistributeSecurityPolicies { policies: Vec<PolicyBlob> },
    UpdateSecurityCredentials { credentials: Vec<(u32, u32)> },
}

impl CommandKind {
    pub fn id(&self) -> CommandId {
        match self {
            CommandKind::AssignClient { .. } => CommandId::AssignClient,
            CommandKind::AssignClientAck { .. } => CommandId::AssignClientAck,
            CommandKind::RegisterApplication { .. } => CommandId::RegisterApplication,
            CommandKind::DeregisterApplication => CommandId::DeregisterApplication,
            CommandKind::RegisteredAck => CommandId::RegisteredAck,
            CommandKind::Ping => CommandId::Ping,
            CommandKind::Pong => CommandId::Pong,
            CommandKind::OfferService(_) => CommandId::OfferService,
            CommandKind::StopOfferService(_) => CommandId::StopOfferService,
            CommandKind::RequestService { .. } => CommandId::RequestService,
            CommandKind::ReleaseService { .. } => CommandId::ReleaseService,
            CommandKind::RegisterEvent { .. } => CommandId::RegisterEvent,
            CommandKind::UnregisterEvent { .. } => CommandId::UnregisterEvent,
            CommandKind::Subscribe(_) => CommandId::Subscribe,
            CommandKind::Unsubscribe(_) => CommandId::Unsubscribe,
            CommandKind::SubscribeAck(_) => CommandId::SubscribeAck,
            CommandKind::SubscribeNack(_) => CommandId::SubscribeNack,
            CommandKind::UnsubscribeAck { .. } => CommandId::UnsubscribeAck,
            CommandKind::Expire(_) => CommandId::Expire,
            CommandKind::Send(_) => CommandId::Send,
            CommandKind::Notify(_) => CommandId::Notify,
            CommandKind::NotifyOne(_) => CommandId::NotifyOne,
            CommandKind::RoutingInfo { .. } => CommandId::RoutingInfo,
            CommandKind::Config { .. } => CommandId::Config,
            CommandKind::OfferedServicesRequest { .. } => CommandId::OfferedServicesRequest,
            CommandKind::OfferedServicesResponse { .. } => CommandId::OfferedServicesResponse,
            CommandKind::ResendProvidedEvents { .. } => CommandId::ResendProvidedEvents,
            CommandKind::Suspend => CommandId::Suspend,
            CommandKind::UpdateSecurityPolicy { .. } => CommandId::UpdateSecurityPolicy,
            CommandKind::UpdateSecurityPolicyResponse { .. } => {
                CommandId::UpdateSecurityPolicyResponse
            }
            CommandKind::RemoveSecurityPolicy { .. } => CommandId::RemoveSecurityPolicy,
            CommandKind::RemoveSecurityPolicyResponse { .. } => {
                CommandId::RemoveSecurityPolicyResponse
            }
            CommandKind::DistributeSecurityPolicies { .. } => {
                CommandId::DistributeSecurityPolicies
            }
            CommandKind::UpdateSecurityCredentials { .. } => CommandId::UpdateSecurityCredentials,
        }
    }
}

/// A complete control frame: envelope client plus payload.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Command {
    pub client: ClientId,
    pub kind: CommandKind,
}

impl Command {
    pub fn new(client: ClientId, kind: CommandKind) -> Command {
        Command { client, kind }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.kind.id().into());
        buf.put_u16_le(self.client);

        let offs_for_size = buf.len();
        buf.put_u32_le(0); // placeholder, backfilled below

        self.ser_payload(buf);

        let payload_size = (buf.len() - offs_for_size - size_of::<u32>()) as u32;
        (&mut buf[offs_for_size..]).put_u32_le(payload_size);
    }

    pub fn to_frame(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf
    }

    fn ser_payload(&self, buf: &mut BytesMut) {
        match &self.kind {
            CommandKind::AssignClient { name } => put_string(buf, name),
            CommandKind::AssignClientAck { assigned } => buf.put_u16_le(*assigned),
            CommandKind::RegisterApplication { port } => buf.put_u16_le(*port),
            CommandKind::DeregisterApplication
            | CommandKind::RegisteredAck
            | CommandKind::Ping
            | CommandKind::Pong
            | CommandKind::Suspend => {}
            CommandKind::OfferService(sv) | CommandKind::StopOfferService(sv) => sv.ser(buf),
            CommandKind::RequestService { services } => ser_service_set(services.iter(), buf),
            CommandKind::ReleaseService { service, instance } => {
                buf.put_u16_le(*service);
                buf.put_u16_le(*instance);
            }
            CommandKind::RegisterEvent { registrations } => {
                buf.put_usize_varint(registrations.len());
                for r in registrations {
                    r.ser(buf);
                }
            }
            CommandKind::UnregisterEvent {
                service,
                instance,
                notifier,
                is_provided,
            } => {
                buf.put_u16_le(*service);
                buf.put_u16_le(*instance);
                buf.put_u16_le(*notifier);
                put_bool(buf, *is_provided);
            }
            CommandKind::Subscribe(data) => data.ser(buf),
            CommandKind::Unsubscribe(data) | CommandKind::Expire(data) => data.ser(buf),
            CommandKind::SubscribeAck(data) | CommandKind::SubscribeNack(data) => data.ser(buf),
            CommandKind::UnsubscribeAck {
                service,
                instance,
                eventgroup,
                pending_id,
            } => {
                buf.put_u16_le(*service);
                buf.put_u16_le(*instance);
                buf.put_u16_le(*eventgroup);
                buf.put_u32_le(*pending_id);
            }
            CommandKind::Send(data) | CommandKind::Notify(data) | CommandKind::NotifyOne(data) => {
                data.ser(buf)
            }
            CommandKind::RoutingInfo { entries } => {
                buf.put_usize_varint(entries.len());
                for e in entries {
                    e.ser(buf);
                }
            }
            CommandKind::Config { entries } => {
                buf.put_usize_varint(entries.len());
                for (k, v) in entries {
                    put_string(buf, k);
                    put_string(buf, v);
                }
            }
            CommandKind::OfferedServicesRequest { offer_type } => buf.put_u8((*offer_type).into()),
            CommandKind::OfferedServicesResponse { services } => {
                ser_service_set(services.iter(), buf)
            }
            CommandKind::ResendProvidedEvents { remote_offer_id } => {
                buf.put_u32_le(*remote_offer_id)
            }
            CommandKind::UpdateSecurityPolicy { update_id, policy } => {
                buf.put_u32_le(*update_id);
                policy.ser(buf);
            }
            CommandKind::UpdateSecurityPolicyResponse { update_id }
            | CommandKind::RemoveSecurityPolicyResponse { update_id } => {
                buf.put_u32_le(*update_id)
            }
            CommandKind::RemoveSecurityPolicy {
                update_id,
                uid,
                gid,
            } => {
                buf.put_u32_le(*update_id);
                buf.put_u32_le(*uid);
                buf.put_u32_le(*gid);
            }
            CommandKind::DistributeSecurityPolicies { policies } => {
                buf.put_usize_varint(policies.len());
                for p in policies {
                    p.ser(buf);
                }
            }
            CommandKind::UpdateSecurityCredentials { credentials } => {
                buf.put_usize_varint(credentials.len());
                for (uid, gid) in credentials {
                    buf.put_u32_le(*uid);
                    buf.put_u32_le(*gid);
                }
            }
        }
    }

    pub fn deser(raw: &[u8]) -> anyhow::Result<Command> {
        let mut buf = raw;
        let id = CommandId::try_from_primitive(buf.try_get_u8()?)?;
        let client = buf.try_get_u16_le()?;
        let payload_size = buf.try_get_u32_le()? as usize;
        if buf.remaining() < payload_size {
            return Err(anyhow!(
                "command {:?}: payload size {} exceeds frame ({} bytes left)",
                id,
                payload_size,
                buf.remaining()
            ));
        }
        let mut payload = &buf[..payload_size];
        let buf = &mut payload;

        let kind = match id {
            CommandId::AssignClient => CommandKind::AssignClient {
                name: try_get_string(buf)?,
            },
            CommandId::AssignClientAck => CommandKind::AssignClientAck {
                assigned: buf.try_get_u16_le()?,
            },
            CommandId::RegisterApplication => CommandKind::RegisterApplication {
                port: buf.try_get_u16_le()?,
            },
            CommandId::DeregisterApplication => CommandKind::DeregisterApplication,
            CommandId::RegisteredAck => CommandKind::RegisteredAck,
            CommandId::Ping => CommandKind::Ping,
            CommandId::Pong => CommandKind::Pong,
            CommandId::OfferService => CommandKind::OfferService(ServiceVersion::try_deser(buf)?),
            CommandId::StopOfferService => {
                CommandKind::StopOfferService(ServiceVersion::try_deser(buf)?)
            }
            CommandId::RequestService => CommandKind::RequestService {
                services: try_deser_service_set(buf)?,
            },
            CommandId::ReleaseService => CommandKind::ReleaseService {
                service: buf.try_get_u16_le()?,
                instance: buf.try_get_u16_le()?,
            },
            CommandId::RegisterEvent => {
                let len = buf.try_get_usize_varint()?;
                let mut registrations = Vec::with_capacity(len.min(1024));
                for _ in 0..len {
                    registrations.push(EventRegistration::try_deser(buf)?);
                }
                CommandKind::RegisterEvent { registrations }
            }
            CommandId::UnregisterEvent => CommandKind::UnregisterEvent {
                service: buf.try_get_u16_le()?,
                instance: buf.try_get_u16_le()?,
                notifier: buf.try_get_u16_le()?,
                is_provided: try_get_bool(buf)?,
            },
            CommandId::Subscribe => CommandKind::Subscribe(SubscribeData::try_deser(buf)?),
            CommandId::Unsubscribe => CommandKind::Unsubscribe(UnsubscribeData::try_deser(buf)?),
            CommandId::SubscribeAck => {
                CommandKind::SubscribeAck(SubscriptionReplyData::try_deser(buf)?)
            }
            CommandId::SubscribeNack => {
                CommandKind::SubscribeNack(SubscriptionReplyData::try_deser(buf)?)
            }
            CommandId::UnsubscribeAck => CommandKind::UnsubscribeAck {
                service: buf.try_get_u16_le()?,
                instance: buf.try_get_u16_le()?,
                eventgroup: buf.try_get_u16_le()?,
                pending_id: buf.try_get_u32_le()?,
            },
            CommandId::Expire => CommandKind::Expire(UnsubscribeData::try_deser(buf)?),
            CommandId::Send => CommandKind::Send(SendData::try_deser(buf)?),
            CommandId::Notify => CommandKind::Notify(SendData::try_deser(buf)?),
            CommandId::NotifyOne => CommandKind::NotifyOne(SendData::try_deser(buf)?),
            CommandId::RoutingInfo => {
                let len = buf.try_get_usize_varint()?;
                let mut entries = Vec::with_capacity(len.min(1024));
                for _ in 0..len {
                    entries.push(RoutingEntry::try_deser(buf)?);
                }
                CommandKind::RoutingInfo { entries }
            }
            CommandId::Config => {
                let len = buf.try_get_usize_varint()?;
                let mut entries = BTreeMap::new();
                for _ in 0..len {
                    let key = try_get_string(buf)?;
                    let value = try_get_string(buf)?;
                    entries.insert(key, value);
                }
                CommandKind::Config { entries }
            }
            CommandId::OfferedServicesRequest => CommandKind::OfferedServicesRequest {
                offer_type: OfferType::try_from_primitive(buf.try_get_u8()?)?,
            },
            CommandId::OfferedServicesResponse => CommandKind::OfferedServicesResponse {
                services: try_deser_service_set(buf)?,
            },
            CommandId::ResendProvidedEvents => CommandKind::ResendProvidedEvents {
                remote_offer_id: buf.try_get_u32_le()?,
            },
            CommandId::Suspend => CommandKind::Suspend,
            CommandId::UpdateSecurityPolicy => CommandKind::UpdateSecurityPolicy {
                update_id: buf.try_get_u32_le()?,
                policy: PolicyBlob::try_deser(buf)?,
            },
            CommandId::UpdateSecurityPolicyResponse => CommandKind::UpdateSecurityPolicyResponse {
                update_id: buf.try_get_u32_le()?,
            },
            CommandId::RemoveSecurityPolicy => CommandKind::RemoveSecurityPolicy {
                update_id: buf.try_get_u32_le()?,
                uid: buf.try_get_u32_le()?,
                gid: buf.try_get_u32_le()?,
            },
            CommandId::RemoveSecurityPolicyResponse => CommandKind::RemoveSecurityPolicyResponse {
                update_id: buf.try_get_u32_le()?,
            },
            CommandId::DistributeSecurityPolicies => {
                let len = buf.try_get_usize_varint()?;
                let mut policies = Vec::with_capacity(len.min(1024));
                for _ in 0..len {
                    policies.push(PolicyBlob::try_deser(buf)?);
                }
                CommandKind::DistributeSecurityPolicies { policies }
            }
            CommandId::UpdateSecurityCredentials => {
                let len = buf.try_get_usize_varint()?;
                let mut credentials = Vec::with_capacity(len.min(1024));
                for _ in 0..len {
                    credentials.push((buf.try_get_u32_le()?, buf.try_get_u32_le()?));
                }
                CommandKind::UpdateSecurityCredentials { credentials }
            }
        };
        Ok(Command { client, kind })
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeSet;
    use std::str::FromStr;

    use rstest::rstest;

    use crate::protocol::types::{
        EventType, Reliability, RoutingEntryType, ANY_MAJOR, PENDING_SUBSCRIPTION_ID,
    };

    use super::*;

    fn service(s: u16, i: u16, major: u8, minor: u32) -> ServiceVersion {
        ServiceVersion {
            service: s,
            instance: i,
            major,
            minor,
        }
    }

    #[rstest]
    #[case::assign_client(CommandKind::AssignClient { name: "node_app".to_string() }, CommandId::AssignClient)]
    #[case::assign_client_ack(CommandKind::AssignClientAck { assigned: 0x1234 }, CommandId::AssignClientAck)]
    #[case::register_application(CommandKind::RegisterApplication { port: 40002 }, CommandId::RegisterApplication)]
    #[case::deregister_application(CommandKind::DeregisterApplication, CommandId::DeregisterApplication)]
    #[case::registered_ack(CommandKind::RegisteredAck, CommandId::RegisteredAck)]
    #[case::ping(CommandKind::Ping, CommandId::Ping)]
    #[case::pong(CommandKind::Pong, CommandId::Pong)]
    #[case::offer(CommandKind::OfferService(service(0x1111, 0x2222, 1, 0)), CommandId::OfferService)]
    #[case::stop_offer(CommandKind::StopOfferService(service(0x1111, 0x2222, 1, 0)), CommandId::StopOfferService)]
    #[case::request_empty(CommandKind::RequestService { services: BTreeSet::new() }, CommandId::RequestService)]
    #[case::request_two(CommandKind::RequestService {
        services: BTreeSet::from_iter([service(1, 2, 3, 4), service(5, 6, ANY_MAJOR, u32::MAX)]),
    }, CommandId::RequestService)]
    #[case::release(CommandKind::ReleaseService { service: 0x1111, instance: 0x2222 }, CommandId::ReleaseService)]
    #[case::register_event(CommandKind::RegisterEvent {
        registrations: vec![EventRegistration {
            service: 0x1111, instance: 0x2222, notifier: 0xAAAA,
            event_type: EventType::Field, reliability: Reliability::Unreliable,
            is_provided: true, is_cyclic: false,
            eventgroups: BTreeSet::from_iter([0x10]),
        }],
    }, CommandId::RegisterEvent)]
    #[case::unregister_event(CommandKind::UnregisterEvent {
        service: 1, instance: 2, notifier: 3, is_provided: true,
    }, CommandId::UnregisterEvent)]
    #[case::subscribe(CommandKind::Subscribe(SubscribeData {
        service: 0x1111, instance: 0x2222, eventgroup: 0x10, major: 1,
        event: 0xFFFF, pending_id: PENDING_SUBSCRIPTION_ID,
        filter: Some(Filter { on_change: true, interval_ms: 10, on_change_resets_interval: false }),
    }), CommandId::Subscribe)]
    #[case::unsubscribe(CommandKind::Unsubscribe(UnsubscribeData {
        service: 1, instance: 2, eventgroup: 3, major: ANY_MAJOR, event: 4,
        pending_id: PENDING_SUBSCRIPTION_ID,
    }), CommandId::Unsubscribe)]
    #[case::subscribe_ack(CommandKind::SubscribeAck(SubscriptionReplyData {
        service: 1, instance: 2, eventgroup: 3, subscriber: 0x4444, event: 5, pending_id: 7,
    }), CommandId::SubscribeAck)]
    #[case::subscribe_nack(CommandKind::SubscribeNack(SubscriptionReplyData {
        service: 1, instance: 2, eventgroup: 3, subscriber: 0x4444, event: 5, pending_id: 7,
    }), CommandId::SubscribeNack)]
    #[case::unsubscribe_ack(CommandKind::UnsubscribeAck {
        service: 1, instance: 2, eventgroup: 3, pending_id: 9,
    }, CommandId::UnsubscribeAck)]
    #[case::expire(CommandKind::Expire(UnsubscribeData {
        service: 1, instance: 2, eventgroup: 3, major: 4, event: 5, pending_id: 8,
    }), CommandId::Expire)]
    #[case::send(CommandKind::Send(SendData {
        instance: 0x2222, reliable: true, status: 0,
        message: Bytes::from_static(&[0x11, 0x11, 0x00, 0x01, 0, 0, 0, 8, 0x12, 0x34, 0, 1, 1, 1, 0, 0]),
    }), CommandId::Send)]
    #[case::notify(CommandKind::Notify(SendData {
        instance: 1, reliable: false, status: 0, message: Bytes::from_static(b"xyz"),
    }), CommandId::Notify)]
    #[case::notify_one(CommandKind::NotifyOne(SendData {
        instance: 1, reliable: false, status: 1, message: Bytes::new(),
    }), CommandId::NotifyOne)]
    #[case::routing_info(CommandKind::RoutingInfo {
        entries: vec![
            RoutingEntry {
                entry_type: RoutingEntryType::AddClient,
                client: 0x1234,
                address: None,
                services: vec![],
            },
            RoutingEntry {
                entry_type: RoutingEntryType::AddServiceInstance,
                client: 0x1235,
                address: Some(std::net::SocketAddr::from_str("10.0.0.2:30501").unwrap()),
                services: vec![service(0x1111, 0x2222, 1, 0)],
            },
        ],
    }, CommandId::RoutingInfo)]
    #[case::config(CommandKind::Config {
        entries: BTreeMap::from_iter([("hostname".to_string(), "node".to_string())]),
    }, CommandId::Config)]
    #[case::offered_services_request(CommandKind::OfferedServicesRequest {
        offer_type: OfferType::All,
    }, CommandId::OfferedServicesRequest)]
    #[case::offered_services_response(CommandKind::OfferedServicesResponse {
        services: vec![service(1, 2, 3, 4)],
    }, CommandId::OfferedServicesResponse)]
    #[case::resend_provided_events(CommandKind::ResendProvidedEvents { remote_offer_id: 19 }, CommandId::ResendProvidedEvents)]
    #[case::suspend(CommandKind::Suspend, CommandId::Suspend)]
    #[case::update_policy(CommandKind::UpdateSecurityPolicy {
        update_id: 77,
        policy: PolicyBlob { uid: 1000, gid: 1000, data: Bytes::from_static(&[1, 2, 3]) },
    }, CommandId::UpdateSecurityPolicy)]
    #[case::update_policy_response(CommandKind::UpdateSecurityPolicyResponse { update_id: 77 }, CommandId::UpdateSecurityPolicyResponse)]
    #[case::remove_policy(CommandKind::RemoveSecurityPolicy { update_id: 78, uid: 1000, gid: 100 }, CommandId::RemoveSecurityPolicy)]
    #[case::remove_policy_response(CommandKind::RemoveSecurityPolicyResponse { update_id: 78 }, CommandId::RemoveSecurityPolicyResponse)]
    #[case::distribute_policies(CommandKind::DistributeSecurityPolicies {
        policies: vec![
            PolicyBlob { uid: 1, gid: 2, data: Bytes::new() },
            PolicyBlob { uid: 3, gid: 4, data: Bytes::from_static(b"rule") },
        ],
    }, CommandId::DistributeSecurityPolicies)]
    #[case::update_credentials(CommandKind::UpdateSecurityCredentials {
        credentials: vec![(1000, 1000), (1001, 100)],
    }, CommandId::UpdateSecurityCredentials)]
    fn test_command_round_trip(#[case] kind: CommandKind, #[case] id: CommandId) {
        assert_eq!(kind.id(), id);

        let command = Command::new(0x1234, kind);
        let mut buf = BytesMut::new();
        command.ser(&mut buf);

        // envelope sanity: id, client and payload size are where they belong
        assert_eq!(buf[0], u8::from(id));
        assert_eq!(u16::from_le_bytes([buf[1], buf[2]]), 0x1234);
        let payload_size = u32::from_le_bytes([buf[3], buf[4], buf[5], buf[6]]) as usize;
        assert_eq!(buf.len(), COMMAND_HEADER_SIZE + payload_size);

        let deser = Command::deser(&buf).unwrap();
        assert_eq!(deser, command);
    }

    #[rstest]
    #[case::empty(&[])]
    #[case::header_only(&[0x00, 0x34, 0x12])]
    #[case::unknown_id(&[0xEE, 0x34, 0x12, 0, 0, 0, 0])]
    #[case::size_beyond_frame(&[0x01, 0x34, 0x12, 9, 0, 0, 0, 1, 2])]
    fn test_command_deser_invalid(#[case] raw: &[u8]) {
        assert!(Command::deser(raw).is_err());
    }

    #[test]
    fn test_command_deser_truncated_payload() {
        let command = Command::new(
            7,
            CommandKind::Subscribe(SubscribeData {
                service: 1,
                instance: 2,
                eventgroup: 3,
                major: 4,
                event: 5,
                pending_id: PENDING_SUBSCRIPTION_ID,
                filter: None,
            }),
        );
        let buf = command.to_frame();
        assert!(Command::deser(&buf[..buf.len() - 1]).is_err());
    }
}
