use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use anyhow::anyhow;
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::util::buf::{put_bool, try_get_bool};

pub type ClientId = u16;
pub type Service = u16;
pub type Instance = u16;
pub type Eventgroup = u16;
pub type Event = u16;
pub type Method = u16;
pub type Major = u8;
pub type Minor = u32;

/// The routing host's own client id. It doubles as the *unset* id: a proxy
/// that was never assigned carries this value in its first ASSIGN_CLIENT, and
/// an ACK assigning it is treated as a failed assignment.
pub const ROUTING_CLIENT: ClientId = 0x0000;
pub const UNSET_CLIENT: ClientId = 0x0000;

pub const ANY_EVENT: Event = 0xFFFF;
pub const ANY_EVENTGROUP: Eventgroup = 0xFFFF;
pub const ANY_MAJOR: Major = 0xFF;

/// Sentinel distinguishing locally-originated subscribes from those the host
/// relays on behalf of a remote subscriber.
pub const PENDING_SUBSCRIPTION_ID: u32 = u32::MAX;

/// id + client + payload size
pub const COMMAND_HEADER_SIZE: usize = 7;

/// One offered or requested service version.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ServiceVersion {
    pub service: Service,
    pub instance: Instance,
    pub major: Major,
    pub minor: Minor,
}

impl ServiceVersion {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(self.service);
        buf.put_u16_le(self.instance);
        buf.put_u8(self.major);
        buf.put_u32_le(self.minor);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<ServiceVersion> {
        Ok(ServiceVersion {
            service: buf.try_get_u16_le()?,
            instance: buf.try_get_u16_le()?,
            major: buf.try_get_u8()?,
            minor: buf.try_get_u32_le()?,
        })
    }
}

pub(crate) fn ser_service_set<'a>(
    services: impl ExactSizeIterator<Item = &'a ServiceVersion>,
    buf: &mut BytesMut,
) {
    buf.put_usize_varint(services.len());
    for s in services {
        s.ser(buf);
    }
}

pub(crate) fn try_deser_service_set<T: FromIterator<ServiceVersion>>(
    buf: &mut impl Buf,
) -> anyhow::Result<T> {
    let len = buf.try_get_usize_varint()?;
    let mut services = Vec::with_capacity(len.min(1024));
    for _ in 0..len {
        services.push(ServiceVersion::try_deser(buf)?);
    }
    Ok(services.into_iter().collect())
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum EventType {
    Event = 0,
    SelectiveEvent = 1,
    Field = 2,
    Unknown = 0xFF,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Reliability {
    Reliable = 0,
    Unreliable = 1,
    Both = 2,
    Unknown = 0xFF,
}

/// Event-level intent as carried by REGISTER_EVENT.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub struct EventRegistration {
    pub service: Service,
    pub instance: Instance,
    pub notifier: Event,
    pub event_type: EventType,
    pub reliability: Reliability,
    pub is_provided: bool,
    pub is_cyclic: bool,
    pub eventgroups: BTreeSet<Eventgroup>,
}

impl EventRegistration {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.service);
        buf.put_u16_le(self.instance);
        buf.put_u16_le(self.notifier);
        buf.put_u8(self.event_type.into());
        buf.put_u8(self.reliability.into());
        put_bool(buf, self.is_provided);
        put_bool(buf, self.is_cyclic);
        buf.put_usize_varint(self.eventgroups.len());
        for eg in &self.eventgroups {
            buf.put_u16_le(*eg);
        }
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<EventRegistration> {
        let service = buf.try_get_u16_le()?;
        let instance = buf.try_get_u16_le()?;
        let notifier = buf.try_get_u16_le()?;
        let event_type = EventType::try_from_primitive(buf.try_get_u8()?)?;
        let reliability = Reliability::try_from_primitive(buf.try_get_u8()?)?;
        let is_provided = try_get_bool(buf)?;
        let is_cyclic = try_get_bool(buf)?;
        let num_eventgroups = buf.try_get_usize_varint()?;
        let mut eventgroups = BTreeSet::new();
        for _ in 0..num_eventgroups {
            eventgroups.insert(buf.try_get_u16_le()?);
        }
        Ok(EventRegistration {
            service,
            instance,
            notifier,
            event_type,
            reliability,
            is_provided,
            is_cyclic,
            eventgroups,
        })
    }
}

/// Debounce filter attached to a subscription.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub struct Filter {
    pub on_change: bool,
    pub interval_ms: u64,
    pub on_change_resets_interval: bool,
}

impl Filter {
    pub fn ser(&self, buf: &mut impl BufMut) {
        put_bool(buf, self.on_change);
        buf.put_u64_le(self.interval_ms);
        put_bool(buf, self.on_change_resets_interval);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Filter> {
        Ok(Filter {
            on_change: try_get_bool(buf)?,
            interval_ms: buf.try_get_u64_le()?,
            on_change_resets_interval: try_get_bool(buf)?,
        })
    }

    pub(crate) fn ser_opt(filter: &Option<Filter>, buf: &mut impl BufMut) {
        match filter {
            Some(f) => {
                buf.put_u8(1);
                f.ser(buf);
            }
            None => buf.put_u8(0),
        }
    }

    pub(crate) fn try_deser_opt(buf: &mut impl Buf) -> anyhow::Result<Option<Filter>> {
        match buf.try_get_u8()? {
            0 => Ok(None),
            1 => Ok(Some(Filter::try_deser(buf)?)),
            n => Err(anyhow!("invalid filter discriminator: {}", n)),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum OfferType {
    Local = 0,
    Remote = 1,
    All = 2,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum RoutingEntryType {
    AddClient = 0,
    DeleteClient = 1,
    AddServiceInstance = 2,
    DeleteServiceInstance = 3,
}

/// One entry of a ROUTING_INFO broadcast.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RoutingEntry {
    pub entry_type: RoutingEntryType,
    pub client: ClientId,
    /// set for guests reachable over the network, unset for node-local peers
    pub address: Option<SocketAddr>,
    pub services: Vec<ServiceVersion>,
}

impl RoutingEntry {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.entry_type.into());
        buf.put_u16_le(self.client);
        match &self.address {
            None => buf.put_u8(0),
            Some(SocketAddr::V4(addr)) => {
                buf.put_u8(4);
                buf.put_u32(addr.ip().to_bits());
                buf.put_u16_le(addr.port());
            }
            Some(SocketAddr::V6(addr)) => {
                buf.put_u8(6);
                buf.put_u128(addr.ip().to_bits());
                buf.put_u16_le(addr.port());
            }
        }
        buf.put_usize_varint(self.services.len());
        for s in &self.services {
            s.ser(buf);
        }
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<RoutingEntry> {
        let entry_type = RoutingEntryType::try_from_primitive(buf.try_get_u8()?)?;
        let client = buf.try_get_u16_le()?;
        let address = match buf.try_get_u8()? {
            0 => None,
            4 => {
                let ip = Ipv4Addr::from_bits(buf.try_get_u32()?);
                let port = buf.try_get_u16_le()?;
                Some(SocketAddr::new(IpAddr::V4(ip), port))
            }
            6 => {
                let ip = Ipv6Addr::from_bits(buf.try_get_u128()?);
                let port = buf.try_get_u16_le()?;
                Some(SocketAddr::new(IpAddr::V6(ip), port))
            }
            n => return Err(anyhow!("invalid address discriminator: {}", n)),
        };
        let services = try_deser_service_set(buf)?;
        Ok(RoutingEntry {
            entry_type,
            client,
            address,
            services,
        })
    }
}
