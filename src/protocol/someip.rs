//! The few pieces of SOME/IP message layout the proxy needs for routing
//! decisions: fixed header positions and the message-type taxonomy. Full
//! message parsing is the application host's business; the proxy treats
//! payloads as opaque beyond these fields.
//!
//! SOME/IP headers keep their big-endian field layout even though the
//! command envelope around them is little-endian.

use bytes::{BufMut, Bytes, BytesMut};

use crate::protocol::types::{ClientId, Event, Instance, Major, Method, Service};

pub const HEADER_SIZE: usize = 16;

pub const SERVICE_POS: usize = 0;
pub const METHOD_POS: usize = 2;
pub const LENGTH_POS: usize = 4;
pub const CLIENT_POS: usize = 8;
pub const SESSION_POS: usize = 10;
pub const PROTOCOL_VERSION_POS: usize = 12;
pub const INTERFACE_VERSION_POS: usize = 13;
pub const MESSAGE_TYPE_POS: usize = 14;
pub const RETURN_CODE_POS: usize = 15;

pub const PROTOCOL_VERSION: u8 = 0x01;

pub const MT_REQUEST: u8 = 0x00;
pub const MT_REQUEST_NO_RETURN: u8 = 0x01;
pub const MT_NOTIFICATION: u8 = 0x02;
pub const MT_RESPONSE: u8 = 0x80;
pub const MT_ERROR: u8 = 0x81;

/// set on segmented (SOME/IP-TP) variants of the base message types
const MT_TP_FLAG: u8 = 0x20;

pub fn is_request(message_type: u8) -> bool {
    matches!(
        message_type & !MT_TP_FLAG,
        MT_REQUEST | MT_REQUEST_NO_RETURN
    )
}

pub fn is_notification(message_type: u8) -> bool {
    message_type & !MT_TP_FLAG == MT_NOTIFICATION
}

pub fn is_response(message_type: u8) -> bool {
    matches!(message_type & !MT_TP_FLAG, MT_RESPONSE | MT_ERROR)
}

fn read_u16_be(data: &[u8], pos: usize) -> u16 {
    u16::from_be_bytes([data[pos], data[pos + 1]])
}

/// Accessors for a raw SOME/IP message. Callers must have checked the length
/// against [MESSAGE_TYPE_POS] before constructing one.
#[derive(Clone, Copy)]
pub struct MessageView<'a> {
    data: &'a [u8],
}

impl<'a> MessageView<'a> {
    pub fn new(data: &'a [u8]) -> Option<MessageView<'a>> {
        if data.len() > MESSAGE_TYPE_POS {
            Some(MessageView { data })
        } else {
            None
        }
    }

    pub fn service(&self) -> Service {
        read_u16_be(self.data, SERVICE_POS)
    }

    pub fn method(&self) -> Method {
        read_u16_be(self.data, METHOD_POS)
    }

    pub fn client(&self) -> ClientId {
        read_u16_be(self.data, CLIENT_POS)
    }

    pub fn message_type(&self) -> u8 {
        self.data[MESSAGE_TYPE_POS]
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.data[HEADER_SIZE.min(self.data.len())..]
    }
}

/// Builds the notification a provider sends to late subscribers of a field:
/// current payload, session zero, client zero (the event owner is implied by
/// service and notifier).
pub fn build_notification(
    service: Service,
    _instance: Instance,
    event: Event,
    interface_version: Major,
    payload: &[u8],
) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_u16(service);
    buf.put_u16(event);
    // length covers client id through end of payload
    buf.put_u32((8 + payload.len()) as u32);
    buf.put_u16(0); // client
    buf.put_u16(0); // session
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u8(interface_version);
    buf.put_u8(MT_NOTIFICATION);
    buf.put_u8(0); // E_OK
    buf.put_slice(payload);
    buf.freeze()
}
