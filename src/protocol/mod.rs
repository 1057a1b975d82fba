//! The control protocol spoken between a routing proxy and its routing host.
//!
//! Every frame is a single command: `id:u8 | client:u16 | payload_size:u32 |
//! payload`, envelope integers little-endian. The command taxonomy is closed;
//! unknown ids are dropped by the dispatcher.

pub mod command;
pub mod someip;
pub mod types;

pub use command::{Command, CommandId, CommandKind};
pub use types::{
    ClientId, Event, Eventgroup, EventRegistration, EventType, Filter, Instance, Major, Minor,
    OfferType, Reliability, RoutingEntry, RoutingEntryType, Service, ServiceVersion,
    ANY_EVENT, ANY_EVENTGROUP, ANY_MAJOR, COMMAND_HEADER_SIZE, PENDING_SUBSCRIPTION_ID,
    ROUTING_CLIENT, UNSET_CLIENT,
};
