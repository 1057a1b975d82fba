//! Client side of a SOME/IP routing fabric.
//!
//! Applications on a host communicate through a per-host routing manager.
//! This crate implements the non-host side: a [`proxy::RoutingProxy`] obtains
//! a client identifier from the routing host, registers the application,
//! publishes its intent (offers, requests, event registrations,
//! subscriptions), routes application payloads to peer proxies or through the
//! host, and replays all intent after a routing-host crash.
//!
//! The embedding application provides three collaborators: a
//! [`proxy::ApplicationHost`] receiving callbacks, a [`proxy::PolicyManager`]
//! answering security questions, and a filled-in [`proxy::ProxyConfig`].

pub mod protocol;
pub mod proxy;
pub mod transport;
pub mod util;

#[cfg(test)]
pub(crate) mod test_util;

pub use proxy::{
    ApplicationHost, ApplicationState, PolicyManager, ProxyConfig, RoutingProxy, SecClient,
};
