use std::net::IpAddr;

use bytes::Bytes;

use crate::protocol::types::{ClientId, Instance, Method, Service};

/// Security identity of an application: the credentials a local transport
/// vouched for, or the network address of a guest.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum SecClient {
    Uds { uid: u32, gid: u32 },
    Net { addr: IpAddr, port: u16 },
}

/// Policy decisions consumed by the proxy. Rule parsing and storage live in
/// the embedding application; the proxy only asks questions and routes policy
/// blobs it receives from the routing host.
pub trait PolicyManager: Send + Sync {
    /// May `client` use a server endpoint under the given identity?
    fn check_credentials(&self, client: ClientId, sec_client: &SecClient) -> bool;

    fn is_client_allowed_to_access_member(
        &self,
        sec_client: &SecClient,
        service: Service,
        instance: Instance,
        member: Method,
    ) -> bool;

    fn is_client_allowed_to_offer(
        &self,
        sec_client: &SecClient,
        service: Service,
        instance: Instance,
    ) -> bool;

    fn is_policy_update_allowed(&self, uid: u32, policy: &Bytes) -> bool;

    fn is_policy_removal_allowed(&self, uid: u32) -> bool;

    fn update_security_policy(&self, uid: u32, gid: u32, policy: Bytes);

    fn remove_security_policy(&self, uid: u32, gid: u32);

    /// Remote uid/gid whitelisting distributed by the routing host.
    fn add_security_credentials(&self, uid: u32, gid: u32, routed_by: ClientId);

    fn store_client_to_sec_client_mapping(&self, client: ClientId, sec_client: &SecClient);

    fn remove_client_to_sec_client_mapping(&self, client: ClientId);
}
