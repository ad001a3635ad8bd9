pub mod udp;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::addr::NetworkAddress;

/// The raw network the stack runs on: it can reach direct neighbors only, either one at a time or
///  all at once. Delivery is unreliable, and multi-hop delivery is the stack's business.
///
/// Inbound packets are not part of this abstraction: whatever receives them hands them to
///  [crate::stack::Stack::on_packet].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NetworkMedium: Send + Sync + 'static {
    fn local_addr(&self) -> NetworkAddress;

    async fn send_to(&self, neighbor: NetworkAddress, packet: &[u8]) -> anyhow::Result<()>;

    async fn broadcast(&self, packet: &[u8]) -> anyhow::Result<()>;
}
