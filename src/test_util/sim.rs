use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use rand::Rng;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tracing::trace;

use crate::addr::NetworkAddress;
use crate::config::StackConfig;
use crate::medium::NetworkMedium;
use crate::routing_header::{RoutingHeader, RoutingPacketKind};
use crate::stack::Stack;
use crate::transport_header::{StreamHeader, TransportHeader};

/// convenience function for test code: the address of a simulated node, the same number
///  generating the same address and different numbers different addresses
pub fn sim_addr(number: u16) -> NetworkAddress {
    NetworkAddress::new(Ipv4Addr::LOCALHOST, number)
}

/// A packet transmitted over a link of a [SimNetwork]
#[derive(Clone, Debug)]
pub struct SimPacket {
    pub from: NetworkAddress,
    pub to: NetworkAddress,
    pub data: Bytes,
}

impl SimPacket {
    pub fn routing_header(&self) -> Option<RoutingHeader> {
        RoutingHeader::try_deser(&mut self.data.as_ref()).ok()
    }

    /// the header of a data packet carrying stream traffic
    pub fn stream_header(&self) -> Option<StreamHeader> {
        self.stream_packet()
            .map(|(header, _)| header)
    }

    /// the payload of a data packet carrying stream traffic
    pub fn stream_payload(&self) -> Option<Bytes> {
        self.stream_packet()
            .map(|(_, payload)| payload)
    }

    fn stream_packet(&self) -> Option<(StreamHeader, Bytes)> {
        let mut buf = self.data.clone();
        let routing_header = RoutingHeader::try_deser(&mut buf).ok()?;
        if routing_header.kind != RoutingPacketKind::Data {
            return None;
        }
        match TransportHeader::try_deser(&mut buf).ok()? {
            TransportHeader::Stream(header) => Some((header, buf.copy_to_bytes(buf.remaining()))),
            TransportHeader::Datagram(_) => None,
        }
    }
}

type DropFilter = Box<dyn Fn(&SimPacket) -> bool + Send + Sync>;

#[derive(Default)]
struct SimNetworkInner {
    nodes: FxHashMap<NetworkAddress, mpsc::UnboundedSender<Bytes>>,
    /// undirected, stored with the smaller address first
    links: FxHashSet<(NetworkAddress, NetworkAddress)>,
    loss_rate: f64,
    drop_filter: Option<DropFilter>,
    num_broadcasts: usize,
    packets: Vec<SimPacket>,
}

impl SimNetworkInner {
    fn is_linked(&self, a: NetworkAddress, b: NetworkAddress) -> bool {
        self.links.contains(&(a.min(b), a.max(b)))
    }
}

/// An in-memory broadcast network for running several [Stack]s in a single process. Nodes
///  reach each other only over explicitly created links, so arbitrary multi-hop topologies can
///  be set up. Every node processes its inbound packets sequentially in its own task, like a
///  real medium's receive loop.
///
/// Transmissions over links are recorded, including those that are then lost to the loss rate
///  or the drop filter, so tests can inspect the traffic.
#[derive(Clone, Default)]
pub struct SimNetwork {
    inner: Arc<RwLock<SimNetworkInner>>,
}

impl SimNetwork {
    pub fn new() -> SimNetwork {
        Default::default()
    }

    /// Creates a medium for a node of this network without registering the node. Packets sent
    ///  to it are dropped.
    pub fn medium(&self, number: u16) -> SimMedium {
        SimMedium {
            myself: sim_addr(number),
            network: self.clone(),
        }
    }

    /// Creates a stack for a new node and starts feeding it the packets it receives
    pub async fn add_node(&self, number: u16, config: StackConfig) -> anyhow::Result<Arc<Stack>> {
        let stack = Arc::new(Stack::new(Arc::new(self.medium(number)), config)?);

        let (send, mut recv) = mpsc::unbounded_channel::<Bytes>();
        self.inner.write().await
            .nodes.insert(sim_addr(number), send);

        let node = stack.clone();
        tokio::spawn(async move {
            while let Some(packet) = recv.recv().await {
                node.on_packet(&packet).await;
            }
        });
        Ok(stack)
    }

    pub async fn link(&self, a: u16, b: u16) {
        let (a, b) = (sim_addr(a), sim_addr(b));
        self.inner.write().await
            .links.insert((a.min(b), a.max(b)));
    }

    pub async fn unlink(&self, a: u16, b: u16) {
        let (a, b) = (sim_addr(a), sim_addr(b));
        self.inner.write().await
            .links.remove(&(a.min(b), a.max(b)));
    }

    pub async fn set_loss_rate(&self, loss_rate: f64) {
        self.inner.write().await
            .loss_rate = loss_rate;
    }

    /// Installs a filter that decides for each transmission whether it is lost
    pub async fn set_drop_filter(&self, filter: impl Fn(&SimPacket) -> bool + Send + Sync + 'static) {
        self.inner.write().await
            .drop_filter = Some(Box::new(filter));
    }

    pub async fn clear_drop_filter(&self) {
        self.inner.write().await
            .drop_filter = None;
    }

    /// The number of broadcasts by any node, each counting once regardless of the number of
    ///  neighbors it reached
    pub async fn num_broadcasts(&self) -> usize {
        self.inner.read().await
            .num_broadcasts
    }

    pub async fn packets(&self) -> Vec<SimPacket> {
        self.inner.read().await
            .packets.clone()
    }

    pub async fn clear_packets(&self) {
        self.inner.write().await
            .packets.clear();
    }

    async fn neighbors(&self, of: NetworkAddress) -> Vec<NetworkAddress> {
        let inner = self.inner.read().await;
        inner.nodes.keys()
            .filter(|&&addr| addr != of && inner.is_linked(of, addr))
            .cloned()
            .collect()
    }

    async fn transmit(&self, from: NetworkAddress, to: NetworkAddress, data: &[u8]) {
        let mut inner = self.inner.write().await;

        if from != to && !inner.is_linked(from, to) {
            trace!("{:?} is not a neighbor of {:?} - dropping packet", to, from);
            return;
        }

        let packet = SimPacket {
            from,
            to,
            data: Bytes::copy_from_slice(data),
        };
        inner.packets.push(packet.clone());

        // loopback is reliable
        if from != to {
            if inner.loss_rate > 0.0 && rand::thread_rng().gen_bool(inner.loss_rate) {
                trace!("simulating loss of packet from {:?} to {:?}", from, to);
                return;
            }
            if inner.drop_filter.as_ref().is_some_and(|filter| filter(&packet)) {
                trace!("drop filter discarded packet from {:?} to {:?}", from, to);
                return;
            }
        }

        if let Some(node) = inner.nodes.get(&to) {
            // a node whose task ended just does not receive anything anymore
            let _ = node.send(packet.data);
        }
    }
}

/// A node's view of a [SimNetwork]
pub struct SimMedium {
    myself: NetworkAddress,
    network: SimNetwork,
}

#[async_trait]
impl NetworkMedium for SimMedium {
    fn local_addr(&self) -> NetworkAddress {
        self.myself
    }

    async fn send_to(&self, neighbor: NetworkAddress, packet: &[u8]) -> anyhow::Result<()> {
        self.network.transmit(self.myself, neighbor, packet).await;
        Ok(())
    }

    async fn broadcast(&self, packet: &[u8]) -> anyhow::Result<()> {
        self.network.inner.write().await
            .num_broadcasts += 1;
        for neighbor in self.network.neighbors(self.myself).await {
            self.network.transmit(self.myself, neighbor, packet).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transmit_needs_link() {
        let network = SimNetwork::new();
        let (send, mut recv) = mpsc::unbounded_channel();
        network.inner.write().await
            .nodes.insert(sim_addr(2), send);

        let medium = network.medium(1);
        medium.send_to(sim_addr(2), b"a").await.unwrap();
        assert!(recv.try_recv().is_err());
        assert!(network.packets().await.is_empty());

        network.link(2, 1).await;
        medium.send_to(sim_addr(2), b"b").await.unwrap();
        assert_eq!(recv.try_recv().unwrap().as_ref(), b"b");

        network.unlink(1, 2).await;
        medium.send_to(sim_addr(2), b"c").await.unwrap();
        assert!(recv.try_recv().is_err());
        assert_eq!(network.packets().await.len(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_neighbors_only() {
        let network = SimNetwork::new();
        let mut receivers = Vec::new();
        for number in 2..=4 {
            let (send, recv) = mpsc::unbounded_channel();
            network.inner.write().await
                .nodes.insert(sim_addr(number), send);
            receivers.push(recv);
        }
        network.link(1, 2).await;
        network.link(1, 3).await;
        network.link(3, 4).await;

        network.medium(1).broadcast(b"x").await.unwrap();
        assert!(receivers[0].try_recv().is_ok());
        assert!(receivers[1].try_recv().is_ok());
        assert!(receivers[2].try_recv().is_err());
        assert_eq!(network.num_broadcasts().await, 1);
    }

    #[tokio::test]
    async fn test_drop_filter_and_loss() {
        let network = SimNetwork::new();
        let (send, mut recv) = mpsc::unbounded_channel();
        network.inner.write().await
            .nodes.insert(sim_addr(2), send);
        network.link(1, 2).await;
        let medium = network.medium(1);

        network.set_drop_filter(|p| p.data.as_ref() == b"drop").await;
        medium.send_to(sim_addr(2), b"drop").await.unwrap();
        medium.send_to(sim_addr(2), b"keep").await.unwrap();
        assert_eq!(recv.try_recv().unwrap().as_ref(), b"keep");
        assert!(recv.try_recv().is_err());

        network.clear_drop_filter().await;
        network.set_loss_rate(1.0).await;
        medium.send_to(sim_addr(2), b"lost").await.unwrap();
        assert!(recv.try_recv().is_err());

        // transmissions are recorded whether they arrive or not
        assert_eq!(network.packets().await.len(), 3);
    }
}
