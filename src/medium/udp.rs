use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use rand::Rng;
use tokio::net::UdpSocket;
use tracing::{debug, error, info, trace};

use crate::addr::NetworkAddress;
use crate::medium::NetworkMedium;
use crate::stack::Stack;

/// A [NetworkMedium] on top of UDP / IPv4. The 'broadcast' neighborhood is an explicitly
///  configured list of peers, which allows emulating arbitrary multi-hop topologies with several
///  processes on a single machine. Packets from hosts that are not neighbors are dropped on
///  receipt.
///
/// Outgoing packets can be dropped at random with a configured probability to exercise the
///  stack's retry logic.
pub struct UdpMedium {
    socket: UdpSocket,
    local_addr: NetworkAddress,
    neighbors: Vec<NetworkAddress>,
    loss_rate: f64,
}

impl UdpMedium {
    pub async fn bind(addr: SocketAddrV4, neighbors: Vec<NetworkAddress>, loss_rate: f64) -> anyhow::Result<UdpMedium> {
        if addr.ip().is_unspecified() {
            bail!("a concrete local address is required because it identifies this node in routes");
        }
        if !(0.0..=1.0).contains(&loss_rate) {
            bail!("loss rate must be in [0, 1], was {}", loss_rate);
        }

        let socket = UdpSocket::bind(addr).await?;
        let local_addr = match socket.local_addr()? {
            SocketAddr::V4(a) => NetworkAddress::from(a),
            SocketAddr::V6(a) => bail!("bound to IPv6 address {:?}", a),
        };
        info!("bound UDP medium to {:?}, neighbors {:?}", local_addr, neighbors);

        Ok(UdpMedium {
            socket,
            local_addr,
            neighbors,
            loss_rate,
        })
    }

    fn is_lost(&self) -> bool {
        self.loss_rate > 0.0 && rand::thread_rng().gen_bool(self.loss_rate)
    }

    async fn do_send(&self, to: NetworkAddress, packet: &[u8]) -> anyhow::Result<()> {
        if self.is_lost() {
            trace!("simulating loss of packet to {:?}", to);
            return Ok(());
        }
        self.socket.send_to(packet, to.to_socket_addr()).await?;
        Ok(())
    }

    /// Receives packets and feeds them into the stack until the socket fails irrecoverably.
    pub async fn recv_loop(&self, stack: Arc<Stack>) {
        info!("starting receive loop");

        let mut buf = vec![0u8; u16::MAX as usize];
        loop {
            let (num_read, from) = match self.socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            };

            let from = match from {
                SocketAddr::V4(a) => NetworkAddress::from(a),
                SocketAddr::V6(_) => {
                    debug!("received packet from IPv6 address {:?} - dropping", from);
                    continue;
                }
            };
            if from != self.local_addr && !self.neighbors.contains(&from) {
                trace!("received packet from non-neighbor {:?} - dropping", from);
                continue;
            }

            stack.on_packet(&buf[..num_read]).await;
        }
    }
}

#[async_trait]
impl NetworkMedium for UdpMedium {
    fn local_addr(&self) -> NetworkAddress {
        self.local_addr
    }

    async fn send_to(&self, neighbor: NetworkAddress, packet: &[u8]) -> anyhow::Result<()> {
        self.do_send(neighbor, packet).await
    }

    async fn broadcast(&self, packet: &[u8]) -> anyhow::Result<()> {
        for &neighbor in &self.neighbors {
            self.do_send(neighbor, packet).await?;
        }
        Ok(())
    }
}
