pub mod route_cache;

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, error, trace, warn};

use crate::addr::NetworkAddress;
use crate::config::StackConfig;
use crate::error::RouteError;
use crate::medium::NetworkMedium;
use crate::routing::route_cache::RouteCache;
use crate::routing_header::{RoutePath, RoutingHeader, RoutingPacketKind, MAX_HOPS};

/// Source routing on top of the network medium: sends transport packets along discovered paths,
///  takes part in other nodes' route discovery, and forwards packets that pass through this node.
#[derive(Clone)]
pub struct Router {
    myself: NetworkAddress,
    config: Arc<StackConfig>,
    medium: Arc<dyn NetworkMedium>,
    route_cache: RouteCache,
}

impl Router {
    pub fn new(config: Arc<StackConfig>, medium: Arc<dyn NetworkMedium>) -> Router {
        Router {
            myself: medium.local_addr(),
            route_cache: RouteCache::new(config.clone(), medium.clone()),
            config,
            medium,
        }
    }

    pub fn route_cache(&self) -> &RouteCache {
        &self.route_cache
    }

    /// Sends a transport packet (transport header and payload) to `destination`, discovering a
    ///  route first if necessary. Returns the number of transport bytes sent.
    pub async fn send(&self, destination: NetworkAddress, transport_packet: &[u8]) -> Result<usize, RouteError> {
        let packet_len = RoutingHeader::SERIALIZED_LEN + transport_packet.len();
        if packet_len > self.config.max_packet_size {
            return Err(RouteError::PacketTooLarge { len: packet_len, max: self.config.max_packet_size });
        }

        let path = self.route_cache.resolve(destination).await?;
        let next_hop = if destination == self.myself {
            self.myself
        }
        else {
            match path.next_hop_after(&self.myself) {
                Some(next_hop) => next_hop,
                None => {
                    error!("resolved route to {:?} has no next hop: {:?}", destination, path);
                    return Err(RouteError::Unreachable);
                }
            }
        };

        let mut buf = BytesMut::with_capacity(packet_len);
        RoutingHeader::data(destination, path).ser(&mut buf);
        buf.put_slice(transport_packet);

        trace!("sending {} bytes to {:?} via {:?}", transport_packet.len(), destination, next_hop);
        self.medium.send_to(next_hop, &buf).await?;
        Ok(transport_packet.len())
    }

    /// Sends a packet from a context that must not wait for route discovery, namely while
    ///  processing an inbound packet. Discovery needs inbound packets to be processed, so waiting
    ///  for it there would stall the receive loop.
    pub fn send_detached(&self, destination: NetworkAddress, transport_packet: Bytes) {
        let router = self.clone();
        tokio::spawn(async move {
            if let Err(e) = router.send(destination, &transport_packet).await {
                debug!("error sending packet to {:?}: {}", destination, e);
            }
        });
    }

    /// Handles an inbound routing packet of any kind. Returns the transport payload if it is a
    ///  data packet addressed to this node, `None` if the packet was consumed here.
    pub async fn on_packet<'a>(&self, header: RoutingHeader, payload: &'a [u8]) -> Option<&'a [u8]> {
        match header.kind {
            RoutingPacketKind::Discovery => {
                self.on_discovery(header).await;
                None
            }
            RoutingPacketKind::Reply => {
                if header.destination == self.myself {
                    self.route_cache.on_reply(header.discovery_id, &header.path).await;
                }
                else {
                    self.forward(header, &[]).await;
                }
                None
            }
            RoutingPacketKind::Data => {
                if header.destination == self.myself {
                    Some(payload)
                }
                else {
                    self.forward(header, payload).await;
                    None
                }
            }
        }
    }

    async fn on_discovery(&self, mut header: RoutingHeader) {
        if header.destination == self.myself {
            self.reply_to_discovery(header).await;
            return;
        }

        header.ttl = header.ttl.saturating_sub(1);
        if header.ttl == 0 {
            trace!("discovery for {:?} ran out of ttl - dropping", header.destination);
            return;
        }
        if header.path.contains(&self.myself) {
            trace!("discovery for {:?} already passed through this node - dropping", header.destination);
            return;
        }
        if header.path.try_push(self.myself).is_err() {
            debug!("discovery for {:?} exceeds {} hops - dropping", header.destination, MAX_HOPS);
            return;
        }

        let mut buf = BytesMut::with_capacity(RoutingHeader::SERIALIZED_LEN);
        header.ser(&mut buf);
        trace!("re-broadcasting discovery #{} for {:?}: {:?}", header.discovery_id, header.destination, header.path);
        if let Err(e) = self.medium.broadcast(&buf).await {
            error!("error re-broadcasting discovery: {}", e);
        }
    }

    async fn reply_to_discovery(&self, header: RoutingHeader) {
        let mut path = header.path;
        if path.contains(&self.myself) {
            // our own discovery came back to us
            return;
        }
        if path.try_push(self.myself).is_err() {
            debug!("discovery from {:?} exceeds {} hops - not replying", path.first(), MAX_HOPS);
            return;
        }

        let originator = path.first();
        let reply_path = path.reversed();
        let Some(next_hop) = reply_path.next_hop_after(&self.myself) else {
            return;
        };

        let reply = RoutingHeader {
            kind: RoutingPacketKind::Reply,
            destination: originator,
            discovery_id: header.discovery_id,
            ttl: MAX_HOPS as u32,
            path: reply_path,
        };
        let mut buf = BytesMut::with_capacity(RoutingHeader::SERIALIZED_LEN);
        reply.ser(&mut buf);

        debug!("replying to discovery #{} from {:?} via {:?}", header.discovery_id, originator, next_hop);
        if let Err(e) = self.medium.send_to(next_hop, &buf).await {
            error!("error sending route reply to {:?}: {}", next_hop, e);
        }
    }

    /// Passes a reply or data packet that is not addressed to this node on to the next hop of
    ///  its embedded path.
    async fn forward(&self, mut header: RoutingHeader, payload: &[u8]) {
        header.ttl = header.ttl.saturating_sub(1);
        if header.ttl == 0 {
            debug!("{:?} packet for {:?} ran out of ttl - dropping", header.kind, header.destination);
            return;
        }

        let Some(next_hop) = header.path.next_hop_after(&self.myself) else {
            warn!("{:?} packet for {:?} does not route through this node: {:?} - dropping", header.kind, header.destination, header.path);
            return;
        };

        let mut buf = BytesMut::with_capacity(RoutingHeader::SERIALIZED_LEN + payload.len());
        header.ser(&mut buf);
        buf.put_slice(payload);

        trace!("forwarding {:?} packet for {:?} to {:?}", header.kind, header.destination, next_hop);
        if let Err(e) = self.medium.send_to(next_hop, &buf).await {
            error!("error forwarding packet to {:?}: {}", next_hop, e);
        }
    }

    pub async fn resolve(&self, destination: NetworkAddress) -> Result<RoutePath, RouteError> {
        self.route_cache.resolve(destination).await
    }
}
