use bytes::Buf;
use tracing::{debug, trace, warn};

use crate::datagram::DatagramService;
use crate::ports::UNBOUND_PORTS;
use crate::routing::Router;
use crate::routing_header::RoutingHeader;
use crate::stream::StreamEngine;
use crate::transport_header::{Protocol, TransportHeader};

/// Entry point for every raw packet arriving from the network medium. Routing control traffic
///  and packets passing through this node are handled by the [Router]; transport packets
///  addressed to this node are handed to the datagram or stream layer by destination port.
#[derive(Clone)]
pub struct Dispatcher {
    router: Router,
    datagrams: DatagramService,
    streams: StreamEngine,
}

impl Dispatcher {
    pub fn new(router: Router, datagrams: DatagramService, streams: StreamEngine) -> Dispatcher {
        Dispatcher {
            router,
            datagrams,
            streams,
        }
    }

    pub async fn on_packet(&self, packet: &[u8]) {
        trace!("received packet of {} bytes", packet.len());

        let parse_buf = &mut &packet[..];
        let routing_header = match RoutingHeader::try_deser(parse_buf) {
            Ok(header) => header,
            Err(e) => {
                warn!("received packet with unparsable routing header: {} - dropping", e);
                return;
            }
        };

        if let Some(transport_packet) = self.router.on_packet(routing_header, parse_buf.chunk()).await {
            self.demux(transport_packet).await;
        }
    }

    async fn demux(&self, transport_packet: &[u8]) {
        let parse_buf = &mut &transport_packet[..];
        let header = match TransportHeader::try_deser(parse_buf) {
            Ok(header) => header,
            Err(e) => {
                warn!("received packet with unparsable transport header: {} - dropping", e);
                return;
            }
        };
        let payload = parse_buf.chunk();

        let dest_port = header.dest_port();
        let is_valid_port = match header.protocol() {
            Protocol::Datagram => UNBOUND_PORTS.contains(&dest_port),
            Protocol::Stream => dest_port <= self.streams.config.socket_client_max,
        };
        if !is_valid_port {
            debug!("{:?} packet for port {} outside the port range - dropping", header.protocol(), dest_port);
            return;
        }

        match header {
            TransportHeader::Datagram(header) => self.datagrams.on_packet(header, payload).await,
            TransportHeader::Stream(header) => self.streams.on_packet(header, payload).await,
        }
    }
}
