use std::time::Duration;

use anyhow::bail;

use crate::routing_header::RoutingHeader;
use crate::transport_header::{DatagramHeader, StreamHeader};

pub struct StackConfig {
    /// This is the maximum number of bytes handed to the network medium in a single packet,
    ///  routing header included. It bounds the size of datagrams and determines how stream
    ///  payload is split into fragments.
    ///
    /// All nodes of a network should agree on this value: a node receiving a packet that exceeds
    ///  its own limit is free to drop it.
    pub max_packet_size: usize,

    /// Time after which an unanswered route discovery is broadcast again with a new discovery id
    pub discovery_retry_interval: Duration,
    /// The number of discovery broadcasts for a destination before resolution fails
    pub max_discovery_retries: u32,
    /// A resolved route is discarded after this interval so that topology changes are picked up
    pub route_eviction_interval: Duration,

    /// The first retransmission of a stream packet happens after this timeout, doubling with
    ///  every subsequent retry
    pub stream_base_timeout: Duration,
    pub stream_max_tries: u32,
    /// Time a socket closed by its peer stays around to acknowledge retransmitted FIN packets
    pub close_grace_period: Duration,

    pub socket_server_max: u16,
    pub socket_client_max: u16,
}

impl Default for StackConfig {
    fn default() -> Self {
        StackConfig {
            max_packet_size: 8192,
            discovery_retry_interval: Duration::from_secs(15),
            max_discovery_retries: 3,
            route_eviction_interval: Duration::from_secs(3),
            stream_base_timeout: Duration::from_millis(100),
            stream_max_tries: 7,
            close_grace_period: Duration::from_secs(15),
            socket_server_max: 32767,
            socket_client_max: u16::MAX,
        }
    }
}

impl StackConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_packet_size <= RoutingHeader::SERIALIZED_LEN + StreamHeader::SERIALIZED_LEN {
            bail!("max packet size {} leaves no room for stream payload", self.max_packet_size);
        }
        if self.max_discovery_retries == 0 {
            bail!("max discovery retries must be positive");
        }
        if self.stream_max_tries == 0 {
            bail!("max stream tries must be positive");
        }
        if self.stream_base_timeout.is_zero() {
            bail!("stream base timeout must be positive");
        }
        if self.socket_server_max >= self.socket_client_max {
            bail!("server port range [0, {}] leaves no client ports below {}", self.socket_server_max, self.socket_client_max);
        }
        Ok(())
    }

    /// the maximum number of payload bytes in a single datagram
    pub fn max_datagram_payload(&self) -> usize {
        self.max_packet_size - RoutingHeader::SERIALIZED_LEN - DatagramHeader::SERIALIZED_LEN
    }

    /// the maximum number of payload bytes in a single stream fragment
    pub fn max_stream_fragment(&self) -> usize {
        self.max_packet_size - RoutingHeader::SERIALIZED_LEN - StreamHeader::SERIALIZED_LEN
    }
}
