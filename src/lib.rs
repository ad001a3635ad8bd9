//! A host-to-host network stack on top of a medium that only reaches direct neighbors. It
//!  provides three services:
//!
//! * unreliable datagrams between numbered ports ([ports], [datagram])
//! * multi-hop source routing with on-demand route discovery by flooding ([routing])
//! * reliable, ordered byte streams with handshake, retransmission and close ([stream])
//!
//! A [stack::Stack] ties these together for a single node. It sends through a
//!  [medium::NetworkMedium] and must be fed every packet the medium receives.
//!
//! Every packet starts with a routing header (see [routing_header::RoutingHeader]), which for
//!  data packets is followed by a transport header (see [transport_header]) and the payload:
//!
//! ```ascii
//! +----------------+------------------+---------+
//! | routing header | transport header | payload |
//! |   (181 bytes)  | (21 or 30 bytes) |         |
//! +----------------+------------------+---------+
//! ```
//!
//! All integers on the wire are big endian and fixed width.

pub mod addr;
pub mod config;
pub mod datagram;
pub mod dispatch;
pub mod error;
pub mod medium;
pub mod ports;
pub mod routing;
pub mod routing_header;
pub mod stack;
pub mod stream;
pub mod test_util;
pub mod transport_header;
