use std::fmt::{Debug, Display, Formatter};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use anyhow::bail;
use bytes::{Buf, BufMut};

/// A host's address on the underlying broadcast network. On the wire it is an opaque, fixed-size
///  token of 8 bytes: the IPv4 address (u32 BE) followed by the port, widened to a u32 BE.
///
/// Addresses are plain values: they are compared, hashed and copied, and the stack never looks
///  inside them except for handing them back to the [crate::medium::NetworkMedium].
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NetworkAddress {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl Debug for NetworkAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}:{}]", self.ip, self.port)
    }
}

impl Display for NetworkAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl NetworkAddress {
    pub const SERIALIZED_LEN: usize = 2 * size_of::<u32>();

    /// padding value for unused path slots in routing headers
    pub const UNSPECIFIED: NetworkAddress = NetworkAddress {
        ip: Ipv4Addr::UNSPECIFIED,
        port: 0,
    };

    pub const fn new(ip: Ipv4Addr, port: u16) -> NetworkAddress {
        NetworkAddress { ip, port }
    }

    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.ip.into());
        buf.put_u32(self.port.into());
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<NetworkAddress> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("buffer underflow: a network address needs {} bytes, {} remaining", Self::SERIALIZED_LEN, buf.remaining());
        }

        let ip = Ipv4Addr::from(buf.get_u32());
        let raw_port = buf.get_u32();
        let port = match u16::try_from(raw_port) {
            Ok(port) => port,
            Err(_) => bail!("invalid port in network address: {}", raw_port),
        };

        Ok(NetworkAddress { ip, port })
    }
}

impl From<SocketAddrV4> for NetworkAddress {
    fn from(addr: SocketAddrV4) -> Self {
        NetworkAddress {
            ip: *addr.ip(),
            port: addr.port(),
        }
    }
}
