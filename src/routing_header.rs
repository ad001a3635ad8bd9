use std::fmt::{Debug, Formatter};

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::addr::NetworkAddress;

/// The maximum number of addresses in a route, including both end points. This is a hard
///  capacity: it fixes the size of the routing header on the wire, and no path can ever grow
///  beyond it.
pub const MAX_HOPS: usize = 20;

#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum RoutingPacketKind {
    Discovery = 1,
    Reply = 2,
    Data = 3,
}

/// An ordered list of hops, starting with the node that originated a discovery (or that sends
///  data) and ending with the destination. It is never empty and never longer than [MAX_HOPS].
#[derive(Clone, Eq, PartialEq)]
pub struct RoutePath(Vec<NetworkAddress>);

impl Debug for RoutePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl RoutePath {
    pub fn new(origin: NetworkAddress) -> RoutePath {
        RoutePath(vec![origin])
    }

    pub fn from_hops(hops: Vec<NetworkAddress>) -> anyhow::Result<RoutePath> {
        if hops.is_empty() {
            bail!("a route path must contain at least one hop");
        }
        if hops.len() > MAX_HOPS {
            bail!("a route path can have at most {} hops, was {}", MAX_HOPS, hops.len());
        }
        Ok(RoutePath(hops))
    }

    pub fn hops(&self) -> &[NetworkAddress] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.0.len() >= MAX_HOPS
    }

    pub fn first(&self) -> NetworkAddress {
        self.0[0]
    }

    pub fn last(&self) -> NetworkAddress {
        self.0[self.0.len() - 1]
    }

    pub fn contains(&self, addr: &NetworkAddress) -> bool {
        self.0.contains(addr)
    }

    /// The hop following `addr` in this path, if `addr` is part of the path and not its last hop
    pub fn next_hop_after(&self, addr: &NetworkAddress) -> Option<NetworkAddress> {
        let idx = self.0.iter().position(|a| a == addr)?;
        self.0.get(idx + 1).copied()
    }

    pub fn try_push(&mut self, addr: NetworkAddress) -> anyhow::Result<()> {
        if self.is_full() {
            bail!("route path is full ({} hops), cannot append {:?}", MAX_HOPS, addr);
        }
        self.0.push(addr);
        Ok(())
    }

    pub fn reversed(&self) -> RoutePath {
        RoutePath(self.0.iter().rev().copied().collect())
    }
}

/// Routing header, prepended to every packet handed to the network medium. All numbers are BE:
///
/// ```ascii
///   0: packet kind (u8): 1 = discovery, 2 = reply, 3 = data
///   1: destination address (8 bytes)
///   9: discovery id (u32)
///  13: ttl (u32)
///  17: path length (u32) - number of valid entries in the path array, 1..=MAX_HOPS
///  21: path (MAX_HOPS * 8 bytes), unused entries are zero
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RoutingHeader {
    pub kind: RoutingPacketKind,
    pub destination: NetworkAddress,
    pub discovery_id: u32,
    pub ttl: u32,
    pub path: RoutePath,
}

impl RoutingHeader {
    pub const SERIALIZED_LEN: usize = 1
        + NetworkAddress::SERIALIZED_LEN
        + 3 * size_of::<u32>()
        + MAX_HOPS * NetworkAddress::SERIALIZED_LEN;

    pub fn discovery(destination: NetworkAddress, discovery_id: u32, origin: NetworkAddress) -> RoutingHeader {
        RoutingHeader {
            kind: RoutingPacketKind::Discovery,
            destination,
            discovery_id,
            ttl: MAX_HOPS as u32,
            path: RoutePath::new(origin),
        }
    }

    pub fn data(destination: NetworkAddress, path: RoutePath) -> RoutingHeader {
        RoutingHeader {
            kind: RoutingPacketKind::Data,
            destination,
            discovery_id: 0,
            ttl: MAX_HOPS as u32,
            path,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.kind.into());
        self.destination.ser(buf);
        buf.put_u32(self.discovery_id);
        buf.put_u32(self.ttl);
        buf.put_u32(self.path.len() as u32);
        for addr in self.path.hops() {
            addr.ser(buf);
        }
        for _ in self.path.len()..MAX_HOPS {
            NetworkAddress::UNSPECIFIED.ser(buf);
        }
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<RoutingHeader> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("buffer underflow: routing header needs {} bytes, {} remaining", Self::SERIALIZED_LEN, buf.remaining());
        }

        let raw_kind = buf.get_u8();
        let kind = RoutingPacketKind::try_from(raw_kind)
            .map_err(|_| anyhow!("invalid routing packet kind {}", raw_kind))?;
        let destination = NetworkAddress::try_deser(buf)?;
        let discovery_id = buf.get_u32();
        let ttl = buf.get_u32();

        let path_len = buf.get_u32() as usize;
        if path_len == 0 || path_len > MAX_HOPS {
            bail!("invalid path length {}", path_len);
        }

        let mut hops = Vec::with_capacity(path_len);
        for i in 0..MAX_HOPS {
            let addr = NetworkAddress::try_deser(buf)?;
            if i < path_len {
                hops.push(addr);
            }
        }

        Ok(RoutingHeader {
            kind,
            destination,
            discovery_id,
            ttl,
            path: RoutePath(hops),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use bytes::BytesMut;
    use rstest::rstest;

    use super::*;

    fn addr(n: u8) -> NetworkAddress {
        NetworkAddress::new(Ipv4Addr::new(10, 0, 0, n), 4000 + n as u16)
    }

    fn path(hops: &[u8]) -> RoutePath {
        RoutePath::from_hops(hops.iter().map(|&n| addr(n)).collect()).unwrap()
    }

    /// serialized form of the fixed part of a header, followed by the given number of path
    ///  entries (as raw bytes) and zero padding
    fn raw_header(kind: u8, dest: u8, id: u32, ttl: u32, path_len: u32, hops: &[u8]) -> Vec<u8> {
        let mut result = vec![kind];
        result.extend_from_slice(&[10, 0, 0, dest]);
        result.extend_from_slice(&(4000u32 + dest as u32).to_be_bytes());
        result.extend_from_slice(&id.to_be_bytes());
        result.extend_from_slice(&ttl.to_be_bytes());
        result.extend_from_slice(&path_len.to_be_bytes());
        for &n in hops {
            result.extend_from_slice(&[10, 0, 0, n]);
            result.extend_from_slice(&(4000u32 + n as u32).to_be_bytes());
        }
        result.resize(RoutingHeader::SERIALIZED_LEN, 0);
        result
    }

    #[test]
    fn test_serialized_len() {
        assert_eq!(RoutingHeader::SERIALIZED_LEN, 181);
    }

    #[rstest]
    #[case::discovery(RoutingHeader::discovery(addr(3), 7, addr(1)), raw_header(1, 3, 7, 20, 1, &[1]))]
    #[case::reply(RoutingHeader { kind: RoutingPacketKind::Reply, destination: addr(1), discovery_id: 2, ttl: 19, path: path(&[3,2,1]) }, raw_header(2, 1, 2, 19, 3, &[3,2,1]))]
    #[case::data(RoutingHeader::data(addr(3), path(&[1,2,3])), raw_header(3, 3, 0, 20, 3, &[1,2,3]))]
    fn test_ser(#[case] header: RoutingHeader, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        assert_eq!(buf.as_ref(), expected.as_slice());
    }

    #[rstest]
    #[case::discovery(raw_header(1, 3, 7, 20, 1, &[1]), Some(RoutingHeader::discovery(addr(3), 7, addr(1))))]
    #[case::data(raw_header(3, 3, 0, 20, 3, &[1,2,3]), Some(RoutingHeader::data(addr(3), path(&[1,2,3]))))]
    #[case::full_path(raw_header(3, 20, 0, 1, 20, &(1..=20).collect::<Vec<u8>>()), Some(RoutingHeader { kind: RoutingPacketKind::Data, destination: addr(20), discovery_id: 0, ttl: 1, path: path(&(1..=20).collect::<Vec<u8>>()) }))]
    #[case::bad_kind(raw_header(9, 3, 7, 20, 1, &[1]), None)]
    #[case::empty_path(raw_header(1, 3, 7, 20, 0, &[]), None)]
    #[case::path_too_long(raw_header(1, 3, 7, 20, 21, &[1]), None)]
    #[case::too_short(raw_header(1, 3, 7, 20, 1, &[1])[..180].to_vec(), None)]
    fn test_try_deser(#[case] raw: Vec<u8>, #[case] expected: Option<RoutingHeader>) {
        let mut buf = raw.as_slice();
        match RoutingHeader::try_deser(&mut buf) {
            Ok(actual) => {
                assert_eq!(Some(actual), expected);
                assert!(buf.is_empty());
            }
            Err(e) => {
                println!("{}", e);
                assert!(expected.is_none());
            }
        }
    }

    #[test]
    fn test_try_deser_leaves_payload() {
        let mut raw = raw_header(3, 3, 0, 20, 2, &[1,3]);
        raw.extend_from_slice(b"payload");
        let mut buf = raw.as_slice();
        RoutingHeader::try_deser(&mut buf).unwrap();
        assert_eq!(buf, b"payload");
    }

    #[rstest]
    #[case::middle(&[1,2,3], 2, Some(3))]
    #[case::first(&[1,2,3], 1, Some(2))]
    #[case::last(&[1,2,3], 3, None)]
    #[case::absent(&[1,2,3], 4, None)]
    fn test_next_hop_after(#[case] hops: &[u8], #[case] current: u8, #[case] expected: Option<u8>) {
        assert_eq!(path(hops).next_hop_after(&addr(current)), expected.map(addr));
    }

    #[test]
    fn test_try_push_is_bounded() {
        let mut p = path(&(1..=19).collect::<Vec<u8>>());
        assert!(!p.is_full());
        p.try_push(addr(20)).unwrap();
        assert!(p.is_full());
        assert!(p.try_push(addr(21)).is_err());
        assert_eq!(p.len(), MAX_HOPS);
    }

    #[test]
    fn test_reversed() {
        assert_eq!(path(&[1,2,3]).reversed(), path(&[3,2,1]));
        assert_eq!(path(&[1]).reversed(), path(&[1]));
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::too_long((1..=21).map(addr).collect())]
    fn test_from_hops_invalid(#[case] hops: Vec<NetworkAddress>) {
        assert!(RoutePath::from_hops(hops).is_err());
    }
}
