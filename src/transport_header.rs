use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::addr::NetworkAddress;

/// The protocol tag is the first byte of every transport header, and it determines how the
///  rest of the header is laid out.
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Protocol {
    Datagram = 1,
    Stream = 2,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum StreamMessageType {
    Syn = 1,
    SynAck = 2,
    Ack = 3,
    Fin = 4,
}

/// Datagram header:
///
/// ```ascii
///  0: protocol (u8) = 1
///  1: source port (u16)
///  3: source address (8 bytes)
/// 11: destination port (u16)
/// 13: destination address (8 bytes)
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DatagramHeader {
    pub source_port: u16,
    pub source_addr: NetworkAddress,
    pub dest_port: u16,
    pub dest_addr: NetworkAddress,
}

impl DatagramHeader {
    pub const SERIALIZED_LEN: usize = 1 + 2 * (size_of::<u16>() + NetworkAddress::SERIALIZED_LEN);

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(Protocol::Datagram.into());
        self.ser_addressing(buf);
    }

    fn ser_addressing(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.source_port);
        self.source_addr.ser(buf);
        buf.put_u16(self.dest_port);
        self.dest_addr.ser(buf);
    }

    /// reads the part of the header after the protocol tag
    fn deser_addressing(buf: &mut impl Buf) -> anyhow::Result<DatagramHeader> {
        let source_port = buf.get_u16();
        let source_addr = NetworkAddress::try_deser(buf)?;
        let dest_port = buf.get_u16();
        let dest_addr = NetworkAddress::try_deser(buf)?;
        Ok(DatagramHeader {
            source_port,
            source_addr,
            dest_port,
            dest_addr,
        })
    }
}

/// Stream header: the same addressing fields as [DatagramHeader], followed by
///
/// ```ascii
/// 21: message type (u8): 1 = SYN, 2 = SYNACK, 3 = ACK, 4 = FIN
/// 22: sequence number (u32)
/// 26: ack number (u32)
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StreamHeader {
    pub source_port: u16,
    pub source_addr: NetworkAddress,
    pub dest_port: u16,
    pub dest_addr: NetworkAddress,
    pub message_type: StreamMessageType,
    pub seq: u32,
    pub ack: u32,
}

impl StreamHeader {
    pub const SERIALIZED_LEN: usize = DatagramHeader::SERIALIZED_LEN + 1 + 2 * size_of::<u32>();

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(Protocol::Stream.into());
        buf.put_u16(self.source_port);
        self.source_addr.ser(buf);
        buf.put_u16(self.dest_port);
        self.dest_addr.ser(buf);
        buf.put_u8(self.message_type.into());
        buf.put_u32(self.seq);
        buf.put_u32(self.ack);
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TransportHeader {
    Datagram(DatagramHeader),
    Stream(StreamHeader),
}

impl TransportHeader {
    pub fn protocol(&self) -> Protocol {
        match self {
            TransportHeader::Datagram(_) => Protocol::Datagram,
            TransportHeader::Stream(_) => Protocol::Stream,
        }
    }

    pub fn dest_port(&self) -> u16 {
        match self {
            TransportHeader::Datagram(h) => h.dest_port,
            TransportHeader::Stream(h) => h.dest_port,
        }
    }

    /// Reads a transport header of either kind, leaving `buf` positioned at the start of the
    ///  payload. Fails without consuming a partial header if the buffer is too short.
    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<TransportHeader> {
        if !buf.has_remaining() {
            bail!("buffer underflow: missing protocol tag");
        }
        let raw_protocol = buf.chunk()[0];
        let protocol = Protocol::try_from(raw_protocol)
            .map_err(|_| anyhow!("invalid protocol tag {}", raw_protocol))?;

        let required_len = match protocol {
            Protocol::Datagram => DatagramHeader::SERIALIZED_LEN,
            Protocol::Stream => StreamHeader::SERIALIZED_LEN,
        };
        if buf.remaining() < required_len {
            bail!("buffer underflow: {:?} header needs {} bytes, {} remaining", protocol, required_len, buf.remaining());
        }
        buf.advance(1);

        let addressing = DatagramHeader::deser_addressing(buf)?;
        match protocol {
            Protocol::Datagram => Ok(TransportHeader::Datagram(addressing)),
            Protocol::Stream => {
                let raw_type = buf.get_u8();
                let message_type = StreamMessageType::try_from(raw_type)
                    .map_err(|_| anyhow!("invalid stream message type {}", raw_type))?;
                let seq = buf.get_u32();
                let ack = buf.get_u32();
                Ok(TransportHeader::Stream(StreamHeader {
                    source_port: addressing.source_port,
                    source_addr: addressing.source_addr,
                    dest_port: addressing.dest_port,
                    dest_addr: addressing.dest_addr,
                    message_type,
                    seq,
                    ack,
                }))
            }
        }
    }
}
