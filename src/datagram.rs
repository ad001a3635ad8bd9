use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, trace};

use crate::addr::NetworkAddress;
use crate::config::StackConfig;
use crate::error::{DatagramError, PortError};
use crate::ports::{BoundPort, Datagram, PortRegistry, UnboundPort};
use crate::routing::Router;
use crate::transport_header::DatagramHeader;

/// A datagram taken from an unbound port, together with a bound port targeting its sender.
///  The reply port belongs to the caller, who should hand it back to the registry when done.
#[derive(Debug)]
pub struct ReceivedDatagram {
    pub source_addr: NetworkAddress,
    pub source_port: u16,
    pub payload: Bytes,
    pub reply_port: BoundPort,
}

/// Unreliable, unordered messages between ports. Sending discovers a route if necessary, but
///  there are no retries beyond that: a datagram lost on the way is lost.
#[derive(Clone)]
pub struct DatagramService {
    myself: NetworkAddress,
    config: Arc<StackConfig>,
    ports: Arc<PortRegistry>,
    router: Router,
}

impl DatagramService {
    pub fn new(myself: NetworkAddress, config: Arc<StackConfig>, router: Router) -> DatagramService {
        DatagramService {
            myself,
            config,
            ports: Default::default(),
            router,
        }
    }

    pub fn ports(&self) -> &PortRegistry {
        &self.ports
    }

    /// Sends `payload` to the target of `to`. The receiver sees `from` as the datagram's source
    ///  port, so that is where replies arrive.
    pub async fn send(&self, from: &UnboundPort, to: &BoundPort, payload: &[u8]) -> Result<usize, DatagramError> {
        let max = self.config.max_datagram_payload();
        if payload.len() > max {
            return Err(PortError::PayloadTooLarge { len: payload.len(), max }.into());
        }

        let mut buf = BytesMut::with_capacity(DatagramHeader::SERIALIZED_LEN + payload.len());
        DatagramHeader {
            source_port: from.number(),
            source_addr: self.myself,
            dest_port: to.remote_port(),
            dest_addr: to.remote_addr(),
        }.ser(&mut buf);
        buf.put_slice(payload);

        trace!("sending datagram of {} bytes from port {} to {:?}:{}", payload.len(), from.number(), to.remote_addr(), to.remote_port());
        self.router.send(to.remote_addr(), &buf).await?;
        Ok(payload.len())
    }

    /// Waits for the next datagram on `port`. If no reply port can be allocated, the datagram
    ///  stays at the head of the port's queue.
    pub async fn receive(&self, port: &UnboundPort) -> Result<ReceivedDatagram, DatagramError> {
        let datagram = port.receive().await?;
        let reply_port = match self.ports.create_bound(datagram.source_addr, datagram.source_port).await {
            Ok(reply_port) => reply_port,
            Err(e) => {
                debug!("no reply port for datagram on port {}: {}", port.number(), e);
                port.requeue_front(datagram).await;
                return Err(e.into());
            }
        };
        Ok(ReceivedDatagram {
            source_addr: datagram.source_addr,
            source_port: datagram.source_port,
            payload: datagram.payload,
            reply_port,
        })
    }

    pub async fn on_packet(&self, header: DatagramHeader, payload: &[u8]) {
        let datagram = Datagram {
            source_addr: header.source_addr,
            source_port: header.source_port,
            payload: Bytes::copy_from_slice(payload),
        };
        if let Err(e) = self.ports.deliver(header.dest_port, datagram).await {
            debug!("dropping datagram from {:?}:{}: {}", header.source_addr, header.source_port, e);
        }
    }
}
