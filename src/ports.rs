use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::ops::RangeInclusive;
use std::sync::Arc;

use bit_set::BitSet;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tracing::{debug, trace};

use crate::addr::NetworkAddress;
use crate::error::PortError;

/// Port numbers of local listening endpoints. Datagrams are always addressed to one of these.
pub const UNBOUND_PORTS: RangeInclusive<u16> = 0..=32767;
/// Port numbers of send targets, assigned by the registry
pub const BOUND_PORTS: RangeInclusive<u16> = 32768..=u16::MAX;

const NUM_BOUND_PORTS: usize = (u16::MAX - 32768) as usize + 1;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Datagram {
    pub source_addr: NetworkAddress,
    /// the sender's unbound port, i.e. where replies go
    pub source_port: u16,
    pub payload: Bytes,
}

/// A local listening endpoint with a queue of datagrams that arrived for it.
pub struct UnboundPort {
    number: u16,
    queue: Mutex<VecDeque<Datagram>>,
    /// one permit per queued datagram; closed when the port is destroyed
    ready: Semaphore,
}

impl Debug for UnboundPort {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "UnboundPort({})", self.number)
    }
}

impl UnboundPort {
    fn new(number: u16) -> UnboundPort {
        UnboundPort {
            number,
            queue: Default::default(),
            ready: Semaphore::new(0),
        }
    }

    pub fn number(&self) -> u16 {
        self.number
    }

    async fn enqueue(&self, datagram: Datagram) {
        self.queue.lock().await
            .push_back(datagram);
        self.ready.add_permits(1);
    }

    /// Waits for the next datagram. Fails if the port is destroyed before one arrives.
    pub async fn receive(&self) -> Result<Datagram, PortError> {
        self.ready.acquire().await
            .map_err(|_| PortError::Destroyed)?
            .forget();

        self.queue.lock().await
            .pop_front()
            .ok_or(PortError::Destroyed)
    }

    /// Puts a datagram taken by [UnboundPort::receive] back at the head of the queue
    pub(crate) async fn requeue_front(&self, datagram: Datagram) {
        self.queue.lock().await
            .push_front(datagram);
        self.ready.add_permits(1);
    }

    fn close(&self) {
        self.ready.close();
    }
}

/// A send target: a remote node's address and unbound port, registered under a local port
///  number. A bound port is owned by exactly one caller and must be handed back to the registry
///  to release its number.
#[derive(Debug, Eq, PartialEq)]
pub struct BoundPort {
    number: u16,
    remote_addr: NetworkAddress,
    remote_port: u16,
}

impl BoundPort {
    pub fn number(&self) -> u16 {
        self.number
    }

    pub fn remote_addr(&self) -> NetworkAddress {
        self.remote_addr
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }
}

#[derive(Default)]
struct PortRegistryInner {
    unbound: FxHashMap<u16, Arc<UnboundPort>>,
    /// offsets into [BOUND_PORTS] of bound ports currently in use
    bound_in_use: BitSet,
    next_bound_offset: usize,
}

#[derive(Default)]
pub struct PortRegistry {
    inner: RwLock<PortRegistryInner>,
}

impl PortRegistry {
    /// Returns the unbound port with the given number, creating it if it does not exist yet.
    ///  Repeated calls for the same number return the same port.
    pub async fn create_unbound(&self, number: u16) -> Result<Arc<UnboundPort>, PortError> {
        if !UNBOUND_PORTS.contains(&number) {
            return Err(PortError::InvalidPortNumber(number));
        }

        let mut inner = self.inner.write().await;
        let port = inner.unbound.entry(number)
            .or_insert_with(|| {
                debug!("creating unbound port {}", number);
                Arc::new(UnboundPort::new(number))
            });
        Ok(port.clone())
    }

    /// Allocates the next free bound port number, searching round-robin from the number after
    ///  the previously allocated one and wrapping around at the end of the range.
    pub async fn create_bound(&self, remote_addr: NetworkAddress, remote_port: u16) -> Result<BoundPort, PortError> {
        if !UNBOUND_PORTS.contains(&remote_port) {
            return Err(PortError::InvalidPortNumber(remote_port));
        }

        let mut inner = self.inner.write().await;
        for i in 0..NUM_BOUND_PORTS {
            let offset = (inner.next_bound_offset + i) % NUM_BOUND_PORTS;
            if inner.bound_in_use.contains(offset) {
                continue;
            }

            inner.bound_in_use.insert(offset);
            inner.next_bound_offset = (offset + 1) % NUM_BOUND_PORTS;

            let number = *BOUND_PORTS.start() + offset as u16;
            trace!("creating bound port {} for {:?}:{}", number, remote_addr, remote_port);
            return Ok(BoundPort {
                number,
                remote_addr,
                remote_port,
            });
        }

        debug!("no free bound port");
        Err(PortError::NoFreeBoundPort)
    }

    pub async fn destroy_bound(&self, port: BoundPort) {
        trace!("destroying bound port {}", port.number);
        let offset = (port.number - *BOUND_PORTS.start()) as usize;
        self.inner.write().await
            .bound_in_use.remove(offset);
    }

    /// Removes the port from the registry. Callers blocked in [UnboundPort::receive] fail with
    ///  [PortError::Destroyed], and a datagram arriving later for the same number creates a
    ///  fresh port.
    pub async fn destroy_unbound(&self, port: &Arc<UnboundPort>) {
        let mut inner = self.inner.write().await;
        let is_registered = inner.unbound.get(&port.number)
            .is_some_and(|registered| Arc::ptr_eq(registered, port));
        if is_registered {
            debug!("destroying unbound port {}", port.number);
            inner.unbound.remove(&port.number);
        }
        port.close();
    }

    /// Queues an arriving datagram at its destination port, creating the port if necessary.
    pub async fn deliver(&self, dest_port: u16, datagram: Datagram) -> Result<(), PortError> {
        if !UNBOUND_PORTS.contains(&dest_port) {
            return Err(PortError::NotUnbound(dest_port));
        }
        let port = self.create_unbound(dest_port).await?;
        trace!("queueing datagram from {:?}:{} at port {}", datagram.source_addr, datagram.source_port, dest_port);
        port.enqueue(datagram).await;
        Ok(())
    }

    /// Destroys all unbound ports, failing all pending receive calls
    pub async fn close_all(&self) {
        let mut inner = self.inner.write().await;
        for (_, port) in inner.unbound.drain() {
            port.close();
        }
    }
}
