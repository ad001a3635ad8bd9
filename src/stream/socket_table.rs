use std::collections::VecDeque;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::config::StackConfig;
use crate::error::SocketError;
use crate::stream::socket::SocketShared;

struct SocketTableInner {
    sockets: FxHashMap<u16, Arc<SocketShared>>,
    /// client ports not currently in use, handed out in FIFO order
    free_client_ports: VecDeque<u16>,
}

/// All live sockets by local port. Server ports are chosen by the application, client ports are
///  assigned from a free list.
pub struct SocketTable {
    server_max: u16,
    inner: RwLock<SocketTableInner>,
}

impl SocketTable {
    pub fn new(config: &StackConfig) -> SocketTable {
        SocketTable {
            server_max: config.socket_server_max,
            inner: RwLock::new(SocketTableInner {
                sockets: FxHashMap::default(),
                free_client_ports: (config.socket_server_max + 1 ..= config.socket_client_max).collect(),
            }),
        }
    }

    pub fn is_client_port(&self, port: u16) -> bool {
        port > self.server_max
    }

    pub async fn register_server(&self, port: u16, socket: Arc<SocketShared>) -> Result<(), SocketError> {
        if self.is_client_port(port) {
            return Err(SocketError::InvalidParams);
        }

        let mut inner = self.inner.write().await;
        if inner.sockets.contains_key(&port) {
            debug!("server port {} is already in use", port);
            return Err(SocketError::PortInUse);
        }
        inner.sockets.insert(port, socket);
        Ok(())
    }

    /// Takes a port from the free list and registers the socket created for it
    pub async fn register_client(&self, create_socket: impl FnOnce(u16) -> Arc<SocketShared>) -> Result<Arc<SocketShared>, SocketError> {
        let mut inner = self.inner.write().await;
        let Some(port) = inner.free_client_ports.pop_front() else {
            debug!("no free client ports");
            return Err(SocketError::NoMorePorts);
        };

        trace!("assigning client port {}", port);
        let socket = create_socket(port);
        inner.sockets.insert(port, socket.clone());
        Ok(socket)
    }

    /// Removes a socket from the table, returning its port to the free list if it is a client
    ///  port. A different socket registered under the same port is left alone.
    pub async fn unregister(&self, port: u16, socket: &Arc<SocketShared>) {
        let mut inner = self.inner.write().await;
        let is_registered = inner.sockets.get(&port)
            .is_some_and(|s| Arc::ptr_eq(s, socket));
        if !is_registered {
            return;
        }

        inner.sockets.remove(&port);
        if self.is_client_port(port) {
            inner.free_client_ports.push_back(port);
        }
        trace!("unregistered socket on port {}", port);
    }

    pub async fn get(&self, port: u16) -> Option<Arc<SocketShared>> {
        self.inner.read().await
            .sockets.get(&port)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::addr::NetworkAddress;
    use crate::stream::socket::SocketState;

    fn config(server_max: u16, client_max: u16) -> StackConfig {
        StackConfig {
            socket_server_max: server_max,
            socket_client_max: client_max,
            ..StackConfig::default()
        }
    }

    fn socket(port: u16) -> Arc<SocketShared> {
        Arc::new(SocketShared::new(port, NetworkAddress::new(Ipv4Addr::LOCALHOST, 1), SocketState::Start))
    }

    #[tokio::test]
    async fn test_register_server() {
        let table = SocketTable::new(&config(10, 20));

        let s = socket(5);
        table.register_server(5, s.clone()).await.unwrap();
        assert!(Arc::ptr_eq(&table.get(5).await.unwrap(), &s));

        assert_eq!(table.register_server(5, socket(5)).await, Err(SocketError::PortInUse));
        assert_eq!(table.register_server(11, socket(11)).await, Err(SocketError::InvalidParams));

        table.unregister(5, &s).await;
        assert!(table.get(5).await.is_none());
        table.register_server(5, socket(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_client_ports_fifo() {
        let table = SocketTable::new(&config(10, 13));

        let a = table.register_client(socket).await.unwrap();
        let b = table.register_client(socket).await.unwrap();
        let c = table.register_client(socket).await.unwrap();
        assert_eq!((a.local_port(), b.local_port(), c.local_port()), (11, 12, 13));
        assert_eq!(table.register_client(socket).await.err(), Some(SocketError::NoMorePorts));

        // reclaimed ports go to the back of the list
        table.unregister(12, &b).await;
        table.unregister(11, &a).await;
        assert_eq!(table.register_client(socket).await.unwrap().local_port(), 12);
        assert_eq!(table.register_client(socket).await.unwrap().local_port(), 11);
    }

    #[tokio::test]
    async fn test_unregister_other_socket_is_ignored() {
        let table = SocketTable::new(&config(10, 11));

        let registered = table.register_client(socket).await.unwrap();
        table.unregister(11, &socket(11)).await;
        assert!(Arc::ptr_eq(&table.get(11).await.unwrap(), &registered));

        // the port was not reclaimed, so it can not be handed out twice
        assert_eq!(table.register_client(socket).await.err(), Some(SocketError::NoMorePorts));
    }
}
