use std::sync::Arc;

use tracing::{info, span, Instrument, Level};
use uuid::Uuid;

use crate::addr::NetworkAddress;
use crate::config::StackConfig;
use crate::datagram::{DatagramService, ReceivedDatagram};
use crate::dispatch::Dispatcher;
use crate::error::{DatagramError, PortError, RouteError, SocketError};
use crate::medium::NetworkMedium;
use crate::ports::{BoundPort, UnboundPort};
use crate::routing::Router;
use crate::routing_header::RoutePath;
use crate::stream::{StreamEngine, StreamSocket};

/// A node's complete network stack on top of a [NetworkMedium]. This is the application's entry
///  point for all three services (datagrams, routes and streams), and it needs to be fed every
///  packet the medium receives through [Stack::on_packet].
pub struct Stack {
    myself: NetworkAddress,
    config: Arc<StackConfig>,
    router: Router,
    datagrams: DatagramService,
    streams: StreamEngine,
    dispatcher: Dispatcher,
}

impl Stack {
    pub fn new(medium: Arc<dyn NetworkMedium>, config: StackConfig) -> anyhow::Result<Stack> {
        config.validate()?;

        let myself = medium.local_addr();
        let config = Arc::new(config);
        let router = Router::new(config.clone(), medium);
        let datagrams = DatagramService::new(myself, config.clone(), router.clone());
        let streams = StreamEngine::new(myself, config.clone(), router.clone());
        let dispatcher = Dispatcher::new(router.clone(), datagrams.clone(), streams.clone());

        info!("initialized network stack for {:?}", myself);
        Ok(Stack {
            myself,
            config,
            router,
            datagrams,
            streams,
            dispatcher,
        })
    }

    pub fn self_addr(&self) -> NetworkAddress {
        self.myself
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    /// Processes a raw packet received from the network medium
    pub async fn on_packet(&self, packet: &[u8]) {
        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "packet_received", ?correlation_id);

        self.dispatcher.on_packet(packet)
            .instrument(span)
            .await
    }

    pub async fn create_unbound_port(&self, number: u16) -> Result<Arc<UnboundPort>, PortError> {
        self.datagrams.ports().create_unbound(number).await
    }

    pub async fn create_bound_port(&self, remote_addr: NetworkAddress, remote_port: u16) -> Result<BoundPort, PortError> {
        self.datagrams.ports().create_bound(remote_addr, remote_port).await
    }

    pub async fn destroy_unbound_port(&self, port: &Arc<UnboundPort>) {
        self.datagrams.ports().destroy_unbound(port).await
    }

    pub async fn destroy_bound_port(&self, port: BoundPort) {
        self.datagrams.ports().destroy_bound(port).await
    }

    pub async fn send_datagram(&self, from: &UnboundPort, to: &BoundPort, payload: &[u8]) -> Result<usize, DatagramError> {
        self.datagrams.send(from, to, payload).await
    }

    pub async fn receive_datagram(&self, port: &UnboundPort) -> Result<ReceivedDatagram, DatagramError> {
        self.datagrams.receive(port).await
    }

    pub async fn resolve_route(&self, destination: NetworkAddress) -> Result<RoutePath, RouteError> {
        self.router.resolve(destination).await
    }

    pub async fn listen(&self, port: u16) -> Result<StreamSocket, SocketError> {
        self.streams.listen(port).await
    }

    pub async fn connect(&self, remote_addr: NetworkAddress, remote_port: u16) -> Result<StreamSocket, SocketError> {
        self.streams.connect(remote_addr, remote_port).await
    }

    /// Cancels all pending route discoveries and closes all unbound ports, failing callers that
    ///  wait for either. Stream sockets are closed by their owners.
    pub async fn shutdown(&self) {
        info!("shutting down network stack for {:?}", self.myself);
        self.router.route_cache().clear().await;
        self.datagrams.ports().close_all().await;
    }
}
