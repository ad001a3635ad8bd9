//! Reliable, ordered byte streams between two ports on (possibly) different nodes.
//!
//! A connection is set up with a three-way handshake (SYN, SYNACK, ACK) and torn down with
//!  FIN / ACK. Payload is sent in fragments of at most one packet each, and there is at most one
//!  unacknowledged fragment per connection at any time: a sender waits for the acknowledgement
//!  of a fragment, retransmitting it with exponential backoff, before sending the next one.
//!
//! SYN, SYNACK, FIN and data fragments each consume a sequence number; the receiver accepts a
//!  packet only if its sequence number follows the last one it accepted. Acknowledgements without
//!  payload ('bare' ACKs) carry the sender's current sequence number and are accepted if they
//!  acknowledge the receiver's outstanding packet. Anything else is a duplicate or stale, and it
//!  is answered with a bare ACK so the peer can tell that its packet did arrive.

pub mod backoff;
pub mod socket;
pub mod socket_table;

use std::sync::Arc;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::addr::NetworkAddress;
use crate::config::StackConfig;
use crate::error::SocketError;
use crate::routing::Router;
use crate::stream::backoff::RetransmitBackoff;
use crate::stream::socket::{SocketShared, SocketState};
use crate::stream::socket_table::SocketTable;
use crate::transport_header::{StreamHeader, StreamMessageType};

#[derive(Clone)]
pub struct StreamEngine {
    myself: NetworkAddress,
    pub(crate) config: Arc<StackConfig>,
    pub(crate) router: Router,
    pub(crate) table: Arc<SocketTable>,
}

impl StreamEngine {
    pub fn new(myself: NetworkAddress, config: Arc<StackConfig>, router: Router) -> StreamEngine {
        StreamEngine {
            myself,
            table: Arc::new(SocketTable::new(&config)),
            config,
            router,
        }
    }

    fn backoff(&self) -> RetransmitBackoff {
        RetransmitBackoff::new(self.config.stream_base_timeout, self.config.stream_max_tries)
    }

    /// Waits for a client to connect to the given server port. If a handshake that was started
    ///  does not complete, the socket goes back to waiting for the next client.
    pub async fn listen(&self, port: u16) -> Result<StreamSocket, SocketError> {
        let shared = Arc::new(SocketShared::new(port, self.myself, SocketState::Listening));
        self.table.register_server(port, shared.clone()).await?;
        let registration = Registration::new(self.table.clone(), shared.clone());
        info!("listening on stream port {}", port);

        let mut backoff = self.backoff();
        loop {
            let state = shared.state().await;
            match state {
                SocketState::Listening => {
                    backoff.reset();
                    shared.wait_until(None, |inner| inner.state != SocketState::Listening).await;
                }
                SocketState::Connecting => {
                    let deadline = Instant::now() + backoff.timeout();
                    if shared.wait_until(Some(deadline), |inner| inner.state != SocketState::Connecting).await {
                        continue;
                    }

                    let mut inner = shared.inner.lock().await;
                    if inner.state != SocketState::Connecting {
                        continue;
                    }
                    if backoff.on_timeout() {
                        trace!("port {}: resending SYNACK", port);
                        let packet = shared.packet(&inner, StreamMessageType::SynAck, &[]);
                        self.router.send_detached(inner.remote_addr, packet);
                    }
                    else {
                        debug!("port {}: client {:?}:{} did not complete the handshake - listening again", port, inner.remote_addr, inner.remote_port);
                        inner.reset_to_listening();
                    }
                }
                _ => {
                    info!("port {}: accepted connection", port);
                    registration.disarm();
                    return Ok(StreamSocket {
                        engine: self.clone(),
                        shared,
                    });
                }
            }
        }
    }

    /// Establishes a connection to a server port on another node, using the next free client
    ///  port locally. Fails with [SocketError::NoServer] if the server does not answer.
    pub async fn connect(&self, remote_addr: NetworkAddress, remote_port: u16) -> Result<StreamSocket, SocketError> {
        if self.table.is_client_port(remote_port) {
            return Err(SocketError::InvalidParams);
        }

        let myself = self.myself;
        let shared = self.table.register_client(|port| Arc::new(SocketShared::new(port, myself, SocketState::Start)))
            .await?;
        let registration = Registration::new(self.table.clone(), shared.clone());
        let syn = {
            let mut inner = shared.inner.lock().await;
            inner.remote_addr = remote_addr;
            inner.remote_port = remote_port;
            inner.state = SocketState::Connecting;
            shared.packet(&inner, StreamMessageType::Syn, &[])
        };
        debug!("port {}: connecting to {:?}:{}", shared.local_port(), remote_addr, remote_port);

        let socket = StreamSocket {
            engine: self.clone(),
            shared,
        };

        let mut backoff = self.backoff();
        loop {
            if let Err(e) = self.router.send(remote_addr, &syn).await {
                debug!("port {}: could not send SYN to {:?}: {}", socket.local_port(), remote_addr, e);
                socket.teardown().await;
                registration.disarm();
                return Err(SocketError::NoServer);
            }

            let deadline = Instant::now() + backoff.timeout();
            if socket.shared.wait_until(Some(deadline), |inner| inner.state != SocketState::Connecting).await {
                info!("port {}: connected to {:?}:{}", socket.local_port(), remote_addr, remote_port);
                registration.disarm();
                return Ok(socket);
            }

            if !backoff.on_timeout() {
                debug!("port {}: no answer from {:?}:{}", socket.local_port(), remote_addr, remote_port);
                socket.teardown().await;
                registration.disarm();
                return Err(SocketError::NoServer);
            }
            trace!("port {}: resending SYN", socket.local_port());
        }
    }

    pub async fn on_packet(&self, header: StreamHeader, payload: &[u8]) {
        match self.table.get(header.dest_port).await {
            Some(socket) => socket.on_packet(self, header, payload).await,
            None => debug!("stream packet for port {} without a socket - dropping", header.dest_port),
        }
    }
}

/// A socket's entry in the [SocketTable] while `listen` or `connect` is still in progress. If
///  that call's future is dropped before it hands out a [StreamSocket], the socket is closed and
///  its port released.
struct Registration {
    table: Arc<SocketTable>,
    shared: Arc<SocketShared>,
    armed: bool,
}

impl Registration {
    fn new(table: Arc<SocketTable>, shared: Arc<SocketShared>) -> Registration {
        Registration {
            table,
            shared,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // without a runtime there is nothing left to clean up for
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let table = self.table.clone();
        let shared = self.shared.clone();
        debug!("port {}: cancelled before the connection was established - releasing", shared.local_port());
        runtime.spawn(async move {
            shared.inner.lock().await
                .state = SocketState::Closed;
            shared.notify_changed();
            table.unregister(shared.local_port(), &shared).await;
        });
    }
}

/// The application's handle to a connection. Dropping it without calling [StreamSocket::close]
///  leaves the connection registered until the peer closes it.
pub struct StreamSocket {
    engine: StreamEngine,
    shared: Arc<SocketShared>,
}

impl StreamSocket {
    pub fn local_port(&self) -> u16 {
        self.shared.local_port()
    }

    pub async fn remote(&self) -> (NetworkAddress, u16) {
        let inner = self.shared.inner.lock().await;
        (inner.remote_addr, inner.remote_port)
    }

    pub async fn state(&self) -> SocketState {
        self.shared.state().await
    }

    /// Sends all of `data`, split into fragments, and returns when the peer acknowledged the
    ///  last one. If a fragment is not acknowledged after the configured number of
    ///  retransmissions, this call and all further sends on this socket fail.
    pub async fn send(&self, data: &[u8]) -> Result<usize, SocketError> {
        let _send_guard = self.shared.send_lock.lock().await;
        {
            let inner = self.shared.inner.lock().await;
            if inner.error.is_some() || inner.state != SocketState::Connected {
                return Err(SocketError::SendError);
            }
        }

        let mut num_sent = 0;
        for fragment in data.chunks(self.engine.config.max_stream_fragment()) {
            self.send_fragment(fragment).await?;
            num_sent += fragment.len();
        }
        Ok(num_sent)
    }

    async fn send_fragment(&self, fragment: &[u8]) -> Result<(), SocketError> {
        let (remote_addr, packet) = {
            let mut inner = self.shared.inner.lock().await;
            if inner.error.is_some() || inner.state != SocketState::Connected {
                return Err(SocketError::SendError);
            }
            inner.seq = inner.seq.wrapping_add(1);
            inner.acked = false;
            (inner.remote_addr, self.shared.packet(&inner, StreamMessageType::Ack, fragment))
        };
        trace!("port {}: sending {} bytes", self.local_port(), fragment.len());

        let mut backoff = self.engine.backoff();
        loop {
            if let Err(e) = self.engine.router.send(remote_addr, &packet).await {
                debug!("port {}: error sending fragment: {}", self.local_port(), e);
                return self.fail_send().await;
            }

            let deadline = Instant::now() + backoff.timeout();
            let done = self.shared.wait_until(Some(deadline), |inner| inner.acked || inner.state != SocketState::Connected)
                .await;
            if done {
                let inner = self.shared.inner.lock().await;
                if inner.acked {
                    return Ok(());
                }
                debug!("port {}: connection is {:?} while sending", self.local_port(), inner.state);
                return Err(SocketError::SendError);
            }

            if !backoff.on_timeout() {
                debug!("port {}: fragment was not acknowledged after {} retries", self.local_port(), backoff.tries() - 1);
                return self.fail_send().await;
            }
            trace!("port {}: retransmitting fragment", self.local_port());
        }
    }

    async fn fail_send(&self) -> Result<(), SocketError> {
        self.shared.inner.lock().await
            .error = Some(SocketError::SendError);
        self.shared.notify_changed();
        Err(SocketError::SendError)
    }

    /// Waits for data and copies as much of it as is available into `buf`, which may be less
    ///  than `buf.len()`. Fails once no more data can arrive and all buffered data was read.
    pub async fn receive(&self, buf: &mut [u8]) -> Result<usize, SocketError> {
        self.shared.receive(buf).await
    }

    /// Closes the connection. This can not fail: if the peer does not acknowledge, the socket is
    ///  released after the configured number of retransmissions.
    pub async fn close(self) {
        let fin = {
            let mut inner = self.shared.inner.lock().await;
            if inner.state == SocketState::Connected {
                inner.state = SocketState::Closing;
                inner.local_closing = true;
                inner.seq = inner.seq.wrapping_add(1);
                inner.acked = false;
                Some((inner.remote_addr, self.shared.packet(&inner, StreamMessageType::Fin, &[])))
            }
            else {
                None
            }
        };
        self.shared.notify_changed();

        match fin {
            Some((remote_addr, fin)) => self.send_fin(remote_addr, fin).await,
            None => {
                // closed by the peer: stay around until the grace period is over
                let peer_closed = self.shared.inner.lock().await.peer_closed;
                if peer_closed {
                    self.shared.wait_until(None, |inner| inner.state == SocketState::Closed).await;
                }
            }
        }

        self.teardown().await;
        info!("port {}: closed", self.local_port());
    }

    async fn send_fin(&self, remote_addr: NetworkAddress, fin: Bytes) {
        let mut backoff = self.engine.backoff();
        loop {
            if let Err(e) = self.engine.router.send(remote_addr, &fin).await {
                debug!("port {}: error sending FIN: {}", self.local_port(), e);
                return;
            }

            let deadline = Instant::now() + backoff.timeout();
            if self.shared.wait_until(Some(deadline), |inner| inner.state == SocketState::Closed).await {
                return;
            }
            if !backoff.on_timeout() {
                debug!("port {}: FIN was not acknowledged - closing anyway", self.local_port());
                return;
            }
        }
    }

    async fn teardown(&self) {
        {
            let mut inner = self.shared.inner.lock().await;
            inner.state = SocketState::Closed;
            if let Some(grace_timer) = inner.grace_timer.take() {
                grace_timer.abort();
            }
            inner.receive_buffer.clear();
        }
        self.shared.notify_changed();
        self.engine.table.unregister(self.local_port(), &self.shared).await;
    }
}
