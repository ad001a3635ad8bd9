use std::collections::VecDeque;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, trace};

use crate::addr::NetworkAddress;
use crate::error::SocketError;
use crate::stream::StreamEngine;
use crate::transport_header::{StreamHeader, StreamMessageType};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SocketState {
    Start,
    Listening,
    Connecting,
    Connected,
    Closing,
    Closed,
}

pub(crate) struct SocketInner {
    pub remote_addr: NetworkAddress,
    pub remote_port: u16,
    pub state: SocketState,

    /// sequence number of the last sequence-consuming packet sent
    pub seq: u32,
    /// sequence number of the last packet accepted from the peer
    pub ack: u32,
    /// whether the peer acknowledged `seq`
    pub acked: bool,

    /// set when a send exhausted its retries; all further sends fail
    pub error: Option<SocketError>,
    /// this side sent FIN and waits for it to be acknowledged
    pub local_closing: bool,
    pub peer_closed: bool,

    pub receive_buffer: VecDeque<Bytes>,
    pub grace_timer: Option<JoinHandle<()>>,
}

impl SocketInner {
    pub(crate) fn reset_to_listening(&mut self) {
        self.remote_addr = NetworkAddress::UNSPECIFIED;
        self.remote_port = 0;
        self.state = SocketState::Listening;
        self.seq = 1;
        self.ack = 0;
        self.acked = false;
    }
}

/// Per-connection state, shared between the application's socket handle and inbound packet
///  processing.
pub struct SocketShared {
    local_port: u16,
    local_addr: NetworkAddress,
    pub(crate) inner: Mutex<SocketInner>,
    /// notified on every state change and on every accepted packet
    changed: Notify,
    /// serializes concurrent send calls on the same socket
    pub(crate) send_lock: Mutex<()>,
    pub(crate) receive_lock: Mutex<()>,
}

impl SocketShared {
    pub fn new(local_port: u16, local_addr: NetworkAddress, state: SocketState) -> SocketShared {
        SocketShared {
            local_port,
            local_addr,
            inner: Mutex::new(SocketInner {
                remote_addr: NetworkAddress::UNSPECIFIED,
                remote_port: 0,
                state,
                seq: 1,
                ack: 0,
                acked: false,
                error: None,
                local_closing: false,
                peer_closed: false,
                receive_buffer: VecDeque::new(),
                grace_timer: None,
            }),
            changed: Notify::new(),
            send_lock: Mutex::new(()),
            receive_lock: Mutex::new(()),
        }
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub async fn state(&self) -> SocketState {
        self.inner.lock().await.state
    }

    pub(crate) fn notify_changed(&self) {
        self.changed.notify_waiters();
    }

    /// Serializes a stream packet with the socket's current addressing and counters
    pub(crate) fn packet(&self, inner: &SocketInner, message_type: StreamMessageType, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(StreamHeader::SERIALIZED_LEN + payload.len());
        StreamHeader {
            source_port: self.local_port,
            source_addr: self.local_addr,
            dest_port: inner.remote_port,
            dest_addr: inner.remote_addr,
            message_type,
            seq: inner.seq,
            ack: inner.ack,
        }.ser(&mut buf);
        buf.put_slice(payload);
        buf.freeze()
    }

    /// Waits until `cond` holds or `deadline` passes, re-checking after every change to the
    ///  socket. Returns the final value of `cond`.
    pub(crate) async fn wait_until(&self, deadline: Option<Instant>, cond: impl Fn(&SocketInner) -> bool) -> bool {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            // register before checking so that a change between check and wait is not lost
            notified.as_mut().enable();

            if cond(&*self.inner.lock().await) {
                return true;
            }

            match deadline {
                Some(deadline) => {
                    if timeout_at(deadline, notified).await.is_err() {
                        return cond(&*self.inner.lock().await);
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Copies buffered data into `buf`, waiting for data if there is none. A partially consumed
    ///  fragment stays at the front of the buffer.
    pub(crate) async fn receive(&self, buf: &mut [u8]) -> Result<usize, SocketError> {
        let _receive_guard = self.receive_lock.lock().await;
        if buf.is_empty() {
            return Ok(0);
        }

        self.wait_until(None, |inner| !inner.receive_buffer.is_empty() || inner.state != SocketState::Connected || inner.error.is_some())
            .await;

        let mut inner = self.inner.lock().await;
        if inner.receive_buffer.is_empty() {
            debug!("receive on port {} failed: socket is {:?}", self.local_port, inner.state);
            return Err(SocketError::ReceiveError);
        }

        let mut num_read = 0;
        while num_read < buf.len() {
            let Some(fragment) = inner.receive_buffer.front_mut() else {
                break;
            };

            let n = fragment.len().min(buf.len() - num_read);
            buf[num_read..num_read + n].copy_from_slice(&fragment[..n]);
            fragment.advance(n);
            num_read += n;

            if fragment.is_empty() {
                inner.receive_buffer.pop_front();
            }
        }
        Ok(num_read)
    }

    /// Processes an inbound stream packet addressed to this socket. This never waits for the
    ///  network: replies are handed off to be sent in the background.
    pub(crate) async fn on_packet(self: &Arc<Self>, engine: &StreamEngine, header: StreamHeader, payload: &[u8]) {
        let mut inner = self.inner.lock().await;
        trace!("port {}: received {:?} seq {} ack {} with {} bytes in state {:?} (seq {}, ack {})",
            self.local_port, header.message_type, header.seq, header.ack, payload.len(), inner.state, inner.seq, inner.ack);

        match inner.state {
            SocketState::Start | SocketState::Closed => {
                trace!("port {}: socket is {:?} - dropping packet", self.local_port, inner.state);
                return;
            }
            SocketState::Listening => {
                if header.message_type == StreamMessageType::Syn {
                    debug!("port {}: connection request from {:?}:{}", self.local_port, header.source_addr, header.source_port);
                    inner.remote_addr = header.source_addr;
                    inner.remote_port = header.source_port;
                    inner.ack = header.seq;
                    inner.state = SocketState::Connecting;
                    self.reply(engine, &inner, StreamMessageType::SynAck);
                    self.notify_changed();
                }
                return;
            }
            _ => {}
        }

        if header.source_addr != inner.remote_addr || header.source_port != inner.remote_port {
            debug!("port {}: packet from {:?}:{} does not belong to this connection - dropping", self.local_port, header.source_addr, header.source_port);
            return;
        }

        let is_bare_ack = header.message_type == StreamMessageType::Ack && payload.is_empty();
        let is_in_sequence = !is_bare_ack && header.seq == inner.ack.wrapping_add(1);
        let is_matching_ack = is_bare_ack && header.ack == inner.seq;

        if !(is_in_sequence || is_matching_ack) {
            if inner.state == SocketState::Connecting && header.message_type == StreamMessageType::Syn {
                trace!("port {}: repeated SYN - repeating SYNACK", self.local_port);
                self.reply(engine, &inner, StreamMessageType::SynAck);
            }
            else if !is_bare_ack {
                trace!("port {}: out of sequence {:?} with seq {} - resynchronizing", self.local_port, header.message_type, header.seq);
                self.reply(engine, &inner, StreamMessageType::Ack);
            }
            return;
        }

        if is_in_sequence {
            inner.ack = header.seq;
        }
        if header.ack == inner.seq {
            inner.acked = true;
        }

        match (inner.state, header.message_type) {
            (SocketState::Connecting, StreamMessageType::SynAck) => {
                debug!("port {}: connected to {:?}:{}", self.local_port, inner.remote_addr, inner.remote_port);
                inner.state = SocketState::Connected;
                self.reply(engine, &inner, StreamMessageType::Ack);
            }
            (SocketState::Connecting, StreamMessageType::Ack) => {
                debug!("port {}: connected to {:?}:{}", self.local_port, inner.remote_addr, inner.remote_port);
                inner.state = SocketState::Connected;
                if is_bare_ack {
                    // no data flowed yet, so the only thing this can skip is a lost SYNACK
                    if (header.seq.wrapping_sub(inner.ack) as i32) > 0 {
                        inner.ack = header.seq;
                    }
                }
                else {
                    self.buffer_data(engine, &mut inner, payload);
                }
            }
            (SocketState::Connected, StreamMessageType::Ack) | (SocketState::Closing, StreamMessageType::Ack) if !is_bare_ack => {
                self.buffer_data(engine, &mut inner, payload);
            }
            (SocketState::Connected, StreamMessageType::Fin) => {
                debug!("port {}: connection closed by peer", self.local_port);
                inner.state = SocketState::Closing;
                inner.peer_closed = true;
                self.reply(engine, &inner, StreamMessageType::Ack);
                inner.grace_timer = Some(self.arm_grace_timer(engine));
            }
            (SocketState::Closing, StreamMessageType::Fin) => {
                self.reply(engine, &inner, StreamMessageType::Ack);
            }
            (SocketState::Closing, StreamMessageType::Ack) if inner.local_closing => {
                debug!("port {}: close acknowledged", self.local_port);
                inner.state = SocketState::Closed;
            }
            _ => {}
        }

        drop(inner);
        self.notify_changed();
    }

    fn buffer_data(&self, engine: &StreamEngine, inner: &mut SocketInner, payload: &[u8]) {
        trace!("port {}: buffering {} bytes", self.local_port, payload.len());
        inner.receive_buffer.push_back(Bytes::copy_from_slice(payload));
        self.reply(engine, inner, StreamMessageType::Ack);
    }

    fn reply(&self, engine: &StreamEngine, inner: &SocketInner, message_type: StreamMessageType) {
        let packet = self.packet(inner, message_type, &[]);
        engine.router.send_detached(inner.remote_addr, packet);
    }

    /// After the peer closed the connection, the socket stays around to acknowledge retransmitted
    ///  FIN packets and then goes away.
    fn arm_grace_timer(self: &Arc<Self>, engine: &StreamEngine) -> JoinHandle<()> {
        let socket = self.clone();
        let engine = engine.clone();
        tokio::spawn(async move {
            sleep(engine.config.close_grace_period).await;
            trace!("port {}: grace period after close expired", socket.local_port);
            socket.inner.lock().await
                .state = SocketState::Closed;
            socket.notify_changed();
            engine.table.unregister(socket.local_port, &socket).await;
        })
    }
}
