use thiserror::Error;

/// Errors returned by the datagram port registry
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PortError {
    #[error("port number {0} is outside the valid range")]
    InvalidPortNumber(u16),
    #[error("all bound port numbers are in use")]
    NoFreeBoundPort,
    /// Datagrams can only be delivered to unbound (listening) ports
    #[error("port {0} is not an unbound port")]
    NotUnbound(u16),
    #[error("payload of {len} bytes exceeds the maximum datagram size of {max} bytes")]
    PayloadTooLarge { len: usize, max: usize },
    /// The port was destroyed while a caller was waiting for a datagram
    #[error("port was destroyed")]
    Destroyed,
}

/// Errors sending a packet along a discovered route
#[derive(Debug, Error)]
pub enum RouteError {
    /// Route discovery for the destination exhausted its retries, or the stack was shut down
    ///  while waiting
    #[error("destination is unreachable")]
    Unreachable,
    #[error("packet of {len} bytes exceeds the maximum packet size of {max} bytes")]
    PacketTooLarge { len: usize, max: usize },
    #[error(transparent)]
    Medium(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum DatagramError {
    #[error(transparent)]
    Port(#[from] PortError),
    #[error(transparent)]
    Route(#[from] RouteError),
}

/// Errors of the reliable stream API. A socket that failed a send keeps its error, so the value
///  must be cheap to copy.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SocketError {
    #[error("invalid parameters")]
    InvalidParams,
    #[error("port is already in use")]
    PortInUse,
    #[error("no more client ports available")]
    NoMorePorts,
    /// connection establishment timed out
    #[error("no server at the remote end")]
    NoServer,
    #[error("send failed")]
    SendError,
    #[error("receive failed: connection is closed")]
    ReceiveError,
}
