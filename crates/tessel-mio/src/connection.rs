use std::net::SocketAddr;

use mio::net::TcpStream;
use tessel_http::{CallId, Channel};
use uuid::Uuid;

/// Server side state of an accepted TCP connection.
pub(crate) struct Connection {
    /// Identifies the connection in logs.
    pub id: Uuid,
    pub remote_addr: SocketAddr,
    pub state: ConnectionState,
}

pub(crate) enum ConnectionState {
    /// Registered for readable events, nothing has been read yet.
    Accepted(TcpStream),
    /// A pooled call owns the channel, and is reading the request head.
    Reading(CallId),
    /// The call has been released, the response is still going out.
    Draining(Channel<TcpStream>),
    Closed,
}

impl Connection {
    pub fn new(remote_addr: SocketAddr, stream: TcpStream) -> Self {
        Self {
            id: Uuid::new_v4(),
            remote_addr,
            state: ConnectionState::Accepted(stream),
        }
    }
}
