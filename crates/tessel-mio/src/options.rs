use std::{net::SocketAddr, sync::Arc};

use rustls::ServerConfig;
use tessel_http::CallOptions;

/// Options of a `Server`.
#[derive(Clone)]
pub struct ServerOptions {
    /// Address to listen on.
    pub addr: SocketAddr,
    /// Options of every call in the pool.
    pub call: CallOptions,
    /// TLS configuration, if set every accepted connection is confidential.
    pub tls: Option<Arc<ServerConfig>>,
    /// Idle calls allocated up front for plain connections.
    pub pool_plain: usize,
    /// Idle calls allocated up front for confidential connections.
    pub pool_confidential: usize,
    /// Maximum amount of readiness events handled per poll.
    pub events_capacity: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            call: CallOptions::default(),
            tls: None,
            pool_plain: 16,
            pool_confidential: 0,
            events_capacity: 128,
        }
    }
}
