//! Single-threaded mio event loop serving `tessel-http` calls.
//!
//! The server accepts TCP connections, reads the first bytes speculatively, and hands them to a
//! pooled `HttpServerCall` together with the connection's channel. Parsed calls are passed to a
//! `Handler`, which writes the response.

mod connection;
mod handler;
mod options;
mod server;

pub use self::{handler::Handler, options::ServerOptions, server::Server};
