use std::{
    collections::HashMap,
    io::{ErrorKind, Read},
    net::SocketAddr,
    time::Duration,
};

use anyhow::{anyhow, Context as _, Error};
use mio::{
    net::{TcpListener, TcpStream},
    Events, Interest, Poll, Token,
};
use rustls::ServerConnection;
use tessel_http::{CallId, CallPool, Channel, HeadStatus, Ready, ResponseHead};
use tracing::{event, instrument, span, Level};

use crate::{
    connection::{Connection, ConnectionState},
    Handler, ServerOptions,
};

const LISTENER: Token = Token(0);

/// Single-threaded HTTP server over a mio event loop.
///
/// Every connection serves exactly one request. After the handler wrote the response, the call
/// goes back to the pool, and the connection closes as soon as the response has been sent.
pub struct Server<H> {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    local_addr: SocketAddr,

    options: ServerOptions,
    pool: CallPool<TcpStream>,
    handler: H,

    connections: HashMap<Token, Connection>,
    next_token: usize,

    /// Scratch buffer for ready events.
    ready_events: Vec<Ready>,
    /// Scratch buffer for speculative first reads.
    first_read: Vec<u8>,
}

impl<H> Server<H>
where
    H: Handler,
{
    /// Bind a listener on the configured address.
    #[instrument("Server::bind", skip_all)]
    pub fn bind(options: ServerOptions, handler: H) -> Result<Self, Error> {
        event!(Level::DEBUG, addr = ?options.addr, "binding");

        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(options.addr).context("failed to bind listener")?;
        let local_addr = listener.local_addr()?;

        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        let pool = CallPool::with_capacity(
            options.call.clone(),
            options.pool_plain,
            options.pool_confidential,
        );

        let this = Self {
            poll,
            events: Events::with_capacity(options.events_capacity),
            listener,
            local_addr,

            first_read: vec![0; options.call.read_chunk.max(1)],
            options,
            pool,
            handler,

            connections: HashMap::new(),
            next_token: LISTENER.0 + 1,

            ready_events: Vec::new(),
        };
        Ok(this)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Amount of connections currently open.
    pub fn connections(&self) -> usize {
        self.connections.len()
    }

    /// Serve connections until an unrecoverable error happens.
    pub fn run(&mut self) -> Result<(), Error> {
        event!(Level::INFO, addr = ?self.local_addr, "serving");

        loop {
            self.poll_once(None)?;
        }
    }

    /// Wait for one batch of readiness events, and handle them.
    ///
    /// Failures of individual connections are logged and close the connection, only failures of
    /// the listener or the poll itself are returned.
    #[instrument("Server::poll_once", level = "trace", skip_all)]
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> Result<(), Error> {
        if let Err(error) = self.poll.poll(&mut self.events, timeout) {
            if error.kind() == ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(error.into());
        }

        let mut ready_events = std::mem::take(&mut self.ready_events);
        ready_events.extend(self.events.iter().map(Ready::from_event));

        for ready in ready_events.drain(..) {
            if ready.token == LISTENER {
                self.on_listener_ready()?;
            } else {
                self.on_connection_ready(ready);
            }
        }

        self.ready_events = ready_events;
        Ok(())
    }

    fn on_listener_ready(&mut self) -> Result<(), Error> {
        // Accept any pending streams
        while let Some((mut stream, remote_addr)) = check_io(self.listener.accept())? {
            let token = Token(self.next_token);
            self.next_token += 1;

            self.poll
                .registry()
                .register(&mut stream, token, Interest::READABLE)?;

            let connection = Connection::new(remote_addr, stream);
            event!(Level::DEBUG, id = %connection.id, ?remote_addr, "connection accepted");
            self.connections.insert(token, connection);
        }

        Ok(())
    }

    fn on_connection_ready(&mut self, ready: Ready) {
        let Some(connection) = self.connections.get(&ready.token) else {
            // Events can still arrive for connections closed earlier in the same batch
            event!(Level::TRACE, token = ready.token.0, "event for closed connection");
            return;
        };

        let span = span!(Level::DEBUG, "connection", id = %connection.id);
        let _entered = span.enter();

        match self.advance(ready) {
            Ok(true) => {}
            Ok(false) => self.close(ready.token),
            Err(error) => {
                event!(Level::WARN, ?error, "connection failed");
                self.close(ready.token);
            }
        }
    }

    /// Move a connection forward on a readiness event, returns if it should stay open.
    fn advance(&mut self, ready: Ready) -> Result<bool, Error> {
        let connection = self
            .connections
            .get(&ready.token)
            .context("failed to get connection")?;

        match connection.state {
            ConnectionState::Accepted(_) => self.on_first_bytes(ready),
            ConnectionState::Reading(call) => self.on_reading_ready(ready, call),
            ConnectionState::Draining(_) => self.on_draining_ready(ready.token),
            ConnectionState::Closed => Ok(false),
        }
    }

    fn on_first_bytes(&mut self, ready: Ready) -> Result<bool, Error> {
        if !ready.readable {
            return Ok(true);
        }

        let connection = self
            .connections
            .get_mut(&ready.token)
            .context("failed to get connection")?;
        let ConnectionState::Accepted(stream) = &mut connection.state else {
            return Err(anyhow!("connection already past its first read"));
        };

        // Speculatively read what's already there, the call gets it as initial bytes
        let read = match check_io(stream.read(&mut self.first_read))? {
            Some(0) => {
                event!(Level::DEBUG, "peer closed before sending anything");
                return Ok(false);
            }
            Some(read) => read,
            None => return Ok(true),
        };
        event!(Level::TRACE, bytes = read, "speculative read");

        // Start the session while the connection still owns the stream, so closing can deregister
        let session = match &self.options.tls {
            Some(config) => {
                let session = ServerConnection::new(config.clone())
                    .context("failed to start tls session")?;
                Some(session)
            }
            None => None,
        };

        let ConnectionState::Accepted(stream) =
            std::mem::replace(&mut connection.state, ConnectionState::Closed)
        else {
            return Err(anyhow!("connection already past its first read"));
        };

        let channel = match session {
            Some(session) => Channel::with_session(stream, session),
            None => Channel::plain(stream),
        };

        let (call, status) = self
            .pool
            .acquire(channel, ready, &self.first_read[..read]);
        connection.state = ConnectionState::Reading(call);

        self.on_head_status(ready.token, call, status)
    }

    fn on_reading_ready(&mut self, ready: Ready, call_id: CallId) -> Result<bool, Error> {
        let call = self
            .pool
            .get_mut(call_id)
            .context("failed to get checked out call")?;

        // Handshake records may still be waiting for the stream
        if ready.writable {
            if let Some(channel) = call.request_channel() {
                channel.drain()?;
            }
        }

        let status = call.resume(ready);
        self.on_head_status(ready.token, call_id, status)
    }

    fn on_head_status(
        &mut self,
        token: Token,
        call_id: CallId,
        status: HeadStatus,
    ) -> Result<bool, Error> {
        let call = self
            .pool
            .get_mut(call_id)
            .context("failed to get checked out call")?;

        match status {
            HeadStatus::Pending => {
                let channel = call
                    .request_channel()
                    .context("pending call has no channel")?;

                let interest = if channel.wants_write() {
                    Interest::READABLE | Interest::WRITABLE
                } else {
                    Interest::READABLE
                };
                self.poll
                    .registry()
                    .reregister(channel.stream_mut(), token, interest)?;

                return Ok(true);
            }
            HeadStatus::Parsed => {
                event!(
                    Level::DEBUG,
                    method = call.request().method(),
                    path = call.request().target(),
                    "dispatching call"
                );
                self.handler.handle(call).context("handler failed")?;
            }
            HeadStatus::Failed => {
                let error = call.head_error().context("failed call has no error")?;

                // Transport failures leave nothing to respond over
                let Some(parse_error) = error.parse_error() else {
                    return Ok(false);
                };

                let response = ResponseHead::for_parse_error(parse_error);
                call.write_response_head(&response)?;
            }
        }

        self.finish(token, call_id)
    }

    /// Release the call, and start sending out whatever it left behind.
    fn finish(&mut self, token: Token, call_id: CallId) -> Result<bool, Error> {
        let connection = self
            .connections
            .get_mut(&token)
            .context("failed to get connection")?;

        let Some(mut channel) = self.pool.release(call_id) else {
            event!(Level::DEBUG, "channel detached by handler");
            connection.state = ConnectionState::Closed;
            return Ok(false);
        };

        channel.close_notify();
        connection.state = ConnectionState::Draining(channel);

        self.on_draining_ready(token)
    }

    fn on_draining_ready(&mut self, token: Token) -> Result<bool, Error> {
        let connection = self
            .connections
            .get_mut(&token)
            .context("failed to get connection")?;
        let ConnectionState::Draining(channel) = &mut connection.state else {
            return Ok(false);
        };

        if !channel.drain()? {
            event!(Level::TRACE, "stream full, waiting for writable");
            self.poll
                .registry()
                .reregister(channel.stream_mut(), token, Interest::WRITABLE)?;
            return Ok(true);
        }

        event!(Level::DEBUG, "response sent");
        Ok(false)
    }

    fn close(&mut self, token: Token) {
        let Some(connection) = self.connections.remove(&token) else {
            return;
        };

        let stream = match connection.state {
            ConnectionState::Accepted(stream) => Some(stream),
            ConnectionState::Reading(call) => self.pool.release(call).map(Channel::into_stream),
            ConnectionState::Draining(channel) => Some(channel.into_stream()),
            ConnectionState::Closed => None,
        };

        if let Some(mut stream) = stream {
            match self.poll.registry().deregister(&mut stream) {
                Ok(()) => event!(Level::TRACE, "stream deregistered"),
                Err(error) => event!(Level::WARN, ?error, "failed to deregister stream"),
            }
        }

        event!(
            Level::DEBUG,
            remote_addr = ?connection.remote_addr,
            "connection closed"
        );
    }
}

fn check_io<T>(value: Result<T, std::io::Error>) -> Result<Option<T>, Error> {
    match value {
        Ok(value) => Ok(Some(value)),
        Err(error) => match error.kind() {
            // WouldBlock just means we've run out of things to handle
            ErrorKind::WouldBlock => Ok(None),
            _ => Err(error.into()),
        },
    }
}
