use std::{
    io::{self, ErrorKind, Read, Write},
    sync::Arc,
};

use bytes::{Buf, BufMut, BytesMut};
use mio::{event::Event, Token};
use rustls::{ServerConfig, ServerConnection};
use thiserror::Error;
use tracing::{event, Level};

/// Readiness key of a channel, as last reported by the selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ready {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
}

impl Ready {
    pub fn new(token: Token, readable: bool, writable: bool) -> Self {
        Self {
            token,
            readable,
            writable,
        }
    }

    pub fn from_event(event: &Event) -> Self {
        Self {
            token: event.token(),
            readable: event.is_readable(),
            writable: event.is_writable(),
        }
    }

    /// Accumulate another readiness report for the same token.
    pub fn merge(&mut self, other: Ready) {
        self.readable |= other.readable;
        self.writable |= other.writable;
    }
}

/// Duplex non-blocking transport of a single connection.
///
/// A confidential channel carries the TLS session of the connection. The bytes crossing `stream`
/// are then ciphertext, and only the secure source and flush strategy may touch them.
///
/// Bytes the stream didn't accept yet are kept in the backlog, which never grows past the
/// backlog limit through a flush.
pub struct Channel<S> {
    pub(crate) stream: S,
    pub(crate) tls: Option<ServerConnection>,
    /// Committed bytes the stream didn't accept yet, ciphertext on confidential channels.
    pub(crate) backlog: BytesMut,
    backlog_limit: usize,
}

impl<S> Channel<S>
where
    S: Read + Write,
{
    pub fn plain(stream: S) -> Self {
        Self {
            stream,
            tls: None,
            backlog: BytesMut::new(),
            backlog_limit: usize::MAX,
        }
    }

    /// Create a confidential channel, starting a new server-side TLS session.
    pub fn confidential(stream: S, config: Arc<ServerConfig>) -> Result<Self, ChannelError> {
        let tls = ServerConnection::new(config)?;
        Ok(Self::with_session(stream, tls))
    }

    /// Create a confidential channel over a TLS session that was already started.
    pub fn with_session(stream: S, mut tls: ServerConnection) -> Self {
        // Ciphertext is moved to the backlog as soon as it's produced, the limit applies there
        tls.set_buffer_limit(None);

        Self {
            stream,
            tls: Some(tls),
            backlog: BytesMut::new(),
            backlog_limit: usize::MAX,
        }
    }

    pub fn is_confidential(&self) -> bool {
        self.tls.is_some()
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn into_stream(self) -> S {
        self.stream
    }

    /// Set the amount of bytes flushes may leave waiting for the stream.
    pub fn set_backlog_limit(&mut self, limit: usize) {
        self.backlog_limit = limit;
    }

    pub fn backlog_limit(&self) -> usize {
        self.backlog_limit
    }

    /// Amount of committed bytes waiting for the stream to accept them.
    pub fn pending(&self) -> usize {
        self.backlog.len()
    }

    /// Amount of bytes a flush may still add to the backlog.
    pub(crate) fn room(&self) -> usize {
        self.backlog_limit.saturating_sub(self.backlog.len())
    }

    /// Check if committed bytes are still waiting for the stream to accept them.
    pub fn wants_write(&self) -> bool {
        let sealing = self.tls.as_ref().map_or(false, |tls| tls.wants_write());
        sealing || !self.backlog.is_empty()
    }

    /// Queue a TLS close_notify alert, does nothing for plain channels.
    pub fn close_notify(&mut self) {
        if let Some(tls) = &mut self.tls {
            event!(Level::TRACE, "queueing close_notify");
            tls.send_close_notify();
        }
    }

    /// Write pending bytes to the stream until it would block.
    ///
    /// Returns `true` if nothing is left pending.
    pub fn drain(&mut self) -> Result<bool, io::Error> {
        let Self {
            stream,
            tls,
            backlog,
            ..
        } = self;

        // Sealed records join the backlog, so both variants drain the same way
        if let Some(tls) = tls {
            let mut sealed = (&mut *backlog).writer();
            while tls.wants_write() {
                let written = tls.write_tls(&mut sealed)?;
                event!(Level::TRACE, bytes = written, "sealed ciphertext");
            }
        }

        while !backlog.is_empty() {
            let Some(written) = check_io(|| stream.write(&backlog[..]))? else {
                return Ok(false);
            };

            if written == 0 {
                return Err(ErrorKind::WriteZero.into());
            }
            event!(Level::TRACE, bytes = written, "drained backlog");
            backlog.advance(written);
        }

        check_io(|| stream.flush())?;

        Ok(true)
    }
}

/// Run an I/O operation, mapping `WouldBlock` to `None`.
///
/// Interrupted operations are retried.
pub(crate) fn check_io<T, F>(mut op: F) -> Result<Option<T>, io::Error>
where
    F: FnMut() -> Result<T, io::Error>,
{
    loop {
        match op() {
            Ok(value) => return Ok(Some(value)),
            Err(error) => match error.kind() {
                // WouldBlock just means we've run out of things to handle
                ErrorKind::WouldBlock => return Ok(None),
                ErrorKind::Interrupted => continue,
                _ => return Err(error),
            },
        }
    }
}

/// Failed to create a channel.
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("failed to start tls session")]
    Tls(#[from] rustls::Error),
}
