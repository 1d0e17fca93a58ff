//! Sources of request head bytes.
//!
//! A source presents the bytes a connector already read speculatively, followed by anything
//! later read from the channel, as one sequential byte stream. The plain and secure variants
//! yield the same plaintext for the same request, so the head parser never needs to know which
//! one it's reading from.

use std::io::{self, ErrorKind, Read, Write};

use bytes::{Buf, BytesMut};
use thiserror::Error;
use tracing::{event, Level};

use crate::channel::{check_io, Channel, Ready};

/// Result of filling a source.
#[derive(Debug, PartialEq, Eq)]
pub enum Fill<'a> {
    /// Unconsumed bytes are available.
    Data(&'a [u8]),
    /// No bytes are available without blocking, try again on the next readiness event.
    Pending,
    /// The peer closed the channel.
    Closed,
}

/// Recyclable sequential reader of request head bytes.
pub trait HeadSource<S> {
    /// Bind the source to a new connection.
    ///
    /// `initial` is copied into the source's own buffer, which keeps its capacity across
    /// recycles.
    fn bind(&mut self, ready: Ready, initial: &[u8]);

    /// Merge a new readiness report into the bound readiness key.
    fn set_ready(&mut self, ready: Ready);

    /// Make unconsumed bytes available, reading from the channel if needed.
    fn fill<'a>(&'a mut self, channel: &mut Channel<S>) -> Result<Fill<'a>, SourceError>;

    /// Mark `amount` bytes returned by `fill` as consumed.
    fn consume(&mut self, amount: usize);

    /// Bytes read but not yet consumed.
    fn buffered(&self) -> &[u8];

    /// Drop all per-connection state, keeping allocations.
    fn recycle(&mut self);
}

/// Head source reading raw bytes from a plain channel.
pub struct PlainSource {
    ready: Option<Ready>,
    buffer: BytesMut,
    read_chunk: usize,
}

impl PlainSource {
    pub fn new(read_chunk: usize) -> Self {
        Self {
            ready: None,
            buffer: BytesMut::new(),
            read_chunk: read_chunk.max(1),
        }
    }
}

impl<S> HeadSource<S> for PlainSource
where
    S: Read + Write,
{
    fn bind(&mut self, ready: Ready, initial: &[u8]) {
        self.ready = Some(ready);
        self.buffer.clear();
        self.buffer.extend_from_slice(initial);
    }

    fn set_ready(&mut self, ready: Ready) {
        if let Some(current) = &mut self.ready {
            current.merge(ready);
        }
    }

    fn fill<'a>(&'a mut self, channel: &mut Channel<S>) -> Result<Fill<'a>, SourceError> {
        if channel.is_confidential() {
            return Err(SourceError::ConfidentialityMismatch);
        }

        if !self.buffer.is_empty() {
            return Ok(Fill::Data(&self.buffer));
        }

        let ready = self.ready.as_mut().ok_or(SourceError::NotBound)?;
        if !ready.readable {
            return Ok(Fill::Pending);
        }

        // Read the next chunk directly into the buffer's spare capacity
        self.buffer.resize(self.read_chunk, 0);
        let result = check_io(|| channel.stream.read(&mut self.buffer[..]));
        let read = match result {
            Ok(Some(read)) => read,
            Ok(None) => {
                self.buffer.clear();
                ready.readable = false;
                return Ok(Fill::Pending);
            }
            Err(error) => {
                self.buffer.clear();
                return Err(error.into());
            }
        };
        self.buffer.truncate(read);

        // Read of zero means the stream has been closed
        if read == 0 {
            event!(Level::DEBUG, "channel closed while reading head");
            return Ok(Fill::Closed);
        }

        event!(Level::TRACE, bytes = read, "read plain head bytes");
        Ok(Fill::Data(&self.buffer))
    }

    fn consume(&mut self, amount: usize) {
        self.buffer.advance(amount);
    }

    fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    fn recycle(&mut self) {
        self.ready = None;
        self.buffer.clear();
    }
}

/// Head source decrypting bytes from a confidential channel.
///
/// Initial bytes are ciphertext. They go into the channel's TLS session before anything new is
/// read from the stream. Handshake records produced along the way are written out immediately,
/// so the handshake progresses while the head is being read.
pub struct SecureSource {
    ready: Option<Ready>,
    ciphertext: BytesMut,
    plaintext: BytesMut,
    read_chunk: usize,
}

impl SecureSource {
    pub fn new(read_chunk: usize) -> Self {
        Self {
            ready: None,
            ciphertext: BytesMut::new(),
            plaintext: BytesMut::new(),
            read_chunk: read_chunk.max(1),
        }
    }

    /// Move decrypted bytes from the session into `plaintext`.
    ///
    /// Returns `Some(true)` if bytes were taken, `Some(false)` if the session is cleanly closed,
    /// and `None` if more ciphertext is needed.
    fn take_plaintext<S>(&mut self, channel: &mut Channel<S>) -> Result<Option<bool>, SourceError>
    where
        S: Read + Write,
    {
        let tls = channel
            .tls
            .as_mut()
            .ok_or(SourceError::ConfidentialityMismatch)?;

        let start = self.plaintext.len();
        self.plaintext.resize(start + self.read_chunk, 0);
        let result = tls.reader().read(&mut self.plaintext[start..]);

        let read = match result {
            Ok(read) => read,
            Err(error) => {
                self.plaintext.truncate(start);

                return match error.kind() {
                    ErrorKind::WouldBlock => Ok(None),
                    // Peer hung up without close_notify, the head parser treats this as truncation
                    ErrorKind::UnexpectedEof => Ok(Some(false)),
                    _ => Err(error.into()),
                };
            }
        };
        self.plaintext.truncate(start + read);

        Ok(Some(read != 0))
    }

    /// Feed the next batch of ciphertext into the session.
    ///
    /// Returns `false` if no ciphertext is available without blocking.
    fn feed_ciphertext<S>(&mut self, channel: &mut Channel<S>) -> Result<bool, SourceError>
    where
        S: Read + Write,
    {
        let Channel { stream, tls, .. } = channel;
        let tls = tls.as_mut().ok_or(SourceError::ConfidentialityMismatch)?;

        if !self.ciphertext.is_empty() {
            let mut pending = &self.ciphertext[..];
            let read = tls.read_tls(&mut pending)?;
            self.ciphertext.advance(read);
            event!(Level::TRACE, bytes = read, "fed buffered ciphertext");
        } else {
            let ready = self.ready.as_mut().ok_or(SourceError::NotBound)?;
            if !ready.readable {
                return Ok(false);
            }

            let Some(read) = check_io(|| tls.read_tls(&mut *stream))? else {
                ready.readable = false;
                return Ok(false);
            };
            event!(Level::TRACE, bytes = read, "read ciphertext");
        }

        tls.process_new_packets()?;

        Ok(true)
    }
}

impl<S> HeadSource<S> for SecureSource
where
    S: Read + Write,
{
    fn bind(&mut self, ready: Ready, initial: &[u8]) {
        self.ready = Some(ready);
        self.ciphertext.clear();
        self.ciphertext.extend_from_slice(initial);
        self.plaintext.clear();
    }

    fn set_ready(&mut self, ready: Ready) {
        if let Some(current) = &mut self.ready {
            current.merge(ready);
        }
    }

    fn fill<'a>(&'a mut self, channel: &mut Channel<S>) -> Result<Fill<'a>, SourceError> {
        if !channel.is_confidential() {
            return Err(SourceError::ConfidentialityMismatch);
        }

        if self.ready.is_none() {
            return Err(SourceError::NotBound);
        }

        loop {
            if !self.plaintext.is_empty() {
                return Ok(Fill::Data(&self.plaintext));
            }

            match self.take_plaintext(channel)? {
                Some(true) => continue,
                Some(false) => return Ok(Fill::Closed),
                None => {}
            }

            let fed = self.feed_ciphertext(channel);

            // Handshake replies and alerts have to go out even if reading failed
            channel.drain()?;

            if !fed? {
                return Ok(Fill::Pending);
            }

            // A zero length read from the stream shows up as a clean or unclean EOF on the next
            // plaintext take, so there's no separate check here
        }
    }

    fn consume(&mut self, amount: usize) {
        self.plaintext.advance(amount);
    }

    fn buffered(&self) -> &[u8] {
        &self.plaintext
    }

    fn recycle(&mut self) {
        self.ready = None;
        self.ciphertext.clear();
        self.plaintext.clear();
    }
}

/// Failed to read head bytes.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("transport failure while reading")]
    Io(#[from] io::Error),
    #[error("tls failure while reading")]
    Tls(#[from] rustls::Error),
    #[error("source used without a bound readiness key")]
    NotBound,
    #[error("source variant doesn't match the channel's confidentiality")]
    ConfidentialityMismatch,
}
