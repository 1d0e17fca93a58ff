//! Strategies committing whole byte blocks to a channel.
//!
//! A flush is all-or-error. Either the entire block is accepted, in order, or an error is
//! returned. Bytes the stream couldn't take right away stay queued in the channel, to be written
//! by `Channel::drain` when the selector reports the stream writable again.
//!
//! The queue never grows past the channel's backlog limit. A block that doesn't fit after
//! draining is refused with `FlushError::Backpressure`, leaving the channel as it was.

use std::io::{self, Read, Write};

use thiserror::Error;
use tracing::{event, Level};

use crate::channel::{check_io, Channel};

pub trait FlushStrategy<S> {
    /// Commit the entire `block` to the channel.
    fn flush(&mut self, channel: &mut Channel<S>, block: &[u8]) -> Result<(), FlushError>;

    /// Commit as much of `data` as fits in the channel's backlog, returns the bytes committed.
    fn commit(&mut self, channel: &mut Channel<S>, data: &[u8]) -> Result<usize, FlushError>
    where
        S: Read + Write,
    {
        if data.is_empty() {
            return Ok(0);
        }

        channel.drain()?;

        let room = channel.room();
        if room == 0 {
            return Err(FlushError::Backpressure);
        }

        let len = data.len().min(room);
        self.flush(channel, &data[..len])?;

        Ok(len)
    }
}

/// Flush strategy writing raw bytes to a plain channel.
#[derive(Default)]
pub struct PlainFlush;

impl<S> FlushStrategy<S> for PlainFlush
where
    S: Read + Write,
{
    fn flush(&mut self, channel: &mut Channel<S>, block: &[u8]) -> Result<(), FlushError> {
        if channel.is_confidential() {
            return Err(FlushError::ConfidentialityMismatch);
        }

        // Queued bytes have to go out first, anything new goes behind them
        if !channel.backlog.is_empty() && channel.drain()? {
            event!(Level::TRACE, "backlog drained");
        }

        if block.len() > channel.room() {
            return Err(FlushError::Backpressure);
        }

        if !channel.backlog.is_empty() {
            channel.backlog.extend_from_slice(block);
            return Ok(());
        }

        let mut remaining = block;
        while !remaining.is_empty() {
            let Some(written) = check_io(|| channel.stream.write(remaining))? else {
                break;
            };

            if written == 0 {
                return Err(FlushError::WriteZero);
            }
            remaining = &remaining[written..];
        }

        if !remaining.is_empty() {
            event!(Level::TRACE, bytes = remaining.len(), "stream full, queueing");
            channel.backlog.extend_from_slice(remaining);
        }

        Ok(())
    }
}

/// Flush strategy encrypting bytes for a confidential channel.
///
/// If the handshake hasn't completed yet, the session holds on to the plaintext and the records
/// produced go out as soon as it's done.
#[derive(Default)]
pub struct SecureFlush;

impl<S> FlushStrategy<S> for SecureFlush
where
    S: Read + Write,
{
    fn flush(&mut self, channel: &mut Channel<S>, block: &[u8]) -> Result<(), FlushError> {
        if !channel.is_confidential() {
            return Err(FlushError::ConfidentialityMismatch);
        }

        // Sealing adds record overhead, the plaintext size stands in for it
        channel.drain()?;
        if block.len() > channel.room() {
            return Err(FlushError::Backpressure);
        }

        let tls = channel
            .tls
            .as_mut()
            .ok_or(FlushError::ConfidentialityMismatch)?;

        if tls.is_handshaking() {
            event!(Level::DEBUG, "flushing before handshake completed");
        }

        tls.writer().write_all(block)?;
        channel.drain()?;

        Ok(())
    }
}

/// Failed to flush a block to a channel.
#[derive(Error, Debug)]
pub enum FlushError {
    #[error("transport failure while writing")]
    Io(#[from] io::Error),
    #[error("stream accepted zero bytes")]
    WriteZero,
    #[error("flush strategy doesn't match the channel's confidentiality")]
    ConfidentialityMismatch,
    #[error("channel backlog limit reached")]
    Backpressure,
}

impl From<FlushError> for io::Error {
    fn from(error: FlushError) -> Self {
        match error {
            FlushError::Io(error) => error,
            FlushError::WriteZero => io::ErrorKind::WriteZero.into(),
            FlushError::Backpressure => io::Error::new(io::ErrorKind::WouldBlock, error),
            error => io::Error::new(io::ErrorKind::Other, error),
        }
    }
}
