use std::io::{self, Read, Write};

use bytes::Bytes;

use crate::{channel::Channel, flush::FlushStrategy};

/// Response body producer.
///
/// The body writes itself to the sink it's given, including any framing it needs. The call never
/// interprets the bytes.
pub trait Body {
    fn write_to(&mut self, sink: &mut dyn Write) -> io::Result<()>;

    /// Size of the body in bytes, if known up front.
    fn size(&self) -> Option<u64> {
        None
    }
}

impl Body for Bytes {
    fn write_to(&mut self, sink: &mut dyn Write) -> io::Result<()> {
        sink.write_all(&self[..])
    }

    fn size(&self) -> Option<u64> {
        Some(Bytes::len(self) as u64)
    }
}

impl Body for Vec<u8> {
    fn write_to(&mut self, sink: &mut dyn Write) -> io::Result<()> {
        sink.write_all(&self[..])
    }

    fn size(&self) -> Option<u64> {
        Some(Vec::len(self) as u64)
    }
}

impl Body for &[u8] {
    fn write_to(&mut self, sink: &mut dyn Write) -> io::Result<()> {
        sink.write_all(&self[..])
    }

    fn size(&self) -> Option<u64> {
        Some(<[u8]>::len(self) as u64)
    }
}

impl Body for String {
    fn write_to(&mut self, sink: &mut dyn Write) -> io::Result<()> {
        sink.write_all(self.as_bytes())
    }

    fn size(&self) -> Option<u64> {
        Some(String::len(self) as u64)
    }
}

impl Body for &str {
    fn write_to(&mut self, sink: &mut dyn Write) -> io::Result<()> {
        sink.write_all(self.as_bytes())
    }

    fn size(&self) -> Option<u64> {
        Some(str::len(self) as u64)
    }
}

/// Byte sink over a call's channel, routing writes through the matching flush strategy.
pub struct ResponseSink<'a, S> {
    channel: &'a mut Channel<S>,
    strategy: &'a mut dyn FlushStrategy<S>,
    written: u64,
}

impl<'a, S> ResponseSink<'a, S> {
    pub(crate) fn new(channel: &'a mut Channel<S>, strategy: &'a mut dyn FlushStrategy<S>) -> Self {
        Self {
            channel,
            strategy,
            written: 0,
        }
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

impl<'a, S> Write for ResponseSink<'a, S>
where
    S: Read + Write,
{
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let committed = self
            .strategy
            .commit(self.channel, buf)
            .map_err(io::Error::from)?;
        self.written += committed as u64;

        Ok(committed)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.channel.drain()?;
        Ok(())
    }
}
