#![allow(dead_code)]

mod tls;

use std::{
    cell::RefCell,
    collections::VecDeque,
    io::{self, ErrorKind, Read, Write},
    rc::Rc,
};

use mio::Token;
use tessel_http::{CallOptions, Channel, HttpServerCall, Ready};

pub use self::tls::{client_open, client_seal, client_send, given_tls};

/// In-memory non-blocking stream, the test holds the other end as a `MemoryPeer`.
pub struct MemoryStream {
    shared: Rc<RefCell<Shared>>,
}

/// Test side of a `MemoryStream`.
#[derive(Clone)]
pub struct MemoryPeer {
    shared: Rc<RefCell<Shared>>,
}

#[derive(Default)]
struct Shared {
    inbound: VecDeque<Vec<u8>>,
    closed: bool,
    fail_reads: bool,
    outbound: Vec<u8>,
    write_budget: Option<usize>,
}

pub fn memory_stream() -> (MemoryStream, MemoryPeer) {
    let shared = Rc::new(RefCell::new(Shared::default()));
    let stream = MemoryStream {
        shared: shared.clone(),
    };
    let peer = MemoryPeer { shared };

    (stream, peer)
}

impl Read for MemoryStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut shared = self.shared.borrow_mut();

        if shared.fail_reads {
            return Err(ErrorKind::ConnectionReset.into());
        }

        // Every pushed chunk arrives as a separate read, like separate packets would
        let Some(chunk) = shared.inbound.front_mut() else {
            if shared.closed {
                return Ok(0);
            }
            return Err(ErrorKind::WouldBlock.into());
        };

        let len = chunk.len().min(buf.len());
        buf[..len].copy_from_slice(&chunk[..len]);
        chunk.drain(..len);

        if chunk.is_empty() {
            shared.inbound.pop_front();
        }

        Ok(len)
    }
}

impl Write for MemoryStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut shared = self.shared.borrow_mut();

        let len = match shared.write_budget {
            Some(0) => return Err(ErrorKind::WouldBlock.into()),
            Some(budget) => {
                let len = budget.min(buf.len());
                shared.write_budget = Some(budget - len);
                len
            }
            None => buf.len(),
        };

        shared.outbound.extend_from_slice(&buf[..len]);
        Ok(len)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl MemoryPeer {
    pub fn push(&self, data: &[u8]) {
        self.shared.borrow_mut().inbound.push_back(data.to_vec());
    }

    pub fn close(&self) {
        self.shared.borrow_mut().closed = true;
    }

    pub fn fail_reads(&self) {
        self.shared.borrow_mut().fail_reads = true;
    }

    /// Limit the amount of bytes the stream accepts, until set back to `None`.
    pub fn set_write_budget(&self, budget: Option<usize>) {
        self.shared.borrow_mut().write_budget = budget;
    }

    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.shared.borrow_mut().outbound)
    }
}

pub fn readable() -> Ready {
    Ready::new(Token(0), true, false)
}

pub fn given_call() -> HttpServerCall<MemoryStream> {
    given_call_with(CallOptions::default())
}

pub fn given_call_with(options: CallOptions) -> HttpServerCall<MemoryStream> {
    HttpServerCall::new(&options)
}

pub fn given_plain_channel() -> (Channel<MemoryStream>, MemoryPeer) {
    let (stream, peer) = memory_stream();
    (Channel::plain(stream), peer)
}

pub const HELLO_REQUEST: &[u8] = b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n";
