//! Recyclable HTTP server calls over selector-driven channels.
//!
//! An `HttpServerCall` adapts one non-blocking connection into one request/response exchange.
//! Whether the connection is plain or TLS is decided once, when the call is acquired, by picking
//! the matching head source and flush strategy. Everything else about the call is the same for
//! both.

mod body;
mod call;
mod channel;
mod flush;
mod head;
mod parser;
mod pool;
mod source;

pub use self::{
    body::{Body, ResponseSink},
    call::{CallError, CallOptions, CallState, HeadError, HeadStatus, HttpServerCall},
    channel::{Channel, ChannelError, Ready},
    flush::{FlushError, FlushStrategy, PlainFlush, SecureFlush},
    head::{canonical_reason, Field, RequestHead, ResponseHead, Version},
    parser::{HeadParser, ParseError, Progress},
    pool::{CallId, CallPool},
    source::{Fill, HeadSource, PlainSource, SecureSource, SourceError},
};
