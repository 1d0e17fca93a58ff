use std::io::{self, Read, Write};

use bytes::BytesMut;
use thiserror::Error;
use tracing::{event, instrument, Level};

use crate::{
    body::{Body, ResponseSink},
    channel::{Channel, Ready},
    flush::{FlushError, FlushStrategy, PlainFlush, SecureFlush},
    head::{RequestHead, ResponseHead},
    parser::{HeadParser, ParseError, Progress},
    source::{Fill, HeadSource, PlainSource, SecureSource, SourceError},
};

/// Limits and buffer sizes of a call.
#[derive(Debug, Clone)]
pub struct CallOptions {
    /// Maximum size of a request head, including line terminators.
    pub max_head_size: usize,
    /// Amount of bytes read from a channel at once.
    pub read_chunk: usize,
    /// Maximum amount of response bytes left waiting for a stalled stream.
    pub max_backlog: usize,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            max_head_size: 8 * 1024,
            read_chunk: 1024,
            max_backlog: 256 * 1024,
        }
    }
}

/// Lifecycle state of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Not bound to a channel, available for acquisition.
    Idle,
    /// Bound to a channel, the request head isn't complete yet.
    Acquired,
    HeadParsed,
    HeadFailed,
    ResponseHeadWritten,
    ResponseBodyWritten,
}

/// Outcome of reading the request head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadStatus {
    Parsed,
    /// More bytes are needed, resume the call on the next readiness event.
    Pending,
    /// Failed, the error is available through `HttpServerCall::head_error`.
    Failed,
}

/// HTTP server call over a single selector-driven channel.
///
/// A call is created once and then reused for many connections, one at a time. Both head source
/// variants and both flush strategies live in the call for its entire lifetime, acquisition picks
/// the pair matching the channel's confidentiality.
///
/// The response head has to be written before the response body. Writing the body first is
/// rejected with `CallError::BodyBeforeHead`.
pub struct HttpServerCall<S> {
    channel: Option<Channel<S>>,
    confidential: bool,
    state: CallState,

    plain_source: PlainSource,
    secure_source: SecureSource,
    plain_flush: PlainFlush,
    secure_flush: SecureFlush,

    parser: HeadParser,
    request: RequestHead,
    head_error: Option<HeadError>,
    head_buf: BytesMut,
    max_backlog: usize,
}

impl<S> HttpServerCall<S>
where
    S: Read + Write,
{
    pub fn new(options: &CallOptions) -> Self {
        Self {
            channel: None,
            confidential: false,
            state: CallState::Idle,

            plain_source: PlainSource::new(options.read_chunk),
            secure_source: SecureSource::new(options.read_chunk),
            plain_flush: PlainFlush,
            secure_flush: SecureFlush,

            parser: HeadParser::new(options.max_head_size),
            request: RequestHead::default(),
            head_error: None,
            head_buf: BytesMut::with_capacity(1024),
            max_backlog: options.max_backlog,
        }
    }

    /// Bind the call to a channel and read as much of the request head as is available.
    ///
    /// `initial` are bytes the connector already read from the channel. Failures are recorded
    /// and logged, not returned, the channel stays bound either way so an error response can
    /// still be written.
    #[instrument("HttpServerCall::acquire", level = "debug", skip_all)]
    pub fn acquire(&mut self, mut channel: Channel<S>, ready: Ready, initial: &[u8]) -> HeadStatus {
        if self.state != CallState::Idle {
            event!(Level::ERROR, state = ?self.state, "acquiring call that isn't idle");
            debug_assert!(false, "acquiring call that isn't idle");
            self.recycle();
        }

        channel.set_backlog_limit(self.max_backlog);
        self.confidential = channel.is_confidential();
        self.channel = Some(channel);
        self.state = CallState::Acquired;

        event!(
            Level::DEBUG,
            confidential = self.confidential,
            bytes = initial.len(),
            "call acquired"
        );

        if self.confidential {
            HeadSource::<S>::bind(&mut self.secure_source, ready, initial);
        } else {
            HeadSource::<S>::bind(&mut self.plain_source, ready, initial);
        }

        self.read_head()
    }

    /// Continue reading the request head after a new readiness event.
    ///
    /// Once the head is parsed or failed, this returns that status without reading.
    #[instrument("HttpServerCall::resume", level = "debug", skip_all)]
    pub fn resume(&mut self, ready: Ready) -> HeadStatus {
        match self.state {
            CallState::Idle => {
                event!(Level::ERROR, "resuming call that isn't acquired");
                HeadStatus::Failed
            }
            CallState::Acquired => {
                self.source_mut().set_ready(ready);
                self.read_head()
            }
            CallState::HeadFailed => HeadStatus::Failed,
            _ if self.head_error.is_some() => HeadStatus::Failed,
            _ => HeadStatus::Parsed,
        }
    }

    fn source_mut(&mut self) -> &mut dyn HeadSource<S> {
        select_source(
            self.confidential,
            &mut self.plain_source,
            &mut self.secure_source,
        )
    }

    fn read_head(&mut self) -> HeadStatus {
        let result = self.drive_parser();

        match result {
            Ok(true) => {
                event!(
                    Level::DEBUG,
                    method = self.request.method(),
                    path = self.request.target(),
                    "request head parsed"
                );
                self.state = CallState::HeadParsed;
                HeadStatus::Parsed
            }
            Ok(false) => HeadStatus::Pending,
            Err(error) => {
                event!(Level::WARN, ?error, "unable to parse the http request");
                self.head_error = Some(error);
                self.state = CallState::HeadFailed;
                HeadStatus::Failed
            }
        }
    }

    /// Feed the source into the parser until the head completes or the source runs dry.
    fn drive_parser(&mut self) -> Result<bool, HeadError> {
        let Self {
            channel,
            confidential,
            plain_source,
            secure_source,
            parser,
            request,
            ..
        } = self;

        let channel = channel.as_mut().ok_or(SourceError::NotBound)?;
        let source = select_source(*confidential, plain_source, secure_source);

        loop {
            let (complete, consumed) = match source.fill(channel)? {
                Fill::Data(data) => match parser.consume(data, request)? {
                    Progress::Complete(consumed) => (true, consumed),
                    Progress::Incomplete => (false, data.len()),
                },
                Fill::Pending => return Ok(false),
                Fill::Closed => return Err(parser.finish().into()),
            };

            source.consume(consumed);

            if complete {
                return Ok(true);
            }
        }
    }

    /// Serialize the response head and flush it to the channel.
    ///
    /// This also works for calls whose request head failed to parse, so an error response can
    /// be sent back.
    #[instrument("HttpServerCall::write_response_head", level = "debug", skip_all)]
    pub fn write_response_head(&mut self, response: &ResponseHead) -> Result<(), CallError> {
        if self.channel.is_none() {
            event!(Level::ERROR, "writing response head on call that isn't acquired");
            return Err(CallError::NotAcquired);
        }

        if matches!(
            self.state,
            CallState::ResponseHeadWritten | CallState::ResponseBodyWritten
        ) {
            event!(Level::ERROR, "response head written twice");
            return Err(CallError::HeadAlreadyWritten);
        }

        if let Some(field) = response.fields.iter().find(|f| !f.is_valid()) {
            return Err(CallError::InvalidField(field.name.clone()));
        }

        let Self {
            channel,
            confidential,
            plain_flush,
            secure_flush,
            head_buf,
            ..
        } = self;
        let channel = channel.as_mut().ok_or(CallError::NotAcquired)?;
        let strategy = select_strategy(*confidential, plain_flush, secure_flush);

        head_buf.clear();
        response.encode(head_buf);
        strategy.flush(channel, &head_buf[..])?;

        event!(
            Level::DEBUG,
            status = response.status,
            bytes = head_buf.len(),
            "response head written"
        );
        self.state = CallState::ResponseHeadWritten;

        Ok(())
    }

    /// Stream a response body to the channel.
    ///
    /// The body is written directly through the flush strategy matching the call's
    /// confidentiality, it's never buffered as a whole.
    #[instrument("HttpServerCall::write_response_body", level = "debug", skip_all)]
    pub fn write_response_body<B>(&mut self, body: &mut B) -> Result<(), CallError>
    where
        B: Body + ?Sized,
    {
        if self.channel.is_none() {
            event!(Level::ERROR, "writing response body on call that isn't acquired");
            return Err(CallError::NotAcquired);
        }

        if !matches!(
            self.state,
            CallState::ResponseHeadWritten | CallState::ResponseBodyWritten
        ) {
            event!(Level::ERROR, state = ?self.state, "response body written before head");
            return Err(CallError::BodyBeforeHead);
        }

        let Self {
            channel,
            confidential,
            plain_flush,
            secure_flush,
            ..
        } = self;
        let channel = channel.as_mut().ok_or(CallError::NotAcquired)?;
        let strategy = select_strategy(*confidential, plain_flush, secure_flush);

        let mut sink = ResponseSink::new(channel, strategy);
        body.write_to(&mut sink).map_err(body_error)?;

        event!(Level::DEBUG, bytes = sink.written(), "response body written");
        self.state = CallState::ResponseBodyWritten;

        Ok(())
    }

    /// Reset all per-connection state, making the call available for a new acquisition.
    ///
    /// Recycling an idle call does nothing.
    #[instrument("HttpServerCall::recycle", level = "debug", skip_all)]
    pub fn recycle(&mut self) -> &mut Self {
        if self.state != CallState::Idle {
            event!(Level::DEBUG, "recycling call");
        }

        HeadSource::<S>::recycle(&mut self.plain_source);
        HeadSource::<S>::recycle(&mut self.secure_source);
        self.parser.reset();
        self.request.clear();
        self.head_error = None;
        self.head_buf.clear();

        self.channel = None;
        self.confidential = false;
        self.state = CallState::Idle;

        self
    }

    /// Take the channel out of the call, leaving the call otherwise untouched.
    ///
    /// The call then can't write anything anymore, and should be recycled.
    pub fn detach(&mut self) -> Option<Channel<S>> {
        self.channel.take()
    }

    /// Channel to read the request from, the same channel as the response channel.
    pub fn request_channel(&mut self) -> Option<&mut Channel<S>> {
        self.channel.as_mut()
    }

    /// Channel to write the response to, the same channel as the request channel.
    pub fn response_channel(&mut self) -> Option<&mut Channel<S>> {
        self.channel.as_mut()
    }

    pub fn is_acquired(&self) -> bool {
        self.channel.is_some()
    }

    pub fn is_confidential(&self) -> bool {
        self.confidential
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn request(&self) -> &RequestHead {
        &self.request
    }

    pub fn head_error(&self) -> Option<&HeadError> {
        self.head_error.as_ref()
    }

    /// Plaintext bytes read past the end of the request head, the start of the request body.
    pub fn buffered(&self) -> &[u8] {
        if self.confidential {
            HeadSource::<S>::buffered(&self.secure_source)
        } else {
            HeadSource::<S>::buffered(&self.plain_source)
        }
    }
}

fn select_source<'a, S>(
    confidential: bool,
    plain: &'a mut PlainSource,
    secure: &'a mut SecureSource,
) -> &'a mut dyn HeadSource<S>
where
    S: Read + Write,
{
    if confidential {
        secure as &mut dyn HeadSource<S>
    } else {
        plain
    }
}

fn select_strategy<'a, S>(
    confidential: bool,
    plain: &'a mut PlainFlush,
    secure: &'a mut SecureFlush,
) -> &'a mut dyn FlushStrategy<S>
where
    S: Read + Write,
{
    if confidential {
        secure as &mut dyn FlushStrategy<S>
    } else {
        plain
    }
}

/// Failed to read the request head of a call.
#[derive(Error, Debug)]
pub enum HeadError {
    #[error("malformed request head")]
    Parse(#[from] ParseError),
    #[error("failed to read request head")]
    Source(#[from] SourceError),
}

impl HeadError {
    /// The parse error, if the request itself was at fault rather than the transport.
    pub fn parse_error(&self) -> Option<&ParseError> {
        match self {
            HeadError::Parse(error) => Some(error),
            HeadError::Source(_) => None,
        }
    }
}

/// Failed call operation.
#[derive(Error, Debug)]
pub enum CallError {
    #[error("call isn't bound to a channel")]
    NotAcquired,
    #[error("response head already written")]
    HeadAlreadyWritten,
    #[error("response body written before response head")]
    BodyBeforeHead,
    #[error("invalid response header field \"{0}\"")]
    InvalidField(String),
    #[error("failed to flush to channel")]
    Flush(#[from] FlushError),
    #[error("transport failure while writing body")]
    Io(#[from] io::Error),
}

/// Recover flush failures the sink had to pass through `io::Error`.
fn body_error(error: io::Error) -> CallError {
    if !error.get_ref().map_or(false, |inner| inner.is::<FlushError>()) {
        return CallError::Io(error);
    }

    match error.into_inner().map(|inner| inner.downcast::<FlushError>()) {
        Some(Ok(error)) => CallError::Flush(*error),
        _ => CallError::Io(io::ErrorKind::Other.into()),
    }
}
