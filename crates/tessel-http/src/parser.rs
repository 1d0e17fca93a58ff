use bytes::{BufMut, BytesMut};
use thiserror::Error;

use crate::head::{Field, RequestHead, Version};

/// Resumable request head parser.
///
/// Bytes can be fed in chunks split at any position, the parser keeps enough state between calls
/// to produce the same result regardless of where the splits are.
pub struct HeadParser {
    max_head_size: usize,
    /// Line contents of the head so far, with line terminators removed.
    data: BytesMut,
    has_cr: bool,
    last_line: usize,
    lines: Vec<usize>,
    seen: usize,
}

/// Progress made by consuming a chunk of bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The head is complete, after consuming this many bytes of the chunk.
    Complete(usize),
    /// The whole chunk was consumed, but the head isn't complete yet.
    Incomplete,
}

impl HeadParser {
    pub fn new(max_head_size: usize) -> Self {
        Self {
            max_head_size,
            data: BytesMut::new(),
            has_cr: false,
            last_line: 0,
            lines: Vec::new(),
            seen: 0,
        }
    }

    /// Consume bytes into the parser.
    ///
    /// Once the terminating empty line is found, the head is written into `head` and the amount of
    /// bytes consumed from `bytes` is returned. Bytes after that belong to the request body.
    pub fn consume(&mut self, bytes: &[u8], head: &mut RequestHead) -> Result<Progress, ParseError> {
        for (i, byte) in bytes.iter().enumerate() {
            self.seen += 1;
            if self.seen > self.max_head_size {
                return Err(ParseError::HeadTooLarge {
                    limit: self.max_head_size,
                });
            }

            match *byte {
                // CRNL is the required newline, so consume CR if it happens
                b'\r' => {
                    self.has_cr = true;
                }
                b'\n' => {
                    // Standalone \n *MAY* be accepted, we handle it the same as CRNL
                    let head_done = self.handle_line();
                    self.has_cr = false;

                    if head_done {
                        self.take_head(head)?;
                        return Ok(Progress::Complete(i + 1));
                    }
                }
                _ => {
                    // CR with no NL needs to be counted as a space
                    if self.has_cr {
                        self.data.put_u8(b' ');
                    }

                    self.data.put_u8(*byte);
                    self.has_cr = false;
                }
            }
        }

        Ok(Progress::Incomplete)
    }

    /// Signal that no more bytes will arrive.
    pub fn finish(&self) -> ParseError {
        ParseError::Truncated {
            received: self.seen,
        }
    }

    /// Clear all state, keeping allocations.
    pub fn reset(&mut self) {
        self.data.clear();
        self.has_cr = false;
        self.last_line = 0;
        self.lines.clear();
        self.seen = 0;
    }

    fn handle_line(&mut self) -> bool {
        let line_len = self.data.len() - self.last_line;

        if line_len == 0 {
            // Empty lines before the request line are ignored, after it they end the head
            return !self.lines.is_empty();
        }

        // Remember that this line is available
        self.lines.push(line_len);

        // Remember where this line ended in the accumulator
        self.last_line = self.data.len();

        false
    }

    /// Assemble the head from the collected lines.
    ///
    /// The request line is written before fields are validated, a bad field leaves `head`
    /// partially populated.
    fn take_head(&mut self, head: &mut RequestHead) -> Result<(), ParseError> {
        let mut offset = 0;

        for (i, length) in self.lines.iter().cloned().enumerate() {
            let line = &self.data[offset..offset + length];
            offset += length;

            if i == 0 {
                parse_request_line(line, head)?;
            } else {
                let field = parse_field(line)?;
                head.fields.push(field);
            }
        }

        Ok(())
    }
}

fn parse_request_line(line: &[u8], head: &mut RequestHead) -> Result<(), ParseError> {
    let line = std::str::from_utf8(line).map_err(|_| ParseError::InvalidUtf8)?;

    let mut parts = line.split(' ');
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(ParseError::MalformedRequestLine);
    };

    if method.is_empty() || !method.bytes().all(is_token) {
        return Err(ParseError::InvalidMethod);
    }
    head.method.push_str(method);

    if target.is_empty() {
        return Err(ParseError::MalformedRequestLine);
    }
    head.target.push_str(target);

    let version = match version {
        "HTTP/1.1" => Version::Http11,
        "HTTP/1.0" => Version::Http10,
        _ => return Err(ParseError::UnsupportedVersion),
    };
    head.version = Some(version);

    Ok(())
}

fn parse_field(line: &[u8]) -> Result<Field, ParseError> {
    // Obsolete line folding, rejecting it is permitted
    if line[0] == b' ' || line[0] == b'\t' {
        return Err(ParseError::MalformedField);
    }

    let split = line
        .iter()
        .position(|ch| *ch == b':')
        .ok_or(ParseError::MalformedField)?;
    let (name, value) = (&line[..split], &line[split + 1..]);

    if name.is_empty() || !name.iter().cloned().all(is_token) {
        return Err(ParseError::MalformedField);
    }

    let name = std::str::from_utf8(name).map_err(|_| ParseError::InvalidUtf8)?;
    let value = std::str::from_utf8(value).map_err(|_| ParseError::InvalidUtf8)?;
    let value = value.trim_matches(|ch| ch == ' ' || ch == '\t');

    Ok(Field::new(name, value))
}

/// Check if a byte is a `tchar` as defined by RFC 9110.
pub(crate) fn is_token(byte: u8) -> bool {
    matches!(byte,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' |
        b'^' | b'_' | b'`' | b'|' | b'~' | b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z')
}

/// Malformed request head.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed request line")]
    MalformedRequestLine,
    #[error("invalid request method")]
    InvalidMethod,
    #[error("unsupported http version")]
    UnsupportedVersion,
    #[error("malformed header field")]
    MalformedField,
    #[error("request head exceeds {limit} bytes")]
    HeadTooLarge { limit: usize },
    #[error("request head is not valid utf-8")]
    InvalidUtf8,
    #[error("stream closed after {received} bytes of request head")]
    Truncated { received: usize },
}
