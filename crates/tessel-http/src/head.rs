use std::borrow::Cow;

use bytes::{BufMut, BytesMut};

use crate::{parser::is_token, ParseError};

/// Single header field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub value: String,
}

impl Field {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Check if this field can be written without breaking the head framing.
    pub fn is_valid(&self) -> bool {
        let name_ok = !self.name.is_empty() && self.name.bytes().all(is_token);
        let value_ok = !self.value.bytes().any(|b| b == b'\r' || b == b'\n' || b == 0);

        name_ok && value_ok
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

/// Parsed request line and header fields of a call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub(crate) method: String,
    pub(crate) target: String,
    pub(crate) version: Option<Version>,
    pub(crate) fields: Vec<Field>,
}

impl RequestHead {
    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn version(&self) -> Option<Version> {
        self.version
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Get the value of the first field matching `name`, ignoring ASCII case.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(name))
            .map(|f| f.value.as_str())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.field("Content-Length")?.parse().ok()
    }

    pub(crate) fn clear(&mut self) {
        self.method.clear();
        self.target.clear();
        self.version = None;
        self.fields.clear();
    }
}

/// Status and header fields of a response, written by `HttpServerCall::write_response_head`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: Option<Cow<'static, str>>,
    pub fields: Vec<Field>,
}

impl ResponseHead {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            reason: None,
            fields: Vec::new(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<Cow<'static, str>>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push(Field::new(name, value));
        self
    }

    /// Response to send when a request head couldn't be parsed.
    pub fn for_parse_error(error: &ParseError) -> Self {
        let status = match error {
            ParseError::HeadTooLarge { .. } => 431,
            _ => 400,
        };

        Self::new(status)
            .with_field("Content-Length", "0")
            .with_field("Connection", "close")
    }

    /// The reason phrase that will be written.
    pub fn reason(&self) -> &str {
        match &self.reason {
            Some(reason) => &**reason,
            None => canonical_reason(self.status).unwrap_or(""),
        }
    }

    /// Serialize the status line and fields, including the terminating empty line.
    pub(crate) fn encode(&self, data: &mut BytesMut) {
        data.put(&b"HTTP/1.1 "[..]);
        data.put(self.status.to_string().as_bytes());
        data.put_u8(b' ');
        data.put(self.reason().as_bytes());
        data.put(&b"\r\n"[..]);

        for field in &self.fields {
            data.put(field.name.as_bytes());
            data.put(&b": "[..]);
            data.put(field.value.as_bytes());
            data.put(&b"\r\n"[..]);
        }

        data.put(&b"\r\n"[..]);
    }
}

pub fn canonical_reason(status: u16) -> Option<&'static str> {
    let reason = match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        411 => "Length Required",
        413 => "Content Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => return None,
    };

    Some(reason)
}
