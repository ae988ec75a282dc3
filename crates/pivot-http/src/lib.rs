//! HTTP/1.x message model and parsing for the pivot proxy.
//!
//! The proxy only needs the interop subset of HTTP/1.x that real clients
//! emit: request/status line, ordered headers, and the three body framings
//! (fixed length, chunked, close-delimited). Headers are kept as an ordered,
//! case-preserving list so a parsed message can be re-serialized without
//! losing what the client sent.

mod chunked;
mod forward;
mod head;
mod parser;

pub use chunked::{ChunkEvent, ChunkedDecoder, ChunkedError, MAX_CHUNK_SIZE};
pub use forward::{
    build_forward_request_head, resolve_target, ForwardRequest, ForwardRewrite, RewriteError,
};
pub use head::HeadBuffer;
pub use parser::{parse_request_head, parse_response_head, ParseError};

/// Limits applied while reading and parsing a message head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseLimits {
    pub max_request_line: usize,
    pub max_head_bytes: usize,
    pub max_header_value: usize,
}

impl Default for ParseLimits {
    fn default() -> Self {
        Self {
            max_request_line: 8 * 1024,
            max_head_bytes: 64 * 1024,
            max_header_value: 8 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
}

impl HttpVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        }
    }
}

/// How the message body is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyMode {
    None,
    ContentLength(u64),
    Chunked,
    CloseDelimited,
}

/// A single header line. Name casing and duplicates are preserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Ordered header list with case-insensitive lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<Header>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, header: Header) {
        self.0.push(header);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// First value for `name`, if any.
    pub fn first(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|header| header.name.eq_ignore_ascii_case(name))
            .map(|header| header.value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.first(name).is_some()
    }

    /// True when any occurrence of `name` carries `token` in its
    /// comma-separated value list.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.0
            .iter()
            .filter(|header| header.name.eq_ignore_ascii_case(name))
            .flat_map(|header| header.value.split(','))
            .any(|value| value.trim().eq_ignore_ascii_case(token))
    }

    /// All tokens carried by occurrences of `name`.
    pub fn tokens(&self, name: &str) -> Vec<String> {
        self.0
            .iter()
            .filter(|header| header.name.eq_ignore_ascii_case(name))
            .flat_map(|header| header.value.split(','))
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .collect()
    }

    /// Remove every occurrence of each name in `names`.
    pub fn remove_all(&mut self, names: &[&str]) {
        self.0.retain(|header| {
            !names
                .iter()
                .any(|name| header.name.eq_ignore_ascii_case(name))
        });
    }

    /// Replace the first occurrence of `name` or append when absent.
    pub fn set(&mut self, name: &str, value: &str) {
        match self
            .0
            .iter_mut()
            .find(|header| header.name.eq_ignore_ascii_case(name))
        {
            Some(header) => header.value = value.to_string(),
            None => self.0.push(Header::new(name, value)),
        }
    }
}

impl FromIterator<Header> for Headers {
    fn from_iter<T: IntoIterator<Item = Header>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: HttpVersion,
    pub headers: Headers,
    pub body_mode: BodyMode,
}

impl RequestHead {
    /// Serialize the head with CRLF line terminators, ending with the blank
    /// line. Input line endings are normalized here regardless of what the
    /// client sent.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(self.method.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.target.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.version.as_str().as_bytes());
        out.extend_from_slice(b"\r\n");
        serialize_headers(&self.headers, &mut out);
        out
    }

    /// Whether the client negotiated connection persistence.
    pub fn wants_keep_alive(&self) -> bool {
        wants_keep_alive(self.version, &self.headers)
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub version: HttpVersion,
    pub status_code: u16,
    pub reason_phrase: String,
    pub headers: Headers,
    pub body_mode: BodyMode,
}

impl ResponseHead {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(self.version.as_str().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.status_code.to_string().as_bytes());
        if !self.reason_phrase.is_empty() {
            out.push(b' ');
            out.extend_from_slice(self.reason_phrase.as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        serialize_headers(&self.headers, &mut out);
        out
    }

    pub fn allows_keep_alive(&self) -> bool {
        if self.body_mode == BodyMode::CloseDelimited {
            return false;
        }
        wants_keep_alive(self.version, &self.headers)
    }
}

fn serialize_headers(headers: &Headers, out: &mut Vec<u8>) {
    for header in headers.iter() {
        out.extend_from_slice(header.name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(header.value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
}

fn wants_keep_alive(version: HttpVersion, headers: &Headers) -> bool {
    if headers.has_token("connection", "close") {
        return false;
    }
    match version {
        HttpVersion::Http11 => true,
        HttpVersion::Http10 => {
            headers.has_token("connection", "keep-alive")
                || headers.has_token("proxy-connection", "keep-alive")
        }
    }
}

/// Split a CONNECT authority (`host:port`) into its parts.
pub fn parse_authority(target: &str) -> Option<(String, u16)> {
    // Bracketed IPv6 literals keep their colons inside the brackets.
    if let Some(rest) = target.strip_prefix('[') {
        let (host, rest) = rest.split_once(']')?;
        let port = rest.strip_prefix(':')?.parse::<u16>().ok()?;
        return Some((host.to_string(), port));
    }
    let (host, port) = target.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    let port = port.parse::<u16>().ok()?;
    Some((host.to_string(), port))
}

/// Split an absolute-form `http://host[:port]/path` request target.
pub fn parse_absolute_form(target: &str) -> Option<(String, u16, String)> {
    let rest = target.strip_prefix("http://")?;
    let (authority, path) = match rest.find('/') {
        Some(index) => (&rest[..index], &rest[index..]),
        None => (rest, "/"),
    };
    if authority.is_empty() {
        return None;
    }
    let (host, port) = match parse_authority(authority) {
        Some(parts) => parts,
        None => (authority.to_string(), 80),
    };
    Some((host, port, path.to_string()))
}

/// Build a minimal error/status response with a plain-text body.
pub fn build_response(status_code: u16, reason: &str, body: &str) -> Vec<u8> {
    let mut head = ResponseHead {
        version: HttpVersion::Http11,
        status_code,
        reason_phrase: reason.to_string(),
        headers: Headers::new(),
        body_mode: BodyMode::ContentLength(body.len() as u64),
    };
    head.headers.push(Header::new("Connection", "close"));
    if !body.is_empty() {
        head.headers
            .push(Header::new("Content-Type", "text/plain"));
    }
    head.headers
        .push(Header::new("Content-Length", body.len().to_string()));
    let mut out = head.to_bytes();
    out.extend_from_slice(body.as_bytes());
    out
}
