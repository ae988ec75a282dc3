use thiserror::Error;

use crate::{BodyMode, Header, Headers, HttpVersion, ParseLimits, RequestHead, ResponseHead};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("request line exceeds configured limit")]
    RequestLineTooLong,
    #[error("header block exceeds configured limit")]
    HeadTooLarge,
    #[error("header value exceeds configured limit")]
    HeaderValueTooLong,
    #[error("malformed request line")]
    MalformedRequestLine,
    #[error("malformed status line")]
    MalformedStatusLine,
    #[error("malformed header line")]
    MalformedHeader,
    #[error("unsupported HTTP version")]
    UnsupportedVersion,
    #[error("message carries both Content-Length and chunked framing")]
    ConflictingFraming,
    #[error("invalid Content-Length value")]
    InvalidContentLength,
}

/// Parse a complete request head (request line + headers, with or without
/// the terminating blank line).
pub fn parse_request_head(raw: &[u8], limits: ParseLimits) -> Result<RequestHead, ParseError> {
    let mut lines = split_head_lines(raw);
    let request_line = lines.next().ok_or(ParseError::MalformedRequestLine)?;
    if request_line.len() > limits.max_request_line {
        return Err(ParseError::RequestLineTooLong);
    }

    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or(ParseError::MalformedRequestLine)?;
    let target = parts.next().ok_or(ParseError::MalformedRequestLine)?;
    let version_text = parts.next().ok_or(ParseError::MalformedRequestLine)?;
    if parts.next().is_some() {
        return Err(ParseError::MalformedRequestLine);
    }
    let version = parse_version(version_text)?;

    let headers = parse_header_lines(lines, limits)?;
    let body_mode = request_body_mode(&headers)?;

    Ok(RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        version,
        headers,
        body_mode,
    })
}

/// Parse a complete response head. The request method decides whether the
/// response may carry a body at all (HEAD never does).
pub fn parse_response_head(
    raw: &[u8],
    request_method: &str,
    limits: ParseLimits,
) -> Result<ResponseHead, ParseError> {
    let mut lines = split_head_lines(raw);
    let status_line = lines.next().ok_or(ParseError::MalformedStatusLine)?;

    let mut parts = status_line.splitn(3, ' ');
    let version_text = parts.next().ok_or(ParseError::MalformedStatusLine)?;
    let status_text = parts.next().ok_or(ParseError::MalformedStatusLine)?;
    let reason_phrase = parts.next().unwrap_or("").trim().to_string();
    let version = parse_version(version_text)?;
    let status_code = status_text
        .parse::<u16>()
        .map_err(|_| ParseError::MalformedStatusLine)?;

    let headers = parse_header_lines(lines, limits)?;
    let body_mode = response_body_mode(&headers, request_method, status_code)?;

    Ok(ResponseHead {
        version,
        status_code,
        reason_phrase,
        headers,
        body_mode,
    })
}

/// Lines of the head, tolerating LF-only terminators and stopping at the
/// blank line.
fn split_head_lines(raw: &[u8]) -> impl Iterator<Item = &str> {
    raw.split(|byte| *byte == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
        .take_while(|line| !line.is_empty())
        .filter_map(|line| std::str::from_utf8(line).ok())
}

fn parse_version(text: &str) -> Result<HttpVersion, ParseError> {
    match text {
        "HTTP/1.0" => Ok(HttpVersion::Http10),
        "HTTP/1.1" => Ok(HttpVersion::Http11),
        _ => Err(ParseError::UnsupportedVersion),
    }
}

fn parse_header_lines<'a>(
    lines: impl Iterator<Item = &'a str>,
    limits: ParseLimits,
) -> Result<Headers, ParseError> {
    let mut headers = Headers::new();
    let mut current: Option<Header> = None;

    for line in lines {
        if line.starts_with(' ') || line.starts_with('\t') {
            // obs-fold: the line continues the previous header value,
            // joined with a single space.
            let header = current.as_mut().ok_or(ParseError::MalformedHeader)?;
            header.value.push(' ');
            header.value.push_str(line.trim());
            if header.value.len() > limits.max_header_value {
                return Err(ParseError::HeaderValueTooLong);
            }
            continue;
        }

        if let Some(done) = current.take() {
            headers.push(done);
        }
        let (name, value) = line.split_once(':').ok_or(ParseError::MalformedHeader)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(ParseError::MalformedHeader);
        }
        let value = value.trim().to_string();
        if value.len() > limits.max_header_value {
            return Err(ParseError::HeaderValueTooLong);
        }
        current = Some(Header::new(name, value));
    }
    if let Some(done) = current.take() {
        headers.push(done);
    }
    Ok(headers)
}

fn request_body_mode(headers: &Headers) -> Result<BodyMode, ParseError> {
    let chunked = headers.has_token("transfer-encoding", "chunked");
    let content_length = content_length_of(headers)?;
    if chunked && content_length.is_some() {
        return Err(ParseError::ConflictingFraming);
    }
    if chunked {
        return Ok(BodyMode::Chunked);
    }
    Ok(match content_length {
        Some(0) | None => BodyMode::None,
        Some(length) => BodyMode::ContentLength(length),
    })
}

fn response_body_mode(
    headers: &Headers,
    request_method: &str,
    status_code: u16,
) -> Result<BodyMode, ParseError> {
    let chunked = headers.has_token("transfer-encoding", "chunked");
    let content_length = content_length_of(headers)?;
    if chunked && content_length.is_some() {
        return Err(ParseError::ConflictingFraming);
    }

    if request_method.eq_ignore_ascii_case("HEAD")
        || (100..200).contains(&status_code)
        || status_code == 204
        || status_code == 304
    {
        return Ok(BodyMode::None);
    }
    if chunked {
        return Ok(BodyMode::Chunked);
    }
    Ok(match content_length {
        Some(0) => BodyMode::None,
        Some(length) => BodyMode::ContentLength(length),
        None => BodyMode::CloseDelimited,
    })
}

fn content_length_of(headers: &Headers) -> Result<Option<u64>, ParseError> {
    let mut value: Option<u64> = None;
    for header in headers.iter() {
        if !header.name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        let parsed = header
            .value
            .trim()
            .parse::<u64>()
            .map_err(|_| ParseError::InvalidContentLength)?;
        match value {
            Some(existing) if existing != parsed => {
                return Err(ParseError::InvalidContentLength);
            }
            _ => value = Some(parsed),
        }
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> ParseLimits {
        ParseLimits::default()
    }

    #[test]
    fn parses_request_line_and_ordered_headers() {
        let raw = b"GET http://example.test/hello HTTP/1.1\r\nHost: example.test\r\nAccept: */*\r\n\r\n";
        let head = parse_request_head(raw, limits()).expect("parse");
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "http://example.test/hello");
        assert_eq!(head.version, HttpVersion::Http11);
        assert_eq!(head.headers.first("host"), Some("example.test"));
        assert_eq!(head.body_mode, BodyMode::None);
    }

    #[test]
    fn tolerates_lf_only_line_endings() {
        let raw = b"GET / HTTP/1.1\nHost: a\n\n";
        let head = parse_request_head(raw, limits()).expect("parse");
        assert_eq!(head.headers.first("host"), Some("a"));
    }

    #[test]
    fn unfolds_obs_fold_with_single_space() {
        let raw = b"GET / HTTP/1.1\r\nX-Long: first\r\n second\t\r\nHost: a\r\n\r\n";
        let head = parse_request_head(raw, limits()).expect("parse");
        assert_eq!(head.headers.first("x-long"), Some("first second"));
        assert_eq!(head.headers.first("host"), Some("a"));
    }

    #[test]
    fn rejects_fold_without_preceding_header() {
        let raw = b"GET / HTTP/1.1\r\n folded\r\n\r\n";
        assert_eq!(
            parse_request_head(raw, limits()),
            Err(ParseError::MalformedHeader)
        );
    }

    #[test]
    fn chunked_wins_body_framing_for_requests() {
        let raw = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n";
        let head = parse_request_head(raw, limits()).expect("parse");
        assert_eq!(head.body_mode, BodyMode::Chunked);
    }

    #[test]
    fn rejects_content_length_combined_with_chunked() {
        let raw =
            b"POST / HTTP/1.1\r\nContent-Length: 5\r\nTransfer-Encoding: chunked\r\n\r\n";
        assert_eq!(
            parse_request_head(raw, limits()),
            Err(ParseError::ConflictingFraming)
        );
    }

    #[test]
    fn rejects_disagreeing_duplicate_content_length() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 5\r\nContent-Length: 6\r\n\r\n";
        assert_eq!(
            parse_request_head(raw, limits()),
            Err(ParseError::InvalidContentLength)
        );
    }

    #[test]
    fn rejects_invalid_content_length() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: five\r\n\r\n";
        assert_eq!(
            parse_request_head(raw, limits()),
            Err(ParseError::InvalidContentLength)
        );
    }

    #[test]
    fn header_value_over_limit_is_rejected() {
        let mut raw = b"GET / HTTP/1.1\r\nX-Big: ".to_vec();
        raw.extend(std::iter::repeat(b'v').take(limits().max_header_value + 1));
        raw.extend_from_slice(b"\r\n\r\n");
        assert_eq!(
            parse_request_head(&raw, limits()),
            Err(ParseError::HeaderValueTooLong)
        );
    }

    #[test]
    fn response_without_framing_is_close_delimited() {
        let raw = b"HTTP/1.1 200 OK\r\nServer: test\r\n\r\n";
        let head = parse_response_head(raw, "GET", limits()).expect("parse");
        assert_eq!(head.body_mode, BodyMode::CloseDelimited);
        assert!(!head.allows_keep_alive());
    }

    #[test]
    fn head_response_never_carries_a_body() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n";
        let head = parse_response_head(raw, "HEAD", limits()).expect("parse");
        assert_eq!(head.body_mode, BodyMode::None);
    }

    #[test]
    fn informational_and_no_content_statuses_have_no_body() {
        for status in ["101", "204", "304"] {
            let raw = format!("HTTP/1.1 {status} X\r\n\r\n");
            let head = parse_response_head(raw.as_bytes(), "GET", limits()).expect("parse");
            assert_eq!(head.body_mode, BodyMode::None, "status {status}");
        }
    }

    #[test]
    fn rejects_unsupported_version() {
        let raw = b"GET / HTTP/2.0\r\n\r\n";
        assert_eq!(
            parse_request_head(raw, limits()),
            Err(ParseError::UnsupportedVersion)
        );
    }

    #[test]
    fn status_line_reason_phrase_may_contain_spaces() {
        let raw = b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\n\r\n";
        let head = parse_response_head(raw, "GET", limits()).expect("parse");
        assert_eq!(head.status_code, 502);
        assert_eq!(head.reason_phrase, "Bad Gateway");
        assert_eq!(head.body_mode, BodyMode::None);
    }
}
