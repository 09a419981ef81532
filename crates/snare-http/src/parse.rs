use std::error::Error as StdError;
use std::fmt;

use crate::{BodyMode, Header, Headers, HttpVersion, RequestHead, ResponseHead};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadParseError {
    InvalidUtf8,
    EmptyRequestLine,
    InvalidRequestLine,
    InvalidStatusLine,
    InvalidVersion,
    InvalidStatusCode,
    InvalidTarget,
    MalformedHeader,
    InvalidContentLength,
    ConflictingContentLength,
    InvalidAuthority,
    MissingPort,
    InvalidPort,
}

impl HeadParseError {
    pub fn code(self) -> &'static str {
        match self {
            Self::InvalidUtf8 => "invalid_utf8",
            Self::EmptyRequestLine => "empty_request_line",
            Self::InvalidRequestLine => "invalid_request_line",
            Self::InvalidStatusLine => "invalid_status_line",
            Self::InvalidVersion => "invalid_version",
            Self::InvalidStatusCode => "invalid_status_code",
            Self::InvalidTarget => "invalid_target",
            Self::MalformedHeader => "malformed_header",
            Self::InvalidContentLength => "invalid_content_length",
            Self::ConflictingContentLength => "conflicting_content_length",
            Self::InvalidAuthority => "invalid_authority",
            Self::MissingPort => "missing_port",
            Self::InvalidPort => "invalid_port",
        }
    }
}

impl fmt::Display for HeadParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl StdError for HeadParseError {}

/// Parses a request head (request line plus header block, including the
/// terminating empty line).
///
/// CONNECT requests never carry a framed body, so any declared
/// `Content-Length` is ignored for framing; the header itself is preserved.
pub fn parse_request_head(raw: &[u8]) -> Result<RequestHead, HeadParseError> {
    let text = std::str::from_utf8(raw).map_err(|_| HeadParseError::InvalidUtf8)?;
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or(HeadParseError::EmptyRequestLine)?;
    if request_line.is_empty() {
        return Err(HeadParseError::EmptyRequestLine);
    }

    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or(HeadParseError::EmptyRequestLine)?;
    let target = parts.next().ok_or(HeadParseError::InvalidRequestLine)?;
    let version_text = parts.next().ok_or(HeadParseError::InvalidRequestLine)?;
    if parts.next().is_some() {
        return Err(HeadParseError::InvalidRequestLine);
    }
    let version = parse_version(version_text)?;

    let headers = parse_header_lines(lines)?;

    let is_connect = method.eq_ignore_ascii_case("CONNECT");
    let (scheme, host, path) = split_target(target, is_connect)?;

    let body_mode = if is_connect {
        BodyMode::None
    } else {
        request_body_mode(&headers)?
    };
    let connection_close = is_connection_close(version, &headers);

    Ok(RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        scheme,
        host,
        path,
        version,
        headers,
        body_mode,
        connection_close,
    })
}

/// Parses a response head. The request method decides body framing: HEAD
/// responses never carry one.
pub fn parse_response_head(
    raw: &[u8],
    request_method: &str,
) -> Result<ResponseHead, HeadParseError> {
    let text = std::str::from_utf8(raw).map_err(|_| HeadParseError::InvalidUtf8)?;
    let mut lines = text.split("\r\n");
    let status_line = lines.next().ok_or(HeadParseError::InvalidStatusLine)?;

    let mut parts = status_line.splitn(3, ' ');
    let version_text = parts.next().ok_or(HeadParseError::InvalidStatusLine)?;
    let status_text = parts.next().ok_or(HeadParseError::InvalidStatusLine)?;
    let reason = parts.next().unwrap_or("").to_string();

    let version = parse_version(version_text)?;
    let status = status_text
        .parse::<u16>()
        .map_err(|_| HeadParseError::InvalidStatusCode)?;

    let headers = parse_header_lines(lines)?;
    let body_mode = response_body_mode(&headers, request_method, status)?;
    let mut connection_close = is_connection_close(version, &headers);
    if body_mode == BodyMode::CloseDelimited {
        connection_close = true;
    }

    let trailers = headers
        .get_all("Trailer")
        .flat_map(|value| value.split(','))
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect();

    Ok(ResponseHead {
        version,
        status,
        reason,
        headers,
        body_mode,
        connection_close,
        trailers,
    })
}

/// Splits `host:port` authority text, honoring bracketed IPv6 literals.
pub fn parse_authority(authority: &str) -> Result<(String, u16), HeadParseError> {
    if let Some(rest) = authority.strip_prefix('[') {
        let close = rest.find(']').ok_or(HeadParseError::InvalidAuthority)?;
        let host = &rest[..close];
        if host.is_empty() {
            return Err(HeadParseError::InvalidAuthority);
        }
        let suffix = rest[close + 1..]
            .strip_prefix(':')
            .ok_or(HeadParseError::MissingPort)?;
        if suffix.is_empty() {
            return Err(HeadParseError::MissingPort);
        }
        let port = suffix.parse::<u16>().map_err(|_| HeadParseError::InvalidPort)?;
        return Ok((host.to_string(), port));
    }

    let (host, port_text) = authority
        .rsplit_once(':')
        .ok_or(HeadParseError::MissingPort)?;
    if host.is_empty() || host.contains(':') {
        return Err(HeadParseError::InvalidAuthority);
    }
    if port_text.is_empty() {
        return Err(HeadParseError::MissingPort);
    }
    let port = port_text
        .parse::<u16>()
        .map_err(|_| HeadParseError::InvalidPort)?;
    Ok((host.to_string(), port))
}

/// Parses one `size[;extensions]\r\n` chunk header line, returning the chunk
/// size.
pub fn parse_chunk_size_line(line: &[u8]) -> Result<u64, HeadParseError> {
    let text = std::str::from_utf8(line).map_err(|_| HeadParseError::InvalidUtf8)?;
    let trimmed = text.trim();
    let size_text = trimmed.split(';').next().unwrap_or(trimmed).trim();
    u64::from_str_radix(size_text, 16).map_err(|_| HeadParseError::InvalidContentLength)
}

pub fn request_body_mode(headers: &Headers) -> Result<BodyMode, HeadParseError> {
    if headers.has_token("Transfer-Encoding", "chunked") {
        return Ok(BodyMode::Chunked);
    }
    match content_length(headers)? {
        Some(0) | None => Ok(BodyMode::None),
        Some(length) => Ok(BodyMode::ContentLength(length)),
    }
}

pub fn response_body_mode(
    headers: &Headers,
    request_method: &str,
    status: u16,
) -> Result<BodyMode, HeadParseError> {
    if request_method.eq_ignore_ascii_case("HEAD") || crate::status_has_no_body(status) {
        return Ok(BodyMode::None);
    }
    if headers.has_token("Transfer-Encoding", "chunked") {
        return Ok(BodyMode::Chunked);
    }
    match content_length(headers)? {
        Some(0) => Ok(BodyMode::None),
        Some(length) => Ok(BodyMode::ContentLength(length)),
        None => Ok(BodyMode::CloseDelimited),
    }
}

fn content_length(headers: &Headers) -> Result<Option<u64>, HeadParseError> {
    let mut seen: Option<u64> = None;
    for value in headers.get_all("Content-Length") {
        let parsed = value
            .trim()
            .parse::<u64>()
            .map_err(|_| HeadParseError::InvalidContentLength)?;
        match seen {
            Some(existing) if existing != parsed => {
                return Err(HeadParseError::ConflictingContentLength)
            }
            _ => seen = Some(parsed),
        }
    }
    Ok(seen)
}

fn parse_version(text: &str) -> Result<HttpVersion, HeadParseError> {
    match text {
        "HTTP/1.0" => Ok(HttpVersion::Http10),
        "HTTP/1.1" => Ok(HttpVersion::Http11),
        _ => Err(HeadParseError::InvalidVersion),
    }
}

fn parse_header_lines<'a>(
    lines: impl Iterator<Item = &'a str>,
) -> Result<Headers, HeadParseError> {
    let mut entries = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':').ok_or(HeadParseError::MalformedHeader)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(HeadParseError::MalformedHeader);
        }
        entries.push(Header {
            name: name.to_string(),
            value: value.trim().to_string(),
        });
    }
    Ok(entries
        .into_iter()
        .map(|header| (header.name, header.value))
        .collect())
}

fn split_target(
    target: &str,
    is_connect: bool,
) -> Result<(String, String, String), HeadParseError> {
    if is_connect {
        // Authority-form; validity of host:port is checked by the caller.
        return Ok((String::new(), target.to_string(), String::new()));
    }
    if target == "*" {
        return Ok((String::new(), String::new(), "*".to_string()));
    }
    if let Some(rest) = target
        .strip_prefix("http://")
        .map(|rest| ("http", rest))
        .or_else(|| target.strip_prefix("https://").map(|rest| ("https", rest)))
    {
        let (scheme, rest) = rest;
        if rest.is_empty() {
            return Err(HeadParseError::InvalidTarget);
        }
        let (host, path) = match rest.find('/') {
            Some(slash) => (&rest[..slash], &rest[slash..]),
            None => (rest, "/"),
        };
        if host.is_empty() {
            return Err(HeadParseError::InvalidTarget);
        }
        return Ok((scheme.to_string(), host.to_string(), path.to_string()));
    }
    if target.starts_with('/') {
        return Ok((String::new(), String::new(), target.to_string()));
    }
    Err(HeadParseError::InvalidTarget)
}

fn is_connection_close(version: HttpVersion, headers: &Headers) -> bool {
    if headers.has_token("Connection", "close") {
        return true;
    }
    version == HttpVersion::Http10 && !headers.has_token("Connection", "keep-alive")
}
