mod parse;

pub use parse::{
    parse_authority, parse_chunk_size_line, parse_request_head, parse_response_head,
    request_body_mode, response_body_mode, HeadParseError,
};

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

/// How a message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyMode {
    None,
    ContentLength(u64),
    Chunked,
    CloseDelimited,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// Ordered header list. Lookups are case-insensitive, insertion order is
/// preserved on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<Header>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|header| header.name.eq_ignore_ascii_case(name))
            .map(|header| header.value.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |header| header.name.eq_ignore_ascii_case(name))
            .map(|header| header.value.as_str())
    }

    /// Replaces every value of `name` with a single entry.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.remove(name);
        self.append(name, value);
    }

    pub fn append(&mut self, name: &str, value: impl Into<String>) {
        self.entries.push(Header {
            name: name.to_string(),
            value: value.into(),
        });
    }

    pub fn remove(&mut self, name: &str) {
        self.entries
            .retain(|header| !header.name.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when any value of `name` contains `token` in its comma-separated
    /// list, compared case-insensitively.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|value| value.split(','))
            .any(|value| value.trim().eq_ignore_ascii_case(token))
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        for header in &self.entries {
            out.extend_from_slice(header.name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(header.value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(name, value)| Header { name, value })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    /// Raw request target exactly as received.
    pub target: String,
    /// Scheme from an absolute-form target; empty until the handler fixes it.
    pub scheme: String,
    /// `host[:port]` from the target (authority or absolute form). Empty for
    /// origin-form targets until populated from the `Host` header.
    pub host: String,
    /// Origin-form path and query. Empty for CONNECT.
    pub path: String,
    pub version: HttpVersion,
    pub headers: Headers,
    pub body_mode: BodyMode,
    pub connection_close: bool,
}

impl RequestHead {
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// Host with any `:port` suffix removed. Bracketed IPv6 literals lose
    /// their brackets: `[::1]:443` becomes `::1`.
    pub fn hostname(&self) -> &str {
        strip_port(&self.host)
    }

    pub fn port(&self) -> Option<u16> {
        port_of(&self.host)
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(self.method.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.target.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.version.as_str().as_bytes());
        out.extend_from_slice(b"\r\n");
        self.headers.write_to(&mut out);
        out.extend_from_slice(b"\r\n");
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub version: HttpVersion,
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body_mode: BodyMode,
    pub connection_close: bool,
    /// Trailer field names announced ahead of a chunked body.
    pub trailers: Vec<String>,
}

impl ResponseHead {
    pub fn new(status: u16) -> Self {
        Self {
            version: HttpVersion::Http11,
            status,
            reason: canonical_reason(status).to_string(),
            headers: Headers::new(),
            body_mode: BodyMode::None,
            connection_close: false,
            trailers: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status / 100 == 2
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(self.version.as_str().as_bytes());
        let reason = if self.reason.is_empty() {
            canonical_reason(self.status)
        } else {
            self.reason.as_str()
        };
        out.extend_from_slice(format!(" {:03} {}\r\n", self.status, reason).as_bytes());
        self.headers.write_to(&mut out);
        out.extend_from_slice(b"\r\n");
        out
    }
}

/// Returns the upgrade target when the header block asks for a protocol
/// switch: `Connection` must carry the `Upgrade` token and `Upgrade` names the
/// protocol.
pub fn upgrade_type(headers: &Headers) -> Option<String> {
    if !headers.has_token("Connection", "upgrade") {
        return None;
    }
    headers
        .get("Upgrade")
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

pub fn is_text_event_stream(headers: &Headers) -> bool {
    headers
        .get("Content-Type")
        .and_then(|value| value.split(';').next())
        .map(|value| value.trim().eq_ignore_ascii_case("text/event-stream"))
        .unwrap_or(false)
}

/// Zero-body statuses per RFC 7230 §3.3: 1xx, 204 and 304 never carry bodies.
pub fn status_has_no_body(status: u16) -> bool {
    (100..200).contains(&status) || status == 204 || status == 304
}

pub fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        if let Some(close) = rest.find(']') {
            return &rest[..close];
        }
        return host;
    }
    match host.rsplit_once(':') {
        // A second colon means an unbracketed IPv6 literal, not a port.
        Some((front, back)) if !front.contains(':') && back.chars().all(|c| c.is_ascii_digit()) => {
            front
        }
        _ => host,
    }
}

fn port_of(host: &str) -> Option<u16> {
    let suffix = if let Some(rest) = host.strip_prefix('[') {
        let close = rest.find(']')?;
        rest[close + 1..].strip_prefix(':')?
    } else {
        match host.rsplit_once(':') {
            Some((front, back)) if !front.contains(':') => back,
            _ => return None,
        }
    };
    suffix.parse::<u16>().ok()
}

pub fn canonical_reason(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "",
    }
}
