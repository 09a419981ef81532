//! The PAC `FindProxyForURL` return-value grammar.
//!
//! Semicolon-separated directives, each either `DIRECT` or
//! `<TYPE> <host>:<port>` with `<TYPE>` one of `PROXY`, `SOCKS`, `HTTP`,
//! `HTTPS`, `SOCKS4`. Unrecognized types are kept permissively as `DIRECT`;
//! empty input means `DIRECT`.

use std::fmt;

use snare_http::{parse_authority, HeadParseError};

use crate::hooks::{UpstreamProxy, UpstreamScheme};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacMode {
    Direct,
    Proxy,
    Socks,
    Http,
    Https,
    Socks4,
}

impl PacMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "DIRECT",
            Self::Proxy => "PROXY",
            Self::Socks => "SOCKS",
            Self::Http => "HTTP",
            Self::Https => "HTTPS",
            Self::Socks4 => "SOCKS4",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacDirective {
    pub mode: PacMode,
    pub host: String,
    pub port: u16,
}

impl PacDirective {
    pub const DIRECT: PacDirective = PacDirective {
        mode: PacMode::Direct,
        host: String::new(),
        port: 0,
    };

    /// Maps the directive onto the dispatcher's upstream selection. `DIRECT`
    /// selects no proxy. SOCKS4 survives as its own scheme so the dispatcher
    /// can reject it explicitly.
    pub fn to_upstream(&self) -> Option<UpstreamProxy> {
        let scheme = match self.mode {
            PacMode::Direct => return None,
            PacMode::Proxy | PacMode::Http => UpstreamScheme::Http,
            PacMode::Https => UpstreamScheme::Https,
            PacMode::Socks => UpstreamScheme::Socks5,
            PacMode::Socks4 => UpstreamScheme::Socks4,
        };
        Some(UpstreamProxy {
            scheme,
            host: self.host.clone(),
            port: self.port,
            username: None,
            password: None,
        })
    }
}

impl fmt::Display for PacDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mode {
            PacMode::Direct => f.write_str("DIRECT"),
            mode => write!(f, "{} {}:{}", mode.as_str(), self.host, self.port),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacParseError {
    pub position: usize,
    pub input: String,
    pub cause: HeadParseError,
}

impl fmt::Display for PacParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid proxy string at pos {} {:?}: {}",
            self.position, self.input, self.cause
        )
    }
}

impl std::error::Error for PacParseError {}

/// First directive of the list; empty input is `DIRECT`.
pub fn first(proxies: &str) -> Result<PacDirective, PacParseError> {
    if proxies.is_empty() {
        return Ok(PacDirective::DIRECT);
    }
    let spec = proxies.split(';').next().unwrap_or("");
    parse_directive(spec).map_err(|cause| PacParseError {
        position: 0,
        input: spec.to_string(),
        cause,
    })
}

/// Every directive of the list in order; empty input yields no directives.
pub fn all(proxies: &str) -> Result<Vec<PacDirective>, PacParseError> {
    if proxies.is_empty() {
        return Ok(Vec::new());
    }
    proxies
        .split(';')
        .enumerate()
        .map(|(position, spec)| {
            parse_directive(spec).map_err(|cause| PacParseError {
                position,
                input: spec.to_string(),
                cause,
            })
        })
        .collect()
}

fn parse_directive(spec: &str) -> Result<PacDirective, HeadParseError> {
    let spec = spec.trim();
    if spec.is_empty() || spec == "DIRECT" {
        return Ok(PacDirective::DIRECT);
    }

    let (mode_text, authority) = spec
        .split_once(' ')
        .ok_or(HeadParseError::MissingPort)?;
    let (host, port) = parse_authority(authority.trim())?;
    Ok(PacDirective {
        mode: parse_mode(mode_text),
        host,
        port,
    })
}

fn parse_mode(text: &str) -> PacMode {
    match text {
        "DIRECT" => PacMode::Direct,
        "PROXY" => PacMode::Proxy,
        "SOCKS" => PacMode::Socks,
        "HTTP" => PacMode::Http,
        "HTTPS" => PacMode::Https,
        "SOCKS4" => PacMode::Socks4,
        // Unknown directive types are remapped permissively.
        _ => PacMode::Direct,
    }
}
