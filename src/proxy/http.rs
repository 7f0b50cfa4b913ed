/*!
HTTP/1.x head parsing and rewriting for the forwarding leg.

Heads are handled line by line: the request side yields a [`RequestHead`] that
can be resolved to a [`Target`] and re-emitted as an HTTP/1.0 upstream request,
the response side yields a [`ResponseHead`] carrying the verbatim header block
and the body length.
*/

use bytes::{Bytes, BytesMut};
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::cache::CacheKey;
use crate::connection::Connection;
use crate::{Error, Result};

/// Version spoken on every upstream request and synthesized reply.
pub const PROXY_VERSION: &str = "HTTP/1.0";

/// Upper bound on the size of a request or response head.
pub const MAX_HEAD_BYTES: usize = 64 * 1024;

const HOP_BY_HOP: [&str; 2] = ["connection", "proxy-connection"];

/// One header line: the parsed name/value plus the exact bytes received.
#[derive(Debug, Clone, PartialEq)]
pub struct HeaderField {
    pub name: String,
    pub value: String,
    raw: Bytes,
}

impl HeaderField {
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn is_hop_by_hop(&self) -> bool {
        HOP_BY_HOP
            .iter()
            .any(|h| self.name.eq_ignore_ascii_case(h))
    }
}

/// Ordered header lines with case-insensitive lookup. Duplicates are kept in order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaderSet {
    fields: Vec<HeaderField>,
}

impl HeaderSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(name))
            .map(|f| f.value.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.fields
            .iter()
            .filter(move |f| f.name.eq_ignore_ascii_case(name))
            .map(|f| f.value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HeaderField> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    fn push_line(&mut self, line: Bytes) {
        match parse_header_line(&line) {
            Some((name, value)) => self.fields.push(HeaderField {
                name,
                value,
                raw: line,
            }),
            None => debug!(line = %String::from_utf8_lossy(&line).trim_end(), "Skipping header line without a name"),
        }
    }
}

fn parse_header_line(line: &[u8]) -> Option<(String, String)> {
    let text = String::from_utf8_lossy(trim_eol(line));
    let (name, value) = text.split_once(':')?;
    let name = name.trim();
    if name.is_empty() || name.contains(char::is_whitespace) {
        return None;
    }
    Some((name.to_string(), value.trim().to_string()))
}

fn trim_eol(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn is_blank(line: &[u8]) -> bool {
    trim_eol(line).is_empty()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: String,
    pub target: String,
    pub version: String,
}

impl RequestLine {
    pub fn parse(line: &[u8]) -> Result<Self> {
        let text = String::from_utf8_lossy(trim_eol(line));
        let parts: Vec<&str> = text.split_ascii_whitespace().collect();
        let [method, target, version] = parts.as_slice() else {
            return Err(Error::malformed_request(format!(
                "expected `METHOD target VERSION`, got {:?}",
                text
            )));
        };
        if !version.starts_with("HTTP/") {
            return Err(Error::malformed_request(format!("bad version {:?}", version)));
        }
        Ok(Self {
            method: method.to_string(),
            target: target.to_string(),
            version: version.to_string(),
        })
    }

    /// Version forwarded upstream. Persistent connections are not implemented, so
    /// every 1.x client line is sent as HTTP/1.0.
    pub fn upstream_version(&self) -> &'static str {
        PROXY_VERSION
    }
}

/// Where a request is going.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: String,
    /// Path plus query, always starting with `/`.
    pub path: String,
}

impl Target {
    /// Authority as written in a `Host` header (port omitted when it is 80).
    pub fn authority(&self) -> String {
        if self.port == "80" {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(&self.host, &self.port, &self.path)
    }

    /// Host and port in the form `TcpStream::connect` accepts.
    pub fn socket_addr(&self) -> Option<(String, u16)> {
        let host = self
            .host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(&self.host);
        let port = self.port.parse().ok()?;
        Some((host.to_string(), port))
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}{}", self.host, self.port, self.path)
    }
}

/// Split an authority into host and port, defaulting the port to 80.
/// Bracketed IPv6 hosts keep their brackets.
pub fn parse_authority(authority: &str) -> Option<(String, String)> {
    static AUTHORITY_RE: OnceLock<Regex> = OnceLock::new();
    let re = AUTHORITY_RE.get_or_init(|| {
        Regex::new(r"^(?P<host>[^:\[\]/\s]+|\[[0-9A-Fa-f:.]+\])(?::(?P<port>\d{1,5}))?$")
            .expect("authority pattern is valid")
    });

    let captures = re.captures(authority.trim())?;
    let host = captures.name("host")?.as_str().to_ascii_lowercase();
    let port = match captures.name("port") {
        Some(port) => {
            let port: u16 = port.as_str().parse().ok()?;
            if port == 0 {
                return None;
            }
            port.to_string()
        }
        None => "80".to_string(),
    };
    Some((host, port))
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestHead {
    pub line: RequestLine,
    pub headers: HeaderSet,
}

impl RequestHead {
    /// Parse a request line followed by header lines; the blank sentinel is optional.
    pub fn parse(lines: &[Bytes]) -> Result<Self> {
        let (first, rest) = lines
            .split_first()
            .ok_or_else(|| Error::malformed_request("empty request"))?;
        let line = RequestLine::parse(first)?;

        let mut headers = HeaderSet::new();
        for raw in rest {
            if is_blank(raw) {
                break;
            }
            headers.push_line(raw.clone());
        }
        Ok(Self { line, headers })
    }

    pub fn method(&self) -> &str {
        &self.line.method
    }

    pub fn is_get(&self) -> bool {
        self.line.method.eq_ignore_ascii_case("GET")
    }

    pub fn is_head(&self) -> bool {
        self.line.method.eq_ignore_ascii_case("HEAD")
    }

    /// Resolve the origin from an absolute-form target, falling back to `Host`
    /// for origin-form targets.
    pub fn target(&self) -> Option<Target> {
        let target = self.line.target.as_str();
        if target.starts_with('/') {
            let (host, port) = parse_authority(self.headers.get("Host")?)?;
            return Some(Target {
                host,
                port,
                path: target.to_string(),
            });
        }

        let (scheme, after_scheme) = target.split_once("://")?;
        if !scheme.eq_ignore_ascii_case("http") {
            return None;
        }
        let url = url::Url::parse(target).ok()?;
        let host = url.host_str()?.to_ascii_lowercase();
        let port = url.port_or_known_default()?.to_string();

        // Raw path and query as the client wrote them, never re-encoded.
        let rest = match after_scheme.find(|c| matches!(c, '/' | '?' | '#')) {
            Some(end) => &after_scheme[end..],
            None => "",
        };
        let rest = rest.split_once('#').map_or(rest, |(before, _)| before);
        let path = if rest.starts_with('/') {
            rest.to_string()
        } else {
            format!("/{}", rest)
        };
        Some(Target { host, port, path })
    }

    /// Length of the request body the client will send after the head.
    pub fn body_length(&self) -> Result<u64> {
        if self.headers.contains("Transfer-Encoding") {
            return Err(Error::malformed_request(
                "Transfer-Encoding on requests is not supported",
            ));
        }
        Ok(declared_length(&self.headers, Error::MalformedRequest)?.unwrap_or(0))
    }

    /// Serialize the request sent to the origin: origin-form target, HTTP/1.0,
    /// the fixed `User-Agent`, client headers minus hop-by-hop ones, then the
    /// forced `Connection`/`Proxy-Connection` pair.
    pub fn to_upstream(&self, target: &Target, user_agent: &str) -> Bytes {
        let mut out = BytesMut::with_capacity(512);
        out.extend_from_slice(
            format!(
                "{} {} {}\r\n",
                self.line.method,
                target.path,
                self.line.upstream_version()
            )
            .as_bytes(),
        );
        out.extend_from_slice(format!("User-Agent: {}\r\n", user_agent).as_bytes());
        if !self.headers.contains("Host") {
            out.extend_from_slice(format!("Host: {}\r\n", target.authority()).as_bytes());
        }
        for field in self.headers.iter().filter(|f| !f.is_hop_by_hop()) {
            out.extend_from_slice(field.raw());
            if !field.raw().ends_with(b"\n") {
                out.extend_from_slice(b"\r\n");
            }
        }
        out.extend_from_slice(b"Connection: close\r\n");
        out.extend_from_slice(b"Proxy-Connection: close\r\n");
        out.extend_from_slice(b"\r\n");
        out.freeze()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseHead {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: HeaderSet,
    /// Body length announced by the origin.
    pub content_length: u64,
    /// Status line, headers and blank line exactly as received.
    pub raw: Bytes,
}

impl ResponseHead {
    pub fn parse(lines: &[Bytes]) -> Result<Self> {
        let (first, rest) = lines
            .split_first()
            .ok_or_else(|| Error::malformed_response("empty response"))?;

        let status_line = String::from_utf8_lossy(trim_eol(first)).into_owned();
        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        if !version.starts_with("HTTP/") {
            return Err(Error::malformed_response(format!(
                "bad status line {:?}",
                status_line
            )));
        }
        let status: u16 = parts
            .next()
            .and_then(|code| code.trim().parse().ok())
            .filter(|code| (100..1000).contains(code))
            .ok_or_else(|| {
                Error::malformed_response(format!("bad status code in {:?}", status_line))
            })?;
        let reason = parts.next().unwrap_or_default().trim().to_string();

        let mut headers = HeaderSet::new();
        let mut raw = BytesMut::new();
        raw.extend_from_slice(first);
        for line in rest {
            raw.extend_from_slice(line);
            if is_blank(line) {
                break;
            }
            headers.push_line(line.clone());
        }

        let content_length = content_length(&headers, status)?;
        Ok(Self {
            version: version.to_string(),
            status,
            reason,
            headers,
            content_length,
            raw: raw.freeze(),
        })
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("Content-Type")
    }
}

fn content_length(headers: &HeaderSet, status: u16) -> Result<u64> {
    match declared_length(headers, Error::MalformedResponse)? {
        Some(length) => Ok(length),
        None if status_has_no_body(status) => Ok(0),
        None => Err(Error::malformed_response("missing Content-Length")),
    }
}

/// The `Content-Length` value, if any. Repeated headers must agree.
fn declared_length(headers: &HeaderSet, malformed: fn(String) -> Error) -> Result<Option<u64>> {
    let mut lengths = headers.get_all("Content-Length").map(|v| {
        v.parse::<u64>()
            .map_err(|_| malformed(format!("bad Content-Length {:?}", v)))
    });
    let Some(first) = lengths.next() else {
        return Ok(None);
    };
    let first = first?;
    for other in lengths {
        if other? != first {
            return Err(malformed("conflicting Content-Length headers".to_string()));
        }
    }
    Ok(Some(first))
}

fn status_has_no_body(status: u16) -> bool {
    (100..200).contains(&status) || status == 204 || status == 304
}

/// Read a request head from the client leg.
pub async fn read_request_head<S>(conn: &mut Connection<S>) -> Result<Vec<Bytes>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    read_head(conn, Error::MalformedRequest).await
}

/// Read a response head from the upstream leg.
pub async fn read_response_head<S>(conn: &mut Connection<S>) -> Result<Vec<Bytes>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    read_head(conn, Error::MalformedResponse).await
}

/// Read lines up to and including the blank sentinel.
async fn read_head<S>(conn: &mut Connection<S>, malformed: fn(String) -> Error) -> Result<Vec<Bytes>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut lines = Vec::new();
    let mut total = 0;
    loop {
        let line = conn.read_line().await?;
        total += line.len();
        if total > MAX_HEAD_BYTES {
            return Err(malformed(format!("head exceeds {} bytes", MAX_HEAD_BYTES)));
        }
        let done = is_blank(&line);
        // Tolerate stray blank lines before the start line.
        if done && lines.is_empty() {
            continue;
        }
        lines.push(line);
        if done {
            return Ok(lines);
        }
    }
}

/// Head for a body served from the cache.
pub fn cached_response_head(content_type: Option<&str>, len: usize) -> Bytes {
    let mut head = format!("{} 200 OK\r\n", PROXY_VERSION);
    if let Some(content_type) = content_type {
        head.push_str(&format!("Content-Type: {}\r\n", content_type));
    }
    head.push_str(&format!("Content-Length: {}\r\n\r\n", len));
    Bytes::from(head)
}

/// Build the HTML error reply sent when no origin response can be relayed.
pub fn format_error(code: u16, short: &str, long: &str, cause: &str) -> Bytes {
    let body = format!(
        "<html><title>Tiny Error</title><body bgcolor=\"ffffff\">\r\n\
         {code}: {short}\r\n\
         <p>{long}: {cause}\r\n\
         <hr><em>The Tiny Web proxy</em>\r\n"
    );

    let response = format!(
        "{PROXY_VERSION} {code} {short}\r\n\
         Content-type: text/html\r\n\
         Content-length: {}\r\n\
         \r\n\
         {body}",
        body.len()
    );
    Bytes::from(response)
}
