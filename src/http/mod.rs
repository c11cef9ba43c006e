//! HTTP/1.x message types and wire parsing.
//!
//! Hand-rolled parsing over byte buffers with typed errors; requests and
//! replies share the header-map representation. Only what the proxy core
//! needs: no content codings, no trailers.

pub mod date;

use bytes::{BufMut, BytesMut};

use crate::errors::HttpParseError;

pub const CRLF: &str = "\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    Trace,
    Connect,
}

impl Method {
    pub fn from_bytes(b: &[u8]) -> Option<Method> {
        Some(match b {
            b"GET" => Method::Get,
            b"HEAD" => Method::Head,
            b"POST" => Method::Post,
            b"PUT" => Method::Put,
            b"DELETE" => Method::Delete,
            b"OPTIONS" => Method::Options,
            b"TRACE" => Method::Trace,
            b"CONNECT" => Method::Connect,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Connect => "CONNECT",
        }
    }

    /// Only GET and HEAD responses are candidates for the cache.
    pub fn is_cachable(self) -> bool {
        matches!(self, Method::Get | Method::Head)
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    pub const HTTP10: Version = Version { major: 1, minor: 0 };
    pub const HTTP11: Version = Version { major: 1, minor: 1 };
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "HTTP/{}.{}", self.major, self.minor)
    }
}

/// Ordered, case-insensitive multimap of header fields.
#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    fields: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> HeaderMap {
        HeaderMap::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.fields
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn put(&mut self, name: &str, value: &str) {
        self.fields.push((name.to_string(), value.to_string()));
    }

    /// Removes every field with this name; reports whether any existed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.fields.len();
        self.fields.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        before != self.fields.len()
    }

    pub fn replace(&mut self, name: &str, value: &str) {
        self.remove(name);
        self.put(name, value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn content_length(&self) -> Result<Option<u64>, HttpParseError> {
        match self.get("Content-Length") {
            None => Ok(None),
            Some(v) => v
                .trim()
                .parse::<u64>()
                .map(Some)
                .map_err(|_| HttpParseError::InvalidContentLength),
        }
    }

    /// Whether a Cache-Control (or the named header's) directive list
    /// contains `directive`.
    pub fn cache_control_has(&self, directive: &str) -> bool {
        self.get_all("Cache-Control")
            .flat_map(|v| v.split(','))
            .any(|d| {
                let d = d.trim();
                let name = d.split('=').next().unwrap_or(d);
                name.eq_ignore_ascii_case(directive)
            })
    }

    /// `Cache-Control: max-age=N`, if present and well-formed.
    pub fn cache_control_max_age(&self) -> Option<i64> {
        self.get_all("Cache-Control")
            .flat_map(|v| v.split(','))
            .find_map(|d| {
                let d = d.trim();
                let (name, val) = d.split_once('=')?;
                if name.trim().eq_ignore_ascii_case("max-age") {
                    val.trim().trim_matches('"').parse::<i64>().ok()
                } else {
                    None
                }
            })
    }

    fn pack_into(&self, out: &mut BytesMut) {
        for (n, v) in &self.fields {
            out.put_slice(n.as_bytes());
            out.put_slice(b": ");
            out.put_slice(v.as_bytes());
            out.put_slice(CRLF.as_bytes());
        }
    }
}

/// Hop-by-hop fields never forwarded to the next hop.
const HOP_HEADERS: [&str; 7] = [
    "Connection",
    "Proxy-Connection",
    "Keep-Alive",
    "Proxy-Authenticate",
    "TE",
    "Trailer",
    "Upgrade",
];

pub fn strip_hop_headers(headers: &mut HeaderMap) {
    // drop whatever Connection itself names, then the fixed set
    let named: Vec<String> = headers
        .get_all("Connection")
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_string())
        .collect();
    for n in named {
        headers.remove(&n);
    }
    for h in HOP_HEADERS {
        headers.remove(h);
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub uri: String,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: BytesMut,
}

impl Request {
    pub fn new(method: Method, uri: &str) -> Request {
        Request {
            method,
            uri: uri.to_string(),
            version: Version::HTTP11,
            headers: HeaderMap::new(),
            body: BytesMut::new(),
        }
    }

    /// Serialize the request head; the body is the caller's business.
    pub fn pack(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(256);
        out.put_slice(
            format!("{} {} {}\r\n", self.method, self.uri, self.version).as_bytes(),
        );
        self.headers.pack_into(&mut out);
        out.put_slice(CRLF.as_bytes());
        out
    }
}

#[derive(Debug, Clone)]
pub struct Reply {
    pub version: Version,
    pub status: u16,
    pub reason: String,
    pub headers: HeaderMap,
}

impl Reply {
    pub fn new(status: u16, reason: &str) -> Reply {
        Reply {
            version: Version::HTTP11,
            status,
            reason: reason.to_string(),
            headers: HeaderMap::new(),
        }
    }

    pub fn pack(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(256);
        out.put_slice(
            format!("{} {} {}\r\n", self.version, self.status, self.reason).as_bytes(),
        );
        self.headers.pack_into(&mut out);
        out.put_slice(CRLF.as_bytes());
        out
    }
}

/// Destination of an absolute or authority-form request URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UriTarget {
    pub host: String,
    pub port: u16,
    pub path: String,
}

/// Split `http://host[:port]/path` (or `host:port` for CONNECT).
pub fn parse_uri_target(method: Method, uri: &str) -> Result<UriTarget, HttpParseError> {
    let invalid = || HttpParseError::InvalidUri(uri.to_string());

    if method == Method::Connect {
        let (host, port) = uri.rsplit_once(':').ok_or_else(invalid)?;
        let port: u16 = port.parse().map_err(|_| invalid())?;
        if host.is_empty() {
            return Err(invalid());
        }
        return Ok(UriTarget {
            host: host.to_string(),
            port,
            path: String::new(),
        });
    }

    let rest = uri
        .strip_prefix("http://")
        .or_else(|| uri.strip_prefix("HTTP://"))
        .ok_or_else(invalid)?;
    let (authority, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };
    if authority.is_empty() {
        return Err(invalid());
    }
    let (host, port) = match authority.rsplit_once(':') {
        Some((h, p)) => (h, p.parse::<u16>().map_err(|_| invalid())?),
        None => (authority, 80),
    };
    Ok(UriTarget {
        host: host.to_string(),
        port,
        path: path.to_string(),
    })
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

fn parse_version(tok: &str) -> Result<Version, HttpParseError> {
    let v = tok
        .strip_prefix("HTTP/")
        .ok_or(HttpParseError::InvalidRequestLine)?;
    let (maj, min) = v.split_once('.').ok_or(HttpParseError::InvalidRequestLine)?;
    let major: u8 = maj.parse().map_err(|_| HttpParseError::InvalidRequestLine)?;
    let minor: u8 = min.parse().map_err(|_| HttpParseError::InvalidRequestLine)?;
    if major != 1 || minor > 1 {
        return Err(HttpParseError::UnsupportedVersion(major, minor));
    }
    Ok(Version { major, minor })
}

fn parse_header_lines(block: &str) -> Result<HeaderMap, HttpParseError> {
    let mut headers = HeaderMap::new();
    for line in block.split("\r\n").filter(|l| !l.is_empty()) {
        if line.starts_with(' ') || line.starts_with('\t') {
            // obs-fold: not tolerated from either side
            return Err(HttpParseError::MalformedHeader);
        }
        let (name, value) = line.split_once(':').ok_or(HttpParseError::MalformedHeader)?;
        if name.is_empty() || name.contains(' ') {
            return Err(HttpParseError::MalformedHeader);
        }
        headers.put(name, value.trim());
    }
    Ok(headers)
}

/// A request head parsed off the wire; `consumed` bytes cover the head only.
#[derive(Debug)]
pub struct ParsedRequest {
    pub request: Request,
    pub consumed: usize,
}

/// Parse one request head out of `buf`.
///
/// Returns Ok(None) when more bytes are needed. A header block strictly
/// larger than `max_size` is a session-fatal parse error.
pub fn parse_request(
    buf: &[u8],
    max_size: usize,
) -> Result<Option<ParsedRequest>, HttpParseError> {
    let end = match find_header_end(buf) {
        Some(end) => {
            if end > max_size {
                return Err(HttpParseError::HeaderTooBig(max_size));
            }
            end
        }
        None => {
            if buf.len() > max_size {
                return Err(HttpParseError::HeaderTooBig(max_size));
            }
            return Ok(None);
        }
    };

    let head =
        std::str::from_utf8(&buf[..end - 4]).map_err(|_| HttpParseError::MalformedHeader)?;
    let (req_line, header_block) = head.split_once("\r\n").unwrap_or((head, ""));

    let mut parts = req_line.split(' ').filter(|p| !p.is_empty());
    let method = parts
        .next()
        .and_then(|m| Method::from_bytes(m.as_bytes()))
        .ok_or(HttpParseError::InvalidRequestLine)?;
    let uri = parts.next().ok_or(HttpParseError::InvalidRequestLine)?;
    let version = parse_version(parts.next().ok_or(HttpParseError::InvalidRequestLine)?)?;
    if parts.next().is_some() {
        return Err(HttpParseError::InvalidRequestLine);
    }

    let headers = parse_header_lines(header_block)?;
    if version == Version::HTTP11 && !headers.has("Host") {
        return Err(HttpParseError::MissingHost);
    }

    Ok(Some(ParsedRequest {
        request: Request {
            method,
            uri: uri.to_string(),
            version,
            headers,
            body: BytesMut::new(),
        },
        consumed: end,
    }))
}

/// Parse one reply head out of `buf`. Same more-data convention as
/// `parse_request`.
pub fn parse_reply(buf: &[u8], max_size: usize) -> Result<Option<(Reply, usize)>, HttpParseError> {
    let end = match find_header_end(buf) {
        Some(end) => {
            if end > max_size {
                return Err(HttpParseError::HeaderTooBig(max_size));
            }
            end
        }
        None => {
            if buf.len() > max_size {
                return Err(HttpParseError::HeaderTooBig(max_size));
            }
            return Ok(None);
        }
    };

    let head =
        std::str::from_utf8(&buf[..end - 4]).map_err(|_| HttpParseError::MalformedHeader)?;
    let (status_line, header_block) = head.split_once("\r\n").unwrap_or((head, ""));

    let mut parts = status_line.splitn(3, ' ');
    let version =
        parse_version(parts.next().ok_or(HttpParseError::InvalidStatusLine)?).map_err(|_| {
            HttpParseError::InvalidStatusLine
        })?;
    let status: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or(HttpParseError::InvalidStatusLine)?;
    let reason = parts.next().unwrap_or("").to_string();

    let headers = parse_header_lines(header_block)?;

    Ok(Some((
        Reply {
            version,
            status,
            reason,
            headers,
        },
        end,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_request() {
        let buf = b"GET http://origin/a HTTP/1.1\r\nHost: origin\r\nAccept: */*\r\n\r\n";
        let p = parse_request(buf, 4096).unwrap().unwrap();
        assert_eq!(p.request.method, Method::Get);
        assert_eq!(p.request.uri, "http://origin/a");
        assert_eq!(p.request.version, Version::HTTP11);
        assert_eq!(p.request.headers.get("host"), Some("origin"));
        assert_eq!(p.consumed, buf.len());
    }

    #[test]
    fn test_incomplete_request_wants_more() {
        let buf = b"GET / HTTP/1.1\r\nHost: a\r\n";
        assert!(parse_request(buf, 4096).unwrap().is_none());
    }

    #[test]
    fn test_missing_host_on_11_fails() {
        let buf = b"GET /a HTTP/1.1\r\n\r\n";
        assert!(matches!(
            parse_request(buf, 4096),
            Err(HttpParseError::MissingHost)
        ));
        // but 1.0 does not require it
        let buf = b"GET /a HTTP/1.0\r\n\r\n";
        assert!(parse_request(buf, 4096).unwrap().is_some());
    }

    #[test]
    fn test_header_size_boundary() {
        // a head of exactly max bytes parses; one more byte fails
        let mut head = String::from("GET /a HTTP/1.0\r\nX-Pad: ");
        let target = 512;
        while head.len() + 4 < target {
            head.push('p');
        }
        head.push_str("\r\n\r\n");
        assert_eq!(head.len(), target);
        assert!(parse_request(head.as_bytes(), target).unwrap().is_some());

        let mut bigger = String::from("GET /a HTTP/1.0\r\nX-Pad: p");
        while bigger.len() + 4 < target + 1 {
            bigger.push('p');
        }
        bigger.push_str("\r\n\r\n");
        assert_eq!(bigger.len(), target + 1);
        assert!(matches!(
            parse_request(bigger.as_bytes(), target),
            Err(HttpParseError::HeaderTooBig(_))
        ));
    }

    #[test]
    fn test_unterminated_oversize_fails() {
        let buf = vec![b'a'; 600];
        assert!(matches!(
            parse_request(&buf, 512),
            Err(HttpParseError::HeaderTooBig(_))
        ));
    }

    #[test]
    fn test_parse_reply_and_pack_roundtrip() {
        let buf = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nCache-Control: max-age=60\r\n\r\nhello";
        let (reply, consumed) = parse_reply(buf, 4096).unwrap().unwrap();
        assert_eq!(reply.status, 200);
        assert_eq!(reply.headers.content_length().unwrap(), Some(5));
        assert_eq!(reply.headers.cache_control_max_age(), Some(60));
        assert_eq!(consumed, buf.len() - 5);

        let packed = reply.pack();
        let (again, _) = parse_reply(&packed, 4096).unwrap().unwrap();
        assert_eq!(again.status, 200);
        assert_eq!(again.headers.get("content-length"), Some("5"));
    }

    #[test]
    fn test_uri_targets() {
        let t = parse_uri_target(Method::Get, "http://origin:8080/a/b").unwrap();
        assert_eq!(
            t,
            UriTarget {
                host: "origin".into(),
                port: 8080,
                path: "/a/b".into()
            }
        );
        let t = parse_uri_target(Method::Get, "http://origin").unwrap();
        assert_eq!(t.port, 80);
        assert_eq!(t.path, "/");
        let t = parse_uri_target(Method::Connect, "origin:443").unwrap();
        assert_eq!(t.port, 443);
        assert!(parse_uri_target(Method::Get, "ftp://x/").is_err());
    }

    #[test]
    fn test_hop_headers_stripped() {
        let mut h = HeaderMap::new();
        h.put("Connection", "keep-alive, X-Custom");
        h.put("X-Custom", "1");
        h.put("Keep-Alive", "30");
        h.put("Via", "1.0 other");
        strip_hop_headers(&mut h);
        assert!(!h.has("Connection"));
        assert!(!h.has("X-Custom"));
        assert!(!h.has("Keep-Alive"));
        assert!(h.has("Via"));
    }

    #[test]
    fn test_cache_control_private() {
        let mut h = HeaderMap::new();
        h.put("Cache-Control", "private, max-age=10");
        assert!(h.cache_control_has("private"));
        assert!(!h.cache_control_has("no-store"));
        assert_eq!(h.cache_control_max_age(), Some(10));
    }
}
