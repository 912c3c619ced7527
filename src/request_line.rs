// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Request-line parsing and absolute-URI to origin-form rewriting.
//!
//! Request lines come straight off the client socket, so every scan here is
//! bounds-checked and works on the first line of the buffer only.

use bytes::BytesMut;
use std::fmt;

use crate::error::{ProxyError, Result};

const HTTP_PREFIX: &[u8] = b"http://";
const HTTPS_PREFIX: &[u8] = b"https://";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// Destination extracted from one request line.
///
/// `port` is 0 when the authority carried a port that is not a valid TCP
/// port; the connector reports that as a connection failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetDescriptor {
    pub method: String,
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl TargetDescriptor {
    pub fn is_connect(&self) -> bool {
        self.method == "CONNECT"
    }

    pub fn is_tls(&self) -> bool {
        self.scheme == Scheme::Https
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for TargetDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}://{}{}",
            self.method,
            self.scheme.as_str(),
            self.authority(),
            self.path
        )
    }
}

/// Length of the first line, excluding its terminator.
fn first_line_len(buf: &[u8]) -> usize {
    buf.iter()
        .position(|&b| b == b'\r' || b == b'\n')
        .unwrap_or(buf.len())
}

fn ascii_string(bytes: &[u8]) -> Result<String> {
    if !bytes.is_ascii() {
        return Err(ProxyError::MalformedHeader);
    }
    String::from_utf8(bytes.to_vec()).map_err(|_| ProxyError::MalformedHeader)
}

/// Decimal port in the style of `atoi`: leading digits only.
fn parse_port(digits: &[u8]) -> u16 {
    let mut value: u32 = 0;
    for &b in digits.iter().take_while(|b| b.is_ascii_digit()) {
        value = value.saturating_mul(10).saturating_add(u32::from(b - b'0'));
    }
    u16::try_from(value).unwrap_or(0)
}

/// Parse `METHOD SP target SP HTTP/version` into a [`TargetDescriptor`].
pub fn parse(request: &[u8]) -> Result<TargetDescriptor> {
    let line = &request[..first_line_len(request)];

    let first_space = line
        .iter()
        .position(|&b| b == b' ')
        .ok_or(ProxyError::MalformedHeader)?;
    let target_start = first_space + 1;
    let second_space = line[target_start..]
        .iter()
        .position(|&b| b == b' ')
        .map(|p| target_start + p)
        .ok_or(ProxyError::MalformedHeader)?;

    if first_space == 0 || second_space == target_start {
        return Err(ProxyError::MalformedHeader);
    }

    let method = ascii_string(&line[..first_space])?;
    let target = &line[target_start..second_space];

    let (scheme, rest) = if let Some(rest) = target.strip_prefix(HTTP_PREFIX) {
        (Scheme::Http, rest)
    } else if let Some(rest) = target.strip_prefix(HTTPS_PREFIX) {
        (Scheme::Https, rest)
    } else if method == "CONNECT" {
        (Scheme::Https, target)
    } else {
        return Err(ProxyError::UnknownProtocol);
    };

    let (host, mut cursor) = if rest.first() == Some(&b'[') {
        // IPv6 literal: the host runs to the closing bracket.
        let close = rest
            .iter()
            .position(|&b| b == b']')
            .ok_or(ProxyError::MalformedHeader)?;
        (&rest[1..close], close + 1)
    } else {
        let end = rest
            .iter()
            .position(|&b| matches!(b, b':' | b'/' | b'?'))
            .unwrap_or(rest.len());
        (&rest[..end], end)
    };

    let mut port = scheme.default_port();
    if rest.get(cursor) == Some(&b':') {
        cursor += 1;
        port = parse_port(&rest[cursor..]);
        cursor += rest[cursor..]
            .iter()
            .position(|&b| b == b'/' || b == b'?')
            .unwrap_or(rest.len() - cursor);
    }

    let path = match &rest[cursor..] {
        [] => "/".to_string(),
        tail @ [b'/', ..] => ascii_string(tail)?,
        tail => format!("/{}", ascii_string(tail)?),
    };

    Ok(TargetDescriptor {
        method,
        scheme,
        host: ascii_string(host)?,
        port,
        path,
    })
}

/// Offset where the request target starts and the scheme prefix length, if
/// the target of the first line is an absolute `http://` or `https://` URI.
fn absolute_target(buf: &[u8]) -> Option<(usize, usize)> {
    let line = &buf[..first_line_len(buf)];
    let start = line.iter().position(|&b| b == b' ')? + 1;
    let target = &line[start..];
    [HTTP_PREFIX, HTTPS_PREFIX]
        .into_iter()
        .find(|prefix| target.starts_with(prefix))
        .map(|prefix| (start, prefix.len()))
}

/// True when the request target is in absolute form and needs rewriting
/// before it is forwarded.
pub fn is_absolute_form(buf: &[u8]) -> bool {
    absolute_target(buf).is_some()
}

/// Rewrite the absolute-URI request line at the start of `buf` into
/// origin-form, in place.
///
/// `GET http://host:8080/a?b HTTP/1.1` becomes `GET /a?b HTTP/1.1`. Only a
/// target that itself starts with the scheme is rewritten; a scheme found
/// later in the line (a query parameter, say) is left alone. The tail of the
/// buffer (headers, body) is shifted down and the buffer truncated, so
/// offsets past the request target are invalidated.
pub fn rewrite_to_origin_form(buf: &mut BytesMut) -> Result<()> {
    let (prefix_start, prefix_len) = absolute_target(buf).ok_or(ProxyError::NoProtocolFound)?;
    let host_start = prefix_start + prefix_len;
    let line_len = first_line_len(buf);

    let stop = buf[host_start..line_len]
        .iter()
        .position(|&b| matches!(b, b'/' | b' ' | b'?'))
        .map(|p| host_start + p)
        .unwrap_or(line_len);

    let len = buf.len();
    let (write_at, removed) = if buf.get(stop) == Some(&b'/') {
        (prefix_start, stop - prefix_start)
    } else {
        // No path: the origin-form target is "/" plus whatever followed.
        buf[prefix_start] = b'/';
        (prefix_start + 1, stop - prefix_start - 1)
    };

    buf.copy_within(stop..len, write_at);
    buf.truncate(len - removed);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("GET http://h:8080/path HTTP/1.1", "GET", Scheme::Http, "h", 8080, "/path")]
    #[case("GET http://example.com/ HTTP/1.1", "GET", Scheme::Http, "example.com", 80, "/")]
    #[case("GET http://example.com HTTP/1.1", "GET", Scheme::Http, "example.com", 80, "/")]
    #[case("POST https://api.test/v1?x=1 HTTP/1.1", "POST", Scheme::Https, "api.test", 443, "/v1?x=1")]
    #[case("GET https://api.test:8443 HTTP/1.0", "GET", Scheme::Https, "api.test", 8443, "/")]
    #[case("CONNECT example.com:8443 HTTP/1.1", "CONNECT", Scheme::Https, "example.com", 8443, "/")]
    #[case("CONNECT example.com HTTP/1.1", "CONNECT", Scheme::Https, "example.com", 443, "/")]
    #[case("GET http://[::1]:3000/x HTTP/1.1", "GET", Scheme::Http, "::1", 3000, "/x")]
    #[case("GET http://h?q=1 HTTP/1.1", "GET", Scheme::Http, "h", 80, "/?q=1")]
    fn parse_cases(
        #[case] line: &str,
        #[case] method: &str,
        #[case] scheme: Scheme,
        #[case] host: &str,
        #[case] port: u16,
        #[case] path: &str,
    ) {
        let t = parse(line.as_bytes()).expect("parse");
        assert_eq!(t.method, method);
        assert_eq!(t.scheme, scheme);
        assert_eq!(t.host, host);
        assert_eq!(t.port, port);
        assert_eq!(t.path, path);
    }

    #[test]
    fn parse_only_reads_first_line() {
        let req = b"GET http://a.test/x HTTP/1.1\r\nReferer: http://b.test/ y\r\n\r\n";
        let t = parse(req).expect("parse");
        assert_eq!(t.host, "a.test");
        assert_eq!(t.path, "/x");
    }

    #[rstest]
    #[case("GET")]
    #[case("GET http://h/")]
    #[case(" http://h/ HTTP/1.1")]
    #[case("GET  HTTP/1.1")]
    #[case("")]
    fn parse_malformed(#[case] line: &str) {
        assert!(matches!(
            parse(line.as_bytes()),
            Err(ProxyError::MalformedHeader)
        ));
    }

    #[rstest]
    #[case("GET ftp://h/ HTTP/1.1")]
    #[case("GET /index.html HTTP/1.1")]
    #[case("connect example.com:443 HTTP/1.1")]
    fn parse_unknown_protocol(#[case] line: &str) {
        assert!(matches!(
            parse(line.as_bytes()),
            Err(ProxyError::UnknownProtocol)
        ));
    }

    #[test]
    fn empty_host_is_accepted_syntactically() {
        let t = parse(b"GET http:///x HTTP/1.1").expect("parse");
        assert_eq!(t.host, "");
        assert_eq!(t.path, "/x");
    }

    #[test]
    fn out_of_range_port_becomes_zero() {
        let t = parse(b"GET http://h:70000/ HTTP/1.1").expect("parse");
        assert_eq!(t.port, 0);
        let t = parse(b"CONNECT h:abc HTTP/1.1").expect("parse");
        assert_eq!(t.port, 0);
    }

    #[test]
    fn authority_brackets_ipv6() {
        let t = parse(b"GET http://[::1]:81/ HTTP/1.1").expect("parse");
        assert_eq!(t.authority(), "[::1]:81");
        assert_eq!(t.to_string(), "GET http://[::1]:81/");
    }

    #[rstest]
    #[case(
        "GET http://host/a/b?x=1 HTTP/1.1\r\nHost: host\r\n\r\n",
        "GET /a/b?x=1 HTTP/1.1\r\nHost: host\r\n\r\n"
    )]
    #[case(
        "GET https://host:8443/ HTTP/1.1\r\n\r\n",
        "GET / HTTP/1.1\r\n\r\n"
    )]
    #[case("GET http://host HTTP/1.1\r\n\r\n", "GET / HTTP/1.1\r\n\r\n")]
    #[case("GET http://host?q HTTP/1.1\r\n\r\n", "GET /?q HTTP/1.1\r\n\r\n")]
    #[case(
        "GET https://a.test/x?u=http://b.test/y HTTP/1.1\r\n\r\n",
        "GET /x?u=http://b.test/y HTTP/1.1\r\n\r\n"
    )]
    #[case(
        "GET http://a.test/r?to=https://b.test/z HTTP/1.1\r\n\r\n",
        "GET /r?to=https://b.test/z HTTP/1.1\r\n\r\n"
    )]
    fn rewrite_cases(#[case] input: &str, #[case] expected: &str) {
        let mut buf = BytesMut::from(input);
        rewrite_to_origin_form(&mut buf).expect("rewrite");
        assert_eq!(&buf[..], expected.as_bytes());
    }

    #[test]
    fn rewrite_keeps_body_bytes() {
        let mut buf = BytesMut::from(&b"POST http://h/p HTTP/1.1\r\nContent-Length: 3\r\n\r\n\x00\x01\x02"[..]);
        rewrite_to_origin_form(&mut buf).expect("rewrite");
        assert!(buf.starts_with(b"POST /p HTTP/1.1\r\n"));
        assert!(buf.ends_with(b"\r\n\r\n\x00\x01\x02"));
    }

    #[test]
    fn rewrite_without_absolute_uri_fails() {
        let mut buf = BytesMut::from("GET /a HTTP/1.1\r\nReferer: http://x/\r\n\r\n");
        let before = buf.clone();
        assert!(matches!(
            rewrite_to_origin_form(&mut buf),
            Err(ProxyError::NoProtocolFound)
        ));
        assert_eq!(buf, before);
    }

    #[rstest]
    #[case("GET /login?next=http://b.test/home HTTP/1.1\r\n\r\n")]
    #[case("GET /r?to=https://b.test/ HTTP/1.1\r\n\r\n")]
    #[case("CONNECT a.test:443 HTTP/1.1\r\n\r\n")]
    fn origin_form_targets_are_not_rewritten(#[case] input: &str) {
        let mut buf = BytesMut::from(input);
        assert!(!is_absolute_form(&buf));
        assert!(matches!(
            rewrite_to_origin_form(&mut buf),
            Err(ProxyError::NoProtocolFound)
        ));
        assert_eq!(&buf[..], input.as_bytes());
    }

    #[test]
    fn absolute_form_is_detected_on_the_target_only() {
        assert!(is_absolute_form(b"GET http://a.test/ HTTP/1.1\r\n\r\n"));
        assert!(is_absolute_form(b"POST https://a.test HTTP/1.1\r\n\r\n"));
        assert!(!is_absolute_form(b"GET / HTTP/1.1\r\nReferer: http://a.test/\r\n\r\n"));
    }
}
