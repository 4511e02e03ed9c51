use crate::{
    errors::ErrorKind,
    http::types::{self, MethodKind, Version},
};
use memchr::{memchr, memmem};

/// Port reported when the `Host` header carries none.
pub(crate) const DEFAULT_PORT: &str = "80";

const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";
const FORM_MULTIPART: &str = "multipart/form-data";

/// Request view borrowed from the receive buffer.
///
/// Only the fields needed for routing and for building FastCGI parameters are
/// extracted, everything else in the header block is skipped.
///
/// # Input data requirements
///
/// #### General designations
/// - `SP`: ASCII space (0x20)
/// - `CRLF`: Carriage return + line feed (`"\r\n"`)
///
/// ## First line
/// ```text
/// [METHOD] SP [TARGET] SP [VERSION] CRLF
/// ```
/// Where:
/// - `[METHOD]`: `GET` or `POST`
/// - `[TARGET]`: absolute path, optionally followed by `?` and a query string
/// - `[VERSION]`: `HTTP/1.0` or `HTTP/1.1`
///
/// ## Header
/// ```text
/// [NAME]: [VALUE] CRLF
/// ```
///
/// | Header           | Required     | Purpose                                                      |
/// |------------------|--------------|--------------------------------------------------------------|
/// | `Host`           | always       | Virtual host lookup, at most one `:` separating the port     |
/// | `Content-Length` | `POST`       | Declared body size, decimal `u64`                            |
/// | `Content-Type`   | `POST`       | Must name url-encoded or multipart form data                 |
///
/// Names are matched case-insensitively, the first occurrence wins.
///
/// ## Body
///
/// For `POST`, the bytes following the blank line (at most `Content-Length`
/// of them) are exposed through [`body`](Self::body). The remainder may
/// arrive in later reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequest<'a> {
    method: MethodKind,
    url: &'a str,
    query: &'a str,
    version: Version,

    server: &'a str,
    host: &'a str,
    port: &'a str,

    content_type: &'a str,
    content_length: u64,
    is_root: bool,

    body: &'a [u8],
}

impl<'a> ParsedRequest<'a> {
    /// Returns the request kind.
    #[inline(always)]
    pub const fn method(&self) -> MethodKind {
        self.method
    }

    /// Returns the path without query string and without a trailing `/`
    /// (except for the root path itself).
    #[inline(always)]
    pub const fn url(&self) -> &'a str {
        self.url
    }

    /// Returns the query string, empty when absent.
    #[inline(always)]
    pub const fn query(&self) -> &'a str {
        self.query
    }

    #[inline(always)]
    pub const fn version(&self) -> Version {
        self.version
    }

    /// Returns the full `Host` header value, port included.
    #[inline(always)]
    pub const fn server(&self) -> &'a str {
        self.server
    }

    #[inline(always)]
    pub const fn host(&self) -> &'a str {
        self.host
    }

    #[inline(always)]
    pub const fn port(&self) -> &'a str {
        self.port
    }

    /// Returns the `Content-Type` value, empty for `GET`.
    #[inline(always)]
    pub const fn content_type(&self) -> &'a str {
        self.content_type
    }

    /// Returns the declared `Content-Length`, zero for `GET`.
    #[inline(always)]
    pub const fn content_length(&self) -> u64 {
        self.content_length
    }

    #[inline(always)]
    pub const fn is_root(&self) -> bool {
        self.is_root
    }

    /// Returns the body bytes present in this read, never more than declared.
    #[inline(always)]
    pub const fn body(&self) -> &'a [u8] {
        self.body
    }
}

impl<'a> ParsedRequest<'a> {
    /// Parses a header block terminated by an empty line.
    ///
    /// `header_limit` caps the header block length, `0` disables the check.
    pub(crate) fn parse(buf: &'a [u8], header_limit: usize) -> Result<Self, ErrorKind> {
        let boundary = memmem::find(buf, b"\r\n\r\n")
            .filter(|&i| i > 0)
            .ok_or(ErrorKind::InvalidHeader)?;

        if header_limit > 0 && boundary > header_limit {
            return Err(ErrorKind::HeaderTooLarge);
        }

        let head = simdutf8::basic::from_utf8(&buf[..boundary])
            .map_err(|_| ErrorKind::InvalidEncoding)?;

        let (first_line, fields) = match memchr(b'\r', head.as_bytes()) {
            Some(i) if head.as_bytes().get(i + 1) == Some(&b'\n') => (&head[..i], &head[i + 2..]),
            Some(_) => return Err(ErrorKind::InvalidHeader),
            None => (head, ""),
        };

        let mut request = Self::parse_first_line(first_line)?;
        let headers = Headers::parse(fields)?;

        if request.method != MethodKind::Get {
            request.parse_form(&headers, &buf[boundary + 4..])?;
        }

        let server = headers
            .host
            .filter(|value| !value.is_empty())
            .ok_or(ErrorKind::MissingHost)?;

        let (host, port) = match server.split_once(':') {
            None => (server, DEFAULT_PORT),
            Some((host, port)) if !port.contains(':') => (host, port),
            Some(_) => return Err(ErrorKind::InvalidHost),
        };

        request.server = server;
        request.host = host;
        request.port = port;

        Ok(request)
    }

    #[inline]
    fn parse_first_line(line: &'a str) -> Result<Self, ErrorKind> {
        let mut tokens = line.split(' ');

        let (Some(method), Some(target), Some(proto), None) =
            (tokens.next(), tokens.next(), tokens.next(), tokens.next())
        else {
            return Err(ErrorKind::InvalidHeader);
        };

        // POST is narrowed to a form kind once Content-Type is known
        let method = match method.as_bytes() {
            b"GET" => MethodKind::Get,
            b"POST" => MethodKind::Unknown,
            _ => return Err(ErrorKind::InvalidMethod),
        };

        if !target.starts_with('/') {
            return Err(ErrorKind::InvalidUrl);
        }

        let version = Version::from_bytes(proto.as_bytes())?;

        let (mut url, query) = target.split_once('?').unwrap_or((target, ""));

        let is_root = url == "/";
        if url.len() > 1 {
            url = url.strip_suffix('/').unwrap_or(url);
        }

        Ok(Self {
            method,
            url,
            query,
            version,

            server: "",
            host: "",
            port: "",

            content_type: "",
            content_length: 0,
            is_root,

            body: &[],
        })
    }

    #[inline]
    fn parse_form(&mut self, headers: &Headers<'a>, rest: &'a [u8]) -> Result<(), ErrorKind> {
        let length = headers
            .content_length
            .and_then(|value| types::slice_to_u64(value.as_bytes()))
            .ok_or(ErrorKind::InvalidContentLength)?;

        let content_type = headers
            .content_type
            .ok_or(ErrorKind::UnsupportedContentType)?;

        self.method = if content_type.contains(FORM_URLENCODED) {
            MethodKind::PostUrlEncoded
        } else if content_type.contains(FORM_MULTIPART) {
            MethodKind::PostMultipart
        } else {
            return Err(ErrorKind::UnsupportedContentType);
        };

        self.content_type = content_type;
        self.content_length = length;

        if length > 0 {
            let present = usize::try_from(length).map_or(rest.len(), |len| len.min(rest.len()));
            self.body = &rest[..present];
        }

        Ok(())
    }
}

#[derive(Debug, Default)]
struct Headers<'a> {
    host: Option<&'a str>,
    content_length: Option<&'a str>,
    content_type: Option<&'a str>,
}

impl<'a> Headers<'a> {
    #[inline]
    fn parse(fields: &'a str) -> Result<Self, ErrorKind> {
        let mut headers = Self::default();

        for line in fields.split("\r\n").filter(|line| !line.is_empty()) {
            let colon = memchr(b':', line.as_bytes())
                .filter(|&i| i > 0)
                .ok_or(ErrorKind::InvalidHeader)?;

            let value = line[colon + 1..].trim_matches(|c| c == ' ' || c == '\t');

            let slot = match line[..colon].as_bytes() {
                #[rustfmt::skip]
                [
                    b'h' | b'H',
                    b'o' | b'O',
                    b's' | b'S',
                    b't' | b'T'
                ] => &mut headers.host,
                #[rustfmt::skip]
                [
                    b'c' | b'C',
                    b'o' | b'O',
                    b'n' | b'N',
                    b't' | b'T',
                    b'e' | b'E',
                    b'n' | b'N',
                    b't' | b'T',
                    b'-',
                    b'l' | b'L',
                    b'e' | b'E',
                    b'n' | b'N',
                    b'g' | b'G',
                    b't' | b'T',
                    b'h' | b'H'
                ] => &mut headers.content_length,
                #[rustfmt::skip]
                [
                    b'c' | b'C',
                    b'o' | b'O',
                    b'n' | b'N',
                    b't' | b'T',
                    b'e' | b'E',
                    b'n' | b'N',
                    b't' | b'T',
                    b'-',
                    b't' | b'T',
                    b'y' | b'Y',
                    b'p' | b'P',
                    b'e' | b'E'
                ] => &mut headers.content_type,
                _ => continue,
            };

            slot.get_or_insert(value);
        }

        Ok(headers)
    }
}

#[cfg(test)]
mod request_self {
    use super::*;

    fn parse(src: &str) -> Result<ParsedRequest<'_>, ErrorKind> {
        ParsedRequest::parse(src.as_bytes(), 0)
    }

    #[test]
    fn parse_get() {
        #[rustfmt::skip]
        let cases = [
            (
                "GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n",
                ("/index.html", "", "example.com", "80", Version::Http11, false),
            ),
            (
                "GET / HTTP/1.0\r\nHost: example.com:8080\r\n\r\n",
                ("/", "", "example.com", "8080", Version::Http10, true),
            ),
            (
                "GET /docs/ HTTP/1.1\r\nhost: localhost\r\n\r\n",
                ("/docs", "", "localhost", "80", Version::Http11, false),
            ),
            (
                "GET /a/b/?x=1&y=2 HTTP/1.1\r\nUser-Agent: curl\r\nHOST: 127.0.0.1:81\r\n\r\n",
                ("/a/b", "x=1&y=2", "127.0.0.1", "81", Version::Http11, false),
            ),
            (
                "GET /?debug HTTP/1.1\r\nHost: a\r\nHost: b\r\n\r\n",
                ("/", "debug", "a", "80", Version::Http11, true),
            ),
            (
                "GET /search? HTTP/1.1\r\nHost:   spaced  \r\n\r\n",
                ("/search", "", "spaced", "80", Version::Http11, false),
            ),
        ];

        for (src, (url, query, host, port, version, is_root)) in cases {
            let req = parse(src).unwrap();

            assert_eq!(req.method(), MethodKind::Get, "{src:?}");
            assert_eq!(req.url(), url, "{src:?}");
            assert_eq!(req.query(), query, "{src:?}");
            assert_eq!(req.host(), host, "{src:?}");
            assert_eq!(req.port(), port, "{src:?}");
            assert_eq!(req.version(), version, "{src:?}");
            assert_eq!(req.is_root(), is_root, "{src:?}");
            assert_eq!(req.content_length(), 0);
            assert!(req.body().is_empty());
        }
    }

    #[test]
    fn server_keeps_port() {
        let req = parse("GET / HTTP/1.1\r\nHost: example.com:8080\r\n\r\n").unwrap();
        assert_eq!(req.server(), "example.com:8080");

        let req = parse("GET / HTTP/1.1\r\nHost: example.com\r\n\r\n").unwrap();
        assert_eq!(req.server(), "example.com");
    }

    #[test]
    fn parse_post() {
        #[rustfmt::skip]
        let cases = [
            (
                "POST /form.php HTTP/1.1\r\nHost: a\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: 7\r\n\r\nname=ok",
                (MethodKind::PostUrlEncoded, 7, "name=ok"),
            ),
            (
                "POST /form.php HTTP/1.1\r\nHost: a\r\nContent-Type: multipart/form-data; boundary=x\r\nContent-Length: 1000\r\n\r\n0123456789",
                (MethodKind::PostMultipart, 1000, "0123456789"),
            ),
            (
                "POST /form.php HTTP/1.1\r\nHost: a\r\ncontent-type: application/x-www-form-urlencoded\r\ncontent-length: 3\r\n\r\nabcdef",
                (MethodKind::PostUrlEncoded, 3, "abc"),
            ),
            (
                "POST /form.php HTTP/1.1\r\nHost: a\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: 0\r\n\r\nignored",
                (MethodKind::PostUrlEncoded, 0, ""),
            ),
            (
                "POST /form.php HTTP/1.1\r\nHost: a\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: 5\r\n\r\n",
                (MethodKind::PostUrlEncoded, 5, ""),
            ),
        ];

        for (src, (method, length, body)) in cases {
            let req = parse(src).unwrap();

            assert_eq!(req.method(), method, "{src:?}");
            assert_eq!(req.content_length(), length, "{src:?}");
            assert_eq!(req.body(), body.as_bytes(), "{src:?}");
            assert!(req.body().len() as u64 <= req.content_length());
        }
    }

    #[test]
    fn reject() {
        #[rustfmt::skip]
        let cases = [
            ("GET / HTTP/1.1\r\nHost: a\r\n",                   ErrorKind::InvalidHeader),
            ("\r\n\r\n",                                        ErrorKind::InvalidHeader),
            ("GET / HTTP/1.1 extra\r\nHost: a\r\n\r\n",         ErrorKind::InvalidHeader),
            ("GET /\r\nHost: a\r\n\r\n",                        ErrorKind::InvalidHeader),
            ("GET / HTTP/1.1\r\nbroken line\r\n\r\n",           ErrorKind::InvalidHeader),
            ("PUT / HTTP/1.1\r\nHost: a\r\n\r\n",               ErrorKind::InvalidMethod),
            ("get / HTTP/1.1\r\nHost: a\r\n\r\n",               ErrorKind::InvalidMethod),
            ("GET index.html HTTP/1.1\r\nHost: a\r\n\r\n",      ErrorKind::InvalidUrl),
            ("GET / HTTP/2.0\r\nHost: a\r\n\r\n",               ErrorKind::InvalidVersion),
            ("GET / HTTP/1.1\r\n\r\n",                          ErrorKind::MissingHost),
            ("GET / HTTP/1.1\r\nHost: \r\n\r\n",                ErrorKind::MissingHost),
            ("GET / HTTP/1.1\r\nHost: a:1:2\r\n\r\n",           ErrorKind::InvalidHost),
            (
                "POST / HTTP/1.1\r\nHost: a\r\nContent-Type: application/x-www-form-urlencoded\r\n\r\n",
                ErrorKind::InvalidContentLength,
            ),
            (
                "POST / HTTP/1.1\r\nHost: a\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: -1\r\n\r\n",
                ErrorKind::InvalidContentLength,
            ),
            (
                "POST / HTTP/1.1\r\nHost: a\r\nContent-Type: text/plain\r\nContent-Length: 10\r\n\r\n0123456789",
                ErrorKind::UnsupportedContentType,
            ),
            (
                "POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 10\r\n\r\n0123456789",
                ErrorKind::UnsupportedContentType,
            ),
        ];

        for (src, expected) in cases {
            assert_eq!(parse(src), Err(expected), "{src:?}");
        }
    }

    #[test]
    fn header_limit() {
        let src = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";

        assert!(ParsedRequest::parse(src, 0).is_ok());
        assert!(ParsedRequest::parse(src, 64).is_ok());
        assert_eq!(
            ParsedRequest::parse(src, 8),
            Err(ErrorKind::HeaderTooLarge)
        );
    }

    #[test]
    fn invalid_utf8() {
        let src = b"GET /\xff HTTP/1.1\r\nHost: a\r\n\r\n";
        assert_eq!(
            ParsedRequest::parse(src, 0),
            Err(ErrorKind::InvalidEncoding)
        );

        // Body bytes are never validated
        let src = b"POST / HTTP/1.1\r\nHost: a\r\nContent-Type: multipart/form-data\r\nContent-Length: 2\r\n\r\n\xff\xfe";
        assert_eq!(ParsedRequest::parse(src, 0).unwrap().body(), b"\xff\xfe");
    }
}
