//! Core HTTP protocol types shared by the parser and the response writer

use crate::errors::ErrorKind;

#[inline(always)]
pub(crate) fn slice_to_u64(bytes: &[u8]) -> Option<u64> {
    if bytes.is_empty() {
        return None;
    }

    let mut result: u64 = 0;

    for &byte in bytes {
        if !byte.is_ascii_digit() {
            return None;
        }

        result = result
            .checked_mul(10)?
            .checked_add((byte - b'0') as u64)?;
    }

    Some(result)
}

// METHOD

/// Request kind as seen by the router.
///
/// Only `GET` and the two HTML form encodings of `POST` are served. Anything
/// else never leaves the parser, so `Unknown` only shows up on recycled state.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub enum MethodKind {
    #[default]
    Unknown,
    /// `GET`, no body
    Get,
    /// `POST` with `application/x-www-form-urlencoded`
    PostUrlEncoded,
    /// `POST` with `multipart/form-data`
    PostMultipart,
}

impl MethodKind {
    /// Value of the `REQUEST_METHOD` parameter sent to a FastCGI backend.
    #[inline]
    pub const fn as_str(&self) -> &'static str {
        match self {
            MethodKind::Get => "GET",
            MethodKind::PostUrlEncoded | MethodKind::PostMultipart => "POST",
            MethodKind::Unknown => "",
        }
    }

    #[inline]
    pub const fn is_post(&self) -> bool {
        matches!(self, MethodKind::PostUrlEncoded | MethodKind::PostMultipart)
    }
}

// VERSION

/// HTTP protocol version
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub enum Version {
    /// HTTP/1.0 - [RFC 1945](https://tools.ietf.org/html/rfc1945)
    Http10,

    /// HTTP/1.1 - [RFC 7230](https://tools.ietf.org/html/rfc7230) and related
    #[default]
    Http11,
}

impl Version {
    #[inline(always)]
    pub(crate) const fn from_bytes(src: &[u8]) -> Result<Self, ErrorKind> {
        match src {
            b"HTTP/1.1" => Ok(Self::Http11),
            b"HTTP/1.0" => Ok(Self::Http10),
            _ => Err(ErrorKind::InvalidVersion),
        }
    }

    #[inline(always)]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        }
    }
}

// STATUS_CODE

macro_rules! set_status_codes {
    ($(
        $(#[$docs:meta])+
        $name:ident = ($num:expr, $str:expr, $page_len:literal);
    )+) => {
        /// HTTP status codes the server answers with
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum StatusCode { $(
            #[doc = concat!(stringify!($num), " ", $str)]
            $(#[$docs])+
            $name = $num,
        )+ }

        impl StatusCode {
            #[inline]
            pub const fn as_u16(&self) -> u16 {
                *self as u16
            }

            // Returns the HTTP first line as bytes (e.g., `b"HTTP/1.1 200 OK\r\n"`).
            #[inline]
            pub(crate) const fn into_first_line(&self, version: Version) -> &'static [u8] {
                match (self, version) { $(
                    (StatusCode::$name, Version::Http11) => {
                        concat!("HTTP/1.1 ", $num, " ", $str, "\r\n").as_bytes()
                    },
                    (StatusCode::$name, Version::Http10) => {
                        concat!("HTTP/1.0 ", $num, " ", $str, "\r\n").as_bytes()
                    },
                )+ }
            }

            // Built-in HTML body for the status.
            #[cfg(test)]
            pub(crate) const fn page(&self) -> &'static [u8] {
                match self { $(
                    StatusCode::$name => concat!(
                        "<html><header><title>", $num, " ", $str, "</title></header>",
                        "<body>", $num, " ", $str, "</body></html>"
                    ).as_bytes(),
                )+ }
            }

            // Complete response carrying the built-in page.
            #[inline]
            pub(crate) const fn page_response(&self, version: Version) -> &'static [u8] {
                match (self, version) { $(
                    (StatusCode::$name, Version::Http11) => concat!(
                        "HTTP/1.1 ", $num, " ", $str, "\r\n",
                        "Content-Type: text/html\r\n",
                        "Content-Length: ", $page_len, "\r\n",
                        "\r\n",
                        "<html><header><title>", $num, " ", $str, "</title></header>",
                        "<body>", $num, " ", $str, "</body></html>"
                    ).as_bytes(),
                    (StatusCode::$name, Version::Http10) => concat!(
                        "HTTP/1.0 ", $num, " ", $str, "\r\n",
                        "Content-Type: text/html\r\n",
                        "Content-Length: ", $page_len, "\r\n",
                        "\r\n",
                        "<html><header><title>", $num, " ", $str, "</title></header>",
                        "<body>", $num, " ", $str, "</body></html>"
                    ).as_bytes(),
                )+ }
            }
        }
    }
}

set_status_codes! {
    /// [[RFC9110, Section 15.3.1](https://datatracker.ietf.org/doc/html/rfc9110#section-15.3.1)]
    Ok = (200, "OK", "70");

    /// [[RFC9110, Section 15.5.1](https://datatracker.ietf.org/doc/html/rfc9110#section-15.5.1)]
    BadRequest = (400, "Bad Request", "88");
    /// [[RFC9110, Section 15.5.5](https://datatracker.ietf.org/doc/html/rfc9110#section-15.5.5)]
    NotFound = (404, "Not Found", "84");
    /// [[RFC9110, Section 15.5.7](https://datatracker.ietf.org/doc/html/rfc9110#section-15.5.7)]
    NotAcceptable = (406, "Not Acceptable", "94");
    /// [[RFC9110, Section 15.5.16](https://datatracker.ietf.org/doc/html/rfc9110#section-15.5.16)]
    UnsupportedMediaType = (415, "Unsupported Media Type", "110");

    /// [[RFC9110, Section 15.6.1](https://datatracker.ietf.org/doc/html/rfc9110#section-15.6.1)]
    InternalServerError = (500, "Internal Server Error", "108");
}
