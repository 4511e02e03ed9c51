//! Zero-allocation response heads and chunked framing written into pooled buffers.

use crate::http::types::{StatusCode, Version};

/// Canonical zero-length terminator chunk.
pub(crate) const CHUNKED_END: &[u8] = b"0\r\n\r\n";

const CRLF: &[u8] = b"\r\n";

/// The head did not fit into the destination buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Overflow;

/// Cursor appending bytes into a fixed buffer.
struct Cursor<'b> {
    buf: &'b mut [u8],
    len: usize,
}

impl<'b> Cursor<'b> {
    #[inline(always)]
    fn new(buf: &'b mut [u8]) -> Self {
        Self { buf, len: 0 }
    }

    #[inline]
    fn put(&mut self, bytes: &[u8]) -> Result<&mut Self, Overflow> {
        let end = self.len + bytes.len();
        self.buf
            .get_mut(self.len..end)
            .ok_or(Overflow)?
            .copy_from_slice(bytes);

        self.len = end;
        Ok(self)
    }

    #[inline]
    fn put_u64(&mut self, value: u64) -> Result<&mut Self, Overflow> {
        let mut digits = [0u8; 20];
        let mut pos = digits.len();
        let mut value = value;

        loop {
            pos -= 1;
            digits[pos] = b'0' + (value % 10) as u8;
            value /= 10;

            if value == 0 {
                break;
            }
        }

        self.put(&digits[pos..])
    }

    #[inline]
    fn put_hex(&mut self, value: usize) -> Result<&mut Self, Overflow> {
        const HEX: &[u8; 16] = b"0123456789abcdef";

        let mut digits = [0u8; 16];
        let mut pos = digits.len();
        let mut value = value;

        loop {
            pos -= 1;
            digits[pos] = HEX[value & 0xf];
            value >>= 4;

            if value == 0 {
                break;
            }
        }

        self.put(&digits[pos..])
    }
}

/// Writes the `200` head of a static file response, returns its length.
pub(crate) fn static_header(
    buf: &mut [u8],
    version: Version,
    content_type: &str,
    len: u64,
) -> Result<usize, Overflow> {
    let mut cursor = Cursor::new(buf);

    cursor
        .put(StatusCode::Ok.into_first_line(version))?
        .put(b"Content-Type: ")?
        .put(content_type.as_bytes())?
        .put(b"\r\nContent-Length: ")?
        .put_u64(len)?
        .put(CRLF)?
        .put(CRLF)?;

    Ok(cursor.len)
}

/// Writes the `200` head of a dynamic response streamed as chunks.
pub(crate) fn chunked_header(
    buf: &mut [u8],
    version: Version,
    content_type: &[u8],
) -> Result<usize, Overflow> {
    let mut cursor = Cursor::new(buf);

    cursor
        .put(StatusCode::Ok.into_first_line(version))?
        .put(b"Content-Type: ")?
        .put(content_type)?
        .put(b"\r\nTransfer-Encoding: chunked\r\n\r\n")?;

    Ok(cursor.len)
}

/// Writes the head of an error response carrying a custom page of `len` bytes.
pub(crate) fn page_header(
    buf: &mut [u8],
    version: Version,
    status: StatusCode,
    len: usize,
) -> Result<usize, Overflow> {
    let mut cursor = Cursor::new(buf);

    cursor
        .put(status.into_first_line(version))?
        .put(b"Content-Type: text/html\r\nContent-Length: ")?
        .put_u64(len as u64)?
        .put(CRLF)?
        .put(CRLF)?;

    Ok(cursor.len)
}

/// Frames `payload` as one HTTP chunk into `out`, returns the framed length.
///
/// Empty payloads are rejected since a zero-length chunk ends the body.
pub(crate) fn frame_chunk(payload: &[u8], out: &mut [u8]) -> Result<usize, Overflow> {
    if payload.is_empty() {
        return Err(Overflow);
    }

    let mut cursor = Cursor::new(out);

    cursor
        .put_hex(payload.len())?
        .put(CRLF)?
        .put(payload)?
        .put(CRLF)?;

    Ok(cursor.len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heads() {
        let mut buf = [0u8; 256];

        let n = static_header(&mut buf, Version::Http11, "text/html", 1234).unwrap();
        assert_eq!(
            &buf[..n],
            b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 1234\r\n\r\n"
        );

        let n = static_header(&mut buf, Version::Http10, "text/plain", 0).unwrap();
        assert_eq!(
            &buf[..n],
            b"HTTP/1.0 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 0\r\n\r\n"
        );

        let n = chunked_header(&mut buf, Version::Http11, b"application/json").unwrap();
        assert_eq!(
            &buf[..n],
            b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nTransfer-Encoding: chunked\r\n\r\n"
        );

        let n = page_header(&mut buf, Version::Http11, StatusCode::NotFound, 9).unwrap();
        assert_eq!(
            &buf[..n],
            b"HTTP/1.1 404 Not Found\r\nContent-Type: text/html\r\nContent-Length: 9\r\n\r\n"
        );
    }

    #[test]
    fn overflow() {
        let mut buf = [0u8; 16];

        assert_eq!(
            static_header(&mut buf, Version::Http11, "text/html", 1),
            Err(Overflow)
        );
        assert_eq!(frame_chunk(&[0u8; 16], &mut buf), Err(Overflow));
        assert_eq!(frame_chunk(b"", &mut buf), Err(Overflow));
    }

    #[test]
    fn chunk_lengths() {
        #[rustfmt::skip]
        let cases = [
            (1,     "1\r\n"),
            (10,    "a\r\n"),
            (255,   "ff\r\n"),
            (4032,  "fc0\r\n"),
            (65535, "ffff\r\n"),
        ];

        let mut out = vec![0u8; 70_000];

        for (len, prefix) in cases {
            let payload = vec![b'x'; len];
            let n = frame_chunk(&payload, &mut out).unwrap();

            assert!(out.starts_with(prefix.as_bytes()), "{len}");
            assert_eq!(n, prefix.len() + len + 2);
            assert_eq!(&out[n - 2..n], CRLF);
        }
    }

    fn unframe(mut src: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();

        loop {
            let line_end = src.windows(2).position(|w| w == CRLF).unwrap();
            let size = std::str::from_utf8(&src[..line_end]).unwrap();
            let size = usize::from_str_radix(size, 16).unwrap();
            src = &src[line_end + 2..];

            if size == 0 {
                assert_eq!(src, CRLF);
                return body;
            }

            body.extend_from_slice(&src[..size]);
            assert_eq!(&src[size..size + 2], CRLF);
            src = &src[size + 2..];
        }
    }

    #[test]
    fn chunked_round_trip() {
        let max_chunk = 100;
        let fragments: [&[u8]; 4] = [b"first", &[7u8; 250], b"", &[1u8; 100]];

        let mut wire = Vec::new();
        let mut out = [0u8; 128];

        for fragment in fragments {
            for piece in fragment.chunks(max_chunk) {
                let n = frame_chunk(piece, &mut out).unwrap();
                wire.extend_from_slice(&out[..n]);
            }
        }
        wire.extend_from_slice(CHUNKED_END);

        assert_eq!(unframe(&wire), fragments.concat());
    }
}
