use super::chunked::BodyPart;
use super::limit::LimitRead;
use crate::exchange::ResponseHead;
use crate::{DecodeError, Error, ServerConfig};
use bytes::{Buf, Bytes, BytesMut};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, Uri, Version};
use std::io::Write;

// Request headers today vary in size from ~200 bytes to over 2KB.
// As applications use more cookies and user agents expand features,
// typical header sizes of 700-800 bytes is common.
// http://dev.chromium.org/spdy/spdy-whitepaper

/// A decoded request head.
#[derive(Debug)]
pub(crate) struct RequestFrame {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    /// Whether body frames follow.
    pub has_body: bool,
}

/// What the decoder found next in the byte stream.
#[derive(Debug)]
pub(crate) enum Frame {
    Head(RequestFrame),
    Data(Bytes),
    /// End of a request body, with chunked trailers if any.
    End(Option<HeaderMap>),
}

#[derive(Debug, Clone, Copy)]
struct Limits {
    max_initial_line_length: usize,
    max_header_size: usize,
    max_headers: usize,
}

/// Incremental request decoder.
///
/// Alternates between request heads and the body each head announces.
/// Input is consumed from the buffer as frames are produced.
#[derive(Debug)]
pub(crate) struct Decoder {
    limits: Limits,
    body: Option<LimitRead>,
}

impl Decoder {
    pub fn new(config: &ServerConfig) -> Self {
        Decoder {
            limits: Limits {
                max_initial_line_length: config.max_initial_line_length,
                max_header_size: config.max_header_size,
                max_headers: config.max_headers,
            },
            body: None,
        }
    }

    /// Between requests.
    pub fn is_idle(&self) -> bool {
        self.body.is_none()
    }

    /// Decode the next frame. `None` when more input is needed.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, DecodeError> {
        if let Some(limit) = self.body.as_mut() {
            return Ok(match limit.decode(buf)? {
                None => None,
                Some(BodyPart::Data(data)) => Some(Frame::Data(data)),
                Some(BodyPart::End(trailers)) => {
                    self.body = None;
                    Some(Frame::End(trailers))
                }
            });
        }

        // https://tools.ietf.org/html/rfc7230#section-3.5
        // a server that is expecting to receive and parse a request-line SHOULD
        // ignore at least one empty line (CRLF) received prior to the request-line.
        while buf.starts_with(b"\r\n") {
            buf.advance(2);
        }
        while buf.starts_with(b"\n") {
            buf.advance(1);
        }

        let (mut req, size) = match try_parse_req(buf, &self.limits)? {
            Some(v) => v,
            None => return Ok(None),
        };
        buf.advance(size);

        let limit = LimitRead::from_headers(&req.headers, self.limits.max_header_size)?;
        req.has_body = !limit.is_no_body();
        if req.has_body {
            self.body = Some(limit);
        }

        Ok(Some(Frame::Head(req)))
    }
}

fn version_of(v: Option<u8>) -> Result<Version, DecodeError> {
    match v {
        Some(0) => Ok(Version::HTTP_10),
        Some(1) => Ok(Version::HTTP_11),
        _ => Err(DecodeError::Malformed(format!("Unhandled http version: {:?}", v))),
    }
}

/// Attempt to parse an http/1.x request head, enforcing the size limits.
fn try_parse_req(
    buf: &[u8],
    limits: &Limits,
) -> Result<Option<(RequestFrame, usize)>, DecodeError> {
    let line_len = match buf.iter().position(|c| *c == b'\n') {
        Some(i) => i,
        None => buf.len(),
    };
    if line_len > limits.max_initial_line_length {
        return Err(DecodeError::LineTooLong(limits.max_initial_line_length));
    }

    let mut headers = vec![httparse::EMPTY_HEADER; limits.max_headers];
    let mut parser = httparse::Request::new(&mut headers);

    let status = parser.parse(buf).map_err(|e| match e {
        httparse::Error::TooManyHeaders => DecodeError::HeadersTooLarge(limits.max_header_size),
        e => e.into(),
    })?;

    let size = match status {
        httparse::Status::Partial => {
            if buf.len() > line_len + limits.max_header_size {
                return Err(DecodeError::HeadersTooLarge(limits.max_header_size));
            }
            return Ok(None);
        }
        httparse::Status::Complete(size) => size,
    };

    if size > line_len + limits.max_header_size {
        return Err(DecodeError::HeadersTooLarge(limits.max_header_size));
    }

    let version = version_of(parser.version)?;

    // invariant: a complete parse has method and path.
    let method = Method::from_bytes(parser.method.unwrap_or("").as_bytes())
        .map_err(|e| DecodeError::Malformed(e.to_string()))?;
    let uri: Uri = parser
        .path
        .unwrap_or("")
        .parse()
        .map_err(|e: http::uri::InvalidUri| DecodeError::Malformed(e.to_string()))?;

    let mut map = HeaderMap::with_capacity(parser.headers.len());
    for head in parser.headers.iter() {
        let name = HeaderName::from_bytes(head.name.as_bytes());
        let value = HeaderValue::from_bytes(head.value);
        match (name, value) {
            (Ok(name), Ok(value)) => {
                map.append(name, value);
            }
            (Err(e), _) => {
                debug!("Dropping bad header name: {}", e);
            }
            (Ok(name), Err(e)) => {
                debug!("Dropping bad header value ({}): {}", name, e);
            }
        }
    }

    let req = RequestFrame {
        method,
        uri,
        version,
        headers: map,
        has_body: false,
    };

    debug!("try_parse_req success: {} {} {:?}", req.method, req.uri, req.version);

    Ok(Some((req, size)))
}

/// Take one line without its CRLF. `None` if the line isn't complete.
pub(crate) fn take_line(buf: &mut BytesMut, max: usize) -> Result<Option<Bytes>, DecodeError> {
    let end = match buf.iter().position(|c| *c == b'\n') {
        Some(i) => i,
        None => {
            if buf.len() > max {
                return Err(DecodeError::Malformed(format!("Line longer than {} bytes", max)));
            }
            return Ok(None);
        }
    };
    if end > max {
        return Err(DecodeError::Malformed(format!("Line longer than {} bytes", max)));
    }

    let mut line = buf.split_to(end + 1);
    line.truncate(end);
    if line.ends_with(b"\r") {
        line.truncate(end - 1);
    }

    Ok(Some(line.freeze()))
}

/// Write an http/1.x response head to a buffer.
#[allow(clippy::write_with_newline)]
pub(crate) fn write_http1x_res(
    version: Version,
    head: &ResponseHead,
    out: &mut Vec<u8>,
) -> Result<(), Error> {
    let start = out.len();

    let ver = match version {
        Version::HTTP_10 => "1.0",
        _ => "1.1",
    };

    write!(
        out,
        "HTTP/{} {} {}\r\n",
        ver,
        head.status.as_u16(),
        head.status.canonical_reason().unwrap_or("Unknown")
    )?;

    // the rest of the headers.
    for (name, value) in &head.headers {
        write!(out, "{}: ", name)?;
        out.write_all(value.as_bytes())?;
        write!(out, "\r\n")?;
    }
    write!(out, "\r\n")?;

    debug!(
        "write_http1x_res: {:?}",
        String::from_utf8_lossy(&out[start..])
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;

    fn config() -> ServerConfig {
        ServerConfig {
            max_initial_line_length: 32,
            max_header_size: 64,
            max_headers: 4,
            ..ServerConfig::default()
        }
    }

    fn decode(input: &[u8]) -> Result<Vec<Frame>, DecodeError> {
        let mut dec = Decoder::new(&config());
        let mut buf = BytesMut::from(input);
        let mut frames = vec![];
        while let Some(frame) = dec.decode(&mut buf)? {
            frames.push(frame);
        }
        Ok(frames)
    }

    #[test]
    fn pipelined_heads() {
        let frames = decode(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.0\r\nhost: x\r\n\r\n").unwrap();
        match &frames[..] {
            [Frame::Head(a), Frame::Head(b)] => {
                assert_eq!(a.uri.path(), "/a");
                assert_eq!(a.version, Version::HTTP_11);
                assert!(!a.has_body);
                assert_eq!(b.uri.path(), "/b");
                assert_eq!(b.version, Version::HTTP_10);
                assert_eq!(b.headers.get("host").unwrap(), "x");
            }
            _ => panic!("unexpected: {:?}", frames),
        }
    }

    #[test]
    fn content_length_body() {
        let frames = decode(b"POST / HTTP/1.1\r\ncontent-length: 3\r\n\r\nabcGET / HTTP/1.1\r\n\r\n").unwrap();
        match &frames[..] {
            [Frame::Head(h), Frame::Data(d), Frame::End(None), Frame::Head(_)] => {
                assert!(h.has_body);
                assert_eq!(&d[..], b"abc");
            }
            _ => panic!("unexpected: {:?}", frames),
        }
    }

    #[test]
    fn chunked_wins_over_content_length() {
        let mut dec = Decoder::new(&ServerConfig::default());
        let mut buf = BytesMut::from(
            &b"POST / HTTP/1.1\r\ncontent-length: 100\r\ntransfer-encoding: chunked\r\n\r\n2\r\nhi\r\n0\r\n\r\n"[..],
        );
        assert!(matches!(dec.decode(&mut buf), Ok(Some(Frame::Head(_)))));
        assert!(matches!(dec.decode(&mut buf), Ok(Some(Frame::Data(d))) if &d[..] == b"hi"));
        assert!(matches!(dec.decode(&mut buf), Ok(Some(Frame::End(None)))));
        assert!(dec.is_idle());
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_head_waits() {
        let mut dec = Decoder::new(&config());
        let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\nhos"[..]);
        assert!(dec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"t: a\r\n\r\n");
        assert!(matches!(dec.decode(&mut buf), Ok(Some(Frame::Head(_)))));
    }

    #[test]
    fn request_line_too_long_is_414() {
        let err = decode(b"GET /aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa HTTP/1.1\r\n\r\n").unwrap_err();
        assert_eq!(err.status(), StatusCode::URI_TOO_LONG);

        // also without the line being complete.
        let err = decode(&[b'a'; 40]).unwrap_err();
        assert_eq!(err.status(), StatusCode::URI_TOO_LONG);
    }

    #[test]
    fn headers_too_large_is_431() {
        let err = decode(b"GET / HTTP/1.1\r\nx-a: 0123456789012345678901234567890123456789012345678901234567890123\r\n\r\n")
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE);

        let err = decode(b"GET / HTTP/1.1\r\na: 1\r\nb: 2\r\nc: 3\r\nd: 4\r\ne: 5\r\n\r\n").unwrap_err();
        assert_eq!(err.status(), StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE);
    }

    #[test]
    fn malformed_is_400() {
        let err = decode(b"GET / HTTP/1.1\r\nbad header\r\n\r\n").unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let err = decode(b"POST / HTTP/1.1\r\ncontent-length: x\r\n\r\n").unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn write_head() {
        let mut headers = HeaderMap::new();
        headers.insert("content-length", HeaderValue::from_static("2"));
        let head = ResponseHead {
            status: StatusCode::OK,
            headers,
        };
        let mut out = vec![];
        write_http1x_res(Version::HTTP_11, &head, &mut out).unwrap();
        assert_eq!(out, b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\n");
    }
}
