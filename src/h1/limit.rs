use super::chunked::{BodyPart, ChunkedDecoder, ChunkedEncoder};
use crate::{DecodeError, Error};
use bytes::BytesMut;
use http::header::{HeaderMap, HeaderValue};
use http::Version;
use std::fmt;
use std::str::FromStr;

/// Limit reading a request body given configuration from request headers.
pub(crate) enum LimitRead {
    /// Read from a chunked decoder. The decoder will know when there is no more
    /// data to be read.
    ChunkedDecoder(ChunkedDecoder),
    /// Body data is limited by a `content-length` header.
    ContentLength(ContentLengthRead),
    /// No expected body.
    NoBody,
}

impl LimitRead {
    /// Create an instance from request headers.
    ///
    /// 1. If header `transfer-encoding: chunked` use chunked decoder regardless of other headers.
    /// 2. If header `content-length: <number>` use a reader limited by length
    /// 3. Otherwise consider there being no body.
    pub fn from_headers(headers: &HeaderMap, max_trailer_size: usize) -> Result<Self, DecodeError> {
        // https://tools.ietf.org/html/rfc7230#page-31
        // If a message is received with both a Transfer-Encoding and a
        // Content-Length header field, the Transfer-Encoding overrides the
        // Content-Length.
        let ret = if is_chunked(headers) {
            LimitRead::ChunkedDecoder(ChunkedDecoder::new(max_trailer_size))
        } else if headers.contains_key("content-length") {
            let size = get_as::<u64>(headers, "content-length")
                .ok_or_else(|| DecodeError::Malformed("Invalid content-length header".into()))?;
            LimitRead::ContentLength(ContentLengthRead { limit: size, total: 0 })
        } else {
            // Closing the connection cannot be used to indicate the end of a
            // request body, since it leaves no possibility for the server to send
            // back a response.
            LimitRead::NoBody
        };

        trace!("LimitRead from headers: {:?}", ret);

        Ok(ret)
    }

    pub fn is_no_body(&self) -> bool {
        match &self {
            LimitRead::ContentLength(r) => r.limit == 0,
            LimitRead::NoBody => true,
            _ => false,
        }
    }

    /// Decode the next part of the body from `buf`.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<BodyPart>, DecodeError> {
        match self {
            LimitRead::ChunkedDecoder(v) => v.decode(buf),
            LimitRead::ContentLength(v) => Ok(v.decode(buf)),
            LimitRead::NoBody => Ok(Some(BodyPart::End(None))),
        }
    }
}

/// Reader limited by a set length.
#[derive(Debug)]
pub(crate) struct ContentLengthRead {
    limit: u64,
    total: u64,
}

impl ContentLengthRead {
    fn decode(&mut self, buf: &mut BytesMut) -> Option<BodyPart> {
        let left = self.limit - self.total;

        if left == 0 {
            // Nothing more should be read.
            return Some(BodyPart::End(None));
        }
        if buf.is_empty() {
            return None;
        }

        let amount = (buf.len() as u64).min(left) as usize;
        self.total += amount as u64;

        Some(BodyPart::Data(buf.split_to(amount).freeze()))
    }
}

/// Limit writing a response body by the framing chosen for its head.
///
/// This is to ensure we don't write more data than "promised" by
/// the response header configuration.
pub(crate) enum LimitWrite {
    /// Write data using a chunked encoder.
    ChunkedEncoder,
    /// Limit the write by the `content-length` header.
    ContentLength(ContentLengthWrite),
    /// Body delimited by closing the connection (HTTP/1.0).
    ReadToEnd,
    /// There should be no body.
    NoBody,
}

impl LimitWrite {
    pub fn content_length(limit: u64) -> Self {
        LimitWrite::ContentLength(ContentLengthWrite { limit, total: 0 })
    }

    /// Whether the connection can carry another response after this one.
    pub fn is_reusable(&self) -> bool {
        !matches!(self, LimitWrite::ReadToEnd)
    }

    /// Write some data using this limiter.
    pub fn write(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<(), Error> {
        match self {
            LimitWrite::ChunkedEncoder => Ok(ChunkedEncoder::write_chunk(data, out)?),
            LimitWrite::ContentLength(v) => v.write(data, out),
            LimitWrite::ReadToEnd => {
                out.extend_from_slice(data);
                Ok(())
            }
            LimitWrite::NoBody => Ok(()),
        }
    }

    /// Finish up writing, called once after the all `write()` calls are done.
    ///
    /// Trailers need chunked encoding; other framings drop them.
    pub fn finish(&mut self, trailers: Option<&HeaderMap>, out: &mut Vec<u8>) -> Result<(), Error> {
        match self {
            LimitWrite::ChunkedEncoder => Ok(ChunkedEncoder::write_finish(trailers, out)?),
            LimitWrite::ContentLength(v) => {
                if v.total < v.limit {
                    let m = format!(
                        "Body data shorter than content-length header: {} < {}",
                        v.total, v.limit
                    );
                    return Err(Error::User(m));
                }
                Ok(())
            }
            LimitWrite::ReadToEnd | LimitWrite::NoBody => Ok(()),
        }
    }
}

/// Limit write by length.
#[derive(Debug)]
pub(crate) struct ContentLengthWrite {
    limit: u64,
    total: u64,
}

impl ContentLengthWrite {
    fn write(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<(), Error> {
        if data.is_empty() {
            return Ok(());
        }
        self.total += data.len() as u64;

        if self.total > self.limit {
            let m = format!(
                "Body data longer than content-length header: {} > {}",
                self.total, self.limit
            );
            return Err(Error::User(m));
        }

        out.extend_from_slice(data);

        Ok(())
    }
}

impl fmt::Debug for LimitRead {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self {
            LimitRead::ChunkedDecoder(_) => write!(f, "ChunkedDecoder")?,
            LimitRead::ContentLength(l) => write!(f, "ContentLength({})", l.limit)?,
            LimitRead::NoBody => write!(f, "NoBody")?,
        }
        Ok(())
    }
}

impl fmt::Debug for LimitWrite {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LimitWrite::ChunkedEncoder => write!(f, "ChunkedEncoder")?,
            LimitWrite::ContentLength(l) => write!(f, "ContentLength({})", l.limit)?,
            LimitWrite::ReadToEnd => write!(f, "ReadToEnd")?,
            LimitWrite::NoBody => write!(f, "NoBody")?,
        }
        Ok(())
    }
}

fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get("transfer-encoding")
        .and_then(|h| h.to_str().ok())
        // https://tools.ietf.org/html/rfc2616#section-4.4
        //
        // If a Transfer-Encoding header field (section 14.41) is present and
        // has any value other than "identity", then the transfer-length is
        // defined by use of the "chunked" transfer-coding
        .map(|h| !h.contains("identity"))
        .unwrap_or(false)
}

/// Whether the connection stays open after the exchange, from the request.
pub(crate) fn allow_reuse(headers: &HeaderMap, version: Version) -> bool {
    if version == Version::HTTP_11 {
        is_keep_alive(headers, true)
    } else {
        is_keep_alive(headers, false)
    }
}

fn is_keep_alive(headers: &HeaderMap, default: bool) -> bool {
    headers
        .get("connection")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| {
            let h = h.to_ascii_lowercase();
            if h.contains("keep-alive") {
                Some(true)
            } else if h.contains("close") {
                Some(false)
            } else {
                None
            }
        })
        .unwrap_or(default)
}

fn get_str<'a>(headers: &'a HeaderMap, key: &str) -> Option<&'a str> {
    headers.get(key).and_then(|v| v.to_str().ok())
}

pub(crate) fn get_as<T: FromStr>(headers: &HeaderMap, key: &str) -> Option<T> {
    get_str(headers, key).and_then(|v| v.trim().parse().ok())
}

pub(crate) fn set_header(headers: &mut HeaderMap, key: &'static str, value: &'static str) {
    headers.insert(key, HeaderValue::from_static(value));
}
