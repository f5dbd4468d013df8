use super::http11::take_line;
use crate::DecodeError;
use bytes::{Bytes, BytesMut};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use std::io::Write;

/// Longest chunk size line, extensions included.
const MAX_CHUNK_LINE: usize = 1024;

/// Output of a request body decoder.
#[derive(Debug)]
pub(crate) enum BodyPart {
    Data(Bytes),
    /// End of body, with trailers if any were sent.
    End(Option<HeaderMap>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Size,
    Data(u64),
    DataEnd,
    Trailers,
    Done,
}

/// Decoder of `transfer-encoding: chunked` over a buffer that fills up over time.
#[derive(Debug)]
pub(crate) struct ChunkedDecoder {
    state: State,
    trailers: Vec<u8>,
    max_trailer_size: usize,
}

impl ChunkedDecoder {
    pub fn new(max_trailer_size: usize) -> Self {
        ChunkedDecoder {
            state: State::Size,
            trailers: vec![],
            max_trailer_size,
        }
    }

    /// Decode the next part. `None` if more input is needed.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<BodyPart>, DecodeError> {
        loop {
            match self.state {
                State::Size => {
                    let line = match take_line(buf, MAX_CHUNK_LINE)? {
                        Some(l) => l,
                        None => return Ok(None),
                    };
                    let size = chunk_size(&line)?;
                    trace!("Chunk size: {}", size);
                    self.state = if size == 0 {
                        State::Trailers
                    } else {
                        State::Data(size)
                    };
                }

                State::Data(left) => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    let amount = (buf.len() as u64).min(left) as usize;
                    let data = buf.split_to(amount).freeze();
                    let left = left - amount as u64;
                    self.state = if left == 0 { State::DataEnd } else { State::Data(left) };
                    return Ok(Some(BodyPart::Data(data)));
                }

                State::DataEnd => {
                    let line = match take_line(buf, MAX_CHUNK_LINE)? {
                        Some(l) => l,
                        None => return Ok(None),
                    };
                    if !line.is_empty() {
                        return Err(DecodeError::Malformed("Chunk data not followed by CRLF".into()));
                    }
                    self.state = State::Size;
                }

                State::Trailers => {
                    let line = match take_line(buf, self.max_trailer_size)? {
                        Some(l) => l,
                        None => return Ok(None),
                    };
                    if line.is_empty() {
                        self.state = State::Done;
                        let trailers = parse_trailers(&self.trailers)?;
                        self.trailers.clear();
                        return Ok(Some(BodyPart::End(trailers)));
                    }
                    self.trailers.extend_from_slice(&line);
                    self.trailers.extend_from_slice(b"\r\n");
                    if self.trailers.len() > self.max_trailer_size {
                        return Err(DecodeError::HeadersTooLarge(self.max_trailer_size));
                    }
                }

                State::Done => return Ok(Some(BodyPart::End(None))),
            }
        }
    }
}

fn chunk_size(line: &[u8]) -> Result<u64, DecodeError> {
    // chunk extensions are ignored.
    let size = line.split(|c| *c == b';').next().unwrap_or(&[]);
    let size = std::str::from_utf8(size)
        .ok()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .and_then(|s| u64::from_str_radix(s, 16).ok());

    size.ok_or_else(|| {
        DecodeError::Malformed(format!("Invalid chunk size: {:?}", String::from_utf8_lossy(line)))
    })
}

fn parse_trailers(block: &[u8]) -> Result<Option<HeaderMap>, DecodeError> {
    if block.is_empty() {
        return Ok(None);
    }

    let mut end = block.to_vec();
    end.extend_from_slice(b"\r\n");
    let mut headers = [httparse::EMPTY_HEADER; 32];

    match httparse::parse_headers(&end, &mut headers)? {
        httparse::Status::Complete((_, parsed)) => {
            let mut map = HeaderMap::with_capacity(parsed.len());
            for h in parsed {
                match (HeaderName::from_bytes(h.name.as_bytes()), HeaderValue::from_bytes(h.value)) {
                    (Ok(name), Ok(value)) => {
                        map.append(name, value);
                    }
                    _ => debug!("Dropping bad trailer: {}", h.name),
                }
            }
            Ok(Some(map))
        }
        httparse::Status::Partial => Err(DecodeError::Malformed("Incomplete trailers".into())),
    }
}

/// Encoder of `transfer-encoding: chunked`.
pub(crate) struct ChunkedEncoder;

impl ChunkedEncoder {
    pub fn write_chunk(data: &[u8], out: &mut Vec<u8>) -> std::io::Result<()> {
        // an empty chunk would end the body.
        if data.is_empty() {
            return Ok(());
        }
        write!(out, "{:x}\r\n", data.len())?;
        out.extend_from_slice(data);
        out.extend_from_slice(b"\r\n");
        Ok(())
    }

    pub fn write_finish(trailers: Option<&HeaderMap>, out: &mut Vec<u8>) -> std::io::Result<()> {
        out.extend_from_slice(b"0\r\n");
        if let Some(trailers) = trailers {
            for (name, value) in trailers {
                write!(out, "{}: ", name)?;
                out.extend_from_slice(value.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
        }
        out.extend_from_slice(b"\r\n");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &[u8]) -> Result<(Vec<u8>, Option<HeaderMap>), DecodeError> {
        let mut dec = ChunkedDecoder::new(1024);
        let mut buf = BytesMut::new();
        let mut body = vec![];

        // feed one byte at a time to exercise every partial state.
        for b in input {
            buf.extend_from_slice(&[*b]);
            while let Some(part) = dec.decode(&mut buf)? {
                match part {
                    BodyPart::Data(d) => body.extend_from_slice(&d),
                    BodyPart::End(t) => return Ok((body, t)),
                }
            }
        }
        panic!("body did not end");
    }

    #[test]
    fn chunks_with_extension() {
        let (body, trailers) = decode_all(b"3;ext=1\r\nabc\r\n2\r\nde\r\n0\r\n\r\n").unwrap();
        assert_eq!(body, b"abcde");
        assert!(trailers.is_none());
    }

    #[test]
    fn trailers_are_parsed() {
        let (body, trailers) = decode_all(b"1\r\nx\r\n0\r\nx-sum: 42\r\n\r\n").unwrap();
        assert_eq!(body, b"x");
        assert_eq!(trailers.unwrap().get("x-sum").unwrap(), "42");
    }

    #[test]
    fn bad_size() {
        let mut dec = ChunkedDecoder::new(1024);
        let mut buf = BytesMut::from(&b"zz\r\n"[..]);
        assert!(matches!(dec.decode(&mut buf), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn missing_crlf_after_data() {
        let mut dec = ChunkedDecoder::new(1024);
        let mut buf = BytesMut::from(&b"1\r\nxy\r\n"[..]);
        assert!(matches!(dec.decode(&mut buf), Ok(Some(BodyPart::Data(_)))));
        assert!(dec.decode(&mut buf).is_err());
    }

    #[test]
    fn encode() {
        let mut out = vec![];
        ChunkedEncoder::write_chunk(b"hello", &mut out).unwrap();
        ChunkedEncoder::write_chunk(b"", &mut out).unwrap();
        let mut t = HeaderMap::new();
        t.insert("x-a", HeaderValue::from_static("1"));
        ChunkedEncoder::write_finish(Some(&t), &mut out).unwrap();
        assert_eq!(out, b"5\r\nhello\r\n0\r\nx-a: 1\r\n\r\n");
    }
}
