//! Response body compression and `accept-encoding` negotiation.
//!
//! The encoding of a response is resolved once per exchange, from the request's
//! `accept-encoding` header against the configured encodings. Bodies are then
//! compressed chunk by chunk with a sync flush after each chunk, so streamed
//! responses reach the client without waiting for the whole body.

use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use std::fmt;
use std::io;
use std::io::Write;

/// Supported content encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentEncoding {
    /// No encoding.
    Identity,
    /// gzip (RFC 1952).
    Gzip,
    /// deflate (RFC 1951 wrapped in zlib).
    Deflate,
}

impl ContentEncoding {
    /// Parse from the encoding token used in HTTP headers.
    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "identity" => Some(Self::Identity),
            "gzip" | "x-gzip" => Some(Self::Gzip),
            "deflate" => Some(Self::Deflate),
            _ => None,
        }
    }

    /// The HTTP header token for this encoding.
    pub const fn as_token(&self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Gzip => "gzip",
            Self::Deflate => "deflate",
        }
    }
}

impl fmt::Display for ContentEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_token())
    }
}

#[derive(Debug, Clone, PartialEq)]
struct QualityValue {
    encoding: String,
    quality: f32,
}

/// Parse `gzip;q=1.0, deflate;q=0.5, *;q=0` into (encoding, quality) pairs.
fn parse_accept_encoding(header: &str) -> Vec<QualityValue> {
    header
        .split(',')
        .filter_map(|part| {
            let part = part.trim();
            if part.is_empty() {
                return None;
            }

            let mut pieces = part.splitn(2, ';');
            let encoding = pieces.next()?.trim().to_ascii_lowercase();

            let quality = pieces
                .next()
                .and_then(|q| {
                    let q = q.trim();
                    q.strip_prefix("q=").or_else(|| q.strip_prefix("Q="))
                })
                .and_then(|q| q.trim().parse::<f32>().ok())
                .unwrap_or(1.0);

            Some(QualityValue { encoding, quality })
        })
        .collect()
}

/// Pick the best encoding in `supported` for an `accept-encoding` header.
///
/// Quality decides, ties go to the order of `supported`. Encodings the client
/// does not mention are only acceptable through a `*` entry, except `identity`
/// which is acceptable unless excluded. Returns `None` when everything is
/// rejected with `q=0`.
pub fn negotiate_encoding(
    accept_encoding: &str,
    supported: &[ContentEncoding],
) -> Option<ContentEncoding> {
    if accept_encoding.trim().is_empty() {
        return if supported.contains(&ContentEncoding::Identity) {
            Some(ContentEncoding::Identity)
        } else {
            supported.first().copied()
        };
    }

    let preferences = parse_accept_encoding(accept_encoding);

    let wildcard = preferences
        .iter()
        .find(|q| q.encoding == "*")
        .map(|q| q.quality);

    let mut best: Option<(ContentEncoding, f32)> = None;

    for &encoding in supported {
        let token = encoding.as_token();

        let quality = preferences
            .iter()
            .find(|q| q.encoding == token)
            .map(|q| q.quality)
            .or(wildcard)
            .unwrap_or(if encoding == ContentEncoding::Identity {
                1.0
            } else {
                0.0
            });

        if quality <= 0.0 {
            continue;
        }

        match best {
            Some((_, best_q)) if quality <= best_q => {}
            _ => best = Some((encoding, quality)),
        }
    }

    best.map(|(enc, _)| enc)
}

/// Resolve the response encoding for a request. `None` means send as is.
pub(crate) fn resolve(accept_encoding: Option<&str>, enabled: &[ContentEncoding]) -> Option<ContentEncoding> {
    let accept = accept_encoding?;

    let mut supported = enabled.to_vec();
    supported.push(ContentEncoding::Identity);

    match negotiate_encoding(accept, &supported) {
        Some(ContentEncoding::Identity) | None => None,
        Some(enc) => Some(enc),
    }
}

/// Streaming compression of a response body.
pub(crate) trait Compressor: Send {
    /// Compress a chunk, appending everything that can be decoded so far to `output`.
    fn compress(&mut self, input: &[u8], output: &mut Vec<u8>) -> io::Result<()>;

    /// Write the compression trailer.
    fn finish(&mut self, output: &mut Vec<u8>) -> io::Result<()>;

    fn encoding(&self) -> ContentEncoding;
}

/// Compressor for `encoding`, `None` for identity.
pub(crate) fn compressor(encoding: ContentEncoding, level: u32) -> Option<Box<dyn Compressor>> {
    let level = Compression::new(level.min(9));

    match encoding {
        ContentEncoding::Identity => None,
        ContentEncoding::Gzip => Some(Box::new(GzipCompressor(GzEncoder::new(vec![], level)))),
        ContentEncoding::Deflate => Some(Box::new(DeflateCompressor(ZlibEncoder::new(
            vec![],
            level,
        )))),
    }
}

struct GzipCompressor(GzEncoder<Vec<u8>>);

impl Compressor for GzipCompressor {
    fn compress(&mut self, input: &[u8], output: &mut Vec<u8>) -> io::Result<()> {
        self.0.write_all(input)?;
        // sync flush, the chunk is decodable on its own.
        self.0.flush()?;
        output.append(self.0.get_mut());
        Ok(())
    }

    fn finish(&mut self, output: &mut Vec<u8>) -> io::Result<()> {
        self.0.try_finish()?;
        output.append(self.0.get_mut());
        Ok(())
    }

    fn encoding(&self) -> ContentEncoding {
        ContentEncoding::Gzip
    }
}

struct DeflateCompressor(ZlibEncoder<Vec<u8>>);

impl Compressor for DeflateCompressor {
    fn compress(&mut self, input: &[u8], output: &mut Vec<u8>) -> io::Result<()> {
        self.0.write_all(input)?;
        self.0.flush()?;
        output.append(self.0.get_mut());
        Ok(())
    }

    fn finish(&mut self, output: &mut Vec<u8>) -> io::Result<()> {
        self.0.try_finish()?;
        output.append(self.0.get_mut());
        Ok(())
    }

    fn encoding(&self) -> ContentEncoding {
        ContentEncoding::Deflate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::{GzDecoder, ZlibDecoder};
    use std::io::Read;

    #[test]
    fn parse_with_quality() {
        let parsed = parse_accept_encoding("gzip;q=1.0, deflate;q=0.5, *;q=0");
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[1].encoding, "deflate");
        assert!((parsed[1].quality - 0.5).abs() < f32::EPSILON);
        assert_eq!(parsed[2].encoding, "*");
    }

    #[test]
    fn negotiate_prefers_quality_then_order() {
        let supported = &[ContentEncoding::Gzip, ContentEncoding::Deflate];
        assert_eq!(
            negotiate_encoding("gzip;q=0.5, deflate", supported),
            Some(ContentEncoding::Deflate)
        );
        assert_eq!(
            negotiate_encoding("deflate, gzip", supported),
            Some(ContentEncoding::Gzip)
        );
        assert_eq!(negotiate_encoding("br", supported), None);
    }

    #[test]
    fn resolve_skips_identity() {
        let enabled = &[ContentEncoding::Gzip];
        assert_eq!(resolve(None, enabled), None);
        assert_eq!(resolve(Some("identity"), enabled), None);
        assert_eq!(resolve(Some("gzip"), enabled), Some(ContentEncoding::Gzip));
        assert_eq!(resolve(Some("*"), enabled), Some(ContentEncoding::Gzip));
        assert_eq!(resolve(Some("gzip;q=0"), enabled), None);
    }

    #[test]
    fn gzip_chunks_decode_to_input() {
        let mut c = compressor(ContentEncoding::Gzip, 6).unwrap();
        let mut out = vec![];
        c.compress(b"hello ", &mut out).unwrap();
        assert!(!out.is_empty());
        c.compress(b"world", &mut out).unwrap();
        c.finish(&mut out).unwrap();

        let mut s = String::new();
        GzDecoder::new(&out[..]).read_to_string(&mut s).unwrap();
        assert_eq!(s, "hello world");
    }

    #[test]
    fn deflate_decodes_to_input() {
        let mut c = compressor(ContentEncoding::Deflate, 1).unwrap();
        let mut out = vec![];
        c.compress(b"abcabcabc", &mut out).unwrap();
        c.finish(&mut out).unwrap();

        let mut s = String::new();
        ZlibDecoder::new(&out[..]).read_to_string(&mut s).unwrap();
        assert_eq!(s, "abcabcabc");
    }
}
