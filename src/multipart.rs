//! `multipart/form-data` request bodies.

use crate::body::BodyStream;
use crate::media::{MediaType, MULTIPART_FORM_DATA};
use crate::request::BodyDecoder;
use crate::{Error, HttpError};
use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_DISPOSITION, CONTENT_TYPE};

/// Maximum number of headers of one part.
const MAX_PART_HEADERS: usize = 32;

/// One part of a `multipart/form-data` body.
#[derive(Debug, Clone)]
pub struct Part {
    name: String,
    filename: Option<String>,
    headers: HeaderMap,
    body: Bytes,
}

impl Part {
    /// The form field name, from `content-disposition`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The file name for file uploads.
    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    /// All headers of the part.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The part `content-type`, if given.
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }

    /// The part content.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// The body as a string, failing on invalid UTF-8.
    pub fn body_str(&self) -> Result<&str, Error> {
        std::str::from_utf8(&self.body)
            .map_err(|e| Error::User(format!("Part {} is not valid UTF-8: {}", self.name, e)))
    }
}

/// Decoder of `multipart/form-data` bodies.
#[derive(Debug, Clone, Copy, Default)]
pub struct Multipart;

impl BodyDecoder for Multipart {
    type Output = Vec<Part>;

    fn decode(
        &self,
        content_type: Option<MediaType>,
        body: BodyStream,
    ) -> Result<BoxFuture<'static, Result<Self::Output, Error>>, Error> {
        let content_type = match content_type {
            Some(ct) if ct.essence() == MULTIPART_FORM_DATA => ct,
            _ => return Err(HttpError::UnsupportedMediaType.into()),
        };

        let boundary = content_type
            .param("boundary")
            .filter(|b| !b.is_empty())
            .ok_or_else(|| HttpError::BadRequest("Missing multipart boundary".into()))?
            .to_string();

        Ok(Box::pin(async move {
            let bytes = body.collect().await?;
            let parts = parse(&bytes, &boundary)?;
            trace!("Decoded {} multipart parts", parts.len());
            Ok(parts)
        }))
    }
}

fn malformed(msg: &str) -> Error {
    HttpError::BadRequest(format!("Malformed multipart body: {}", msg)).into()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

pub(crate) fn parse(body: &Bytes, boundary: &str) -> Result<Vec<Part>, Error> {
    let delimiter = format!("--{}", boundary);
    let close = format!("\r\n--{}", boundary);

    // the preamble before the first delimiter is ignored.
    let start = find(body, delimiter.as_bytes()).ok_or_else(|| malformed("no boundary"))?;
    let mut pos = start + delimiter.len();

    let mut parts = vec![];

    loop {
        let rest = &body[pos..];

        if rest.starts_with(b"--") {
            return Ok(parts);
        }
        if !rest.starts_with(b"\r\n") {
            return Err(malformed("expected line break after boundary"));
        }
        pos += 2;

        let mut storage = [httparse::EMPTY_HEADER; MAX_PART_HEADERS];
        let parsed = httparse::parse_headers(&body[pos..], &mut storage)
            .map_err(|e| malformed(&e.to_string()))?;
        let (head_len, raw) = match parsed {
            httparse::Status::Complete(v) => v,
            httparse::Status::Partial => return Err(malformed("incomplete part headers")),
        };

        let mut headers = HeaderMap::with_capacity(raw.len());
        for h in raw {
            let name = HeaderName::from_bytes(h.name.as_bytes())
                .map_err(|_| malformed("invalid part header name"))?;
            let value =
                HeaderValue::from_bytes(h.value).map_err(|_| malformed("invalid part header value"))?;
            headers.append(name, value);
        }
        pos += head_len;

        let len = find(&body[pos..], close.as_bytes()).ok_or_else(|| malformed("unterminated part"))?;
        let data = body.slice(pos..pos + len);
        pos += len + close.len();

        let (name, filename) = disposition(&headers)?;

        parts.push(Part {
            name,
            filename,
            headers,
            body: data,
        });
    }
}

/// Field name and file name of `content-disposition: form-data`.
fn disposition(headers: &HeaderMap) -> Result<(String, Option<String>), Error> {
    let value = headers
        .get(CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| malformed("part without content-disposition"))?;

    let mut params = value.split(';').map(|p| p.trim());

    match params.next() {
        Some(kind) if kind.eq_ignore_ascii_case("form-data") => {}
        _ => return Err(malformed("part is not form-data")),
    }

    let mut name = None;
    let mut filename = None;

    for param in params {
        if let Some((k, v)) = param.split_once('=') {
            let v = v.trim().trim_matches('"').to_string();
            match k.trim().to_ascii_lowercase().as_str() {
                "name" => name = Some(v),
                "filename" => filename = Some(v),
                _ => {}
            }
        }
    }

    let name = name.ok_or_else(|| malformed("part without name"))?;

    Ok((name, filename))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body;

    const FORM: &str = "preamble\r\n\
        --XyZ\r\n\
        Content-Disposition: form-data; name=\"title\"\r\n\
        \r\n\
        hello\r\n\
        --XyZ\r\n\
        Content-Disposition: form-data; name=\"upload\"; filename=\"a.txt\"\r\n\
        Content-Type: text/plain\r\n\
        \r\n\
        line one\r\nline two\r\n\
        --XyZ--\r\n";

    #[test]
    fn parts_with_and_without_files() {
        let parts = parse(&Bytes::from_static(FORM.as_bytes()), "XyZ").unwrap();
        assert_eq!(parts.len(), 2);

        assert_eq!(parts[0].name(), "title");
        assert_eq!(parts[0].filename(), None);
        assert_eq!(parts[0].body_str().unwrap(), "hello");

        assert_eq!(parts[1].name(), "upload");
        assert_eq!(parts[1].filename(), Some("a.txt"));
        assert_eq!(parts[1].content_type(), Some("text/plain"));
        assert_eq!(parts[1].body_str().unwrap(), "line one\r\nline two");
    }

    #[test]
    fn unterminated_body_is_bad_request() {
        let body = Bytes::from_static(b"--XyZ\r\ncontent-disposition: form-data; name=\"a\"\r\n\r\nnever ends");
        match parse(&body, "XyZ") {
            Err(Error::Exchange(HttpError::BadRequest(_))) => {}
            r => panic!("unexpected: {:?}", r),
        }
    }

    #[async_std::test]
    async fn decode_from_body_stream() {
        let (mut tx, rx) = body::channel(4);
        let (a, b) = FORM.split_at(40);
        tx.try_send(a.to_string()).unwrap();
        tx.try_send(b.to_string()).unwrap();
        tx.finish();

        let ct = MediaType::parse("multipart/form-data; boundary=XyZ").unwrap();
        let parts = Multipart.decode(Some(ct), rx).unwrap().await.unwrap();
        assert_eq!(parts.len(), 2);
    }

    #[test]
    fn needs_multipart_with_boundary() {
        let json = MediaType::parse("application/json").unwrap();
        assert!(matches!(
            Multipart.decode(Some(json), BodyStream::empty()),
            Err(Error::Exchange(HttpError::UnsupportedMediaType))
        ));

        let no_boundary = MediaType::parse("multipart/form-data").unwrap();
        assert!(matches!(
            Multipart.decode(Some(no_boundary), BodyStream::empty()),
            Err(Error::Exchange(HttpError::BadRequest(_)))
        ));
    }
}
