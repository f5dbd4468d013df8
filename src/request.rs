use crate::body::BodyStream;
use crate::media::{MediaType, APPLICATION_X_WWW_FORM_URLENCODED};
use crate::multipart::{Multipart, Part};
use crate::{Error, HttpError};
use futures_util::future::BoxFuture;
use http::header::{HeaderMap, HeaderValue};
use http::{Method, Uri, Version};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Identity of an exchange on its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeId {
    /// The `index`th request of an HTTP/1.x connection, counting from 0.
    Http1 {
        /// Connection number.
        connection: u64,
        /// Position in the pipeline.
        index: u64,
    },
    /// An HTTP/2 stream.
    Http2 {
        /// Connection number.
        connection: u64,
        /// Stream identifier.
        stream: u32,
    },
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeId::Http1 { connection, index } => write!(f, "h1:{}:{}", connection, index),
            ExchangeId::Http2 { connection, stream } => write!(f, "h2:{}:{}", connection, stream),
        }
    }
}

/// Decoded request head, shared between an exchange and its error exchange.
#[derive(Debug)]
pub(crate) struct RequestHead {
    pub id: ExchangeId,
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    /// Header blocks received after the head (HTTP/2 trailers, chunked trailers).
    pub trailers: Mutex<HeaderMap>,
}

impl RequestHead {
    pub fn new(id: ExchangeId, method: Method, uri: Uri, version: Version, headers: HeaderMap) -> Self {
        RequestHead {
            id,
            method,
            uri,
            version,
            headers,
            trailers: Mutex::new(HeaderMap::new()),
        }
    }

    pub fn merge_trailers(&self, more: HeaderMap) {
        let mut trailers = match self.trailers.lock() {
            Ok(t) => t,
            Err(p) => p.into_inner(),
        };
        let mut last = None;
        for (name, value) in more {
            if name.is_some() {
                last = name;
            }
            if let Some(name) = &last {
                trailers.append(name.clone(), value);
            }
        }
    }
}

/// The request of an exchange.
pub struct Request {
    head: Arc<RequestHead>,
    path_params: HashMap<String, String>,
    body: Option<BodyStream>,
}

impl Request {
    pub(crate) fn new(head: Arc<RequestHead>, body: Option<BodyStream>) -> Self {
        Request {
            head,
            path_params: HashMap::new(),
            body,
        }
    }

    /// Identity of the exchange on its connection.
    pub fn id(&self) -> ExchangeId {
        self.head.id
    }

    /// The request method.
    pub fn method(&self) -> &Method {
        &self.head.method
    }

    /// The request target as sent.
    pub fn uri(&self) -> &Uri {
        &self.head.uri
    }

    /// The raw request path.
    pub fn path(&self) -> &str {
        self.head.uri.path()
    }

    /// The raw query string.
    pub fn query(&self) -> Option<&str> {
        self.head.uri.query()
    }

    /// Decoded query parameters, in order.
    pub fn query_params(&self) -> Vec<(String, String)> {
        self.query()
            .map(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .into_owned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The protocol version.
    pub fn version(&self) -> Version {
        self.head.version
    }

    /// Headers of the request head.
    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    /// First value of a header as a string, looking in trailers received so far
    /// when it is absent from the head.
    pub fn header(&self, name: &str) -> Option<String> {
        if let Some(v) = self.head.headers.get(name) {
            return v.to_str().ok().map(|v| v.to_string());
        }
        self.trailer(name)
    }

    /// Header blocks merged in after the request head.
    pub fn trailers(&self) -> HeaderMap {
        match self.head.trailers.lock() {
            Ok(t) => t.clone(),
            Err(p) => p.into_inner().clone(),
        }
    }

    fn trailer(&self, name: &str) -> Option<String> {
        self.trailers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
    }

    /// The parsed `content-type`. `None` when absent or malformed.
    pub fn content_type(&self) -> Option<MediaType> {
        self.head
            .headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| MediaType::parse(v).ok())
    }

    /// All cookies of all `cookie` headers.
    pub fn cookies(&self) -> Vec<(String, String)> {
        self.head
            .headers
            .get_all(http::header::COOKIE)
            .iter()
            .filter_map(|v: &HeaderValue| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| {
                let (n, v) = pair.split_once('=')?;
                let n = n.trim();
                if n.is_empty() {
                    return None;
                }
                Some((n.to_string(), v.trim().trim_matches('"').to_string()))
            })
            .collect()
    }

    /// Value of the first cookie called `name`.
    pub fn cookie(&self, name: &str) -> Option<String> {
        self.cookies()
            .into_iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// A parameter captured by the matched path pattern.
    pub fn path_param(&self, name: &str) -> Option<&str> {
        self.path_params.get(name).map(|v| v.as_str())
    }

    /// Every parameter captured by the matched path pattern.
    pub fn path_params(&self) -> &HashMap<String, String> {
        &self.path_params
    }

    pub(crate) fn set_path_params(&mut self, params: HashMap<String, String>) {
        self.path_params = params;
    }

    /// Take the body. It can be taken once, `None` after that.
    pub fn take_body(&mut self) -> Option<BodyStream> {
        self.body.take()
    }

    /// Take the body and decode it with `decoder`.
    ///
    /// Fails if the body was already taken, by this or any other decoder.
    pub fn decode_body<D: BodyDecoder>(
        &mut self,
        decoder: &D,
    ) -> Result<BoxFuture<'static, Result<D::Output, Error>>, Error> {
        let content_type = self.content_type();
        let body = self
            .take_body()
            .ok_or_else(|| Error::User("Request body already consumed".into()))?;
        decoder.decode(content_type, body)
    }

    /// Decode an `application/x-www-form-urlencoded` body.
    pub fn form(&mut self) -> Result<BoxFuture<'static, Result<Vec<(String, String)>, Error>>, Error> {
        self.decode_body(&UrlEncoded)
    }

    /// Decode a `multipart/form-data` body.
    pub fn multipart(&mut self) -> Result<BoxFuture<'static, Result<Vec<Part>, Error>>, Error> {
        self.decode_body(&Multipart)
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.head.id)
            .field("method", &self.head.method)
            .field("uri", &self.head.uri)
            .field("version", &self.head.version)
            .finish()
    }
}

/// Decodes a request body of one media type.
///
/// [`UrlEncoded`] and [`Multipart`] are provided, other formats plug in here.
pub trait BodyDecoder {
    /// The decoded body.
    type Output: Send + 'static;

    /// Start decoding. Fails up front when the content type is not supported.
    fn decode(
        &self,
        content_type: Option<MediaType>,
        body: BodyStream,
    ) -> Result<BoxFuture<'static, Result<Self::Output, Error>>, Error>;
}

/// Decoder of `application/x-www-form-urlencoded` bodies.
#[derive(Debug, Clone, Copy, Default)]
pub struct UrlEncoded;

impl BodyDecoder for UrlEncoded {
    type Output = Vec<(String, String)>;

    fn decode(
        &self,
        content_type: Option<MediaType>,
        body: BodyStream,
    ) -> Result<BoxFuture<'static, Result<Self::Output, Error>>, Error> {
        if let Some(ct) = content_type {
            if ct.essence() != APPLICATION_X_WWW_FORM_URLENCODED {
                return Err(HttpError::UnsupportedMediaType.into());
            }
        }

        Ok(Box::pin(async move {
            let bytes = body.collect().await?;
            Ok(url::form_urlencoded::parse(&bytes).into_owned().collect())
        }))
    }
}
