use crate::body::{self, BodySender, BodyStream};
use crate::resource::{http_date, spawn_reader, Resource};
use crate::sse::{SseSender, SSE_CONTENT_TYPE};
use crate::{Error, HttpError};
use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::StatusCode;
use std::convert::TryFrom;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

pub(crate) struct HeaderState {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub trailers: HeaderMap,
    /// Set when the head is handed to the protocol adapter.
    pub written: bool,
    pub trailers_written: bool,
}

/// Response status, headers and trailers.
///
/// Cloneable so a handler can keep adjusting headers from a spawned task.
/// Every mutation fails once the headers are written.
#[derive(Clone)]
pub struct ResponseHeaders {
    inner: Arc<Mutex<HeaderState>>,
}

fn try_header<K, V>(name: K, value: V) -> Result<(HeaderName, HeaderValue), Error>
where
    HeaderName: TryFrom<K>,
    <HeaderName as TryFrom<K>>::Error: Into<http::Error>,
    HeaderValue: TryFrom<V>,
    <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
{
    let name = HeaderName::try_from(name).map_err(|e| Error::Http(e.into()))?;
    let value = HeaderValue::try_from(value).map_err(|e| Error::Http(e.into()))?;
    Ok((name, value))
}

impl ResponseHeaders {
    pub(crate) fn new() -> Self {
        ResponseHeaders {
            inner: Arc::new(Mutex::new(HeaderState {
                status: StatusCode::OK,
                headers: HeaderMap::new(),
                trailers: HeaderMap::new(),
                written: false,
                trailers_written: false,
            })),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, HeaderState> {
        match self.inner.lock() {
            Ok(l) => l,
            Err(p) => p.into_inner(),
        }
    }

    fn unwritten(&self) -> Result<MutexGuard<'_, HeaderState>, Error> {
        let lock = self.lock();
        if lock.written {
            return Err(Error::User("Headers already written".into()));
        }
        Ok(lock)
    }

    /// The status, 200 unless set.
    pub fn status(&self) -> StatusCode {
        self.lock().status
    }

    /// Fails once the headers are written.
    pub fn set_status(&self, status: StatusCode) -> Result<(), Error> {
        self.unwritten()?.status = status;
        Ok(())
    }

    /// Replace all values of a header.
    pub fn set<K, V>(&self, name: K, value: V) -> Result<(), Error>
    where
        HeaderName: TryFrom<K>,
        <HeaderName as TryFrom<K>>::Error: Into<http::Error>,
        HeaderValue: TryFrom<V>,
        <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
    {
        let (name, value) = try_header(name, value)?;
        self.unwritten()?.headers.insert(name, value);
        Ok(())
    }

    /// Add a value to a header.
    pub fn add<K, V>(&self, name: K, value: V) -> Result<(), Error>
    where
        HeaderName: TryFrom<K>,
        <HeaderName as TryFrom<K>>::Error: Into<http::Error>,
        HeaderValue: TryFrom<V>,
        <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
    {
        let (name, value) = try_header(name, value)?;
        self.unwritten()?.headers.append(name, value);
        Ok(())
    }

    /// Remove all values of a header.
    pub fn remove(&self, name: &str) -> Result<(), Error> {
        self.unwritten()?.headers.remove(name);
        Ok(())
    }

    /// First value of a header, if it is a string.
    pub fn get(&self, name: &str) -> Option<String> {
        self.lock()
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
    }

    /// Whether a header is set.
    pub fn contains(&self, name: &str) -> bool {
        self.lock().headers.contains_key(name)
    }

    /// Set `content-type`.
    pub fn content_type(&self, media_type: &str) -> Result<(), Error> {
        self.set(http::header::CONTENT_TYPE, media_type)
    }

    /// Add a `set-cookie` header.
    pub fn add_cookie(&self, cookie: &Cookie) -> Result<(), Error> {
        self.add(http::header::SET_COOKIE, cookie.to_string())
    }

    /// Set a trailer, sent after a streamed body. Allowed until the body ends.
    pub fn set_trailer<K, V>(&self, name: K, value: V) -> Result<(), Error>
    where
        HeaderName: TryFrom<K>,
        <HeaderName as TryFrom<K>>::Error: Into<http::Error>,
        HeaderValue: TryFrom<V>,
        <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
    {
        let (name, value) = try_header(name, value)?;
        let mut lock = self.lock();
        if lock.trailers_written {
            return Err(Error::User("Trailers already written".into()));
        }
        lock.trailers.insert(name, value);
        Ok(())
    }

    /// Whether the headers were written and can no longer change.
    pub fn is_written(&self) -> bool {
        self.lock().written
    }

    /// Mark as written and return what is to be sent.
    pub(crate) fn freeze(&self) -> (StatusCode, HeaderMap) {
        let mut lock = self.lock();
        lock.written = true;
        (lock.status, lock.headers.clone())
    }

    pub(crate) fn take_trailers(&self) -> Option<HeaderMap> {
        let mut lock = self.lock();
        lock.trailers_written = true;
        if lock.trailers.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut lock.trailers))
        }
    }
}

impl fmt::Debug for ResponseHeaders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lock = self.lock();
        f.debug_struct("ResponseHeaders")
            .field("status", &lock.status)
            .field("headers", &lock.headers)
            .field("written", &lock.written)
            .finish()
    }
}

/// A `set-cookie` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    name: String,
    value: String,
    path: Option<String>,
    domain: Option<String>,
    max_age: Option<i64>,
    secure: bool,
    http_only: bool,
    same_site: Option<String>,
}

impl Cookie {
    /// A session cookie without attributes.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Cookie {
            name: name.into(),
            value: value.into(),
            path: None,
            domain: None,
            max_age: None,
            secure: false,
            http_only: false,
            same_site: None,
        }
    }

    /// The `Path` attribute.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// The `Domain` attribute.
    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    /// Lifetime in seconds. Zero or less removes the cookie.
    pub fn max_age(mut self, seconds: i64) -> Self {
        self.max_age = Some(seconds);
        self
    }

    /// Only send the cookie over TLS.
    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Hide the cookie from scripts.
    pub fn http_only(mut self, http_only: bool) -> Self {
        self.http_only = http_only;
        self
    }

    /// `Strict`, `Lax` or `None`.
    pub fn same_site(mut self, same_site: impl Into<String>) -> Self {
        self.same_site = Some(same_site.into());
        self
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)?;
        if let Some(v) = &self.path {
            write!(f, "; Path={}", v)?;
        }
        if let Some(v) = &self.domain {
            write!(f, "; Domain={}", v)?;
        }
        if let Some(v) = self.max_age {
            write!(f, "; Max-Age={}", v)?;
        }
        if self.secure {
            write!(f, "; Secure")?;
        }
        if self.http_only {
            write!(f, "; HttpOnly")?;
        }
        if let Some(v) = &self.same_site {
            write!(f, "; SameSite={}", v)?;
        }
        Ok(())
    }
}

/// What the handler chose to send.
pub(crate) enum BodySlot {
    Unset,
    Empty,
    Single(Bytes),
    Stream(BodyStream),
    Sse(BodyStream),
}

/// The response of an exchange.
pub struct Response {
    headers: ResponseHeaders,
    body: BodySlot,
    bound: usize,
    /// The request is `HEAD`, the body is never sent.
    head_request: bool,
}

impl Response {
    pub(crate) fn new(headers: ResponseHeaders, bound: usize, head_request: bool) -> Self {
        Response {
            headers,
            body: BodySlot::Unset,
            bound,
            head_request,
        }
    }

    /// Status and headers, writable until the head is written.
    pub fn headers(&self) -> &ResponseHeaders {
        &self.headers
    }

    /// Shorthand for `headers().set_status()`.
    pub fn set_status(&self, status: StatusCode) -> Result<(), Error> {
        self.headers.set_status(status)
    }

    /// Set the body. Each response body can be set once.
    pub fn body(&mut self) -> ResponseBody<'_> {
        ResponseBody { response: self }
    }

    /// Whether a body was set.
    pub fn is_body_set(&self) -> bool {
        !matches!(self.body, BodySlot::Unset)
    }

    pub(crate) fn take_body(&mut self) -> BodySlot {
        std::mem::replace(&mut self.body, BodySlot::Unset)
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("headers", &self.headers)
            .field("body_set", &self.is_body_set())
            .finish()
    }
}

/// Setter for the response body.
#[derive(Debug)]
pub struct ResponseBody<'a> {
    response: &'a mut Response,
}

impl<'a> ResponseBody<'a> {
    fn post(self, slot: BodySlot) -> Result<(), Error> {
        if self.response.is_body_set() {
            return Err(Error::User("Response data already posted".into()));
        }
        self.response.body = slot;
        Ok(())
    }

    /// No body.
    pub fn empty(self) -> Result<(), Error> {
        self.post(BodySlot::Empty)
    }

    /// A body known up front.
    pub fn value(self, data: impl Into<Bytes>) -> Result<(), Error> {
        self.post(BodySlot::Single(data.into()))
    }

    /// A UTF-8 string body.
    pub fn string(self, data: impl Into<String>) -> Result<(), Error> {
        self.value(data.into())
    }

    /// A streamed body. Chunks are sent through the returned sender, which is
    /// typically moved into a spawned task.
    pub fn stream(self) -> Result<BodySender, Error> {
        let (tx, rx) = body::channel(self.response.bound);
        self.post(BodySlot::Stream(rx))?;
        Ok(tx)
    }

    /// A server-sent event stream.
    pub fn sse(self) -> Result<SseSender, Error> {
        if self.response.is_body_set() {
            return Err(Error::User("Response data already posted".into()));
        }
        self.response.headers.content_type(SSE_CONTENT_TYPE)?;
        let (tx, rx) = body::channel(self.response.bound);
        self.post(BodySlot::Sse(rx))?;
        Ok(SseSender::new(tx))
    }

    /// The content of a resource. Fills in `content-length`, `content-type`
    /// and `last-modified` unless already set. A missing resource is a 404.
    ///
    /// Only metadata is read here. The content is streamed from a thread of
    /// its own, and not read at all for `HEAD`.
    pub fn resource<R>(self, resource: R) -> Result<(), Error>
    where
        R: Resource + 'static,
    {
        if self.response.is_body_set() {
            return Err(Error::User("Response data already posted".into()));
        }
        if resource.exists() == Some(false) || resource.is_file() == Some(false) {
            return Err(HttpError::NotFound.into());
        }

        let headers = &self.response.headers;
        if !headers.contains("content-length") {
            if let Some(size) = resource.size() {
                headers.set(http::header::CONTENT_LENGTH, size.to_string())?;
            }
        }
        if !headers.contains("content-type") {
            if let Some(media_type) = resource.media_type() {
                headers.content_type(&media_type)?;
            }
        }
        if !headers.contains("last-modified") {
            if let Some(t) = resource.last_modified() {
                headers.set(http::header::LAST_MODIFIED, http_date(t))?;
            }
        }

        if self.response.head_request {
            trace!("Resource {:?} not read for HEAD", resource);
            return self.post(BodySlot::Empty);
        }

        let (tx, rx) = body::channel(self.response.bound);
        self.post(BodySlot::Stream(rx))?;
        spawn_reader(resource, tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::FileResource;
    use std::io::{self, Read};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::SystemTime;

    fn response(head_request: bool) -> Response {
        Response::new(ResponseHeaders::new(), 2, head_request)
    }

    #[test]
    fn headers_freeze_when_written() {
        let h = ResponseHeaders::new();
        h.set("x-a", "1").unwrap();
        h.set_status(StatusCode::CREATED).unwrap();

        let (status, map) = h.freeze();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(map.get("x-a").unwrap(), "1");

        match h.set("x-b", "2") {
            Err(Error::User(m)) => assert_eq!(m, "Headers already written"),
            r => panic!("unexpected: {:?}", r),
        }
        assert!(h.set_status(StatusCode::OK).is_err());

        // trailers stay open until the end of the body.
        h.set_trailer("x-sum", "7").unwrap();
        assert_eq!(h.take_trailers().unwrap().get("x-sum").unwrap(), "7");
        assert!(h.set_trailer("x-late", "1").is_err());
    }

    #[test]
    fn body_is_set_once() {
        let mut res = response(false);
        res.body().string("hello").unwrap();
        match res.body().empty() {
            Err(Error::User(m)) => assert_eq!(m, "Response data already posted"),
            r => panic!("unexpected: {:?}", r),
        }
    }

    #[test]
    fn sse_sets_content_type() {
        let mut res = response(false);
        let _tx = res.body().sse().unwrap();
        assert_eq!(
            res.headers().get("content-type").as_deref(),
            Some("text/event-stream;charset=utf-8")
        );
    }

    #[test]
    fn missing_resource_is_not_found() {
        let mut res = response(false);
        match res.body().resource(FileResource::new("/no/such/file.html")) {
            Err(Error::Exchange(HttpError::NotFound)) => {}
            r => panic!("unexpected: {:?}", r),
        }
        assert!(!res.is_body_set());
    }

    #[async_std::test]
    async fn resource_is_streamed_with_headers() {
        let path = std::env::temp_dir().join(format!("hreq_exchange_resource_{}.txt", std::process::id()));
        let content = "resource body ".repeat(3000);
        std::fs::write(&path, &content).unwrap();

        let mut res = response(false);
        res.body().resource(FileResource::new(&path)).unwrap();

        assert_eq!(
            res.headers().get("content-length"),
            Some(content.len().to_string())
        );
        assert_eq!(res.headers().get("content-type").as_deref(), Some("text/plain"));
        assert!(res.headers().contains("last-modified"));

        match res.take_body() {
            BodySlot::Stream(rx) => assert_eq!(rx.collect_string().await.unwrap(), content),
            _ => panic!("expected a streamed body"),
        }

        std::fs::remove_file(&path).ok();
    }

    #[derive(Debug)]
    struct Counted {
        opened: Arc<AtomicUsize>,
    }

    impl Resource for Counted {
        fn exists(&self) -> Option<bool> {
            Some(true)
        }

        fn size(&self) -> Option<u64> {
            Some(1234)
        }

        fn last_modified(&self) -> Option<SystemTime> {
            None
        }

        fn media_type(&self) -> Option<String> {
            None
        }

        fn open(&self) -> io::Result<Box<dyn Read + Send>> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(io::empty()))
        }
    }

    #[test]
    fn head_request_never_reads_resource() {
        let opened = Arc::new(AtomicUsize::new(0));
        let mut res = response(true);
        res.body()
            .resource(Counted {
                opened: opened.clone(),
            })
            .unwrap();

        assert_eq!(res.headers().get("content-length").as_deref(), Some("1234"));
        assert!(matches!(res.take_body(), BodySlot::Empty));
        assert_eq!(opened.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cookie_format() {
        let c = Cookie::new("id", "42").path("/").max_age(60).http_only(true);
        assert_eq!(c.to_string(), "id=42; Path=/; Max-Age=60; HttpOnly");
    }
}
