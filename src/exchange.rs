//! Protocol independent request/response life cycle.
//!
//! A protocol adapter creates an `ExchangeCore` per request (HTTP/1.x) or
//! stream (HTTP/2), feeds it request body chunks, calls `start()` when the
//! exchange may respond, and then polls it for `ResponseEvent`s to frame on
//! the wire.
//!
//! How the response body was produced decides how it is framed:
//!
//! * no chunk at all is a *CompletedEmpty* response, sent as one message.
//! * a single value, or a stream that ends after its first chunk, is a
//!   *CompletedSingle* response, also sent as one message.
//! * anything else is *CompletedMulti*: the head goes first, then each chunk,
//!   then an end marker with optional trailers.

use crate::body::{self, BodySender, BodyStream};
use crate::compress::{self, Compressor, ContentEncoding};
use crate::request::{ExchangeId, Request, RequestHead};
use crate::response::{BodySlot, Response, ResponseHeaders};
use crate::{Error, HttpError, ServerConfig};
use bytes::Bytes;
use futures_util::ready;
use http::header::{self, HeaderMap, HeaderValue};
use http::{Method, StatusCode};
use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::task::{Context, Poll};

/// One request/response pair as seen by a handler.
#[derive(Debug)]
pub struct Exchange {
    request: Request,
    response: Response,
}

impl Exchange {
    pub(crate) fn new(request: Request, response: Response) -> Self {
        Exchange { request, response }
    }

    /// Identity of the exchange on its connection.
    pub fn id(&self) -> ExchangeId {
        self.request.id()
    }

    /// The request head, and its body until taken.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Mutable request, to take the body.
    pub fn request_mut(&mut self) -> &mut Request {
        &mut self.request
    }

    /// The response being built.
    pub fn response(&self) -> &Response {
        &self.response
    }

    /// Mutable response, to set the body.
    pub fn response_mut(&mut self) -> &mut Response {
        &mut self.response
    }
}

/// Handles exchanges.
///
/// Handlers run on the connection's task and must not block. Work that takes
/// time is handed off by streaming the response body from a spawned task.
pub trait ExchangeHandler: Send + Sync + 'static {
    /// Fill in the response. An error is re-dispatched to the error handler.
    fn handle(&self, exchange: &mut Exchange) -> Result<(), HttpError>;
}

impl<F> ExchangeHandler for F
where
    F: Fn(&mut Exchange) -> Result<(), HttpError> + Send + Sync + 'static,
{
    fn handle(&self, exchange: &mut Exchange) -> Result<(), HttpError> {
        (self)(exchange)
    }
}

/// An exchange that failed before its response head was written.
///
/// Carries the original request (without body), a fresh response and the failure.
#[derive(Debug)]
pub struct ErrorExchange {
    request: Request,
    response: Response,
    error: HttpError,
}

impl ErrorExchange {
    pub(crate) fn new(request: Request, response: Response, error: HttpError) -> Self {
        ErrorExchange {
            request,
            response,
            error,
        }
    }

    /// The failed request. Its body is gone.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// A fresh response for the error.
    pub fn response(&self) -> &Response {
        &self.response
    }

    /// Mutable response, to set the body.
    pub fn response_mut(&mut self) -> &mut Response {
        &mut self.response
    }

    /// What went wrong.
    pub fn error(&self) -> &HttpError {
        &self.error
    }
}

/// Handles failed exchanges.
pub trait ErrorExchangeHandler: Send + Sync + 'static {
    /// Answer the failure. An error here is answered with a bare 500.
    fn handle(&self, exchange: &mut ErrorExchange) -> Result<(), HttpError>;
}

impl<F> ErrorExchangeHandler for F
where
    F: Fn(&mut ErrorExchange) -> Result<(), HttpError> + Send + Sync + 'static,
{
    fn handle(&self, exchange: &mut ErrorExchange) -> Result<(), HttpError> {
        (self)(exchange)
    }
}

/// Writes the error status, an `allow` header for 405 and the message as text.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultErrorHandler;

impl ErrorExchangeHandler for DefaultErrorHandler {
    fn handle(&self, exchange: &mut ErrorExchange) -> Result<(), HttpError> {
        let status = exchange.error.status();
        let headers = exchange.response.headers();

        headers.set_status(status)?;

        if let HttpError::MethodNotAllowed(methods) = &exchange.error {
            let allow: Vec<_> = methods.iter().map(|m| m.as_str()).collect();
            headers.set(header::ALLOW, allow.join(", "))?;
        }

        headers.content_type("text/plain;charset=utf-8")?;
        let message = exchange.error.to_string();
        exchange.response.body().string(message)?;

        Ok(())
    }
}

/// What a connection serves: the root handler, the error handler and the configuration.
#[derive(Clone)]
pub struct Service {
    handler: Arc<dyn ExchangeHandler>,
    error_handler: Arc<dyn ErrorExchangeHandler>,
    config: Arc<ServerConfig>,
}

impl Service {
    /// Serve `handler` with the default error handler and configuration.
    pub fn new(handler: impl ExchangeHandler) -> Self {
        Service {
            handler: Arc::new(handler),
            error_handler: Arc::new(DefaultErrorHandler),
            config: Arc::new(ServerConfig::default()),
        }
    }

    /// Answer failures with `error_handler`, such as an [`ErrorRouter`](crate::routing::ErrorRouter).
    pub fn with_error_handler(mut self, error_handler: impl ErrorExchangeHandler) -> Self {
        self.error_handler = Arc::new(error_handler);
        self
    }

    /// Use `config`, after validating it.
    pub fn with_config(mut self, config: ServerConfig) -> Result<Self, Error> {
        config.validate()?;
        self.config = Arc::new(config);
        Ok(self)
    }

    /// The configuration connections are driven with.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service").field("config", &self.config).finish()
    }
}

/// Life cycle of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    /// Decoded, waiting to be started.
    Created,
    /// The handler is running.
    Dispatching,
    /// The response is being produced.
    ///
    /// A failure before the response head is written re-dispatches to the
    /// error handler with a fresh response, and the exchange stays here.
    Responding,
    /// Completed without a body.
    CompletedEmpty,
    /// Completed with the body in one piece.
    CompletedSingle,
    /// Completed with a streamed body.
    CompletedMulti,
    /// Failed after the response head was written. The head can't be taken
    /// back, so the response is cut short instead.
    Failed,
    /// Dropped by its connection before completing.
    Disposed,
}

impl ExchangeState {
    /// Whether the whole response was produced.
    pub fn is_completed(&self) -> bool {
        matches!(
            self,
            ExchangeState::CompletedEmpty
                | ExchangeState::CompletedSingle
                | ExchangeState::CompletedMulti
        )
    }

    /// No more response events will be produced.
    pub fn is_terminal(&self) -> bool {
        self.is_completed() || matches!(self, ExchangeState::Failed | ExchangeState::Disposed)
    }
}

#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

/// Output of an exchange towards its protocol adapter.
#[derive(Debug)]
pub(crate) enum ResponseEvent {
    /// The whole response: head and body (possibly empty) in one go.
    Full {
        head: ResponseHead,
        body: Bytes,
        trailers: Option<HeaderMap>,
    },
    /// Head of a streamed response.
    Head(ResponseHead),
    Chunk(Bytes),
    /// End of a streamed response.
    End(Option<HeaderMap>),
    /// Failure after the head was sent. The peer must learn that the
    /// response is broken.
    Abort(Error),
}

enum Source {
    None,
    Ready(Option<Bytes>),
    Stream(StreamSource),
}

struct StreamSource {
    rx: BodyStream,
    /// First chunk held back until it is known whether more follow.
    first: Option<Bytes>,
    streaming: bool,
    /// Event streams start streaming on the first chunk.
    sse: bool,
}

enum Step {
    Full(Bytes),
    Head(Vec<Bytes>),
    Chunk(Bytes),
    End,
    Abort(Error),
    Fail(HttpError),
}

/// Engine side of an exchange, owned by the protocol adapter.
pub(crate) struct ExchangeCore {
    head: Arc<RequestHead>,
    service: Service,
    state: ExchangeState,
    request_sink: Option<BodySender>,
    request_body: Option<BodyStream>,
    headers: ResponseHeaders,
    source: Source,
    pending: VecDeque<ResponseEvent>,
    encoding: Option<ContentEncoding>,
    compressor: Option<Box<dyn Compressor>>,
    error_dispatched: bool,
}

impl ExchangeCore {
    pub fn new(head: RequestHead, service: Service, has_body: bool) -> Self {
        let (request_sink, request_body) = if has_body {
            let (tx, rx) = body::channel(service.config.request_body_buffer);
            (Some(tx), rx)
        } else {
            (None, BodyStream::empty())
        };

        let encoding = if service.config.compression_enabled {
            let accept = head
                .headers
                .get(header::ACCEPT_ENCODING)
                .and_then(|v| v.to_str().ok());
            compress::resolve(accept, &service.config.encodings())
        } else {
            None
        };

        trace!("Exchange created: {} {} {}", head.id, head.method, head.uri);

        ExchangeCore {
            head: Arc::new(head),
            service,
            state: ExchangeState::Created,
            request_sink,
            request_body: Some(request_body),
            headers: ResponseHeaders::new(),
            source: Source::None,
            pending: VecDeque::new(),
            encoding,
            compressor: None,
            error_dispatched: false,
        }
    }

    pub fn id(&self) -> ExchangeId {
        self.head.id
    }

    pub fn state(&self) -> ExchangeState {
        self.state
    }

    pub fn is_head_request(&self) -> bool {
        self.head.method == Method::HEAD
    }

    pub fn version(&self) -> http::Version {
        self.head.version
    }

    pub fn request_headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    // ---------------------------------------------------------- request body

    /// Ready when the request body sink can take another chunk. Also ready when
    /// the sink is gone, in which case pushed chunks are discarded.
    pub fn poll_body_ready(&mut self, cx: &mut Context) -> Poll<()> {
        match self.request_sink.as_mut() {
            Some(sink) => {
                // an error means the handler side is gone, discard from now on.
                let _ = ready!(sink.poll_ready(cx));
                ().into()
            }
            None => ().into(),
        }
    }

    /// Push a request body chunk. Call after `poll_body_ready`.
    pub fn push_body(&mut self, chunk: Bytes) {
        if let Some(sink) = self.request_sink.as_mut() {
            if sink.try_send(chunk).is_err() {
                trace!("Discard request body chunk: {}", self.head.id);
            }
        }
    }

    /// Push a request body chunk regardless of credit. Used when the protocol
    /// has its own flow control bounding the buffered amount.
    ///
    /// Returns false if the chunk was discarded.
    pub fn force_push_body(&mut self, chunk: Bytes) -> bool {
        if let Some(sink) = self.request_sink.as_mut() {
            if sink.force_send(chunk) {
                return true;
            }
        }
        trace!("Discard request body chunk: {}", self.head.id);
        false
    }

    pub fn end_body(&mut self) {
        if let Some(mut sink) = self.request_sink.take() {
            sink.end();
        }
    }

    /// The request body was cut short (connection closed, stream reset).
    pub fn fail_body(&mut self, error: Error) {
        if let Some(mut sink) = self.request_sink.take() {
            sink.fail(error);
        }
    }

    pub fn is_body_ended(&self) -> bool {
        self.request_sink.is_none()
    }

    /// Request body bytes the handler consumed since the last call.
    pub fn poll_body_consumed(&mut self, cx: &mut Context) -> Poll<usize> {
        match self.request_sink.as_mut() {
            Some(sink) => sink.poll_consumed(cx),
            None => Poll::Pending,
        }
    }

    /// Merge a header block received after the request head.
    pub fn merge_trailers(&mut self, trailers: HeaderMap) {
        self.head.merge_trailers(trailers);
    }

    // ---------------------------------------------------------- dispatch

    /// Dispatch to the handler. The exchange starts responding on return.
    pub fn start(&mut self) {
        if self.state != ExchangeState::Created {
            return;
        }
        self.state = ExchangeState::Dispatching;

        let body = self.request_body.take();
        let headers = ResponseHeaders::new();
        let bound = self.service.config.response_body_buffer;

        let mut exchange = Exchange::new(
            Request::new(self.head.clone(), body),
            Response::new(headers.clone(), bound, self.is_head_request()),
        );

        let handler = self.service.handler.clone();
        let result = catch_unwind(AssertUnwindSafe(|| handler.handle(&mut exchange)))
            .unwrap_or_else(|panic| {
                let msg = panic_message(panic);
                warn!("Handler panicked: {}: {}", self.head.id, msg);
                Err(HttpError::InternalServerError(msg))
            });

        match result {
            Ok(()) => {
                let body = exchange.response.take_body();
                self.respond(headers, body);
            }
            Err(e) => self.dispatch_error(e),
        }
    }

    fn respond(&mut self, headers: ResponseHeaders, body: BodySlot) {
        self.headers = headers;
        self.source = match body {
            BodySlot::Unset | BodySlot::Empty => Source::Ready(None),
            BodySlot::Single(b) => Source::Ready(Some(b)),
            BodySlot::Stream(rx) => Source::Stream(StreamSource {
                rx,
                first: None,
                streaming: false,
                sse: false,
            }),
            BodySlot::Sse(rx) => Source::Stream(StreamSource {
                rx,
                first: None,
                streaming: false,
                sse: true,
            }),
        };
        self.state = ExchangeState::Responding;
    }

    /// Re-dispatch to the error handler with a fresh response. A failing error
    /// handler yields a bare 500.
    fn dispatch_error(&mut self, error: HttpError) {
        debug!("Exchange failed: {}: {}", self.head.id, error);

        self.release_source();

        if self.error_dispatched {
            warn!("Error handler failed: {}: {}", self.head.id, error);
            self.respond_bare_500();
            return;
        }
        self.error_dispatched = true;

        let headers = ResponseHeaders::new();
        let bound = self.service.config.response_body_buffer;
        let mut exchange = ErrorExchange::new(
            Request::new(self.head.clone(), None),
            Response::new(headers.clone(), bound, self.is_head_request()),
            error,
        );

        let handler = self.service.error_handler.clone();
        let result = catch_unwind(AssertUnwindSafe(|| handler.handle(&mut exchange)))
            .unwrap_or_else(|panic| Err(HttpError::InternalServerError(panic_message(panic))));

        match result {
            Ok(()) => {
                let body = exchange.response.take_body();
                self.respond(headers, body);
            }
            Err(e) => {
                warn!("Error handler failed: {}: {}", self.head.id, e);
                self.respond_bare_500();
            }
        }
    }

    fn respond_bare_500(&mut self) {
        let headers = ResponseHeaders::new();
        // invariant: fresh headers are never written.
        let _ = headers.set_status(StatusCode::INTERNAL_SERVER_ERROR);
        self.encoding = None;
        self.respond(headers, BodySlot::Empty);
    }

    // ---------------------------------------------------------- response

    /// Next response event. `None` once the exchange is completed, failed or disposed.
    pub fn poll_event(&mut self, cx: &mut Context) -> Poll<Option<ResponseEvent>> {
        loop {
            if let Some(ev) = self.pending.pop_front() {
                return Some(ev).into();
            }

            match self.state {
                ExchangeState::Created | ExchangeState::Dispatching => return Poll::Pending,
                ExchangeState::Responding => {}
                _ => return None.into(),
            }

            let step = match &mut self.source {
                Source::None => return None.into(),
                Source::Ready(body) => Step::Full(body.take().unwrap_or_default()),
                Source::Stream(s) => match ready!(s.rx.poll_chunk(cx)) {
                    Some(Ok(chunk)) if chunk.is_empty() => continue,
                    Some(Ok(chunk)) => {
                        if s.streaming {
                            Step::Chunk(chunk)
                        } else if s.sse {
                            s.streaming = true;
                            Step::Head(vec![chunk])
                        } else if let Some(first) = s.first.take() {
                            s.streaming = true;
                            Step::Head(vec![first, chunk])
                        } else {
                            s.first = Some(chunk);
                            continue;
                        }
                    }
                    Some(Err(e)) => {
                        if s.streaming {
                            Step::Abort(e)
                        } else {
                            Step::Fail(e.into_http())
                        }
                    }
                    None => {
                        if s.streaming {
                            Step::End
                        } else {
                            Step::Full(s.first.take().unwrap_or_default())
                        }
                    }
                },
            };

            match step {
                Step::Full(body) => self.complete_full(body),
                Step::Head(chunks) => {
                    let head = self.write_head(true);
                    self.pending.push_back(ResponseEvent::Head(head));
                    for chunk in chunks {
                        self.queue_chunk(chunk);
                    }
                }
                Step::Chunk(chunk) => self.queue_chunk(chunk),
                Step::End => self.complete_multi(),
                Step::Abort(e) => self.abort(e),
                Step::Fail(e) => self.dispatch_error(e),
            }
        }
    }

    fn complete_full(&mut self, body: Bytes) {
        let encoding = self.body_encoding(!body.is_empty());

        let body = match encoding.and_then(|e| compress::compressor(e, self.service.config.compression_level)) {
            Some(mut c) => {
                let mut out = Vec::with_capacity(body.len() / 2);
                let r = c.compress(&body, &mut out).and_then(|_| c.finish(&mut out));
                if let Err(e) = r {
                    // head not written yet, this can still become an error response.
                    self.dispatch_error(HttpError::InternalServerError(e.to_string()));
                    return;
                }
                out.into()
            }
            None => body,
        };

        let head = self.freeze_head(encoding);
        let trailers = self.headers.take_trailers();

        self.state = if body.is_empty() {
            ExchangeState::CompletedEmpty
        } else {
            ExchangeState::CompletedSingle
        };
        self.source = Source::None;

        trace!("Exchange complete: {} {:?}", self.head.id, self.state);

        self.pending.push_back(ResponseEvent::Full {
            head,
            body,
            trailers,
        });
    }

    fn write_head(&mut self, has_body: bool) -> ResponseHead {
        let encoding = self.body_encoding(has_body);
        if let Some(enc) = encoding {
            self.compressor = compress::compressor(enc, self.service.config.compression_level);
        }
        self.freeze_head(encoding)
    }

    /// Whether the body is to be compressed, and how.
    fn body_encoding(&self, has_body: bool) -> Option<ContentEncoding> {
        let encoding = self.encoding?;
        if !has_body || self.is_head_request() {
            return None;
        }

        let state = self.headers.lock();
        let status = state.status;
        let no_body = status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED;
        if no_body || state.headers.contains_key(header::CONTENT_ENCODING) {
            return None;
        }

        Some(encoding)
    }

    fn freeze_head(&mut self, encoding: Option<ContentEncoding>) -> ResponseHead {
        let (status, mut headers) = self.headers.freeze();

        if let Some(enc) = encoding {
            headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static(enc.as_token()));
            headers.remove(header::CONTENT_LENGTH);
            headers.append(header::VARY, HeaderValue::from_static("accept-encoding"));
        }

        debug!("Response head: {} {} {:?}", self.head.id, status, headers);

        ResponseHead { status, headers }
    }

    fn queue_chunk(&mut self, chunk: Bytes) {
        let chunk = match self.compressor.as_mut() {
            Some(c) => {
                let mut out = Vec::with_capacity(chunk.len());
                if let Err(e) = c.compress(&chunk, &mut out) {
                    self.abort(e.into());
                    return;
                }
                if out.is_empty() {
                    return;
                }
                out.into()
            }
            None => chunk,
        };
        self.pending.push_back(ResponseEvent::Chunk(chunk));
    }

    fn complete_multi(&mut self) {
        if let Some(mut c) = self.compressor.take() {
            let mut out = vec![];
            if let Err(e) = c.finish(&mut out) {
                self.abort(e.into());
                return;
            }
            if !out.is_empty() {
                self.pending.push_back(ResponseEvent::Chunk(out.into()));
            }
        }

        let trailers = self.headers.take_trailers();
        self.pending.push_back(ResponseEvent::End(trailers));
        self.state = ExchangeState::CompletedMulti;
        self.source = Source::None;

        trace!("Exchange complete: {} {:?}", self.head.id, self.state);
    }

    fn abort(&mut self, error: Error) {
        warn!("Exchange failed after head was written: {}: {}", self.head.id, error);
        self.release_source();
        self.compressor = None;
        self.pending.push_back(ResponseEvent::Abort(error));
        self.state = ExchangeState::Failed;
    }

    fn release_source(&mut self) -> usize {
        match std::mem::replace(&mut self.source, Source::None) {
            Source::Stream(mut s) => s.rx.dispose() + s.first.take().map(|_| 1).unwrap_or(0),
            _ => 0,
        }
    }

    /// Abandon the exchange. Releases every buffered request body chunk and any
    /// queued response data. Returns the number of chunks released.
    pub fn dispose(&mut self) -> usize {
        let mut released = 0;

        if let Some(sink) = self.request_sink.as_mut() {
            released += sink.dispose();
        }
        self.request_sink = None;
        if let Some(mut body) = self.request_body.take() {
            released += body.dispose();
        }
        released += self.release_source();
        self.pending.clear();
        self.compressor = None;

        if self.state != ExchangeState::Disposed {
            trace!("Exchange disposed: {} released: {}", self.head.id, released);
        }
        self.state = ExchangeState::Disposed;

        released
    }
}

impl Drop for ExchangeCore {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            self.dispose();
        }
    }
}

impl fmt::Debug for ExchangeCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeCore")
            .field("id", &self.head.id)
            .field("state", &self.state)
            .finish()
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "Handler panicked".to_string()
    }
}
