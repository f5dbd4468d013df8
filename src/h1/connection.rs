use super::chunked::ChunkedEncoder;
use super::http11::{write_http1x_res, Decoder, Frame, RequestFrame};
use super::limit::{allow_reuse, get_as, set_header, LimitWrite};
use crate::exchange::{ExchangeCore, ExchangeState, ResponseEvent, ResponseHead, Service};
use crate::request::{ExchangeId, RequestHead};
use crate::server::MAX_BUFFERED_OUTPUT;
use crate::{DecodeError, Error};
use bytes::BytesMut;
use http::header::{self, HeaderMap, HeaderValue};
use http::{StatusCode, Version};
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::task::{Context, Poll};

/// Requests decoded ahead of the responding one before reading pauses.
const MAX_PIPELINED: usize = 32;

struct Pipelined {
    core: ExchangeCore,
    version: Version,
    keep_alive: bool,
}

enum Outcome {
    Continue,
    /// The response can't be completed, the connection must close.
    Close,
}

/// One HTTP/1.x connection, without the IO.
///
/// Fed with received bytes, appends response bytes to an output buffer.
pub(crate) struct Connection {
    id: u64,
    service: Service,
    decoder: Decoder,
    /// Pipeline in arrival order. The front exchange is the responding one.
    queue: VecDeque<Pipelined>,
    /// The last exchange in the queue is receiving its request body.
    requesting: bool,
    /// Framing of the streamed response being written.
    writing: Option<LimitWrite>,
    next_index: u64,
    /// Decoding failed. Answered once the exchanges before it are through.
    failed: Option<DecodeError>,
    /// No more requests are read.
    closing: bool,
    /// Decoding waits for body credit or for the pipeline to shrink.
    blocked: bool,
    eof: bool,
    done: bool,
    /// Why the connection ended early.
    error: Option<Error>,
}

impl Connection {
    pub fn new(id: u64, service: Service) -> Self {
        let decoder = Decoder::new(service.config());
        Connection {
            id,
            service,
            decoder,
            queue: VecDeque::new(),
            requesting: false,
            writing: None,
            next_index: 0,
            failed: None,
            closing: false,
            blocked: false,
            eof: false,
            done: false,
            error: None,
        }
    }

    /// Make as much progress as possible on received input and on the
    /// responding exchange.
    pub fn poll_drive(
        &mut self,
        cx: &mut Context,
        input: &mut BytesMut,
        out: &mut Vec<u8>,
    ) -> Result<(), Error> {
        loop {
            let received = self.recv(cx, input);
            let sent = self.send(cx, out)?;

            if self.done || !(received || sent) {
                return Ok(());
            }
        }
    }

    /// The peer will send no more.
    pub fn recv_eof(&mut self) {
        trace!("Read eof h1:{}", self.id);
        self.eof = true;

        if self.requesting {
            self.requesting = false;
            if let Some(back) = self.queue.back_mut() {
                let e = io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "Connection closed before end of request body",
                );
                back.core.fail_body(e.into());
            }
        }
    }

    pub fn wants_read(&self) -> bool {
        !self.done
            && !self.eof
            && !self.blocked
            && self.failed.is_none()
            && !(self.closing && self.decoder.is_idle())
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// The decode error that ended the connection, if any.
    pub fn take_error(&mut self) -> Option<Error> {
        self.error.take()
    }

    /// Abandon every queued exchange.
    pub fn dispose(&mut self) {
        for mut entry in self.queue.drain(..) {
            entry.core.dispose();
        }
        self.requesting = false;
        self.done = true;
    }

    fn recv(&mut self, cx: &mut Context, input: &mut BytesMut) -> bool {
        let mut progress = false;
        self.blocked = false;

        loop {
            if self.done || self.failed.is_some() {
                return progress;
            }

            if self.decoder.is_idle() {
                if self.closing {
                    return progress;
                }
                if self.queue.len() >= MAX_PIPELINED {
                    trace!("Pipeline full h1:{}", self.id);
                    self.blocked = true;
                    return progress;
                }
            } else if self.requesting {
                if let Some(back) = self.queue.back_mut() {
                    if back.core.poll_body_ready(cx).is_pending() {
                        trace!("Request body backpressure: {}", back.core.id());
                        self.blocked = true;
                        return progress;
                    }
                }
            }

            let frame = match self.decoder.decode(input) {
                Ok(Some(frame)) => frame,
                Ok(None) => return progress,
                Err(e) => {
                    debug!("Decode failed h1:{}: {}", self.id, e);
                    if self.requesting {
                        self.requesting = false;
                        if let Some(back) = self.queue.back_mut() {
                            back.core.fail_body(Error::Decode(e.clone()));
                        }
                    }
                    self.failed = Some(e);
                    input.clear();
                    return true;
                }
            };
            progress = true;

            match frame {
                Frame::Head(req) => self.on_head(req),

                Frame::Data(data) => match self.queue.back_mut() {
                    Some(back) if self.requesting => back.core.push_body(data),
                    _ => trace!("Discard late body data: {}", data.len()),
                },

                Frame::End(trailers) => {
                    if self.requesting {
                        if let Some(back) = self.queue.back_mut() {
                            if let Some(trailers) = trailers {
                                back.core.merge_trailers(trailers);
                            }
                            back.core.end_body();
                        }
                    }
                    self.requesting = false;
                }
            }
        }
    }

    fn on_head(&mut self, req: RequestFrame) {
        let keep_alive = allow_reuse(&req.headers, req.version);

        let id = ExchangeId::Http1 {
            connection: self.id,
            index: self.next_index,
        };
        self.next_index += 1;

        let version = req.version;
        let has_body = req.has_body;
        let head = RequestHead::new(id, req.method, req.uri, req.version, req.headers);
        let core = ExchangeCore::new(head, self.service.clone(), has_body);

        self.requesting = has_body;
        if !keep_alive {
            trace!("Connection closes after: {}", id);
            self.closing = true;
        }

        self.queue.push_back(Pipelined {
            core,
            version,
            keep_alive,
        });

        if self.queue.len() == 1 {
            if let Some(front) = self.queue.front_mut() {
                front.core.start();
            }
        }
    }

    fn send(&mut self, cx: &mut Context, out: &mut Vec<u8>) -> Result<bool, Error> {
        let mut progress = false;

        loop {
            if self.done || out.len() >= MAX_BUFFERED_OUTPUT {
                return Ok(progress);
            }

            let front = match self.queue.front_mut() {
                Some(front) => front,
                None => {
                    if let Some(e) = self.failed.take() {
                        write_decode_error(&e, out)?;
                        self.error = Some(Error::Decode(e));
                        self.done = true;
                        return Ok(true);
                    }
                    if self.closing || self.eof {
                        self.done = true;
                        return Ok(true);
                    }
                    return Ok(progress);
                }
            };

            let event = match front.core.poll_event(cx) {
                Poll::Pending => return Ok(progress),
                Poll::Ready(event) => event,
            };
            progress = true;

            if let Some(event) = event {
                if let Outcome::Close = encode(front, &mut self.writing, event, out)? {
                    self.done = true;
                }
                continue;
            }

            // completed, failed or disposed.
            if let Some(mut entry) = self.queue.pop_front() {
                if self.queue.is_empty() && self.requesting {
                    // the rest of its body is read and dropped.
                    self.requesting = false;
                }
                let released = entry.core.dispose();
                if released > 0 {
                    trace!("Released unread request body chunks: {}", released);
                }
                self.writing = None;

                if !entry.keep_alive || entry.core.state() == ExchangeState::Failed {
                    self.done = true;
                    return Ok(true);
                }
            }

            if let Some(next) = self.queue.front_mut() {
                next.core.start();
            }
        }
    }
}

fn no_body_status(status: StatusCode) -> bool {
    // https://tools.ietf.org/html/rfc7230#page-31
    // any response with a 1xx (Informational), 204 (No Content), or
    // 304 (Not Modified) status code is always terminated by the first
    // empty line after the header fields, regardless of the header fields
    // present in the message, and thus cannot contain a message body.
    status.is_informational() || status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED
}

fn set_connection(headers: &mut HeaderMap, entry: &Pipelined) {
    if !entry.keep_alive {
        set_header(headers, "connection", "close");
    } else if entry.version == Version::HTTP_10 {
        set_header(headers, "connection", "keep-alive");
    }
}

/// Frame one response event onto the wire.
fn encode(
    entry: &mut Pipelined,
    writing: &mut Option<LimitWrite>,
    event: ResponseEvent,
    out: &mut Vec<u8>,
) -> Result<Outcome, Error> {
    let is_head = entry.core.is_head_request();

    match event {
        ResponseEvent::Full {
            mut head,
            body,
            trailers,
        } => {
            let no_body = is_head || no_body_status(head.status);
            head.headers.remove(header::TRANSFER_ENCODING);

            let chunked = trailers.is_some() && !no_body && entry.version == Version::HTTP_11;

            if chunked {
                head.headers.remove(header::CONTENT_LENGTH);
                set_header(&mut head.headers, "transfer-encoding", "chunked");
            } else if head.status.is_informational() || head.status == StatusCode::NO_CONTENT {
                head.headers.remove(header::CONTENT_LENGTH);
            } else if head.status != StatusCode::NOT_MODIFIED
                && !(is_head && body.is_empty() && head.headers.contains_key(header::CONTENT_LENGTH))
            {
                head.headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
            }

            set_connection(&mut head.headers, entry);
            write_http1x_res(entry.version, &head, out)?;

            if chunked {
                ChunkedEncoder::write_chunk(&body, out)?;
                ChunkedEncoder::write_finish(trailers.as_ref(), out)?;
            } else if !no_body {
                out.extend_from_slice(&body);
            }
        }

        ResponseEvent::Head(mut head) => {
            head.headers.remove(header::TRANSFER_ENCODING);

            let limit = if is_head || no_body_status(head.status) {
                LimitWrite::NoBody
            } else if let Some(len) = get_as::<u64>(&head.headers, "content-length") {
                LimitWrite::content_length(len)
            } else if entry.version == Version::HTTP_11 {
                set_header(&mut head.headers, "transfer-encoding", "chunked");
                LimitWrite::ChunkedEncoder
            } else {
                // https://tools.ietf.org/html/rfc1945#section-7.2.2
                // the body length is determined by the closing of the connection.
                LimitWrite::ReadToEnd
            };

            if !limit.is_reusable() {
                entry.keep_alive = false;
            }

            trace!("Response body framing {}: {:?}", entry.core.id(), limit);

            set_connection(&mut head.headers, entry);
            write_http1x_res(entry.version, &head, out)?;
            *writing = Some(limit);
        }

        ResponseEvent::Chunk(data) => {
            if let Some(limit) = writing.as_mut() {
                if let Err(e) = limit.write(&data, out) {
                    warn!("Response body of {} broken: {}", entry.core.id(), e);
                    return Ok(Outcome::Close);
                }
            }
        }

        ResponseEvent::End(trailers) => {
            if let Some(limit) = writing.as_mut() {
                if let Err(e) = limit.finish(trailers.as_ref(), out) {
                    warn!("Response body of {} broken: {}", entry.core.id(), e);
                    return Ok(Outcome::Close);
                }
            }
        }

        ResponseEvent::Abort(e) => {
            // The head is out, closing is the only way to tell the client.
            warn!("Response of {} aborted: {}", entry.core.id(), e);
            return Ok(Outcome::Close);
        }
    }

    Ok(Outcome::Continue)
}

fn write_decode_error(e: &DecodeError, out: &mut Vec<u8>) -> Result<(), Error> {
    let body = e.to_string();

    let mut headers = HeaderMap::new();
    set_header(&mut headers, "content-type", "text/plain;charset=utf-8");
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
    set_header(&mut headers, "connection", "close");

    let head = ResponseHead {
        status: e.status(),
        headers,
    };

    write_http1x_res(Version::HTTP_11, &head, out)?;
    out.extend_from_slice(body.as_bytes());

    Ok(())
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("h1::Connection")
            .field("id", &self.id)
            .field("queue", &self.queue.len())
            .field("requesting", &self.requesting)
            .field("done", &self.done)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::BodySender;
    use crate::exchange::Exchange;
    use crate::HttpError;
    use futures_util::task::noop_waker;
    use std::sync::{Arc, Mutex};

    struct Harness {
        conn: Connection,
        input: BytesMut,
        out: Vec<u8>,
    }

    impl Harness {
        fn new(service: Service) -> Self {
            Harness {
                conn: Connection::new(1, service),
                input: BytesMut::new(),
                out: vec![],
            }
        }

        fn feed(&mut self, data: &[u8]) -> String {
            self.input.extend_from_slice(data);
            self.drive()
        }

        fn drive(&mut self) -> String {
            let waker = noop_waker();
            let mut cx = Context::from_waker(&waker);
            self.conn
                .poll_drive(&mut cx, &mut self.input, &mut self.out)
                .unwrap();
            let s = String::from_utf8_lossy(&self.out).to_string();
            self.out.clear();
            s
        }
    }

    fn hello(ex: &mut Exchange) -> Result<(), HttpError> {
        let text = format!("hello {}", ex.request().path());
        ex.response_mut().body().string(text)?;
        Ok(())
    }

    #[test]
    fn single_body_has_content_length() {
        let mut h = Harness::new(Service::new(hello));
        let out = h.feed(b"GET /x HTTP/1.1\r\n\r\n");
        assert_eq!(out, "HTTP/1.1 200 OK\r\ncontent-length: 8\r\n\r\nhello /x");
        assert!(!h.conn.is_done());
        assert!(h.conn.wants_read());
    }

    #[test]
    fn head_request_has_no_body_bytes() {
        let mut h = Harness::new(Service::new(hello));
        let out = h.feed(b"HEAD /x HTTP/1.1\r\n\r\n");
        assert_eq!(out, "HTTP/1.1 200 OK\r\ncontent-length: 8\r\n\r\n");
    }

    #[test]
    fn multi_body_is_chunked_on_11_and_closes_on_10() {
        let service = Service::new(|ex: &mut Exchange| -> Result<(), HttpError> {
            let mut tx = ex.response_mut().body().stream()?;
            tx.try_send("ab")?;
            tx.try_send("c")?;
            Ok(())
        });

        let mut h = Harness::new(service.clone());
        let out = h.feed(b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(
            out,
            "HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n2\r\nab\r\n1\r\nc\r\n0\r\n\r\n"
        );
        assert!(!h.conn.is_done());

        let mut h = Harness::new(service);
        let out = h.feed(b"GET / HTTP/1.0\r\nconnection: keep-alive\r\n\r\n");
        assert_eq!(out, "HTTP/1.0 200 OK\r\nconnection: close\r\n\r\nabc");
        assert!(h.conn.is_done());
    }

    #[test]
    fn responses_follow_request_order() {
        let slow: Arc<Mutex<Option<BodySender>>> = Arc::new(Mutex::new(None));
        let slow2 = slow.clone();

        let service = Service::new(move |ex: &mut Exchange| -> Result<(), HttpError> {
            if ex.request().path() == "/a" {
                let tx = ex.response_mut().body().stream()?;
                *slow2.lock().unwrap() = Some(tx);
            } else {
                ex.response_mut().body().string("b")?;
            }
            Ok(())
        });

        let mut h = Harness::new(service);
        let out = h.feed(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n");
        assert_eq!(out, "");

        let mut tx = slow.lock().unwrap().take().unwrap();
        tx.try_send("a").unwrap();
        tx.finish();

        let out = h.drive();
        let a = out.find("\r\n\r\na").unwrap();
        let b = out.find("\r\n\r\nb").unwrap();
        assert!(a < b, "{}", out);
    }

    #[test]
    fn connection_close_ends_after_response() {
        let mut h = Harness::new(Service::new(hello));
        let out = h.feed(b"GET /x HTTP/1.1\r\nconnection: close\r\n\r\nGET /y HTTP/1.1\r\n\r\n");
        assert_eq!(out, "HTTP/1.1 200 OK\r\ncontent-length: 8\r\nconnection: close\r\n\r\nhello /x");
        assert!(h.conn.is_done());
    }

    #[test]
    fn decode_error_is_answered_after_earlier_responses() {
        let mut h = Harness::new(Service::new(hello));
        let out = h.feed(b"GET /x HTTP/1.1\r\n\r\nGET / HTTP/1.1\r\nbad header\r\n\r\n");
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"), "{}", out);
        assert!(out.contains("HTTP/1.1 400 Bad Request\r\n"), "{}", out);
        assert!(h.conn.is_done());
        assert!(matches!(h.conn.take_error(), Some(Error::Decode(DecodeError::Malformed(_)))));
    }

    #[test]
    fn request_body_reaches_handler_with_backpressure() {
        let held = Arc::new(Mutex::new(None));
        let held2 = held.clone();

        let service = Service::new(move |ex: &mut Exchange| -> Result<(), HttpError> {
            let body = ex.request_mut().take_body();
            // the response stays open while the test reads the body.
            let tx = ex.response_mut().body().stream()?;
            *held2.lock().unwrap() = Some((body, tx));
            Ok(())
        });
        let mut config = crate::ServerConfig::default();
        config.request_body_buffer = 1;
        let service = service.with_config(config).unwrap();

        let mut h = Harness::new(service);
        h.feed(b"POST / HTTP/1.1\r\ntransfer-encoding: chunked\r\n\r\n1\r\na\r\n");

        // "a" is unread, no credit for more.
        assert!(!h.conn.wants_read());
        h.feed(b"1\r\nb\r\n0\r\n\r\n");
        assert!(!h.input.is_empty());

        let (body, _tx) = held.lock().unwrap().take().unwrap();
        let mut rx = body.unwrap();

        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let mut next = |h: &mut Harness| {
            let chunk = match rx.poll_chunk(&mut cx) {
                Poll::Ready(Some(Ok(c))) => Some(c),
                Poll::Ready(None) => None,
                _ => panic!("expected chunk or end"),
            };
            h.drive();
            chunk
        };

        assert_eq!(&next(&mut h).unwrap()[..], b"a");
        assert_eq!(&next(&mut h).unwrap()[..], b"b");
        assert!(h.input.is_empty());
        assert!(next(&mut h).is_none());
        assert!(h.conn.wants_read());
    }

    #[test]
    fn eof_with_unread_body_disposes() {
        let mut h = Harness::new(Service::new(hello));
        h.feed(b"POST /x HTTP/1.1\r\ncontent-length: 10\r\n\r\nabc");
        h.conn.recv_eof();
        h.drive();
        assert!(h.conn.is_done());
    }
}
