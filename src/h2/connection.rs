use super::frame::{self, code, setting, Frame, DEFAULT_WINDOW, MAX_WINDOW, PREFACE};
use crate::exchange::{ExchangeCore, ResponseEvent, ResponseHead, Service};
use crate::request::{ExchangeId, RequestHead};
use crate::server::MAX_BUFFERED_OUTPUT;
use crate::Error;
use bytes::{Buf, Bytes, BytesMut};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode, Uri, Version};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::task::{Context, Poll};

/// Header fields with no meaning in HTTP/2, RFC 7540 8.1.2.2.
const CONNECTION_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
];

/// Dynamic table size of the HPACK decoder.
const DECODER_TABLE_SIZE: u32 = 4096;

struct Stream {
    core: ExchangeCore,
    /// Octets the peer lets us send.
    send_window: i64,
    /// Octets we let the peer send.
    recv_window: i64,
    /// Request body octets not yet given back to the connection window.
    unacked: usize,
    /// Response data waiting for send window.
    queued: VecDeque<Bytes>,
    /// End of response, written once `queued` is empty.
    end: Option<Option<HeaderMap>>,
    /// END_STREAM is written.
    ended: bool,
    /// END_STREAM is received.
    remote_closed: bool,
}

/// Header block assembled from HEADERS and CONTINUATION frames.
struct HeaderBlock {
    stream_id: u32,
    end_stream: bool,
    block: BytesMut,
}

enum Close {
    /// Response fully written.
    Complete,
    Reset(u32),
}

/// One HTTP/2 connection, without the IO.
pub(crate) struct Connection {
    id: u64,
    service: Service,
    decoder: hpack::Decoder<'static>,
    encoder: hpack::Encoder<'static>,
    streams: HashMap<u32, Stream>,
    /// Open stream ids, rotated to share the connection between streams.
    order: VecDeque<u32>,
    continuation: Option<HeaderBlock>,
    /// Highest stream id opened by the peer.
    last_stream_id: u32,
    send_window: i64,
    recv_window: i64,
    peer_initial_window: u32,
    peer_max_frame_size: u32,
    initial_window: u32,
    max_frame_size: u32,
    max_concurrent_streams: u32,
    preface: bool,
    greeted: bool,
    /// The peer sent GOAWAY.
    going_away: bool,
    eof: bool,
    done: bool,
    error: Option<Error>,
}

impl Connection {
    pub fn new(id: u64, service: Service) -> Self {
        let config = service.config();
        let initial_window = config.h2_initial_window_size;
        let max_frame_size = config.h2_max_frame_size;
        let max_concurrent_streams = config.h2_max_concurrent_streams;

        Connection {
            id,
            service,
            decoder: hpack::Decoder::new(),
            encoder: hpack::Encoder::new(),
            streams: HashMap::new(),
            order: VecDeque::new(),
            continuation: None,
            last_stream_id: 0,
            send_window: DEFAULT_WINDOW as i64,
            recv_window: DEFAULT_WINDOW as i64,
            peer_initial_window: DEFAULT_WINDOW,
            peer_max_frame_size: frame::MIN_MAX_FRAME_SIZE,
            initial_window,
            max_frame_size,
            max_concurrent_streams,
            preface: false,
            greeted: false,
            going_away: false,
            eof: false,
            done: false,
            error: None,
        }
    }

    pub fn poll_drive(
        &mut self,
        cx: &mut Context,
        input: &mut BytesMut,
        out: &mut Vec<u8>,
    ) -> Result<(), Error> {
        if !self.greeted {
            self.greeted = true;
            self.greet(out);
        }

        loop {
            let received = match self.recv(input, out) {
                Ok(v) => v,
                Err(e) => {
                    self.fail(e, out);
                    return Ok(());
                }
            };
            let sent = self.send(cx, out);

            if self.done || !(received || sent) {
                return Ok(());
            }
        }
    }

    pub fn recv_eof(&mut self) {
        trace!("Read eof h2:{}", self.id);
        self.eof = true;

        for stream in self.streams.values_mut() {
            if !stream.remote_closed {
                stream.remote_closed = true;
                let e = io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "Connection closed before end of request body",
                );
                stream.core.fail_body(e.into());
            }
        }
    }

    pub fn wants_read(&self) -> bool {
        !self.done && !self.eof
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// The connection level error that ended the connection, if any.
    pub fn take_error(&mut self) -> Option<Error> {
        self.error.take()
    }

    pub fn dispose(&mut self) {
        for (_, mut stream) in self.streams.drain() {
            stream.core.dispose();
        }
        self.order.clear();
        self.done = true;
    }

    fn greet(&mut self, out: &mut Vec<u8>) {
        let table_size = self.service.config().h2_header_table_size.min(DECODER_TABLE_SIZE);

        frame::write_settings(
            &[
                (setting::HEADER_TABLE_SIZE, table_size),
                (setting::ENABLE_PUSH, 0),
                (setting::MAX_CONCURRENT_STREAMS, self.max_concurrent_streams),
                (setting::INITIAL_WINDOW_SIZE, self.initial_window),
                (setting::MAX_FRAME_SIZE, self.max_frame_size),
            ],
            out,
        );

        // the connection window is not covered by SETTINGS.
        if self.initial_window > DEFAULT_WINDOW {
            let increment = self.initial_window - DEFAULT_WINDOW;
            frame::write_window_update(0, increment, out);
            self.recv_window += increment as i64;
        }
    }

    /// Connection error. Tell the peer and stop.
    fn fail(&mut self, e: Error, out: &mut Vec<u8>) {
        let (code, msg) = match &e {
            Error::H2(code, msg) => (*code, msg.clone()),
            e => (code::INTERNAL_ERROR, e.to_string()),
        };
        debug!("Connection error h2:{}: {}", self.id, e);

        frame::write_goaway(self.last_stream_id, code, &msg, out);
        self.dispose();
        self.error = Some(e);
    }

    // ---------------------------------------------------------- receive

    fn recv(&mut self, input: &mut BytesMut, out: &mut Vec<u8>) -> Result<bool, Error> {
        let mut progress = false;

        loop {
            if self.done {
                return Ok(progress);
            }

            if !self.preface {
                let n = input.len().min(PREFACE.len());
                if input[..n] != PREFACE[..n] {
                    return Err(Error::H2(code::PROTOCOL_ERROR, "Invalid connection preface".into()));
                }
                if n < PREFACE.len() {
                    return Ok(progress);
                }
                input.advance(PREFACE.len());
                trace!("Connection preface h2:{}", self.id);
                self.preface = true;
                progress = true;
            }

            let frame = match frame::decode(input, self.max_frame_size)? {
                Some(f) => f,
                None => return Ok(progress),
            };
            progress = true;

            self.on_frame(frame, out)?;
        }
    }

    fn on_frame(&mut self, frame: Frame, out: &mut Vec<u8>) -> Result<(), Error> {
        if let Some(pending) = &self.continuation {
            match &frame {
                Frame::Continuation { stream_id, .. } if *stream_id == pending.stream_id => {}
                _ => return Err(protocol("Header block interrupted by another frame")),
            }
        }

        match frame {
            Frame::Data {
                stream_id,
                data,
                flow_len,
                end_stream,
            } => self.on_data(stream_id, data, flow_len, end_stream, out)?,

            Frame::Headers {
                stream_id,
                block,
                end_stream,
                end_headers,
            } => {
                if end_headers {
                    self.on_header_block(stream_id, &block, end_stream, out)?;
                } else {
                    self.continuation = Some(HeaderBlock {
                        stream_id,
                        end_stream,
                        block: BytesMut::from(&block[..]),
                    });
                }
            }

            Frame::Continuation {
                block, end_headers, ..
            } => {
                let mut pending = match self.continuation.take() {
                    Some(p) => p,
                    None => return Err(protocol("CONTINUATION without HEADERS")),
                };
                pending.block.extend_from_slice(&block);

                if pending.block.len() > self.service.config().max_header_size {
                    return Err(Error::H2(
                        code::ENHANCE_YOUR_CALM,
                        "Header block too large".into(),
                    ));
                }

                if end_headers {
                    self.on_header_block(pending.stream_id, &pending.block, pending.end_stream, out)?;
                } else {
                    self.continuation = Some(pending);
                }
            }

            Frame::Priority { .. } => {}

            Frame::RstStream { stream_id, code } => {
                if self.streams.contains_key(&stream_id) {
                    debug!("Stream reset by peer h2:{}:{} code: {}", self.id, stream_id, code);
                    self.remove(stream_id, out);
                } else {
                    warn!("Reset of unknown stream h2:{}:{}", self.id, stream_id);
                }
            }

            Frame::Settings { ack, values } => {
                if ack {
                    trace!("SETTINGS acknowledged h2:{}", self.id);
                } else {
                    self.on_settings(&values)?;
                    frame::write_settings_ack(out);
                }
            }

            Frame::PushPromise { .. } => return Err(protocol("PUSH_PROMISE from client")),

            Frame::Ping { ack, payload } => {
                if !ack {
                    frame::write_ping_ack(&payload, out);
                }
            }

            Frame::GoAway {
                last_stream_id,
                code,
            } => {
                debug!(
                    "GOAWAY from peer h2:{} last stream: {} code: {}",
                    self.id, last_stream_id, code
                );
                self.going_away = true;
            }

            Frame::WindowUpdate {
                stream_id,
                increment,
            } => self.on_window_update(stream_id, increment, out)?,

            Frame::Unknown { kind, .. } => trace!("Ignore unknown frame type: {}", kind),
        }

        Ok(())
    }

    fn on_header_block(
        &mut self,
        stream_id: u32,
        block: &[u8],
        end_stream: bool,
        out: &mut Vec<u8>,
    ) -> Result<(), Error> {
        // decoded regardless of what happens to the stream, to keep the
        // HPACK state in step with the peer.
        let fields = self.decoder.decode(block).map_err(|e| {
            Error::H2(code::COMPRESSION_ERROR, format!("HPACK decode failed: {:?}", e))
        })?;

        if let Some(stream) = self.streams.get_mut(&stream_id) {
            if stream.remote_closed {
                self.reset(stream_id, code::STREAM_CLOSED, out);
                return Ok(());
            }
            if !end_stream {
                debug!("Trailers without END_STREAM h2:{}:{}", self.id, stream_id);
                self.reset(stream_id, code::PROTOCOL_ERROR, out);
                return Ok(());
            }
            match trailer_map(fields) {
                Ok(trailers) => {
                    trace!("Trailers received {}: {:?}", stream.core.id(), trailers);
                    stream.core.merge_trailers(trailers);
                    stream.core.end_body();
                    stream.remote_closed = true;
                }
                Err(msg) => {
                    debug!("Malformed trailers h2:{}:{}: {}", self.id, stream_id, msg);
                    self.reset(stream_id, code::PROTOCOL_ERROR, out);
                }
            }
            return Ok(());
        }

        if stream_id % 2 == 0 {
            return Err(protocol("Client opened an even stream id"));
        }
        if stream_id <= self.last_stream_id {
            trace!("Ignore HEADERS on closed stream h2:{}:{}", self.id, stream_id);
            return Ok(());
        }
        self.last_stream_id = stream_id;

        if self.going_away || self.streams.len() >= self.max_concurrent_streams as usize {
            debug!("Refuse stream h2:{}:{}", self.id, stream_id);
            frame::write_rst_stream(stream_id, code::REFUSED_STREAM, out);
            return Ok(());
        }

        let head = match request_head(self.id, stream_id, fields) {
            Ok(v) => v,
            Err(msg) => {
                debug!("Malformed request h2:{}:{}: {}", self.id, stream_id, msg);
                frame::write_rst_stream(stream_id, code::PROTOCOL_ERROR, out);
                return Ok(());
            }
        };

        let core = ExchangeCore::new(head, self.service.clone(), !end_stream);

        let mut stream = Stream {
            core,
            send_window: self.peer_initial_window as i64,
            recv_window: self.initial_window as i64,
            unacked: 0,
            queued: VecDeque::new(),
            end: None,
            ended: false,
            remote_closed: end_stream,
        };

        // streams are independent, every one responds right away.
        stream.core.start();

        self.streams.insert(stream_id, stream);
        self.order.push_back(stream_id);

        Ok(())
    }

    fn on_data(
        &mut self,
        stream_id: u32,
        data: Bytes,
        flow_len: u32,
        end_stream: bool,
        out: &mut Vec<u8>,
    ) -> Result<(), Error> {
        let len = flow_len as i64;

        self.recv_window -= len;
        if self.recv_window < 0 {
            return Err(Error::H2(
                code::FLOW_CONTROL_ERROR,
                "Connection receive window exceeded".into(),
            ));
        }

        let stream = match self.streams.get_mut(&stream_id) {
            Some(s) => s,
            None => {
                if stream_id > self.last_stream_id {
                    return Err(protocol("DATA on idle stream"));
                }
                trace!("Discard DATA on closed stream h2:{}:{}", self.id, stream_id);
                self.give_back(None, flow_len as usize, out);
                return Ok(());
            }
        };

        if stream.remote_closed {
            self.give_back(None, flow_len as usize, out);
            self.reset(stream_id, code::STREAM_CLOSED, out);
            return Ok(());
        }

        stream.recv_window -= len;
        if stream.recv_window < 0 {
            self.give_back(None, flow_len as usize, out);
            self.reset(stream_id, code::FLOW_CONTROL_ERROR, out);
            return Ok(());
        }

        let data_len = data.len();
        let accepted = data_len > 0 && stream.core.force_push_body(data);

        if accepted {
            stream.unacked += data_len;
        }

        if end_stream {
            stream.core.end_body();
            stream.remote_closed = true;
        }

        // padding and discarded data go straight back to the peer.
        let unused = if accepted {
            flow_len as usize - data_len
        } else {
            flow_len as usize
        };
        let window_stream = if end_stream { None } else { Some(stream_id) };
        self.give_back(window_stream, unused, out);

        Ok(())
    }

    /// Return receive window to the peer.
    fn give_back(&mut self, stream_id: Option<u32>, amount: usize, out: &mut Vec<u8>) {
        if amount == 0 {
            return;
        }
        let amount = amount as u32;

        if let Some(stream_id) = stream_id {
            if let Some(stream) = self.streams.get_mut(&stream_id) {
                stream.recv_window += amount as i64;
                frame::write_window_update(stream_id, amount, out);
            }
        }

        self.recv_window += amount as i64;
        frame::write_window_update(0, amount, out);
    }

    fn on_settings(&mut self, values: &[(u16, u32)]) -> Result<(), Error> {
        for (id, value) in values {
            let value = *value;

            match *id {
                setting::INITIAL_WINDOW_SIZE => {
                    if value > MAX_WINDOW {
                        return Err(Error::H2(
                            code::FLOW_CONTROL_ERROR,
                            "SETTINGS_INITIAL_WINDOW_SIZE too large".into(),
                        ));
                    }
                    let delta = value as i64 - self.peer_initial_window as i64;
                    for stream in self.streams.values_mut() {
                        stream.send_window += delta;
                        if stream.send_window > MAX_WINDOW as i64 {
                            return Err(Error::H2(
                                code::FLOW_CONTROL_ERROR,
                                "Stream send window overflow".into(),
                            ));
                        }
                    }
                    self.peer_initial_window = value;
                }

                setting::MAX_FRAME_SIZE => {
                    if value < frame::MIN_MAX_FRAME_SIZE || value > frame::MAX_MAX_FRAME_SIZE {
                        return Err(protocol("SETTINGS_MAX_FRAME_SIZE out of range"));
                    }
                    self.peer_max_frame_size = value;
                }

                setting::ENABLE_PUSH => {
                    if value > 1 {
                        return Err(protocol("SETTINGS_ENABLE_PUSH must be 0 or 1"));
                    }
                }

                // responses are encoded without dynamic table references.
                setting::HEADER_TABLE_SIZE => {}

                _ => {}
            }

            trace!("Peer setting h2:{} 0x{:x} = {}", self.id, id, value);
        }

        Ok(())
    }

    fn on_window_update(&mut self, stream_id: u32, increment: u32, out: &mut Vec<u8>) -> Result<(), Error> {
        if stream_id == 0 {
            if increment == 0 {
                return Err(protocol("WINDOW_UPDATE with zero increment"));
            }
            self.send_window += increment as i64;
            if self.send_window > MAX_WINDOW as i64 {
                return Err(Error::H2(
                    code::FLOW_CONTROL_ERROR,
                    "Connection send window overflow".into(),
                ));
            }
            return Ok(());
        }

        let reset = match self.streams.get_mut(&stream_id) {
            Some(_) if increment == 0 => Some(code::PROTOCOL_ERROR),
            Some(stream) => {
                stream.send_window += increment as i64;
                if stream.send_window > MAX_WINDOW as i64 {
                    Some(code::FLOW_CONTROL_ERROR)
                } else {
                    None
                }
            }
            None => {
                trace!("WINDOW_UPDATE for closed stream h2:{}:{}", self.id, stream_id);
                None
            }
        };

        if let Some(code) = reset {
            self.reset(stream_id, code, out);
        }

        Ok(())
    }

    fn reset(&mut self, stream_id: u32, code: u32, out: &mut Vec<u8>) {
        trace!("Reset stream h2:{}:{} code: {}", self.id, stream_id, code);
        frame::write_rst_stream(stream_id, code, out);
        self.remove(stream_id, out);
    }

    /// Drop a stream from the table, disposing its exchange.
    fn remove(&mut self, stream_id: u32, out: &mut Vec<u8>) {
        if let Some(mut stream) = self.streams.remove(&stream_id) {
            let released = stream.core.dispose();
            trace!(
                "Stream removed h2:{}:{} released: {}",
                self.id,
                stream_id,
                released
            );
            // buffered request body can no longer be consumed.
            let unacked = stream.unacked;
            self.give_back(None, unacked, out);
        }
        self.order.retain(|id| *id != stream_id);
    }

    // ---------------------------------------------------------- send

    fn send(&mut self, cx: &mut Context, out: &mut Vec<u8>) -> bool {
        let mut progress = false;

        loop {
            if self.done {
                return progress;
            }

            let mut pass = false;
            let ids: Vec<u32> = self.order.iter().copied().collect();

            for id in ids {
                if out.len() >= MAX_BUFFERED_OUTPUT {
                    return progress || pass;
                }
                let (sent, close) = self.send_stream(id, cx, out);
                pass |= sent;
                if let Some(close) = close {
                    self.close_stream(id, close, out);
                    pass = true;
                }
            }

            if self.streams.is_empty() && (self.going_away || self.eof) {
                trace!("No more streams h2:{}", self.id);
                self.done = true;
                return true;
            }

            if !pass {
                return progress;
            }
            progress = true;

            // next pass starts with another stream.
            if let Some(first) = self.order.pop_front() {
                self.order.push_back(first);
            }
        }
    }

    /// Make progress on one stream. Writes at most one DATA frame.
    fn send_stream(&mut self, id: u32, cx: &mut Context, out: &mut Vec<u8>) -> (bool, Option<Close>) {
        let stream = match self.streams.get_mut(&id) {
            Some(s) => s,
            None => return (false, None),
        };
        let mut progress = false;

        if !stream.remote_closed {
            if let Poll::Ready(n) = stream.core.poll_body_consumed(cx) {
                let n = n.min(stream.unacked);
                if n > 0 {
                    stream.unacked -= n;
                    stream.recv_window += n as i64;
                    self.recv_window += n as i64;
                    frame::write_window_update(id, n as u32, out);
                    frame::write_window_update(0, n as u32, out);
                    progress = true;
                }
            }
        }

        loop {
            if let Some(chunk) = stream.queued.front_mut() {
                let window = stream
                    .send_window
                    .min(self.send_window)
                    .min(self.peer_max_frame_size as i64);
                if window <= 0 {
                    trace!("Stream blocked on send window h2:{}:{}", self.id, id);
                    return (progress, None);
                }

                let n = (chunk.len() as i64).min(window) as usize;
                let data = chunk.split_to(n);
                if chunk.is_empty() {
                    stream.queued.pop_front();
                }

                let last = stream.queued.is_empty() && matches!(stream.end, Some(None));
                frame::write_data(id, &data, last, out);
                if last {
                    stream.end = None;
                    stream.ended = true;
                }

                stream.send_window -= n as i64;
                self.send_window -= n as i64;

                return (true, if last { Some(Close::Complete) } else { None });
            }

            if let Some(end) = stream.end.take() {
                match end {
                    Some(trailers) => {
                        let block = encode_fields(&mut self.encoder, None, &trailers);
                        frame::write_headers(id, &block, true, self.peer_max_frame_size, out);
                    }
                    None => frame::write_data(id, &[], true, out),
                }
                stream.ended = true;
            }

            if stream.ended {
                return (true, Some(Close::Complete));
            }

            let event = match stream.core.poll_event(cx) {
                Poll::Pending => return (progress, None),
                Poll::Ready(Some(ev)) => ev,
                Poll::Ready(None) => {
                    // ended without END_STREAM: disposed.
                    return (true, Some(Close::Reset(code::INTERNAL_ERROR)));
                }
            };
            progress = true;

            let is_head = stream.core.is_head_request();

            match event {
                ResponseEvent::Full {
                    mut head,
                    body,
                    trailers,
                } => {
                    let no_body = is_head || no_body_status(head.status);
                    set_content_length(&mut head, body.len(), is_head);

                    let has_data = !no_body && !body.is_empty();
                    let trailers = if no_body { None } else { trailers };
                    let end_now = !has_data && trailers.is_none();

                    let block = encode_fields(&mut self.encoder, Some(head.status), &head.headers);
                    frame::write_headers(id, &block, end_now, self.peer_max_frame_size, out);

                    if end_now {
                        stream.ended = true;
                    } else {
                        if has_data {
                            stream.queued.push_back(body);
                        }
                        stream.end = Some(trailers);
                    }
                }

                ResponseEvent::Head(head) => {
                    let no_body = is_head || no_body_status(head.status);

                    let block = encode_fields(&mut self.encoder, Some(head.status), &head.headers);
                    frame::write_headers(id, &block, no_body, self.peer_max_frame_size, out);

                    // the rest of the body is dropped with the exchange.
                    stream.ended = no_body;
                }

                ResponseEvent::Chunk(data) => stream.queued.push_back(data),

                ResponseEvent::End(trailers) => stream.end = Some(trailers),

                ResponseEvent::Abort(e) => {
                    warn!("Response aborted h2:{}:{}: {}", self.id, id, e);
                    return (true, Some(Close::Reset(code::INTERNAL_ERROR)));
                }
            }
        }
    }

    fn close_stream(&mut self, id: u32, close: Close, out: &mut Vec<u8>) {
        let remote_closed = self.streams.get(&id).map(|s| s.remote_closed).unwrap_or(true);

        match close {
            Close::Complete if remote_closed => {
                trace!("Stream complete h2:{}:{}", self.id, id);
                self.remove(id, out);
            }
            // the request body is of no further use.
            Close::Complete => self.reset(id, code::NO_ERROR, out),
            Close::Reset(code) => self.reset(id, code, out),
        }
    }
}

fn protocol(msg: &str) -> Error {
    Error::H2(code::PROTOCOL_ERROR, msg.into())
}

fn no_body_status(status: StatusCode) -> bool {
    status.is_informational() || status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED
}

fn set_content_length(head: &mut ResponseHead, len: usize, is_head: bool) {
    if head.status.is_informational() || head.status == StatusCode::NO_CONTENT {
        head.headers.remove(header::CONTENT_LENGTH);
    } else if head.status != StatusCode::NOT_MODIFIED
        && !(is_head && len == 0 && head.headers.contains_key(header::CONTENT_LENGTH))
    {
        head.headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    }
}

/// HPACK encode a response head (with `status`) or a trailer block.
fn encode_fields(
    encoder: &mut hpack::Encoder<'static>,
    status: Option<StatusCode>,
    headers: &HeaderMap,
) -> Vec<u8> {
    let mut fields: Vec<(&[u8], &[u8])> = Vec::with_capacity(headers.len() + 1);

    if let Some(status) = &status {
        fields.push((&b":status"[..], status.as_str().as_bytes()));
    }

    for (name, value) in headers {
        if CONNECTION_HEADERS.contains(&name.as_str()) {
            continue;
        }
        fields.push((name.as_str().as_bytes(), value.as_bytes()));
    }

    encoder.encode(fields)
}

fn request_head(connection: u64, stream: u32, fields: Vec<(Vec<u8>, Vec<u8>)>) -> Result<RequestHead, String> {
    let mut method = None;
    let mut scheme = None;
    let mut authority = None;
    let mut path = None;
    let mut headers = HeaderMap::new();

    for (name, value) in fields {
        if name.first() == Some(&b':') {
            if !headers.is_empty() {
                return Err("Pseudo header after regular header".into());
            }
            let value = String::from_utf8(value).map_err(|e| e.to_string())?;
            match &name[..] {
                b":method" => method = Some(value),
                b":scheme" => scheme = Some(value),
                b":authority" => authority = Some(value),
                b":path" => path = Some(value),
                _ => return Err(format!("Unknown pseudo header: {}", String::from_utf8_lossy(&name))),
            }
            continue;
        }

        let name = HeaderName::from_bytes(&name).map_err(|e| e.to_string())?;
        let value = HeaderValue::from_bytes(&value).map_err(|e| e.to_string())?;
        headers.append(name, value);
    }

    let method: Method = method
        .ok_or("Missing :method")?
        .parse()
        .map_err(|e: http::method::InvalidMethod| e.to_string())?;
    let path = path.ok_or("Missing :path")?;

    let mut uri = Uri::builder();
    if let (Some(scheme), Some(authority)) = (&scheme, &authority) {
        uri = uri.scheme(scheme.as_str()).authority(authority.as_str());
    }
    let uri = uri
        .path_and_query(path.as_str())
        .build()
        .map_err(|e| e.to_string())?;

    if let Some(authority) = authority {
        if !headers.contains_key(header::HOST) {
            let host = HeaderValue::from_str(&authority).map_err(|e| e.to_string())?;
            headers.insert(header::HOST, host);
        }
    }

    let id = ExchangeId::Http2 { connection, stream };

    Ok(RequestHead::new(id, method, uri, Version::HTTP_2, headers))
}

fn trailer_map(fields: Vec<(Vec<u8>, Vec<u8>)>) -> Result<HeaderMap, String> {
    let mut map = HeaderMap::new();

    for (name, value) in fields {
        if name.first() == Some(&b':') {
            return Err("Pseudo header in trailers".into());
        }
        let name = HeaderName::from_bytes(&name).map_err(|e| e.to_string())?;
        let value = HeaderValue::from_bytes(&value).map_err(|e| e.to_string())?;
        map.append(name, value);
    }

    Ok(map)
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("h2::Connection")
            .field("id", &self.id)
            .field("streams", &self.streams.len())
            .field("last_stream_id", &self.last_stream_id)
            .field("done", &self.done)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::{BodySender, BodyStream};
    use crate::exchange::Exchange;
    use crate::h2::frame::tests::raw;
    use crate::h2::frame::{flag, kind};
    use crate::HttpError;
    use futures_util::task::noop_waker;
    use std::sync::{Arc, Mutex};

    struct Peer {
        conn: Connection,
        input: BytesMut,
        encoder: hpack::Encoder<'static>,
        decoder: hpack::Decoder<'static>,
    }

    impl Peer {
        fn new(service: Service) -> Self {
            let mut peer = Peer {
                conn: Connection::new(1, service),
                input: BytesMut::new(),
                encoder: hpack::Encoder::new(),
                decoder: hpack::Decoder::new(),
            };
            let mut hello = PREFACE.to_vec();
            hello.extend(raw(kind::SETTINGS, 0, 0, &[]));
            let frames = peer.send(&hello);
            assert!(matches!(&frames[0], Frame::Settings { ack: false, .. }));
            assert!(frames.contains(&Frame::Settings {
                ack: true,
                values: vec![]
            }));
            peer
        }

        /// Feed bytes, return the frames written in response.
        fn send(&mut self, data: &[u8]) -> Vec<Frame> {
            self.input.extend_from_slice(data);
            self.drive()
        }

        fn drive(&mut self) -> Vec<Frame> {
            let waker = noop_waker();
            let mut cx = Context::from_waker(&waker);
            let mut out = vec![];
            self.conn.poll_drive(&mut cx, &mut self.input, &mut out).unwrap();

            let mut buf = BytesMut::from(&out[..]);
            let mut frames = vec![];
            while let Some(f) = frame::decode(&mut buf, frame::MAX_MAX_FRAME_SIZE).unwrap() {
                frames.push(f);
            }
            assert!(buf.is_empty());
            frames
        }

        fn headers(&mut self, stream_id: u32, method: &str, path: &str, end_stream: bool) -> Vec<u8> {
            let block = self.encoder.encode(vec![
                (&b":method"[..], method.as_bytes()),
                (&b":scheme"[..], &b"http"[..]),
                (&b":authority"[..], &b"localhost"[..]),
                (&b":path"[..], path.as_bytes()),
            ]);
            let flags = flag::END_HEADERS | if end_stream { flag::END_STREAM } else { 0 };
            raw(kind::HEADERS, flags, stream_id, &block)
        }

        fn decode_block(&mut self, block: &[u8]) -> Vec<(String, String)> {
            self.decoder
                .decode(block)
                .unwrap()
                .into_iter()
                .map(|(n, v)| {
                    (
                        String::from_utf8(n).unwrap(),
                        String::from_utf8(v).unwrap(),
                    )
                })
                .collect()
        }
    }

    fn hello(ex: &mut Exchange) -> Result<(), HttpError> {
        let text = format!("hello {}", ex.request().path());
        ex.response_mut().body().string(text)?;
        Ok(())
    }

    fn data_of(frames: &[Frame], id: u32) -> (Vec<u8>, bool) {
        let mut body = vec![];
        let mut end = false;
        for f in frames {
            if let Frame::Data {
                stream_id,
                data,
                end_stream,
                ..
            } = f
            {
                if *stream_id == id {
                    body.extend_from_slice(data);
                    end |= *end_stream;
                }
            }
        }
        (body, end)
    }

    #[test]
    fn get_is_answered_with_headers_and_data() {
        let mut peer = Peer::new(Service::new(hello));
        let req = peer.headers(1, "GET", "/x", true);
        let frames = peer.send(&req);

        let block = match &frames[0] {
            Frame::Headers {
                stream_id: 1,
                block,
                end_stream: false,
                end_headers: true,
            } => block.clone(),
            f => panic!("unexpected: {:?}", f),
        };
        let fields = peer.decode_block(&block);
        assert_eq!(fields[0], (":status".to_string(), "200".to_string()));
        assert!(fields.contains(&("content-length".to_string(), "8".to_string())));

        assert_eq!(data_of(&frames, 1), (b"hello /x".to_vec(), true));
        assert!(peer.conn.streams.is_empty());
    }

    #[test]
    fn slow_stream_does_not_block_others() {
        let slow: Arc<Mutex<Option<BodySender>>> = Arc::new(Mutex::new(None));
        let slow2 = slow.clone();

        let service = Service::new(move |ex: &mut Exchange| -> Result<(), HttpError> {
            if ex.request().path() == "/slow" {
                *slow2.lock().unwrap() = Some(ex.response_mut().body().stream()?);
            } else {
                ex.response_mut().body().string("fast")?;
            }
            Ok(())
        });

        let mut peer = Peer::new(service);
        let mut reqs = peer.headers(1, "GET", "/slow", true);
        reqs.extend(peer.headers(3, "GET", "/fast", true));
        let frames = peer.send(&reqs);

        assert_eq!(data_of(&frames, 3), (b"fast".to_vec(), true));
        assert!(frames.iter().all(|f| !matches!(f, Frame::Headers { stream_id: 1, .. })));

        let mut tx = slow.lock().unwrap().take().unwrap();
        tx.try_send("sl").unwrap();
        tx.try_send("ow").unwrap();
        tx.finish();

        let frames = peer.drive();
        assert!(matches!(&frames[0], Frame::Headers { stream_id: 1, .. }));
        assert_eq!(data_of(&frames, 1), (b"slow".to_vec(), true));
    }

    #[test]
    fn header_block_over_continuation() {
        let mut peer = Peer::new(Service::new(hello));
        let req = peer.headers(1, "GET", "/split", true);

        // re-frame the block: HEADERS without END_HEADERS, then CONTINUATION.
        let block = &req[9..];
        let mut bytes = raw(kind::HEADERS, flag::END_STREAM, 1, &block[..3]);
        bytes.extend(raw(kind::CONTINUATION, flag::END_HEADERS, 1, &block[3..]));

        let frames = peer.send(&bytes);
        assert_eq!(data_of(&frames, 1), (b"hello /split".to_vec(), true));
    }

    #[test]
    fn interrupted_header_block_is_connection_error() {
        let mut peer = Peer::new(Service::new(hello));
        let req = peer.headers(1, "GET", "/", true);
        let mut bytes = raw(kind::HEADERS, flag::END_STREAM, 1, &req[9..]);
        bytes.extend(raw(kind::PING, 0, 0, &[0; 8]));

        let frames = peer.send(&bytes);
        assert!(matches!(
            frames.last(),
            Some(Frame::GoAway {
                code: code::PROTOCOL_ERROR,
                ..
            })
        ));
        assert!(peer.conn.is_done());
        assert!(peer.conn.take_error().is_some());
    }

    #[test]
    fn bad_preface_sends_goaway() {
        let mut conn = Connection::new(1, Service::new(hello));
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let mut input = BytesMut::from(&b"GET / HTTP/1.1\r\n\r\n"[..]);
        let mut out = vec![];
        conn.poll_drive(&mut cx, &mut input, &mut out).unwrap();
        assert!(conn.is_done());

        let mut buf = BytesMut::from(&out[..]);
        let mut last = None;
        while let Some(f) = frame::decode(&mut buf, frame::MAX_MAX_FRAME_SIZE).unwrap() {
            last = Some(f);
        }
        assert!(matches!(
            last,
            Some(Frame::GoAway {
                code: code::PROTOCOL_ERROR,
                ..
            })
        ));
    }

    #[test]
    fn ping_is_acked_and_unknown_reset_is_survived() {
        let mut peer = Peer::new(Service::new(hello));

        let frames = peer.send(&raw(kind::PING, 0, 0, b"12345678"));
        assert_eq!(
            frames,
            vec![Frame::Ping {
                ack: true,
                payload: *b"12345678"
            }]
        );

        let frames = peer.send(&raw(kind::RST_STREAM, 0, 7, &[0, 0, 0, 8]));
        assert!(frames.is_empty());
        assert!(!peer.conn.is_done());
    }

    #[test]
    fn push_promise_from_client_is_fatal() {
        let mut peer = Peer::new(Service::new(hello));
        let frames = peer.send(&raw(kind::PUSH_PROMISE, flag::END_HEADERS, 1, &[0, 0, 0, 2]));
        assert!(matches!(frames.last(), Some(Frame::GoAway { .. })));
        assert!(peer.conn.is_done());
    }

    #[test]
    fn data_respects_peer_window() {
        let mut peer = Peer::new(Service::new(hello));

        // INITIAL_WINDOW_SIZE = 5
        let frames = peer.send(&raw(kind::SETTINGS, 0, 0, &[0, 4, 0, 0, 0, 5]));
        assert_eq!(
            frames,
            vec![Frame::Settings {
                ack: true,
                values: vec![]
            }]
        );

        let req = peer.headers(1, "GET", "/x", true);
        let frames = peer.send(&req);
        assert_eq!(data_of(&frames, 1), (b"hello".to_vec(), false));

        let frames = peer.send(&raw(kind::WINDOW_UPDATE, 0, 1, &[0, 0, 0, 10]));
        assert_eq!(data_of(&frames, 1), (b" /x".to_vec(), true));
    }

    #[test]
    fn reset_disposes_buffered_body_and_returns_window() {
        let held: Arc<Mutex<Option<(Option<BodyStream>, BodySender)>>> = Arc::new(Mutex::new(None));
        let held2 = held.clone();

        let service = Service::new(move |ex: &mut Exchange| -> Result<(), HttpError> {
            let body = ex.request_mut().take_body();
            let tx = ex.response_mut().body().stream()?;
            *held2.lock().unwrap() = Some((body, tx));
            Ok(())
        });

        let mut peer = Peer::new(service);
        let mut bytes = peer.headers(1, "POST", "/upload", false);
        bytes.extend(raw(kind::DATA, 0, 1, b"abc"));
        bytes.extend(raw(kind::DATA, 0, 1, b"defg"));
        let frames = peer.send(&bytes);
        assert!(frames.is_empty());
        assert_eq!(peer.conn.streams[&1].unacked, 7);

        let frames = peer.send(&raw(kind::RST_STREAM, 0, 1, &[0, 0, 0, 8]));
        assert!(peer.conn.streams.is_empty());
        assert_eq!(
            frames,
            vec![Frame::WindowUpdate {
                stream_id: 0,
                increment: 7
            }]
        );

        let (body, mut tx) = held.lock().unwrap().take().unwrap();
        let mut body = body.unwrap();
        assert_eq!(body.dispose(), 0);
        assert!(tx.try_send("late").is_err());
    }

    #[test]
    fn complete_response_resets_open_request_body() {
        let mut peer = Peer::new(Service::new(hello));
        let req = peer.headers(1, "POST", "/x", false);
        let frames = peer.send(&req);

        assert_eq!(data_of(&frames, 1), (b"hello /x".to_vec(), true));
        assert_eq!(
            frames.last(),
            Some(&Frame::RstStream {
                stream_id: 1,
                code: code::NO_ERROR
            })
        );
        assert!(peer.conn.streams.is_empty());
    }

    #[test]
    fn trailers_are_merged_into_request() {
        let seen = Arc::new(Mutex::new(None));
        let seen2 = seen.clone();
        let tx_hold: Arc<Mutex<Option<BodySender>>> = Arc::new(Mutex::new(None));
        let tx_hold2 = tx_hold.clone();

        let service = Service::new(move |ex: &mut Exchange| -> Result<(), HttpError> {
            *seen2.lock().unwrap() = Some(ex.request_mut().take_body());
            *tx_hold2.lock().unwrap() = Some(ex.response_mut().body().stream()?);
            Ok(())
        });

        let mut peer = Peer::new(service);
        let mut bytes = peer.headers(1, "POST", "/t", false);
        let block = peer.encoder.encode(vec![(&b"x-sum"[..], &b"42"[..])]);
        bytes.extend(raw(kind::HEADERS, flag::END_HEADERS | flag::END_STREAM, 1, &block));
        peer.send(&bytes);

        let stream = &peer.conn.streams[&1];
        assert!(stream.remote_closed);
        assert!(stream.core.is_body_ended());
        assert!(seen.lock().unwrap().is_some());
    }

    #[test]
    fn trailers_without_end_stream_reset_only_the_stream() {
        let held: Arc<Mutex<Option<BodySender>>> = Arc::new(Mutex::new(None));
        let held2 = held.clone();

        let service = Service::new(move |ex: &mut Exchange| -> Result<(), HttpError> {
            if ex.request().path() == "/upload" {
                *held2.lock().unwrap() = Some(ex.response_mut().body().stream()?);
            } else {
                ex.response_mut().body().string("other")?;
            }
            Ok(())
        });

        let mut peer = Peer::new(service);
        let mut bytes = peer.headers(1, "POST", "/upload", false);
        let block = peer.encoder.encode(vec![(&b"x-sum"[..], &b"42"[..])]);
        bytes.extend(raw(kind::HEADERS, flag::END_HEADERS, 1, &block));
        let frames = peer.send(&bytes);

        assert_eq!(
            frames,
            vec![Frame::RstStream {
                stream_id: 1,
                code: code::PROTOCOL_ERROR
            }]
        );
        assert!(peer.conn.streams.is_empty());
        assert!(!peer.conn.is_done());

        // the response side of the reset exchange is gone.
        let mut tx = held.lock().unwrap().take().unwrap();
        assert!(tx.try_send("late").is_err());

        let req = peer.headers(3, "GET", "/next", true);
        let frames = peer.send(&req);
        assert_eq!(data_of(&frames, 3), (b"other".to_vec(), true));
    }
}
