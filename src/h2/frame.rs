//! HTTP/2 frame layer, RFC 7540 section 4 and 6.

use crate::Error;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Client connection preface.
pub(crate) const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub(crate) const FRAME_HEADER_SIZE: usize = 9;

/// Window size every stream and the connection start out with.
pub(crate) const DEFAULT_WINDOW: u32 = 65_535;

pub(crate) const MAX_WINDOW: u32 = (1 << 31) - 1;

pub(crate) const MIN_MAX_FRAME_SIZE: u32 = 16_384;
pub(crate) const MAX_MAX_FRAME_SIZE: u32 = 16_777_215;

/// Error codes, section 7.
pub(crate) mod code {
    pub const NO_ERROR: u32 = 0x0;
    pub const PROTOCOL_ERROR: u32 = 0x1;
    pub const INTERNAL_ERROR: u32 = 0x2;
    pub const FLOW_CONTROL_ERROR: u32 = 0x3;
    pub const STREAM_CLOSED: u32 = 0x5;
    pub const FRAME_SIZE_ERROR: u32 = 0x6;
    pub const REFUSED_STREAM: u32 = 0x7;
    pub const COMPRESSION_ERROR: u32 = 0x9;
    pub const ENHANCE_YOUR_CALM: u32 = 0xb;
}

/// Setting identifiers, section 6.5.2.
pub(crate) mod setting {
    pub const HEADER_TABLE_SIZE: u16 = 0x1;
    pub const ENABLE_PUSH: u16 = 0x2;
    pub const MAX_CONCURRENT_STREAMS: u16 = 0x3;
    pub const INITIAL_WINDOW_SIZE: u16 = 0x4;
    pub const MAX_FRAME_SIZE: u16 = 0x5;
}

pub(crate) mod kind {
    pub const DATA: u8 = 0x0;
    pub const HEADERS: u8 = 0x1;
    pub const PRIORITY: u8 = 0x2;
    pub const RST_STREAM: u8 = 0x3;
    pub const SETTINGS: u8 = 0x4;
    pub const PUSH_PROMISE: u8 = 0x5;
    pub const PING: u8 = 0x6;
    pub const GOAWAY: u8 = 0x7;
    pub const WINDOW_UPDATE: u8 = 0x8;
    pub const CONTINUATION: u8 = 0x9;
}

pub(crate) mod flag {
    pub const END_STREAM: u8 = 0x1;
    pub const ACK: u8 = 0x1;
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameHeader {
    length: u32,
    kind: u8,
    flags: u8,
    stream_id: u32,
}

impl FrameHeader {
    fn parse(src: &[u8]) -> Self {
        let length = (u32::from(src[0]) << 16) | (u32::from(src[1]) << 8) | u32::from(src[2]);
        let stream_id = u32::from_be_bytes([src[5], src[6], src[7], src[8]]) & MAX_WINDOW;

        FrameHeader {
            length,
            kind: src[3],
            flags: src[4],
            stream_id,
        }
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.reserve(FRAME_HEADER_SIZE + self.length as usize);
        out.put_u8((self.length >> 16) as u8);
        out.put_u8((self.length >> 8) as u8);
        out.put_u8(self.length as u8);
        out.put_u8(self.kind);
        out.put_u8(self.flags);
        out.put_u32(self.stream_id & MAX_WINDOW);
    }

    fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Frame {
    Data {
        stream_id: u32,
        data: Bytes,
        /// Length counted against flow control, padding included.
        flow_len: u32,
        end_stream: bool,
    },
    Headers {
        stream_id: u32,
        block: Bytes,
        end_stream: bool,
        end_headers: bool,
    },
    Priority {
        stream_id: u32,
    },
    RstStream {
        stream_id: u32,
        code: u32,
    },
    Settings {
        ack: bool,
        values: Vec<(u16, u32)>,
    },
    PushPromise {
        stream_id: u32,
    },
    Ping {
        ack: bool,
        payload: [u8; 8],
    },
    GoAway {
        last_stream_id: u32,
        code: u32,
    },
    WindowUpdate {
        stream_id: u32,
        increment: u32,
    },
    Continuation {
        stream_id: u32,
        block: Bytes,
        end_headers: bool,
    },
    Unknown {
        kind: u8,
        stream_id: u32,
    },
}

fn protocol(msg: &str) -> Error {
    Error::H2(code::PROTOCOL_ERROR, msg.into())
}

fn frame_size(msg: &str) -> Error {
    Error::H2(code::FRAME_SIZE_ERROR, msg.into())
}

/// Decode the next frame from `buf`. `None` until a whole frame is buffered.
pub(crate) fn decode(buf: &mut BytesMut, max_frame_size: u32) -> Result<Option<Frame>, Error> {
    if buf.len() < FRAME_HEADER_SIZE {
        return Ok(None);
    }

    let head = FrameHeader::parse(&buf[..FRAME_HEADER_SIZE]);

    if head.length > max_frame_size {
        return Err(frame_size("Frame larger than SETTINGS_MAX_FRAME_SIZE"));
    }
    if buf.len() < FRAME_HEADER_SIZE + head.length as usize {
        return Ok(None);
    }

    buf.advance(FRAME_HEADER_SIZE);
    let payload = buf.split_to(head.length as usize).freeze();

    trace!(
        "Decoded frame type: {} flags: 0x{:x} stream: {} length: {}",
        head.kind,
        head.flags,
        head.stream_id,
        head.length
    );

    parse(head, payload).map(Some)
}

fn parse(head: FrameHeader, mut payload: Bytes) -> Result<Frame, Error> {
    let stream_id = head.stream_id;

    let frame = match head.kind {
        kind::DATA => {
            if stream_id == 0 {
                return Err(protocol("DATA frame on stream 0"));
            }
            let data = strip_padding(&head, payload)?;
            Frame::Data {
                stream_id,
                data,
                flow_len: head.length,
                end_stream: head.has(flag::END_STREAM),
            }
        }

        kind::HEADERS => {
            if stream_id == 0 {
                return Err(protocol("HEADERS frame on stream 0"));
            }
            let mut block = strip_padding(&head, payload)?;
            if head.has(flag::PRIORITY) {
                if block.len() < 5 {
                    return Err(frame_size("HEADERS frame too short for priority"));
                }
                // dependency and weight are ignored.
                block.advance(5);
            }
            Frame::Headers {
                stream_id,
                block,
                end_stream: head.has(flag::END_STREAM),
                end_headers: head.has(flag::END_HEADERS),
            }
        }

        kind::PRIORITY => {
            if stream_id == 0 {
                return Err(protocol("PRIORITY frame on stream 0"));
            }
            if payload.len() != 5 {
                return Err(frame_size("PRIORITY frame must be 5 bytes"));
            }
            Frame::Priority { stream_id }
        }

        kind::RST_STREAM => {
            if stream_id == 0 {
                return Err(protocol("RST_STREAM frame on stream 0"));
            }
            if payload.len() != 4 {
                return Err(frame_size("RST_STREAM frame must be 4 bytes"));
            }
            Frame::RstStream {
                stream_id,
                code: payload.get_u32(),
            }
        }

        kind::SETTINGS => {
            if stream_id != 0 {
                return Err(protocol("SETTINGS frame on a stream"));
            }
            let ack = head.has(flag::ACK);
            if ack && !payload.is_empty() {
                return Err(frame_size("SETTINGS ack with payload"));
            }
            if payload.len() % 6 != 0 {
                return Err(frame_size("SETTINGS payload not a multiple of 6"));
            }
            let mut values = Vec::with_capacity(payload.len() / 6);
            while payload.has_remaining() {
                let id = payload.get_u16();
                let value = payload.get_u32();
                values.push((id, value));
            }
            Frame::Settings { ack, values }
        }

        kind::PUSH_PROMISE => Frame::PushPromise { stream_id },

        kind::PING => {
            if stream_id != 0 {
                return Err(protocol("PING frame on a stream"));
            }
            if payload.len() != 8 {
                return Err(frame_size("PING frame must be 8 bytes"));
            }
            let mut data = [0; 8];
            payload.copy_to_slice(&mut data);
            Frame::Ping {
                ack: head.has(flag::ACK),
                payload: data,
            }
        }

        kind::GOAWAY => {
            if stream_id != 0 {
                return Err(protocol("GOAWAY frame on a stream"));
            }
            if payload.len() < 8 {
                return Err(frame_size("GOAWAY frame too short"));
            }
            let last_stream_id = payload.get_u32() & MAX_WINDOW;
            let code = payload.get_u32();
            if !payload.is_empty() {
                debug!("GOAWAY debug data: {:?}", String::from_utf8_lossy(&payload));
            }
            Frame::GoAway {
                last_stream_id,
                code,
            }
        }

        kind::WINDOW_UPDATE => {
            if payload.len() != 4 {
                return Err(frame_size("WINDOW_UPDATE frame must be 4 bytes"));
            }
            Frame::WindowUpdate {
                stream_id,
                increment: payload.get_u32() & MAX_WINDOW,
            }
        }

        kind::CONTINUATION => {
            if stream_id == 0 {
                return Err(protocol("CONTINUATION frame on stream 0"));
            }
            Frame::Continuation {
                stream_id,
                block: payload,
                end_headers: head.has(flag::END_HEADERS),
            }
        }

        kind => Frame::Unknown { kind, stream_id },
    };

    Ok(frame)
}

fn strip_padding(head: &FrameHeader, mut payload: Bytes) -> Result<Bytes, Error> {
    if !head.has(flag::PADDED) {
        return Ok(payload);
    }
    if payload.is_empty() {
        return Err(protocol("PADDED frame without pad length"));
    }
    let pad = payload.get_u8() as usize;
    if pad > payload.len() {
        return Err(protocol("Padding exceeds frame payload"));
    }
    payload.truncate(payload.len() - pad);
    Ok(payload)
}

// ---------------------------------------------------------- encoding

pub(crate) fn write_settings(values: &[(u16, u32)], out: &mut Vec<u8>) {
    FrameHeader {
        length: (values.len() * 6) as u32,
        kind: kind::SETTINGS,
        flags: 0,
        stream_id: 0,
    }
    .write(out);
    for (id, value) in values {
        out.put_u16(*id);
        out.put_u32(*value);
    }
}

pub(crate) fn write_settings_ack(out: &mut Vec<u8>) {
    FrameHeader {
        length: 0,
        kind: kind::SETTINGS,
        flags: flag::ACK,
        stream_id: 0,
    }
    .write(out);
}

pub(crate) fn write_ping_ack(payload: &[u8; 8], out: &mut Vec<u8>) {
    FrameHeader {
        length: 8,
        kind: kind::PING,
        flags: flag::ACK,
        stream_id: 0,
    }
    .write(out);
    out.extend_from_slice(payload);
}

/// A header block as one HEADERS frame, followed by CONTINUATION frames when
/// the block is larger than `max_frame_size`.
pub(crate) fn write_headers(
    stream_id: u32,
    block: &[u8],
    end_stream: bool,
    max_frame_size: u32,
    out: &mut Vec<u8>,
) {
    let max = max_frame_size as usize;
    let mut parts = block.chunks(max.max(1)).peekable();
    let first = parts.next().unwrap_or(&[]);

    let mut flags = if end_stream { flag::END_STREAM } else { 0 };
    if parts.peek().is_none() {
        flags |= flag::END_HEADERS;
    }

    FrameHeader {
        length: first.len() as u32,
        kind: kind::HEADERS,
        flags,
        stream_id,
    }
    .write(out);
    out.extend_from_slice(first);

    while let Some(part) = parts.next() {
        let flags = if parts.peek().is_none() {
            flag::END_HEADERS
        } else {
            0
        };
        FrameHeader {
            length: part.len() as u32,
            kind: kind::CONTINUATION,
            flags,
            stream_id,
        }
        .write(out);
        out.extend_from_slice(part);
    }
}

pub(crate) fn write_data(stream_id: u32, data: &[u8], end_stream: bool, out: &mut Vec<u8>) {
    FrameHeader {
        length: data.len() as u32,
        kind: kind::DATA,
        flags: if end_stream { flag::END_STREAM } else { 0 },
        stream_id,
    }
    .write(out);
    out.extend_from_slice(data);
}

pub(crate) fn write_rst_stream(stream_id: u32, code: u32, out: &mut Vec<u8>) {
    FrameHeader {
        length: 4,
        kind: kind::RST_STREAM,
        flags: 0,
        stream_id,
    }
    .write(out);
    out.put_u32(code);
}

pub(crate) fn write_goaway(last_stream_id: u32, code: u32, debug: &str, out: &mut Vec<u8>) {
    FrameHeader {
        length: 8 + debug.len() as u32,
        kind: kind::GOAWAY,
        flags: 0,
        stream_id: 0,
    }
    .write(out);
    out.put_u32(last_stream_id & MAX_WINDOW);
    out.put_u32(code);
    out.extend_from_slice(debug.as_bytes());
}

pub(crate) fn write_window_update(stream_id: u32, increment: u32, out: &mut Vec<u8>) {
    FrameHeader {
        length: 4,
        kind: kind::WINDOW_UPDATE,
        flags: 0,
        stream_id,
    }
    .write(out);
    out.put_u32(increment & MAX_WINDOW);
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Raw frame bytes, for feeding decoders in tests.
    pub(crate) fn raw(kind: u8, flags: u8, stream_id: u32, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![];
        FrameHeader {
            length: payload.len() as u32,
            kind,
            flags,
            stream_id,
        }
        .write(&mut out);
        out.extend_from_slice(payload);
        out
    }

    fn decode_one(bytes: &[u8]) -> Result<Option<Frame>, Error> {
        let mut buf = BytesMut::from(bytes);
        decode(&mut buf, MIN_MAX_FRAME_SIZE)
    }

    #[test]
    fn partial_frame_waits() {
        let bytes = raw(kind::PING, 0, 0, &[1; 8]);
        let mut buf = BytesMut::from(&bytes[..12]);
        assert!(decode(&mut buf, MIN_MAX_FRAME_SIZE).unwrap().is_none());
        assert_eq!(buf.len(), 12);
        buf.extend_from_slice(&bytes[12..]);
        assert_eq!(
            decode(&mut buf, MIN_MAX_FRAME_SIZE).unwrap(),
            Some(Frame::Ping {
                ack: false,
                payload: [1; 8]
            })
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn padded_data_counts_padding_for_flow_control() {
        let bytes = raw(kind::DATA, flag::PADDED | flag::END_STREAM, 1, b"\x02abc\0\0");
        assert_eq!(
            decode_one(&bytes).unwrap(),
            Some(Frame::Data {
                stream_id: 1,
                data: Bytes::from_static(b"abc"),
                flow_len: 6,
                end_stream: true,
            })
        );
    }

    #[test]
    fn headers_priority_is_skipped() {
        let bytes = raw(kind::HEADERS, flag::PRIORITY | flag::END_HEADERS, 3, b"\0\0\0\x01\x10\x82");
        assert_eq!(
            decode_one(&bytes).unwrap(),
            Some(Frame::Headers {
                stream_id: 3,
                block: Bytes::from_static(b"\x82"),
                end_stream: false,
                end_headers: true,
            })
        );
    }

    #[test]
    fn malformed_frames() {
        assert!(matches!(
            decode_one(&raw(kind::DATA, 0, 0, b"x")),
            Err(Error::H2(code::PROTOCOL_ERROR, _))
        ));
        assert!(matches!(
            decode_one(&raw(kind::SETTINGS, 0, 0, b"\0\0\0")),
            Err(Error::H2(code::FRAME_SIZE_ERROR, _))
        ));
        assert!(matches!(
            decode_one(&raw(kind::PING, 0, 0, b"short")),
            Err(Error::H2(code::FRAME_SIZE_ERROR, _))
        ));

        let big = raw(kind::DATA, 0, 1, &vec![0; MIN_MAX_FRAME_SIZE as usize + 1]);
        assert!(matches!(decode_one(&big), Err(Error::H2(code::FRAME_SIZE_ERROR, _))));
    }

    #[test]
    fn unknown_type_is_kept_for_ignoring() {
        assert_eq!(
            decode_one(&raw(0xfa, 0, 5, b"whatever")).unwrap(),
            Some(Frame::Unknown {
                kind: 0xfa,
                stream_id: 5
            })
        );
    }

    #[test]
    fn large_header_block_uses_continuation() {
        let block = vec![7; 40_000];
        let mut out = vec![];
        write_headers(1, &block, true, MIN_MAX_FRAME_SIZE, &mut out);

        let mut buf = BytesMut::from(&out[..]);
        let mut frames = vec![];
        while let Some(f) = decode(&mut buf, MIN_MAX_FRAME_SIZE).unwrap() {
            frames.push(f);
        }

        assert_eq!(frames.len(), 3);
        assert!(matches!(
            &frames[0],
            Frame::Headers {
                end_stream: true,
                end_headers: false,
                ..
            }
        ));
        assert!(matches!(&frames[1], Frame::Continuation { end_headers: false, .. }));
        assert!(matches!(&frames[2], Frame::Continuation { end_headers: true, block, .. } if block.len() == 40_000 - 2 * 16_384));
    }
}
