//! Server-sent events.
//!
//! ```
//! use hreq_exchange::SseEvent;
//!
//! let event = SseEvent::new().id("1").event("tick").data("a\nb");
//! assert_eq!(&event.encode()[..], b"id:1\nevent:tick\ndata:a\r\ndata:b\r\n\r\n");
//! ```

use crate::body::BodySender;
use crate::Error;
use bytes::Bytes;
use std::task::{Context, Poll};

/// Content type of an event stream response.
pub(crate) const SSE_CONTENT_TYPE: &str = "text/event-stream;charset=utf-8";

/// One server-sent event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    id: Option<String>,
    event: Option<String>,
    comment: Option<String>,
    data: Option<String>,
}

impl SseEvent {
    /// An empty event.
    pub fn new() -> Self {
        SseEvent::default()
    }

    /// The `id` field, remembered by the client for reconnects.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// The `event` type field.
    pub fn event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }

    /// A comment, ignored by clients. Keeps idle connections open.
    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// The `data` field. Line breaks become several `data` lines.
    pub fn data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Wire form of the event. Line breaks in comments and data continue the
    /// field on the next line, and the event ends with a blank line.
    pub fn encode(&self) -> Bytes {
        let mut out = String::new();

        if let Some(id) = &self.id {
            out.push_str("id:");
            out.push_str(id);
            out.push('\n');
        }
        if let Some(event) = &self.event {
            out.push_str("event:");
            out.push_str(event);
            out.push('\n');
        }
        if let Some(comment) = &self.comment {
            out.push(':');
            escape_lines(comment, "\r\n:", &mut out);
            out.push('\n');
        }
        if let Some(data) = &self.data {
            out.push_str("data:");
            escape_lines(data, "\r\ndata:", &mut out);
        }
        out.push_str("\r\n\r\n");

        out.into()
    }
}

/// Replace each CRLF, CR or LF in `s` with `sep`.
fn escape_lines(s: &str, sep: &str, out: &mut String) {
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                out.push_str(sep);
            }
            '\n' => out.push_str(sep),
            c => out.push(c),
        }
    }
}

/// Sends events of a server-sent event response.
///
/// Obtained from [`ResponseBody::sse`]. Dropping the sender ends the response.
///
/// [`ResponseBody::sse`]: struct.ResponseBody.html#method.sse
#[derive(Debug)]
pub struct SseSender {
    tx: BodySender,
}

impl SseSender {
    pub(crate) fn new(tx: BodySender) -> Self {
        SseSender { tx }
    }

    /// Poll for credit to send one event.
    pub fn poll_ready(&mut self, cx: &mut Context) -> Poll<Result<(), Error>> {
        self.tx.poll_ready(cx)
    }

    /// Wait for credit, then send an event.
    pub async fn send(&mut self, event: SseEvent) -> Result<(), Error> {
        self.tx.send(event.encode()).await
    }

    /// Send an event. Fails without sending if there is no credit.
    pub fn try_send(&mut self, event: SseEvent) -> Result<(), Error> {
        self.tx.try_send(event.encode())
    }

    /// Whether the client is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// End the response.
    pub fn finish(self) {
        self.tx.finish();
    }

    /// Fail the response.
    pub fn abort(self, error: impl Into<Error>) {
        self.tx.abort(error);
    }
}
