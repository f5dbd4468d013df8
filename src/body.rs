//! Body streams between protocol adapters and handlers.
//!
//! A body is a sequence of [`Bytes`] chunks that ends normally or with an error.
//! The producing side must wait for credit before sending, which is how a slow
//! consumer pushes back on a fast producer.

use crate::mpsc::{self, Receiver, Sender, TrySendError};
use crate::{AsyncRead, Error};
use bytes::Bytes;
use futures_util::future::poll_fn;
use futures_util::ready;
use futures_util::stream::Stream;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Create a body stream that buffers at most `bound` chunks.
pub fn channel(bound: usize) -> (BodySender, BodyStream) {
    let (tx, rx) = mpsc::channel(bound, |b: &Bytes| b.len());

    (
        BodySender { tx },
        BodyStream {
            rx,
            ready: None,
            index: 0,
        },
    )
}

/// Producing end of a body.
///
/// Dropping the sender ends the body normally.
pub struct BodySender {
    tx: Sender<Bytes>,
}

impl BodySender {
    /// Poll for whether there is credit to send another chunk.
    ///
    /// Fails if the consumer is gone or the body was disposed.
    pub fn poll_ready(&mut self, cx: &mut Context) -> Poll<Result<(), Error>> {
        self.tx.poll_ready(cx)
    }

    /// Wait until there is credit to send another chunk.
    pub async fn ready(&mut self) -> Result<(), Error> {
        poll_fn(|cx| self.poll_ready(cx)).await
    }

    /// Send a chunk. Fails without sending if there is no credit.
    pub fn try_send(&mut self, data: impl Into<Bytes>) -> Result<(), Error> {
        match self.tx.try_send(data.into()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(Error::User(
                "Body chunk sent without credit, await ready() first".into(),
            )),
            Err(TrySendError::Closed(_)) => crate::err_closed(),
        }
    }

    /// Wait for credit, then send a chunk.
    pub async fn send(&mut self, data: impl Into<Bytes>) -> Result<(), Error> {
        self.ready().await?;
        self.try_send(data)
    }

    /// End the body normally.
    pub fn finish(mut self) {
        self.tx.finish();
    }

    /// End the body with an error.
    pub fn abort(mut self, error: impl Into<Error>) {
        self.tx.fail(error.into());
    }

    /// Whether the consumer is gone, in which case further chunks are dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Enqueue regardless of credit. Returns false if the chunk was dropped.
    pub(crate) fn force_send(&mut self, data: Bytes) -> bool {
        self.tx.force_send(data)
    }

    pub(crate) fn end(&mut self) {
        self.tx.finish();
    }

    pub(crate) fn fail(&mut self, error: Error) {
        self.tx.fail(error);
    }

    /// Release buffered chunks. Returns how many were released.
    pub(crate) fn dispose(&mut self) -> usize {
        self.tx.dispose()
    }

    /// Bytes consumed by the receiving side since the last call.
    pub(crate) fn poll_consumed(&mut self, cx: &mut Context) -> Poll<usize> {
        self.tx.poll_consumed(cx)
    }
}

/// Consuming end of a body.
///
/// Implements both [`Stream`] of chunks and [`AsyncRead`].
pub struct BodyStream {
    rx: Receiver<Bytes>,
    ready: Option<Bytes>,
    index: usize,
}

impl BodyStream {
    /// A body without any chunks.
    pub fn empty() -> Self {
        let (_, rx) = channel(1);
        rx
    }

    /// Poll for the next chunk.
    pub fn poll_chunk(&mut self, cx: &mut Context) -> Poll<Option<Result<Bytes, Error>>> {
        if let Some(ready) = self.ready.take() {
            let rest = ready.slice(self.index..);
            self.index = 0;
            if !rest.is_empty() {
                return Some(Ok(rest)).into();
            }
        }

        self.rx.poll_recv(cx)
    }

    /// Receive the next chunk, `None` at the end of the body.
    pub async fn chunk(&mut self) -> Option<Result<Bytes, Error>> {
        poll_fn(|cx| self.poll_chunk(cx)).await
    }

    /// Read the remaining body into one buffer.
    pub async fn collect(mut self) -> Result<Bytes, Error> {
        let mut chunks: Vec<Bytes> = vec![];

        while let Some(chunk) = self.chunk().await {
            chunks.push(chunk?);
        }

        if chunks.len() == 1 {
            // single chunk, no copy
            return Ok(chunks.remove(0));
        }

        Ok(chunks.concat().into())
    }

    /// Read the remaining body as a string, failing on invalid UTF-8.
    pub async fn collect_string(self) -> Result<String, Error> {
        let bytes = self.collect().await?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::User(format!("Body is not valid UTF-8: {}", e)))
    }

    /// Release every buffered chunk and stop accepting more.
    ///
    /// Returns how many chunks were released.
    pub fn dispose(&mut self) -> usize {
        let partial = self.ready.take().map(|_| 1).unwrap_or(0);
        self.index = 0;
        partial + self.rx.dispose()
    }

    /// Whether the body is completely read.
    pub fn is_end(&self) -> bool {
        self.ready.is_none() && self.rx.is_end()
    }
}

impl Stream for BodyStream {
    type Item = Result<Bytes, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_chunk(cx)
    }
}

impl AsyncRead for BodyStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        loop {
            // First ship out ready data already received.
            if let Some(ready) = &this.ready {
                let i = this.index;

                let max = buf.len().min(ready.len() - i);

                buf[0..max].copy_from_slice(&ready[i..(i + max)]);
                this.index += max;

                if this.index == ready.len() {
                    // all used up
                    this.ready = None;
                    this.index = 0;
                }

                return Ok(max).into();
            }

            match ready!(this.rx.poll_recv(cx)) {
                None => {
                    // Channel is ended which indicates end of body.
                    return Ok(0).into();
                }
                Some(Ok(v)) => {
                    if !v.is_empty() {
                        this.ready = Some(v);
                        this.index = 0;
                    }
                }
                Some(Err(e)) => {
                    return Err(e.into_io()).into();
                }
            }
        }
    }
}

impl fmt::Debug for BodySender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BodySender")
    }
}

impl fmt::Debug for BodyStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BodyStream")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::io::AsyncReadExt;
    use futures_util::task::noop_waker;

    #[async_std::test]
    async fn send_then_collect() {
        let (mut tx, rx) = channel(2);

        let producer = async_std::task::spawn(async move {
            for part in &["a", "b", "c", "d"] {
                tx.send(*part).await.unwrap();
            }
            tx.finish();
        });

        let body = rx.collect_string().await.unwrap();
        producer.await;

        assert_eq!(body, "abcd");
    }

    #[test]
    fn try_send_without_credit_fails() {
        let (mut tx, _rx) = channel(1);

        tx.try_send("one").unwrap();
        match tx.try_send("two") {
            Err(Error::User(_)) => {}
            r => panic!("unexpected: {:?}", r),
        }
    }

    #[test]
    fn dispose_counts_buffered_chunks() {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        let (mut tx, mut rx) = channel(4);
        tx.try_send("one").unwrap();
        tx.try_send("two").unwrap();

        assert_eq!(rx.dispose(), 2);
        assert!(tx.poll_ready(&mut cx).is_ready());
        assert!(tx.try_send("three").is_err());
        assert!(tx.is_closed());
    }

    #[async_std::test]
    async fn read_in_small_pieces() {
        let (mut tx, mut rx) = channel(4);
        tx.try_send("hello world").unwrap();
        drop(tx);

        let mut buf = [0_u8; 4];
        let mut s = vec![];
        loop {
            let n = rx.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            s.extend_from_slice(&buf[..n]);
        }
        assert_eq!(s, b"hello world");
    }

    #[async_std::test]
    async fn abort_surfaces_error() {
        let (mut tx, rx) = channel(4);
        tx.try_send("partial").unwrap();
        tx.abort(crate::HttpError::BadRequest("nope".into()));

        assert!(rx.collect().await.is_err());
    }
}
