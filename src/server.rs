//! Connection driver binding a transport to a protocol adapter.
//!
//! A connection is a future that reads requests from the transport, runs them
//! through the [`Service`] and writes the responses back. It resolves when the
//! peer closes the connection, or when the protocol decides to close it.
//!
//! # Example
//!
//! ```rust, no_run
//! use async_std::net::TcpListener;
//! use hreq_exchange::{server, Exchange, HttpError, Service};
//! use std::error::Error;
//!
//! #[async_std::main]
//! async fn main() -> Result<(), Box<dyn Error>> {
//!     let listener = TcpListener::bind("127.0.0.1:3000").await?;
//!
//!     let service = Service::new(|ex: &mut Exchange| -> Result<(), HttpError> {
//!         ex.response_mut().body().string("Hello world!")?;
//!         Ok(())
//!     });
//!
//!     // Accept all incoming TCP connections.
//!     loop {
//!         let (socket, _peer_addr) = listener.accept().await?;
//!         let service = service.clone();
//!
//!         // Spawn a new task to process each connection individually
//!         async_std::task::spawn(async move {
//!             if let Err(e) = server::handshake(socket, service).await {
//!                 println!("Connection failed: {}", e);
//!             }
//!         });
//!     }
//! }
//! ```
//!
//! The protocol is chosen up front. [`handshake_alpn`] takes the ALPN result of
//! a TLS handshake, `h2` selects HTTP/2. Without ALPN, [`handshake`] looks for the
//! HTTP/2 connection preface ("prior knowledge") and falls back to HTTP/1.x.

use crate::exchange::Service;
use crate::h2::PREFACE;
use crate::try_write::try_write;
use crate::Error;
use crate::{h1, h2};
use crate::{AsyncRead, AsyncWrite};
use bytes::BytesMut;
use futures_util::ready;
use std::fmt;
use std::future::Future;
use std::io;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

/// Amount read from the transport in one go.
const READ_BUF_INIT_SIZE: usize = 16_384;

/// Adapters stop producing output when this much is waiting for the transport.
pub(crate) const MAX_BUFFERED_OUTPUT: usize = 65_536;

static CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Drive a connection over `io`, detecting HTTP/2 prior knowledge when
/// `h2c_enabled` is set in the service config.
pub fn handshake<S>(io: S, service: Service) -> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let id = CONNECTION_ID.fetch_add(1, Ordering::Relaxed);

    let proto = if service.config().h2c_enabled {
        Proto::Detect(service)
    } else {
        Proto::H1(h1::Connection::new(id, service))
    };

    Connection::new(io, id, proto)
}

/// Drive a connection over `io` with the protocol negotiated by ALPN.
///
/// `Some(b"h2")` runs HTTP/2, anything else HTTP/1.x.
pub fn handshake_alpn<S>(io: S, service: Service, alpn: Option<&[u8]>) -> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let id = CONNECTION_ID.fetch_add(1, Ordering::Relaxed);

    let proto = match alpn {
        Some(p) if p == b"h2" => Proto::H2(h2::Connection::new(id, service)),
        _ => Proto::H1(h1::Connection::new(id, service)),
    };

    Connection::new(io, id, proto)
}

/// Future driving one server connection.
///
/// Resolves with the protocol error that ended the connection, if any.
pub struct Connection<S>(Codec, PhantomData<S>);

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn new(io: S, id: u64, proto: Proto) -> Self {
        trace!("New connection: {}", id);
        Connection(
            Codec {
                id,
                io: Box::new(IoAdapt(io)),
                proto,
                read_buf: BytesMut::with_capacity(READ_BUF_INIT_SIZE),
                to_write: vec![],
                to_write_flush_after: false,
                eof: false,
            },
            PhantomData,
        )
    }
}

impl<S> Connection<S> {
    /// Process unique id of this connection.
    pub fn id(&self) -> u64 {
        self.0.id
    }
}

impl<S> Future for Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    type Output = Result<(), Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        this.0.poll_drive(cx)
    }
}

enum Proto {
    /// Waiting for enough input to tell HTTP/2 prior knowledge from HTTP/1.x.
    Detect(Service),
    H1(h1::Connection),
    H2(h2::Connection),
}

impl Proto {
    /// Settle the protocol once the first bytes are in. `false` while undecided.
    fn detect(&mut self, id: u64, input: &BytesMut, eof: bool) -> bool {
        let service = match self {
            Proto::Detect(service) => service.clone(),
            _ => return true,
        };

        let n = input.len().min(PREFACE.len());
        let prefix = input[..n] == PREFACE[..n];

        if prefix && n < PREFACE.len() && !eof {
            return false;
        }

        *self = if prefix && n == PREFACE.len() {
            debug!("Prior knowledge h2 on connection: {}", id);
            Proto::H2(h2::Connection::new(id, service))
        } else {
            Proto::H1(h1::Connection::new(id, service))
        };

        true
    }

    fn poll_drive(
        &mut self,
        cx: &mut Context,
        input: &mut BytesMut,
        out: &mut Vec<u8>,
    ) -> Result<(), Error> {
        match self {
            Proto::Detect(_) => Ok(()),
            Proto::H1(c) => c.poll_drive(cx, input, out),
            Proto::H2(c) => c.poll_drive(cx, input, out),
        }
    }

    fn recv_eof(&mut self) {
        match self {
            Proto::Detect(_) => {}
            Proto::H1(c) => c.recv_eof(),
            Proto::H2(c) => c.recv_eof(),
        }
    }

    fn wants_read(&self) -> bool {
        match self {
            Proto::Detect(_) => true,
            Proto::H1(c) => c.wants_read(),
            Proto::H2(c) => c.wants_read(),
        }
    }

    fn is_done(&self) -> bool {
        match self {
            Proto::Detect(_) => false,
            Proto::H1(c) => c.is_done(),
            Proto::H2(c) => c.is_done(),
        }
    }

    fn take_error(&mut self) -> Option<Error> {
        match self {
            Proto::Detect(_) => None,
            Proto::H1(c) => c.take_error(),
            Proto::H2(c) => c.take_error(),
        }
    }

    fn dispose(&mut self) {
        match self {
            Proto::Detect(_) => {}
            Proto::H1(c) => c.dispose(),
            Proto::H2(c) => c.dispose(),
        }
    }
}

struct Codec {
    id: u64,
    io: Box<dyn Io>,
    proto: Proto,
    read_buf: BytesMut,
    to_write: Vec<u8>,
    to_write_flush_after: bool,
    eof: bool,
}

impl Codec {
    fn poll_drive(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        loop {
            let decided = self.proto.detect(self.id, &self.read_buf, self.eof);

            if decided {
                if let Err(e) = self
                    .proto
                    .poll_drive(cx, &mut self.read_buf, &mut self.to_write)
                {
                    debug!("Connection {} failed: {}", self.id, e);
                    self.proto.dispose();
                    return Poll::Ready(Err(e));
                }
            }

            if !self.to_write.is_empty() {
                self.to_write_flush_after = true;
            }

            // adapters hold back output at the high-water mark.
            let stalled = self.to_write.len() >= MAX_BUFFERED_OUTPUT;

            let write_pending = match try_write(
                cx,
                &mut self.io,
                &mut self.to_write,
                &mut self.to_write_flush_after,
            ) {
                Poll::Pending => true,
                Poll::Ready(Ok(())) => false,
                Poll::Ready(Err(e)) => {
                    debug!("Write failed on connection {}: {}", self.id, e);
                    self.proto.dispose();
                    return Poll::Ready(Err(e.into()));
                }
            };

            if self.proto.is_done() {
                if write_pending {
                    return Poll::Pending;
                }

                if let Err(e) = ready!(Pin::new(&mut *self.io).poll_close(cx)) {
                    debug!("Close failed on connection {}: {}", self.id, e);
                }

                trace!("Connection done: {}", self.id);
                self.proto.dispose();

                return match self.proto.take_error() {
                    Some(e) => Poll::Ready(Err(e)),
                    None => Poll::Ready(Ok(())),
                };
            }

            if self.proto.wants_read() && !self.eof {
                match self.poll_read(cx) {
                    Poll::Pending => {}
                    Poll::Ready(Ok(())) => continue,
                    Poll::Ready(Err(e)) => {
                        debug!("Read failed on connection {}: {}", self.id, e);
                        self.proto.dispose();
                        return Poll::Ready(Err(e.into()));
                    }
                }
            }

            if stalled && !write_pending {
                continue;
            }

            return Poll::Pending;
        }
    }

    /// Append whatever the transport has to `read_buf`.
    fn poll_read(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let start = self.read_buf.len();
        self.read_buf.resize(start + READ_BUF_INIT_SIZE, 0);

        let poll = Pin::new(&mut *self.io).poll_read(cx, &mut self.read_buf[start..]);

        match poll {
            Poll::Ready(Ok(0)) => {
                self.read_buf.truncate(start);
                trace!("Read eof on connection: {}", self.id);
                self.eof = true;
                // an undecided connection is HTTP/1.x from here.
                self.proto.detect(self.id, &self.read_buf, true);
                self.proto.recv_eof();
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Ok(amount)) => {
                trace!("Read {} bytes on connection: {}", amount, self.id);
                self.read_buf.truncate(start + amount);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => {
                self.read_buf.truncate(start);
                Poll::Ready(Err(e))
            }
            Poll::Pending => {
                self.read_buf.truncate(start);
                Poll::Pending
            }
        }
    }
}

impl fmt::Debug for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Proto::Detect(_) => write!(f, "Detect"),
            Proto::H1(c) => write!(f, "{:?}", c),
            Proto::H2(c) => write!(f, "{:?}", c),
        }
    }
}

impl<S> fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Connection {} {:?}", self.0.id, self.0.proto)
    }
}

// ***************** Boiler plate to hide IO behind a Box<dyn trait> ***************

trait Io: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

struct IoAdapt<S>(S);

impl<S> Io for IoAdapt<S> where S: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<S> AsyncRead for IoAdapt<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        Pin::new(&mut this.0).poll_read(cx, buf)
    }
}

impl<S> AsyncWrite for IoAdapt<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        Pin::new(&mut this.0).poll_write(cx, buf)
    }
    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.0).poll_flush(cx)
    }
    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.0).poll_close(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Exchange, HttpError};
    use futures_util::io::Cursor;

    /// Transport that reads a fixed input and records what is written.
    struct Script {
        input: Cursor<Vec<u8>>,
        output: std::sync::Arc<std::sync::Mutex<Vec<u8>>>,
    }

    impl AsyncRead for Script {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut [u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.input).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for Script {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            self.output.lock().unwrap().extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }
        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn run(input: &[u8], alpn: Option<&[u8]>) -> (Result<(), Error>, Vec<u8>) {
        let output = std::sync::Arc::new(std::sync::Mutex::new(vec![]));
        let io = Script {
            input: Cursor::new(input.to_vec()),
            output: output.clone(),
        };

        let service = Service::new(|ex: &mut Exchange| -> Result<(), HttpError> {
            let path = ex.request().path().to_string();
            ex.response_mut().body().string(path)?;
            Ok(())
        });

        let conn = match alpn {
            Some(_) => handshake_alpn(io, service, alpn),
            None => handshake(io, service),
        };

        let res = async_std::task::block_on(conn);
        let out = output.lock().unwrap().clone();
        (res, out)
    }

    #[test]
    fn h1_is_served_until_eof() {
        let (res, out) = run(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n", None);
        assert!(res.is_ok());
        let out = String::from_utf8(out).unwrap();
        let a = out.find("\r\n\r\n/a").unwrap();
        let b = out.find("\r\n\r\n/b").unwrap();
        assert!(a < b);
    }

    #[test]
    fn preface_mismatch_is_h1() {
        let (res, out) = run(b"PRI * HTTP/2.0\r\n\r\nXX", None);
        assert!(matches!(res, Err(Error::Decode(_))));
        assert!(out.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));
    }

    #[test]
    fn prior_knowledge_starts_h2() {
        let (res, out) = run(PREFACE, None);
        assert!(res.is_ok());
        // server SETTINGS frame: type 0x4 on stream 0.
        assert_eq!(out[3], 0x4);
        assert_eq!(&out[5..9], &[0, 0, 0, 0]);
    }

    #[test]
    fn alpn_h2_expects_preface() {
        let (res, out) = run(b"GET / HTTP/1.1\r\n\r\n", Some(b"h2"));
        assert!(matches!(res, Err(Error::H2(..))));
        // SETTINGS then GOAWAY.
        assert!(out.len() > 9);
    }
}
