#![warn(missing_docs, missing_debug_implementations)]
#![warn(clippy::all)]

//! A transport agnostic HTTP server engine built around exchanges.
//!
//! An [`Exchange`] is one request and its response. The request head is
//! available at once, both bodies are streams with credit based backpressure.
//! A handler fills in the response, either whole or as a stream, and the
//! protocol adapter serializes whatever the handler produces.
//!
//! Which async runtime to use, TCP and TLS are handled outside this library.
//! A [`server::Connection`] is a future over any `AsyncRead + AsyncWrite`
//! transport.
//!
//! ## In scope
//!
//! * HTTP/1.0 and HTTP/1.1 with pipelining, `Content-Length`,
//!   `Transfer-Encoding: chunked` and keep-alive.
//! * HTTP/2 over ALPN or prior knowledge, with one exchange per stream and
//!   flow control on both directions.
//! * Routing through a chain of path, method and content negotiation stages,
//!   see [`routing`].
//! * Error routes by status, path and produced media type.
//! * Response compression, server sent events, static resources and
//!   `multipart/form-data` request bodies.
//!
//! ## Out of scope
//!
//! * HTTP/2 server push and stream priorities.
//! * Upgrades (`h2c` upgrade, websockets).
//! * `Expect: 100-Continue`
//!
//! # Handshake
//!
//! Some connection must already have been established, this library does not
//! accept sockets. The entry points are [`server::handshake`] and
//! [`server::handshake_alpn`].

#[macro_use]
extern crate tracing;

mod body;
mod compress;
mod config;
mod error;
mod exchange;
mod h1;
mod h2;
mod mpsc;
mod multipart;
mod request;
mod resource;
mod response;
mod sse;
mod static_files;
mod try_write;

pub mod media;
pub mod routing;
pub mod server;

pub(crate) use futures_io::{AsyncRead, AsyncWrite};

pub use body::{channel, BodySender, BodyStream};
pub use compress::ContentEncoding;
pub use config::ServerConfig;
pub use error::{DecodeError, Error, HttpError};
pub use exchange::{DefaultErrorHandler, ErrorExchange, ErrorExchangeHandler};
pub use exchange::{Exchange, ExchangeHandler, ExchangeState, Service};
pub use multipart::{Multipart, Part};
pub use request::{BodyDecoder, ExchangeId, Request, UrlEncoded};
pub use resource::{FileResource, Resource};
pub use response::{Cookie, Response, ResponseBody, ResponseHeaders};
pub use sse::{SseEvent, SseSender};
pub use static_files::{StaticHandler, DEFAULT_PATH_PARAMETER};

pub(crate) fn err_closed<T>() -> Result<T, Error> {
    use std::io;
    Err(io::Error::new(io::ErrorKind::NotConnected, "Connection is closed").into())
}

/// Entry points for fuzzing the wire decoders.
#[doc(hidden)]
pub mod fuzz {
    use bytes::BytesMut;

    /// Run HTTP/1.x request decoding over `data` until it stops making progress.
    pub fn h1_decode(data: &[u8]) {
        let config = crate::ServerConfig::default();
        let mut decoder = crate::h1::Decoder::new(&config);
        let mut buf = BytesMut::from(data);

        while let Ok(Some(frame)) = decoder.decode(&mut buf) {
            trace!("Fuzz h1 frame: {:?}", frame);
        }
    }

    /// Run HTTP/2 frame decoding over `data` until it stops making progress.
    pub fn h2_decode(data: &[u8]) {
        let mut buf = BytesMut::from(data);

        while let Ok(Some(frame)) = crate::h2::decode_frame(&mut buf, 16_384) {
            trace!("Fuzz h2 frame: {:?}", frame);
        }
    }
}
