//! HTTP/1.x adapter.
//!
//! Requests are decoded from one ordered byte stream into a FIFO of exchanges.
//! Only the exchange at the front of the queue writes to the connection, so
//! responses leave in request order no matter how the handlers progress.

mod chunked;
mod connection;
mod http11;
mod limit;

pub(crate) use connection::Connection;
pub(crate) use http11::Decoder;
