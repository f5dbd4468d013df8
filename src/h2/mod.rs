//! HTTP/2 adapter.
//!
//! Every stream is bound to its own exchange in a stream table. Streams respond
//! independently of each other; outbound DATA is shared between them round-robin
//! within the flow control windows.

mod connection;
mod frame;

pub(crate) use connection::Connection;
pub(crate) use frame::{decode as decode_frame, PREFACE};
