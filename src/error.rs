use http::{Method, StatusCode};
use std::fmt;
use std::io;

/// Possible errors from this crate.
#[derive(Debug)]
pub enum Error {
    /// A user/usage problem such as sending body data without credit, or
    /// changing response headers after they are written.
    User(String),
    /// A wrapped std::io::Error from the underlying transport (socket).
    Io(io::Error),
    /// HTTP/1.1 parse errors from the `httparse` crate.
    Http11Parser(httparse::Error),
    /// Http errors from the `http` crate.
    Http(http::Error),
    /// Failure to decode an HTTP/1.x request head.
    Decode(DecodeError),
    /// HTTP/2 connection level protocol error with its RFC 7540 error code.
    H2(u32, String),
    /// Invalid server configuration.
    Config(String),
    /// Application level failure, carried through body streams.
    Exchange(HttpError),
}

impl Error {
    pub(crate) fn into_io(self) -> io::Error {
        match self {
            Error::Io(i) => i,
            e => io::Error::new(io::ErrorKind::Other, e),
        }
    }

    pub(crate) fn into_http(self) -> HttpError {
        match self {
            Error::Exchange(e) => e,
            Error::Decode(e) => HttpError::Status(e.status(), e.to_string()),
            e => HttpError::InternalServerError(e.to_string()),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::User(v) => write!(f, "{}", v),
            Error::Io(v) => fmt::Display::fmt(v, f),
            Error::Http11Parser(v) => write!(f, "http11 parser: {}", v),
            Error::Http(v) => write!(f, "http api: {}", v),
            Error::Decode(v) => write!(f, "http11 decode: {}", v),
            Error::H2(code, v) => write!(f, "h2 protocol (0x{:x}): {}", code, v),
            Error::Config(v) => write!(f, "config: {}", v),
            Error::Exchange(v) => write!(f, "exchange: {}", v),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<httparse::Error> for Error {
    fn from(e: httparse::Error) -> Self {
        Error::Http11Parser(e)
    }
}

impl From<http::Error> for Error {
    fn from(e: http::Error) -> Self {
        Error::Http(e)
    }
}

impl From<DecodeError> for Error {
    fn from(e: DecodeError) -> Self {
        Error::Decode(e)
    }
}

impl From<HttpError> for Error {
    fn from(e: HttpError) -> Self {
        Error::Exchange(e)
    }
}

/// Failure decoding an HTTP/1.x request head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The request line is longer than `max_initial_line_length`.
    LineTooLong(usize),
    /// The header section is larger than `max_header_size`, or has too many fields.
    HeadersTooLarge(usize),
    /// Anything else that makes the head unreadable.
    Malformed(String),
}

impl DecodeError {
    /// The status written back to the client before the connection is closed.
    pub fn status(&self) -> StatusCode {
        match self {
            DecodeError::LineTooLong(_) => StatusCode::URI_TOO_LONG,
            DecodeError::HeadersTooLarge(_) => StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
            DecodeError::Malformed(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DecodeError::LineTooLong(max) => write!(f, "An HTTP line is larger than {} bytes", max),
            DecodeError::HeadersTooLarge(max) => {
                write!(f, "HTTP header is larger than {} bytes", max)
            }
            DecodeError::Malformed(v) => write!(f, "{}", v),
        }
    }
}

impl From<httparse::Error> for DecodeError {
    fn from(e: httparse::Error) -> Self {
        match e {
            httparse::Error::TooManyHeaders => DecodeError::HeadersTooLarge(0),
            e => DecodeError::Malformed(e.to_string()),
        }
    }
}

/// Client visible failure of an exchange.
///
/// Returned by handlers and by the routing chain. Each variant maps to exactly
/// one status code through [`HttpError::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpError {
    /// 400
    BadRequest(String),
    /// 404, the resource does not exist.
    NotFound,
    /// 404, no route matched the request, or every matching route is disabled.
    RouteNotFound,
    /// 405, with the methods the matched resource supports.
    MethodNotAllowed(Vec<Method>),
    /// 406, with the media types the matched resource can produce.
    NotAcceptable(Vec<String>),
    /// 415
    UnsupportedMediaType,
    /// 500
    InternalServerError(String),
    /// Any other status with a message.
    Status(StatusCode, String),
}

impl HttpError {
    /// The response status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            HttpError::BadRequest(_) => StatusCode::BAD_REQUEST,
            HttpError::NotFound | HttpError::RouteNotFound => StatusCode::NOT_FOUND,
            HttpError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            HttpError::NotAcceptable(_) => StatusCode::NOT_ACCEPTABLE,
            HttpError::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            HttpError::InternalServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            HttpError::Status(s, _) => *s,
        }
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HttpError::BadRequest(v) => write!(f, "Bad request: {}", v),
            HttpError::NotFound => write!(f, "Not found"),
            HttpError::RouteNotFound => write!(f, "Route not found"),
            HttpError::MethodNotAllowed(m) => {
                let m: Vec<_> = m.iter().map(|m| m.as_str()).collect();
                write!(f, "Method not allowed, expected one of: {}", m.join(", "))
            }
            HttpError::NotAcceptable(t) => {
                write!(f, "Not acceptable, can produce: {}", t.join(", "))
            }
            HttpError::UnsupportedMediaType => write!(f, "Unsupported media type"),
            HttpError::InternalServerError(v) => write!(f, "Internal server error: {}", v),
            HttpError::Status(s, v) => write!(f, "{}: {}", s, v),
        }
    }
}

impl std::error::Error for HttpError {}

impl From<Error> for HttpError {
    fn from(e: Error) -> Self {
        e.into_http()
    }
}
