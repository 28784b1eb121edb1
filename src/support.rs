use std::borrow::Cow;
use std::fmt;
use std::io;

/// First code available for embedder-defined errors.
pub const USER_ERROR_BASE: u16 = 1000;

pub type ProtocolResult<T> = Result<T, Error>;

/// Stable numeric error classification surfaced to the host.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    Unexpected = 1,
    InsufficientBufferSize = 2,
    Decode = 3,
    Encode = 4,
    InvalidChannelId = 5,
    InvalidReference = 6,
    InvalidPipeEvent = 7,
    InvalidMessageType = 8,
    Write = 9,
    State = 10,
}

impl ErrorKind {
    /// The wire-stable numeric code for this kind.
    #[inline]
    pub fn code(self) -> u16 {
        self as u16
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ErrorKind::Unexpected => "unexpected",
            ErrorKind::InsufficientBufferSize => "insufficient buffer size",
            ErrorKind::Decode => "decode",
            ErrorKind::Encode => "encode",
            ErrorKind::InvalidChannelId => "invalid channel id",
            ErrorKind::InvalidReference => "invalid reference",
            ErrorKind::InvalidPipeEvent => "invalid pipe event",
            ErrorKind::InvalidMessageType => "invalid message type",
            ErrorKind::Write => "write",
            ErrorKind::State => "state",
        };
        f.write_str(name)
    }
}

/// Error kind paired with a human readable message. Every error handed
/// outward carries both.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Error {
    kind: ErrorKind,
    message: Cow<'static, str>,
}

impl Error {
    #[inline]
    pub fn new<M: Into<Cow<'static, str>>>(kind: ErrorKind, message: M) -> Error {
        Error {
            kind,
            message: message.into(),
        }
    }

    #[inline]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[inline]
    pub fn code(&self) -> u16 {
        self.kind.code()
    }

    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({}): {}", self.kind, self.code(), self.message)
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        Error::new(ErrorKind::Unexpected, io_error.to_string())
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for ProtocolResult<T> {
    fn has_failed(&self) -> bool {
        self.is_err()
    }
}
