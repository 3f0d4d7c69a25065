use trackable::error::{ErrorKind as TrackableErrorKind, ErrorKindExt, TrackableError};

/// This crate specific `Error` type.
#[derive(Debug, Clone, TrackableError)]
pub struct Error(TrackableError<ErrorKind>);
impl From<std::io::Error> for Error {
    fn from(f: std::io::Error) -> Self {
        ErrorKind::Transport.cause(f).into()
    }
}
impl From<bytecodec::Error> for Error {
    fn from(f: bytecodec::Error) -> Self {
        ErrorKind::Protocol.takes_over(f).into()
    }
}

/// Possible error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The underlying I/O failed.
    Transport,

    /// The transaction layer gave up before delivering a response event.
    Transaction,

    /// A message was malformed or missing a required attribute.
    Protocol,

    /// The server answered with an ERROR-CODE the client cannot recover from.
    ServerError,

    /// A 401 that survived the credential retry (or no credentials were set).
    Unauthorized,

    /// A 438 that recurred after the nonce was refreshed.
    StaleNonce,

    /// A caller supplied an invalid argument.
    InvalidInput,

    /// `bind` was called on a connection that already has a channel number.
    AlreadyBound,

    /// Every channel number in `0x4000..=0x7FFF` is in use.
    Exhausted,

    /// The resource, or one of its owners, has been closed.
    Closed,

    /// A read or write deadline expired.
    Timeout,

    /// Other errors.
    Other,
}
impl TrackableErrorKind for ErrorKind {}
