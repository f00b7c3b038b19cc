//! `postern` error types.
use std::{fmt, io};

use crate::ctxwatch::CancelCause;
use crate::postgres::{PgError, ProtocolError};
use crate::sasl::SaslError;

/// A specialized [`Result`] type for `postern` operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All possible errors from the `postern` library.
///
/// Every error knows whether the operation that produced it is guaranteed
/// to have written nothing to the wire; see [`Error::no_bytes_sent`].
pub struct Error {
    kind: ErrorKind,
    no_bytes_sent: bool,
}

/// All possible error kinds from the `postern` library.
#[non_exhaustive]
pub enum ErrorKind {
    /// Establishing a session failed on every endpoint.
    Connect(ConnectError),
    /// The server reported a statement-level error. The connection is
    /// still valid.
    Db(Box<PgError>),
    /// An operation was started while the connection was busy or closed.
    Lock(LockReason),
    /// The cancellation token had already fired before the operation
    /// wrote anything. The connection is still valid.
    AlreadyCanceled(CancelCause),
    /// The operation was canceled or timed out mid-flight. The connection
    /// is closed.
    Canceled(CancelCause),
    /// Writing to the transport failed. The connection is closed.
    Write(io::Error),
    /// Reading from the transport failed. The connection is closed.
    Io(io::Error),
    /// The byte stream violated the protocol. The connection is closed.
    Protocol(ProtocolError),
    /// The server requested an authentication method this crate does not speak.
    UnsupportedAuth(String),
    /// The SCRAM exchange failed.
    Sasl(SaslError),
    /// An extended-query operation carried more than 65535 parameters.
    TooManyParams,
    /// Anything else.
    Other(std::borrow::Cow<'static, str>),
}

/// Which connection state rejected the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockReason {
    Busy,
    Closed,
}

impl Error {
    /// The kind of this error.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Whether the failed operation is guaranteed to have written no bytes
    /// to the wire, leaving the server's state untouched.
    ///
    /// When this is `true` the connection is still valid and the operation
    /// is safe to retry; when `false` the connection may be closed and the
    /// server state is unknown.
    pub fn no_bytes_sent(&self) -> bool {
        self.no_bytes_sent
    }

    /// The server error, when this is a statement-level error.
    pub fn as_db(&self) -> Option<&PgError> {
        match &self.kind {
            ErrorKind::Db(e) => Some(&**e),
            _ => None,
        }
    }

    /// Whether this is a statement-level server error, which leaves the
    /// connection valid.
    pub fn is_db(&self) -> bool {
        matches!(self.kind, ErrorKind::Db(_))
    }

    fn new(kind: ErrorKind) -> Error {
        Error {
            kind,
            no_bytes_sent: false,
        }
    }

    fn new_clean(kind: ErrorKind) -> Error {
        Error {
            kind,
            no_bytes_sent: true,
        }
    }

    pub(crate) fn busy() -> Error {
        Self::new_clean(ErrorKind::Lock(LockReason::Busy))
    }

    pub(crate) fn closed() -> Error {
        Self::new_clean(ErrorKind::Lock(LockReason::Closed))
    }

    /// A closed-connection error observed mid-operation, after bytes may
    /// already have been written.
    pub(crate) fn closed_mid_operation() -> Error {
        Self::new(ErrorKind::Lock(LockReason::Closed))
    }

    pub(crate) fn pre_canceled(cause: CancelCause) -> Error {
        Self::new_clean(ErrorKind::AlreadyCanceled(cause))
    }

    pub(crate) fn canceled(cause: CancelCause) -> Error {
        Self::new(ErrorKind::Canceled(cause))
    }

    pub(crate) fn too_many_params() -> Error {
        Self::new_clean(ErrorKind::TooManyParams)
    }

    pub(crate) fn write(err: io::Error) -> Error {
        Self::new(ErrorKind::Write(err))
    }

    pub(crate) fn connect(err: ConnectError) -> Error {
        Self::new(ErrorKind::Connect(err))
    }

    pub(crate) fn unsupported_auth(method: impl Into<String>) -> Error {
        Self::new(ErrorKind::UnsupportedAuth(method.into()))
    }

    pub(crate) fn other(msg: impl Into<std::borrow::Cow<'static, str>>) -> Error {
        Self::new(ErrorKind::Other(msg.into()))
    }
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for Error {
            fn from($pat: $ty) -> Self {
                Error {
                    kind: $body,
                    no_bytes_sent: false,
                }
            }
        }
    };
}

from!(<ErrorKind>e => e);
from!(<PgError>e => ErrorKind::Db(Box::new(e)));
from!(<ProtocolError>e => ErrorKind::Protocol(e));
from!(<io::Error>e => ErrorKind::Io(e));
from!(<SaslError>e => ErrorKind::Sasl(e));

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ErrorKind::Db(e) => Some(&**e),
            ErrorKind::Write(e) | ErrorKind::Io(e) => Some(e),
            ErrorKind::Protocol(e) => Some(e),
            ErrorKind::Sasl(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.kind, f)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect(e) => e.fmt(f),
            Self::Db(e) => e.fmt(f),
            Self::Lock(LockReason::Busy) => f.write_str("conn busy"),
            Self::Lock(LockReason::Closed) => f.write_str("conn closed"),
            Self::AlreadyCanceled(cause) => {
                write!(f, "cancellation token already fired: {cause}")
            }
            Self::Canceled(cause) => cause.fmt(f),
            Self::Write(e) => write!(f, "write failed: {e}"),
            Self::Io(e) => e.fmt(f),
            Self::Protocol(e) => e.fmt(f),
            Self::UnsupportedAuth(method) => {
                write!(f, "unsupported authentication method: {method}")
            }
            Self::Sasl(e) => e.fmt(f),
            Self::TooManyParams => f.write_str("extended protocol limited to 65535 parameters"),
            Self::Other(msg) => f.write_str(msg),
        }
    }
}

impl fmt::Debug for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

/// The composite failure of a connection attempt: one cause per endpoint
/// tried, in order.
pub struct ConnectError {
    attempts: Vec<(String, Error)>,
}

impl ConnectError {
    pub(crate) fn new() -> ConnectError {
        ConnectError { attempts: vec![] }
    }

    pub(crate) fn push(&mut self, endpoint: String, cause: Error) {
        self.attempts.push((endpoint, cause));
    }

    /// The endpoints tried and the error each one produced.
    pub fn attempts(&self) -> impl Iterator<Item = (&str, &Error)> {
        self.attempts.iter().map(|(ep, e)| (ep.as_str(), e))
    }
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("failed to connect")?;
        for (endpoint, cause) in &self.attempts {
            write!(f, "; {endpoint}: {cause}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
