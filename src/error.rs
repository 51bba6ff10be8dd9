//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;

/// Result type often returned from methods that can produce an [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur while running the server or client halves
/// of the framework.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    /// Handshake or I/O error talking to the peer over the underlying `h2` session.
    Http2,
    /// Failure to bind or accept connections.
    Listen,
    /// The connection was not open when a send was attempted.
    NotConnected,
    /// TLS configuration (key/cert) could not be loaded.
    Tls,
}

impl Error {
    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    /// Returns true if this error ultimately comes from the underlying HTTP/2 session.
    pub fn is_http2(&self) -> bool {
        matches!(self.inner.kind, Kind::Http2)
    }

    /// Returns true if this was a listener/bind failure.
    pub fn is_listen(&self) -> bool {
        matches!(self.inner.kind, Kind::Listen)
    }

    pub(crate) fn new_h2(cause: h2::Error) -> Error {
        Error::new(Kind::Http2).with(cause)
    }

    pub(crate) fn new_listen<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Listen).with(cause)
    }

    pub(crate) fn new_not_connected() -> Error {
        Error::new(Kind::NotConnected)
    }

    pub(crate) fn new_tls<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Tls).with(cause)
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Http2 => "error in the underlying HTTP/2 session",
            Kind::Listen => "error binding or accepting connections",
            Kind::NotConnected => "the connection is not open",
            Kind::Tls => "error loading TLS key/certificate material",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("h2flow::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())?;
        if let Some(ref cause) = self.inner.cause {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.cause.as_ref().map(|c| &**c as &(dyn StdError + 'static))
    }
}

impl From<h2::Error> for Error {
    fn from(err: h2::Error) -> Error {
        Error::new_h2(err)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::new(Kind::Listen).with(err)
    }
}
