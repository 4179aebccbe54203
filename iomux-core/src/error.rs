use std::fmt::{self, Debug, Display};
use std::io;

use crate::{Record, TransportKind};

/// Errors produced by the multiplexer itself.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `read` was called with no tags registered.
    #[error("no connections registered")]
    NoConnections,

    /// The multiplexer has been closed.
    #[error("multiplexer closed")]
    Closed,

    /// The tag is already registered with a live endpoint.
    #[error("tag is already registered")]
    DuplicateTag,

    /// The poller or the transport could not be created.
    #[error("failed to set up {transport} transport: {source}")]
    Setup {
        transport: TransportKind,
        source: io::Error,
    },

    /// An I/O error occurred while registering or reading an endpoint.
    #[error("multiplexer I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether this is a setup failure caused by the host not supporting the
    /// requested socket kind. Callers may treat it as "skip" rather than a
    /// hard failure.
    pub fn is_unsupported(&self) -> bool {
        let Error::Setup { source, .. } = self else {
            return false;
        };
        if source.kind() == io::ErrorKind::Unsupported {
            return true;
        }
        matches!(
            source.raw_os_error(),
            Some(libc::EPROTONOSUPPORT)
                | Some(libc::ESOCKTNOSUPPORT)
                | Some(libc::EOPNOTSUPP)
                | Some(libc::EAFNOSUPPORT)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Why a `read_while` drain stopped short.
#[derive(Debug, thiserror::Error)]
pub enum DrainError<E> {
    #[error(transparent)]
    Mux(#[from] Error),

    /// The work returned this error; it is passed through untouched.
    #[error("work failed: {0}")]
    Work(E),
}

impl<E> DrainError<E> {
    /// The work's own error, if that is what stopped the drain.
    pub fn work(&self) -> Option<&E> {
        match self {
            DrainError::Work(e) => Some(e),
            DrainError::Mux(_) => None,
        }
    }

    pub fn into_work(self) -> Option<E> {
        match self {
            DrainError::Work(e) => Some(e),
            DrainError::Mux(_) => None,
        }
    }
}

/// A failed `read_while`, carrying every record collected before it failed.
#[derive(Debug)]
pub struct Interrupted<T, E> {
    pub records: Vec<Record<T>>,
    pub error: DrainError<E>,
}

impl<T, E> Interrupted<T, E> {
    pub fn into_parts(self) -> (Vec<Record<T>>, DrainError<E>) {
        (self.records, self.error)
    }
}

impl<T, E: Display> Display for Interrupted<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "drain interrupted after {} records: {}",
            self.records.len(),
            self.error
        )
    }
}

impl<T: Debug, E: Debug + Display> std::error::Error for Interrupted<T, E> {}

#[derive(Debug, thiserror::Error)]
#[error("unknown transport {0:?} (expected unix, unixgram or unixpacket)")]
pub struct ParseTransportError(pub String);
