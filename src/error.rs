//! Error kinds and propagation policy.
//!
//! Expected failures (a metadata query miss, a coverage gap in the local
//! extent index) are ordinary variants that drive fallback paths. Transport
//! and lock failures surface to the caller. Invariant violations are not
//! representable here; they panic.

use std::error;
use std::fmt;
use std::io;

use crate::wire::FrameError;

/// Result alias used throughout the crate.
pub type TfsResult<T> = Result<T, TfsError>;

/// Error returned by TangramFS operations.
#[derive(Debug)]
pub enum TfsError {
    /// Local file I/O failure (scratch file or PFS).
    Io(io::Error),
    /// Active-message send or endpoint failure. The calling RPC fails;
    /// higher levels fall back to the PFS where applicable.
    Transport(io::Error),
    /// Malformed wire frame.
    Frame(FrameError),
    /// Metadata query miss: no client has posted the requested range.
    NotFound,
    /// A conflicting token is held by another client.
    LockConflict {
        /// Logical file the request was made against.
        path: String,
        /// Requested range start.
        offset: u64,
        /// Requested range length.
        count: u64,
    },
    /// The local extent index cannot fully cover the requested range.
    IndexGap,
    /// Missing environment variable or unreadable address file. Fatal at init.
    Config(String),
}

impl fmt::Display for TfsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TfsError::Io(err) => write!(f, "I/O error: {err}"),
            TfsError::Transport(err) => write!(f, "transport error: {err}"),
            TfsError::Frame(err) => write!(f, "bad frame: {err}"),
            TfsError::NotFound => write!(f, "no owner recorded for the requested range"),
            TfsError::LockConflict {
                path,
                offset,
                count,
            } => write!(
                f,
                "lock conflict on {path} [{offset}, +{count}); release or retry"
            ),
            TfsError::IndexGap => write!(f, "local extents do not cover the requested range"),
            TfsError::Config(what) => write!(f, "configuration error: {what}"),
        }
    }
}

impl error::Error for TfsError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            TfsError::Io(err) | TfsError::Transport(err) => Some(err),
            TfsError::Frame(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for TfsError {
    fn from(err: io::Error) -> Self {
        TfsError::Io(err)
    }
}

impl From<nix::Error> for TfsError {
    fn from(err: nix::Error) -> Self {
        TfsError::Io(io::Error::from(err))
    }
}

impl From<FrameError> for TfsError {
    fn from(err: FrameError) -> Self {
        TfsError::Frame(err)
    }
}

impl From<TfsError> for io::Error {
    fn from(err: TfsError) -> Self {
        match err {
            TfsError::Io(err) | TfsError::Transport(err) => err,
            TfsError::NotFound => io::Error::new(io::ErrorKind::NotFound, err.to_string()),
            TfsError::LockConflict { .. } => {
                io::Error::new(io::ErrorKind::WouldBlock, err.to_string())
            }
            other => io::Error::other(other.to_string()),
        }
    }
}
