//! Crate-local error kinds, so callers match on categories from the design
//! rather than raw `io::ErrorKind`/errno values.

use std::fmt;
use std::io;

/// The error kinds a reactor-core operation can surface.
#[derive(Debug)]
pub enum ReactorError {
    /// The peer closed its end of the connection (`read` returned `0`).
    PeerClosed,
    /// A hard I/O error, from either a syscall or from an underlying `mio`/`std` call.
    Io(io::Error),
    /// A user codec reported malformed framing; the connection is being shut down.
    ProtocolViolation(String),
    /// An in-loop operation was invoked from a thread other than the loop's owner.
    ThreadAffinityViolation,
    /// A second `EventLoop` was constructed on a thread that already owns one.
    DuplicateLoopInThread,
}

impl fmt::Display for ReactorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReactorError::PeerClosed => write!(f, "peer closed the connection"),
            ReactorError::Io(e) => write!(f, "I/O error: {e}"),
            ReactorError::ProtocolViolation(msg) => write!(f, "protocol violation: {msg}"),
            ReactorError::ThreadAffinityViolation => {
                write!(f, "operation invoked from a thread that does not own the event loop")
            }
            ReactorError::DuplicateLoopInThread => {
                write!(f, "an EventLoop already exists on this thread")
            }
        }
    }
}

impl std::error::Error for ReactorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReactorError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ReactorError {
    fn from(e: io::Error) -> Self {
        ReactorError::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, ReactorError>;
