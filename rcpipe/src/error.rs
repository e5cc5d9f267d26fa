//! Error types for rcpipe.

use std::fmt;

/// Connection-level and operation-level errors.
///
/// Any variant except `FrameTooLarge` poisons the connection it occurs on:
/// queued operations fail with it immediately and later submissions fail
/// with it synchronously. `FrameTooLarge` fails only the framed read that
/// hit it. Errors are `Clone` because one poisoning error fans out to every
/// queued callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The local side called `close()`. Expected during teardown.
    ConnectionClosed,
    /// The peer closed the TCP socket, or the socket reported a hangup.
    Eof,
    /// The setup blob was not read in one piece.
    ShortRead { expected: usize, actual: usize },
    /// The setup blob was not written in one piece.
    ShortWrite { expected: usize, actual: usize },
    /// A socket operation failed.
    System { context: &'static str, errno: i32 },
    /// A work completion reported a non-success status.
    Ibv(String),
    /// A framed read decoded a length prefix larger than the inbox can
    /// ever hold.
    FrameTooLarge { length: u64, max: u64 },
}

impl Error {
    pub(crate) fn system(context: &'static str, err: &std::io::Error) -> Self {
        Error::System {
            context,
            errno: err.raw_os_error().unwrap_or(0),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ConnectionClosed => write!(f, "connection closed"),
            Error::Eof => write!(f, "end of file"),
            Error::ShortRead { expected, actual } => {
                write!(f, "short read: expected {} bytes, got {}", expected, actual)
            }
            Error::ShortWrite { expected, actual } => {
                write!(f, "short write: expected {} bytes, wrote {}", expected, actual)
            }
            Error::System { context, errno } => {
                write!(
                    f,
                    "{}: {}",
                    context,
                    std::io::Error::from_raw_os_error(*errno)
                )
            }
            Error::Ibv(status) => write!(f, "work completion failed: {}", status),
            Error::FrameTooLarge { length, max } => {
                write!(f, "frame length {} exceeds maximum {}", length, max)
            }
        }
    }
}

impl std::error::Error for Error {}

/// Result type for rcpipe operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Error::ConnectionClosed.to_string(), "connection closed");
        assert_eq!(
            Error::ShortRead {
                expected: 42,
                actual: 10
            }
            .to_string(),
            "short read: expected 42 bytes, got 10"
        );
        let s = Error::System {
            context: "getsockopt",
            errno: libc::ECONNRESET,
        }
        .to_string();
        assert!(s.starts_with("getsockopt: "));
    }

    #[test]
    fn test_clone_equality() {
        let e = Error::FrameTooLarge {
            length: 1 << 40,
            max: 1 << 21,
        };
        assert_eq!(e.clone(), e);
    }
}
