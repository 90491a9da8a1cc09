use std::fmt;
use std::io;

/// Enumerates the errors that can be reported by the Player server
/// core. Individual drivers may wrap their own hardware-specific
/// errors, but anything that crosses a core boundary (queue, device
/// table, driver runtime, frontend) is mapped into one of these.
#[derive(Debug)]
pub enum Error {
    /// A request named a device address that isn't in the table.
    NotFound,

    /// A client asked for an access mode the device entry doesn't
    /// grant (e.g. COMMAND on a read-only device).
    AccessDenied,

    /// A queue was at capacity and the push didn't qualify for
    /// replace-mode coalescing.
    QueueFull,

    /// Decoding a header or body failed (bad length, truncated
    /// stream, unknown interface/type/subtype).
    Framing(String),

    /// The (interface, type, subtype) triple has no registered codec.
    UnknownCodec { interface: u16, msg_type: u8, subtype: u8 },

    /// A driver's `setup` or `shutdown` call failed.
    DriverSetup(String),

    /// The peer side of a remote-driver bridge is down.
    RemoteDown,

    /// The shared authentication key didn't match.
    AuthFailed,

    /// A socket or I/O operation failed in a way that isn't
    /// recoverable for the affected connection.
    Io(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotFound => write!(f, "no such device"),
            Error::AccessDenied => write!(f, "access mode not granted"),
            Error::QueueFull => write!(f, "queue is full"),
            Error::Framing(s) => write!(f, "framing error: {}", s),
            Error::UnknownCodec {
                interface,
                msg_type,
                subtype,
            } => write!(
                f,
                "no codec for interface {} type {} subtype {}",
                interface, msg_type, subtype
            ),
            Error::DriverSetup(s) => write!(f, "driver setup/shutdown failed: {}", s),
            Error::RemoteDown => write!(f, "remote peer connection is down"),
            Error::AuthFailed => write!(f, "authentication failed"),
            Error::Io(s) => write!(f, "I/O error: {}", s),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e.to_string())
    }
}
