//! Transport contract consumed by the transfer core.
//!
//! Session drivers never touch sockets. They see a connection only through
//! [`Transport`] for outbound operations and [`TransportEvent`] for
//! everything the connection reports back. All events for one connection
//! are delivered serially on one thread, so per-stream state needs no
//! locking.

use bytes::Bytes;
use std::fmt;
use std::io;

#[cfg(test)]
pub(crate) mod testing;

/// Identifier of a stream within one connection.
///
/// Client-initiated streams are even, server-initiated streams odd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u32);

impl StreamId {
    /// Whether the client side opened this stream.
    pub fn is_client_initiated(self) -> bool {
        self.0 & 0x01 == 0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of offering a buffer to a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The whole buffer was accepted.
    Accepted,
    /// Only a prefix was accepted; `unaccepted` is the remaining suffix.
    Partial { unaccepted: Bytes },
}

/// Errors reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connection is not established")]
    NotReady,
    #[error("connection is closed")]
    Closed,
    #[error("unknown stream {0}")]
    UnknownStream(StreamId),
    #[error("stream {0} already finished sending")]
    StreamFinished(StreamId),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("timed out")]
    TimedOut,
    #[error("i/o error ({kind:?}): {message}")]
    Io { kind: io::ErrorKind, message: String },
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        TransportError::Io {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

/// Everything a connection reports to its session driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The peer opened a new stream.
    StreamOpened(StreamId),
    /// A fragment arrived. `fin` marks end-of-input for this direction.
    ReadAvailable {
        stream: StreamId,
        data: Bytes,
        fin: bool,
    },
    /// Send capacity is available again on a stream that asked for it.
    Writable { stream: StreamId, max_bytes: usize },
    /// The peer closed the connection. Terminal.
    ConnectionEnded,
    /// The connection failed. Terminal.
    ConnectionErrored(TransportError),
}

/// Outbound side of a multiplexed, reliable, ordered-stream connection.
pub trait Transport {
    /// Open a new bidirectional stream.
    fn open_stream(&mut self) -> Result<StreamId, TransportError>;

    /// Bytes `write` would accept on `stream` right now.
    fn send_capacity(&self, stream: StreamId) -> Result<usize, TransportError>;

    /// Offer `data` to `stream`. The transport may accept only a prefix.
    ///
    /// `fin` closes the sending direction and only takes effect when the
    /// whole buffer is accepted. An empty buffer with `fin` set is always
    /// accepted.
    fn write(
        &mut self,
        stream: StreamId,
        data: Bytes,
        fin: bool,
    ) -> Result<WriteOutcome, TransportError>;

    /// Ask for a single [`TransportEvent::Writable`] once capacity frees up.
    fn notify_writable(&mut self, stream: StreamId) -> Result<(), TransportError>;

    /// Close the connection. No further events are delivered.
    fn close(&mut self);
}
