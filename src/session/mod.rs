//! Session drivers for the two benchmark roles.
//!
//! A session owns all per-stream state of one connection: the outstanding
//! write jobs and the receive accounting. The runtime feeds it
//! [`TransportEvent`](crate::transport::TransportEvent)s one at a time
//! through a single `handle` method per role, so no state is shared across
//! connections and nothing needs locking.

pub mod client;
pub mod server;
pub mod signal;

pub use client::{ClientOutcome, ClientSession, ClientSettings, ClientState};
pub use server::{ServerSession, ServerSettings};
pub use signal::Completion;

use crate::transfer::{ChunkedWriter, ReceiveAccumulator, WriteError};
use crate::transport::TransportError;
use chrono::{DateTime, Utc};

/// Delivery guarantee requested for the benchmark streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReliabilityMode {
    #[default]
    Full,
    /// Lets the transport drop expired data. The mux transport does not
    /// implement it, so sessions only log the request.
    Partial,
}

/// Wall-clock source for transfer timestamps.
pub type Clock = Box<dyn Fn() -> DateTime<Utc> + Send>;

pub fn system_clock() -> Clock {
    Box::new(Utc::now)
}

/// Per-connection state shared by both roles.
#[derive(Debug, Default)]
pub struct Session {
    pub writer: ChunkedWriter,
    pub receiver: ReceiveAccumulator,
    pub ended: bool,
    pub failed: bool,
}

impl Session {
    pub fn is_terminal(&self) -> bool {
        self.ended || self.failed
    }

    /// Freeze receive state and abort every write after the connection
    /// went away. Returns the aborted writes.
    fn shutdown(&mut self, cause: &TransportError) -> Vec<WriteError> {
        self.receiver.freeze_all();
        self.writer.abort_all(cause)
    }
}

/// Clock that advances `step_ms` on every reading, starting at zero.
#[cfg(test)]
pub(crate) fn stepping_clock(step_ms: i64) -> Clock {
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;

    let now = Arc::new(AtomicI64::new(0));
    Box::new(move || {
        let ms = now.fetch_add(step_ms, Ordering::SeqCst);
        DateTime::from_timestamp_millis(ms).unwrap_or_default()
    })
}
