//! Bulk-transfer protocol core.
//!
//! The client sends a byte count as decimal ASCII and closes its side of
//! the stream. The server answers with `amplification × count` bytes of
//! filler, written in bounded chunks that survive partial acceptance by
//! the transport, and closes the stream after the last chunk. The reply
//! carries no length prefix; both sides derive its size from the request.
//!
//! - `codec`: request encoding
//! - `writer`: chunked, backpressure-aware sending
//! - `accumulator`: per-stream receive accounting
//! - `report`: throughput computation

pub mod accumulator;
pub mod codec;
pub mod report;
pub mod writer;

pub use accumulator::{EndOfInput, ReceiveAccumulator, ReceiveEvent};
pub use report::{Labels, ThroughputRecord};
pub use writer::{ChunkSource, ChunkedWriter, WriteError, WriteProgress};

/// Reply multiplier used when none is configured.
pub const DEFAULT_AMPLIFICATION: u64 = 10;
