//! Per-stream receive accounting.
//!
//! Two completion rules, depending on which side of the exchange a stream
//! is on:
//! - Request side: bytes are collected until the sender's end-of-input,
//!   then decoded as a byte-count request. The length is not known ahead.
//! - Reply side: bytes are only counted, and the transfer completes when
//!   the count reaches a target the receiver computed itself.
//!
//! Once a stream is complete it is inert. Later bytes are reported as a
//! protocol anomaly and discarded; they never count and never complete
//! the stream a second time.

use crate::transfer::codec::{self, CodecError, MAX_REQUEST_LEN};
use crate::transport::StreamId;
use bytes::BytesMut;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// How a stream decides it is done.
#[derive(Debug)]
pub enum ReceiveMode {
    /// Collect a request until end-of-input.
    Request {
        buffer: BytesMut,
        /// More bytes arrived than any valid request can hold.
        oversized: bool,
    },
    /// Count reply bytes up to the target.
    Reply,
}

/// Receive state of one stream.
#[derive(Debug)]
pub struct ReceiveState {
    bytes_received: u64,
    target_bytes: Option<u64>,
    start_time: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    complete: bool,
    end_of_input: bool,
    frozen: bool,
    mode: ReceiveMode,
}

impl ReceiveState {
    fn new(mode: ReceiveMode, target_bytes: Option<u64>, start_time: DateTime<Utc>) -> Self {
        Self {
            bytes_received: 0,
            target_bytes,
            start_time,
            completed_at: None,
            complete: false,
            end_of_input: false,
            frozen: false,
            mode,
        }
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn target_bytes(&self) -> Option<u64> {
        self.target_bytes
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }
}

/// Result of feeding a fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveEvent {
    /// Counted; not complete yet.
    Progress { bytes_received: u64 },
    /// The reply target was reached by this fragment.
    Complete {
        bytes_received: u64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    /// Bytes arrived on a stream that was already complete or closed.
    Anomaly { discarded: usize },
    /// No state exists for the stream.
    Untracked,
}

/// Result of an end-of-input marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndOfInput {
    /// The request was assembled and decoded.
    Request(Result<u64, CodecError>),
    /// The reply direction closed; `complete` tells whether the target
    /// had been reached by then.
    Reply { complete: bool },
    /// Duplicate marker, or the stream was frozen.
    Ignored,
    Untracked,
}

/// Receive state of every stream on one connection.
#[derive(Debug, Default)]
pub struct ReceiveAccumulator {
    streams: HashMap<StreamId, ReceiveState>,
}

impl ReceiveAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count reply bytes on `stream` until `target` is reached.
    pub fn expect_reply(&mut self, stream: StreamId, target: u64, start: DateTime<Utc>) {
        self.streams
            .insert(stream, ReceiveState::new(ReceiveMode::Reply, Some(target), start));
    }

    /// Collect a request on `stream` until end-of-input.
    pub fn track_request(&mut self, stream: StreamId, start: DateTime<Utc>) {
        let mode = ReceiveMode::Request {
            buffer: BytesMut::new(),
            oversized: false,
        };
        self.streams
            .insert(stream, ReceiveState::new(mode, None, start));
    }

    pub fn is_tracked(&self, stream: StreamId) -> bool {
        self.streams.contains_key(&stream)
    }

    pub fn state(&self, stream: StreamId) -> Option<&ReceiveState> {
        self.streams.get(&stream)
    }

    /// Account for one received fragment.
    pub fn on_bytes(&mut self, stream: StreamId, data: &[u8], now: DateTime<Utc>) -> ReceiveEvent {
        let Some(state) = self.streams.get_mut(&stream) else {
            return ReceiveEvent::Untracked;
        };

        if state.complete || state.end_of_input || state.frozen {
            if data.is_empty() {
                return ReceiveEvent::Progress {
                    bytes_received: state.bytes_received,
                };
            }
            return ReceiveEvent::Anomaly {
                discarded: data.len(),
            };
        }

        state.bytes_received += data.len() as u64;

        match &mut state.mode {
            ReceiveMode::Request { buffer, oversized } => {
                if buffer.len() + data.len() <= MAX_REQUEST_LEN {
                    buffer.extend_from_slice(data);
                } else {
                    *oversized = true;
                }
                ReceiveEvent::Progress {
                    bytes_received: state.bytes_received,
                }
            }
            ReceiveMode::Reply => match state.target_bytes {
                Some(target) if state.bytes_received >= target => {
                    state.complete = true;
                    state.completed_at = Some(now);
                    ReceiveEvent::Complete {
                        bytes_received: state.bytes_received,
                        start: state.start_time,
                        end: now,
                    }
                }
                _ => ReceiveEvent::Progress {
                    bytes_received: state.bytes_received,
                },
            },
        }
    }

    /// The sender closed its direction of `stream`.
    pub fn on_end_of_input(&mut self, stream: StreamId, now: DateTime<Utc>) -> EndOfInput {
        let Some(state) = self.streams.get_mut(&stream) else {
            return EndOfInput::Untracked;
        };
        if state.end_of_input || state.frozen {
            return EndOfInput::Ignored;
        }
        state.end_of_input = true;

        match &mut state.mode {
            ReceiveMode::Request { buffer, oversized } => {
                state.complete = true;
                state.completed_at = Some(now);

                let result = if *oversized {
                    Err(CodecError::Malformed(format!(
                        "request of {} bytes exceeds {} bytes",
                        state.bytes_received, MAX_REQUEST_LEN
                    )))
                } else {
                    codec::decode(buffer)
                };
                if let Ok(requested) = result {
                    state.target_bytes = Some(requested);
                }
                buffer.clear();
                EndOfInput::Request(result)
            }
            ReceiveMode::Reply => EndOfInput::Reply {
                complete: state.complete,
            },
        }
    }

    /// Forget `stream`, returning its final state.
    pub fn remove(&mut self, stream: StreamId) -> Option<ReceiveState> {
        self.streams.remove(&stream)
    }

    /// The connection is gone: keep every stream's `complete` as it is and
    /// ignore anything that still trickles in.
    pub fn freeze_all(&mut self) {
        for state in self.streams.values_mut() {
            state.frozen = true;
        }
    }
}
