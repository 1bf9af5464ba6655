//! Chunked, backpressure-aware stream writer.
//!
//! A [`WriteJob`] emits exactly `total_bytes` on one stream in writes of at
//! most `chunk_size` bytes. When the transport takes only a prefix of a
//! write, the unaccepted suffix is parked in `pending` and the job waits
//! for the stream's writable event. Pending bytes are always flushed before
//! a new chunk is built, so a stream has at most one outstanding offer and
//! every byte is sent exactly once, in order.
//!
//! ## Stream close
//!
//! A job started with `fin` closes the sending direction with its last
//! chunk. A zero-length job with `fin` still issues one empty final write
//! so the receiver observes end-of-input.

use crate::transport::{StreamId, Transport, TransportError, WriteOutcome};
use bytes::Bytes;
use std::collections::HashMap;
use tracing::{debug, trace};

/// Where a job's bytes come from.
#[derive(Debug, Clone)]
pub enum ChunkSource {
    /// `len` bytes of zero-filled filler.
    Zeros(u64),
    /// A fixed payload, sent verbatim.
    Payload(Bytes),
}

impl ChunkSource {
    /// Total bytes this source produces.
    pub fn len(&self) -> u64 {
        match self {
            ChunkSource::Zeros(len) => *len,
            ChunkSource::Payload(bytes) => bytes.len() as u64,
        }
    }
}

/// Writer errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WriteError {
    #[error("stream {0} already has an active write job")]
    AlreadyActive(StreamId),
    #[error("no write job for stream {0}")]
    UnknownStream(StreamId),
    #[error("write on stream {stream} failed: {cause}")]
    Failed {
        stream: StreamId,
        cause: TransportError,
    },
}

/// What a pump or resume achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteProgress {
    /// Waiting for the stream's writable signal.
    Blocked { pending: usize },
    /// The transport accepted every byte; the job is gone.
    Finished(JobSummary),
}

/// Statistics of a finished job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobSummary {
    pub total_bytes: u64,
    /// Write calls that moved at least one byte.
    pub offers: u64,
    /// Times the job stopped on backpressure.
    pub stalls: u64,
}

/// Per-stream send state.
#[derive(Debug)]
pub struct WriteJob {
    total_bytes: u64,
    /// Bytes handed out as chunks; the unaccepted tail of the last one may
    /// still sit in `pending`.
    sent_bytes: u64,
    pending: Option<Bytes>,
    chunk_size: u32,
    fin: bool,
    /// The transport took the write that carried fin.
    fin_sent: bool,
    source: ChunkSource,
    /// Zero block sliced for filler chunks.
    filler: Bytes,
    accepted_bytes: u64,
    offers: u64,
    stalls: u64,
}

impl WriteJob {
    fn new(source: ChunkSource, chunk_size: u32, fin: bool) -> Self {
        let chunk_size = chunk_size.max(1);
        let total_bytes = source.len();
        let filler = match source {
            ChunkSource::Zeros(len) => Bytes::from(vec![0u8; len.min(u64::from(chunk_size)) as usize]),
            ChunkSource::Payload(_) => Bytes::new(),
        };

        Self {
            total_bytes,
            sent_bytes: 0,
            pending: None,
            chunk_size,
            fin,
            fin_sent: false,
            source,
            filler,
            accepted_bytes: 0,
            offers: 0,
            stalls: 0,
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn sent_bytes(&self) -> u64 {
        self.sent_bytes
    }

    /// Bytes the transport has actually taken.
    pub fn accepted_bytes(&self) -> u64 {
        self.accepted_bytes
    }

    pub fn pending_len(&self) -> usize {
        self.pending.as_ref().map_or(0, Bytes::len)
    }

    pub fn is_finished(&self) -> bool {
        self.sent_bytes == self.total_bytes
            && self.pending.is_none()
            && (!self.fin || self.fin_sent)
    }

    fn summary(&self) -> JobSummary {
        JobSummary {
            total_bytes: self.total_bytes,
            offers: self.offers,
            stalls: self.stalls,
        }
    }

    fn next_chunk(&self, len: usize) -> Bytes {
        match &self.source {
            ChunkSource::Zeros(_) => self.filler.slice(..len),
            ChunkSource::Payload(bytes) => {
                let start = self.sent_bytes as usize;
                bytes.slice(start..start + len)
            }
        }
    }

    /// Build and offer chunks until done or the transport pushes back.
    fn advance<T: Transport + ?Sized>(
        &mut self,
        stream: StreamId,
        transport: &mut T,
    ) -> Result<WriteProgress, TransportError> {
        while self.sent_bytes < self.total_bytes {
            if transport.send_capacity(stream)? == 0 {
                return self.block(stream, transport);
            }

            let remaining = self.total_bytes - self.sent_bytes;
            let len = remaining.min(u64::from(self.chunk_size)) as usize;
            let chunk = self.next_chunk(len);
            self.sent_bytes += len as u64;

            if let Some(suffix) = self.offer(stream, transport, chunk)? {
                self.pending = Some(suffix);
                return self.block(stream, transport);
            }
        }

        if self.fin && !self.fin_sent {
            if let Some(suffix) = self.offer(stream, transport, Bytes::new())? {
                self.pending = Some(suffix);
                return self.block(stream, transport);
            }
        }

        debug_assert!(self.is_finished());
        Ok(WriteProgress::Finished(self.summary()))
    }

    /// Flush the parked suffix first, then keep building chunks.
    fn resume<T: Transport + ?Sized>(
        &mut self,
        stream: StreamId,
        transport: &mut T,
    ) -> Result<WriteProgress, TransportError> {
        if let Some(pending) = self.pending.take() {
            if let Some(rest) = self.offer(stream, transport, pending)? {
                self.pending = Some(rest);
                return self.block(stream, transport);
            }
        }
        self.advance(stream, transport)
    }

    /// Offer one buffer. Returns the unaccepted suffix, if any.
    fn offer<T: Transport + ?Sized>(
        &mut self,
        stream: StreamId,
        transport: &mut T,
        chunk: Bytes,
    ) -> Result<Option<Bytes>, TransportError> {
        // The last generated chunk, or its leftover, carries the close.
        let fin = self.fin && self.sent_bytes == self.total_bytes;
        let offered = chunk.len();

        let suffix = match transport.write(stream, chunk, fin)? {
            WriteOutcome::Accepted => None,
            WriteOutcome::Partial { unaccepted } => Some(unaccepted),
        };

        let accepted = offered - suffix.as_ref().map_or(0, |s| s.len().min(offered));
        if fin && suffix.is_none() {
            self.fin_sent = true;
        }
        if accepted > 0 {
            self.offers += 1;
            self.accepted_bytes += accepted as u64;
        }
        trace!(
            stream = %stream,
            offered,
            accepted,
            fin,
            total_accepted = self.accepted_bytes,
            "Chunk offered"
        );

        Ok(suffix)
    }

    fn block<T: Transport + ?Sized>(
        &mut self,
        stream: StreamId,
        transport: &mut T,
    ) -> Result<WriteProgress, TransportError> {
        transport.notify_writable(stream)?;
        self.stalls += 1;
        let pending = self.pending_len();
        debug!(
            stream = %stream,
            pending,
            sent = self.sent_bytes,
            total = self.total_bytes,
            "Transport did not accept all data, waiting for writable"
        );
        Ok(WriteProgress::Blocked { pending })
    }
}

/// All outstanding write jobs of one connection, keyed by stream.
#[derive(Debug, Default)]
pub struct ChunkedWriter {
    jobs: HashMap<StreamId, WriteJob>,
}

impl ChunkedWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a job for `stream`. Does not write anything yet.
    pub fn start(
        &mut self,
        stream: StreamId,
        source: ChunkSource,
        chunk_size: u32,
        fin: bool,
    ) -> Result<(), WriteError> {
        if self.jobs.contains_key(&stream) {
            return Err(WriteError::AlreadyActive(stream));
        }
        self.jobs.insert(stream, WriteJob::new(source, chunk_size, fin));
        Ok(())
    }

    /// Advance the job on `stream` as far as the transport allows.
    ///
    /// A job still holding a parked suffix stays blocked until
    /// [`ChunkedWriter::on_writable`] runs.
    pub fn pump<T: Transport + ?Sized>(
        &mut self,
        stream: StreamId,
        transport: &mut T,
    ) -> Result<WriteProgress, WriteError> {
        let job = self
            .jobs
            .get_mut(&stream)
            .ok_or(WriteError::UnknownStream(stream))?;

        if job.pending.is_some() {
            return Ok(WriteProgress::Blocked {
                pending: job.pending_len(),
            });
        }

        let result = job.advance(stream, transport);
        self.settle(stream, result)
    }

    /// The transport has capacity again on `stream`.
    pub fn on_writable<T: Transport + ?Sized>(
        &mut self,
        stream: StreamId,
        transport: &mut T,
    ) -> Result<WriteProgress, WriteError> {
        let job = self
            .jobs
            .get_mut(&stream)
            .ok_or(WriteError::UnknownStream(stream))?;

        let result = job.resume(stream, transport);
        self.settle(stream, result)
    }

    /// Abort every outstanding job because the connection went away.
    pub fn abort_all(&mut self, cause: &TransportError) -> Vec<WriteError> {
        self.jobs
            .drain()
            .map(|(stream, _)| WriteError::Failed {
                stream,
                cause: cause.clone(),
            })
            .collect()
    }

    pub fn job(&self, stream: StreamId) -> Option<&WriteJob> {
        self.jobs.get(&stream)
    }

    pub fn is_active(&self, stream: StreamId) -> bool {
        self.jobs.contains_key(&stream)
    }

    /// Jobs are dropped once finished or failed.
    fn settle(
        &mut self,
        stream: StreamId,
        result: Result<WriteProgress, TransportError>,
    ) -> Result<WriteProgress, WriteError> {
        match result {
            Ok(progress @ WriteProgress::Finished(_)) => {
                self.jobs.remove(&stream);
                Ok(progress)
            }
            Ok(progress) => Ok(progress),
            Err(cause) => {
                self.jobs.remove(&stream);
                Err(WriteError::Failed { stream, cause })
            }
        }
    }
}
