//! Client role: request a byte count, time the amplified reply.

use super::{Clock, ReliabilityMode, Session, Completion};
use crate::transfer::codec;
use crate::transfer::report::{self, Unmeasured};
use crate::transfer::{ChunkSource, EndOfInput, ReceiveEvent, ThroughputRecord, WriteError, WriteProgress};
use crate::transport::{StreamId, Transport, TransportError, TransportEvent};
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, trace, warn};

/// Client run parameters.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub requested_bytes: u64,
    pub amplification: u64,
    pub chunk_size: u32,
    pub reliability: ReliabilityMode,
}

impl ClientSettings {
    /// Reply size the server will send for this request.
    pub fn expected_reply(&self) -> u64 {
        self.requested_bytes.saturating_mul(self.amplification)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Connecting,
    StreamOpening,
    Requesting,
    AwaitingReply,
    Completed,
    /// The connection ended before the reply reached its target.
    CompletedWithoutData,
    Failed,
}

impl ClientState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ClientState::Completed | ClientState::CompletedWithoutData | ClientState::Failed
        )
    }
}

/// What a finished run publishes.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientOutcome {
    pub state: ClientState,
    pub record: ThroughputRecord,
}

/// Drives one benchmark run over one connection.
pub struct ClientSession {
    settings: ClientSettings,
    state: ClientState,
    stream: Option<StreamId>,
    start: Option<DateTime<Utc>>,
    session: Session,
    completion: Completion<ClientOutcome>,
    clock: Clock,
}

impl ClientSession {
    pub fn new(settings: ClientSettings, completion: Completion<ClientOutcome>, clock: Clock) -> Self {
        Self {
            settings,
            state: ClientState::Connecting,
            stream: None,
            start: None,
            session: Session::default(),
            completion,
            clock,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn stream(&self) -> Option<StreamId> {
        self.stream
    }

    /// The run is over and its outcome has been published.
    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }

    /// The connection is established: open the stream and send the request.
    pub fn start<T: Transport + ?Sized>(&mut self, transport: &mut T) {
        if self.state != ClientState::Connecting {
            warn!(state = ?self.state, "Session already started");
            return;
        }
        if self.settings.reliability == ReliabilityMode::Partial {
            warn!("Partial reliability requested but the transport is always reliable");
        }

        self.state = ClientState::StreamOpening;
        let stream = match transport.open_stream() {
            Ok(stream) => stream,
            Err(e) => {
                error!(error = %e, "Failed to open stream");
                self.finish_unmeasured(ClientState::Failed, e);
                return;
            }
        };

        let start = (self.clock)();
        let expected = self.settings.expected_reply();
        self.stream = Some(stream);
        self.start = Some(start);
        self.session.receiver.expect_reply(stream, expected, start);

        info!(
            stream = %stream,
            requested = self.settings.requested_bytes,
            expected,
            "Requesting reply"
        );

        let request = codec::encode(self.settings.requested_bytes);
        if let Err(e) = self.session.writer.start(
            stream,
            ChunkSource::Payload(request),
            self.settings.chunk_size,
            true,
        ) {
            self.on_write_progress(Err(e));
            return;
        }
        self.state = ClientState::Requesting;

        let progress = self.session.writer.pump(stream, transport);
        self.on_write_progress(progress);
    }

    /// Process one transport event.
    pub fn handle<T: Transport + ?Sized>(&mut self, event: TransportEvent, transport: &mut T) {
        if self.state.is_terminal() {
            trace!(?event, "Ignoring event after run finished");
            return;
        }

        match event {
            TransportEvent::StreamOpened(stream) => {
                warn!(stream = %stream, "Peer opened a stream, its data will be discarded");
            }
            TransportEvent::ReadAvailable { stream, data, fin } => {
                self.on_read(stream, &data, fin);
            }
            TransportEvent::Writable { stream, max_bytes } => {
                trace!(stream = %stream, max_bytes, "Writable");
                match self.session.writer.on_writable(stream, transport) {
                    Err(WriteError::UnknownStream(_)) => {
                        trace!(stream = %stream, "No request in progress");
                    }
                    progress => self.on_write_progress(progress),
                }
            }
            TransportEvent::ConnectionEnded => {
                info!("Connection ended");
                self.session.ended = true;
                self.finish_unmeasured(ClientState::CompletedWithoutData, TransportError::Closed);
            }
            TransportEvent::ConnectionErrored(cause) => {
                error!(error = %cause, "Connection failed");
                self.session.failed = true;
                self.finish_unmeasured(ClientState::Failed, cause);
            }
        }
    }

    /// The run failed outside any connection, e.g. the socket could not
    /// be created. Publishes a failed outcome unless one already exists.
    pub fn abort(&mut self, cause: TransportError) {
        if self.state.is_terminal() {
            return;
        }
        error!(error = %cause, "Run aborted");
        self.session.failed = true;
        self.finish_unmeasured(ClientState::Failed, cause);
    }

    fn on_read(&mut self, stream: StreamId, data: &[u8], fin: bool) {
        if self.stream != Some(stream) {
            if !data.is_empty() {
                warn!(stream = %stream, discarded = data.len(), "Data on a stream this client never opened");
            }
            return;
        }

        let now = (self.clock)();
        match self.session.receiver.on_bytes(stream, data, now) {
            ReceiveEvent::Complete {
                bytes_received,
                start,
                end,
            } => {
                self.complete(stream, start, end, bytes_received);
                return;
            }
            ReceiveEvent::Progress { bytes_received } => {
                trace!(stream = %stream, len = data.len(), total = bytes_received, fin, "Reply bytes");
            }
            ReceiveEvent::Anomaly { discarded } => {
                warn!(stream = %stream, discarded, "Bytes after reply completed");
            }
            ReceiveEvent::Untracked => {
                warn!(stream = %stream, "Reply stream is not tracked");
            }
        }

        if fin {
            if let EndOfInput::Reply { complete: false } =
                self.session.receiver.on_end_of_input(stream, now)
            {
                warn!(stream = %stream, "Server closed the reply early");
                self.finish_unmeasured(
                    ClientState::CompletedWithoutData,
                    TransportError::Protocol("reply closed before target".to_string()),
                );
            }
        }
    }

    fn on_write_progress(&mut self, progress: Result<WriteProgress, WriteError>) {
        match progress {
            Ok(WriteProgress::Finished(summary)) => {
                debug!(bytes = summary.total_bytes, stalls = summary.stalls, "Request sent");
                if self.state == ClientState::Requesting {
                    self.state = ClientState::AwaitingReply;
                }
            }
            Ok(WriteProgress::Blocked { pending }) => {
                debug!(pending, "Request waiting for send credit");
            }
            Err(e) => {
                error!(error = %e, "Request write failed");
                let cause = match e {
                    WriteError::Failed { cause, .. } => cause,
                    other => TransportError::Protocol(other.to_string()),
                };
                self.finish_unmeasured(ClientState::Failed, cause);
            }
        }
    }

    fn complete(&mut self, stream: StreamId, start: DateTime<Utc>, end: DateTime<Utc>, bytes: u64) {
        let record = report::report(stream, start, end, bytes);
        info!(
            stream = %stream,
            bytes,
            elapsed_ms = (end - start).num_milliseconds(),
            mbps = record.mbps().unwrap_or(-1.0),
            "Reply complete"
        );
        self.state = ClientState::Completed;
        self.publish(record);
    }

    /// Stop the run without a rate and publish why.
    fn finish_unmeasured(&mut self, state: ClientState, cause: TransportError) {
        for aborted in self.session.shutdown(&cause) {
            warn!(error = %aborted, "Aborted outstanding write");
        }

        let expected = self.settings.expected_reply();
        let record = match self.stream {
            Some(stream) => {
                let received = self
                    .session
                    .receiver
                    .state(stream)
                    .map_or(0, |s| s.bytes_received());
                info!(
                    stream = %stream,
                    received,
                    outstanding = expected.saturating_sub(received),
                    "Run ended before the reply completed"
                );
                report::unmeasured(
                    Some(stream),
                    self.start,
                    received,
                    Unmeasured::Incomplete { received, expected },
                )
            }
            None => report::unmeasured(None, None, 0, Unmeasured::NotStarted(cause.to_string())),
        };

        self.state = state;
        self.publish(record);
    }

    fn publish(&mut self, record: ThroughputRecord) {
        let outcome = ClientOutcome {
            state: self.state,
            record,
        };
        if !self.completion.publish(outcome) {
            debug!("Outcome already published");
        }
    }
}
