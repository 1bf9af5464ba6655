//! Server role: decode each request and stream back the amplified reply.

use super::{Clock, ReliabilityMode, Session};
use crate::transfer::codec::CodecError;
use crate::transfer::{ChunkSource, EndOfInput, ReceiveEvent, WriteError, WriteProgress};
use crate::transport::{StreamId, Transport, TransportError, TransportEvent};
use tracing::{debug, error, info, trace, warn};

/// Server reply parameters.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub amplification: u64,
    pub chunk_size: u32,
    pub reliability: ReliabilityMode,
}

/// Serves every stream of one accepted connection.
pub struct ServerSession {
    settings: ServerSettings,
    session: Session,
    clock: Clock,
    replies_started: u64,
    replies_finished: u64,
}

impl ServerSession {
    pub fn new(settings: ServerSettings, clock: Clock) -> Self {
        if settings.reliability == ReliabilityMode::Partial {
            warn!("Partial reliability requested but the transport is always reliable");
        }
        Self {
            settings,
            session: Session::default(),
            clock,
            replies_started: 0,
            replies_finished: 0,
        }
    }

    /// The connection ended or failed; nothing more will be sent.
    pub fn is_finished(&self) -> bool {
        self.session.is_terminal()
    }

    pub fn replies_started(&self) -> u64 {
        self.replies_started
    }

    pub fn replies_finished(&self) -> u64 {
        self.replies_finished
    }

    /// Process one transport event.
    pub fn handle<T: Transport + ?Sized>(&mut self, event: TransportEvent, transport: &mut T) {
        if self.session.is_terminal() {
            trace!(?event, "Ignoring event after connection closed");
            return;
        }

        match event {
            TransportEvent::StreamOpened(stream) => {
                debug!(stream = %stream, "Stream opened");
                self.session.receiver.track_request(stream, (self.clock)());
            }
            TransportEvent::ReadAvailable { stream, data, fin } => {
                self.on_read(stream, &data, fin, transport);
            }
            TransportEvent::Writable { stream, max_bytes } => {
                trace!(stream = %stream, max_bytes, "Writable");
                let progress = self.session.writer.on_writable(stream, transport);
                self.on_write_progress(stream, progress);
            }
            TransportEvent::ConnectionEnded => {
                info!(
                    started = self.replies_started,
                    finished = self.replies_finished,
                    "Connection closed by peer"
                );
                self.session.ended = true;
                self.shutdown(TransportError::Closed);
            }
            TransportEvent::ConnectionErrored(cause) => {
                error!(error = %cause, "Connection failed");
                self.session.failed = true;
                self.shutdown(cause);
            }
        }
    }

    fn on_read<T: Transport + ?Sized>(
        &mut self,
        stream: StreamId,
        data: &[u8],
        fin: bool,
        transport: &mut T,
    ) {
        let now = (self.clock)();
        if !self.session.receiver.is_tracked(stream) && !self.session.writer.is_active(stream) {
            self.session.receiver.track_request(stream, now);
        }

        match self.session.receiver.on_bytes(stream, data, now) {
            ReceiveEvent::Progress { bytes_received } => {
                trace!(stream = %stream, len = data.len(), total = bytes_received, fin, "Request bytes");
            }
            ReceiveEvent::Anomaly { discarded } => {
                warn!(stream = %stream, discarded, "Bytes after end of request");
            }
            ReceiveEvent::Complete { .. } | ReceiveEvent::Untracked => {}
        }

        if !fin {
            return;
        }

        match self.session.receiver.on_end_of_input(stream, now) {
            EndOfInput::Request(Ok(requested)) => self.start_reply(stream, requested, transport),
            EndOfInput::Request(Err(e)) => {
                warn!(stream = %stream, error = %e, "Dropping stream with malformed request");
                self.session.receiver.remove(stream);
            }
            other => trace!(stream = %stream, ?other, "End of input ignored"),
        }
    }

    fn start_reply<T: Transport + ?Sized>(
        &mut self,
        stream: StreamId,
        requested: u64,
        transport: &mut T,
    ) {
        let Some(reply_total) = requested.checked_mul(self.settings.amplification) else {
            warn!(stream = %stream, requested, error = %CodecError::Overflow, "Dropping stream");
            self.session.receiver.remove(stream);
            return;
        };

        if let Err(e) = self.session.writer.start(
            stream,
            ChunkSource::Zeros(reply_total),
            self.settings.chunk_size,
            true,
        ) {
            warn!(stream = %stream, error = %e, "Ignoring request");
            return;
        }
        self.replies_started += 1;
        info!(stream = %stream, requested, reply_total, "Sending reply");

        let progress = self.session.writer.pump(stream, transport);
        self.on_write_progress(stream, progress);
    }

    fn on_write_progress(&mut self, stream: StreamId, progress: Result<WriteProgress, WriteError>) {
        match progress {
            Ok(WriteProgress::Finished(summary)) => {
                self.replies_finished += 1;
                self.session.receiver.remove(stream);
                info!(
                    stream = %stream,
                    sent = summary.total_bytes,
                    offers = summary.offers,
                    stalls = summary.stalls,
                    "Finished sending"
                );
            }
            Ok(WriteProgress::Blocked { pending }) => {
                let sent = self.session.writer.job(stream).map_or(0, |j| j.accepted_bytes());
                debug!(stream = %stream, pending, sent, "Reply waiting for send credit");
            }
            Err(WriteError::UnknownStream(_)) => {
                trace!(stream = %stream, "No reply in progress");
            }
            Err(e) => {
                error!(error = %e, "Reply write failed");
                self.session.receiver.remove(stream);
            }
        }
    }

    fn shutdown(&mut self, cause: TransportError) {
        for aborted in self.session.shutdown(&cause) {
            warn!(error = %aborted, "Aborted reply");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::stepping_clock;
    use crate::transport::testing::ScriptedTransport;
    use bytes::Bytes;

    const S: StreamId = StreamId(0);

    fn server(chunk_size: u32) -> ServerSession {
        ServerSession::new(
            ServerSettings {
                amplification: 10,
                chunk_size,
                reliability: ReliabilityMode::Full,
            },
            stepping_clock(1),
        )
    }

    fn read(stream: StreamId, data: &'static [u8], fin: bool) -> TransportEvent {
        TransportEvent::ReadAvailable {
            stream,
            data: Bytes::from_static(data),
            fin,
        }
    }

    #[test]
    fn test_reply_is_ten_times_request() {
        let mut server = server(6000);
        let mut transport = ScriptedTransport::new();

        server.handle(TransportEvent::StreamOpened(S), &mut transport);
        server.handle(read(S, b"1", false), &mut transport);
        assert!(transport.offers.is_empty());
        server.handle(read(S, b"00", true), &mut transport);

        assert_eq!(transport.bytes_on(S), 1000);
        assert!(transport.written[&S].iter().all(|b| *b == 0));
        assert!(transport.finished.contains(&S));
        assert_eq!(server.replies_finished(), 1);
        assert!(!server.session.receiver.is_tracked(S));
    }

    #[test]
    fn test_malformed_request_gets_no_reply() {
        let mut server = server(6000);
        let mut transport = ScriptedTransport::new();

        server.handle(TransportEvent::StreamOpened(S), &mut transport);
        server.handle(read(S, b"12a", true), &mut transport);

        assert!(transport.offers.is_empty());
        assert!(!server.session.writer.is_active(S));
        assert!(!server.session.receiver.is_tracked(S));
        assert_eq!(server.replies_started(), 0);
        assert!(!server.is_finished());
    }

    #[test]
    fn test_overflowing_reply_is_dropped() {
        let mut server = server(6000);
        let mut transport = ScriptedTransport::new();

        server.handle(read(S, b"18446744073709551615", true), &mut transport);
        assert!(transport.offers.is_empty());
        assert_eq!(server.replies_started(), 0);
    }

    #[test]
    fn test_reply_follows_credit() {
        let mut server = server(1000);
        let mut transport = ScriptedTransport::new().with_credit(3000);

        server.handle(read(S, b"1000", true), &mut transport);
        assert_eq!(transport.bytes_on(S), 3000);
        assert!(server.session.writer.is_active(S));

        let mut rounds = 0;
        while transport.grant(S, 3000) {
            server.handle(
                TransportEvent::Writable {
                    stream: S,
                    max_bytes: 3000,
                },
                &mut transport,
            );
            rounds += 1;
        }

        assert_eq!(rounds, 3);
        assert_eq!(transport.bytes_on(S), 10_000);
        assert!(transport.finished.contains(&S));
        assert_eq!(server.replies_finished(), 1);
    }

    #[test]
    fn test_streams_are_independent() {
        let mut server = server(6000);
        let mut transport = ScriptedTransport::new();
        let other = StreamId(2);

        server.handle(read(S, b"5", false), &mut transport);
        server.handle(read(other, b"7", true), &mut transport);
        server.handle(read(S, b"", true), &mut transport);

        assert_eq!(transport.bytes_on(S), 50);
        assert_eq!(transport.bytes_on(other), 70);
        assert_eq!(server.replies_finished(), 2);
    }

    #[test]
    fn test_connection_end_aborts_reply() {
        let mut server = server(100);
        let mut transport = ScriptedTransport::new().with_credit(50);

        server.handle(read(S, b"100", true), &mut transport);
        assert!(server.session.writer.is_active(S));

        server.handle(TransportEvent::ConnectionEnded, &mut transport);
        assert!(server.is_finished());
        assert!(!server.session.writer.is_active(S));

        let offers = transport.offers.len();
        transport.grant(S, 10_000);
        server.handle(
            TransportEvent::Writable {
                stream: S,
                max_bytes: 10_000,
            },
            &mut transport,
        );
        assert_eq!(transport.offers.len(), offers);
    }
}
