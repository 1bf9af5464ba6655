//! Multiplexed stream connection over a byte socket.
//!
//! Implements [`Transport`] on top of any non-blocking `Read + Write`
//! socket. Outbound frames are queued in `outbound` and drained by
//! [`MuxConnection::flush`]; inbound bytes are parsed into frames by
//! [`MuxConnection::read_ready`], which turns them into
//! [`TransportEvent`]s for the session to collect with
//! [`MuxConnection::take_events`].
//!
//! Each stream starts with `window` bytes of send credit. The receiver
//! returns credit with a WINDOW_UPDATE as soon as data is handed to the
//! session, so `write` accepting less than offered is ordinary
//! backpressure.

use crate::runtime::frame::{self, Frame, ParseResult, MAX_FRAME};
use crate::transport::{StreamId, Transport, TransportError, TransportEvent, WriteOutcome};
use bytes::{Bytes, BytesMut};
use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use tracing::{debug, trace};

const READ_CHUNK: usize = 64 * 1024;

/// Which end of the connection this is. Decides stream id parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Socket connect still in progress.
    Connecting,
    Established,
    /// Ended, failed or closed locally. No further events.
    Closed,
}

#[derive(Debug)]
struct StreamState {
    send_credit: usize,
    send_finished: bool,
    recv_finished: bool,
    want_writable: bool,
}

impl StreamState {
    fn new(window: usize) -> Self {
        Self {
            send_credit: window,
            send_finished: false,
            recv_finished: false,
            want_writable: false,
        }
    }
}

/// One mux connection.
#[derive(Debug)]
pub struct MuxConnection<S> {
    socket: S,
    role: Role,
    state: ConnState,
    streams: HashMap<StreamId, StreamState>,
    next_local: u32,
    window: usize,
    inbound: BytesMut,
    outbound: BytesMut,
    scratch: Box<[u8]>,
    events: VecDeque<TransportEvent>,
}

impl<S: Read + Write> MuxConnection<S> {
    pub fn new(socket: S, role: Role, window: u32) -> Self {
        Self {
            socket,
            role,
            state: ConnState::Connecting,
            streams: HashMap::new(),
            next_local: match role {
                Role::Client => 0,
                Role::Server => 1,
            },
            window: window as usize,
            inbound: BytesMut::with_capacity(READ_CHUNK),
            outbound: BytesMut::new(),
            scratch: vec![0u8; READ_CHUNK].into_boxed_slice(),
            events: VecDeque::new(),
        }
    }

    pub fn socket(&self) -> &S {
        &self.socket
    }

    pub fn socket_mut(&mut self) -> &mut S {
        &mut self.socket
    }

    pub fn is_established(&self) -> bool {
        self.state == ConnState::Established
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnState::Closed
    }

    /// The socket is connected; streams may be opened.
    pub fn establish(&mut self) {
        if self.state == ConnState::Connecting {
            self.state = ConnState::Established;
        }
    }

    /// Queued frames are waiting for the socket.
    pub fn wants_write(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Drain the events produced since the last call.
    pub fn take_events(&mut self) -> Vec<TransportEvent> {
        self.events.drain(..).collect()
    }

    /// Fail the connection from outside, e.g. on a timeout. Delivers a
    /// single `ConnectionErrored` unless the connection is already closed.
    pub fn fail(&mut self, cause: TransportError) {
        if self.state == ConnState::Closed {
            return;
        }
        debug!(error = %cause, "Connection failed");
        self.state = ConnState::Closed;
        self.events.push_back(TransportEvent::ConnectionErrored(cause));
    }

    fn end(&mut self) {
        if self.state == ConnState::Closed {
            return;
        }
        self.state = ConnState::Closed;
        self.events.push_back(TransportEvent::ConnectionEnded);
    }

    /// Read everything the socket has and turn it into events.
    pub fn read_ready(&mut self) {
        while self.state == ConnState::Established {
            match self.socket.read(&mut self.scratch) {
                Ok(0) => {
                    // Deliver whatever arrived complete before the EOF.
                    self.process_inbound();
                    self.end();
                }
                Ok(n) => {
                    self.inbound.extend_from_slice(&self.scratch[..n]);
                    self.process_inbound();
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => self.fail(e.into()),
            }
        }
    }

    /// Write queued frames until the socket pushes back.
    pub fn flush(&mut self) {
        while !self.outbound.is_empty() && self.state != ConnState::Connecting {
            match self.socket.write(&self.outbound) {
                Ok(0) => {
                    self.fail(io::Error::new(io::ErrorKind::WriteZero, "write returned 0").into());
                    break;
                }
                Ok(n) => {
                    let _ = self.outbound.split_to(n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.fail(e.into());
                    break;
                }
            }
        }
        if self.state == ConnState::Closed {
            self.outbound.clear();
        }
    }

    fn process_inbound(&mut self) {
        while self.state == ConnState::Established {
            match frame::parse(&mut self.inbound) {
                ParseResult::Complete(frame) => self.on_frame(frame),
                ParseResult::Incomplete => break,
                ParseResult::Error(message) => self.fail(TransportError::Protocol(message)),
            }
        }
    }

    fn on_frame(&mut self, frame: Frame) {
        match frame {
            Frame::Data {
                stream,
                fin,
                payload,
            } => self.on_data(stream, fin, payload),
            Frame::WindowUpdate { stream, increment } => {
                let Some(state) = self.streams.get_mut(&stream) else {
                    trace!(stream = %stream, "Window update for unknown stream");
                    return;
                };
                state.send_credit = state.send_credit.saturating_add(increment as usize);
                if state.want_writable && state.send_credit > 0 {
                    state.want_writable = false;
                    self.events.push_back(TransportEvent::Writable {
                        stream,
                        max_bytes: state.send_credit,
                    });
                }
            }
        }
    }

    fn on_data(&mut self, stream: StreamId, fin: bool, payload: Bytes) {
        if !self.streams.contains_key(&stream) {
            if !self.is_peer_stream(stream) {
                self.fail(TransportError::Protocol(format!(
                    "data on stream {stream} that was never opened"
                )));
                return;
            }
            self.streams.insert(stream, StreamState::new(self.window));
            self.events.push_back(TransportEvent::StreamOpened(stream));
        }

        let Some(state) = self.streams.get_mut(&stream) else {
            return;
        };
        if state.recv_finished {
            self.fail(TransportError::Protocol(format!(
                "data on stream {stream} after fin"
            )));
            return;
        }
        state.recv_finished = fin;

        if !fin && !payload.is_empty() {
            Frame::WindowUpdate {
                stream,
                increment: payload.len() as u32,
            }
            .encode_into(&mut self.outbound);
        }

        trace!(stream = %stream, len = payload.len(), fin, "Data frame");
        self.events.push_back(TransportEvent::ReadAvailable {
            stream,
            data: payload,
            fin,
        });
    }

    fn is_peer_stream(&self, stream: StreamId) -> bool {
        match self.role {
            Role::Client => !stream.is_client_initiated(),
            Role::Server => stream.is_client_initiated(),
        }
    }

    fn stream_mut(&mut self, stream: StreamId) -> Result<&mut StreamState, TransportError> {
        match self.state {
            ConnState::Connecting => return Err(TransportError::NotReady),
            ConnState::Closed => return Err(TransportError::Closed),
            ConnState::Established => {}
        }
        self.streams
            .get_mut(&stream)
            .ok_or(TransportError::UnknownStream(stream))
    }
}

impl<S: Read + Write> Transport for MuxConnection<S> {
    fn open_stream(&mut self) -> Result<StreamId, TransportError> {
        match self.state {
            ConnState::Connecting => return Err(TransportError::NotReady),
            ConnState::Closed => return Err(TransportError::Closed),
            ConnState::Established => {}
        }
        let stream = StreamId(self.next_local);
        self.next_local = self
            .next_local
            .checked_add(2)
            .ok_or_else(|| TransportError::Protocol("stream ids exhausted".to_string()))?;
        self.streams.insert(stream, StreamState::new(self.window));
        debug!(stream = %stream, "Opened stream");
        Ok(stream)
    }

    fn send_capacity(&self, stream: StreamId) -> Result<usize, TransportError> {
        match self.state {
            ConnState::Connecting => return Err(TransportError::NotReady),
            ConnState::Closed => return Err(TransportError::Closed),
            ConnState::Established => {}
        }
        let state = self
            .streams
            .get(&stream)
            .ok_or(TransportError::UnknownStream(stream))?;
        if state.send_finished {
            return Err(TransportError::StreamFinished(stream));
        }
        Ok(state.send_credit)
    }

    fn write(
        &mut self,
        stream: StreamId,
        data: Bytes,
        fin: bool,
    ) -> Result<WriteOutcome, TransportError> {
        let state = self.stream_mut(stream)?;
        if state.send_finished {
            return Err(TransportError::StreamFinished(stream));
        }

        let accepted = data.len().min(state.send_credit);
        let whole = accepted == data.len();
        state.send_credit -= accepted;
        if whole && fin {
            state.send_finished = true;
        }

        let mut offset = 0;
        while offset < accepted {
            let end = accepted.min(offset + MAX_FRAME);
            Frame::Data {
                stream,
                fin: whole && fin && end == accepted,
                payload: data.slice(offset..end),
            }
            .encode_into(&mut self.outbound);
            offset = end;
        }
        if data.is_empty() && fin {
            Frame::Data {
                stream,
                fin: true,
                payload: Bytes::new(),
            }
            .encode_into(&mut self.outbound);
        }

        if whole {
            Ok(WriteOutcome::Accepted)
        } else {
            Ok(WriteOutcome::Partial {
                unaccepted: data.slice(accepted..),
            })
        }
    }

    fn notify_writable(&mut self, stream: StreamId) -> Result<(), TransportError> {
        let state = self.stream_mut(stream)?;
        if state.send_credit > 0 {
            let max_bytes = state.send_credit;
            self.events
                .push_back(TransportEvent::Writable { stream, max_bytes });
        } else {
            state.want_writable = true;
        }
        Ok(())
    }

    fn close(&mut self) {
        if self.state != ConnState::Closed {
            debug!("Closing connection");
        }
        self.state = ConnState::Closed;
        self.events.clear();
    }
}
