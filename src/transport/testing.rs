//! Scripted in-memory transport for driving writers and sessions in tests.

use super::{StreamId, Transport, TransportError, WriteOutcome};
use bytes::Bytes;
use std::collections::{HashMap, HashSet};

/// One call to [`Transport::write`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Offer {
    pub stream: StreamId,
    pub offered: usize,
    pub accepted: usize,
    pub fin: bool,
}

/// Transport whose acceptance behavior is set by the test.
///
/// `max_accept` caps a single write call, `credit` is a budget shared by
/// all streams that only grows through [`ScriptedTransport::grant`].
/// `hold_empty_fin` reports a bare fin write as not accepted.
#[derive(Debug)]
pub struct ScriptedTransport {
    pub ready: bool,
    pub closed: bool,
    pub next_stream: u32,
    pub max_accept: Option<usize>,
    pub credit: Option<usize>,
    pub fail_writes: Option<TransportError>,
    pub hold_empty_fin: bool,
    pub offers: Vec<Offer>,
    pub written: HashMap<StreamId, Vec<u8>>,
    pub finished: HashSet<StreamId>,
    pub interest: HashSet<StreamId>,
}

impl ScriptedTransport {
    /// A connected transport that accepts everything.
    pub fn new() -> Self {
        Self {
            ready: true,
            closed: false,
            next_stream: 0,
            max_accept: None,
            credit: None,
            fail_writes: None,
            hold_empty_fin: false,
            offers: Vec::new(),
            written: HashMap::new(),
            finished: HashSet::new(),
            interest: HashSet::new(),
        }
    }

    pub fn with_max_accept(mut self, max: usize) -> Self {
        self.max_accept = Some(max);
        self
    }

    pub fn with_credit(mut self, credit: usize) -> Self {
        self.credit = Some(credit);
        self
    }

    /// Add send credit. Returns whether `stream` had registered interest,
    /// clearing it the way a real transport fires its writable event once.
    pub fn grant(&mut self, stream: StreamId, bytes: usize) -> bool {
        if let Some(credit) = self.credit.as_mut() {
            *credit += bytes;
        }
        self.interest.remove(&stream)
    }

    /// Bytes accepted so far on `stream`.
    pub fn bytes_on(&self, stream: StreamId) -> usize {
        self.written.get(&stream).map_or(0, Vec::len)
    }

    /// Offers on `stream` where the transport took at least one byte.
    pub fn accepted_offers(&self, stream: StreamId) -> Vec<usize> {
        self.offers
            .iter()
            .filter(|o| o.stream == stream && o.accepted > 0)
            .map(|o| o.accepted)
            .collect()
    }

    fn limit(&self) -> usize {
        let cap = self.max_accept.unwrap_or(usize::MAX);
        self.credit.map_or(cap, |credit| credit.min(cap))
    }
}

impl Transport for ScriptedTransport {
    fn open_stream(&mut self) -> Result<StreamId, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        if !self.ready {
            return Err(TransportError::NotReady);
        }
        let id = StreamId(self.next_stream);
        self.next_stream += 2;
        Ok(id)
    }

    fn send_capacity(&self, stream: StreamId) -> Result<usize, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        if self.finished.contains(&stream) {
            return Err(TransportError::StreamFinished(stream));
        }
        Ok(self.limit())
    }

    fn write(
        &mut self,
        stream: StreamId,
        data: Bytes,
        fin: bool,
    ) -> Result<WriteOutcome, TransportError> {
        if let Some(err) = self.fail_writes.clone() {
            return Err(err);
        }
        if self.closed {
            return Err(TransportError::Closed);
        }
        if self.finished.contains(&stream) {
            return Err(TransportError::StreamFinished(stream));
        }

        if data.is_empty() && fin && self.hold_empty_fin {
            self.offers.push(Offer {
                stream,
                offered: 0,
                accepted: 0,
                fin,
            });
            return Ok(WriteOutcome::Partial { unaccepted: data });
        }

        let accepted = data.len().min(self.limit());
        self.offers.push(Offer {
            stream,
            offered: data.len(),
            accepted,
            fin,
        });
        if let Some(credit) = self.credit.as_mut() {
            *credit -= accepted;
        }
        self.written
            .entry(stream)
            .or_default()
            .extend_from_slice(&data[..accepted]);

        if accepted == data.len() {
            if fin {
                self.finished.insert(stream);
            }
            Ok(WriteOutcome::Accepted)
        } else {
            Ok(WriteOutcome::Partial {
                unaccepted: data.slice(accepted..),
            })
        }
    }

    fn notify_writable(&mut self, stream: StreamId) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.interest.insert(stream);
        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
    }
}
