//! Throughput reporting.
//!
//! Rates use decimal units: megabits per second with 1 Mb = 1 000 000 bits
//! and elapsed time in whole milliseconds. 1 000 000 bytes in 1000 ms is
//! 8.0 Mb/s.

use crate::transport::StreamId;
use chrono::{DateTime, Utc};
use std::fmt;

/// Why a record carries no rate.
#[derive(Debug, Clone, PartialEq)]
pub enum Unmeasured {
    /// Start and end fell in the same millisecond.
    ZeroElapsed,
    /// The reply stopped short of its target.
    Incomplete { received: u64, expected: u64 },
    /// The connection never got as far as sending a request.
    NotStarted(String),
}

impl fmt::Display for Unmeasured {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unmeasured::ZeroElapsed => write!(f, "elapsed time below timer resolution"),
            Unmeasured::Incomplete { received, expected } => {
                write!(f, "received {received} of {expected} bytes")
            }
            Unmeasured::NotStarted(reason) => write!(f, "transfer not started: {reason}"),
        }
    }
}

/// Measured rate or the reason there is none.
#[derive(Debug, Clone, PartialEq)]
pub enum Rate {
    Measured { elapsed_ms: u64, mbps: f64 },
    Unmeasured(Unmeasured),
}

/// Outcome of one transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct ThroughputRecord {
    pub stream: Option<StreamId>,
    pub start: Option<DateTime<Utc>>,
    pub stop: Option<DateTime<Utc>>,
    pub bytes: u64,
    pub rate: Rate,
}

impl ThroughputRecord {
    pub fn mbps(&self) -> Option<f64> {
        match self.rate {
            Rate::Measured { mbps, .. } => Some(mbps),
            Rate::Unmeasured(_) => None,
        }
    }

    pub fn is_measured(&self) -> bool {
        matches!(self.rate, Rate::Measured { .. })
    }

    /// Tab-separated result line annotated with experiment labels.
    pub fn line<'a>(&'a self, labels: &'a Labels) -> RecordLine<'a> {
        RecordLine {
            record: self,
            labels,
        }
    }
}

/// Free-form experiment annotations printed with each record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Labels {
    pub latency: String,
    pub loss: String,
}

impl Default for Labels {
    fn default() -> Self {
        Self {
            latency: "-".to_string(),
            loss: "-".to_string(),
        }
    }
}

/// Display adapter for [`ThroughputRecord::line`].
pub struct RecordLine<'a> {
    record: &'a ThroughputRecord,
    labels: &'a Labels,
}

impl fmt::Display for RecordLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "latency: {}\tloss_percentage: {}",
            self.labels.latency, self.labels.loss
        )?;
        match (&self.record.rate, self.record.start, self.record.stop) {
            (Rate::Measured { mbps, .. }, Some(start), Some(stop)) => write!(
                f,
                "\t start: {}\t stop: {}\t bytes: {}\t rate: {:.3}",
                start.timestamp_millis(),
                stop.timestamp_millis(),
                self.record.bytes,
                mbps
            ),
            _ => write!(f, "\t start: -1\t stop: -1\t bytes: -1\t rate: -1"),
        }
    }
}

/// Compute the rate of a completed transfer.
pub fn report(
    stream: StreamId,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    total_bytes: u64,
) -> ThroughputRecord {
    let elapsed_ms = (end - start).num_milliseconds().max(0) as u64;
    let rate = if elapsed_ms == 0 {
        Rate::Unmeasured(Unmeasured::ZeroElapsed)
    } else {
        Rate::Measured {
            elapsed_ms,
            mbps: megabits_per_second(total_bytes, elapsed_ms),
        }
    };

    ThroughputRecord {
        stream: Some(stream),
        start: Some(start),
        stop: Some(end),
        bytes: total_bytes,
        rate,
    }
}

/// Record for a transfer that never reached its target.
pub fn unmeasured(
    stream: Option<StreamId>,
    start: Option<DateTime<Utc>>,
    bytes: u64,
    reason: Unmeasured,
) -> ThroughputRecord {
    ThroughputRecord {
        stream,
        start,
        stop: None,
        bytes,
        rate: Rate::Unmeasured(reason),
    }
}

fn megabits_per_second(bytes: u64, elapsed_ms: u64) -> f64 {
    let bits = bytes as f64 * 8.0;
    let seconds = elapsed_ms as f64 / 1000.0;
    bits / 1_000_000.0 / seconds
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).unwrap()
    }

    #[test]
    fn test_one_megabyte_per_second() {
        let record = report(StreamId(0), t(5_000), t(6_000), 1_000_000);
        assert_eq!(
            record.rate,
            Rate::Measured {
                elapsed_ms: 1000,
                mbps: 8.0
            }
        );
        assert_eq!(record.mbps(), Some(8.0));
    }

    #[test]
    fn test_zero_elapsed_is_unmeasured() {
        let record = report(StreamId(0), t(100), t(100), 1000);
        assert_eq!(record.rate, Rate::Unmeasured(Unmeasured::ZeroElapsed));
        assert!(!record.is_measured());
    }

    #[test]
    fn test_record_line() {
        let labels = Labels {
            latency: "50ms".to_string(),
            loss: "1".to_string(),
        };
        let record = report(StreamId(0), t(1_000), t(3_000), 500_000);
        assert_eq!(
            record.line(&labels).to_string(),
            "latency: 50ms\tloss_percentage: 1\t start: 1000\t stop: 3000\t bytes: 500000\t rate: 2.000"
        );
    }

    #[test]
    fn test_unmeasured_line() {
        let record = unmeasured(
            Some(StreamId(0)),
            Some(t(0)),
            400,
            Unmeasured::Incomplete {
                received: 400,
                expected: 1000,
            },
        );
        assert_eq!(
            record.line(&Labels::default()).to_string(),
            "latency: -\tloss_percentage: -\t start: -1\t stop: -1\t bytes: -1\t rate: -1"
        );
        assert_eq!(record.mbps(), None);
    }
}
