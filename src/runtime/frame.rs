//! Mux wire frames.
//!
//! Every frame starts with a 10-byte big-endian header:
//!
//! ```text
//! +------+-------+---------------+---------------+------------------+
//! | kind | flags | stream_id u32 | length u32    | payload (length) |
//! +------+-------+---------------+---------------+------------------+
//! ```
//!
//! DATA frames carry `length` payload bytes and may set FIN. WINDOW_UPDATE
//! frames carry no payload; `length` is the credit increment.

use crate::transport::StreamId;
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const HEADER_LEN: usize = 10;
/// Largest DATA payload a peer may send.
pub const MAX_FRAME: usize = 1 << 20;

const KIND_DATA: u8 = 0;
const KIND_WINDOW_UPDATE: u8 = 1;
const FLAG_FIN: u8 = 0x01;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data {
        stream: StreamId,
        fin: bool,
        payload: Bytes,
    },
    WindowUpdate {
        stream: StreamId,
        increment: u32,
    },
}

impl Frame {
    /// Encode a frame into an existing buffer
    pub fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            Frame::Data {
                stream,
                fin,
                payload,
            } => {
                buf.reserve(HEADER_LEN + payload.len());
                buf.put_u8(KIND_DATA);
                buf.put_u8(if *fin { FLAG_FIN } else { 0 });
                buf.put_u32(stream.0);
                buf.put_u32(payload.len() as u32);
                buf.extend_from_slice(payload);
            }
            Frame::WindowUpdate { stream, increment } => {
                buf.reserve(HEADER_LEN);
                buf.put_u8(KIND_WINDOW_UPDATE);
                buf.put_u8(0);
                buf.put_u32(stream.0);
                buf.put_u32(*increment);
            }
        }
    }
}

/// Parse result
#[derive(Debug)]
pub enum ParseResult {
    /// A frame was removed from the front of the buffer
    Complete(Frame),
    /// Need more data
    Incomplete,
    /// The peer is not speaking this protocol; the connection is unusable
    Error(String),
}

/// Take one frame off the front of `buffer`.
///
/// Nothing is consumed unless a whole frame is available.
pub fn parse(buffer: &mut BytesMut) -> ParseResult {
    if buffer.len() < HEADER_LEN {
        return ParseResult::Incomplete;
    }

    let mut header = &buffer[..HEADER_LEN];
    let kind = header.get_u8();
    let flags = header.get_u8();
    let stream = StreamId(header.get_u32());
    let length = header.get_u32();

    match kind {
        KIND_DATA => {
            let len = length as usize;
            if len > MAX_FRAME {
                return ParseResult::Error(format!(
                    "data frame of {len} bytes exceeds {MAX_FRAME}"
                ));
            }
            if buffer.len() < HEADER_LEN + len {
                return ParseResult::Incomplete;
            }
            buffer.advance(HEADER_LEN);
            let payload = buffer.split_to(len).freeze();
            ParseResult::Complete(Frame::Data {
                stream,
                fin: flags & FLAG_FIN != 0,
                payload,
            })
        }
        KIND_WINDOW_UPDATE => {
            buffer.advance(HEADER_LEN);
            ParseResult::Complete(Frame::WindowUpdate {
                stream,
                increment: length,
            })
        }
        other => ParseResult::Error(format!("unknown frame kind: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(frame: &Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        frame.encode_into(&mut buf);
        buf
    }

    #[test]
    fn test_encode_data() {
        let frame = Frame::Data {
            stream: StreamId(2),
            fin: true,
            payload: Bytes::from_static(b"100"),
        };
        assert_eq!(
            &encode(&frame)[..],
            &[0, 1, 0, 0, 0, 2, 0, 0, 0, 3, b'1', b'0', b'0']
        );
    }

    #[test]
    fn test_encode_window_update() {
        let frame = Frame::WindowUpdate {
            stream: StreamId(1),
            increment: 65536,
        };
        assert_eq!(&encode(&frame)[..], &[1, 0, 0, 0, 0, 1, 0, 1, 0, 0]);
    }

    #[test]
    fn test_parse_consumes_whole_frames() {
        let mut buf = encode(&Frame::Data {
            stream: StreamId(0),
            fin: false,
            payload: Bytes::from_static(b"hello"),
        });
        Frame::WindowUpdate {
            stream: StreamId(0),
            increment: 5,
        }
        .encode_into(&mut buf);

        match parse(&mut buf) {
            ParseResult::Complete(Frame::Data {
                stream,
                fin,
                payload,
            }) => {
                assert_eq!(stream, StreamId(0));
                assert!(!fin);
                assert_eq!(&payload[..], b"hello");
            }
            other => panic!("Expected data frame, got {:?}", other),
        }
        match parse(&mut buf) {
            ParseResult::Complete(Frame::WindowUpdate { increment, .. }) => {
                assert_eq!(increment, 5)
            }
            other => panic!("Expected window update, got {:?}", other),
        }
        assert!(buf.is_empty());
        assert!(matches!(parse(&mut buf), ParseResult::Incomplete));
    }

    #[test]
    fn test_parse_incomplete() {
        let full = encode(&Frame::Data {
            stream: StreamId(4),
            fin: true,
            payload: Bytes::from_static(b"abc"),
        });

        for cut in [0, 5, HEADER_LEN, full.len() - 1] {
            let mut partial = BytesMut::from(&full[..cut]);
            assert!(matches!(parse(&mut partial), ParseResult::Incomplete));
            assert_eq!(partial.len(), cut);
        }
    }

    #[test]
    fn test_parse_empty_fin() {
        let mut buf = encode(&Frame::Data {
            stream: StreamId(1),
            fin: true,
            payload: Bytes::new(),
        });
        match parse(&mut buf) {
            ParseResult::Complete(Frame::Data { fin, payload, .. }) => {
                assert!(fin);
                assert!(payload.is_empty());
            }
            other => panic!("Expected data frame, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_errors() {
        let mut unknown = BytesMut::from(&[7u8, 0, 0, 0, 0, 0, 0, 0, 0, 0][..]);
        assert!(matches!(parse(&mut unknown), ParseResult::Error(_)));

        let mut oversized = BytesMut::new();
        oversized.put_u8(KIND_DATA);
        oversized.put_u8(0);
        oversized.put_u32(0);
        oversized.put_u32(MAX_FRAME as u32 + 1);
        assert!(matches!(parse(&mut oversized), ParseResult::Error(_)));
    }
}
