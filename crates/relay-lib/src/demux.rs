//! Demultiplexer for the runtime's framed log stream
//!
//! Each record on the wire is an 8-byte header followed by its payload:
//!
//! ```text
//! [stream type: 1][reserved: 3][payload length: 4, big-endian][payload ...]
//! ```
//!
//! Reads from the transport are arbitrary slices of that byte sequence. The
//! demuxer keeps whatever does not yet form a complete record (including a
//! partially received header) and only emits a frame once its header and its
//! full payload have been seen.

use bytes::{Buf, Bytes, BytesMut};

/// Size of the per-frame header
pub const HEADER_LEN: usize = 8;

/// Stream a log frame was written to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Stdin,
    Stdout,
    Stderr,
    Other(u8),
}

impl From<u8> for StreamType {
    fn from(tag: u8) -> Self {
        match tag {
            0 => StreamType::Stdin,
            1 => StreamType::Stdout,
            2 => StreamType::Stderr,
            other => StreamType::Other(other),
        }
    }
}

/// One complete log record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFrame {
    pub stream: StreamType,
    pub payload: Bytes,
}

#[derive(Debug, Default)]
pub struct LogFrameDemuxer {
    carry: BytesMut,
}

impl LogFrameDemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every frame it completes, in wire order
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<LogFrame> {
        self.carry.extend_from_slice(chunk);

        let mut frames = Vec::new();
        loop {
            if self.carry.len() < HEADER_LEN {
                break;
            }

            let length = u32::from_be_bytes([
                self.carry[4],
                self.carry[5],
                self.carry[6],
                self.carry[7],
            ]) as usize;

            if self.carry.len() < HEADER_LEN + length {
                break;
            }

            let mut record = self.carry.split_to(HEADER_LEN + length);
            let stream = StreamType::from(record[0]);
            record.advance(HEADER_LEN);

            frames.push(LogFrame {
                stream,
                payload: record.freeze(),
            });
        }

        frames
    }

    /// Payload-only view of [`feed`](Self::feed)
    pub fn feed_payloads(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.feed(chunk).into_iter().map(|f| f.payload).collect()
    }

    /// Bytes retained while waiting for the rest of a frame
    pub fn pending(&self) -> usize {
        self.carry.len()
    }
}

/// Encode one frame in wire format (used by tests and scripted runtimes)
pub fn encode_frame(stream: StreamType, payload: &[u8]) -> Vec<u8> {
    let tag = match stream {
        StreamType::Stdin => 0,
        StreamType::Stdout => 1,
        StreamType::Stderr => 2,
        StreamType::Other(t) => t,
    };

    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&[tag, 0, 0, 0]);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_stream() -> (Vec<u8>, Vec<Bytes>) {
        let payloads: Vec<&[u8]> = vec![
            b"2024-01-01T00:00:00Z starting\n",
            b"",
            b"2024-01-01T00:00:01Z listening on :8080\n",
            b"2024-01-01T00:00:02Z warn: slow request\n",
        ];
        let mut wire = Vec::new();
        wire.extend(encode_frame(StreamType::Stdout, payloads[0]));
        wire.extend(encode_frame(StreamType::Stdout, payloads[1]));
        wire.extend(encode_frame(StreamType::Stdout, payloads[2]));
        wire.extend(encode_frame(StreamType::Stderr, payloads[3]));

        let expected = payloads.into_iter().map(Bytes::copy_from_slice).collect();
        (wire, expected)
    }

    #[test]
    fn test_single_chunk() {
        let (wire, expected) = sample_stream();
        let mut demuxer = LogFrameDemuxer::new();

        assert_eq!(demuxer.feed_payloads(&wire), expected);
        assert_eq!(demuxer.pending(), 0);
    }

    #[test]
    fn test_single_byte_chunks() {
        let (wire, expected) = sample_stream();
        let mut demuxer = LogFrameDemuxer::new();

        let mut out = Vec::new();
        for byte in &wire {
            out.extend(demuxer.feed_payloads(std::slice::from_ref(byte)));
        }

        assert_eq!(out, expected);
        assert_eq!(demuxer.pending(), 0);
    }

    #[test]
    fn test_split_at_header_payload_boundary() {
        let (wire, expected) = sample_stream();
        let mut demuxer = LogFrameDemuxer::new();

        let (head, rest) = wire.split_at(HEADER_LEN);
        let mut out = demuxer.feed_payloads(head);
        assert!(out.is_empty());
        assert_eq!(demuxer.pending(), HEADER_LEN);

        out.extend(demuxer.feed_payloads(rest));
        assert_eq!(out, expected);
    }

    #[test]
    fn test_partial_header_is_retained() {
        let frame = encode_frame(StreamType::Stdout, b"hello");
        let mut demuxer = LogFrameDemuxer::new();

        assert!(demuxer.feed(&frame[..5]).is_empty());
        assert_eq!(demuxer.pending(), 5);

        let frames = demuxer.feed(&frame[5..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].stream, StreamType::Stdout);
        assert_eq!(&frames[0].payload[..], b"hello");
    }

    #[test]
    fn test_stream_type_is_reported() {
        let mut wire = encode_frame(StreamType::Stderr, b"oops");
        wire.extend(encode_frame(StreamType::Other(9), b"?"));

        let frames = LogFrameDemuxer::new().feed(&wire);
        assert_eq!(frames[0].stream, StreamType::Stderr);
        assert_eq!(frames[1].stream, StreamType::Other(9));
    }

    #[test]
    fn test_arbitrary_chunking_matches() {
        let (wire, expected) = sample_stream();

        for size in 1..wire.len() {
            let mut demuxer = LogFrameDemuxer::new();
            let out: Vec<Bytes> = wire
                .chunks(size)
                .flat_map(|c| demuxer.feed_payloads(c))
                .collect();
            assert_eq!(out, expected, "chunk size {}", size);
        }
    }
}
