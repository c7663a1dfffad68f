// ABOUTME: Length-prefixed frame codec shared by every connection
// ABOUTME: Also the only place that decides whether a pre-handshake length field is a probe

use crate::error::FrameError;
use crate::four_letter::FourLetterWord;
use crate::records::Encodable;
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Result of attempting to read the next unit of work off a connection's
/// socket: a complete frame, a recognised diagnostic probe, end of stream,
/// or "keep buffering."
#[derive(Debug)]
pub enum FrameOutcome {
    /// Not enough data buffered yet; wait for the next readable event.
    NeedMore,
    /// A complete `<len><payload>` frame. `payload` excludes the length
    /// prefix itself.
    Frame(Bytes),
    /// The length field's four bytes matched a four-letter probe token
    /// (only possible pre-handshake).
    Probe(FourLetterWord),
    /// The peer closed the connection cleanly (no partial frame pending).
    Eof,
}

/// Stateless two-phase frame reader/writer. Per-connection read state (the
/// length buffer and payload buffer) lives in the caller's `BytesMut`;
/// this type only knows how to interpret it.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame: u32,
}

impl FrameCodec {
    pub fn new(max_frame: u32) -> Self {
        FrameCodec { max_frame }
    }

    pub fn max_frame(&self) -> u32 {
        self.max_frame
    }

    /// Read the next frame or probe from `stream`, buffering partial reads
    /// in `buffer` across calls. `initialized` gates four-letter probe
    /// detection: once a connection has completed its handshake, the
    /// length field is always interpreted as a length.
    #[tracing::instrument(skip(self, stream, buffer))]
    pub async fn read_frame<S>(
        &self,
        stream: &mut S,
        buffer: &mut BytesMut,
        initialized: bool,
    ) -> Result<FrameOutcome, FrameError>
    where
        S: AsyncRead + Unpin,
    {
        loop {
            if let Some(outcome) = self.try_parse(buffer, initialized)? {
                return Ok(outcome);
            }

            if 0 == stream.read_buf(buffer).await? {
                return if buffer.is_empty() {
                    Ok(FrameOutcome::Eof)
                } else {
                    Err(FrameError::Eof)
                };
            }
        }
    }

    /// Try to pull one frame/probe out of already-buffered bytes without
    /// touching the socket. Returns `Ok(None)` ("NeedMore") when the
    /// buffer doesn't yet hold a complete length field or payload.
    fn try_parse(
        &self,
        buffer: &mut BytesMut,
        initialized: bool,
    ) -> Result<Option<FrameOutcome>, FrameError> {
        if buffer.len() < 4 {
            return Ok(None);
        }

        let raw = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]);

        if !initialized {
            if let Some(word) = FourLetterWord::lookup(raw) {
                buffer.advance(4);
                return Ok(Some(FrameOutcome::Probe(word)));
            }
        }

        let len = raw as i32;
        if len < 0 {
            return Err(FrameError::NegativeLength { length: len });
        }
        let len = len as u32;
        if len > self.max_frame {
            return Err(FrameError::TooLarge {
                length: len,
                max: self.max_frame,
            });
        }

        let total = 4 + len as usize;
        if buffer.len() < total {
            return Ok(None);
        }

        buffer.advance(4);
        let payload = buffer.split_to(len as usize).freeze();
        Ok(Some(FrameOutcome::Frame(payload)))
    }

    /// Encode `<len><header><record?>`, computing `len` over the body only
    /// by writing a placeholder first and patching it once the body's
    /// length is known — this avoids a size-computation pre-pass.
    pub fn encode_response(header: &dyn Encodable, record: Option<&dyn Encodable>) -> Bytes {
        let mut buf = BytesMut::new();
        buf.resize(4, 0);
        header.encode(&mut buf);
        if let Some(record) = record {
            record.encode(&mut buf);
        }
        let body_len = (buf.len() - 4) as u32;
        buf[0..4].copy_from_slice(&body_len.to_be_bytes());
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{ReplyHeader, WatcherEvent};

    fn encode_raw_frame(payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + payload.len());
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[tokio::test]
    async fn decode_of_encode_is_identity() {
        let codec = FrameCodec::new(1024 * 1024);
        for len in [0usize, 1, 44, 4096] {
            let payload = vec![0xAB; len];
            let wire = encode_raw_frame(&payload);
            let mut buffer = BytesMut::new();
            let mut cursor = std::io::Cursor::new(wire.as_slice());
            let outcome = codec.read_frame(&mut cursor, &mut buffer, true).await.unwrap();
            match outcome {
                FrameOutcome::Frame(got) => assert_eq!(got.as_ref(), payload.as_slice()),
                other => panic!("expected Frame, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn streaming_one_byte_at_a_time_yields_the_same_frames() {
        let codec = FrameCodec::new(1024 * 1024);
        let frames: Vec<Vec<u8>> = vec![vec![1, 2, 3], vec![], vec![9; 50]];
        let mut wire = Vec::new();
        for f in &frames {
            wire.extend(encode_raw_frame(f));
        }

        let (mut client, mut server) = tokio::io::duplex(1);
        let writer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            for byte in wire {
                client.write_all(&[byte]).await.unwrap();
            }
        });

        let mut buffer = BytesMut::new();
        let mut got = Vec::new();
        for _ in &frames {
            match codec.read_frame(&mut server, &mut buffer, true).await.unwrap() {
                FrameOutcome::Frame(payload) => got.push(payload.to_vec()),
                other => panic!("expected Frame, got {other:?}"),
            }
        }
        writer.await.unwrap();
        assert_eq!(got, frames);
    }

    #[tokio::test]
    async fn at_most_one_parse_per_frame_then_needs_more() {
        let codec = FrameCodec::new(1024 * 1024);
        let wire = encode_raw_frame(b"hello");
        let mut buffer = BytesMut::from(&wire[..]);
        // No socket bytes left, so only try_parse (no blocking read) is
        // exercised via an already-exhausted in-memory reader.
        let outcome = codec.try_parse(&mut buffer, true).unwrap();
        assert!(matches!(outcome, Some(FrameOutcome::Frame(_))));
        let second = codec.try_parse(&mut buffer, true).unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn negative_length_is_a_framing_error() {
        let codec = FrameCodec::new(1024 * 1024);
        let mut buffer = BytesMut::from(&[0xFFu8, 0xFF, 0xFF, 0xFF][..]);
        let err = codec.try_parse(&mut buffer, true).unwrap_err();
        assert!(matches!(err, FrameError::NegativeLength { .. }));
    }

    #[test]
    fn length_over_max_is_a_framing_error() {
        let codec = FrameCodec::new(16);
        let mut buffer = BytesMut::from(&encode_raw_frame(&[0u8; 32])[..]);
        let err = codec.try_parse(&mut buffer, true).unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { .. }));
    }

    #[test]
    fn pre_handshake_probe_is_recognised_instead_of_a_length() {
        let codec = FrameCodec::new(1024 * 1024);
        let mut buffer = BytesMut::from(&b"ruok"[..]);
        let outcome = codec.try_parse(&mut buffer, false).unwrap();
        assert!(matches!(outcome, Some(FrameOutcome::Probe(FourLetterWord::Ruok))));
    }

    #[test]
    fn post_handshake_the_same_bytes_are_a_length_not_a_probe() {
        let codec = FrameCodec::new(1024 * 1024);
        // "ruok" packed big-endian is a huge number, guaranteed > max_frame.
        let mut buffer = BytesMut::from(&b"ruok"[..]);
        let err = codec.try_parse(&mut buffer, true).unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { .. }));
    }

    #[test]
    fn encode_response_computes_length_over_body_only() {
        let header = ReplyHeader::notification(7);
        let record = WatcherEvent {
            event_type: 1,
            state: 3,
            path: "/a".to_string(),
        };
        let wire = FrameCodec::encode_response(&header, Some(&record));
        let len = u32::from_be_bytes([wire[0], wire[1], wire[2], wire[3]]);
        assert_eq!(len as usize, wire.len() - 4);
    }
}
