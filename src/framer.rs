//! Converts between a stream of opaque bytes and a stream of discrete message
//! frames using a 4-byte big-endian length prefix. Pure state machine; no I/O
//! policy of its own — the [`crate::transport::Transport`] drives it.

use bytes::{Buf, Bytes, BytesMut};

/// Length-prefix framer.
///
/// Feed arbitrary byte chunks with [`Framer::push`] and drain complete
/// frames with [`Framer::next_frame`]. A single frame may span any number
/// of `push` calls; a single `push` may contain any number of frames —
/// call `next_frame` in a loop until it returns `None` after each `push`.
#[derive(Debug, Default)]
pub struct Framer {
    buffer: BytesMut,
}

impl Framer {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
        }
    }

    /// Append bytes read from the stream.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Pull the next complete frame out of the buffer, if one is fully
    /// buffered. Returns `None` (not an error) when more bytes are needed —
    /// an unexpected EOF mid-frame is not the Framer's concern.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        if self.buffer.len() < 4 {
            return None;
        }
        let length = u32::from_be_bytes(self.buffer[..4].try_into().unwrap()) as usize;
        if self.buffer.len() < 4 + length {
            return None;
        }
        self.buffer.advance(4);
        Some(self.buffer.split_to(length).freeze())
    }

    /// Number of bytes currently buffered and not yet delivered as a frame.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}

/// Encode a single frame: 4-byte big-endian length prefix followed by `payload`.
pub fn encode_frame(payload: &[u8]) -> BytesMut {
    let mut out = BytesMut::with_capacity(4 + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_frame_round_trips() {
        let mut f = Framer::new();
        f.push(&encode_frame(&[]));
        assert_eq!(f.next_frame().unwrap(), Bytes::new());
        assert_eq!(f.next_frame(), None);
    }

    #[test]
    fn waits_for_more_data_mid_frame() {
        let mut f = Framer::new();
        let whole = encode_frame(b"hello");
        f.push(&whole[..6]);
        assert_eq!(f.next_frame(), None);
        f.push(&whole[6..]);
        assert_eq!(f.next_frame().unwrap(), Bytes::from_static(b"hello"));
    }

    #[test]
    fn byte_at_a_time_chunking() {
        let mut f = Framer::new();
        let mut frames = Vec::new();
        let whole = encode_frame(&[0x01]);
        for b in whole.iter() {
            f.push(&[*b]);
            while let Some(frame) = f.next_frame() {
                frames.push(frame);
            }
        }
        assert_eq!(frames, vec![Bytes::from_static(&[0x01])]);
    }

    #[test]
    fn multiple_frames_in_one_chunk_delivered_in_order() {
        let mut chunk = encode_frame(&[0x01]);
        chunk.extend_from_slice(&encode_frame(&[0x02, 0x03]));

        let mut f = Framer::new();
        f.push(&chunk);

        assert_eq!(f.next_frame().unwrap(), Bytes::from_static(&[0x01]));
        assert_eq!(f.next_frame().unwrap(), Bytes::from_static(&[0x02, 0x03]));
        assert_eq!(f.next_frame(), None);
    }

    #[test]
    fn single_frame_spanning_many_chunks() {
        let whole = encode_frame(&[0xAA; 100]);
        let mut f = Framer::new();
        for chunk in whole.chunks(7) {
            f.push(chunk);
        }
        assert_eq!(f.next_frame().unwrap(), Bytes::from(vec![0xAA; 100]));
    }

    proptest::proptest! {
        #[test]
        fn framing_round_trip_arbitrary_chunking(
            payloads in proptest::collection::vec(proptest::collection::vec(proptest::prelude::any::<u8>(), 0..64), 0..16),
            chunk_size in 1usize..17,
        ) {
            let mut wire = BytesMut::new();
            for p in &payloads {
                wire.extend_from_slice(&encode_frame(p));
            }

            let mut f = Framer::new();
            let mut out = Vec::new();
            for chunk in wire.chunks(chunk_size) {
                f.push(chunk);
                while let Some(frame) = f.next_frame() {
                    out.push(frame.to_vec());
                }
            }

            proptest::prop_assert_eq!(out, payloads);
        }
    }
}
