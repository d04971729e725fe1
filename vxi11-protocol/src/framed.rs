//! Record marking for async streams, based on `tokio_util::codec`.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::{DEFAULT_MAX_RECORD_LEN, size_header};
use crate::error::ProtocolError;

const LAST_FRAGMENT: u32 = 0x8000_0000;
const FRAGMENT_LEN_MASK: u32 = 0x7FFF_FFFF;

/// Splits a TCP byte stream into RPC messages and frames outgoing messages.
///
/// Decoded items are the joined message bodies without record marker.
#[derive(Debug)]
pub struct RecordCodec {
    max_len: usize,
    partial: BytesMut,
}

impl RecordCodec {
    pub fn new(max_len: usize) -> RecordCodec {
        RecordCodec {
            max_len,
            partial: BytesMut::new(),
        }
    }
}

impl Default for RecordCodec {
    fn default() -> Self {
        RecordCodec::new(DEFAULT_MAX_RECORD_LEN)
    }
}

impl Decoder for RecordCodec {
    type Item = BytesMut;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if src.len() < 4 {
                return Ok(None);
            }
            let marker = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
            let fragment_len = (marker & FRAGMENT_LEN_MASK) as usize;
            let total = self.partial.len() + fragment_len;
            if total > self.max_len {
                return Err(ProtocolError::TooLarge {
                    max: self.max_len,
                    got: total,
                });
            }
            if src.len() < 4 + fragment_len {
                src.reserve(4 + fragment_len - src.len());
                return Ok(None);
            }
            src.advance(4);
            let fragment = src.split_to(fragment_len);
            self.partial.extend_from_slice(&fragment);
            if marker & LAST_FRAGMENT != 0 {
                return Ok(Some(self.partial.split()));
            }
        }
    }
}

impl Encoder<Bytes> for RecordCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > self.max_len {
            return Err(ProtocolError::TooLarge {
                max: self.max_len,
                got: item.len(),
            });
        }
        dst.reserve(4 + item.len());
        dst.put_slice(&size_header(item.len()));
        dst.put(item);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::codec::{encode_u32, frame_record};

    #[test]
    fn decode_waits_for_complete_fragment() {
        let mut codec = RecordCodec::default();
        let framed = frame_record(b"abcdefgh");
        let mut src = BytesMut::from(&framed[..6]);
        assert!(codec.decode(&mut src).unwrap().is_none());
        src.extend_from_slice(&framed[6..]);
        assert_eq!(&codec.decode(&mut src).unwrap().unwrap()[..], b"abcdefgh");
        assert!(src.is_empty());
    }

    #[test]
    fn decode_joins_fragments() {
        let mut codec = RecordCodec::default();
        let mut src = BytesMut::new();
        src.extend_from_slice(&encode_u32(4));
        src.extend_from_slice(b"abcd");
        src.extend_from_slice(&size_header(4));
        src.extend_from_slice(b"efgh");
        assert_eq!(&codec.decode(&mut src).unwrap().unwrap()[..], b"abcdefgh");
    }

    #[test]
    fn encode_prefixes_marker() {
        let mut codec = RecordCodec::default();
        let mut dst = BytesMut::new();
        codec
            .encode(Bytes::from_static(b"abcd"), &mut dst)
            .unwrap();
        assert_eq!(&dst[..], &frame_record(b"abcd")[..]);
    }

    #[test]
    fn decode_rejects_oversized_fragment() {
        let mut codec = RecordCodec::new(8);
        let mut src = BytesMut::from(&size_header(9)[..]);
        assert!(matches!(
            codec.decode(&mut src),
            Err(ProtocolError::TooLarge { max: 8, got: 9 })
        ));
    }
}
