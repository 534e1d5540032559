//! Message codecs.
//!
//! A codec turns typed messages into the payload of a single `Data` frame and
//! back. Framing (the length prefix) belongs to the transport, so codecs only
//! ever see complete message bodies.

use bytes::{Bytes, BytesMut};
use std::fmt;

use crate::error::CodecError;

/// Serializes and deserializes messages of type `T`.
///
/// Implementations must be deterministic (the same message always encodes to
/// the same bytes) and must reject malformed input with an error instead of
/// panicking.
pub trait Codec<T>: Send + Sync + 'static {
    fn encode(&self, item: &T, dst: &mut BytesMut) -> Result<(), CodecError>;

    fn decode(&self, src: Bytes) -> Result<T, CodecError>;

    /// A diagnostic tag naming the message type, carried in call headers.
    fn type_tag(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// The default codec: protobuf via `prost`.
///
/// Protobuf encoding of a given message is deterministic as long as the
/// message does not use `map` fields backed by a `HashMap`; use prost's
/// `btree_map` option for those.
#[derive(Clone, Copy, Default)]
pub struct ProstCodec;

impl fmt::Debug for ProstCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProstCodec")
    }
}

impl<T> Codec<T> for ProstCodec
where
    T: prost::Message + Default + 'static,
{
    fn encode(&self, item: &T, dst: &mut BytesMut) -> Result<(), CodecError> {
        dst.reserve(item.encoded_len());
        item.encode(dst)?;
        Ok(())
    }

    fn decode(&self, src: Bytes) -> Result<T, CodecError> {
        Ok(T::decode(src)?)
    }
}

/// Encode a message into a standalone payload.
pub(crate) fn encode_to_bytes<T, C>(codec: &C, item: &T) -> Result<Bytes, CodecError>
where
    C: Codec<T>,
{
    let mut buf = BytesMut::new();
    codec.encode(item, &mut buf)?;
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Clone, PartialEq, prost::Message)]
    struct Sample {
        #[prost(string, tag = "1")]
        name: String,
        #[prost(uint64, tag = "2")]
        count: u64,
        #[prost(bytes = "vec", tag = "3")]
        blob: Vec<u8>,
        #[prost(string, repeated, tag = "4")]
        tags: Vec<String>,
    }

    #[test]
    fn test_truncated_input_is_rejected() {
        let msg = Sample {
            name: "a fairly long name".into(),
            count: 7,
            blob: vec![1, 2, 3],
            tags: vec!["x".into()],
        };
        let bytes = encode_to_bytes(&ProstCodec, &msg).unwrap();
        let truncated = bytes.slice(..bytes.len() - 2);

        let result: Result<Sample, _> = ProstCodec.decode(truncated);
        assert!(matches!(result, Err(CodecError::Decode(_))));
    }

    #[test]
    fn test_type_tag_names_message() {
        let tag = <ProstCodec as Codec<Sample>>::type_tag(&ProstCodec);
        assert!(tag.ends_with("Sample"));
    }

    proptest! {
        #[test]
        fn prop_roundtrip(name in ".*", count in any::<u64>(), blob in proptest::collection::vec(any::<u8>(), 0..64), tags in proptest::collection::vec(".*", 0..4)) {
            let msg = Sample { name, count, blob, tags };
            let bytes = encode_to_bytes(&ProstCodec, &msg).unwrap();
            let decoded: Sample = ProstCodec.decode(bytes).unwrap();
            prop_assert_eq!(decoded, msg);
        }

        #[test]
        fn prop_encoding_is_deterministic(name in ".*", count in any::<u64>()) {
            let msg = Sample { name, count, blob: vec![], tags: vec![] };
            let first = encode_to_bytes(&ProstCodec, &msg).unwrap();
            let second = encode_to_bytes(&ProstCodec, &msg.clone()).unwrap();
            prop_assert_eq!(first, second);
        }

        #[test]
        fn prop_decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..128)) {
            let _: Result<Sample, _> = ProstCodec.decode(Bytes::from(bytes));
        }
    }
}
