//! CBOR envelope helpers.
//!
//! Certificates and request envelopes travel as CBOR with the
//! self-describing tag (0xd9d9f7, cf.
//! https://tools.ietf.org/html/rfc7049#section-2.4.5). Encoding is
//! deterministic: struct fields serialize in declaration order and
//! integers use their shortest form, so a value always encodes to the
//! same bytes.

use crate::error::AgentError;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// The self-describing CBOR tag prefix required by the interface spec.
pub const SELF_DESCRIBING_TAG: [u8; 3] = [0xd9, 0xd9, 0xf7];

/// Serialises `value` with the self-describing tag prepended.
pub fn to_self_describing_vec<T: Serialize>(value: &T) -> Result<Vec<u8>, AgentError> {
    let mut serializer = serde_cbor::ser::Serializer::new(Vec::new());
    serializer.self_describe()?;
    value.serialize(&mut serializer)?;
    Ok(serializer.into_inner())
}

/// Deserialises a value, accepting it with or without the self-describing
/// tag. Byte strings are preserved verbatim; integers up to 64 bits
/// survive undamaged.
pub fn from_self_describing_slice<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, AgentError> {
    Ok(serde_cbor::from_slice(bytes)?)
}

/// Like [`from_self_describing_slice`] but insists on the tag, the way
/// certificates are required to arrive.
pub fn from_tagged_slice<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, AgentError> {
    if bytes.len() < 3 || bytes[0..3] != SELF_DESCRIBING_TAG {
        return Err(AgentError::MalformedResponse(
            "CBOR value doesn't have a self-describing tag".to_string(),
        ));
    }
    from_self_describing_slice(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Envelope {
        label: serde_bytes::ByteBuf,
        time: u64,
    }

    #[test]
    fn should_emit_and_accept_self_describing_tag() {
        let value = Envelope {
            label: serde_bytes::ByteBuf::from(vec![0x00, 0xff]),
            time: 1_650_000_000_000_000_000,
        };
        let bytes = to_self_describing_vec(&value).unwrap();
        assert_eq!(&bytes[0..3], &SELF_DESCRIBING_TAG);

        let decoded: Envelope = from_tagged_slice(&bytes).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn should_preserve_large_integers() {
        // Values above 2^53 must survive decoding bit-exactly.
        let value = Envelope {
            label: serde_bytes::ByteBuf::new(),
            time: (1u64 << 62) + 12345,
        };
        let bytes = to_self_describing_vec(&value).unwrap();
        let decoded: Envelope = from_self_describing_slice(&bytes).unwrap();
        assert_eq!(decoded.time, (1u64 << 62) + 12345);
    }

    #[test]
    fn should_insist_on_tag_when_required() {
        let value = Envelope { label: serde_bytes::ByteBuf::new(), time: 1 };
        let untagged = serde_cbor::to_vec(&value).unwrap();
        assert_matches!(
            from_tagged_slice::<Envelope>(&untagged),
            Err(AgentError::MalformedResponse(msg)) if msg.contains("self-describing tag")
        );
        // The permissive entry point still takes it.
        assert!(from_self_describing_slice::<Envelope>(&untagged).is_ok());
    }

    #[test]
    fn encoding_is_deterministic() {
        let value = Envelope {
            label: serde_bytes::ByteBuf::from(vec![1, 2, 3]),
            time: 42,
        };
        assert_eq!(
            to_self_describing_vec(&value).unwrap(),
            to_self_describing_vec(&value).unwrap()
        );
    }
}
