//! Request identifiers.
//!
//! A request id is the SHA-256 representation-independent hash of the
//! request content map: every field name and value is hashed, the pairs
//! are sorted by key hash, and the concatenation is hashed again. The id
//! is stable across field order and across retries of the same content.

use crate::{hash_bytes, leb128, Hash, IC_REQUEST_DOMAIN_SEPARATOR};
use std::fmt;

/// A value in a request content map, as covered by the
/// representation-independent hash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Bytes(Vec<u8>),
    String(String),
    Number(u64),
    Array(Vec<Value>),
    Map(Vec<(String, Value)>),
}

fn hash_value(value: &Value) -> Hash {
    match value {
        Value::Bytes(bytes) => hash_bytes(bytes),
        Value::String(string) => hash_bytes(string.as_bytes()),
        Value::Number(number) => hash_bytes(leb128::encode(*number)),
        Value::Array(values) => {
            let mut concat = Vec::with_capacity(values.len() * 32);
            for v in values {
                concat.extend_from_slice(&hash_value(v));
            }
            hash_bytes(concat)
        }
        Value::Map(map) => representation_independent_hash(map),
    }
}

/// Hashes a field map: `sha256(sorted(sha256(key) ‖ hash(value)))`.
pub fn representation_independent_hash(map: &[(String, Value)]) -> Hash {
    let mut hashes: Vec<(Hash, Hash)> = map
        .iter()
        .map(|(key, value)| (hash_bytes(key.as_bytes()), hash_value(value)))
        .collect();
    hashes.sort();

    let mut concat = Vec::with_capacity(hashes.len() * 64);
    for (key_hash, value_hash) in hashes {
        concat.extend_from_slice(&key_hash);
        concat.extend_from_slice(&value_hash);
    }
    hash_bytes(concat)
}

/// The 32-byte fingerprint identifying a request across retries.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(Hash);

impl RequestId {
    pub fn new(hash: Hash) -> Self {
        RequestId(hash)
    }

    /// Computes the id of a content map.
    pub fn from_content_map(map: &[(String, Value)]) -> Self {
        RequestId(representation_independent_hash(map))
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// The message an identity signs for this request:
    /// `"\x0aic-request" ‖ request_id`.
    pub fn signable(&self) -> Vec<u8> {
        let mut msg = Vec::with_capacity(IC_REQUEST_DOMAIN_SEPARATOR.len() + 32);
        msg.extend_from_slice(IC_REQUEST_DOMAIN_SEPARATOR);
        msg.extend_from_slice(&self.0);
        msg
    }
}

impl AsRef<[u8]> for RequestId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({})", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_match_interface_spec_example() {
        // The worked example from the interface specification's
        // "Request ids" section.
        let map = vec![
            ("request_type".to_string(), Value::String("call".to_string())),
            (
                "canister_id".to_string(),
                Value::Bytes(vec![0, 0, 0, 0, 0, 0, 0x04, 0xd2]),
            ),
            ("method_name".to_string(), Value::String("hello".to_string())),
            ("arg".to_string(), Value::Bytes(b"DIDL\x00\xfd*".to_vec())),
        ];
        let id = RequestId::from_content_map(&map);
        assert_eq!(
            id.to_string(),
            "8781291c947721403888e34f8480f63d187ea0d85f857f4d89ed4cd52b55291c"
        );
    }

    #[test]
    fn hash_is_independent_of_field_order() {
        let a = vec![
            ("alpha".to_string(), Value::Number(7)),
            ("beta".to_string(), Value::Bytes(vec![1, 2, 3])),
        ];
        let b = vec![
            ("beta".to_string(), Value::Bytes(vec![1, 2, 3])),
            ("alpha".to_string(), Value::Number(7)),
        ];
        assert_eq!(
            representation_independent_hash(&a),
            representation_independent_hash(&b)
        );
    }

    #[test]
    fn numbers_hash_as_leb128() {
        let direct = hash_value(&Value::Number(624_485));
        assert_eq!(direct, hash_bytes([0xe5, 0x8e, 0x26]));
    }

    #[test]
    fn nested_structures_hash_recursively() {
        let with_paths = vec![(
            "paths".to_string(),
            Value::Array(vec![Value::Array(vec![
                Value::Bytes(b"request_status".to_vec()),
                Value::Bytes(vec![0xab; 32]),
            ])]),
        )];
        let with_reply = vec![(
            "reply".to_string(),
            Value::Map(vec![("arg".to_string(), Value::Bytes(b"DIDL".to_vec()))]),
        )];
        assert_ne!(
            representation_independent_hash(&with_paths),
            representation_independent_hash(&with_reply)
        );
    }

    #[test]
    fn signable_prepends_domain_separator() {
        let id = RequestId::new([0x11; 32]);
        let signable = id.signable();
        assert_eq!(&signable[..11], b"\x0aic-request");
        assert_eq!(&signable[11..], [0x11; 32]);
    }
}
