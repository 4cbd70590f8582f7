//! Request content and the signed envelope it travels in.

use crate::cbor;
use crate::error::AgentError;
use crate::identity::SignedDelegation;
use crate::request_id::{RequestId, Value};
use candid::Principal;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

/// The canonical request content, hashed for the request id and CBOR
/// encoded inside the envelope. Fields are declared in lexicographic
/// order; the `request_type` tag is emitted first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "request_type", rename_all = "snake_case")]
pub enum EnvelopeContent {
    Call {
        #[serde(with = "serde_bytes")]
        arg: Vec<u8>,
        canister_id: Principal,
        ingress_expiry: u64,
        method_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        nonce: Option<ByteBuf>,
        sender: Principal,
    },
    Query {
        #[serde(with = "serde_bytes")]
        arg: Vec<u8>,
        canister_id: Principal,
        ingress_expiry: u64,
        method_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        nonce: Option<ByteBuf>,
        sender: Principal,
    },
    ReadState {
        ingress_expiry: u64,
        paths: Vec<Vec<ByteBuf>>,
        sender: Principal,
    },
}

impl EnvelopeContent {
    pub fn sender(&self) -> &Principal {
        match self {
            EnvelopeContent::Call { sender, .. }
            | EnvelopeContent::Query { sender, .. }
            | EnvelopeContent::ReadState { sender, .. } => sender,
        }
    }

    pub fn ingress_expiry(&self) -> u64 {
        match self {
            EnvelopeContent::Call { ingress_expiry, .. }
            | EnvelopeContent::Query { ingress_expiry, .. }
            | EnvelopeContent::ReadState { ingress_expiry, .. } => *ingress_expiry,
        }
    }

    /// Computes the request id over the content map.
    pub fn to_request_id(&self) -> RequestId {
        RequestId::from_content_map(&self.to_content_map())
    }

    fn to_content_map(&self) -> Vec<(String, Value)> {
        match self {
            EnvelopeContent::Call {
                arg,
                canister_id,
                ingress_expiry,
                method_name,
                nonce,
                sender,
            }
            | EnvelopeContent::Query {
                arg,
                canister_id,
                ingress_expiry,
                method_name,
                nonce,
                sender,
            } => {
                let request_type = match self {
                    EnvelopeContent::Call { .. } => "call",
                    _ => "query",
                };
                let mut map = vec![
                    ("request_type".to_string(), Value::String(request_type.to_string())),
                    ("canister_id".to_string(), Value::Bytes(canister_id.as_slice().to_vec())),
                    ("method_name".to_string(), Value::String(method_name.clone())),
                    ("arg".to_string(), Value::Bytes(arg.clone())),
                    ("sender".to_string(), Value::Bytes(sender.as_slice().to_vec())),
                    ("ingress_expiry".to_string(), Value::Number(*ingress_expiry)),
                ];
                if let Some(nonce) = nonce {
                    map.push(("nonce".to_string(), Value::Bytes(nonce.to_vec())));
                }
                map
            }
            EnvelopeContent::ReadState { ingress_expiry, paths, sender } => vec![
                ("request_type".to_string(), Value::String("read_state".to_string())),
                (
                    "paths".to_string(),
                    Value::Array(
                        paths
                            .iter()
                            .map(|path| {
                                Value::Array(
                                    path.iter().map(|seg| Value::Bytes(seg.to_vec())).collect(),
                                )
                            })
                            .collect(),
                    ),
                ),
                ("sender".to_string(), Value::Bytes(sender.as_slice().to_vec())),
                ("ingress_expiry".to_string(), Value::Number(*ingress_expiry)),
            ],
        }
    }
}

/// The outer wire envelope: content plus the sender's authentication.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope<'a> {
    pub content: &'a EnvelopeContent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_pubkey: Option<ByteBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_sig: Option<ByteBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_delegation: Option<Vec<SignedDelegation>>,
}

impl Envelope<'_> {
    pub fn encode(&self) -> Result<Vec<u8>, AgentError> {
        cbor::to_self_describing_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request_id::representation_independent_hash;

    fn sample_call(nonce: Option<ByteBuf>) -> EnvelopeContent {
        EnvelopeContent::Call {
            arg: b"DIDL\x00\xfd*".to_vec(),
            canister_id: Principal::from_slice(&[0, 0, 0, 0, 0, 0, 4, 0xd2]),
            ingress_expiry: 1_746_103_200_000_000_000,
            method_name: "hello".to_string(),
            nonce,
            sender: Principal::anonymous(),
        }
    }

    #[test]
    fn request_id_matches_manual_content_map() {
        let content = sample_call(None);
        let expected = representation_independent_hash(&[
            ("request_type".to_string(), Value::String("call".to_string())),
            ("canister_id".to_string(), Value::Bytes(vec![0, 0, 0, 0, 0, 0, 4, 0xd2])),
            ("method_name".to_string(), Value::String("hello".to_string())),
            ("arg".to_string(), Value::Bytes(b"DIDL\x00\xfd*".to_vec())),
            ("sender".to_string(), Value::Bytes(vec![0x04])),
            ("ingress_expiry".to_string(), Value::Number(1_746_103_200_000_000_000)),
        ]);
        assert_eq!(content.to_request_id().as_slice(), expected);
    }

    #[test]
    fn nonce_changes_the_request_id() {
        let without = sample_call(None);
        let with = sample_call(Some(ByteBuf::from(vec![1, 2, 3])));
        assert_ne!(without.to_request_id(), with.to_request_id());
    }

    #[test]
    fn query_and_call_ids_differ_for_same_fields() {
        let call = sample_call(None);
        let EnvelopeContent::Call { arg, canister_id, ingress_expiry, method_name, nonce, sender } =
            call.clone()
        else {
            unreachable!()
        };
        let query = EnvelopeContent::Query {
            arg,
            canister_id,
            ingress_expiry,
            method_name,
            nonce,
            sender,
        };
        assert_ne!(call.to_request_id(), query.to_request_id());
    }

    #[test]
    fn envelope_encodes_with_tag_and_request_type() {
        let content = sample_call(None);
        let envelope = Envelope {
            content: &content,
            sender_pubkey: None,
            sender_sig: None,
            sender_delegation: None,
        };
        let bytes = envelope.encode().unwrap();
        assert_eq!(&bytes[0..3], &cbor::SELF_DESCRIBING_TAG);
        // The request_type tag field must be on the wire.
        let as_value: serde_cbor::Value = serde_cbor::from_slice(&bytes).unwrap();
        let serde_cbor::Value::Map(outer) = as_value else { panic!("expected map") };
        let content_value = outer
            .get(&serde_cbor::Value::Text("content".to_string()))
            .expect("envelope lacks content");
        let serde_cbor::Value::Map(content_map) = content_value else { panic!("expected map") };
        assert_eq!(
            content_map.get(&serde_cbor::Value::Text("request_type".to_string())),
            Some(&serde_cbor::Value::Text("call".to_string()))
        );
        assert!(!outer.contains_key(&serde_cbor::Value::Text("sender_sig".to_string())));
    }

    #[test]
    fn read_state_paths_are_hashed_as_nested_arrays() {
        let content = EnvelopeContent::ReadState {
            ingress_expiry: 1,
            paths: vec![vec![ByteBuf::from(b"time".to_vec())]],
            sender: Principal::anonymous(),
        };
        let expected = representation_independent_hash(&[
            ("request_type".to_string(), Value::String("read_state".to_string())),
            (
                "paths".to_string(),
                Value::Array(vec![Value::Array(vec![Value::Bytes(b"time".to_vec())])]),
            ),
            ("sender".to_string(), Value::Bytes(vec![0x04])),
            ("ingress_expiry".to_string(), Value::Number(1)),
        ]);
        assert_eq!(content.to_request_id().as_slice(), expected);
    }
}
