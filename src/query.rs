//! Query responses and their per-node signature verification.
//!
//! Queries are not certified by the subnet key; instead each replying
//! node signs the response content with its own ed25519 key. Trust comes
//! from checking every signature against the node-key map certified for
//! the canister's owning subnet.

use crate::bls::verify_node_signature;
use crate::error::AgentError;
use crate::request_id::{representation_independent_hash, RequestId, Value};
use crate::IC_RESPONSE_DOMAIN_SEPARATOR;
use candid::Principal;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use std::collections::BTreeMap;

/// A query response body as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum QueryResponse {
    Replied {
        reply: QueryReply,
        #[serde(default)]
        signatures: Vec<NodeSignature>,
    },
    Rejected {
        reject_code: u64,
        reject_message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_code: Option<String>,
        #[serde(default)]
        signatures: Vec<NodeSignature>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryReply {
    #[serde(with = "serde_bytes")]
    pub arg: Vec<u8>,
}

/// One node's signature over a query response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSignature {
    /// Nanoseconds since the epoch at which the node produced the reply.
    pub timestamp: u64,
    /// 64-byte ed25519 signature.
    pub signature: ByteBuf,
    /// The signing node's principal.
    pub identity: Principal,
}

impl QueryResponse {
    pub fn signatures(&self) -> &[NodeSignature] {
        match self {
            QueryResponse::Replied { signatures, .. }
            | QueryResponse::Rejected { signatures, .. } => signatures,
        }
    }
}

/// The certified node keys of one subnet. Values are 44-byte DER ed25519
/// keys. Replaced whole on refresh, never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetKeys {
    pub subnet_id: Principal,
    pub node_keys: BTreeMap<Principal, Vec<u8>>,
}

/// The message a node signs for a given response:
/// `"\x0bic-response" ‖ hash_of_map({status, …, timestamp, request_id})`.
pub(crate) fn response_signable(
    response: &QueryResponse,
    timestamp: u64,
    request_id: &RequestId,
) -> Vec<u8> {
    let mut map: Vec<(String, Value)> = match response {
        QueryResponse::Replied { reply, .. } => vec![
            ("status".to_string(), Value::String("replied".to_string())),
            (
                "reply".to_string(),
                Value::Map(vec![("arg".to_string(), Value::Bytes(reply.arg.clone()))]),
            ),
        ],
        QueryResponse::Rejected { reject_code, reject_message, error_code, .. } => {
            let mut map = vec![
                ("status".to_string(), Value::String("rejected".to_string())),
                ("reject_code".to_string(), Value::Number(*reject_code)),
                ("reject_message".to_string(), Value::String(reject_message.clone())),
            ];
            if let Some(error_code) = error_code {
                map.push(("error_code".to_string(), Value::String(error_code.clone())));
            }
            map
        }
    };
    map.push(("timestamp".to_string(), Value::Number(timestamp)));
    map.push(("request_id".to_string(), Value::Bytes(request_id.to_vec())));

    let hash = representation_independent_hash(&map);
    let mut msg = Vec::with_capacity(IC_RESPONSE_DOMAIN_SEPARATOR.len() + hash.len());
    msg.extend_from_slice(IC_RESPONSE_DOMAIN_SEPARATOR);
    msg.extend_from_slice(&hash);
    msg
}

/// Checks that every node signature is fresh relative to the
/// drift-corrected clock. Runs before any key fetch so a skewed clock
/// fails early, without a read-state round-trip.
pub(crate) fn check_signature_freshness(
    response: &QueryResponse,
    now_ms: u64,
    max_skew_ms: u64,
) -> Result<(), AgentError> {
    for entry in response.signatures() {
        let timestamp_ms = entry.timestamp / 1_000_000;
        if timestamp_ms.saturating_add(max_skew_ms) < now_ms {
            return Err(AgentError::CertificateOutdated {
                certificate_time_ms: timestamp_ms,
                now_ms,
                max_skew_ms,
            });
        }
        if timestamp_ms > now_ms.saturating_add(max_skew_ms) {
            return Err(AgentError::CertificateFromFuture {
                certificate_time_ms: timestamp_ms,
                now_ms,
                max_skew_ms,
            });
        }
    }
    Ok(())
}

/// Verifies every node signature on the response against the subnet's
/// certified node keys. All signatures must verify and every claimed node
/// must be a current member; the threshold is unanimity.
pub(crate) fn verify_query_signatures(
    response: &QueryResponse,
    request_id: &RequestId,
    subnet: &SubnetKeys,
) -> Result<(), AgentError> {
    let signatures = response.signatures();
    if signatures.is_empty() {
        return Err(AgentError::QueryNotTrusted(
            "the response carries no node signatures".to_string(),
        ));
    }
    for entry in signatures {
        let Some(der_key) = subnet.node_keys.get(&entry.identity) else {
            return Err(AgentError::QueryNotTrusted(format!(
                "node {} is not a member of subnet {}",
                entry.identity, subnet.subnet_id
            )));
        };
        let msg = response_signable(response, entry.timestamp, request_id);
        if !verify_node_signature(&entry.signature, &msg, der_key) {
            return Err(AgentError::QueryNotTrusted(format!(
                "invalid signature from node {}",
                entry.identity
            )));
        }
    }
    Ok(())
}
