//! Client-side trust engine for the Internet Computer.
//!
//! Replicas answer requests with BLS-signed certificates over a Merkle
//! state tree. This crate independently verifies those certificates —
//! signature, delegation chain, canister-range containment and wall-clock
//! freshness — and drives the update / query / read-state request
//! lifecycle on top of the verifier, including time synchronisation and
//! retry on certificate-time mismatch.
//!
//! The entry point is [`Agent`]; [`Actor`] is a thin per-canister wrapper
//! around it. Certificate verification is exposed directly through
//! [`certificate::verify_certificate`] for callers that obtain
//! certificates out of band.

use sha2::{Digest, Sha256};

pub mod actor;
pub mod agent;
pub mod bls;
pub mod cbor;
pub mod certificate;
pub mod error;
pub mod expiry;
pub mod hash_tree;
pub mod identity;
mod leb128;
pub mod poll;
pub mod query;
pub mod request;
pub mod request_id;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_fixtures;

pub use actor::Actor;
pub use agent::{
    Agent, AgentBuilder, CallOptions, CallResult, CancelToken, QueryOptions, QueryResult,
};
pub use certificate::{Certificate, Delegation};
pub use error::{AgentError, ErrorKind};
pub use expiry::{Clock, Expiry, SystemClock};
pub use hash_tree::{HashTree, LookupResult};
pub use identity::{AnonymousIdentity, BasicIdentity, Identity};
pub use request_id::RequestId;

/// A SHA-256 digest, the hash type used throughout the state tree.
pub type Hash = [u8; 32];

pub const IC_ROOT_PK_DER_PREFIX: &[u8; 37] = b"\x30\x81\x82\x30\x1d\x06\x0d\x2b\x06\x01\x04\x01\x82\xdc\x7c\x05\x03\x01\x02\x01\x06\x0c\x2b\x06\x01\x04\x01\x82\xdc\x7c\x05\x03\x02\x01\x03\x61\x00";
pub const IC_ROOT_PK_DER: &[u8; 133] = b"\x30\x81\x82\x30\x1d\x06\x0d\x2b\x06\x01\x04\x01\x82\xdc\x7c\x05\x03\x01\x02\x01\x06\x0c\x2b\x06\x01\x04\x01\x82\xdc\x7c\x05\x03\x02\x01\x03\x61\x00\x81\x4c\x0e\x6e\xc7\x1f\xab\x58\x3b\x08\xbd\x81\x37\x3c\x25\x5c\x3c\x37\x1b\x2e\x84\x86\x3c\x98\xa4\xf1\xe0\x8b\x74\x23\x5d\x14\xfb\x5d\x9c\x0c\xd5\x46\xd9\x68\x5f\x91\x3a\x0c\x0b\x2c\xc5\x34\x15\x83\xbf\x4b\x43\x92\xe4\x67\xdb\x96\xd6\x5b\x9b\xb4\xcb\x71\x71\x12\xf8\x47\x2e\x0d\x5a\x4d\x14\x50\x5f\xfd\x74\x84\xb0\x12\x91\x09\x1c\x5f\x87\xb9\x88\x83\x46\x3f\x98\x09\x1a\x0b\xaa\xae";
pub const IC_ROOT_PK_LENGTH: usize = 96;

/// Domain separator for signed request envelopes, cf.
/// https://internetcomputer.org/docs/current/references/ic-interface-spec#authentication
pub const IC_REQUEST_DOMAIN_SEPARATOR: &[u8; 11] = b"\x0aic-request";

/// Domain separator for per-node signatures on query responses.
pub const IC_RESPONSE_DOMAIN_SEPARATOR: &[u8; 12] = b"\x0bic-response";

/// Domain separator for the BLS signature on a certificate's root hash.
pub const IC_STATE_ROOT_DOMAIN_SEPARATOR: &[u8; 14] = b"\x0dic-state-root";

/// Signature domain for IC request auth delegations as specified in the IC
/// interface specification:
/// https://internetcomputer.org/docs/current/references/ic-interface-spec/#authentication
pub const DELEGATION_SIG_DOMAIN: &[u8] = b"ic-request-auth-delegation";

lazy_static::lazy_static! {
    /// The IC root public key (raw, 96 bytes) used when no other root of
    /// trust is configured.
    pub static ref IC_ROOT_PUBLIC_KEY: Vec<u8> =
        bls::extract_raw_root_pk_from_der(IC_ROOT_PK_DER).expect("Failed decoding IC root key.");
}

pub fn hash_bytes(value: impl AsRef<[u8]>) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(value.as_ref());
    hasher.finalize().into()
}

/// Hashes `bytes` prefixed with the length-prefixed domain separator `sep`.
pub fn hash_with_domain(sep: &[u8], bytes: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    let buf = [sep.len() as u8];
    hasher.update(buf);
    hasher.update(sep);
    hasher.update(bytes);
    hasher.finalize().into()
}
