//! Signature verification primitives: BLS12-381 for subnet certificates,
//! ed25519 for per-node query signatures, plus the DER envelopes both key
//! kinds travel in.

use crate::error::AgentError;
use crate::{IC_ROOT_PK_DER_PREFIX, IC_ROOT_PK_LENGTH};
use blst::min_sig::{PublicKey, Signature};
use blst::BLST_ERROR;
use ed25519_dalek::{Signature as EdSignature, Verifier, VerifyingKey};

/// Ciphersuite for IC state-root signatures: G1 signatures, G2 public keys.
pub(crate) const BLS_DST: &[u8] = b"BLS_SIG_BLS12381G1_XMD:SHA-256_SSWU_RO_NUL_";

/// Compressed G1 signature length.
pub const BLS_SIGNATURE_LENGTH: usize = 48;

/// DER prefix of an ed25519 public key (RFC 8410).
pub const ED25519_PK_DER_PREFIX: &[u8; 12] = b"\x30\x2a\x30\x05\x06\x03\x2b\x65\x70\x03\x21\x00";
pub const ED25519_PK_LENGTH: usize = 32;

/// Verifies a BLS12-381 signature over `msg` with a raw 96-byte G2 public
/// key. Deterministic: the same triple always yields the same answer;
/// malformed inputs simply fail verification.
pub fn bls_verify(signature: &[u8], msg: &[u8], public_key: &[u8]) -> bool {
    let Ok(signature) = Signature::from_bytes(signature) else {
        return false;
    };
    let Ok(public_key) = PublicKey::from_bytes(public_key) else {
        return false;
    };
    signature.verify(true, msg, BLS_DST, &[], &public_key, true) == BLST_ERROR::BLST_SUCCESS
}

/// Verifies an ed25519 node signature with a DER-encoded (44-byte) key.
pub fn verify_node_signature(signature: &[u8], msg: &[u8], der_public_key: &[u8]) -> bool {
    let Ok(raw) = extract_ed25519_pk_from_der(der_public_key) else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_bytes(&raw) else {
        return false;
    };
    let Ok(signature) = <&[u8; 64]>::try_from(signature) else {
        return false;
    };
    key.verify(msg, &EdSignature::from_bytes(signature)).is_ok()
}

/// Verifies the structure of a BLS public key in DER format and returns
/// the raw 96 key bytes.
pub fn extract_raw_root_pk_from_der(pk_der: &[u8]) -> Result<Vec<u8>, AgentError> {
    let expected_length = IC_ROOT_PK_DER_PREFIX.len() + IC_ROOT_PK_LENGTH;
    if pk_der.len() != expected_length {
        return Err(AgentError::DerKeyLengthMismatch {
            expected: expected_length,
            actual: pk_der.len(),
        });
    }

    let prefix = &pk_der[0..IC_ROOT_PK_DER_PREFIX.len()];
    if prefix[..] != IC_ROOT_PK_DER_PREFIX[..] {
        return Err(AgentError::DerPrefixMismatch);
    }

    Ok(pk_der[IC_ROOT_PK_DER_PREFIX.len()..].to_vec())
}

/// Inverse of [`extract_raw_root_pk_from_der`].
pub fn wrap_root_pk_to_der(pk_raw: &[u8]) -> Result<Vec<u8>, AgentError> {
    if pk_raw.len() != IC_ROOT_PK_LENGTH {
        return Err(AgentError::DerKeyLengthMismatch {
            expected: IC_ROOT_PK_LENGTH,
            actual: pk_raw.len(),
        });
    }
    let mut der = Vec::with_capacity(IC_ROOT_PK_DER_PREFIX.len() + IC_ROOT_PK_LENGTH);
    der.extend_from_slice(IC_ROOT_PK_DER_PREFIX);
    der.extend_from_slice(pk_raw);
    Ok(der)
}

/// Verifies the structure of an ed25519 public key in DER format and
/// returns the raw 32 key bytes.
pub fn extract_ed25519_pk_from_der(pk_der: &[u8]) -> Result<[u8; ED25519_PK_LENGTH], AgentError> {
    let expected_length = ED25519_PK_DER_PREFIX.len() + ED25519_PK_LENGTH;
    if pk_der.len() != expected_length {
        return Err(AgentError::DerKeyLengthMismatch {
            expected: expected_length,
            actual: pk_der.len(),
        });
    }
    if pk_der[0..ED25519_PK_DER_PREFIX.len()] != ED25519_PK_DER_PREFIX[..] {
        return Err(AgentError::DerPrefixMismatch);
    }
    let mut raw = [0u8; ED25519_PK_LENGTH];
    raw.copy_from_slice(&pk_der[ED25519_PK_DER_PREFIX.len()..]);
    Ok(raw)
}

/// DER-encodes a raw ed25519 public key.
pub fn wrap_ed25519_pk_to_der(pk_raw: &[u8]) -> Result<Vec<u8>, AgentError> {
    if pk_raw.len() != ED25519_PK_LENGTH {
        return Err(AgentError::DerKeyLengthMismatch {
            expected: ED25519_PK_LENGTH,
            actual: pk_raw.len(),
        });
    }
    let mut der = Vec::with_capacity(ED25519_PK_DER_PREFIX.len() + ED25519_PK_LENGTH);
    der.extend_from_slice(ED25519_PK_DER_PREFIX);
    der.extend_from_slice(pk_raw);
    Ok(der)
}
