//! Certificate decoding and verification.
//!
//! A certificate ties together the other primitives: the hash tree is
//! recomputed to a root hash, the BLS signature over that root is checked
//! against the *effective signing key* (the network root key, or a subnet
//! key extracted from a root-signed delegation), the target principal is
//! checked against the subnet's authorised canister ranges, and the
//! certificate's embedded wall-clock time is checked for freshness.

use crate::bls::{self, bls_verify};
use crate::error::AgentError;
use crate::hash_tree::{display_label, HashTree, LookupResult};
use crate::{cbor, leb128, IC_STATE_ROOT_DOMAIN_SEPARATOR};
use candid::Principal;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

/// A decoded certificate. Verification consumes the raw bytes; a value of
/// this type that came out of [`verify_certificate`] has passed all
/// checks and its tree may be queried via [`Certificate::lookup_value`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub tree: HashTree,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegation: Option<Delegation>,
}

/// A root-signed delegation advertising a subnet's public key and
/// authorised canister ranges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delegation {
    pub subnet_id: ByteBuf,
    pub certificate: ByteBuf,
}

/// The principal a certificate must be authoritative for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedAuthority {
    Canister(Principal),
    Subnet(Principal),
}

/// Inputs to [`verify_certificate`].
#[derive(Debug, Clone)]
pub struct CertificateParams<'a> {
    /// Raw 96-byte BLS public key of the network root.
    pub root_key: &'a [u8],
    pub expected: ExpectedAuthority,
    /// Drift-corrected local wall clock, milliseconds.
    pub now_ms: u64,
    /// Freshness window around `now_ms`.
    pub max_skew_ms: u64,
    /// Disables the freshness check (used while synchronising time).
    pub check_time: bool,
}

impl Certificate {
    pub fn from_cbor(bytes: &[u8]) -> Result<Self, AgentError> {
        cbor::from_self_describing_slice(bytes)
    }

    pub fn to_cbor(&self) -> Result<Vec<u8>, AgentError> {
        cbor::to_self_describing_vec(self)
    }

    /// Resolves a path in the certificate tree to a leaf value.
    pub fn lookup_value<P: AsRef<[u8]>>(&self, path: &[P]) -> Result<&[u8], AgentError> {
        lookup_value_in(&self.tree, path)
    }
}

pub(crate) fn lookup_value_in<'t, P: AsRef<[u8]>>(
    tree: &'t HashTree,
    path: &[P],
) -> Result<&'t [u8], AgentError> {
    match tree.lookup_path(path) {
        LookupResult::Found(value) => Ok(value),
        LookupResult::Absent => Err(AgentError::LookupPathAbsent { path: display_path(path) }),
        LookupResult::Unknown => Err(AgentError::LookupPathUnknown { path: display_path(path) }),
        LookupResult::Error => Err(AgentError::LookupPathError { path: display_path(path) }),
    }
}

fn display_path<P: AsRef<[u8]>>(path: &[P]) -> String {
    let mut out = String::new();
    for segment in path {
        out.push('/');
        out.push_str(&display_label(segment.as_ref()));
    }
    out
}

/// Decodes and verifies a certificate against the configured root of
/// trust, the expected principal, and the (drift-corrected) clock.
pub fn verify_certificate(
    bytes: &[u8],
    params: &CertificateParams<'_>,
) -> Result<Certificate, AgentError> {
    let certificate = Certificate::from_cbor(bytes)?;

    let signing_key = match &certificate.delegation {
        None => {
            // Without a delegation the certificate is signed by the root
            // subnet itself. A subnet read must then target that subnet.
            if let ExpectedAuthority::Subnet(subnet) = params.expected {
                let root_subnet = root_subnet_id(params.root_key)?;
                if subnet != root_subnet {
                    return Err(AgentError::WrongRootDelegation { subnet });
                }
            }
            params.root_key.to_vec()
        }
        Some(delegation) => verify_delegation(delegation, params)?,
    };

    check_signature(&certificate, &signing_key)?;

    if params.check_time {
        check_freshness(&certificate, params)?;
    }

    Ok(certificate)
}

/// The root subnet's principal: self-authenticating over the DER form of
/// the root public key.
pub fn root_subnet_id(root_key: &[u8]) -> Result<Principal, AgentError> {
    let der = bls::wrap_root_pk_to_der(root_key)?;
    Ok(Principal::self_authenticating(der))
}

fn check_signature(certificate: &Certificate, public_key: &[u8]) -> Result<(), AgentError> {
    let root_hash = certificate.tree.digest();
    let mut msg = Vec::with_capacity(IC_STATE_ROOT_DOMAIN_SEPARATOR.len() + root_hash.len());
    msg.extend_from_slice(IC_STATE_ROOT_DOMAIN_SEPARATOR);
    msg.extend_from_slice(&root_hash);
    if !bls_verify(&certificate.signature, &msg, public_key) {
        return Err(AgentError::CertificateVerificationFailed);
    }
    Ok(())
}

/// Verifies a delegation and returns the delegated subnet's raw public
/// key, the effective signing key for the outer certificate.
///
/// Delegation certificates may not themselves delegate (depth-1 bound),
/// and are not freshness-checked: a subnet's registry record legitimately
/// outlives the drift window.
fn verify_delegation(
    delegation: &Delegation,
    params: &CertificateParams<'_>,
) -> Result<Vec<u8>, AgentError> {
    let inner = Certificate::from_cbor(&delegation.certificate)?;
    if inner.delegation.is_some() {
        return Err(AgentError::CertificateHasTooManyDelegations);
    }

    check_signature(&inner, params.root_key)?;

    let subnet_id = Principal::try_from_slice(&delegation.subnet_id)
        .map_err(|e| AgentError::MalformedResponse(format!("invalid subnet id: {e}")))?;

    match params.expected {
        ExpectedAuthority::Subnet(expected) => {
            if expected != subnet_id {
                return Err(AgentError::WrongRootDelegation { subnet: subnet_id });
            }
        }
        ExpectedAuthority::Canister(canister) => {
            let ranges = canister_ranges(&inner.tree, &subnet_id)?;
            let contained = ranges.iter().any(|(start, end)| {
                start.as_slice() <= canister.as_slice() && canister.as_slice() <= end.as_slice()
            });
            if !contained {
                return Err(AgentError::CertificateNotAuthorized { canister, subnet: subnet_id });
            }
        }
    }

    let der_key = lookup_value_in(
        &inner.tree,
        &[b"subnet".as_slice(), subnet_id.as_slice(), b"public_key".as_slice()],
    )?;
    bls::extract_raw_root_pk_from_der(der_key)
}

/// Reads the authorised canister ranges for `subnet_id` from a delegation
/// tree. The modern top-level path wins; the legacy per-subnet path is
/// consulted only when the modern one yields nothing.
pub(crate) fn canister_ranges(
    tree: &HashTree,
    subnet_id: &Principal,
) -> Result<Vec<(Principal, Principal)>, AgentError> {
    let modern = [b"canister_ranges".as_slice(), subnet_id.as_slice()];
    let legacy = [
        b"subnet".as_slice(),
        subnet_id.as_slice(),
        b"canister_ranges".as_slice(),
    ];
    let blob = match tree.lookup_path(&modern) {
        LookupResult::Found(blob) => blob,
        _ => lookup_value_in(tree, &legacy)?,
    };
    Ok(serde_cbor::from_slice(blob)?)
}

/// Extracts `/time` as nanoseconds since the epoch.
pub fn lookup_time(certificate: &Certificate) -> Result<u64, AgentError> {
    let blob = certificate.lookup_value(&[b"time"])?;
    leb128::decode(blob)
}

fn check_freshness(
    certificate: &Certificate,
    params: &CertificateParams<'_>,
) -> Result<(), AgentError> {
    let certificate_time_ms = lookup_time(certificate)? / 1_000_000;
    if certificate_time_ms.saturating_add(params.max_skew_ms) < params.now_ms {
        return Err(AgentError::CertificateOutdated {
            certificate_time_ms,
            now_ms: params.now_ms,
            max_skew_ms: params.max_skew_ms,
        });
    }
    if certificate_time_ms > params.now_ms.saturating_add(params.max_skew_ms) {
        return Err(AgentError::CertificateFromFuture {
            certificate_time_ms,
            now_ms: params.now_ms,
            max_skew_ms: params.max_skew_ms,
        });
    }
    Ok(())
}
