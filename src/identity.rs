//! The signing seam between the request engine and key material.
//!
//! Key generation, PEM parsing and hardware-backed keys live outside this
//! crate; the engine only needs a sender principal and a signature over
//! the request id.

use crate::bls::wrap_ed25519_pk_to_der;
use crate::error::AgentError;
use crate::request_id::{representation_independent_hash, RequestId, Value};
use crate::DELEGATION_SIG_DOMAIN;
use async_trait::async_trait;
use candid::Principal;
use ed25519_dalek::{Signer, SigningKey};
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

/// Authentication material produced for one request.
#[derive(Debug, Clone, Default)]
pub struct RequestSignature {
    /// DER-encoded public key of the signer.
    pub public_key: Option<Vec<u8>>,
    /// 64-byte raw signature over `"\x0aic-request" ‖ request_id`.
    pub signature: Option<Vec<u8>>,
    /// Chain of auth delegations from the sender key to the signing key.
    pub delegations: Option<Vec<SignedDelegation>>,
}

/// A signer of requests. Signing is a suspension point: implementations
/// may consult an external signer or enclave.
#[async_trait]
pub trait Identity: Send + Sync {
    /// The principal requests are sent as.
    fn sender(&self) -> Principal;

    /// DER-encoded public key, when the identity has one.
    fn public_key(&self) -> Option<Vec<u8>>;

    async fn sign(&self, request_id: &RequestId) -> Result<RequestSignature, AgentError>;
}

/// The anonymous identity: no key, no signature, sender `0x04`.
#[derive(Debug, Default, Clone, Copy)]
pub struct AnonymousIdentity;

#[async_trait]
impl Identity for AnonymousIdentity {
    fn sender(&self) -> Principal {
        Principal::anonymous()
    }

    fn public_key(&self) -> Option<Vec<u8>> {
        None
    }

    async fn sign(&self, _request_id: &RequestId) -> Result<RequestSignature, AgentError> {
        Ok(RequestSignature::default())
    }
}

/// An ed25519 identity; the sender is the self-authenticating principal of
/// the DER public key.
pub struct BasicIdentity {
    signing_key: SigningKey,
    der_public_key: Vec<u8>,
}

impl BasicIdentity {
    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        let der_public_key = wrap_ed25519_pk_to_der(signing_key.verifying_key().as_bytes())
            .expect("an ed25519 verifying key is always 32 bytes");
        BasicIdentity { signing_key, der_public_key }
    }
}

#[async_trait]
impl Identity for BasicIdentity {
    fn sender(&self) -> Principal {
        Principal::self_authenticating(&self.der_public_key)
    }

    fn public_key(&self) -> Option<Vec<u8>> {
        Some(self.der_public_key.clone())
    }

    async fn sign(&self, request_id: &RequestId) -> Result<RequestSignature, AgentError> {
        let signature = self.signing_key.sign(&request_id.signable());
        Ok(RequestSignature {
            public_key: Some(self.der_public_key.clone()),
            signature: Some(signature.to_bytes().to_vec()),
            delegations: None,
        })
    }
}

/// One hop of a request auth delegation, cf.
/// https://internetcomputer.org/docs/current/references/ic-interface-spec#authentication
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthDelegation {
    pub pubkey: ByteBuf,
    pub expiration: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub targets: Option<Vec<Principal>>,
}

impl AuthDelegation {
    /// Computes the signing input for this delegation: the length-prefixed
    /// delegation domain followed by the representation-independent hash
    /// of the delegation map.
    pub fn signable(&self) -> Vec<u8> {
        let mut m: Vec<(String, Value)> = vec![
            ("pubkey".to_string(), Value::Bytes(self.pubkey.to_vec())),
            ("expiration".to_string(), Value::Number(self.expiration)),
        ];
        if let Some(targets) = self.targets.as_ref() {
            let mut arr = Vec::with_capacity(targets.len());
            for t in targets.iter() {
                arr.push(Value::Bytes(t.as_slice().to_vec()));
            }
            m.push(("targets".to_string(), Value::Array(arr)));
        }
        let hash = representation_independent_hash(m.as_slice());

        let mut msg = Vec::with_capacity(1 + DELEGATION_SIG_DOMAIN.len() + hash.len());
        msg.push(DELEGATION_SIG_DOMAIN.len() as u8);
        msg.extend_from_slice(DELEGATION_SIG_DOMAIN);
        msg.extend_from_slice(&hash);
        msg
    }
}

/// A delegation together with the signature of the delegating key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedDelegation {
    pub delegation: AuthDelegation,
    pub signature: ByteBuf,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bls::verify_node_signature;

    #[tokio::test]
    async fn anonymous_identity_is_principal_0x04() {
        let identity = AnonymousIdentity;
        assert_eq!(identity.sender().as_slice(), &[0x04]);
        let signature = identity.sign(&RequestId::new([0; 32])).await.unwrap();
        assert!(signature.public_key.is_none());
        assert!(signature.signature.is_none());
    }

    #[tokio::test]
    async fn basic_identity_signs_the_domain_separated_request_id() {
        let identity = BasicIdentity::from_signing_key(SigningKey::from_bytes(&[7u8; 32]));
        let request_id = RequestId::new([0xab; 32]);
        let signature = identity.sign(&request_id).await.unwrap();
        let der = signature.public_key.expect("missing public key");
        let sig = signature.signature.expect("missing signature");
        assert_eq!(sig.len(), 64);
        assert!(verify_node_signature(&sig, &request_id.signable(), &der));
    }

    #[test]
    fn basic_identity_sender_is_self_authenticating() {
        let identity = BasicIdentity::from_signing_key(SigningKey::from_bytes(&[7u8; 32]));
        let der = identity.public_key().unwrap();
        assert_eq!(identity.sender(), Principal::self_authenticating(der));
        // Self-authenticating principals are 29 bytes ending in 0x02.
        assert_eq!(identity.sender().as_slice().len(), 29);
        assert_eq!(*identity.sender().as_slice().last().unwrap(), 0x02);
    }

    #[test]
    fn delegation_signable_is_domain_separated() {
        let delegation = AuthDelegation {
            pubkey: ByteBuf::from(vec![1, 2, 3]),
            expiration: 1_746_103_200_000_000_000,
            targets: None,
        };
        let signable = delegation.signable();
        assert_eq!(signable[0] as usize, DELEGATION_SIG_DOMAIN.len());
        assert_eq!(&signable[1..=DELEGATION_SIG_DOMAIN.len()], DELEGATION_SIG_DOMAIN);
        assert_eq!(signable.len(), 1 + DELEGATION_SIG_DOMAIN.len() + 32);

        // Adding targets changes the signable.
        let with_targets = AuthDelegation {
            targets: Some(vec![Principal::anonymous()]),
            ..delegation.clone()
        };
        assert_ne!(signable, with_targets.signable());
    }
}
