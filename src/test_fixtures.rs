//! Shared test helpers: deterministic keys, certificate builders and a
//! scripted transport standing in for a replica.

use crate::bls::{wrap_ed25519_pk_to_der, wrap_root_pk_to_der, BLS_DST};
use crate::certificate::{Certificate, Delegation};
use crate::error::AgentError;
use crate::hash_tree::{fork, labeled, leaf, HashTree};
use crate::query::{response_signable, NodeSignature, QueryReply, QueryResponse, SubnetKeys};
use crate::request_id::RequestId;
use crate::transport::{Transport, TransportCallResponse};
use crate::{cbor, leb128, IC_STATE_ROOT_DOMAIN_SEPARATOR};
use async_trait::async_trait;
use blst::min_sig::SecretKey;
use candid::Principal;
use ed25519_dalek::{Signer, SigningKey};
use serde::Serialize;
use serde_bytes::ByteBuf;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// 2025-05-01T12:34:56.789Z
pub(crate) const TEST_NOW_MS: u64 = 1_746_102_896_789;

pub(crate) fn bls_keypair(seed: u8) -> (SecretKey, Vec<u8>) {
    let sk = SecretKey::key_gen(&[seed; 32], &[]).expect("bls keygen failed");
    let pk = sk.sk_to_pk().to_bytes().to_vec();
    (sk, pk)
}

/// Signs a state tree the way a subnet does: BLS over
/// `"\x0dic-state-root" ‖ root_hash`.
pub(crate) fn sign_state_root(sk: &SecretKey, tree: &HashTree) -> Vec<u8> {
    let mut msg = IC_STATE_ROOT_DOMAIN_SEPARATOR.to_vec();
    msg.extend_from_slice(&tree.digest());
    sk.sign(&msg, BLS_DST, &[]).to_bytes().to_vec()
}

/// Builds a fork chain over `(label, subtree)` pairs. Pairs must be in
/// ascending label order, matching how replicas lay out state trees.
pub(crate) fn labeled_forks(mut pairs: Vec<(Vec<u8>, HashTree)>) -> HashTree {
    let Some((last_label, last_subtree)) = pairs.pop() else {
        return crate::hash_tree::empty();
    };
    let mut tree = labeled(last_label, last_subtree);
    while let Some((label, subtree)) = pairs.pop() {
        tree = fork(labeled(label, subtree), tree);
    }
    tree
}

pub(crate) fn time_leaf(time_ms: u64) -> HashTree {
    leaf(leb128::encode(time_ms * 1_000_000))
}

/// A subnet with a BLS key, ed25519 node keys and authorised ranges.
pub(crate) struct SubnetFixture {
    pub subnet_id: Principal,
    pub secret_key: SecretKey,
    pub public_key_der: Vec<u8>,
    pub node_ids: Vec<Principal>,
    pub node_keys: Vec<SigningKey>,
    pub ranges: Vec<(Principal, Principal)>,
}

impl SubnetFixture {
    pub fn new(seed: u8, ranges: Vec<(Principal, Principal)>, node_count: usize) -> Self {
        let (secret_key, public_key) = bls_keypair(seed);
        let public_key_der = wrap_root_pk_to_der(&public_key).unwrap();
        let subnet_id = Principal::self_authenticating(&public_key_der);
        let mut node_ids = Vec::with_capacity(node_count);
        let mut node_keys = Vec::with_capacity(node_count);
        for i in 0..node_count {
            let key = SigningKey::from_bytes(&[seed.wrapping_add(i as u8).wrapping_add(1); 32]);
            let der = wrap_ed25519_pk_to_der(key.verifying_key().as_bytes()).unwrap();
            node_ids.push(Principal::self_authenticating(der));
            node_keys.push(key);
        }
        SubnetFixture { subnet_id, secret_key, public_key_der, node_ids, node_keys, ranges }
    }

    pub fn subnet_keys(&self) -> SubnetKeys {
        let mut node_keys = BTreeMap::new();
        for (id, key) in self.node_ids.iter().zip(&self.node_keys) {
            node_keys.insert(
                *id,
                wrap_ed25519_pk_to_der(key.verifying_key().as_bytes()).unwrap(),
            );
        }
        SubnetKeys { subnet_id: self.subnet_id, node_keys }
    }
}

pub(crate) fn ranges_blob(ranges: &[(Principal, Principal)]) -> Vec<u8> {
    serde_cbor::to_vec(&ranges.to_vec()).expect("failed to encode ranges")
}

/// The state tree of a delegation certificate: subnet public key, node
/// keys, and canister ranges on the modern and/or legacy path.
pub(crate) fn delegation_tree(fixture: &SubnetFixture, modern: bool, legacy: bool) -> HashTree {
    let sid = fixture.subnet_id.as_slice().to_vec();

    let mut subnet_children: Vec<(Vec<u8>, HashTree)> = Vec::new();
    if legacy {
        subnet_children.push((b"canister_ranges".to_vec(), leaf(ranges_blob(&fixture.ranges))));
    }
    let mut node_pairs: Vec<(Vec<u8>, HashTree)> = fixture
        .node_ids
        .iter()
        .zip(&fixture.node_keys)
        .map(|(id, key)| {
            let der = wrap_ed25519_pk_to_der(key.verifying_key().as_bytes()).unwrap();
            (
                id.as_slice().to_vec(),
                labeled_forks(vec![(b"public_key".to_vec(), leaf(der))]),
            )
        })
        .collect();
    node_pairs.sort_by(|a, b| a.0.cmp(&b.0));
    subnet_children.push((b"node".to_vec(), labeled_forks(node_pairs)));
    subnet_children.push((b"public_key".to_vec(), leaf(fixture.public_key_der.clone())));

    let mut top: Vec<(Vec<u8>, HashTree)> = Vec::new();
    if modern {
        top.push((
            b"canister_ranges".to_vec(),
            labeled_forks(vec![(sid.clone(), leaf(ranges_blob(&fixture.ranges)))]),
        ));
    }
    top.push((
        b"subnet".to_vec(),
        labeled_forks(vec![(sid, labeled_forks(subnet_children))]),
    ));
    labeled_forks(top)
}

/// A delegation for `fixture`, signed by `root_sk`.
pub(crate) fn build_delegation(root_sk: &SecretKey, fixture: &SubnetFixture) -> Delegation {
    build_delegation_with_paths(root_sk, fixture, true, true)
}

pub(crate) fn build_delegation_with_paths(
    root_sk: &SecretKey,
    fixture: &SubnetFixture,
    modern: bool,
    legacy: bool,
) -> Delegation {
    let tree = delegation_tree(fixture, modern, legacy);
    let certificate = Certificate {
        signature: sign_state_root(root_sk, &tree),
        tree,
        delegation: None,
    };
    Delegation {
        subnet_id: ByteBuf::from(fixture.subnet_id.as_slice().to_vec()),
        certificate: ByteBuf::from(certificate.to_cbor().unwrap()),
    }
}

/// Signs `tree` with `signer` and encodes the certificate.
pub(crate) fn certified_bytes(
    signer: &SecretKey,
    tree: HashTree,
    delegation: Option<Delegation>,
) -> Vec<u8> {
    let certificate = Certificate {
        signature: sign_state_root(signer, &tree),
        tree,
        delegation,
    };
    certificate.to_cbor().unwrap()
}

/// State tree carrying `/time` and the request-status entries for one
/// request id.
pub(crate) fn status_tree(
    time_ms: u64,
    request_id: &RequestId,
    entries: Vec<(Vec<u8>, HashTree)>,
) -> HashTree {
    labeled_forks(vec![
        (
            b"request_status".to_vec(),
            labeled_forks(vec![(request_id.to_vec(), labeled_forks(entries))]),
        ),
        (b"time".to_vec(), time_leaf(time_ms)),
    ])
}

pub(crate) fn replied_entries(reply: &[u8]) -> Vec<(Vec<u8>, HashTree)> {
    vec![
        (b"reply".to_vec(), leaf(reply.to_vec())),
        (b"status".to_vec(), leaf(b"replied".to_vec())),
    ]
}

pub(crate) fn time_tree(time_ms: u64) -> HashTree {
    labeled_forks(vec![(b"time".to_vec(), time_leaf(time_ms))])
}

#[derive(Serialize)]
struct ReadStateBody {
    certificate: ByteBuf,
}

/// Encodes a `read_state` response body around certificate bytes.
pub(crate) fn read_state_body(certificate: Vec<u8>) -> Vec<u8> {
    cbor::to_self_describing_vec(&ReadStateBody { certificate: ByteBuf::from(certificate) })
        .unwrap()
}

/// A query reply signed by every node of `fixture`.
pub(crate) fn signed_query_reply(
    fixture: &SubnetFixture,
    arg: &[u8],
    timestamp_ns: u64,
    request_id: &RequestId,
) -> QueryResponse {
    let unsigned = QueryResponse::Replied {
        reply: QueryReply { arg: arg.to_vec() },
        signatures: vec![],
    };
    let signatures = fixture
        .node_ids
        .iter()
        .zip(&fixture.node_keys)
        .map(|(id, key)| {
            let msg = response_signable(&unsigned, timestamp_ns, request_id);
            NodeSignature {
                timestamp: timestamp_ns,
                signature: ByteBuf::from(key.sign(&msg).to_bytes().to_vec()),
                identity: *id,
            }
        })
        .collect();
    QueryResponse::Replied { reply: QueryReply { arg: arg.to_vec() }, signatures }
}

pub(crate) fn query_body(response: &QueryResponse) -> Vec<u8> {
    cbor::to_self_describing_vec(response).unwrap()
}

type Responder<T> = Box<dyn Fn(usize, &Principal, &[u8]) -> Result<T, AgentError> + Send + Sync>;

fn unexpected<T>(endpoint: &'static str) -> Responder<T> {
    Box::new(move |n, principal, _| {
        Err(AgentError::MalformedResponse(format!(
            "unexpected {endpoint} #{n} for {principal}"
        )))
    })
}

/// A scripted replica. Responders receive the zero-based invocation index,
/// the target principal and the raw envelope.
pub(crate) struct MockTransport {
    pub call_count: AtomicUsize,
    pub query_count: AtomicUsize,
    pub read_state_count: AtomicUsize,
    pub subnet_read_state_count: AtomicUsize,
    pub call_envelopes: Mutex<Vec<Vec<u8>>>,
    pub query_envelopes: Mutex<Vec<Vec<u8>>>,
    call_responder: Responder<TransportCallResponse>,
    query_responder: Responder<Vec<u8>>,
    read_state_responder: Responder<Vec<u8>>,
    subnet_read_state_responder: Responder<Vec<u8>>,
}

impl MockTransport {
    pub fn new() -> Self {
        MockTransport {
            call_count: AtomicUsize::new(0),
            query_count: AtomicUsize::new(0),
            read_state_count: AtomicUsize::new(0),
            subnet_read_state_count: AtomicUsize::new(0),
            call_envelopes: Mutex::new(vec![]),
            query_envelopes: Mutex::new(vec![]),
            call_responder: unexpected("call"),
            query_responder: unexpected("query"),
            read_state_responder: unexpected("read_state"),
            subnet_read_state_responder: unexpected("read_subnet_state"),
        }
    }

    pub fn on_call(
        mut self,
        f: impl Fn(usize, &Principal, &[u8]) -> Result<TransportCallResponse, AgentError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.call_responder = Box::new(f);
        self
    }

    pub fn on_query(
        mut self,
        f: impl Fn(usize, &Principal, &[u8]) -> Result<Vec<u8>, AgentError> + Send + Sync + 'static,
    ) -> Self {
        self.query_responder = Box::new(f);
        self
    }

    pub fn on_read_state(
        mut self,
        f: impl Fn(usize, &Principal, &[u8]) -> Result<Vec<u8>, AgentError> + Send + Sync + 'static,
    ) -> Self {
        self.read_state_responder = Box::new(f);
        self
    }

    pub fn on_subnet_read_state(
        mut self,
        f: impl Fn(usize, &Principal, &[u8]) -> Result<Vec<u8>, AgentError> + Send + Sync + 'static,
    ) -> Self {
        self.subnet_read_state_responder = Box::new(f);
        self
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn call(
        &self,
        canister_id: &Principal,
        envelope: Vec<u8>,
    ) -> Result<TransportCallResponse, AgentError> {
        let n = self.call_count.fetch_add(1, Ordering::SeqCst);
        self.call_envelopes.lock().unwrap().push(envelope.clone());
        (self.call_responder)(n, canister_id, &envelope)
    }

    async fn query(
        &self,
        canister_id: &Principal,
        envelope: Vec<u8>,
    ) -> Result<Vec<u8>, AgentError> {
        let n = self.query_count.fetch_add(1, Ordering::SeqCst);
        self.query_envelopes.lock().unwrap().push(envelope.clone());
        (self.query_responder)(n, canister_id, &envelope)
    }

    async fn read_state(
        &self,
        canister_id: &Principal,
        envelope: Vec<u8>,
    ) -> Result<Vec<u8>, AgentError> {
        let n = self.read_state_count.fetch_add(1, Ordering::SeqCst);
        (self.read_state_responder)(n, canister_id, &envelope)
    }

    async fn read_subnet_state(
        &self,
        subnet_id: &Principal,
        envelope: Vec<u8>,
    ) -> Result<Vec<u8>, AgentError> {
        let n = self.subnet_read_state_count.fetch_add(1, Ordering::SeqCst);
        (self.subnet_read_state_responder)(n, subnet_id, &envelope)
    }
}
