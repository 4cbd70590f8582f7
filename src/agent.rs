//! The request engine.
//!
//! An [`Agent`] owns a transport, an identity, a drift estimate against
//! the network clock and a per-subnet node-key cache. It builds, signs and
//! submits requests, polls for update results, and verifies every reply
//! through the certificate machinery before handing it to the caller.
//!
//! Within one call the effects are strictly ordered: build, sign, submit,
//! poll, verify. The drift estimate and the key cache are the only shared
//! mutable state; both are replaced whole, never torn.

use crate::certificate::{
    self, lookup_value_in, verify_certificate, Certificate, CertificateParams, ExpectedAuthority,
};
use crate::error::{AgentError, RejectCode, RejectResponse};
use crate::expiry::{Clock, Expiry, SystemClock};
use crate::hash_tree::{HashTree, LookupResult, SubtreeLookupResult};
use crate::identity::{AnonymousIdentity, Identity};
use crate::poll::{self, PollStrategyFactory};
use crate::query::{self, QueryResponse, SubnetKeys};
use crate::request::{Envelope, EnvelopeContent};
use crate::request_id::RequestId;
use crate::transport::{ReqwestTransport, Transport, TransportCallResponse};
use crate::{cbor, IC_ROOT_PUBLIC_KEY};
use candid::Principal;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

const DEFAULT_INGRESS_EXPIRY_MS: u64 = 5 * 60 * 1000;
const DEFAULT_MAX_TIME_SKEW_MS: u64 = 5 * 60 * 1000;
const DEFAULT_RETRY_TIMES: u32 = 3;
const DEFAULT_TIME_SYNC_SAMPLES: usize = 3;
/// The ICP ledger: a canister that exists on every network, used for time
/// sync when no explicit target is given.
const DEFAULT_TIME_SYNC_CANISTER: &str = "ryjl3-tyaaa-aaaaa-aaaba-cai";

/// A caller-held handle to abort in-flight operations. Cancellation is
/// observed at the next suspension point; an already-submitted request
/// stays outstanding on the replica (requests are idempotent on their id).
#[derive(Clone)]
pub struct CancelToken {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        CancelToken { sender: Arc::new(sender), receiver }
    }

    pub fn cancel(&self) {
        let _ = self.sender.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        loop {
            if *receiver.borrow_and_update() {
                return;
            }
            if receiver.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CancelToken(cancelled: {})", self.is_cancelled())
    }
}

fn check_cancel(cancel: Option<&CancelToken>) -> Result<(), AgentError> {
    if cancel.is_some_and(CancelToken::is_cancelled) {
        Err(AgentError::Cancelled)
    } else {
        Ok(())
    }
}

async fn suspend<T>(
    cancel: Option<&CancelToken>,
    fut: impl Future<Output = Result<T, AgentError>>,
) -> Result<T, AgentError> {
    match cancel {
        None => fut.await,
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => Err(AgentError::Cancelled),
            result = fut => result,
        },
    }
}

async fn suspend_point(
    cancel: Option<&CancelToken>,
    fut: impl Future<Output = ()>,
) -> Result<(), AgentError> {
    match cancel {
        None => {
            fut.await;
            Ok(())
        }
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => Err(AgentError::Cancelled),
            _ = fut => Ok(()),
        },
    }
}

/// Options for [`Agent::call`].
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Caller-supplied nonce, folded into the request id to defeat
    /// duplicate detection on purpose.
    pub nonce: Option<Vec<u8>>,
    /// Overrides the agent's ingress expiry delta for this call.
    pub ingress_expiry_ms: Option<u64>,
    pub cancel: Option<CancelToken>,
}

/// Options for [`Agent::query`].
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Verify per-node signatures on the reply (default true).
    pub verify_signatures: bool,
    pub ingress_expiry_ms: Option<u64>,
    pub cancel: Option<CancelToken>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        QueryOptions { verify_signatures: true, ingress_expiry_ms: None, cancel: None }
    }
}

/// Outcome of a successful update call.
#[derive(Debug)]
pub struct CallResult {
    pub reply: Vec<u8>,
    pub request_id: RequestId,
    pub certificate: Certificate,
}

/// Outcome of a successful query.
#[derive(Debug)]
pub struct QueryResult {
    pub reply: Vec<u8>,
    pub request_id: RequestId,
}

// Wire bodies of the v4 call endpoint and the read_state endpoints.

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub(crate) enum CallResponseBody {
    Replied {
        certificate: ByteBuf,
    },
    NonReplicatedRejection {
        reject_code: u64,
        reject_message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_code: Option<String>,
    },
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ReadStateResponse {
    pub certificate: ByteBuf,
}

enum RequestStatus {
    Replied(Vec<u8>),
    Rejected(RejectResponse),
    Done,
    Pending,
}

/// Builder for [`Agent`]; an explicit configuration record.
pub struct AgentBuilder {
    url: Option<String>,
    transport: Option<Arc<dyn Transport>>,
    identity: Arc<dyn Identity>,
    root_key: Vec<u8>,
    ingress_expiry_ms: u64,
    retry_times: u32,
    should_sync_time: bool,
    verify_query_signatures: bool,
    time_sync_samples: usize,
    max_time_skew_ms: u64,
    poll_strategy_factory: Arc<dyn PollStrategyFactory>,
    clock: Arc<dyn Clock>,
}

impl Default for AgentBuilder {
    fn default() -> Self {
        AgentBuilder {
            url: None,
            transport: None,
            identity: Arc::new(AnonymousIdentity),
            root_key: IC_ROOT_PUBLIC_KEY.clone(),
            ingress_expiry_ms: DEFAULT_INGRESS_EXPIRY_MS,
            retry_times: DEFAULT_RETRY_TIMES,
            should_sync_time: false,
            verify_query_signatures: true,
            time_sync_samples: DEFAULT_TIME_SYNC_SAMPLES,
            max_time_skew_ms: DEFAULT_MAX_TIME_SKEW_MS,
            poll_strategy_factory: poll::default_factory(),
            clock: Arc::new(SystemClock::new()),
        }
    }
}

impl AgentBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_identity(mut self, identity: Arc<dyn Identity>) -> Self {
        self.identity = identity;
        self
    }

    /// Sets the root of trust as a raw 96-byte BLS public key.
    pub fn with_root_key(mut self, root_key: Vec<u8>) -> Self {
        self.root_key = root_key;
        self
    }

    pub fn with_ingress_expiry_ms(mut self, delta_ms: u64) -> Self {
        self.ingress_expiry_ms = delta_ms;
        self
    }

    pub fn with_retry_times(mut self, retry_times: u32) -> Self {
        self.retry_times = retry_times;
        self
    }

    pub fn with_should_sync_time(mut self, should_sync_time: bool) -> Self {
        self.should_sync_time = should_sync_time;
        self
    }

    pub fn with_verify_query_signatures(mut self, verify: bool) -> Self {
        self.verify_query_signatures = verify;
        self
    }

    pub fn with_time_sync_samples(mut self, samples: usize) -> Self {
        self.time_sync_samples = samples;
        self
    }

    pub fn with_max_time_skew_ms(mut self, max_skew_ms: u64) -> Self {
        self.max_time_skew_ms = max_skew_ms;
        self
    }

    pub fn with_poll_strategy_factory(mut self, factory: Arc<dyn PollStrategyFactory>) -> Self {
        self.poll_strategy_factory = factory;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Result<Agent, AgentError> {
        let transport = match (self.transport, self.url) {
            (Some(transport), _) => transport,
            (None, Some(url)) => Arc::new(ReqwestTransport::create(url)?) as Arc<dyn Transport>,
            (None, None) => {
                return Err(AgentError::InvalidArgument(
                    "an agent needs a url or a transport".to_string(),
                ))
            }
        };
        Ok(Agent {
            transport,
            identity: tokio::sync::RwLock::new(self.identity),
            root_key: self.root_key,
            clock: self.clock,
            drift_ns: AtomicI64::new(0),
            has_synced_time: AtomicBool::new(false),
            ingress_expiry_ms: self.ingress_expiry_ms,
            retry_times: self.retry_times,
            should_sync_time: self.should_sync_time,
            verify_query_signatures: self.verify_query_signatures,
            time_sync_samples: self.time_sync_samples,
            max_time_skew_ms: self.max_time_skew_ms,
            poll_strategy_factory: self.poll_strategy_factory,
            subnet_keys: RwLock::new(HashMap::new()),
            subnet_of_canister: RwLock::new(HashMap::new()),
        })
    }
}

/// The request engine. Cheap to share behind an [`Arc`]; all state is
/// per-engine, never process-global.
pub struct Agent {
    transport: Arc<dyn Transport>,
    identity: tokio::sync::RwLock<Arc<dyn Identity>>,
    root_key: Vec<u8>,
    clock: Arc<dyn Clock>,
    /// Estimated offset of the network clock relative to ours.
    drift_ns: AtomicI64,
    has_synced_time: AtomicBool,
    ingress_expiry_ms: u64,
    retry_times: u32,
    should_sync_time: bool,
    verify_query_signatures: bool,
    time_sync_samples: usize,
    max_time_skew_ms: u64,
    poll_strategy_factory: Arc<dyn PollStrategyFactory>,
    subnet_keys: RwLock<HashMap<Principal, Arc<SubnetKeys>>>,
    subnet_of_canister: RwLock<HashMap<Principal, Principal>>,
}

impl Agent {
    pub fn builder() -> AgentBuilder {
        AgentBuilder::new()
    }

    pub fn has_synced_time(&self) -> bool {
        self.has_synced_time.load(Ordering::SeqCst)
    }

    /// Swaps the signing identity. Waits for in-flight signs to finish so
    /// no request is signed half-old, half-new.
    pub async fn replace_identity(&self, identity: Arc<dyn Identity>) {
        *self.identity.write().await = identity;
    }

    fn drift_ms(&self) -> i64 {
        self.drift_ns.load(Ordering::SeqCst) / 1_000_000
    }

    fn corrected_now_ms(&self) -> u64 {
        self.clock.now_ms().saturating_add_signed(self.drift_ms())
    }

    fn ingress_expiry(&self, override_ms: Option<u64>) -> u64 {
        Expiry::from_delta(
            override_ms.unwrap_or(self.ingress_expiry_ms),
            self.drift_ms(),
            self.clock.now_ms(),
        )
        .as_nanos()
    }

    fn params_for(&self, expected: ExpectedAuthority, check_time: bool) -> CertificateParams<'_> {
        CertificateParams {
            root_key: &self.root_key,
            expected,
            now_ms: self.corrected_now_ms(),
            max_skew_ms: self.max_time_skew_ms,
            check_time,
        }
    }

    async fn sender(&self) -> Principal {
        self.identity.read().await.sender()
    }

    /// Computes the request id and signs the envelope. The identity read
    /// lock is held across the sign so `replace_identity` sequences after
    /// it.
    async fn signed_envelope(
        &self,
        content: &EnvelopeContent,
    ) -> Result<(RequestId, Vec<u8>), AgentError> {
        let request_id = content.to_request_id();
        let identity = self.identity.read().await;
        let signature = identity.sign(&request_id).await?;
        drop(identity);
        let envelope = Envelope {
            content,
            sender_pubkey: signature.public_key.map(ByteBuf::from),
            sender_sig: signature.signature.map(ByteBuf::from),
            sender_delegation: signature.delegations,
        };
        Ok((request_id, envelope.encode()?))
    }

    async fn ensure_time_synced(&self, canister_id: &Principal) -> Result<(), AgentError> {
        if self.should_sync_time && !self.has_synced_time() {
            self.sync_time_with_canister(canister_id).await?;
        }
        Ok(())
    }

    /// Submits an update call and drives it to a certified reply.
    pub async fn call(
        &self,
        canister_id: Principal,
        method_name: impl Into<String>,
        arg: Vec<u8>,
        options: CallOptions,
    ) -> Result<CallResult, AgentError> {
        let method_name = method_name.into();
        self.ensure_time_synced(&canister_id).await?;

        let mut attempts: u32 = 0;
        let mut synced_for_expiry = false;
        loop {
            check_cancel(options.cancel.as_ref())?;
            match self.call_attempt(canister_id, &method_name, &arg, &options).await {
                Err(AgentError::IngressExpiryInvalid(message)) if !synced_for_expiry => {
                    // The replica disagrees with our clock; sync once and
                    // rebuild with a fresh expiry.
                    warn!(%canister_id, %message, "ingress expiry rejected; synchronising time");
                    synced_for_expiry = true;
                    self.sync_time_with_canister(&canister_id).await?;
                }
                Err(err) if err.is_retryable() && attempts < self.retry_times => {
                    attempts += 1;
                    warn!(%canister_id, %err, attempt = attempts, "retrying call");
                    suspend_point(
                        options.cancel.as_ref(),
                        tokio::time::sleep(retry_pause(attempts)),
                    )
                    .await?;
                }
                other => return other,
            }
        }
    }

    async fn call_attempt(
        &self,
        canister_id: Principal,
        method_name: &str,
        arg: &[u8],
        options: &CallOptions,
    ) -> Result<CallResult, AgentError> {
        let content = EnvelopeContent::Call {
            arg: arg.to_vec(),
            canister_id,
            ingress_expiry: self.ingress_expiry(options.ingress_expiry_ms),
            method_name: method_name.to_string(),
            nonce: options.nonce.clone().map(ByteBuf::from),
            sender: self.sender().await,
        };
        let (request_id, envelope) = self.signed_envelope(&content).await?;
        debug!(%request_id, %canister_id, method = method_name, "submitting call");

        let cancel = options.cancel.as_ref();
        let response = suspend(cancel, self.transport.call(&canister_id, envelope))
            .await
            .map_err(classify_submit_error)?;

        match response {
            TransportCallResponse::Accepted => self.wait(request_id, canister_id, cancel).await,
            TransportCallResponse::Body(body) => {
                let body: CallResponseBody = cbor::from_self_describing_slice(&body)?;
                match body {
                    CallResponseBody::Replied { certificate } => {
                        let certificate = verify_certificate(
                            &certificate,
                            &self.params_for(ExpectedAuthority::Canister(canister_id), true),
                        )?;
                        match self.request_status(&certificate, &request_id)? {
                            RequestStatus::Replied(reply) => {
                                Ok(CallResult { reply, request_id, certificate })
                            }
                            RequestStatus::Rejected(reject) => {
                                Err(AgentError::CertifiedReject(reject))
                            }
                            RequestStatus::Done => Err(AgentError::RequestStatusDoneNoReply {
                                request_id: request_id.to_string(),
                            }),
                            // The certificate does not cover the status
                            // yet; fall back to polling.
                            RequestStatus::Pending => {
                                self.wait(request_id, canister_id, cancel).await
                            }
                        }
                    }
                    CallResponseBody::NonReplicatedRejection {
                        reject_code,
                        reject_message,
                        error_code,
                    } => Err(AgentError::UncertifiedReject(RejectResponse {
                        reject_code: RejectCode::try_from(reject_code)?,
                        reject_message,
                        error_code,
                    })),
                }
            }
        }
    }

    /// Polls `request_status` until the request settles. One fresh poll
    /// strategy instance per call; a Trust failure terminates immediately.
    async fn wait(
        &self,
        request_id: RequestId,
        canister_id: Principal,
        cancel: Option<&CancelToken>,
    ) -> Result<CallResult, AgentError> {
        let mut strategy = self.poll_strategy_factory.create();
        debug!(%request_id, "polling request status");
        loop {
            check_cancel(cancel)?;
            let Some(delay) = strategy.next_poll_delay() else {
                return Err(AgentError::TimeoutWaitingForResponse {
                    request_id: request_id.to_string(),
                });
            };
            suspend_point(cancel, tokio::time::sleep(delay)).await?;

            let certificate = self
                .read_state_impl(
                    canister_id,
                    vec![vec![b"request_status".to_vec(), request_id.to_vec()]],
                    true,
                    cancel,
                )
                .await?;
            match self.request_status(&certificate, &request_id)? {
                RequestStatus::Replied(reply) => {
                    return Ok(CallResult { reply, request_id, certificate })
                }
                RequestStatus::Rejected(reject) => return Err(AgentError::CertifiedReject(reject)),
                RequestStatus::Done => {
                    return Err(AgentError::RequestStatusDoneNoReply {
                        request_id: request_id.to_string(),
                    })
                }
                RequestStatus::Pending => continue,
            }
        }
    }

    fn request_status(
        &self,
        certificate: &Certificate,
        request_id: &RequestId,
    ) -> Result<RequestStatus, AgentError> {
        let status_path =
            [b"request_status".as_slice(), request_id.as_slice(), b"status".as_slice()];
        let status = match certificate.tree.lookup_path(&status_path) {
            LookupResult::Found(status) => status,
            // Not yet known to this replica, or pruned out of the
            // certificate: keep polling.
            LookupResult::Absent | LookupResult::Unknown => return Ok(RequestStatus::Pending),
            LookupResult::Error => {
                return Err(AgentError::LookupPathError {
                    path: format!("/request_status/{request_id}/status"),
                })
            }
        };
        match status {
            b"replied" => {
                let reply = certificate.lookup_value(&[
                    b"request_status".as_slice(),
                    request_id.as_slice(),
                    b"reply".as_slice(),
                ])?;
                Ok(RequestStatus::Replied(reply.to_vec()))
            }
            b"rejected" => Ok(RequestStatus::Rejected(
                self.read_reject_response(certificate, request_id)?,
            )),
            b"done" => Ok(RequestStatus::Done),
            b"processing" | b"received" => Ok(RequestStatus::Pending),
            other => Err(AgentError::MalformedResponse(format!(
                "unexpected request status {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }

    fn read_reject_response(
        &self,
        certificate: &Certificate,
        request_id: &RequestId,
    ) -> Result<RejectResponse, AgentError> {
        let reject_code = crate::leb128::decode(certificate.lookup_value(&[
            b"request_status".as_slice(),
            request_id.as_slice(),
            b"reject_code".as_slice(),
        ])?)?;
        let reject_message = String::from_utf8(
            certificate
                .lookup_value(&[
                    b"request_status".as_slice(),
                    request_id.as_slice(),
                    b"reject_message".as_slice(),
                ])?
                .to_vec(),
        )
        .map_err(|_| {
            AgentError::MalformedResponse("reject message is not valid UTF-8".to_string())
        })?;
        let error_code = match certificate.tree.lookup_path(&[
            b"request_status".as_slice(),
            request_id.as_slice(),
            b"error_code".as_slice(),
        ]) {
            LookupResult::Found(code) => Some(String::from_utf8_lossy(code).into_owned()),
            _ => None,
        };
        Ok(RejectResponse {
            reject_code: RejectCode::try_from(reject_code)?,
            reject_message,
            error_code,
        })
    }

    /// Submits a query and (by default) verifies the node signatures on
    /// the reply.
    pub async fn query(
        &self,
        canister_id: Principal,
        method_name: impl Into<String>,
        arg: Vec<u8>,
        options: QueryOptions,
    ) -> Result<QueryResult, AgentError> {
        let method_name = method_name.into();
        self.ensure_time_synced(&canister_id).await?;

        let mut attempts: u32 = 0;
        let mut synced_for_expiry = false;
        loop {
            check_cancel(options.cancel.as_ref())?;
            match self.query_attempt(canister_id, &method_name, &arg, &options).await {
                Err(AgentError::IngressExpiryInvalid(message)) if !synced_for_expiry => {
                    warn!(%canister_id, %message, "ingress expiry rejected; synchronising time");
                    synced_for_expiry = true;
                    self.sync_time_with_canister(&canister_id).await?;
                }
                Err(err) if err.is_retryable() && attempts < self.retry_times => {
                    attempts += 1;
                    warn!(%canister_id, %err, attempt = attempts, "retrying query");
                    suspend_point(
                        options.cancel.as_ref(),
                        tokio::time::sleep(retry_pause(attempts)),
                    )
                    .await?;
                }
                other => return other,
            }
        }
    }

    async fn query_attempt(
        &self,
        canister_id: Principal,
        method_name: &str,
        arg: &[u8],
        options: &QueryOptions,
    ) -> Result<QueryResult, AgentError> {
        let content = EnvelopeContent::Query {
            arg: arg.to_vec(),
            canister_id,
            ingress_expiry: self.ingress_expiry(options.ingress_expiry_ms),
            method_name: method_name.to_string(),
            nonce: None,
            sender: self.sender().await,
        };
        let (request_id, envelope) = self.signed_envelope(&content).await?;
        debug!(%request_id, %canister_id, method = method_name, "submitting query");

        let cancel = options.cancel.as_ref();
        let body = suspend(cancel, self.transport.query(&canister_id, envelope))
            .await
            .map_err(classify_submit_error)?;
        let response: QueryResponse = cbor::from_self_describing_slice(&body)?;

        if options.verify_signatures && self.verify_query_signatures {
            // Freshness first: a skewed clock must fail before any key
            // fetch round-trip.
            query::check_signature_freshness(
                &response,
                self.corrected_now_ms(),
                self.max_time_skew_ms,
            )?;
            let subnet = self.subnet_keys_for_canister(canister_id, cancel).await?;
            query::verify_query_signatures(&response, &request_id, &subnet)?;
        }

        match response {
            QueryResponse::Replied { reply, .. } => {
                Ok(QueryResult { reply: reply.arg, request_id })
            }
            QueryResponse::Rejected { reject_code, reject_message, error_code, .. } => {
                Err(AgentError::UncertifiedReject(RejectResponse {
                    reject_code: RejectCode::try_from(reject_code)?,
                    reject_message,
                    error_code,
                }))
            }
        }
    }

    /// Reads canister paths and returns the verified certificate.
    pub async fn read_state(
        &self,
        canister_id: Principal,
        paths: Vec<Vec<Vec<u8>>>,
    ) -> Result<Certificate, AgentError> {
        self.read_state_impl(canister_id, paths, true, None).await
    }

    async fn read_state_impl(
        &self,
        canister_id: Principal,
        paths: Vec<Vec<Vec<u8>>>,
        check_time: bool,
        cancel: Option<&CancelToken>,
    ) -> Result<Certificate, AgentError> {
        let content = EnvelopeContent::ReadState {
            ingress_expiry: self.ingress_expiry(None),
            paths: encode_paths(paths),
            sender: self.sender().await,
        };
        let (_, envelope) = self.signed_envelope(&content).await?;
        let body = suspend(cancel, self.transport.read_state(&canister_id, envelope))
            .await
            .map_err(classify_submit_error)?;
        let response: ReadStateResponse = cbor::from_self_describing_slice(&body)?;
        verify_certificate(
            &response.certificate,
            &self.params_for(ExpectedAuthority::Canister(canister_id), check_time),
        )
    }

    /// Reads subnet paths and returns the verified certificate.
    pub async fn read_subnet_state(
        &self,
        subnet_id: Principal,
        paths: Vec<Vec<Vec<u8>>>,
    ) -> Result<Certificate, AgentError> {
        self.read_subnet_state_impl(subnet_id, paths, true).await
    }

    async fn read_subnet_state_impl(
        &self,
        subnet_id: Principal,
        paths: Vec<Vec<Vec<u8>>>,
        check_time: bool,
    ) -> Result<Certificate, AgentError> {
        let content = EnvelopeContent::ReadState {
            ingress_expiry: self.ingress_expiry(None),
            paths: encode_paths(paths),
            sender: self.sender().await,
        };
        let (_, envelope) = self.signed_envelope(&content).await?;
        let body = self
            .transport
            .read_subnet_state(&subnet_id, envelope)
            .await
            .map_err(classify_submit_error)?;
        let response: ReadStateResponse = cbor::from_self_describing_slice(&body)?;
        verify_certificate(
            &response.certificate,
            &self.params_for(ExpectedAuthority::Subnet(subnet_id), check_time),
        )
    }

    /// Reads a `/canister/<cid>/…` path, e.g. `module_hash` or
    /// `metadata/candid:service`.
    pub async fn read_state_canister_info(
        &self,
        canister_id: Principal,
        path: &str,
    ) -> Result<Vec<u8>, AgentError> {
        let mut segments = vec![b"canister".to_vec(), canister_id.as_slice().to_vec()];
        segments.extend(path.split('/').map(|s| s.as_bytes().to_vec()));
        let certificate = self.read_state(canister_id, vec![segments.clone()]).await?;
        certificate.lookup_value(&segments).map(<[u8]>::to_vec)
    }

    /// Resolves the subnet a canister lives on, cached per engine.
    pub async fn get_subnet_id_from_canister(
        &self,
        canister_id: Principal,
    ) -> Result<Principal, AgentError> {
        if let Some(subnet_id) = self.subnet_of_canister.read().unwrap().get(&canister_id) {
            return Ok(*subnet_id);
        }
        let certificate = self
            .read_state_impl(canister_id, vec![vec![b"time".to_vec()]], true, None)
            .await?;
        let subnet_id = self.subnet_id_of_certificate(&certificate)?;
        self.subnet_of_canister.write().unwrap().insert(canister_id, subnet_id);
        Ok(subnet_id)
    }

    fn subnet_id_of_certificate(&self, certificate: &Certificate) -> Result<Principal, AgentError> {
        match &certificate.delegation {
            Some(delegation) => Principal::try_from_slice(&delegation.subnet_id)
                .map_err(|e| AgentError::MalformedResponse(format!("invalid subnet id: {e}"))),
            None => certificate::root_subnet_id(&self.root_key),
        }
    }

    /// Fetches and caches the node-key map of the subnet owning
    /// `canister_id`. Enforces range containment: a certificate that does
    /// not authorise the canister is rejected.
    pub async fn fetch_subnet_keys(
        &self,
        canister_id: Principal,
    ) -> Result<Arc<SubnetKeys>, AgentError> {
        self.fetch_subnet_keys_impl(canister_id, None).await
    }

    async fn fetch_subnet_keys_impl(
        &self,
        canister_id: Principal,
        cancel: Option<&CancelToken>,
    ) -> Result<Arc<SubnetKeys>, AgentError> {
        let certificate = self
            .read_state_impl(canister_id, vec![vec![b"subnet".to_vec()]], true, cancel)
            .await?;
        let subnet_id = self.subnet_id_of_certificate(&certificate)?;
        // With a delegation, the node records are certified in the
        // delegation's tree; without one the outer tree carries them.
        let node_keys = match &certificate.delegation {
            Some(delegation) => {
                let inner = Certificate::from_cbor(&delegation.certificate)?;
                extract_node_keys(&inner.tree, &subnet_id)?
            }
            None => extract_node_keys(&certificate.tree, &subnet_id)?,
        };
        let subnet = Arc::new(SubnetKeys { subnet_id, node_keys });
        debug!(%subnet_id, nodes = subnet.node_keys.len(), "cached subnet node keys");
        self.subnet_of_canister.write().unwrap().insert(canister_id, subnet_id);
        self.subnet_keys.write().unwrap().insert(subnet_id, subnet.clone());
        Ok(subnet)
    }

    async fn subnet_keys_for_canister(
        &self,
        canister_id: Principal,
        cancel: Option<&CancelToken>,
    ) -> Result<Arc<SubnetKeys>, AgentError> {
        let cached_subnet = self.subnet_of_canister.read().unwrap().get(&canister_id).copied();
        if let Some(subnet_id) = cached_subnet {
            if let Some(subnet) = self.subnet_keys.read().unwrap().get(&subnet_id) {
                return Ok(subnet.clone());
            }
        }
        self.fetch_subnet_keys_impl(canister_id, cancel).await
    }

    /// Synchronises the drift estimate against a well-known canister.
    pub async fn sync_time(&self) -> Result<(), AgentError> {
        let canister_id = Principal::from_text(DEFAULT_TIME_SYNC_CANISTER)
            .map_err(|e| AgentError::InvalidArgument(format!("bad time sync canister: {e}")))?;
        self.sync_time_with_canister(&canister_id).await
    }

    /// Synchronises the drift estimate by reading `/time` from the given
    /// canister's subnet. Takes the median of several samples so a single
    /// lagging replica cannot skew the estimate.
    pub async fn sync_time_with_canister(
        &self,
        canister_id: &Principal,
    ) -> Result<(), AgentError> {
        let mut samples_ms = Vec::with_capacity(self.time_sync_samples);
        for _ in 0..self.time_sync_samples {
            let certificate = self
                .read_state_impl(*canister_id, vec![vec![b"time".to_vec()]], false, None)
                .await?;
            samples_ms.push(certificate::lookup_time(&certificate)? / 1_000_000);
        }
        self.apply_time_samples(samples_ms)
    }

    /// Like [`Agent::sync_time_with_canister`] but against an explicit
    /// subnet.
    pub async fn sync_time_with_subnet(&self, subnet_id: &Principal) -> Result<(), AgentError> {
        let mut samples_ms = Vec::with_capacity(self.time_sync_samples);
        for _ in 0..self.time_sync_samples {
            let certificate = self
                .read_subnet_state_impl(*subnet_id, vec![vec![b"time".to_vec()]], false)
                .await?;
            samples_ms.push(certificate::lookup_time(&certificate)? / 1_000_000);
        }
        self.apply_time_samples(samples_ms)
    }

    fn apply_time_samples(&self, mut samples_ms: Vec<u64>) -> Result<(), AgentError> {
        if samples_ms.is_empty() {
            return Err(AgentError::InvalidArgument(
                "time sync needs at least one sample".to_string(),
            ));
        }
        samples_ms.sort_unstable();
        let median_ms = samples_ms[samples_ms.len() / 2];
        let now_ms = self.clock.now_ms();
        let drift_ms = median_ms as i64 - now_ms as i64;
        self.drift_ns.store(drift_ms.saturating_mul(1_000_000), Ordering::SeqCst);
        self.has_synced_time.store(true, Ordering::SeqCst);
        debug!(drift_ms, "updated drift estimate");
        Ok(())
    }
}

fn retry_pause(attempt: u32) -> Duration {
    Duration::from_millis(500 * u64::from(attempt))
}

fn encode_paths(paths: Vec<Vec<Vec<u8>>>) -> Vec<Vec<ByteBuf>> {
    paths
        .into_iter()
        .map(|path| path.into_iter().map(ByteBuf::from).collect())
        .collect()
}

/// Recognises the replica's expiry-range diagnostic on a 400 so the
/// engine can trigger a time sync instead of surfacing the raw error.
fn classify_submit_error(err: AgentError) -> AgentError {
    match err {
        AgentError::HttpError { status: 400, message }
            if message.contains("ingress_expiry") =>
        {
            AgentError::IngressExpiryInvalid(message)
        }
        other => other,
    }
}

fn extract_node_keys(
    tree: &HashTree,
    subnet_id: &Principal,
) -> Result<BTreeMap<Principal, Vec<u8>>, AgentError> {
    let nodes = match tree.lookup_subtree(&[
        b"subnet".as_slice(),
        subnet_id.as_slice(),
        b"node".as_slice(),
    ]) {
        SubtreeLookupResult::Found(subtree) => subtree,
        other => {
            return Err(AgentError::MalformedResponse(format!(
                "subnet {subnet_id} advertises no node keys ({other:?})"
            )))
        }
    };
    let mut node_keys = BTreeMap::new();
    for child in nodes.flatten_forks() {
        if let HashTree::Labeled(node_id, node_tree) = child {
            let node_id = Principal::try_from_slice(node_id)
                .map_err(|e| AgentError::MalformedResponse(format!("invalid node id: {e}")))?;
            let der = lookup_value_in(node_tree, &[b"public_key".as_slice()])?;
            node_keys.insert(node_id, der.to_vec());
        }
    }
    if node_keys.is_empty() {
        return Err(AgentError::MalformedResponse(format!(
            "subnet {subnet_id} advertises no node keys"
        )));
    }
    Ok(node_keys)
}
