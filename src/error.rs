//! Error taxonomy for the agent and the certificate verifier.
//!
//! Variants carry enough context to be actionable; [`AgentError::kind`]
//! collapses them into the coarse classes the request engine's retry
//! policy operates on.

use candid::Principal;
use thiserror::Error;

/// Coarse classification of an [`AgentError`], used by the retry policy.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed caller-supplied value. Never retried.
    Input,
    /// The replica response violates the wire contract. Not retried.
    Protocol,
    /// A certificate or query signature failed verification. Surfaced to
    /// the caller; only certificate-time mismatches consume retries.
    Trust,
    /// Transport failure or server-side 5xx. Retried with backoff.
    Transient,
    /// Replica-side clock disagreement on `ingress_expiry`. Triggers at
    /// most one time sync and one rebuild, then surfaces.
    IngressExpiryInvalid,
    /// The canister or replica rejected the request. Terminal.
    Reject,
    /// The caller requested an abort.
    Cancelled,
    /// Catch-all, always surfaced with context.
    Unknown,
}

/// Reject code returned by the replica, cf.
/// https://internetcomputer.org/docs/current/references/ic-interface-spec#reject-codes
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RejectCode {
    SysFatal = 1,
    SysTransient = 2,
    DestinationInvalid = 3,
    CanisterReject = 4,
    CanisterError = 5,
}

impl TryFrom<u64> for RejectCode {
    type Error = AgentError;

    fn try_from(value: u64) -> Result<Self, AgentError> {
        match value {
            1 => Ok(RejectCode::SysFatal),
            2 => Ok(RejectCode::SysTransient),
            3 => Ok(RejectCode::DestinationInvalid),
            4 => Ok(RejectCode::CanisterReject),
            5 => Ok(RejectCode::CanisterError),
            other => Err(AgentError::MalformedResponse(format!(
                "unknown reject code {other}"
            ))),
        }
    }
}

/// A reject delivered by the replica, either certified (read from a
/// verified certificate) or uncertified (from a call/query response body).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RejectResponse {
    pub reject_code: RejectCode,
    pub reject_message: String,
    pub error_code: Option<String>,
}

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid CBOR data: {0}")]
    InvalidCborData(#[from] serde_cbor::Error),

    #[error("The replica returned a malformed response: {0}")]
    MalformedResponse(String),

    #[error("The request failed in transport: {0}")]
    TransportError(#[from] reqwest::Error),

    #[error("The replica returned HTTP {status}: {message}")]
    HttpError { status: u16, message: String },

    #[error("Certificate verification failed.")]
    CertificateVerificationFailed,

    #[error(
        "Certificate is stale: certificate time {certificate_time_ms} ms is more than \
         {max_skew_ms} ms behind local time {now_ms} ms"
    )]
    CertificateOutdated {
        certificate_time_ms: u64,
        now_ms: u64,
        max_skew_ms: u64,
    },

    #[error(
        "Certificate is from the future: certificate time {certificate_time_ms} ms is more than \
         {max_skew_ms} ms ahead of local time {now_ms} ms"
    )]
    CertificateFromFuture {
        certificate_time_ms: u64,
        now_ms: u64,
        max_skew_ms: u64,
    },

    #[error("Canister {canister} is not within any canister range of subnet {subnet}")]
    CertificateNotAuthorized {
        canister: Principal,
        subnet: Principal,
    },

    #[error("Certificate is not authoritative for the expected subnet (got {subnet})")]
    WrongRootDelegation { subnet: Principal },

    #[error("A delegation certificate must not itself contain a delegation.")]
    CertificateHasTooManyDelegations,

    #[error("Query response is not trusted: {0}")]
    QueryNotTrusted(String),

    #[error("The path {path} is absent from the certificate.")]
    LookupPathAbsent { path: String },

    #[error("The path {path} is unknown in the certificate (pruned away).")]
    LookupPathUnknown { path: String },

    #[error("The path {path} hit a malformed part of the certificate tree.")]
    LookupPathError { path: String },

    #[error("DER key length mismatch: expected {expected} bytes, got {actual}")]
    DerKeyLengthMismatch { expected: usize, actual: usize },

    #[error("DER key does not carry the expected OID prefix.")]
    DerPrefixMismatch,

    #[error("The replica rejected the ingress expiry: {0}")]
    IngressExpiryInvalid(String),

    #[error(
        "The replica rejected the call (certified): {} (code {:?})",
        .0.reject_message, .0.reject_code
    )]
    CertifiedReject(RejectResponse),

    #[error(
        "The replica rejected the call: {} (code {:?})",
        .0.reject_message, .0.reject_code
    )]
    UncertifiedReject(RejectResponse),

    #[error("Request {request_id} timed out while waiting for a response.")]
    TimeoutWaitingForResponse { request_id: String },

    #[error("Request {request_id} reached status 'done'; the reply was pruned.")]
    RequestStatusDoneNoReply { request_id: String },

    #[error("The operation was cancelled by the caller.")]
    Cancelled,
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        use AgentError::*;
        match self {
            InvalidArgument(_) => ErrorKind::Input,
            InvalidCborData(_) | MalformedResponse(_) | LookupPathAbsent { .. }
            | LookupPathUnknown { .. } | LookupPathError { .. } | DerKeyLengthMismatch { .. }
            | DerPrefixMismatch => ErrorKind::Protocol,
            CertificateVerificationFailed
            | CertificateOutdated { .. }
            | CertificateFromFuture { .. }
            | CertificateNotAuthorized { .. }
            | WrongRootDelegation { .. }
            | CertificateHasTooManyDelegations
            | QueryNotTrusted(_) => ErrorKind::Trust,
            TransportError(_) | TimeoutWaitingForResponse { .. } => ErrorKind::Transient,
            HttpError { status, .. } if *status >= 500 => ErrorKind::Transient,
            HttpError { .. } => ErrorKind::Protocol,
            IngressExpiryInvalid(_) => ErrorKind::IngressExpiryInvalid,
            CertifiedReject(_) | UncertifiedReject(_) => ErrorKind::Reject,
            Cancelled => ErrorKind::Cancelled,
            RequestStatusDoneNoReply { .. } => ErrorKind::Unknown,
        }
    }

    /// Whether the submit loop may re-issue the request for this error.
    ///
    /// Certificate-time mismatches are retryable on purpose: each retry
    /// rebuilds the request and recomputes the expiry against the current
    /// clock (and drift estimate), which is the only way the outcome can
    /// change.
    pub(crate) fn is_retryable(&self) -> bool {
        matches!(
            self,
            AgentError::TransportError(_)
                | AgentError::HttpError { status: 500..=599, .. }
                | AgentError::CertificateOutdated { .. }
                | AgentError::CertificateFromFuture { .. }
        )
    }
}
