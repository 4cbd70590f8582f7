//! HTTP transport to a replica or boundary node.
//!
//! The [`Transport`] trait is the engine's only network seam; tests swap
//! in a scripted implementation, production uses [`ReqwestTransport`].

use crate::error::AgentError;
use async_trait::async_trait;
use candid::Principal;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, StatusCode, Url};

const CBOR_CONTENT_TYPE: &str = "application/cbor";

/// Outcome of submitting a call envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCallResponse {
    /// HTTP 202: accepted for asynchronous execution; poll request status.
    Accepted,
    /// HTTP 200: a CBOR body carrying a certificate or a rejection.
    Body(Vec<u8>),
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// `POST /api/v4/canister/<id>/call`
    async fn call(
        &self,
        canister_id: &Principal,
        envelope: Vec<u8>,
    ) -> Result<TransportCallResponse, AgentError>;

    /// `POST /api/v3/canister/<id>/query`
    async fn query(&self, canister_id: &Principal, envelope: Vec<u8>)
        -> Result<Vec<u8>, AgentError>;

    /// `POST /api/v3/canister/<id>/read_state`
    async fn read_state(
        &self,
        canister_id: &Principal,
        envelope: Vec<u8>,
    ) -> Result<Vec<u8>, AgentError>;

    /// `POST /api/v3/subnet/<id>/read_state`
    async fn read_subnet_state(
        &self,
        subnet_id: &Principal,
        envelope: Vec<u8>,
    ) -> Result<Vec<u8>, AgentError>;
}

fn call_endpoint(canister_id: &Principal) -> String {
    format!("api/v4/canister/{}/call", canister_id.to_text())
}

fn query_endpoint(canister_id: &Principal) -> String {
    format!("api/v3/canister/{}/query", canister_id.to_text())
}

fn read_state_endpoint(canister_id: &Principal) -> String {
    format!("api/v3/canister/{}/read_state", canister_id.to_text())
}

fn read_subnet_state_endpoint(subnet_id: &Principal) -> String {
    format!("api/v3/subnet/{}/read_state", subnet_id.to_text())
}

/// Production transport over [`reqwest`] with rustls.
#[derive(Debug)]
pub struct ReqwestTransport {
    client: Client,
    base_url: Url,
}

impl ReqwestTransport {
    /// Creates a transport for the given base URL (e.g.
    /// `https://icp-api.io`).
    pub fn create(url: impl AsRef<str>) -> Result<Self, AgentError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(CBOR_CONTENT_TYPE));
        let client = Client::builder()
            .default_headers(headers)
            .build()
            .map_err(AgentError::TransportError)?;
        Self::create_with_client(url, client)
    }

    /// Creates a transport reusing a caller-configured [`Client`].
    pub fn create_with_client(url: impl AsRef<str>, client: Client) -> Result<Self, AgentError> {
        let mut url = url.as_ref().to_string();
        // A trailing slash keeps Url::join from eating the last segment.
        if !url.ends_with('/') {
            url.push('/');
        }
        let base_url = Url::parse(&url)
            .map_err(|e| AgentError::InvalidArgument(format!("invalid replica url: {e}")))?;
        Ok(ReqwestTransport { client, base_url })
    }

    async fn execute(
        &self,
        endpoint: &str,
        envelope: Vec<u8>,
    ) -> Result<(StatusCode, Vec<u8>), AgentError> {
        let url = self
            .base_url
            .join(endpoint)
            .map_err(|e| AgentError::InvalidArgument(format!("invalid endpoint: {e}")))?;
        tracing::trace!(%url, body_len = envelope.len(), "posting envelope");
        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, CBOR_CONTENT_TYPE)
            .body(envelope)
            .send()
            .await?;
        let status = response.status();
        let body = response.bytes().await?.to_vec();
        Ok((status, body))
    }

    fn expect_success(status: StatusCode, body: Vec<u8>) -> Result<Vec<u8>, AgentError> {
        if status.is_success() {
            Ok(body)
        } else {
            Err(AgentError::HttpError {
                status: status.as_u16(),
                message: String::from_utf8_lossy(&body).into_owned(),
            })
        }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn call(
        &self,
        canister_id: &Principal,
        envelope: Vec<u8>,
    ) -> Result<TransportCallResponse, AgentError> {
        let (status, body) = self.execute(&call_endpoint(canister_id), envelope).await?;
        if status == StatusCode::ACCEPTED {
            return Ok(TransportCallResponse::Accepted);
        }
        Self::expect_success(status, body).map(TransportCallResponse::Body)
    }

    async fn query(
        &self,
        canister_id: &Principal,
        envelope: Vec<u8>,
    ) -> Result<Vec<u8>, AgentError> {
        let (status, body) = self.execute(&query_endpoint(canister_id), envelope).await?;
        Self::expect_success(status, body)
    }

    async fn read_state(
        &self,
        canister_id: &Principal,
        envelope: Vec<u8>,
    ) -> Result<Vec<u8>, AgentError> {
        let (status, body) = self
            .execute(&read_state_endpoint(canister_id), envelope)
            .await?;
        Self::expect_success(status, body)
    }

    async fn read_subnet_state(
        &self,
        subnet_id: &Principal,
        envelope: Vec<u8>,
    ) -> Result<Vec<u8>, AgentError> {
        let (status, body) = self
            .execute(&read_subnet_state_endpoint(subnet_id), envelope)
            .await?;
        Self::expect_success(status, body)
    }
}
